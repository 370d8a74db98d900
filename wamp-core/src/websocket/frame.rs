use bytes::{
    BufMut,
    BytesMut,
};
use thiserror::Error;

use crate::websocket::mask::XorMasker;

/// Frame opcodes defined by RFC 6455.
pub mod opcode {
    pub const CONTINUATION: u8 = 0;
    pub const TEXT: u8 = 1;
    pub const BINARY: u8 = 2;
    pub const CLOSE: u8 = 8;
    pub const PING: u8 = 9;
    pub const PONG: u8 = 10;
}

/// The RSV bits used to mark a compressed message.
pub const RSV_COMPRESSED: u8 = 4;

/// The largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Error for a frame header that is not encoded according to the protocol.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("invalid data frame length (not using minimal length encoding)")]
    NonMinimalLength,
    #[error("invalid data frame length (>2^63)")]
    LengthTooLarge,
}

/// The fields in the first two octets of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStart {
    pub fin: bool,
    pub rsv: u8,
    pub opcode: u8,
    pub masked: bool,
    pub length_field: u8,
}

impl FrameStart {
    pub fn parse(b0: u8, b1: u8) -> Self {
        Self {
            fin: b0 & 0x80 != 0,
            rsv: (b0 & 0x70) >> 4,
            opcode: b0 & 0x0f,
            masked: b1 & 0x80 != 0,
            length_field: b1 & 0x7f,
        }
    }

    pub fn is_control(&self) -> bool {
        self.opcode > 7
    }

    /// The total length of the frame header, including extended length and mask.
    pub fn header_len(&self) -> usize {
        let mask_len = if self.masked { 4 } else { 0 };
        match self.length_field {
            0..=125 => 2 + mask_len,
            126 => 4 + mask_len,
            _ => 10 + mask_len,
        }
    }
}

/// A fully decoded frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub opcode: u8,
    pub fin: bool,
    pub rsv: u8,
    pub length: u64,
    pub mask: Option<[u8; 4]>,
}

impl FrameHeader {
    pub fn is_control(&self) -> bool {
        self.opcode > 7
    }

    /// Decodes a complete header.
    ///
    /// Returns `Ok(None)` if the buffer does not contain the whole header yet.
    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>, FrameError> {
        match Self::decode_lenient(buf) {
            None => Ok(None),
            Some((_, _, Some(err))) => Err(err),
            Some((header, header_len, None)) => Ok(Some((header, header_len))),
        }
    }

    /// Decodes a complete header, reporting an invalid length encoding alongside the header
    /// instead of failing.
    ///
    /// A receiver that does not drop the connection on a protocol violation must still be able to
    /// skip over the offending frame.
    pub fn decode_lenient(buf: &[u8]) -> Option<(Self, usize, Option<FrameError>)> {
        if buf.len() < 2 {
            return None;
        }
        let start = FrameStart::parse(buf[0], buf[1]);
        if buf.len() < start.header_len() {
            return None;
        }

        let mut error = None;
        let mut i = 2;
        let length = match start.length_field {
            126 => {
                let length = u16::from_be_bytes([buf[2], buf[3]]) as u64;
                if length < 126 {
                    error = Some(FrameError::NonMinimalLength);
                }
                i += 2;
                length
            }
            127 => {
                let mut octets = [0u8; 8];
                octets.copy_from_slice(&buf[2..10]);
                let length = u64::from_be_bytes(octets);
                if length > 0x7fff_ffff_ffff_ffff {
                    error = Some(FrameError::LengthTooLarge);
                } else if length < 65536 {
                    error = Some(FrameError::NonMinimalLength);
                }
                i += 8;
                length
            }
            length => length as u64,
        };

        let mask = if start.masked {
            let mask = [buf[i], buf[i + 1], buf[i + 2], buf[i + 3]];
            i += 4;
            Some(mask)
        } else {
            None
        };

        Some((
            Self {
                opcode: start.opcode,
                fin: start.fin,
                rsv: start.rsv,
                length,
                mask,
            },
            i,
            error,
        ))
    }

    /// Encodes the header, using the minimal length encoding.
    pub fn encode(&self, buf: &mut BytesMut) {
        let b0 = ((self.fin as u8) << 7) | ((self.rsv % 8) << 4) | (self.opcode & 0x0f);
        buf.put_u8(b0);
        let mask_bit = if self.mask.is_some() { 0x80 } else { 0x00 };
        if self.length <= 125 {
            buf.put_u8(mask_bit | self.length as u8);
        } else if self.length <= 0xffff {
            buf.put_u8(mask_bit | 126);
            buf.put_u16(self.length as u16);
        } else {
            buf.put_u8(mask_bit | 127);
            buf.put_u64(self.length);
        }
        if let Some(mask) = self.mask {
            buf.put_slice(&mask);
        }
    }
}

/// Encodes a complete frame.
///
/// If a mask is given, the payload is masked unless `apply_mask` is false, which only makes sense
/// for testing peers.
pub fn encode_frame(
    opcode: u8,
    payload: &[u8],
    fin: bool,
    rsv: u8,
    mask: Option<[u8; 4]>,
    apply_mask: bool,
) -> BytesMut {
    let header = FrameHeader {
        opcode,
        fin,
        rsv,
        length: payload.len() as u64,
        mask,
    };
    let mut buf = BytesMut::with_capacity(14 + payload.len());
    header.encode(&mut buf);
    let start = buf.len();
    buf.put_slice(payload);
    if let Some(mask) = mask {
        if apply_mask && !payload.is_empty() {
            XorMasker::new(mask, payload.len() as u64).process(&mut buf[start..]);
        }
    }
    buf
}

#[cfg(test)]
mod frame_test {
    use crate::websocket::{
        frame::{
            FrameError,
            FrameHeader,
            FrameStart,
            encode_frame,
            opcode,
        },
        mask::XorMasker,
    };

    #[test]
    fn encodes_masked_hello() {
        let frame = encode_frame(
            opcode::TEXT,
            b"Hello",
            true,
            0,
            Some([0x37, 0xfa, 0x21, 0x3d]),
            true,
        );
        pretty_assertions::assert_eq!(
            frame.to_vec(),
            vec![
                0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58
            ]
        );
    }

    #[test]
    fn decodes_masked_hello() {
        let bytes = [
            0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58,
        ];
        let (header, header_len) = FrameHeader::decode(&bytes).unwrap().unwrap();
        pretty_assertions::assert_eq!(
            header,
            FrameHeader {
                opcode: opcode::TEXT,
                fin: true,
                rsv: 0,
                length: 5,
                mask: Some([0x37, 0xfa, 0x21, 0x3d]),
            }
        );
        let mut payload = bytes[header_len..].to_vec();
        XorMasker::new(header.mask.unwrap(), header.length).process(&mut payload);
        pretty_assertions::assert_eq!(payload, b"Hello".to_vec());
    }

    #[test]
    fn uses_extended_lengths() {
        let frame = encode_frame(opcode::BINARY, &[0u8; 126], true, 0, None, true);
        pretty_assertions::assert_eq!(&frame[..4], &[0x82, 126, 0, 126]);
        let frame = encode_frame(opcode::BINARY, &vec![0u8; 65536], true, 0, None, true);
        pretty_assertions::assert_eq!(&frame[..10], &[0x82, 127, 0, 0, 0, 0, 0, 1, 0, 0]);
        let (header, header_len) = FrameHeader::decode(&frame).unwrap().unwrap();
        pretty_assertions::assert_eq!(header.length, 65536);
        pretty_assertions::assert_eq!(header_len, 10);
    }

    #[test]
    fn waits_for_complete_header() {
        assert_matches::assert_matches!(FrameHeader::decode(&[0x82]), Ok(None));
        assert_matches::assert_matches!(FrameHeader::decode(&[0x82, 126, 0]), Ok(None));
        assert_matches::assert_matches!(FrameHeader::decode(&[0x82, 0x85, 1, 2, 3]), Ok(None));
    }

    #[test]
    fn rejects_non_minimal_lengths() {
        assert_matches::assert_matches!(
            FrameHeader::decode(&[0x82, 126, 0, 125]),
            Err(FrameError::NonMinimalLength)
        );
        assert_matches::assert_matches!(
            FrameHeader::decode(&[0x82, 127, 0, 0, 0, 0, 0, 0, 0xff, 0xff]),
            Err(FrameError::NonMinimalLength)
        );
        assert_matches::assert_matches!(
            FrameHeader::decode(&[0x82, 127, 0x80, 0, 0, 0, 0, 0, 0, 0]),
            Err(FrameError::LengthTooLarge)
        );
    }

    #[test]
    fn round_trips_random_payloads_with_masks() {
        for (len, mask) in [
            (0usize, [1u8, 2, 3, 4]),
            (1, [0xff, 0, 0xff, 0]),
            (300, [9, 8, 7, 6]),
            (1 << 20, [0xaa, 0xbb, 0xcc, 0xdd]),
        ] {
            let payload = (0..len).map(|_| rand::random::<u8>()).collect::<Vec<_>>();
            let frame = encode_frame(opcode::BINARY, &payload, true, 0, Some(mask), true);
            let (header, header_len) = FrameHeader::decode(&frame).unwrap().unwrap();
            let mut decoded = frame[header_len..].to_vec();
            XorMasker::new(mask, header.length).process(&mut decoded);
            pretty_assertions::assert_eq!(decoded, payload);
        }
    }

    #[test]
    fn parses_frame_start() {
        let start = FrameStart::parse(0x09, 0xfe);
        assert!(!start.fin);
        assert!(start.is_control());
        assert!(start.masked);
        pretty_assertions::assert_eq!(start.length_field, 126);
        pretty_assertions::assert_eq!(start.header_len(), 8);
    }
}
