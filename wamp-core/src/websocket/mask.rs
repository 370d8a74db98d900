/// Payloads at least this long are masked a word at a time.
const SHIFTED_THRESHOLD: u64 = 128;

/// A stateful XOR masker for a single frame payload.
///
/// The payload may arrive in several chunks. The masker tracks how many octets it has consumed, so
/// each chunk continues the key cycle where the last one stopped.
#[derive(Debug, Clone)]
pub enum XorMasker {
    /// Masks octet by octet.
    Simple { mask: [u8; 4], ptr: usize },
    /// Masks four octets at a time after aligning to the key.
    Shifted { mask: [u8; 4], ptr: usize },
}

impl XorMasker {
    /// Creates a masker for a payload of the given length.
    pub fn new(mask: [u8; 4], length: u64) -> Self {
        if length < SHIFTED_THRESHOLD {
            Self::Simple { mask, ptr: 0 }
        } else {
            Self::Shifted { mask, ptr: 0 }
        }
    }

    /// The number of octets processed so far.
    pub fn pointer(&self) -> usize {
        match self {
            Self::Simple { ptr, .. } | Self::Shifted { ptr, .. } => *ptr,
        }
    }

    /// Starts the key cycle again.
    pub fn reset(&mut self) {
        match self {
            Self::Simple { ptr, .. } | Self::Shifted { ptr, .. } => *ptr = 0,
        }
    }

    /// Masks (or unmasks) the data in place.
    pub fn process(&mut self, data: &mut [u8]) {
        match self {
            Self::Simple { mask, ptr } => {
                for (i, byte) in data.iter_mut().enumerate() {
                    *byte ^= mask[(*ptr + i) & 3];
                }
                *ptr += data.len();
            }
            Self::Shifted { mask, ptr } => {
                let offset = *ptr & 3;
                let key = u32::from_ne_bytes([
                    mask[offset],
                    mask[(offset + 1) & 3],
                    mask[(offset + 2) & 3],
                    mask[(offset + 3) & 3],
                ]);
                let mut chunks = data.chunks_exact_mut(4);
                for chunk in &mut chunks {
                    let word = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) ^ key;
                    chunk.copy_from_slice(&word.to_ne_bytes());
                }
                for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
                    *byte ^= mask[(offset + i) & 3];
                }
                *ptr += data.len();
            }
        }
    }
}

#[cfg(test)]
mod mask_test {
    use crate::websocket::mask::XorMasker;

    fn reference(mask: [u8; 4], data: &[u8]) -> Vec<u8> {
        data.iter()
            .enumerate()
            .map(|(i, byte)| byte ^ mask[i % 4])
            .collect()
    }

    #[test]
    fn masks_hello() {
        let mut data = b"Hello".to_vec();
        let mut masker = XorMasker::new([0x37, 0xfa, 0x21, 0x3d], data.len() as u64);
        masker.process(&mut data);
        pretty_assertions::assert_eq!(data, vec![0x7f, 0x9f, 0x4d, 0x51, 0x58]);
        pretty_assertions::assert_eq!(masker.pointer(), 5);
    }

    #[test]
    fn shifted_masker_matches_reference_across_chunks() {
        let mask = [0xde, 0xad, 0xbe, 0xef];
        let data = (0..1000u32).map(|i| (i * 7) as u8).collect::<Vec<_>>();
        let expected = reference(mask, &data);

        let mut masker = XorMasker::new(mask, data.len() as u64);
        assert!(matches!(masker, XorMasker::Shifted { .. }));
        let mut masked = data.clone();
        let (a, rest) = masked.split_at_mut(3);
        let (b, c) = rest.split_at_mut(510);
        masker.process(a);
        masker.process(b);
        masker.process(c);
        pretty_assertions::assert_eq!(masked, expected);
        pretty_assertions::assert_eq!(masker.pointer(), 1000);
    }

    #[test]
    fn masking_twice_restores_payload() {
        let mask = [1, 2, 3, 4];
        let data = b"the quick brown fox".to_vec();
        let mut masked = data.clone();
        let mut masker = XorMasker::new(mask, data.len() as u64);
        masker.process(&mut masked);
        masker.reset();
        masker.process(&mut masked);
        pretty_assertions::assert_eq!(masked, data);
    }
}
