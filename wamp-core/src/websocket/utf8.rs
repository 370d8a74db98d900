/// The result of validating a chunk of octets with a [`Utf8Validator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Utf8Validation {
    /// Whether every octet seen so far is part of valid UTF-8.
    pub valid: bool,
    /// Whether the octets seen so far end on a code point boundary.
    pub ends_on_codepoint: bool,
    /// Index into the chunk where validation stopped.
    pub current_index: usize,
    /// Total number of octets validated across all chunks, up to the failure point.
    pub total_index: usize,
}

/// Incremental UTF-8 validator.
///
/// Octets may be fed in arbitrarily sized chunks. A code point split across chunks is valid
/// mid-stream, so the caller must check [`Utf8Validation::ends_on_codepoint`] when the stream ends.
/// Rejects overlong encodings, surrogates, and code points above U+10FFFF.
#[derive(Debug, Clone)]
pub struct Utf8Validator {
    needed: u8,
    lower: u8,
    upper: u8,
    codepoint: u32,
    rejected: bool,
    index: usize,
}

impl Default for Utf8Validator {
    fn default() -> Self {
        Self {
            needed: 0,
            lower: 0x80,
            upper: 0xbf,
            codepoint: 0,
            rejected: false,
            index: 0,
        }
    }
}

impl Utf8Validator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets the validator for a new stream.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// The partially decoded code point, if the last chunk ended inside one.
    pub fn codepoint_state(&self) -> u32 {
        self.codepoint
    }

    fn decode(&mut self, byte: u8) -> bool {
        if self.needed == 0 {
            match byte {
                0x00..=0x7f => {
                    self.codepoint = byte as u32;
                }
                0xc2..=0xdf => {
                    self.needed = 1;
                    self.codepoint = (byte & 0x1f) as u32;
                }
                0xe0..=0xef => {
                    match byte {
                        0xe0 => self.lower = 0xa0,
                        0xed => self.upper = 0x9f,
                        _ => (),
                    }
                    self.needed = 2;
                    self.codepoint = (byte & 0x0f) as u32;
                }
                0xf0..=0xf4 => {
                    match byte {
                        0xf0 => self.lower = 0x90,
                        0xf4 => self.upper = 0x8f,
                        _ => (),
                    }
                    self.needed = 3;
                    self.codepoint = (byte & 0x07) as u32;
                }
                _ => return false,
            }
            return true;
        }

        if byte < self.lower || byte > self.upper {
            return false;
        }
        self.lower = 0x80;
        self.upper = 0xbf;
        self.codepoint = (self.codepoint << 6) | (byte & 0x3f) as u32;
        self.needed -= 1;
        true
    }

    /// Validates the next chunk of the stream.
    ///
    /// Once an invalid octet is found, the validator stays rejected until [`Self::reset`].
    pub fn validate(&mut self, chunk: &[u8]) -> Utf8Validation {
        if self.rejected {
            return Utf8Validation {
                valid: false,
                ends_on_codepoint: false,
                current_index: 0,
                total_index: self.index,
            };
        }
        for (i, byte) in chunk.iter().enumerate() {
            if !self.decode(*byte) {
                self.rejected = true;
                self.index += i;
                return Utf8Validation {
                    valid: false,
                    ends_on_codepoint: false,
                    current_index: i,
                    total_index: self.index,
                };
            }
        }
        self.index += chunk.len();
        Utf8Validation {
            valid: true,
            ends_on_codepoint: self.needed == 0,
            current_index: chunk.len(),
            total_index: self.index,
        }
    }
}

/// Checks if the octets form complete, valid UTF-8.
pub fn is_valid_utf8(data: &[u8]) -> bool {
    let validation = Utf8Validator::new().validate(data);
    validation.valid && validation.ends_on_codepoint
}

/// Truncates a string to at most `limit` octets of UTF-8, without splitting a code point.
pub fn encode_truncate(value: &str, limit: usize) -> Vec<u8> {
    if value.len() <= limit {
        return value.as_bytes().to_vec();
    }
    let mut end = limit;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value.as_bytes()[..end].to_vec()
}

#[cfg(test)]
mod utf8_test {
    use crate::websocket::utf8::{
        Utf8Validator,
        encode_truncate,
        is_valid_utf8,
    };

    #[test]
    fn agrees_with_reference_decoder_on_all_code_points() {
        let mut buf = [0u8; 4];
        for codepoint in 0..=0x10ffffu32 {
            if let Some(c) = char::from_u32(codepoint) {
                assert!(is_valid_utf8(c.encode_utf8(&mut buf).as_bytes()), "{codepoint:x}");
            }
        }
    }

    #[test]
    fn rejects_surrogates_and_overlongs() {
        // U+D800 encoded as if it were a scalar value.
        assert!(!is_valid_utf8(&[0xed, 0xa0, 0x80]));
        // Overlong encodings of '/'.
        assert!(!is_valid_utf8(&[0xc0, 0xaf]));
        assert!(!is_valid_utf8(&[0xe0, 0x80, 0xaf]));
        assert!(!is_valid_utf8(&[0xf0, 0x80, 0x80, 0xaf]));
        // Above U+10FFFF.
        assert!(!is_valid_utf8(&[0xf4, 0x90, 0x80, 0x80]));
        assert!(!is_valid_utf8(&[0xff]));
    }

    #[test]
    fn validates_across_chunks() {
        let bytes = "κόσμε".as_bytes();
        let mut validator = Utf8Validator::new();
        let first = validator.validate(&bytes[..1]);
        assert!(first.valid);
        assert!(!first.ends_on_codepoint);
        let rest = validator.validate(&bytes[1..]);
        assert!(rest.valid);
        assert!(rest.ends_on_codepoint);
        pretty_assertions::assert_eq!(rest.total_index, bytes.len());
    }

    #[test]
    fn reports_failure_index() {
        let mut validator = Utf8Validator::new();
        assert!(validator.validate(b"hello").valid);
        let result = validator.validate(&[b'a', 0xc0, b'b']);
        assert!(!result.valid);
        pretty_assertions::assert_eq!(result.current_index, 1);
        pretty_assertions::assert_eq!(result.total_index, 6);

        // Stays rejected until reset.
        assert!(!validator.validate(b"ok").valid);
        validator.reset();
        assert!(validator.validate(b"ok").valid);
    }

    #[test]
    fn truncates_on_code_point_boundary() {
        pretty_assertions::assert_eq!(encode_truncate("abc", 123), b"abc".to_vec());
        pretty_assertions::assert_eq!(encode_truncate("aé", 2), b"a".to_vec());
        pretty_assertions::assert_eq!(encode_truncate(&"x".repeat(200), 123).len(), 123);
    }
}
