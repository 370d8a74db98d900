use std::fmt::Display;

/// A WebSocket close status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CloseCode(pub u16);

impl CloseCode {
    pub const NORMAL: Self = Self(1000);
    pub const GOING_AWAY: Self = Self(1001);
    pub const PROTOCOL_ERROR: Self = Self(1002);
    pub const UNSUPPORTED_DATA: Self = Self(1003);
    pub const RESERVED: Self = Self(1004);
    /// Must never be sent in a close frame.
    pub const NULL: Self = Self(1005);
    /// Must never be sent in a close frame.
    pub const ABNORMAL_CLOSE: Self = Self(1006);
    pub const INVALID_PAYLOAD: Self = Self(1007);
    pub const POLICY_VIOLATION: Self = Self(1008);
    pub const MESSAGE_TOO_BIG: Self = Self(1009);
    pub const MANDATORY_EXTENSION: Self = Self(1010);
    pub const INTERNAL_ERROR: Self = Self(1011);
    pub const SERVICE_RESTART: Self = Self(1012);
    pub const TRY_AGAIN_LATER: Self = Self(1013);
    pub const UNASSIGNED: Self = Self(1014);
    /// Must never be sent in a close frame.
    pub const TLS_HANDSHAKE_FAILED: Self = Self(1015);

    /// Codes in the range [1000, 2999] that may appear in a close frame.
    pub const ALLOWED: [Self; 11] = [
        Self::NORMAL,
        Self::GOING_AWAY,
        Self::PROTOCOL_ERROR,
        Self::UNSUPPORTED_DATA,
        Self::INVALID_PAYLOAD,
        Self::POLICY_VIOLATION,
        Self::MESSAGE_TOO_BIG,
        Self::MANDATORY_EXTENSION,
        Self::INTERNAL_ERROR,
        Self::SERVICE_RESTART,
        Self::TRY_AGAIN_LATER,
    ];

    /// Checks if the code may appear on the wire.
    ///
    /// Reserved codes are 0-999, 1004-1006, 1014-2999 and 5000 and above.
    pub fn is_allowed_on_wire(&self) -> bool {
        match self.0 {
            1000..=2999 => Self::ALLOWED.contains(self),
            3000..=4999 => true,
            _ => false,
        }
    }

    /// Checks if an application may initiate a close with this code.
    pub fn is_allowed_for_application(&self) -> bool {
        *self == Self::NORMAL || (3000..=4999).contains(&self.0)
    }
}

impl Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u16> for CloseCode {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl From<CloseCode> for u16 {
    fn from(value: CloseCode) -> Self {
        value.0
    }
}

/// The final outcome of a WebSocket connection, reported exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseStatus {
    /// Whether the closing handshake completed in both directions.
    pub was_clean: bool,
    /// The close code, if any.
    pub code: Option<CloseCode>,
    /// The close reason, if any.
    pub reason: Option<String>,
}
