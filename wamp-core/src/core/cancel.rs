use std::fmt::Display;

/// How an active procedure call should be canceled, as requested by the caller.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum CallCancelMode {
    /// An ERROR is sent immediately back to the caller. The callee receives no INTERRUPT.
    #[default]
    Skip,
    /// INTERRUPT is sent to the callee, and an ERROR is sent immediately back to the caller.
    Abort,
    /// INTERRUPT is sent to the callee, and the caller waits for acknowledgement in the form of an
    /// ERROR or RESULT.
    Kill,
}

impl TryFrom<&str> for CallCancelMode {
    type Error = anyhow::Error;
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "skip" => Ok(Self::Skip),
            "abort" => Ok(Self::Abort),
            "kill" => Ok(Self::Kill),
            _ => Err(Self::Error::msg(format!(
                "invalid call cancel mode: {value}"
            ))),
        }
    }
}

impl From<CallCancelMode> for &'static str {
    fn from(value: CallCancelMode) -> Self {
        match value {
            CallCancelMode::Skip => "skip",
            CallCancelMode::Abort => "abort",
            CallCancelMode::Kill => "kill",
        }
    }
}

impl Display for CallCancelMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", <&'static str>::from(*self))
    }
}

/// How an invocation is interrupted on the callee.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum InterruptMode {
    /// The callee does not need to acknowledge the interruption.
    #[default]
    Abort,
    /// The callee must reply with an ERROR or RESULT.
    Kill,
}

impl TryFrom<&str> for InterruptMode {
    type Error = anyhow::Error;
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "abort" => Ok(Self::Abort),
            "kill" => Ok(Self::Kill),
            _ => Err(Self::Error::msg(format!("invalid interrupt mode: {value}"))),
        }
    }
}

impl From<InterruptMode> for &'static str {
    fn from(value: InterruptMode) -> Self {
        match value {
            InterruptMode::Abort => "abort",
            InterruptMode::Kill => "kill",
        }
    }
}

impl Display for InterruptMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", <&'static str>::from(*self))
    }
}
