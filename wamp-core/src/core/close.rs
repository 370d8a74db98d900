use std::fmt::Display;

use crate::core::uri::Uri;

/// The reason a WAMP session is closed, carried by GOODBYE.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    #[default]
    Normal,
    SystemShutdown,
    CloseRealm,
    Killed,
    TimedOut,
    /// Reply to a GOODBYE.
    GoodbyeAndOut,
}

const CLOSE_REASONS: [CloseReason; 6] = [
    CloseReason::Normal,
    CloseReason::SystemShutdown,
    CloseReason::CloseRealm,
    CloseReason::Killed,
    CloseReason::TimedOut,
    CloseReason::GoodbyeAndOut,
];

impl CloseReason {
    fn uri_component(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::SystemShutdown => "system_shutdown",
            Self::CloseRealm => "close_realm",
            Self::Killed => "killed",
            Self::TimedOut => "timed_out",
            Self::GoodbyeAndOut => "goodbye_and_out",
        }
    }

    /// URI for the close reason.
    pub fn uri(&self) -> Uri {
        Uri::from_known(format!("wamp.close.{}", self.uri_component()))
    }
}

impl TryFrom<&Uri> for CloseReason {
    type Error = anyhow::Error;
    fn try_from(value: &Uri) -> Result<Self, Self::Error> {
        value
            .as_ref()
            .strip_prefix("wamp.close.")
            .and_then(|component| {
                CLOSE_REASONS
                    .into_iter()
                    .find(|reason| reason.uri_component() == component)
            })
            .ok_or_else(|| Self::Error::msg(format!("unknown close reason: {value}")))
    }
}

impl Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "wamp.close.{}", self.uri_component())
    }
}
