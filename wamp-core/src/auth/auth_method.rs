use std::fmt::Display;

/// Authentication methods.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMethod {
    /// No authentication.
    ///
    /// The client is accepted as-is, with a generated identity.
    #[default]
    Anonymous,
    /// Ticket-based authentication.
    ///
    /// The client sends a shared ticket in cleartext, which the server compares against its own
    /// record.
    Ticket,
    /// WAMP Challenge-Response Authentication.
    ///
    /// The client signs a server-generated challenge with a shared secret.
    WampCra,
}

impl TryFrom<&str> for AuthMethod {
    type Error = anyhow::Error;
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "anonymous" => Ok(Self::Anonymous),
            "ticket" => Ok(Self::Ticket),
            "wampcra" => Ok(Self::WampCra),
            _ => Err(Self::Error::msg(format!("invalid auth method: {value}"))),
        }
    }
}

impl From<AuthMethod> for &'static str {
    fn from(value: AuthMethod) -> Self {
        match value {
            AuthMethod::Anonymous => "anonymous",
            AuthMethod::Ticket => "ticket",
            AuthMethod::WampCra => "wampcra",
        }
    }
}

impl From<AuthMethod> for String {
    fn from(value: AuthMethod) -> Self {
        Into::<&'static str>::into(value).to_owned()
    }
}

impl Display for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", Into::<&'static str>::into(*self))
    }
}
