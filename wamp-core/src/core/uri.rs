use std::{
    fmt::Display,
    sync::LazyLock,
};

use regex::Regex;
use thiserror::Error;

use crate::core::match_style::MatchStyle;

/// Error for an invalid URI.
#[derive(Debug, Error)]
#[error("invalid URI")]
pub struct InvalidUri;

/// How strictly URIs are checked.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum UriCheck {
    /// Components may only consist of lowercase letters, digits, and underscores.
    Strict,
    /// Components may contain anything except whitespace, `.`, and `#`.
    #[default]
    Loose,
}

impl TryFrom<&str> for UriCheck {
    type Error = anyhow::Error;
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "strict" => Ok(Self::Strict),
            "loose" => Ok(Self::Loose),
            _ => Err(Self::Error::msg(format!("invalid uri check: {value}"))),
        }
    }
}

/// Which URI components may be empty.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum EmptyComponents {
    /// No component may be empty.
    #[default]
    Disallowed,
    /// Any component may be empty.
    Allowed,
    /// Only the last component may be empty.
    LastOnly,
}

impl From<MatchStyle> for EmptyComponents {
    fn from(value: MatchStyle) -> Self {
        match value {
            MatchStyle::Exact => Self::Disallowed,
            MatchStyle::Prefix => Self::LastOnly,
            MatchStyle::Wildcard => Self::Allowed,
        }
    }
}

fn pattern(check: UriCheck, empty: EmptyComponents) -> &'static Regex {
    static STRICT_NON_EMPTY: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^([0-9a-z_]+\.)*([0-9a-z_]+)$").unwrap());
    static STRICT_EMPTY: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^(([0-9a-z_]+\.)|\.)*([0-9a-z_]+)?$").unwrap());
    static STRICT_LAST_EMPTY: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^([0-9a-z_]+\.)*([0-9a-z_]*)$").unwrap());
    static LOOSE_NON_EMPTY: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^([^\s\.#]+\.)*([^\s\.#]+)$").unwrap());
    static LOOSE_EMPTY: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^(([^\s\.#]+\.)|\.)*([^\s\.#]+)?$").unwrap());
    static LOOSE_LAST_EMPTY: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^([^\s\.#]+\.)*([^\s\.#]*)$").unwrap());
    match (check, empty) {
        (UriCheck::Strict, EmptyComponents::Disallowed) => &STRICT_NON_EMPTY,
        (UriCheck::Strict, EmptyComponents::Allowed) => &STRICT_EMPTY,
        (UriCheck::Strict, EmptyComponents::LastOnly) => &STRICT_LAST_EMPTY,
        (UriCheck::Loose, EmptyComponents::Disallowed) => &LOOSE_NON_EMPTY,
        (UriCheck::Loose, EmptyComponents::Allowed) => &LOOSE_EMPTY,
        (UriCheck::Loose, EmptyComponents::LastOnly) => &LOOSE_LAST_EMPTY,
    }
}

/// Validates a URI against the given rules.
pub fn validate_uri<S>(uri: S, check: UriCheck, empty: EmptyComponents) -> Result<(), InvalidUri>
where
    S: AsRef<str>,
{
    if !pattern(check, empty).is_match(uri.as_ref()) {
        return Err(InvalidUri);
    }
    Ok(())
}

/// Validates a strict URI, with no empty components.
pub fn validate_strict_uri<S>(uri: S) -> Result<(), InvalidUri>
where
    S: AsRef<str>,
{
    validate_uri(uri, UriCheck::Strict, EmptyComponents::Disallowed)
}

/// Validates an implementation-defined attribute name, such as `x_my_option`.
pub fn is_custom_attribute<S>(name: S) -> bool
where
    S: AsRef<str>,
{
    static RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^x_([a-z][0-9a-z_]+)?$").unwrap());
    RE.is_match(name.as_ref())
}

/// A uniform resource identifier, used in many aspects of WAMP messaging for identifying resources,
/// such as realms, topics, and procedures.
///
/// A URI used for pattern-based matching may contain empty components.
#[derive(Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Uri(String);

impl Uri {
    /// Constructs a URI directly from a value known to be valid, skipping validation.
    pub(crate) fn from_known<S>(value: S) -> Self
    where
        S: Into<String>,
    {
        Self(value.into())
    }

    /// Constructs a URI for a subscription or registration with the given match style.
    pub fn for_match<S>(value: S, match_style: MatchStyle) -> Result<Self, InvalidUri>
    where
        S: Into<String>,
    {
        let value = value.into();
        validate_uri(&value, UriCheck::Loose, match_style.into())?;
        Ok(Self(value))
    }

    /// Checks if the URI passes the given validation rules.
    pub fn check(&self, check: UriCheck, empty: EmptyComponents) -> bool {
        validate_uri(&self.0, check, empty).is_ok()
    }

    /// Splits the URI into its components.
    pub fn split(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Uri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl AsRef<str> for Uri {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Uri {
    type Error = InvalidUri;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_uri(&value, UriCheck::Loose, EmptyComponents::Disallowed)?;
        Ok(Self(value))
    }
}

impl TryFrom<&str> for Uri {
    type Error = InvalidUri;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::try_from(value.to_owned())
    }
}

impl From<Uri> for String {
    fn from(value: Uri) -> Self {
        value.0
    }
}
