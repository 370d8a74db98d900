use std::fmt::Display;

/// How a procedure registration or subscription should be matched.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchStyle {
    /// The URI must match exactly.
    #[default]
    Exact,
    /// The URI is a prefix of the matched URI.
    Prefix,
    /// Empty components of the URI match any single component.
    Wildcard,
}

impl MatchStyle {
    /// Checks if the pattern matches the given URI.
    pub fn matches(&self, pattern: &str, uri: &str) -> bool {
        match self {
            Self::Exact => pattern == uri,
            Self::Prefix => uri.starts_with(pattern),
            Self::Wildcard => {
                let mut pattern = pattern.split('.');
                let mut uri = uri.split('.');
                loop {
                    match (pattern.next(), uri.next()) {
                        (None, None) => return true,
                        (Some(expected), Some(actual)) => {
                            if !expected.is_empty() && expected != actual {
                                return false;
                            }
                        }
                        _ => return false,
                    }
                }
            }
        }
    }
}

impl TryFrom<&str> for MatchStyle {
    type Error = anyhow::Error;
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "exact" => Ok(Self::Exact),
            "prefix" => Ok(Self::Prefix),
            "wildcard" => Ok(Self::Wildcard),
            _ => Err(Self::Error::msg(format!("invalid match style: {value}"))),
        }
    }
}

impl From<MatchStyle> for &'static str {
    fn from(value: MatchStyle) -> Self {
        match value {
            MatchStyle::Exact => "exact",
            MatchStyle::Prefix => "prefix",
            MatchStyle::Wildcard => "wildcard",
        }
    }
}

impl Display for MatchStyle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", <&'static str>::from(*self))
    }
}

#[cfg(test)]
mod match_style_test {
    use crate::core::match_style::MatchStyle;

    #[test]
    fn matches_prefix() {
        assert!(MatchStyle::Prefix.matches("com.myapp", "com.myapp.topic"));
        assert!(MatchStyle::Prefix.matches("com.myapp", "com.myapp"));
        assert!(MatchStyle::Prefix.matches("com.myapp", "com.myapp2"));
        assert!(!MatchStyle::Prefix.matches("com.myapp", "com.other"));
    }

    #[test]
    fn matches_wildcard() {
        assert!(MatchStyle::Wildcard.matches("com..topic", "com.myapp.topic"));
        assert!(MatchStyle::Wildcard.matches("..", "a.b.c"));
        assert!(!MatchStyle::Wildcard.matches("com..topic", "com.myapp.other"));
        assert!(!MatchStyle::Wildcard.matches("com..topic", "com.myapp.topic.extra"));
        assert!(!MatchStyle::Wildcard.matches("com..topic", "com.topic"));
    }
}
