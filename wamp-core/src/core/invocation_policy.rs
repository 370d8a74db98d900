use std::fmt::Display;

/// How a callee should be selected for invocations of a shared registration.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvocationPolicy {
    /// Only a single callee may be registered.
    #[default]
    Single,
    /// Invocation is sent to callees in order of registration.
    RoundRobin,
    /// Invocation is sent to a random callee.
    Random,
    /// Invocation is sent to the first callee.
    First,
    /// Invocation is sent to the last callee.
    Last,
    /// Invocation is sent to all callees.
    ///
    /// Accepted on the wire, but rejected by the router.
    All,
}

impl InvocationPolicy {
    /// Whether multiple callees may share the registration.
    pub fn is_shared(&self) -> bool {
        !matches!(self, Self::Single)
    }
}

impl TryFrom<&str> for InvocationPolicy {
    type Error = anyhow::Error;
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "single" => Ok(Self::Single),
            "roundrobin" => Ok(Self::RoundRobin),
            "random" => Ok(Self::Random),
            "first" => Ok(Self::First),
            "last" => Ok(Self::Last),
            "all" => Ok(Self::All),
            _ => Err(Self::Error::msg(format!(
                "invalid invocation policy: {value}"
            ))),
        }
    }
}

impl From<InvocationPolicy> for &'static str {
    fn from(value: InvocationPolicy) -> Self {
        match value {
            InvocationPolicy::Single => "single",
            InvocationPolicy::RoundRobin => "roundrobin",
            InvocationPolicy::Random => "random",
            InvocationPolicy::First => "first",
            InvocationPolicy::Last => "last",
            InvocationPolicy::All => "all",
        }
    }
}

impl Display for InvocationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", <&'static str>::from(*self))
    }
}
