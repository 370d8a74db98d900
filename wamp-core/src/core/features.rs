use crate::core::{
    roles::{
        PeerRole,
        RouterRole,
    },
    types::{
        Dictionary,
        Value,
    },
};

/// Advanced features the broker announces to peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubFeatures {
    /// Publishers may exclude themselves from receiving events.
    pub publisher_exclusion: bool,
    /// Publishers may disclose their identity to subscribers.
    pub publisher_identification: bool,
    /// Publishers may restrict receivers by session, authid, or authrole.
    pub subscriber_blackwhite_listing: bool,
    /// Subscriptions may use prefix or wildcard matching.
    pub pattern_based_subscription: bool,
}

impl Default for PubSubFeatures {
    fn default() -> Self {
        Self {
            publisher_exclusion: true,
            publisher_identification: true,
            subscriber_blackwhite_listing: true,
            pattern_based_subscription: true,
        }
    }
}

/// Advanced features the dealer announces to peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcFeatures {
    /// Procedures may produce progressive results.
    pub progressive_call_results: bool,
    /// Callers may disclose their identity to callees.
    pub caller_identification: bool,
    /// Registrations may use prefix or wildcard matching.
    pub pattern_based_registration: bool,
    /// Multiple callees may share a registration.
    pub shared_registration: bool,
}

impl Default for RpcFeatures {
    fn default() -> Self {
        Self {
            progressive_call_results: true,
            caller_identification: true,
            pattern_based_registration: true,
            shared_registration: true,
        }
    }
}

fn features_dictionary<'a, I>(features: I) -> Value
where
    I: IntoIterator<Item = (&'a str, bool)>,
{
    Value::Dictionary(Dictionary::from_iter([(
        "features".to_owned(),
        Value::Dictionary(
            features
                .into_iter()
                .filter(|(_, enabled)| *enabled)
                .map(|(name, enabled)| (name.to_owned(), Value::Bool(enabled)))
                .collect(),
        ),
    )]))
}

impl PubSubFeatures {
    fn announcement(&self) -> Value {
        features_dictionary([
            ("publisher_exclusion", self.publisher_exclusion),
            ("publisher_identification", self.publisher_identification),
            (
                "subscriber_blackwhite_listing",
                self.subscriber_blackwhite_listing,
            ),
            ("pattern_based_subscription", self.pattern_based_subscription),
        ])
    }
}

impl RpcFeatures {
    fn announcement(&self) -> Value {
        features_dictionary([
            ("progressive_call_results", self.progressive_call_results),
            ("caller_identification", self.caller_identification),
            ("pattern_based_registration", self.pattern_based_registration),
            ("shared_registration", self.shared_registration),
        ])
    }
}

/// Builds the `roles` dictionary sent in WELCOME.
pub fn router_roles_announcement<'a, I>(
    roles: I,
    pub_sub: &PubSubFeatures,
    rpc: &RpcFeatures,
) -> Dictionary
where
    I: IntoIterator<Item = &'a RouterRole>,
{
    roles
        .into_iter()
        .map(|role| {
            let features = match role {
                RouterRole::Broker => pub_sub.announcement(),
                RouterRole::Dealer => rpc.announcement(),
            };
            (role.to_string(), features)
        })
        .collect()
}

/// Builds the `roles` dictionary sent in HELLO.
///
/// Each role announces the client side of the features it understands.
pub fn peer_roles_announcement<'a, I>(roles: I) -> Dictionary
where
    I: IntoIterator<Item = &'a PeerRole>,
{
    roles
        .into_iter()
        .map(|role| {
            let features = match role {
                PeerRole::Publisher => features_dictionary([
                    ("publisher_exclusion", true),
                    ("publisher_identification", true),
                    ("subscriber_blackwhite_listing", true),
                ]),
                PeerRole::Subscriber => {
                    features_dictionary([("pattern_based_subscription", true)])
                }
                PeerRole::Caller => features_dictionary([
                    ("progressive_call_results", true),
                    ("caller_identification", true),
                ]),
                PeerRole::Callee => features_dictionary([
                    ("progressive_call_results", true),
                    ("caller_identification", true),
                    ("pattern_based_registration", true),
                    ("shared_registration", true),
                ]),
            };
            (role.to_string(), features)
        })
        .collect()
}
