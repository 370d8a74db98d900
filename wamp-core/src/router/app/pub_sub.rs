use anyhow::Result;
use async_trait::async_trait;

use crate::{
    core::{
        match_style::MatchStyle,
        uri::Uri,
    },
    message::payload::Payload,
    router::session::SessionInfo,
};

/// Router-level policies for incoming pub/sub requests.
///
/// Every method is permissive by default.
#[async_trait]
pub trait PubSubPolicies: Send + Sync {
    /// Authorizes a subscription.
    ///
    /// `Ok(false)` denies the request with `wamp.error.not_authorized`. An error fails it with
    /// `wamp.error.authorization_failed`.
    async fn authorize_subscribe(
        &self,
        _session: &SessionInfo,
        _topic: &Uri,
        _match_style: MatchStyle,
    ) -> Result<bool> {
        Ok(true)
    }

    /// Authorizes a publication.
    async fn authorize_publish(&self, _session: &SessionInfo, _topic: &Uri) -> Result<bool> {
        Ok(true)
    }

    /// Validates the payload of a publication before it is dispatched.
    async fn validate_event(
        &self,
        _session: &SessionInfo,
        _topic: &Uri,
        _payload: &Payload,
    ) -> Result<()> {
        Ok(())
    }

    /// Whether a publisher may disclose its identity to subscribers.
    fn allow_disclose_publisher(&self, _session: &SessionInfo, _topic: &Uri) -> bool {
        true
    }
}

/// Default implementation of [`PubSubPolicies`] with empty policies.
#[derive(Debug, Default)]
pub struct EmptyPubSubPolicies {}

impl PubSubPolicies for EmptyPubSubPolicies {}
