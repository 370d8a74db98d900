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

/// Router-level policies for incoming RPC requests.
///
/// Every method is permissive by default.
#[async_trait]
pub trait RpcPolicies: Send + Sync {
    /// Authorizes a registration.
    async fn authorize_register(
        &self,
        _session: &SessionInfo,
        _procedure: &Uri,
        _match_style: MatchStyle,
    ) -> Result<bool> {
        Ok(true)
    }

    /// Authorizes a call.
    async fn authorize_call(&self, _session: &SessionInfo, _procedure: &Uri) -> Result<bool> {
        Ok(true)
    }

    /// Validates the payload of a call before it is routed.
    async fn validate_call(
        &self,
        _session: &SessionInfo,
        _procedure: &Uri,
        _payload: &Payload,
    ) -> Result<()> {
        Ok(())
    }

    /// Validates the payload of a result yielded by a callee.
    async fn validate_call_result(
        &self,
        _callee: &SessionInfo,
        _procedure: &Uri,
        _payload: &Payload,
    ) -> Result<()> {
        Ok(())
    }

    /// Whether a caller may be disclosed to the callee.
    fn allow_disclose_caller(&self, _session: &SessionInfo, _procedure: &Uri) -> bool {
        true
    }
}

/// Default implementation of [`RpcPolicies`] with empty policies.
#[derive(Debug, Default)]
pub struct EmptyRpcPolicies {}

impl RpcPolicies for EmptyRpcPolicies {}
