use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    auth::{
        Identity,
        auth_method::AuthMethod,
        authenticator::{
            ChallengeResult,
            ClientAuthenticator,
            ServerAuthenticator,
            ServerAuthenticatorFactory,
        },
        message::{
            ClientFinalMessage,
            ClientFirstMessage,
            ServerFinalMessage,
            ServerFirstMessage,
        },
    },
    core::{
        error::InteractionError,
        types::Dictionary,
    },
};

/// The role given to every anonymous session.
pub const ANONYMOUS_ROLE: &str = "anonymous";

/// Server authenticator for anonymous sessions.
///
/// Accepts every client immediately. A client that names itself keeps its authid; otherwise, one is
/// generated.
#[derive(Debug, Default)]
pub struct AnonymousServerAuthenticator {}

#[async_trait]
impl ServerAuthenticator for AnonymousServerAuthenticator {
    fn auth_method(&self) -> AuthMethod {
        AuthMethod::Anonymous
    }

    async fn challenge(&self, message: ClientFirstMessage) -> Result<ChallengeResult> {
        let id = message
            .id
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        Ok(ChallengeResult::Accept(ServerFinalMessage {
            identity: Identity {
                id,
                role: ANONYMOUS_ROLE.to_owned(),
            },
            method: self.auth_method(),
            provider: "static".to_owned(),
            extra: Dictionary::default(),
        }))
    }

    async fn authenticate(&self, _: ClientFinalMessage) -> Result<ServerFinalMessage> {
        Err(InteractionError::AuthenticationFailed(
            "anonymous authentication has no challenge".to_owned(),
        )
        .into())
    }
}

/// Factory for [`AnonymousServerAuthenticator`].
#[derive(Debug, Default)]
pub struct AnonymousServerAuthenticatorFactory {}

impl ServerAuthenticatorFactory for AnonymousServerAuthenticatorFactory {
    fn auth_method(&self) -> AuthMethod {
        AuthMethod::Anonymous
    }

    fn new_authenticator(&self) -> Box<dyn ServerAuthenticator> {
        Box::new(AnonymousServerAuthenticator::default())
    }
}

/// Client authenticator for anonymous sessions.
#[derive(Debug, Default)]
pub struct AnonymousClientAuthenticator {
    id: Option<String>,
}

impl AnonymousClientAuthenticator {
    /// Creates a client authenticator that asks for the given authid.
    pub fn with_id(id: String) -> Self {
        Self { id: Some(id) }
    }
}

#[async_trait]
impl ClientAuthenticator for AnonymousClientAuthenticator {
    fn auth_method(&self) -> AuthMethod {
        AuthMethod::Anonymous
    }

    async fn hello(&self) -> Result<ClientFirstMessage> {
        Ok(ClientFirstMessage {
            id: self.id.clone(),
            methods: Vec::from_iter([self.auth_method()]),
            extra: Dictionary::default(),
        })
    }

    async fn handle_challenge(&self, _: ServerFirstMessage) -> Result<ClientFinalMessage> {
        Err(InteractionError::ProtocolViolation(
            "unexpected challenge for anonymous authentication".to_owned(),
        )
        .into())
    }

    async fn verify_signature(&self, _: ServerFinalMessage) -> Result<()> {
        Ok(())
    }
}
