use std::fmt::Debug;

use anyhow::Result;
use async_trait::async_trait;

use crate::auth::{
    auth_method::AuthMethod,
    message::{
        ClientFinalMessage,
        ClientFirstMessage,
        ServerFinalMessage,
        ServerFirstMessage,
    },
};

/// The result of the server's first authentication step.
#[derive(Debug, Clone, PartialEq)]
pub enum ChallengeResult {
    /// The client must answer a CHALLENGE.
    Challenge(ServerFirstMessage),
    /// The client is authenticated without a challenge.
    Accept(ServerFinalMessage),
}

/// Module for handling server-side authentication for a single WAMP session.
///
/// An authenticator is created per session, so it may keep state between the challenge and the
/// client's response.
#[async_trait]
pub trait ServerAuthenticator: Send + Sync {
    /// Authentication method.
    fn auth_method(&self) -> AuthMethod;

    /// Generates the authentication challenge to the client.
    async fn challenge(&self, message: ClientFirstMessage) -> Result<ChallengeResult>;

    /// Authenticates the client's response to the challenge.
    async fn authenticate(&self, message: ClientFinalMessage) -> Result<ServerFinalMessage>;
}

/// Creates a [`ServerAuthenticator`] for each session that selects its authentication method.
pub trait ServerAuthenticatorFactory: Send + Sync + Debug {
    /// Authentication method.
    fn auth_method(&self) -> AuthMethod;

    /// Creates a new authenticator.
    fn new_authenticator(&self) -> Box<dyn ServerAuthenticator>;
}

/// Module for handling client-side authentication for WAMP sessions.
#[async_trait]
pub trait ClientAuthenticator: Send + Sync {
    /// Authentication method.
    fn auth_method(&self) -> AuthMethod;

    /// Generates the client's first message for authentication.
    async fn hello(&self) -> Result<ClientFirstMessage>;

    /// Handles the server's authentication challenge.
    async fn handle_challenge(&self, message: ServerFirstMessage) -> Result<ClientFinalMessage>;

    /// Verifies the server's final message.
    async fn verify_signature(&self, message: ServerFinalMessage) -> Result<()>;
}
