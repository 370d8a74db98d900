use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::lock::Mutex;

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
        types::{
            Dictionary,
            HashMap,
        },
    },
};

/// A user that authenticates with a ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketUser {
    pub identity: Identity,
    pub ticket: String,
}

/// A database of users that authenticate with tickets.
#[async_trait]
pub trait TicketUserDatabase: Send + Sync {
    /// Looks up a user by authid.
    async fn user(&self, id: &str) -> Result<Option<TicketUser>>;
}

/// A [`TicketUserDatabase`] with a fixed set of users.
#[derive(Debug, Default)]
pub struct StaticTicketUserDatabase {
    users: HashMap<String, TicketUser>,
}

impl StaticTicketUserDatabase {
    pub fn new<I>(users: I) -> Self
    where
        I: IntoIterator<Item = TicketUser>,
    {
        Self {
            users: users
                .into_iter()
                .map(|user| (user.identity.id.clone(), user))
                .collect(),
        }
    }
}

#[async_trait]
impl TicketUserDatabase for StaticTicketUserDatabase {
    async fn user(&self, id: &str) -> Result<Option<TicketUser>> {
        Ok(self.users.get(id).cloned())
    }
}

/// Server authenticator for ticket authentication.
pub struct TicketServerAuthenticator {
    database: Arc<dyn TicketUserDatabase>,
    id: Mutex<Option<String>>,
}

impl TicketServerAuthenticator {
    pub fn new(database: Arc<dyn TicketUserDatabase>) -> Self {
        Self {
            database,
            id: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ServerAuthenticator for TicketServerAuthenticator {
    fn auth_method(&self) -> AuthMethod {
        AuthMethod::Ticket
    }

    async fn challenge(&self, message: ClientFirstMessage) -> Result<ChallengeResult> {
        let id = message
            .id
            .ok_or_else(|| InteractionError::AuthenticationFailed("missing authid".to_owned()))?;
        *self.id.lock().await = Some(id);
        Ok(ChallengeResult::Challenge(ServerFirstMessage {
            method: self.auth_method(),
            extra: Dictionary::default(),
        }))
    }

    async fn authenticate(&self, message: ClientFinalMessage) -> Result<ServerFinalMessage> {
        let id = self.id.lock().await.take().ok_or_else(|| {
            InteractionError::AuthenticationFailed("expected pending user".to_owned())
        })?;
        let user = self
            .database
            .user(&id)
            .await?
            .filter(|user| user.ticket == message.signature)
            .ok_or_else(|| InteractionError::AuthenticationFailed("invalid ticket".to_owned()))?;
        Ok(ServerFinalMessage {
            identity: user.identity,
            method: self.auth_method(),
            provider: "static".to_owned(),
            extra: Dictionary::default(),
        })
    }
}

/// Factory for [`TicketServerAuthenticator`].
pub struct TicketServerAuthenticatorFactory {
    database: Arc<dyn TicketUserDatabase>,
}

impl TicketServerAuthenticatorFactory {
    pub fn new(database: Arc<dyn TicketUserDatabase>) -> Self {
        Self { database }
    }
}

impl std::fmt::Debug for TicketServerAuthenticatorFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketServerAuthenticatorFactory")
            .finish_non_exhaustive()
    }
}

impl ServerAuthenticatorFactory for TicketServerAuthenticatorFactory {
    fn auth_method(&self) -> AuthMethod {
        AuthMethod::Ticket
    }

    fn new_authenticator(&self) -> Box<dyn ServerAuthenticator> {
        Box::new(TicketServerAuthenticator::new(self.database.clone()))
    }
}

/// Client authenticator for ticket authentication.
#[derive(Debug, Clone)]
pub struct TicketClientAuthenticator {
    id: String,
    ticket: String,
}

impl TicketClientAuthenticator {
    pub fn new(id: String, ticket: String) -> Self {
        Self { id, ticket }
    }
}

#[async_trait]
impl ClientAuthenticator for TicketClientAuthenticator {
    fn auth_method(&self) -> AuthMethod {
        AuthMethod::Ticket
    }

    async fn hello(&self) -> Result<ClientFirstMessage> {
        Ok(ClientFirstMessage {
            id: Some(self.id.clone()),
            methods: Vec::from_iter([self.auth_method()]),
            extra: Dictionary::default(),
        })
    }

    async fn handle_challenge(&self, _: ServerFirstMessage) -> Result<ClientFinalMessage> {
        Ok(ClientFinalMessage {
            signature: self.ticket.clone(),
            extra: Dictionary::default(),
        })
    }

    async fn verify_signature(&self, message: ServerFinalMessage) -> Result<()> {
        if message.identity.id != self.id {
            return Err(InteractionError::AuthenticationFailed(format!(
                "authenticated as {} instead of {}",
                message.identity.id, self.id
            ))
            .into());
        }
        Ok(())
    }
}
