use std::{
    sync::Arc,
    time::{
        SystemTime,
        UNIX_EPOCH,
    },
};

use anyhow::{
    Error,
    Result,
};
use async_trait::async_trait;
use base64::Engine;
use futures_util::lock::Mutex;
use hmac::{
    Hmac,
    Mac,
};
use sha2::Sha256;
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
        types::{
            Dictionary,
            HashMap,
            Value,
        },
    },
};

type HmacSha256 = Hmac<Sha256>;

/// A user that authenticates with a WAMP-CRA secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WampCraUser {
    pub identity: Identity,
    pub secret: String,
}

/// A database of users that authenticate with WAMP-CRA.
#[async_trait]
pub trait WampCraUserDatabase: Send + Sync {
    /// Looks up a user by authid.
    async fn user(&self, id: &str) -> Result<Option<WampCraUser>>;
}

/// A [`WampCraUserDatabase`] with a fixed set of users.
#[derive(Debug, Default)]
pub struct StaticWampCraUserDatabase {
    users: HashMap<String, WampCraUser>,
}

impl StaticWampCraUserDatabase {
    pub fn new<I>(users: I) -> Self
    where
        I: IntoIterator<Item = WampCraUser>,
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
impl WampCraUserDatabase for StaticWampCraUserDatabase {
    async fn user(&self, id: &str) -> Result<Option<WampCraUser>> {
        Ok(self.users.get(id).cloned())
    }
}

fn new_mac(secret: &[u8]) -> Result<HmacSha256> {
    HmacSha256::new_from_slice(secret).map_err(|_| Error::msg("invalid WAMP-CRA secret"))
}

/// Signs a challenge with a secret.
///
/// The signature is the base64 encoding of HMAC-SHA256 over the challenge string.
pub fn compute_signature(secret: &[u8], challenge: &str) -> Result<String> {
    let mut mac = new_mac(secret)?;
    mac.update(challenge.as_bytes());
    Ok(base64::prelude::BASE64_STANDARD.encode(mac.finalize().into_bytes()))
}

/// Verifies a signature in constant time.
pub fn verify_signature(secret: &[u8], challenge: &str, signature: &str) -> Result<bool> {
    let Ok(signature) = base64::prelude::BASE64_STANDARD.decode(signature) else {
        return Ok(false);
    };
    let mut mac = new_mac(secret)?;
    mac.update(challenge.as_bytes());
    Ok(mac.verify_slice(&signature).is_ok())
}

struct PendingChallenge {
    user: WampCraUser,
    challenge: String,
}

/// Server authenticator for WAMP-CRA.
pub struct WampCraServerAuthenticator {
    database: Arc<dyn WampCraUserDatabase>,
    pending: Mutex<Option<PendingChallenge>>,
}

impl WampCraServerAuthenticator {
    pub fn new(database: Arc<dyn WampCraUserDatabase>) -> Self {
        Self {
            database,
            pending: Mutex::new(None),
        }
    }

    fn challenge_string(user: &WampCraUser) -> Result<String> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_secs())
            .unwrap_or_default();
        let challenge = serde_json::json!({
            "authid": user.identity.id,
            "authrole": user.identity.role,
            "authmethod": Into::<&'static str>::into(AuthMethod::WampCra),
            "authprovider": "static",
            "nonce": Uuid::new_v4().simple().to_string(),
            "timestamp": timestamp,
        });
        Ok(serde_json::to_string(&challenge)?)
    }
}

#[async_trait]
impl ServerAuthenticator for WampCraServerAuthenticator {
    fn auth_method(&self) -> AuthMethod {
        AuthMethod::WampCra
    }

    async fn challenge(&self, message: ClientFirstMessage) -> Result<ChallengeResult> {
        let id = message
            .id
            .ok_or_else(|| InteractionError::AuthenticationFailed("missing authid".to_owned()))?;
        let user = self.database.user(&id).await?.ok_or_else(|| {
            InteractionError::AuthenticationFailed(format!("no user {id} for WAMP-CRA"))
        })?;
        let challenge = Self::challenge_string(&user)?;
        *self.pending.lock().await = Some(PendingChallenge {
            user,
            challenge: challenge.clone(),
        });
        Ok(ChallengeResult::Challenge(ServerFirstMessage {
            method: self.auth_method(),
            extra: Dictionary::from_iter([("challenge".to_owned(), Value::String(challenge))]),
        }))
    }

    async fn authenticate(&self, message: ClientFinalMessage) -> Result<ServerFinalMessage> {
        let pending = self.pending.lock().await.take().ok_or_else(|| {
            InteractionError::AuthenticationFailed("expected pending challenge".to_owned())
        })?;
        if !verify_signature(
            pending.user.secret.as_bytes(),
            &pending.challenge,
            &message.signature,
        )? {
            return Err(
                InteractionError::AuthenticationFailed("invalid signature".to_owned()).into(),
            );
        }
        Ok(ServerFinalMessage {
            identity: pending.user.identity,
            method: self.auth_method(),
            provider: "static".to_owned(),
            extra: Dictionary::default(),
        })
    }
}

/// Factory for [`WampCraServerAuthenticator`].
pub struct WampCraServerAuthenticatorFactory {
    database: Arc<dyn WampCraUserDatabase>,
}

impl WampCraServerAuthenticatorFactory {
    pub fn new(database: Arc<dyn WampCraUserDatabase>) -> Self {
        Self { database }
    }
}

impl std::fmt::Debug for WampCraServerAuthenticatorFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WampCraServerAuthenticatorFactory")
            .finish_non_exhaustive()
    }
}

impl ServerAuthenticatorFactory for WampCraServerAuthenticatorFactory {
    fn auth_method(&self) -> AuthMethod {
        AuthMethod::WampCra
    }

    fn new_authenticator(&self) -> Box<dyn ServerAuthenticator> {
        Box::new(WampCraServerAuthenticator::new(self.database.clone()))
    }
}

/// Client authenticator for WAMP-CRA.
#[derive(Debug, Clone)]
pub struct WampCraClientAuthenticator {
    id: String,
    secret: String,
}

impl WampCraClientAuthenticator {
    pub fn new(id: String, secret: String) -> Self {
        Self { id, secret }
    }
}

#[async_trait]
impl ClientAuthenticator for WampCraClientAuthenticator {
    fn auth_method(&self) -> AuthMethod {
        AuthMethod::WampCra
    }

    async fn hello(&self) -> Result<ClientFirstMessage> {
        Ok(ClientFirstMessage {
            id: Some(self.id.clone()),
            methods: Vec::from_iter([self.auth_method()]),
            extra: Dictionary::default(),
        })
    }

    async fn handle_challenge(&self, message: ServerFirstMessage) -> Result<ClientFinalMessage> {
        let challenge = message
            .extra
            .get("challenge")
            .and_then(|challenge| challenge.string())
            .ok_or_else(|| Error::msg("missing WAMP-CRA challenge string"))?;
        Ok(ClientFinalMessage {
            signature: compute_signature(self.secret.as_bytes(), challenge)?,
            extra: Dictionary::default(),
        })
    }

    async fn verify_signature(&self, _: ServerFinalMessage) -> Result<()> {
        Ok(())
    }
}
