use std::{
    sync::Arc,
    time::Duration,
};

use anyhow::{
    Error,
    Result,
};
use futures_util::future::join_all;
use log::info;
use tokio::sync::{
    Mutex,
    RwLock,
};

use crate::{
    auth::authenticator::ServerAuthenticatorFactory,
    core::{
        close::CloseReason,
        error::InteractionError,
        id::Id,
        service::MessageSender,
        types::HashMap,
        uri::Uri,
    },
    router::{
        broker::Broker,
        dealer::Dealer,
        session::{
            SessionHandle,
            SessionInfo,
        },
    },
};

/// Authentication configuration for a realm.
#[derive(Debug, Clone, Default)]
pub struct RealmAuthenticationConfig {
    /// Whether peers must authenticate with one of the configured methods.
    ///
    /// If not required, peers that offer no supported method join anonymously.
    pub required: bool,
    /// Supported authentication methods, in order of preference.
    pub methods: Vec<Arc<dyn ServerAuthenticatorFactory>>,
}

/// Configuration for a realm.
#[derive(Debug, Clone)]
pub struct RealmConfig {
    /// Name of the realm, mostly for logging.
    pub name: String,
    /// URI for peers to connect to the realm.
    pub uri: Uri,
    /// Authentication of peers joining the realm.
    pub authentication: RealmAuthenticationConfig,
}

impl RealmConfig {
    /// Configuration for a realm created on demand.
    pub fn dynamic(uri: Uri) -> Self {
        Self {
            name: uri.to_string(),
            uri,
            authentication: RealmAuthenticationConfig::default(),
        }
    }
}

/// A single session on a realm.
#[derive(Debug)]
pub struct RealmSession {
    pub info: Arc<SessionInfo>,
    /// Sends directly to the peer, bypassing the session's state machine.
    pub sender: MessageSender,
    pub handle: SessionHandle,
}

/// A realm, which is a scoped area for peer sessions and resources.
///
/// WAMP sessions cannot communicate across realms.
#[derive(Debug)]
pub struct Realm {
    /// The realm configuration when created.
    pub config: RealmConfig,

    /// Sessions in the realm.
    pub sessions: HashMap<Id, RealmSession>,

    /// Broker for pub/sub functionality.
    pub broker: Broker,

    /// Dealer for RPC functionality.
    pub dealer: Dealer,

    dynamic: bool,
    destroyed: bool,
}

impl Realm {
    /// Creates a new realm.
    pub fn new(config: RealmConfig) -> Self {
        Self {
            config,
            sessions: HashMap::default(),
            broker: Broker::default(),
            dealer: Dealer::default(),
            dynamic: false,
            destroyed: false,
        }
    }

    /// Creates a new realm on demand, which is destroyed when its last session leaves.
    pub fn new_dynamic(uri: Uri) -> Self {
        Self {
            dynamic: true,
            ..Self::new(RealmConfig::dynamic(uri))
        }
    }

    /// The URI for accessing the realm.
    pub fn uri(&self) -> &Uri {
        &self.config.uri
    }

    /// Whether the realm was removed from its manager, so it must not take new sessions.
    pub fn destroyed(&self) -> bool {
        self.destroyed
    }
}

/// A manager for all realms owned by a router.
#[derive(Debug, Default)]
pub struct RealmManager {
    realms: RwLock<HashMap<Uri, Arc<Mutex<Realm>>>>,
}

impl RealmManager {
    /// Creates a manager over the configured realms.
    pub fn new<I>(configs: I) -> Self
    where
        I: IntoIterator<Item = RealmConfig>,
    {
        Self {
            realms: RwLock::new(
                configs
                    .into_iter()
                    .map(|config| (config.uri.clone(), Arc::new(Mutex::new(Realm::new(config)))))
                    .collect(),
            ),
        }
    }

    /// Looks up realm by URI.
    pub async fn get(&self, uri: &Uri) -> Option<Arc<Mutex<Realm>>> {
        self.realms.read().await.get(uri).cloned()
    }

    /// Looks up realm by URI, creating it if allowed.
    pub async fn get_or_create(&self, uri: &Uri, create: bool) -> Result<Arc<Mutex<Realm>>> {
        if let Some(realm) = self.get(uri).await {
            return Ok(realm);
        }
        if !create {
            return Err(InteractionError::NoSuchRealm.into());
        }
        let mut realms = self.realms.write().await;
        let realm = realms
            .entry(uri.clone())
            .or_insert_with(|| {
                info!("Created realm {uri}");
                Arc::new(Mutex::new(Realm::new_dynamic(uri.clone())))
            })
            .clone();
        Ok(realm)
    }

    /// Looks up the authentication configuration for joining a realm.
    ///
    /// A realm that would be created on demand is not created here, so sessions that fail to
    /// authenticate leave nothing behind.
    pub async fn authentication(
        &self,
        uri: &Uri,
        create: bool,
    ) -> Result<RealmAuthenticationConfig> {
        match self.get(uri).await {
            Some(realm) => Ok(realm.lock().await.config.authentication.clone()),
            None if create => Ok(RealmConfig::dynamic(uri.clone()).authentication),
            None => Err(InteractionError::NoSuchRealm.into()),
        }
    }

    /// Removes a dynamic realm that no longer has any sessions.
    pub async fn remove_if_empty(&self, uri: &Uri) {
        let mut realms = self.realms.write().await;
        let Some(realm) = realms.get(uri).cloned() else {
            return;
        };
        let mut realm = realm.lock().await;
        if !realm.dynamic || !realm.sessions.is_empty() {
            return;
        }
        realm.destroyed = true;
        realms.remove(uri);
        info!("Destroyed realm {uri}");
    }

    /// All realm URIs.
    pub async fn uris(&self) -> Vec<Uri> {
        self.realms.read().await.keys().cloned().collect()
    }

    /// Shuts down a realm by attempting to end all sessions cleanly.
    ///
    /// If sessions cannot be cleaned up in time, they are dropped when the router ends.
    pub async fn shut_down(&self, uri: &Uri, close_reason: CloseReason) -> Result<()> {
        let Some(realm) = self.get(uri).await else {
            return Ok(());
        };
        let sessions = realm
            .lock()
            .await
            .sessions
            .values()
            .map(|session| session.handle.clone())
            .collect::<Vec<_>>();
        for session in &sessions {
            session.close(close_reason).ok();
        }

        tokio::select! {
            _ = join_all(sessions.iter().map(|session| session.closed())) => Ok(()),
            _ = tokio::time::sleep(Duration::from_secs(2)) => {
                Err(Error::msg("timed out waiting for sessions to close cleanly"))
            }
        }
    }
}

#[cfg(test)]
mod realm_test {
    use crate::{
        core::{
            error::InteractionError,
            uri::Uri,
        },
        router::realm::{
            RealmConfig,
            RealmManager,
        },
    };

    #[tokio::test]
    async fn creates_dynamic_realms_only_when_allowed() {
        let configured = Uri::try_from("com.example.configured").unwrap();
        let manager = RealmManager::new([RealmConfig::dynamic(configured.clone())]);
        assert!(manager.get(&configured).await.is_some());

        let other = Uri::try_from("com.example.other").unwrap();
        assert_matches::assert_matches!(
            manager
                .get_or_create(&other, false)
                .await
                .map_err(|err| err.downcast::<InteractionError>()),
            Err(Ok(InteractionError::NoSuchRealm))
        );
        manager.get_or_create(&other, true).await.unwrap();
        let mut uris = manager.uris().await;
        uris.sort();
        pretty_assertions::assert_eq!(uris, Vec::from_iter([configured, other]));
    }

    #[tokio::test]
    async fn looks_up_authentication_without_creating_realms() {
        let configured = Uri::try_from("com.example.configured").unwrap();
        let mut config = RealmConfig::dynamic(configured.clone());
        config.authentication.required = true;
        let manager = RealmManager::new([config]);
        assert_matches::assert_matches!(
            manager.authentication(&configured, false).await,
            Ok(authentication) => {
                assert!(authentication.required);
            }
        );

        let other = Uri::try_from("com.example.other").unwrap();
        assert_matches::assert_matches!(
            manager
                .authentication(&other, false)
                .await
                .map_err(|err| err.downcast::<InteractionError>()),
            Err(Ok(InteractionError::NoSuchRealm))
        );
        assert_matches::assert_matches!(
            manager.authentication(&other, true).await,
            Ok(authentication) => {
                assert!(!authentication.required);
                assert!(authentication.methods.is_empty());
            }
        );
        assert!(manager.get(&other).await.is_none());
    }

    #[tokio::test]
    async fn removes_only_empty_dynamic_realms() {
        let configured = Uri::try_from("com.example.configured").unwrap();
        let dynamic = Uri::try_from("com.example.dynamic").unwrap();
        let manager = RealmManager::new([RealmConfig::dynamic(configured.clone())]);
        let realm = manager.get_or_create(&dynamic, true).await.unwrap();

        manager.remove_if_empty(&configured).await;
        manager.remove_if_empty(&dynamic).await;
        assert!(manager.get(&configured).await.is_some());
        assert!(manager.get(&dynamic).await.is_none());
        assert!(realm.lock().await.destroyed());
    }
}
