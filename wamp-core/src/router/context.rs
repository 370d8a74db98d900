use std::sync::Arc;

use anyhow::Result;
use tokio::sync::OwnedMutexGuard;

use crate::{
    core::{
        error::InteractionError,
        uri::Uri,
    },
    router::{
        realm::Realm,
        router::Router,
    },
};

/// The context of a task running for a router.
///
/// Used to share ownership of the router across many tasks.
#[derive(Clone)]
pub struct RouterContext {
    router: Arc<Router>,
}

impl RouterContext {
    /// Constructs a new context wrapper around a router.
    pub fn new(router: Router) -> Self {
        Self {
            router: Arc::new(router),
        }
    }

    pub fn router(&self) -> &Router {
        self.router.as_ref()
    }

    /// Locks a realm for exclusive access.
    ///
    /// The realm manager itself is not held, so other realms stay available.
    pub async fn realm_context(&self, realm: &Uri) -> Result<RealmContext<'_>> {
        let realm = self
            .router
            .realm_manager
            .get(realm)
            .await
            .ok_or(InteractionError::NoSuchRealm)?;
        Ok(RealmContext {
            context: self,
            realm: realm.lock_owned().await,
        })
    }
}

/// Exclusive access to a single realm.
pub struct RealmContext<'router> {
    context: &'router RouterContext,
    realm: OwnedMutexGuard<Realm>,
}

impl<'router> RealmContext<'router> {
    pub fn router(&self) -> &Router {
        self.context.router()
    }

    pub fn realm(&self) -> &Realm {
        &self.realm
    }

    pub fn realm_mut(&mut self) -> &mut Realm {
        &mut self.realm
    }
}
