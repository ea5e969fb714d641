//! Regional Client Router
//!
//! Hands out one client per [`Scope`]. Clients are never re-pointed at a
//! different region: a reconciliation spanning two scopes simply resolves
//! two clients.

use crate::error::{ReconcileError, Result};
use crate::remote::Scope;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};

/// Builds a client bound to one scope (connection setup, credentials, ...)
#[async_trait]
pub trait ClientFactory: Send + Sync {
    type Client: Send + Sync + 'static;

    async fn connect(&self, scope: &Scope) -> anyhow::Result<Self::Client>;
}

type Slot<C> = Arc<OnceCell<Arc<C>>>;

/// Per-scope client cache.
///
/// The map lock is only held to find or insert a slot; construction runs
/// inside the slot's `OnceCell`, so distinct scopes build concurrently and
/// concurrent callers for the same scope wait for a single construction.
pub struct RegionalClientRouter<F: ClientFactory> {
    factory: F,
    slots: RwLock<HashMap<Scope, Slot<F::Client>>>,
}

impl<F: ClientFactory> RegionalClientRouter<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            slots: RwLock::new(HashMap::new()),
        }
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Get the client for `scope`, building it on first use
    pub async fn resolve(&self, scope: &Scope) -> Result<Arc<F::Client>> {
        let slot = self.slot(scope).await;
        let client = slot
            .get_or_try_init(|| async {
                tracing::debug!("Building client for scope {}", scope);
                self.factory.connect(scope).await.map(Arc::new)
            })
            .await
            .map_err(|source| {
                tracing::error!("Client construction for scope {} failed: {:#}", scope, source);
                ReconcileError::Client {
                    scope: scope.clone(),
                    source,
                }
            })?;
        Ok(Arc::clone(client))
    }

    async fn slot(&self, scope: &Scope) -> Slot<F::Client> {
        if let Some(slot) = self.slots.read().await.get(scope) {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write().await;
        Arc::clone(slots.entry(scope.clone()).or_default())
    }

    /// Drop the cached client for `scope` (e.g. after credential rotation).
    /// Holders of the old client keep using it until they finish.
    pub async fn evict(&self, scope: &Scope) -> bool {
        let removed = self.slots.write().await.remove(scope).is_some();
        if removed {
            tracing::debug!("Evicted client for scope {}", scope);
        }
        removed
    }

    /// Scopes with a constructed client
    pub async fn cached_scopes(&self) -> Vec<Scope> {
        let slots = self.slots.read().await;
        let mut scopes: Vec<Scope> = slots
            .iter()
            .filter(|(_, slot)| slot.initialized())
            .map(|(scope, _)| scope.clone())
            .collect();
        scopes.sort();
        scopes
    }
}
