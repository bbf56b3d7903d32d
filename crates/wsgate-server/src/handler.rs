//! Handler contract and per-tenant handler lookup.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::session::ConnectionSession;

/// Application code attached to a `/{tenant}/{handler}` path.
pub trait WebSocketHandler: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Called once per connection after the handshake, before any message
    /// is read. Register callbacks on `session` here.
    fn on_connect(&self, session: &Arc<ConnectionSession>) -> anyhow::Result<()>;
}

/// Why a handler could not be found.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Unresolved {
    /// No such tenant.
    UnknownTenant,
    /// The tenant has no handler with that name.
    UnknownHandler,
}

/// Finds the handler for a tenant and handler name.
pub trait HandlerResolver: Send + Sync {
    /// Look up `handler` in `tenant`.
    fn resolve(&self, tenant: &str, handler: &str) -> Result<Arc<dyn WebSocketHandler>, Unresolved>;
}

type TenantHandlers = HashMap<String, Arc<dyn WebSocketHandler>>;

/// In-memory [`HandlerResolver`].
#[derive(Default)]
pub struct HandlerRegistry {
    tenants: RwLock<HashMap<String, TenantHandlers>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `tenant` known, with no handlers yet.
    pub fn add_tenant(&self, tenant: &str) {
        let _ = self
            .tenants
            .write()
            .entry(tenant.to_owned())
            .or_default();
    }

    /// Register `handler` under `name` for `tenant`, adding the tenant if
    /// needed. Returns the handler it replaced, if any.
    pub fn register(
        &self,
        tenant: &str,
        name: &str,
        handler: Arc<dyn WebSocketHandler>,
    ) -> Option<Arc<dyn WebSocketHandler>> {
        tracing::debug!(tenant, name, "registering websocket handler");
        self.tenants
            .write()
            .entry(tenant.to_owned())
            .or_default()
            .insert(name.to_owned(), handler)
    }

    /// Remove a handler. Returns whether it existed.
    pub fn unregister(&self, tenant: &str, name: &str) -> bool {
        self.tenants
            .write()
            .get_mut(tenant)
            .and_then(|handlers| handlers.remove(name))
            .is_some()
    }

    /// Known tenant names, sorted.
    pub fn tenants(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tenants.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Handler names of `tenant`, sorted.
    pub fn handlers(&self, tenant: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .tenants
            .read()
            .get(tenant)
            .map(|h| h.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}

impl HandlerResolver for HandlerRegistry {
    fn resolve(&self, tenant: &str, handler: &str) -> Result<Arc<dyn WebSocketHandler>, Unresolved> {
        let tenants = self.tenants.read();
        let handlers = tenants.get(tenant).ok_or(Unresolved::UnknownTenant)?;
        handlers
            .get(handler)
            .cloned()
            .ok_or(Unresolved::UnknownHandler)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
