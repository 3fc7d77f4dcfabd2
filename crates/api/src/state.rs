use std::sync::Arc;

use tabsyn_core::entitlement::EntitlementProvider;
use tabsyn_core::registry::JobRegistry;

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via
/// `State<AppState>`.
///
/// This is cheaply cloneable (inner data is behind `Arc`).
#[derive(Clone)]
pub struct AppState {
    /// Durable job store. Production wires the PostgreSQL registry;
    /// tests use the in-memory one.
    pub registry: Arc<dyn JobRegistry>,
    /// Owner -> tier/priority/retry-budget lookup.
    pub entitlements: Arc<dyn EntitlementProvider>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
}
