//! Shared state injected into the WebSocket upgrade handler.

use std::sync::Arc;

use crate::domain::{ManagerOptions, Registry};

/// State available to the upgrade handler via Axum's `State` extractor.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Registry that admits negotiated sessions.
    pub registry: Registry,
    /// Options the router was built with.
    pub options: Arc<ManagerOptions>,
}
