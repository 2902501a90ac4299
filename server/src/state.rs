use std::sync::Arc;

use crate::chat::engine::ChatEngine;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// Routing engine, registry and watchdog policy live here.
    pub engine: Arc<ChatEngine>,
}
