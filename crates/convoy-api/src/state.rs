//! Application state.

use std::sync::Arc;

use convoy_engine::Orchestrator;

/// Shared application state: the orchestrator carries every injected
/// collaborator the routes need.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}
