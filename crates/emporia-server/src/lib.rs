use std::sync::Arc;

use emporia_core::{AgentLoop, CancellationRegistry, EventBus};
use emporia_index::SearchService;
use emporia_store::Store;

mod http;

pub use http::serve;

/// Everything the HTTP layer needs, built once at startup.
#[derive(Clone)]
pub struct AppState {
    pub agent: Arc<AgentLoop>,
    pub store: Arc<Store>,
    pub search: Arc<SearchService>,
    pub event_bus: EventBus,
    pub cancellations: CancellationRegistry,
}
