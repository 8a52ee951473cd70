use std::sync::Arc;

use crate::registry::HandlerRegistry;
use crate::store::JobStore;

#[derive(Clone)]
pub struct AppState {
    /// Request-side store, separate from the scheduler's own.
    pub store: Arc<dyn JobStore>,
    pub registry: Arc<HandlerRegistry>,
}
