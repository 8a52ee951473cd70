//! Handler Registry
//!
//! Maps a `job_type` string to the handler that performs it. Each job module
//! registers itself while the process starts; the registry is then frozen
//! behind an `Arc` and shared read-only by the scheduler and the API.

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

use crate::models::JobParams;
use crate::services::job_runner::{JobContext, JobError};

/// Capability every job type implements.
pub trait JobHandler: Send + Sync {
    fn run(&self, ctx: JobContext, params: JobParams) -> BoxFuture<'static, Result<(), JobError>>;
}

impl<F, Fut> JobHandler for F
where
    F: Fn(JobContext, JobParams) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    fn run(&self, ctx: JobContext, params: JobParams) -> BoxFuture<'static, Result<(), JobError>> {
        Box::pin((self)(ctx, params))
    }
}

#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `job_type`, replacing any earlier registration.
    pub fn register<H>(&mut self, job_type: impl Into<String>, handler: H)
    where
        H: JobHandler + 'static,
    {
        let job_type = job_type.into();
        if self
            .handlers
            .insert(job_type.clone(), Arc::new(handler))
            .is_some()
        {
            warn!("Handler for job type '{}' was registered twice", job_type);
        } else {
            info!("📋 Registered job handler: {}", job_type);
        }
    }

    pub fn get_handler(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Registered job types, sorted.
    pub fn list_registered(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn noop(_ctx: JobContext, _params: JobParams) -> Result<(), JobError> {
        Ok(())
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = HandlerRegistry::new();
        registry.register("refresh_prices", noop);
        registry.register("backfill", |_ctx: JobContext, _params: JobParams| async {
            Err::<(), _>(JobError::Failed("not today".to_string()))
        });

        assert!(registry.get_handler("refresh_prices").is_some());
        assert!(registry.get_handler("unknown").is_none());
        assert!(registry.contains("backfill"));
        assert_eq!(registry.list_registered(), vec!["backfill", "refresh_prices"]);
    }

    #[test]
    fn test_re_registering_replaces() {
        let mut registry = HandlerRegistry::new();
        registry.register("backfill", noop);
        registry.register("backfill", noop);

        assert_eq!(registry.list_registered().len(), 1);
    }
}
