//! Job registry for dispatching leased jobs to handlers.
//!
//! The registry maps job type strings (e.g., "cleanup_sessions") to async
//! handlers that receive the job's raw payload. Registration is a setup
//! phase: the registry is frozen inside the processor once it starts.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;

/// A started handler invocation.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Type alias for the async handler function.
///
/// Handlers receive the payload string exactly as it was enqueued.
type BoxedHandler = Box<dyn Fn(String) -> HandlerFuture + Send + Sync>;

/// Registry that maps job type strings to handlers.
///
/// # Example
///
/// ```ignore
/// let mut registry = JobRegistry::new();
///
/// registry.register("send_digest", |payload| async move {
///     tracing::info!(%payload, "sending digest");
///     Ok(())
/// });
///
/// registry.register_typed::<ExportRequest, _, _>("export_tenant", |req| async move {
///     run_export(req.tenant_id).await
/// });
/// ```
#[derive(Default)]
pub struct JobRegistry {
    handlers: HashMap<String, BoxedHandler>,
}

impl JobRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler that receives the raw payload.
    ///
    /// Registering a type twice replaces the earlier handler.
    pub fn register<F, Fut>(&mut self, job_type: impl Into<String>, handler: F)
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let boxed: BoxedHandler = Box::new(move |payload| Box::pin(handler(payload)));
        self.handlers.insert(job_type.into(), boxed);
    }

    /// Register a handler whose payload is deserialized from JSON first.
    ///
    /// A payload that does not deserialize counts as a handler failure.
    pub fn register_typed<P, F, Fut>(&mut self, job_type: impl Into<String>, handler: F)
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let job_type = job_type.into();
        let type_name = job_type.clone();
        let boxed: BoxedHandler = Box::new(move |payload| {
            let handler = handler.clone();
            let type_name = type_name.clone();
            Box::pin(async move {
                let args: P = serde_json::from_str(&payload)
                    .map_err(|e| anyhow!("Failed to deserialize {} payload: {}", type_name, e))?;
                handler(args).await
            })
        });
        self.handlers.insert(job_type, boxed);
    }

    /// Start the handler for `job_type`, or `None` when nothing is registered.
    ///
    /// A handler that panics while building its future yields a future that
    /// resolves to the panic as an error.
    pub fn dispatch(&self, job_type: &str, payload: String) -> Option<HandlerFuture> {
        let handler = self.handlers.get(job_type)?;

        let future = panic::catch_unwind(AssertUnwindSafe(|| handler(payload))).unwrap_or_else(
            |panic| {
                let message = panic_message(&*panic);
                let failed: HandlerFuture =
                    Box::pin(async move { Err(anyhow!("handler panicked: {}", message)) });
                failed
            },
        );
        Some(future)
    }

    /// Check if a job type is registered.
    pub fn is_registered(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Get all registered job types.
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}

/// Thread-safe registry wrapped in Arc.
pub type SharedJobRegistry = Arc<JobRegistry>;

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
