//! Tool registry and dispatch.
//!
//! Maps a capability name to its handler. A failing or panicking handler is
//! turned into a `ToolError` for that one request; the connection and the
//! other registered tools are unaffected.

use crate::backend::ModelBackend;
use crate::tools::{BackendTool, StandardTool};
use async_trait::async_trait;
use futures_util::FutureExt;
use mathgrade_shared::{CapabilityDescriptor, CapabilitySelector, ToolError};
use serde_json::Value;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// A named operation exposed by the endpoint
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn descriptor(&self) -> CapabilityDescriptor;

    async fn call(&self, args: Value) -> Result<Value, ToolError>;
}

#[derive(Default)]
pub struct ToolRegistry {
    handlers: BTreeMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard catalog backed by one model backend
    pub fn standard(
        backend: Arc<dyn ModelBackend>,
        selector: CapabilitySelector,
        max_tokens_cap: u32,
    ) -> Self {
        let mut registry = Self::new();
        for tool in StandardTool::ALL {
            registry.register(Arc::new(BackendTool::new(
                tool,
                Arc::clone(&backend),
                selector.clone(),
                max_tokens_cap,
            )));
        }
        registry
    }

    /// Register a handler under its descriptor name. A later registration
    /// with the same name replaces the earlier one.
    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) {
        let name = handler.descriptor().name;
        if self.handlers.insert(name.clone(), handler).is_some() {
            warn!("Replaced handler for capability {}", name);
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    pub fn list_capabilities(&self) -> Vec<CapabilityDescriptor> {
        self.handlers.values().map(|h| h.descriptor()).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run one capability
    pub async fn invoke(&self, name: &str, args: Value) -> Result<Value, ToolError> {
        let handler = self
            .handlers
            .get(name)
            .ok_or_else(|| ToolError::UnknownCapability(name.to_string()))?;

        debug!(capability = name, "invoking handler");
        match AssertUnwindSafe(handler.call(args)).catch_unwind().await {
            Ok(result) => {
                if let Err(e) = &result {
                    warn!(capability = name, "handler failed: {}", e);
                }
                result
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(capability = name, "handler panicked: {}", message);
                Err(ToolError::Handler(format!("handler panicked: {}", message)))
            }
        }
    }
}
