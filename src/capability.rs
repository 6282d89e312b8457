//! Capability handlers and the name-keyed registry.
//!
//! A capability is a named operation a device exposes. Handlers are
//! registered at device construction under their exact wire name; dispatch
//! resolves that name explicitly, so an unknown name is a
//! `CapabilityNotFound` failure rather than a reflection miss.

use crate::device::DeviceContext;
use crate::protocol::ParameterMap;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// One named operation a device exposes.
///
/// Handlers receive the trigger's parameter map and the device context,
/// through which they can invoke sub-capabilities on other devices. A
/// returned `Err` becomes a sanitized `error` field on the response; it
/// never crashes the dispatch loop.
#[async_trait]
pub trait Capability: Send + Sync {
    async fn invoke(&self, parameters: ParameterMap, ctx: Arc<DeviceContext>)
        -> Result<ParameterMap>;
}

/// Adapter so plain functions and closures can act as capabilities.
pub struct FnCapability<F>(pub F);

#[async_trait]
impl<F> Capability for FnCapability<F>
where
    F: Fn(ParameterMap) -> Result<ParameterMap> + Send + Sync,
{
    async fn invoke(
        &self,
        parameters: ParameterMap,
        _ctx: Arc<DeviceContext>,
    ) -> Result<ParameterMap> {
        (self.0)(parameters)
    }
}

/// Explicit mapping from capability name to handler.
#[derive(Default)]
pub struct CapabilityRegistry {
    handlers: HashMap<String, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `name`, replacing any previous handler
    /// with the same name.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn Capability>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lookup_is_by_exact_name() {
        let mut registry = CapabilityRegistry::new();
        registry.register(
            "cap_echo",
            Arc::new(FnCapability(|params: ParameterMap| Ok(params))),
        );

        assert!(registry.get("cap_echo").is_some());
        assert!(registry.get("cap_Echo").is_none());
        assert!(registry.get("cap_echo_2").is_none());
    }

    #[test]
    fn register_replaces_existing_handler() {
        let mut registry = CapabilityRegistry::new();
        registry.register(
            "cap",
            Arc::new(FnCapability(|_| {
                let mut out = ParameterMap::new();
                out.insert("version".into(), json!(1));
                Ok(out)
            })),
        );
        registry.register(
            "cap",
            Arc::new(FnCapability(|_| {
                let mut out = ParameterMap::new();
                out.insert("version".into(), json!(2));
                Ok(out)
            })),
        );
        assert_eq!(registry.names().len(), 1);
    }
}
