//! Provider hooks: host functions injected into a snap's RPC surface.
//!
//! The sandbox reaches them with a `snapRpc` request whose params are
//! `{ "method": <hook name>, "params": ... }`. The execution service only
//! routes the call; what a hook does (account access, entropy, key
//! derivation) is entirely up to the host.
use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::protocol::JobId;

/// Who is calling a hook.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub snap_id: String,
    pub job_id: JobId,
}

/// A host capability exposed to snaps.
#[async_trait]
pub trait ProviderHook: Send + Sync {
    /// Method name the sandbox uses to reach this hook, e.g. `"snap_getEntropy"`.
    fn name(&self) -> &str;

    /// Runs the hook. The returned value becomes the JSON-RPC `result`; an
    /// error becomes a JSON-RPC error response.
    async fn call(&self, params: Value, context: &HookContext) -> anyhow::Result<Value>;
}

/// Hooks keyed by name. Owned by the host and shared by reference with
/// every job.
#[derive(Default)]
pub struct ProviderHooks {
    hooks: BTreeMap<String, Box<dyn ProviderHook>>,
}

impl ProviderHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a hook, replacing any previous hook with the same name.
    pub fn register(&mut self, hook: Box<dyn ProviderHook>) {
        self.hooks.insert(hook.name().to_string(), hook);
    }

    pub fn get(&self, name: &str) -> Option<&dyn ProviderHook> {
        self.hooks.get(name).map(|hook| hook.as_ref())
    }

    /// Names advertised to the sandbox in `executeSnap`, sorted.
    pub fn names(&self) -> Vec<String> {
        self.hooks.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Constant {
        name: &'static str,
        value: Value,
    }

    #[async_trait]
    impl ProviderHook for Constant {
        fn name(&self) -> &str {
            self.name
        }

        async fn call(&self, _params: Value, _context: &HookContext) -> anyhow::Result<Value> {
            Ok(self.value.clone())
        }
    }

    fn context() -> HookContext {
        HookContext {
            snap_id: "npm:example".into(),
            job_id: JobId::from("job-1"),
        }
    }

    #[test]
    fn test_provider_hook_is_object_safe() {
        fn _assert_object_safe(_: &dyn ProviderHook) {}
    }

    #[test]
    fn test_names_are_sorted() {
        let mut hooks = ProviderHooks::new();
        assert!(hooks.is_empty());
        hooks.register(Box::new(Constant { name: "snap_getEntropy", value: json!(1) }));
        hooks.register(Box::new(Constant { name: "snap_dialog", value: json!(2) }));
        assert_eq!(hooks.len(), 2);
        assert_eq!(hooks.names(), vec!["snap_dialog", "snap_getEntropy"]);
    }

    #[tokio::test]
    async fn test_register_replaces_same_name() {
        let mut hooks = ProviderHooks::new();
        hooks.register(Box::new(Constant { name: "snap_dialog", value: json!("old") }));
        hooks.register(Box::new(Constant { name: "snap_dialog", value: json!("new") }));
        assert_eq!(hooks.len(), 1);

        let hook = hooks.get("snap_dialog").unwrap();
        assert_eq!(hook.call(json!({}), &context()).await.unwrap(), json!("new"));
        assert!(hooks.get("snap_notify").is_none());
    }
}
