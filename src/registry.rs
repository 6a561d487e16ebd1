//! Identity → tenant mapping shared by every connection

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::sink::MessageSink;

/// A registered notification target.
///
/// Cloning is cheap; a session keeps the clone it resolved at login even if
/// the registry entry is replaced afterwards.
#[derive(Clone)]
pub struct Tenant {
    identity: String,
    sink: Option<Arc<dyn MessageSink>>,
}

impl Tenant {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn MessageSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn sink(&self) -> Option<&Arc<dyn MessageSink>> {
        self.sink.as_ref()
    }
}

impl fmt::Debug for Tenant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tenant")
            .field("identity", &self.identity)
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}

/// Readers resolve concurrently; register and unregister take the write lock.
#[derive(Default)]
pub struct TenantRegistry {
    tenants: RwLock<HashMap<String, Tenant>>,
}

impl TenantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `tenant` under `identity`, replacing any previous entry.
    pub async fn register(&self, identity: impl Into<String>, tenant: Tenant) {
        self.tenants.write().await.insert(identity.into(), tenant);
    }

    pub async fn unregister(&self, identity: &str) {
        self.tenants.write().await.remove(identity);
    }

    pub async fn resolve(&self, identity: &str) -> Option<Tenant> {
        self.tenants.read().await.get(identity).cloned()
    }

    pub async fn len(&self) -> usize {
        self.tenants.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tenants.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::message::Message;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_register_resolve_unregister() {
        let registry = TenantRegistry::new();
        assert!(registry.resolve("alice").await.is_none());

        registry.register("alice", Tenant::new("alice")).await;
        let tenant = registry.resolve("alice").await.unwrap();
        assert_eq!(tenant.identity(), "alice");
        assert!(tenant.sink().is_none());

        registry.unregister("alice").await;
        assert!(registry.resolve("alice").await.is_none());

        // unregistering twice is a no-op
        registry.unregister("alice").await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_register_replaces() {
        let registry = TenantRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel::<Message>();

        registry.register("bob", Tenant::new("bob")).await;
        registry
            .register("bob", Tenant::new("bob").with_sink(Arc::new(tx)))
            .await;

        assert_eq!(registry.len().await, 1);
        assert!(registry.resolve("bob").await.unwrap().sink().is_some());
    }

    #[tokio::test]
    async fn test_identity_is_exact() {
        let registry = TenantRegistry::new();
        registry.register("Carol", Tenant::new("Carol")).await;
        assert!(registry.resolve("carol").await.is_none());
        assert!(registry.resolve("Carol ").await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_register_and_resolve() {
        let registry = Arc::new(TenantRegistry::new());
        registry.register("shared", Tenant::new("shared-0")).await;

        let writer = {
            let registry = registry.clone();
            tokio::spawn(async move {
                for i in 1..=500 {
                    registry
                        .register("shared", Tenant::new(format!("shared-{}", i)))
                        .await;
                    tokio::task::yield_now().await;
                }
            })
        };

        let readers: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    let mut last = 0;
                    for _ in 0..500 {
                        let tenant = registry.resolve("shared").await.unwrap();
                        let generation: usize = tenant
                            .identity()
                            .strip_prefix("shared-")
                            .unwrap()
                            .parse()
                            .unwrap();
                        // whole entries only, and never older than one already seen
                        assert!(generation >= last && generation <= 500);
                        last = generation;
                    }
                })
            })
            .collect();

        writer.await.unwrap();
        for reader in readers {
            reader.await.unwrap();
        }
        assert_eq!(
            registry.resolve("shared").await.unwrap().identity(),
            "shared-500"
        );
    }
}
