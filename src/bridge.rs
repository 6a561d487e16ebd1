//! Tenant lifecycle on top of the shared server
//!
//! Every tenant context shares one registry and one listener. Asking for a
//! tenant starts the listener if it is not running yet.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;

use crate::config::Opt;
use crate::registry::{Tenant, TenantRegistry};
use crate::server::Server;
use crate::sink::MessageSink;
use crate::utils::Logger;

pub struct Bridge {
    registry: Arc<TenantRegistry>,
    server: Arc<Server>,
}

impl Bridge {
    pub fn new(opt: Opt, logger: Logger) -> Self {
        let registry = Arc::new(TenantRegistry::new());
        let server = Arc::new(Server::new(opt, registry.clone(), logger));
        Self { registry, server }
    }

    pub fn registry(&self) -> &Arc<TenantRegistry> {
        &self.registry
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    /// Starts the listener if needed and returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        self.server.start().await
    }

    /// A disabled context for `identity`; the listener is running on return.
    pub async fn tenant(&self, identity: impl Into<String>) -> Result<TenantContext> {
        self.start().await?;
        Ok(TenantContext {
            identity: identity.into(),
            sink: None,
            registry: self.registry.clone(),
        })
    }
}

/// One tenant as seen by its host: configured, then enabled or disabled.
pub struct TenantContext {
    identity: String,
    sink: Option<Arc<dyn MessageSink>>,
    registry: Arc<TenantRegistry>,
}

impl TenantContext {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Takes effect at the next `enable`.
    pub fn set_message_sink(&mut self, sink: Arc<dyn MessageSink>) {
        self.sink = Some(sink);
    }

    pub async fn enable(&self) {
        let mut tenant = Tenant::new(self.identity.clone());
        if let Some(sink) = &self.sink {
            tenant = tenant.with_sink(sink.clone());
        }
        self.registry.register(self.identity.clone(), tenant).await;
    }

    pub async fn disable(&self) {
        self.registry.unregister(&self.identity).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::message::Message;
    use tokio::sync::mpsc;

    fn local_opt() -> Opt {
        let mut opt = Opt::default();
        opt.address = "127.0.0.1".to_string();
        opt.port = 0;
        opt
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let bridge = Bridge::new(local_opt(), Logger::stdout());
        let first = bridge.start().await.unwrap();
        let second = bridge.start().await.unwrap();
        assert_eq!(first, second);
        assert_ne!(first.port(), 0);

        let context = bridge.tenant("alice").await.unwrap();
        assert_eq!(bridge.server().local_addr(), Some(first));
        assert_eq!(context.identity(), "alice");
    }

    #[tokio::test]
    async fn test_enable_disable() {
        let bridge = Bridge::new(local_opt(), Logger::stdout());
        let mut context = bridge.tenant("alice").await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel::<Message>();
        context.set_message_sink(Arc::new(tx));

        assert!(bridge.registry().resolve("alice").await.is_none());

        context.enable().await;
        let tenant = bridge.registry().resolve("alice").await.unwrap();
        assert!(tenant.sink().is_some());

        context.disable().await;
        assert!(bridge.registry().resolve("alice").await.is_none());
    }
}
