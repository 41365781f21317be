//! Per-URI handler registry for the relay side.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use mixgate_core::{Method, RequestEnvelope, ResponseEnvelope};
use parking_lot::RwLock;
use tracing::debug;

/// A registered request handler for one `(uri, method)` pair.
#[async_trait]
pub trait RestHandler: Send + Sync {
    async fn handle(&self, request: RequestEnvelope) -> ResponseEnvelope;
}

/// Registry mapping `(uri, method)` to handlers.
///
/// Handlers may be added and removed while the server runs; a registry
/// reload deregisters every pair it previously added before re-adding.
#[derive(Default)]
pub struct Endpoints {
    handlers: RwLock<HashMap<(String, Method), Arc<dyn RestHandler>>>,
}

impl Endpoints {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, uri: impl Into<String>, method: Method, handler: Arc<dyn RestHandler>) {
        let uri = uri.into();
        debug!(%uri, %method, "registering endpoint");
        self.handlers.write().insert((uri, method), handler);
    }

    pub fn remove(&self, uri: &str, method: Method) {
        debug!(%uri, %method, "removing endpoint");
        self.handlers.write().remove(&(uri.to_string(), method));
    }

    pub fn contains(&self, uri: &str, method: Method) -> bool {
        self.handlers
            .read()
            .contains_key(&(uri.to_string(), method))
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Dispatch a request to its handler. `None` when no handler matches.
    pub async fn dispatch(&self, request: RequestEnvelope) -> Option<ResponseEnvelope> {
        let handler = self
            .handlers
            .read()
            .get(&(request.uri.clone(), request.method))
            .cloned()?;
        Some(handler.handle(request).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl RestHandler for Echo {
        async fn handle(&self, request: RequestEnvelope) -> ResponseEnvelope {
            ResponseEnvelope::with_status(request.data, 200)
        }
    }

    #[tokio::test]
    async fn test_add_dispatch_remove() {
        let endpoints = Endpoints::new();
        endpoints.add("/echo", Method::Post, Arc::new(Echo));
        assert!(endpoints.contains("/echo", Method::Post));
        assert!(!endpoints.contains("/echo", Method::Get));

        let request = RequestEnvelope::new(Method::Post, "/echo").with_data(b"hi".to_vec());
        let response = endpoints.dispatch(request).await.unwrap();
        assert_eq!(response.content, b"hi");

        endpoints.remove("/echo", Method::Post);
        let request = RequestEnvelope::new(Method::Post, "/echo");
        assert!(endpoints.dispatch(request).await.is_none());
    }

    #[tokio::test]
    async fn test_dispatch_unknown_uri() {
        let endpoints = Endpoints::new();
        let request = RequestEnvelope::new(Method::Get, "/nowhere");
        assert!(endpoints.dispatch(request).await.is_none());
        assert!(endpoints.is_empty());
    }
}
