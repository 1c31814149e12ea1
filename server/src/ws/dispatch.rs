//! Inbound type tag -> handler table. Filled while the hub is built and
//! read-only once it runs.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use axum::body::Bytes;

use super::connection::Connection;

pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Handler invoked with the raw frame and the connection it arrived on.
pub type Handler = Arc<dyn Fn(Bytes, Arc<Connection>) -> HandlerFuture + Send + Sync>;

#[derive(Clone, Default)]
pub struct DispatchRegistry {
    handlers: HashMap<String, Handler>,
}

impl DispatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `tag`, replacing any earlier registration.
    pub fn register<F, Fut>(&mut self, tag: impl Into<String>, handler: F)
    where
        F: Fn(Bytes, Arc<Connection>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let tag = tag.into();
        let boxed: Handler = Arc::new(move |raw: Bytes, conn: Arc<Connection>| -> HandlerFuture {
            Box::pin(handler(raw, conn))
        });
        if self.handlers.insert(tag.clone(), boxed).is_some() {
            tracing::warn!(tag = %tag, "Handler replaced");
        }
    }

    pub fn lookup(&self, tag: &str) -> Option<Handler> {
        self.handlers.get(tag).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered tags, sorted.
    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }
}

impl fmt::Debug for DispatchRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchRegistry")
            .field("tags", &self.tags())
            .finish()
    }
}
