use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tether_core::context::EventContext;
use tether_core::events::ProtocolEvent;
use tether_core::ids::PluginId;
use tether_core::transport::Socket;

use crate::error::PluginError;
use crate::matcher::Matcher;

/// The callable body of a plugin.
#[async_trait]
pub trait PluginHandler: Send + Sync {
    async fn invoke(
        &self,
        socket: &Arc<dyn Socket>,
        ctx: &EventContext,
        event: ProtocolEvent,
    ) -> Result<(), PluginError>;

    /// Short label used in logs and `tether plugins` output.
    fn kind(&self) -> &'static str {
        "native"
    }
}

type HandlerFn = dyn Fn(Arc<dyn Socket>, EventContext, ProtocolEvent) -> BoxFuture<'static, Result<(), PluginError>>
    + Send
    + Sync;

/// Closure-backed [`PluginHandler`].
pub struct FnHandler {
    f: Box<HandlerFn>,
}

#[async_trait]
impl PluginHandler for FnHandler {
    async fn invoke(
        &self,
        socket: &Arc<dyn Socket>,
        ctx: &EventContext,
        event: ProtocolEvent,
    ) -> Result<(), PluginError> {
        (self.f)(Arc::clone(socket), ctx.clone(), event).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn PluginHandler>
where
    F: Fn(Arc<dyn Socket>, EventContext, ProtocolEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), PluginError>> + Send + 'static,
{
    Arc::new(FnHandler {
        f: Box::new(move |socket, ctx, event| Box::pin(f(socket, ctx, event))),
    })
}

/// A loaded plugin definition. Immutable once installed in the registry.
#[derive(Clone)]
pub struct Plugin {
    pub id: PluginId,
    pub handler: Arc<dyn PluginHandler>,
    /// Subscribed events, never empty.
    pub events: Vec<ProtocolEvent>,
    /// `None` means the plugin runs on every occurrence of its events.
    pub matcher: Option<Matcher>,
    pub group: Option<String>,
    pub source: PathBuf,
    pub enabled: bool,
    pub description: Option<String>,
    /// Registry generation at install time. Zero until installed.
    pub version: u64,
    /// Source file mtime when loaded.
    pub modified: Option<SystemTime>,
}

impl Plugin {
    pub fn new(id: PluginId, handler: Arc<dyn PluginHandler>, events: Vec<ProtocolEvent>) -> Self {
        Self {
            id,
            handler,
            events,
            matcher: None,
            group: None,
            source: PathBuf::new(),
            enabled: true,
            description: None,
            version: 0,
            modified: None,
        }
    }

    #[must_use]
    pub fn with_matcher(mut self, matcher: Option<Matcher>) -> Self {
        self.matcher = matcher;
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<PathBuf>) -> Self {
        self.source = source.into();
        self
    }

    #[must_use]
    pub fn with_group(mut self, group: Option<String>) -> Self {
        self.group = group;
        self
    }

    pub fn is_conditioned(&self) -> bool {
        self.matcher.is_some()
    }
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("id", &self.id)
            .field("kind", &self.handler.kind())
            .field("events", &self.events)
            .field("conditioned", &self.is_conditioned())
            .field("group", &self.group)
            .field("source", &self.source)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}
