//! Named in-process handlers that manifests reference with `"handler": "<name>"`.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tether_core::context::{EventContext, Matched};
use tether_core::events::ProtocolEvent;
use tether_core::transport::Socket;

use crate::error::PluginError;
use crate::plugin::PluginHandler;

/// Send `text` back to the chat the event came from.
pub async fn reply(socket: &Arc<dyn Socket>, ctx: &EventContext, text: &str) -> Result<(), PluginError> {
    let chat = ctx
        .chat
        .as_deref()
        .ok_or_else(|| PluginError::Handler(format!("{} event has no chat to reply to", ctx.event)))?;
    socket.send_text(chat, text).await?;
    Ok(())
}

#[derive(Clone, Default)]
pub struct HandlerCatalog {
    handlers: BTreeMap<String, Arc<dyn PluginHandler>>,
}

impl HandlerCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog preloaded with `ping` and `echo`.
    pub fn with_builtins() -> Self {
        let mut catalog = Self::new();
        catalog.register("ping", Arc::new(PingHandler));
        catalog.register("echo", Arc::new(EchoHandler));
        catalog
    }

    /// Register a handler; an existing entry with the same name is replaced.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn PluginHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn PluginHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

/// Replies `pong`.
struct PingHandler;

#[async_trait]
impl PluginHandler for PingHandler {
    async fn invoke(
        &self,
        socket: &Arc<dyn Socket>,
        ctx: &EventContext,
        _event: ProtocolEvent,
    ) -> Result<(), PluginError> {
        reply(socket, ctx, "pong").await
    }

    fn kind(&self) -> &'static str {
        "builtin"
    }
}

/// Replies with the first pattern capture, or the text after the command.
struct EchoHandler;

impl EchoHandler {
    fn echoed(ctx: &EventContext) -> Option<String> {
        let text = ctx.text()?;
        let echoed = match ctx.matched.as_ref().map(|m| (&m.matched, m.prefix)) {
            Some((Matched::Pattern(groups), _)) => groups.get(1).cloned().flatten()?,
            Some((Matched::Literal(_), prefix)) => {
                let body = match prefix {
                    Some(p) => text.strip_prefix(p).unwrap_or(text),
                    None => text,
                };
                body.split_once(char::is_whitespace)
                    .map(|(_, rest)| rest.trim().to_string())?
            }
            None => text.to_string(),
        };
        (!echoed.is_empty()).then_some(echoed)
    }
}

#[async_trait]
impl PluginHandler for EchoHandler {
    async fn invoke(
        &self,
        socket: &Arc<dyn Socket>,
        ctx: &EventContext,
        _event: ProtocolEvent,
    ) -> Result<(), PluginError> {
        match Self::echoed(ctx) {
            Some(text) => reply(socket, ctx, &text).await,
            None => Ok(()),
        }
    }

    fn kind(&self) -> &'static str {
        "builtin"
    }
}
