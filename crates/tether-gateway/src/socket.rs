use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tether_core::errors::TransportError;
use tether_core::events::ProtocolEvent;
use tether_core::ids::{ListenerId, SessionId};
use tether_core::transport::{EventHub, Listener, Socket};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::frame::{METHOD_LOGOUT, METHOD_PAIRING_CODE, METHOD_SEND_TEXT};

pub(crate) type ReplyTx = oneshot::Sender<Result<Value, TransportError>>;

/// Request queued for the connection task.
pub(crate) struct Command {
    pub(crate) method: &'static str,
    pub(crate) params: Value,
    pub(crate) reply: ReplyTx,
}

/// Socket half of a gateway connection. Calls are relayed to the connection task.
pub struct GatewaySocket {
    session_id: SessionId,
    hub: Arc<EventHub>,
    commands: mpsc::Sender<Command>,
    alive: Arc<AtomicBool>,
    cancel: CancellationToken,
    request_timeout: Duration,
}

impl GatewaySocket {
    pub(crate) fn new(
        session_id: SessionId,
        hub: Arc<EventHub>,
        commands: mpsc::Sender<Command>,
        alive: Arc<AtomicBool>,
        cancel: CancellationToken,
        request_timeout: Duration,
    ) -> Self {
        Self {
            session_id,
            hub,
            commands,
            alive,
            cancel,
            request_timeout,
        }
    }

    async fn request(&self, method: &'static str, params: Value) -> Result<Value, TransportError> {
        if !self.is_alive() {
            return Err(TransportError::Closed);
        }
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command {
                method,
                params,
                reply,
            })
            .await
            .map_err(|_| TransportError::Closed)?;
        tokio::time::timeout(self.request_timeout, rx)
            .await
            .map_err(|_| TransportError::Timeout(format!("{method} after {:?}", self.request_timeout)))?
            .map_err(|_| TransportError::Closed)?
    }
}

#[async_trait]
impl Socket for GatewaySocket {
    fn session_id(&self) -> SessionId {
        self.session_id
    }

    fn subscribe(&self, event: ProtocolEvent, listener: Listener) -> ListenerId {
        self.hub.subscribe(event, listener)
    }

    fn unsubscribe(&self, event: ProtocolEvent, id: ListenerId) -> bool {
        self.hub.unsubscribe(event, id)
    }

    async fn request_pairing_code(&self, phone: &str) -> Result<String, TransportError> {
        let result = self
            .request(METHOD_PAIRING_CODE, json!({ "phone": phone }))
            .await?;
        result
            .get("code")
            .and_then(Value::as_str)
            .or_else(|| result.as_str())
            .map(str::to_string)
            .ok_or_else(|| TransportError::Protocol(format!("pairing code missing in {result}")))
    }

    async fn send_text(&self, chat: &str, text: &str) -> Result<(), TransportError> {
        self.request(METHOD_SEND_TEXT, json!({ "chat": chat, "text": text }))
            .await
            .map(drop)
    }

    async fn logout(&self) -> Result<(), TransportError> {
        self.request(METHOD_LOGOUT, json!({})).await.map(drop)
    }

    fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.hub.clear();
        self.cancel.cancel();
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

impl Drop for GatewaySocket {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
