use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::errors::TransportError;
use crate::events::ProtocolEvent;
use crate::ids::{ListenerId, SessionId};

/// Callback invoked with the raw payload of a subscribed protocol event.
pub type Listener = Arc<dyn Fn(Value) + Send + Sync>;

/// Lifecycle notification emitted by a socket.
#[derive(Clone, Debug, PartialEq)]
pub enum Lifecycle {
    /// Credentials are missing; the payload is the QR/pairing reference.
    PairingOffer(String),
    Open,
    Close {
        status_code: Option<u16>,
        message: String,
    },
    /// The transport rotated credentials that must be persisted.
    CredentialsUpdated(Value),
}

/// Credentials handed to the transport when constructing a socket.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AuthState {
    pub session_id: SessionId,
    pub credentials: Option<Value>,
}

#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Suppress interactive output (QR payloads, banners).
    pub silent: bool,
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            silent: false,
            connect_timeout: Duration::from_secs(20),
        }
    }
}

/// A freshly constructed socket plus its lifecycle stream.
pub struct Connection {
    pub socket: Arc<dyn Socket>,
    pub lifecycle: mpsc::Receiver<Lifecycle>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("session_id", &self.socket.session_id())
            .finish_non_exhaustive()
    }
}

/// Socket factory.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        auth: AuthState,
        config: &TransportConfig,
    ) -> Result<Connection, TransportError>;
}

/// One live protocol socket.
#[async_trait]
pub trait Socket: Send + Sync {
    fn session_id(&self) -> SessionId;

    fn subscribe(&self, event: ProtocolEvent, listener: Listener) -> ListenerId;

    /// Returns `false` if the listener was not registered.
    fn unsubscribe(&self, event: ProtocolEvent, id: ListenerId) -> bool;

    async fn request_pairing_code(&self, phone: &str) -> Result<String, TransportError>;

    async fn send_text(&self, chat: &str, text: &str) -> Result<(), TransportError>;

    async fn logout(&self) -> Result<(), TransportError>;

    fn close(&self);

    fn is_alive(&self) -> bool;
}

/// Listener bookkeeping shared by socket implementations.
#[derive(Default)]
pub struct EventHub {
    listeners: RwLock<HashMap<ProtocolEvent, Vec<(ListenerId, Listener)>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, event: ProtocolEvent, listener: Listener) -> ListenerId {
        let id = ListenerId::next();
        self.listeners
            .write()
            .entry(event)
            .or_default()
            .push((id, listener));
        id
    }

    pub fn unsubscribe(&self, event: ProtocolEvent, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let Some(list) = listeners.get_mut(&event) else {
            return false;
        };
        let before = list.len();
        list.retain(|(lid, _)| *lid != id);
        let removed = list.len() != before;
        if list.is_empty() {
            listeners.remove(&event);
        }
        removed
    }

    /// Deliver a payload to every listener of `event`. Returns the number notified.
    pub fn emit(&self, event: ProtocolEvent, payload: &Value) -> usize {
        // Clone out so listeners may (un)subscribe re-entrantly.
        let targets: Vec<Listener> = self
            .listeners
            .read()
            .get(&event)
            .map(|list| list.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();
        for listener in &targets {
            listener(payload.clone());
        }
        targets.len()
    }

    pub fn listener_count(&self, event: ProtocolEvent) -> usize {
        self.listeners.read().get(&event).map_or(0, Vec::len)
    }

    pub fn subscribed_events(&self) -> Vec<ProtocolEvent> {
        let mut events: Vec<_> = self.listeners.read().keys().copied().collect();
        events.sort();
        events
    }

    pub fn clear(&self) {
        self.listeners.write().clear();
    }
}
