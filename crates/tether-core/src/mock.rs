//! Scriptable in-process transport for deterministic tests without a gateway.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, Notify};

use crate::errors::TransportError;
use crate::events::ProtocolEvent;
use crate::ids::{ListenerId, SessionId};
use crate::transport::{
    AuthState, Connection, EventHub, Lifecycle, Listener, Socket, Transport, TransportConfig,
};

/// Pairing code every [`MockSocket`] hands out.
pub const MOCK_PAIRING_CODE: &str = "TETH-3R01";

/// Handle to one socket the mock transport created.
#[derive(Clone)]
pub struct MockConnection {
    pub auth: AuthState,
    pub config: TransportConfig,
    pub socket: Arc<MockSocket>,
    lifecycle: mpsc::Sender<Lifecycle>,
}

impl MockConnection {
    pub async fn send(&self, event: Lifecycle) {
        let _ = self.lifecycle.send(event).await;
    }

    pub async fn open(&self) {
        self.send(Lifecycle::Open).await;
    }

    pub async fn close(&self, status_code: u16) {
        self.send(Lifecycle::Close {
            status_code: Some(status_code),
            message: format!("mock close {status_code}"),
        })
        .await;
    }

    pub async fn offer_pairing(&self, payload: &str) {
        self.send(Lifecycle::PairingOffer(payload.to_string())).await;
    }
}

#[derive(Default)]
struct MockState {
    connections: Vec<MockConnection>,
    failures: VecDeque<TransportError>,
    script: Vec<Lifecycle>,
}

/// Transport that hands out [`MockSocket`]s and records every connect attempt.
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
    attempts: AtomicUsize,
    notify: Notify,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every connect immediately emits `Open`.
    pub fn auto_open() -> Self {
        Self::with_script(vec![Lifecycle::Open])
    }

    /// Every connect immediately emits the given lifecycle events, in order.
    pub fn with_script(script: Vec<Lifecycle>) -> Self {
        let transport = Self::default();
        transport.state.lock().script = script;
        transport
    }

    /// Make the next connect attempt fail with `error`.
    pub fn fail_next(&self, error: TransportError) {
        self.state.lock().failures.push_back(error);
    }

    /// Connect attempts, failed ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Sockets successfully created.
    pub fn connect_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    pub fn connection(&self, index: usize) -> Option<MockConnection> {
        self.state.lock().connections.get(index).cloned()
    }

    pub fn last_connection(&self) -> Option<MockConnection> {
        self.state.lock().connections.last().cloned()
    }

    /// Wait until at least `n` connect attempts have been made.
    pub async fn wait_for_attempts(&self, n: usize) {
        loop {
            let notified = self.notify.notified();
            if self.attempts() >= n {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        &self,
        auth: AuthState,
        config: &TransportConfig,
    ) -> Result<Connection, TransportError> {
        let result = {
            let mut state = self.state.lock();
            if let Some(error) = state.failures.pop_front() {
                Err(error)
            } else {
                let (tx, rx) = mpsc::channel(32);
                for event in &state.script {
                    let _ = tx.try_send(event.clone());
                }
                let socket = Arc::new(MockSocket::new(auth.session_id));
                state.connections.push(MockConnection {
                    auth,
                    config: config.clone(),
                    socket: Arc::clone(&socket),
                    lifecycle: tx,
                });
                Ok(Connection {
                    socket,
                    lifecycle: rx,
                })
            }
        };
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
        result
    }
}

/// Socket that records outbound traffic and lets tests inject events.
pub struct MockSocket {
    session_id: SessionId,
    hub: EventHub,
    alive: AtomicBool,
    logged_out: AtomicBool,
    sent: Mutex<Vec<(String, String)>>,
    pairing_requests: Mutex<Vec<String>>,
}

impl MockSocket {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            hub: EventHub::new(),
            alive: AtomicBool::new(true),
            logged_out: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            pairing_requests: Mutex::new(Vec::new()),
        }
    }

    /// Deliver an inbound event to subscribed listeners. Dead sockets deliver nothing.
    pub fn emit(&self, event: ProtocolEvent, payload: &Value) -> usize {
        if !self.is_alive() {
            return 0;
        }
        self.hub.emit(event, payload)
    }

    pub fn subscribed_events(&self) -> Vec<ProtocolEvent> {
        self.hub.subscribed_events()
    }

    pub fn listener_count(&self, event: ProtocolEvent) -> usize {
        self.hub.listener_count(event)
    }

    /// `(chat, text)` pairs passed to `send_text`.
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().clone()
    }

    pub fn pairing_requests(&self) -> Vec<String> {
        self.pairing_requests.lock().clone()
    }

    pub fn logged_out(&self) -> bool {
        self.logged_out.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Socket for MockSocket {
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
        if !self.is_alive() {
            return Err(TransportError::Closed);
        }
        self.pairing_requests.lock().push(phone.to_string());
        Ok(MOCK_PAIRING_CODE.to_string())
    }

    async fn send_text(&self, chat: &str, text: &str) -> Result<(), TransportError> {
        if !self.is_alive() {
            return Err(TransportError::Closed);
        }
        self.sent.lock().push((chat.to_string(), text.to_string()));
        Ok(())
    }

    async fn logout(&self) -> Result<(), TransportError> {
        self.logged_out.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}
