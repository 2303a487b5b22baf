//! Per-session connection state machine.
//!
//! Every transition runs under the client's async transition lock: `connect`,
//! the lifecycle pump, the reconnect timer and `disconnect` all take it, so no
//! two transitions of one session overlap. Each socket gets a generation
//! number; lifecycle notifications from an older socket are dropped.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use tether_core::errors::{
    ConnectionError, DisconnectReason, DEFAULT_CLOSE_CODE, LOST_CLOSE_CODE,
};
use tether_core::ids::SessionId;
use tether_core::transport::{AuthState, Lifecycle, Socket, TransportConfig};
use tether_plugins::Dispatcher;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::hooks::{HookEvent, HookWorker};
use crate::hub::{FlagGuard, HubInner};
use crate::options::ClientOptions;
use crate::pairing::{PairingCodeRequester, PairingMethod, PairingRequest};
use crate::state::ConnectionState;

type ConnectResult = Result<Arc<dyn Socket>, ConnectionError>;

struct PendingConnect {
    tx: oneshot::Sender<ConnectResult>,
    shared: Shared<BoxFuture<'static, ConnectResult>>,
}

impl PendingConnect {
    fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        let shared = rx
            .map(|received| received.unwrap_or(Err(ConnectionError::Aborted)))
            .boxed()
            .shared();
        Self { tx, shared }
    }

    fn settle(self, result: ConnectResult) {
        let _ = self.tx.send(result);
    }
}

#[derive(Default)]
struct Inner {
    state: ConnectionState,
    socket: Option<Arc<dyn Socket>>,
    dispatcher: Option<Arc<Dispatcher>>,
    generation: u64,
    attempts: u32,
    pending: Option<PendingConnect>,
    reconnect: Option<CancellationToken>,
    shutting_down: bool,
    has_connected_once: bool,
    pairing_method: Option<PairingMethod>,
    code_requested_for: Option<u64>,
    last_error: Option<ConnectionError>,
}

impl Inner {
    fn take_connection(&mut self) -> Released {
        Released {
            socket: self.socket.take(),
            dispatcher: self.dispatcher.take(),
        }
    }
}

/// Socket and dispatcher detached from a client, closed on [`Released::close`].
struct Released {
    socket: Option<Arc<dyn Socket>>,
    dispatcher: Option<Arc<Dispatcher>>,
}

impl Released {
    fn close(self) {
        if let Some(dispatcher) = self.dispatcher {
            dispatcher.release();
        }
        if let Some(socket) = self.socket {
            socket.close();
        }
    }
}

/// One session's connection lifecycle.
pub struct Client {
    id: SessionId,
    options: ClientOptions,
    hub: Arc<HubInner>,
    inner: Mutex<Inner>,
    transition: tokio::sync::Mutex<()>,
    hooks: HookWorker,
    this: Weak<Client>,
}

impl Client {
    pub(crate) fn new(id: SessionId, options: ClientOptions, hub: Arc<HubInner>) -> Arc<Self> {
        let hooks = HookWorker::spawn(options.hooks.clone());
        Arc::new_cyclic(|this| Self {
            id,
            options,
            hub,
            inner: Mutex::new(Inner::default()),
            transition: tokio::sync::Mutex::new(()),
            hooks,
            this: this.clone(),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Reconnect attempts since the last successful open.
    pub fn attempts(&self) -> u32 {
        self.inner.lock().attempts
    }

    pub fn socket(&self) -> Option<Arc<dyn Socket>> {
        self.inner.lock().socket.clone()
    }

    pub fn dispatcher(&self) -> Option<Arc<Dispatcher>> {
        self.inner.lock().dispatcher.clone()
    }

    pub fn has_connected_once(&self) -> bool {
        self.inner.lock().has_connected_once
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.lock().shutting_down
    }

    /// The error that last ended this client's lifecycle, if any.
    pub fn last_error(&self) -> Option<ConnectionError> {
        self.inner.lock().last_error.clone()
    }

    /// Connect, or join the connect already in flight.
    pub async fn connect(&self) -> ConnectResult {
        if self.is_shutting_down() {
            return Err(ConnectionError::ShuttingDown);
        }
        let waiter = {
            let _transition = self.transition.lock().await;
            if let Some(me) = self.this.upgrade() {
                if !self.hub.adopt(&me) {
                    warn!(session_id = %self.id, "session is owned by another client");
                    return Err(ConnectionError::Aborted);
                }
            }
            let (waiter, fresh) = {
                let mut inner = self.inner.lock();
                if inner.shutting_down {
                    return Err(ConnectionError::ShuttingDown);
                }
                if let Some(pending) = &inner.pending {
                    (pending.shared.clone(), false)
                } else {
                    if inner.state == ConnectionState::Connected {
                        if let Some(socket) = &inner.socket {
                            return Ok(Arc::clone(socket));
                        }
                    }
                    if let Some(token) = inner.reconnect.take() {
                        token.cancel();
                    }
                    let pending = PendingConnect::new();
                    let waiter = pending.shared.clone();
                    inner.pending = Some(pending);
                    inner.attempts = 0;
                    inner.last_error = None;
                    (waiter, true)
                }
            };
            if fresh {
                self.set_state(ConnectionState::Connecting);
                info!(session_id = %self.id, sync_mode = self.options.sync_mode, "connecting");
                self.create_socket().await;
            }
            waiter
        };
        waiter.await
    }

    /// Tear down the connection. Idempotent.
    pub async fn disconnect(&self) {
        let token = {
            let mut inner = self.inner.lock();
            inner.shutting_down = true;
            inner.reconnect.take()
        };
        if let Some(token) = token {
            token.cancel();
        }

        let _transition = self.transition.lock().await;
        let (released, pending) = {
            let mut inner = self.inner.lock();
            inner.generation += 1;
            if let Some(token) = inner.reconnect.take() {
                token.cancel();
            }
            (inner.take_connection(), inner.pending.take())
        };
        released.close();
        if let Some(pending) = pending {
            pending.settle(Err(ConnectionError::Aborted));
        }
        self.hub.sessions.unregister(self.id, self);
        self.set_state(ConnectionState::Disconnected);
        {
            let mut inner = self.inner.lock();
            inner.has_connected_once = false;
            inner.attempts = 0;
            inner.shutting_down = false;
        }
        self.hub.forget(self);
        info!(session_id = %self.id, "disconnected");
    }

    /// Deauthenticate, disconnect and delete the persisted session. Never fails.
    pub async fn logout(&self) {
        if let Some(socket) = self.socket() {
            if let Err(e) = socket.logout().await {
                warn!(session_id = %self.id, error = %e, "logout request failed");
            }
        }
        self.disconnect().await;
        if let Err(e) = self.hub.store.delete_session(self.id).await {
            warn!(session_id = %self.id, error = %e, "failed to delete session after logout");
        }
        info!(session_id = %self.id, "logged out");
    }

    fn set_state(&self, to: ConnectionState) {
        let from = std::mem::replace(&mut self.inner.lock().state, to);
        if from != to {
            debug!(session_id = %self.id, %from, %to, "state change");
            self.hooks.fire(HookEvent::StateChange {
                session_id: self.id,
                from,
                to,
            });
        }
    }

    /// Build a fresh socket. Caller holds the transition lock.
    async fn create_socket(&self) {
        let (generation, released) = {
            let mut inner = self.inner.lock();
            inner.generation += 1;
            (inner.generation, inner.take_connection())
        };
        released.close();

        let credentials = match self.hub.store.credentials(self.id).await {
            Ok(credentials) => credentials,
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "failed to load credentials");
                self.synthesize_close(generation, DEFAULT_CLOSE_CODE, e.to_string());
                return;
            }
        };
        let auth = AuthState {
            session_id: self.id,
            credentials,
        };
        let config = TransportConfig {
            silent: self.options.silent,
            ..self.hub.config.transport.clone()
        };
        match self.hub.transport.connect(auth, &config).await {
            Ok(connection) => {
                self.inner.lock().socket = Some(connection.socket);
                self.spawn_pump(generation, connection.lifecycle);
            }
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "socket creation failed");
                self.synthesize_close(generation, e.close_code(), e.to_string());
            }
        }
    }

    fn synthesize_close(&self, generation: u64, status_code: u16, message: String) {
        let this = self.this.clone();
        tokio::spawn(async move {
            if let Some(client) = this.upgrade() {
                client
                    .on_lifecycle(
                        generation,
                        Lifecycle::Close {
                            status_code: Some(status_code),
                            message,
                        },
                    )
                    .await;
            }
        });
    }

    fn spawn_pump(&self, generation: u64, mut lifecycle: mpsc::Receiver<Lifecycle>) {
        let this = self.this.clone();
        tokio::spawn(async move {
            while let Some(event) = lifecycle.recv().await {
                let Some(client) = this.upgrade() else {
                    return;
                };
                let closed = matches!(event, Lifecycle::Close { .. });
                client.on_lifecycle(generation, event).await;
                if closed {
                    return;
                }
            }
            if let Some(client) = this.upgrade() {
                let lost = Lifecycle::Close {
                    status_code: Some(LOST_CLOSE_CODE),
                    message: "lifecycle stream ended".into(),
                };
                client.on_lifecycle(generation, lost).await;
            }
        });
    }

    async fn on_lifecycle(&self, generation: u64, event: Lifecycle) {
        let _transition = self.transition.lock().await;
        let current = self.inner.lock().generation;
        if current != generation {
            debug!(session_id = %self.id, generation, current, "dropping stale lifecycle event");
            return;
        }
        match event {
            Lifecycle::PairingOffer(payload) => self.handle_pairing_offer(generation, payload),
            Lifecycle::Open => self.handle_open(),
            Lifecycle::Close {
                status_code,
                message,
            } => self.handle_close(status_code, message),
            Lifecycle::CredentialsUpdated(credentials) => {
                if let Err(e) = self.hub.store.save_credentials(self.id, credentials).await {
                    warn!(session_id = %self.id, error = %e, "failed to persist credentials");
                }
            }
        }
    }

    fn handle_pairing_offer(&self, generation: u64, payload: String) {
        if self.options.sync_mode {
            warn!(session_id = %self.id, "pairing required for background session, giving up");
            self.finalize(ConnectionError::PairingRequired);
            return;
        }
        let Some(socket) = self.socket() else {
            return;
        };
        if let Some(handler) = &self.options.pairing_handler {
            let request = PairingRequest {
                session_id: self.id,
                payload,
                requester: PairingCodeRequester::new(socket),
            };
            tokio::spawn(handler(request));
            return;
        }
        if self.options.silent {
            debug!(session_id = %self.id, "ignoring pairing offer in silent mode");
            return;
        }
        let Some(client) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move { client.prompt_pairing(generation, socket, payload).await });
    }

    async fn prompt_pairing(&self, generation: u64, socket: Arc<dyn Socket>, payload: String) {
        let Some(_configuring) = FlagGuard::try_acquire(&self.hub.configuring) else {
            debug!(session_id = %self.id, "another pairing prompt is active");
            return;
        };
        let prompt = &self.hub.prompt;
        let cached = self.inner.lock().pairing_method;
        let method = match cached {
            Some(method) => method,
            None => match prompt.choose_method(self.id).await {
                Ok(method) => {
                    self.inner.lock().pairing_method = Some(method);
                    method
                }
                Err(e) => {
                    warn!(session_id = %self.id, error = %e, "pairing prompt failed");
                    return;
                }
            },
        };

        match method {
            PairingMethod::Qr => prompt.show_qr(self.id, &payload),
            PairingMethod::Phone => {
                {
                    let mut inner = self.inner.lock();
                    if inner.code_requested_for == Some(generation) {
                        return;
                    }
                    inner.code_requested_for = Some(generation);
                }
                let phone = match prompt.phone_number(self.id).await {
                    Ok(phone) => phone,
                    Err(e) => {
                        warn!(session_id = %self.id, error = %e, "no phone number for pairing");
                        return;
                    }
                };
                match socket.request_pairing_code(&phone).await {
                    Ok(code) => prompt.show_code(self.id, &code),
                    Err(e) => warn!(session_id = %self.id, error = %e, "pairing code request failed"),
                }
            }
        }
    }

    fn handle_open(&self) {
        let Some(me) = self.this.upgrade() else {
            return;
        };
        let from = self.state();
        self.set_state(ConnectionState::Connected);
        self.hub.sessions.register(me);

        let socket = {
            let inner = self.inner.lock();
            let needs_dispatcher = inner.dispatcher.as_ref().is_none_or(|d| !d.is_alive());
            inner.socket.clone().filter(|_| needs_dispatcher)
        };
        if let Some(socket) = socket {
            let dispatcher = Dispatcher::attach(Arc::clone(&self.hub.plugins), socket);
            self.inner.lock().dispatcher = Some(dispatcher);
        }

        let first_open = from != ConnectionState::Reconnecting;
        let (attempts, pending, socket) = {
            let mut inner = self.inner.lock();
            if first_open {
                inner.has_connected_once = true;
            }
            let attempts = std::mem::take(&mut inner.attempts);
            (attempts, inner.pending.take(), inner.socket.clone())
        };
        if let (Some(pending), Some(socket)) = (pending, socket) {
            pending.settle(Ok(socket));
        }
        if !first_open {
            info!(session_id = %self.id, attempts, "reconnected");
            self.hooks.fire(HookEvent::Reconnect {
                session_id: self.id,
                attempts,
            });
            return;
        }

        info!(session_id = %self.id, "connected");
        self.hooks.fire(HookEvent::Connect { session_id: self.id });
        if !self.options.sync_mode && self.hub.config.sync.enabled {
            let hub = Arc::clone(&self.hub);
            let initiator = self.id;
            tokio::spawn(async move {
                crate::sync::sync_sessions(&hub, initiator).await;
            });
        }
    }

    fn handle_close(&self, status_code: Option<u16>, message: String) {
        let reason = DisconnectReason::classify(status_code);
        let recoverable = reason.is_recoverable();
        self.hub.sessions.unregister(self.id, self);
        info!(
            session_id = %self.id,
            status_code,
            %reason,
            recoverable,
            message = %message,
            "connection closed"
        );

        if reason.deletes_session() {
            let store = self.hub.store.clone();
            let id = self.id;
            tokio::spawn(async move {
                match store.delete_session(id).await {
                    Ok(removed) => info!(session_id = %id, removed, "deleted persisted session"),
                    Err(e) => warn!(session_id = %id, error = %e, "failed to delete persisted session"),
                }
            });
        }
        self.hooks.fire(HookEvent::Disconnect {
            session_id: self.id,
            reason,
            status_code,
        });

        if !recoverable || self.is_shutting_down() {
            self.finalize(ConnectionError::Closed {
                message,
                status_code,
                recoverable,
            });
            return;
        }
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&self) {
        let (attempt, connected_once, released) = {
            let mut inner = self.inner.lock();
            inner.attempts += 1;
            (inner.attempts, inner.has_connected_once, inner.take_connection())
        };
        released.close();
        if attempt > self.options.max_retries {
            self.finalize(ConnectionError::RetriesExhausted {
                attempts: self.options.max_retries,
            });
            return;
        }
        if connected_once {
            self.set_state(ConnectionState::Reconnecting);
        }

        let delay = (self.options.backoff)(attempt);
        let token = CancellationToken::new();
        if let Some(previous) = self.inner.lock().reconnect.replace(token.clone()) {
            previous.cancel();
        }
        info!(session_id = %self.id, attempt, ?delay, "scheduling reconnect");

        let this = self.this.clone();
        tokio::spawn(async move {
            if !Self::wait(&token, delay).await {
                return;
            }
            let Some(client) = this.upgrade() else {
                return;
            };
            let _transition = client.transition.lock().await;
            {
                let mut inner = client.inner.lock();
                if token.is_cancelled() || inner.shutting_down {
                    return;
                }
                inner.reconnect = None;
            }
            debug!(session_id = %client.id, attempt, "reconnecting");
            client.create_socket().await;
        });
    }

    /// `false` when cancelled before the delay elapsed.
    async fn wait(token: &CancellationToken, delay: Duration) -> bool {
        tokio::select! {
            () = token.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }

    /// End the lifecycle: release everything, settle the pending connect with `error`.
    fn finalize(&self, error: ConnectionError) {
        let (released, pending) = {
            let mut inner = self.inner.lock();
            inner.generation += 1;
            if let Some(token) = inner.reconnect.take() {
                token.cancel();
            }
            inner.last_error = Some(error.clone());
            (inner.take_connection(), inner.pending.take())
        };
        released.close();
        self.hub.sessions.unregister(self.id, self);
        self.set_state(ConnectionState::Disconnected);
        warn!(
            session_id = %self.id,
            error = %error,
            error_kind = error.error_kind(),
            "session ended"
        );
        match pending {
            Some(pending) => pending.settle(Err(error)),
            None => debug!(session_id = %self.id, "no pending connect to reject"),
        }
        self.hub.forget(self);
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("state", &inner.state)
            .field("attempts", &inner.attempts)
            .field("generation", &inner.generation)
            .finish_non_exhaustive()
    }
}
