use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tether_core::errors::TransportError;
use tether_core::events::ProtocolEvent;
use tether_core::ids::SessionId;
use tether_core::transport::{AuthState, Connection, EventHub, Lifecycle, Transport, TransportConfig};
use tether_settings::GatewaySettings;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::frame::{ClientFrame, ServerFrame};
use crate::socket::{Command, GatewaySocket, ReplyTx};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects sessions through a WebSocket gateway.
#[derive(Clone, Debug)]
pub struct GatewayTransport {
    url: String,
    request_timeout: Duration,
}

impl GatewayTransport {
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            request_timeout,
        }
    }

    pub fn from_settings(settings: &GatewaySettings) -> Self {
        Self::new(
            settings.url.clone(),
            Duration::from_millis(settings.request_timeout_ms),
        )
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn handshake_error(e: tungstenite::Error) -> TransportError {
    let status_code = match &e {
        tungstenite::Error::Http(response) => Some(response.status().as_u16()),
        _ => None,
    };
    TransportError::Connect {
        message: e.to_string(),
        status_code,
    }
}

#[async_trait]
impl Transport for GatewayTransport {
    async fn connect(
        &self,
        auth: AuthState,
        config: &TransportConfig,
    ) -> Result<Connection, TransportError> {
        let (ws, _) = tokio::time::timeout(config.connect_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| TransportError::Timeout(format!("connect to {}", self.url)))?
            .map_err(handshake_error)?;
        let (mut sink, stream) = ws.split();

        let hello = ClientFrame::Hello {
            session: auth.session_id,
            credentials: auth.credentials.as_ref(),
        }
        .encode()?;
        sink.send(Message::Text(hello.into()))
            .await
            .map_err(handshake_error)?;

        let (lifecycle_tx, lifecycle_rx) = mpsc::channel(32);
        let (commands_tx, commands_rx) = mpsc::channel(64);
        let hub = Arc::new(EventHub::new());
        let alive = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();

        let link = Link {
            session_id: auth.session_id,
            sink,
            hub: Arc::clone(&hub),
            lifecycle: lifecycle_tx,
            pending: HashMap::new(),
            next_id: 1,
        };
        tokio::spawn(link.run(stream, commands_rx, Arc::clone(&alive), cancel.clone()));
        info!(session_id = %auth.session_id, url = %self.url, silent = config.silent, "gateway connected");

        let socket = GatewaySocket::new(
            auth.session_id,
            hub,
            commands_tx,
            alive,
            cancel,
            self.request_timeout,
        );
        Ok(Connection {
            socket: Arc::new(socket),
            lifecycle: lifecycle_rx,
        })
    }
}

/// Connection task state.
struct Link {
    session_id: SessionId,
    sink: SplitSink<WsStream, Message>,
    hub: Arc<EventHub>,
    lifecycle: mpsc::Sender<Lifecycle>,
    pending: HashMap<u64, ReplyTx>,
    next_id: u64,
}

impl Link {
    async fn run(
        mut self,
        mut stream: SplitStream<WsStream>,
        mut commands: mpsc::Receiver<Command>,
        alive: Arc<AtomicBool>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    let _ = self.sink.send(Message::Close(None)).await;
                    break;
                }
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    if !self.send_request(command).await {
                        break;
                    }
                }
                message = stream.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => self.on_text(text.as_str()).await,
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(session_id = %self.session_id, error = %e, "gateway read failed");
                            break;
                        }
                    }
                }
            }
        }

        alive.store(false, Ordering::SeqCst);
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(TransportError::Closed));
        }
        debug!(session_id = %self.session_id, "gateway connection ended");
    }

    /// `false` when the socket can no longer be written.
    async fn send_request(&mut self, command: Command) -> bool {
        let id = self.next_id;
        self.next_id += 1;
        let frame = ClientFrame::Request {
            id,
            method: command.method,
            params: command.params,
        };
        let text = match frame.encode() {
            Ok(text) => text,
            Err(e) => {
                let _ = command.reply.send(Err(e));
                return true;
            }
        };
        self.pending.insert(id, command.reply);
        match self.sink.send(Message::Text(text.into())).await {
            Ok(()) => true,
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "gateway write failed");
                false
            }
        }
    }

    async fn on_text(&mut self, text: &str) {
        let frame = match ServerFrame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "undecodable gateway frame");
                return;
            }
        };
        match frame {
            ServerFrame::Response { id, result, error } => {
                let Some(reply) = self.pending.remove(&id) else {
                    debug!(session_id = %self.session_id, id, "response for unknown request");
                    return;
                };
                let outcome = match error {
                    Some(error) => Err(TransportError::Request(error.message)),
                    None => Ok(result),
                };
                let _ = reply.send(outcome);
            }
            ServerFrame::Event { event, payload } => match event.parse::<ProtocolEvent>() {
                Ok(event) => {
                    self.hub.emit(event, &payload);
                }
                Err(_) => debug!(session_id = %self.session_id, event = %event, "ignoring unknown event"),
            },
            other => {
                if let Some(lifecycle) = other.into_lifecycle() {
                    let _ = self.lifecycle.send(lifecycle).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::future::Future;
    use tether_core::transport::Socket;
    use tokio::net::TcpListener;

    type ServerWs = WebSocketStream<TcpStream>;

    async fn serve<F, Fut>(handler: F) -> GatewayTransport
    where
        F: FnOnce(ServerWs) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            handler(ws).await;
        });
        GatewayTransport::new(format!("ws://{addr}"), Duration::from_secs(5))
    }

    async fn next_json(ws: &mut ServerWs) -> Value {
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
                Message::Close(_) => panic!("client closed"),
                _ => {}
            }
        }
    }

    async fn push(ws: &mut ServerWs, value: Value) {
        ws.send(Message::Text(value.to_string().into())).await.unwrap();
    }

    fn auth(id: u64) -> AuthState {
        AuthState {
            session_id: SessionId::new(id),
            credentials: Some(json!({ "token": "abc" })),
        }
    }

    #[tokio::test]
    async fn hello_then_lifecycle_and_events() {
        let (hello_tx, hello_rx) = tokio::sync::oneshot::channel();
        let (go_tx, go_rx) = tokio::sync::oneshot::channel::<()>();
        let transport = serve(|mut ws| async move {
            let _ = hello_tx.send(next_json(&mut ws).await);
            let _ = go_rx.await;
            push(&mut ws, json!({ "type": "open" })).await;
            push(
                &mut ws,
                json!({ "type": "event", "event": "messages.upsert", "payload": { "text": "hi" } }),
            )
            .await;
            push(&mut ws, json!({ "type": "close", "statusCode": 428, "message": "bye" })).await;
            // Keep the socket open until the client hangs up.
            while ws.next().await.is_some() {}
        })
        .await;

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let mut connection = transport
            .connect(auth(5), &TransportConfig::default())
            .await
            .unwrap();
        connection.socket.subscribe(
            ProtocolEvent::MessagesUpsert,
            Arc::new(move |payload| {
                let _ = seen_tx.send(payload);
            }),
        );
        let _ = go_tx.send(());

        assert_eq!(
            hello_rx.await.unwrap(),
            json!({ "type": "hello", "session": 5, "credentials": { "token": "abc" } })
        );
        assert_eq!(connection.lifecycle.recv().await, Some(Lifecycle::Open));
        assert_eq!(
            connection.lifecycle.recv().await,
            Some(Lifecycle::Close {
                status_code: Some(428),
                message: "bye".into(),
            })
        );
        assert_eq!(seen_rx.recv().await.unwrap(), json!({ "text": "hi" }));
        connection.socket.close();
        assert!(!connection.socket.is_alive());
    }

    #[tokio::test]
    async fn requests_are_matched_by_id() {
        let transport = serve(|mut ws| async move {
            let _hello = next_json(&mut ws).await;
            let first = next_json(&mut ws).await;
            assert_eq!(first["method"], "pairingCode");
            assert_eq!(first["params"]["phone"], "1555");
            let second = next_json(&mut ws).await;
            assert_eq!(second["method"], "sendText");
            // Answer out of order.
            push(
                &mut ws,
                json!({ "type": "response", "id": second["id"], "error": { "message": "no such chat" } }),
            )
            .await;
            push(
                &mut ws,
                json!({ "type": "response", "id": first["id"], "result": { "code": "ABCD-1234" } }),
            )
            .await;
            while ws.next().await.is_some() {}
        })
        .await;

        let connection = transport
            .connect(auth(1), &TransportConfig::default())
            .await
            .unwrap();
        let socket = Arc::clone(&connection.socket);
        let (code, sent) = tokio::join!(
            socket.request_pairing_code("1555"),
            async {
                tokio::task::yield_now().await;
                connection.socket.send_text("c1", "hello").await
            }
        );

        assert_eq!(code.unwrap(), "ABCD-1234");
        assert!(matches!(sent, Err(TransportError::Request(m)) if m == "no such chat"));
    }

    #[tokio::test]
    async fn server_hangup_ends_lifecycle_and_fails_requests() {
        let transport = serve(|mut ws| async move {
            let _hello = next_json(&mut ws).await;
            let _request = next_json(&mut ws).await;
            let _ = ws.close(None).await;
        })
        .await;

        let mut connection = transport
            .connect(auth(2), &TransportConfig::default())
            .await
            .unwrap();
        let result = connection.socket.logout().await;

        assert!(matches!(result, Err(TransportError::Closed)));
        assert_eq!(connection.lifecycle.recv().await, None);
        assert!(!connection.socket.is_alive());
    }

    #[tokio::test]
    async fn refused_connection_is_a_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = GatewayTransport::new(format!("ws://{addr}"), Duration::from_secs(1));
        let err = transport
            .connect(auth(3), &TransportConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Connect { status_code: None, .. }));
        assert_eq!(err.close_code(), tether_core::errors::DEFAULT_CLOSE_CODE);
    }
}
