//! Lifecycle hooks.
//!
//! One slot per [`HookPoint`]. Hooks run on a per-client worker task, after
//! the transition that fired them has been committed, in transition order. A
//! failing or panicking hook is logged and ignored.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tether_core::errors::DisconnectReason;
use tether_core::ids::SessionId;
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::state::ConnectionState;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HookPoint {
    Connect,
    Reconnect,
    Disconnect,
    StateChange,
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connect => "connect",
            Self::Reconnect => "reconnect",
            Self::Disconnect => "disconnect",
            Self::StateChange => "state_change",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HookEvent {
    Connect {
        session_id: SessionId,
    },
    Reconnect {
        session_id: SessionId,
        attempts: u32,
    },
    Disconnect {
        session_id: SessionId,
        reason: DisconnectReason,
        status_code: Option<u16>,
    },
    StateChange {
        session_id: SessionId,
        from: ConnectionState,
        to: ConnectionState,
    },
}

impl HookEvent {
    pub fn point(&self) -> HookPoint {
        match self {
            Self::Connect { .. } => HookPoint::Connect,
            Self::Reconnect { .. } => HookPoint::Reconnect,
            Self::Disconnect { .. } => HookPoint::Disconnect,
            Self::StateChange { .. } => HookPoint::StateChange,
        }
    }

    pub fn session_id(&self) -> SessionId {
        match self {
            Self::Connect { session_id }
            | Self::Reconnect { session_id, .. }
            | Self::Disconnect { session_id, .. }
            | Self::StateChange { session_id, .. } => *session_id,
        }
    }
}

pub type HookFn = Arc<dyn Fn(HookEvent) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Hook registrations for one client.
#[derive(Clone, Default)]
pub struct Hooks {
    slots: HashMap<HookPoint, HookFn>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fill the slot for `point`, replacing any previous hook.
    #[must_use]
    pub fn on<F, Fut>(mut self, point: HookPoint, hook: F) -> Self
    where
        F: Fn(HookEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.slots
            .insert(point, Arc::new(move |event| Box::pin(hook(event))));
        self
    }

    pub fn get(&self, point: HookPoint) -> Option<&HookFn> {
        self.slots.get(&point)
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.slots.keys()).finish()
    }
}

/// Sequential hook runner owned by a client.
pub(crate) struct HookWorker {
    tx: Option<mpsc::UnboundedSender<HookEvent>>,
}

impl HookWorker {
    pub(crate) fn spawn(hooks: Hooks) -> Self {
        if hooks.is_empty() {
            return Self { tx: None };
        }
        let (tx, mut rx) = mpsc::unbounded_channel::<HookEvent>();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(hook) = hooks.get(event.point()).cloned() else {
                    continue;
                };
                let point = event.point();
                let session_id = event.session_id();
                let call = AssertUnwindSafe(async move { hook(event).await });
                match call.catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(%session_id, hook = %point, error = %e, "lifecycle hook failed"),
                    Err(_) => error!(%session_id, hook = %point, "lifecycle hook panicked"),
                }
            }
        });
        Self { tx: Some(tx) }
    }

    pub(crate) fn fire(&self, event: HookEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[tokio::test]
    async fn hooks_run_in_order_and_survive_failures() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let record = Arc::clone(&seen);
        let hooks = Hooks::new()
            .on(HookPoint::Connect, |_| async { anyhow::bail!("nope") })
            .on(HookPoint::Reconnect, |_| async {
                let explode = true;
                if explode {
                    panic!("hook panic");
                }
                Ok(())
            })
            .on(HookPoint::StateChange, move |event| {
                let record = Arc::clone(&record);
                let done = done_tx.clone();
                async move {
                    record.lock().push(event);
                    let _ = done.send(());
                    Ok(())
                }
            });
        let worker = HookWorker::spawn(hooks);
        let id = SessionId::new(1);

        worker.fire(HookEvent::Connect { session_id: id });
        worker.fire(HookEvent::Reconnect { session_id: id, attempts: 2 });
        worker.fire(HookEvent::StateChange {
            session_id: id,
            from: ConnectionState::Disconnected,
            to: ConnectionState::Connecting,
        });
        worker.fire(HookEvent::Disconnect {
            session_id: id,
            reason: DisconnectReason::ConnectionLost,
            status_code: Some(408),
        });
        worker.fire(HookEvent::StateChange {
            session_id: id,
            from: ConnectionState::Connecting,
            to: ConnectionState::Connected,
        });

        done_rx.recv().await.unwrap();
        done_rx.recv().await.unwrap();
        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(matches!(
            seen[1],
            HookEvent::StateChange { to: ConnectionState::Connected, .. }
        ));
    }

    #[test]
    fn empty_hooks_spawn_nothing() {
        let worker = HookWorker::spawn(Hooks::new());
        assert!(worker.tx.is_none());
        worker.fire(HookEvent::Connect { session_id: SessionId::new(1) });
    }
}
