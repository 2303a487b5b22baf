//! Per-socket event dispatch.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures::future::join_all;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use tether_core::context::EventContext;
use tether_core::events::ProtocolEvent;
use tether_core::ids::ListenerId;
use tether_core::transport::{Listener, Socket};
use tokio::runtime::Handle;
use tracing::{debug, error, warn};

use crate::plugin::Plugin;
use crate::registry::PluginRegistry;

/// Counts from one [`Dispatcher::dispatch`] call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub invoked: usize,
    pub failed: usize,
}

/// Routes one socket's inbound events to registered plugins.
///
/// Holds no reference to the session that owns it, only to the registry and
/// the socket. Subscriptions follow the registry's per-event reference counts.
pub struct Dispatcher {
    registry: Arc<PluginRegistry>,
    socket: Arc<dyn Socket>,
    runtime: Handle,
    subscriptions: Mutex<HashMap<ProtocolEvent, ListenerId>>,
    alive: AtomicBool,
    this: Weak<Dispatcher>,
}

impl Dispatcher {
    /// Create an instance for `socket`, register it with the registry and
    /// subscribe to the currently active events.
    ///
    /// Must be called from within a tokio runtime.
    pub fn attach(registry: Arc<PluginRegistry>, socket: Arc<dyn Socket>) -> Arc<Self> {
        let dispatcher = Arc::new_cyclic(|this| Self {
            registry: Arc::clone(&registry),
            socket,
            runtime: Handle::current(),
            subscriptions: Mutex::new(HashMap::new()),
            alive: AtomicBool::new(true),
            this: this.clone(),
        });
        registry.attach(&dispatcher);
        dispatcher.resync();
        debug!(session_id = %dispatcher.socket.session_id(), "dispatcher attached");
        dispatcher
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn socket(&self) -> &Arc<dyn Socket> {
        &self.socket
    }

    pub fn subscribed_events(&self) -> Vec<ProtocolEvent> {
        let mut events: Vec<ProtocolEvent> = self.subscriptions.lock().keys().copied().collect();
        events.sort();
        events
    }

    /// Align socket subscriptions with the registry's active events.
    pub fn resync(&self) {
        let mut subscriptions = self.subscriptions.lock();
        if !self.is_alive() {
            return;
        }
        let active = self.registry.active_events();

        subscriptions.retain(|event, id| {
            if active.contains(event) {
                return true;
            }
            self.socket.unsubscribe(*event, *id);
            debug!(session_id = %self.socket.session_id(), %event, "unsubscribed");
            false
        });
        for event in active {
            if subscriptions.contains_key(&event) {
                continue;
            }
            let id = self.socket.subscribe(event, self.listener(event));
            subscriptions.insert(event, id);
            debug!(session_id = %self.socket.session_id(), %event, "subscribed");
        }
    }

    fn listener(&self, event: ProtocolEvent) -> Listener {
        let this = self.this.clone();
        let runtime = self.runtime.clone();
        Arc::new(move |payload: Value| {
            let Some(dispatcher) = this.upgrade().filter(|d| d.is_alive()) else {
                return;
            };
            let ctx = EventContext::from_payload(dispatcher.socket.session_id(), event, payload);
            runtime.spawn(async move {
                dispatcher.dispatch(event, ctx).await;
            });
        })
    }

    /// Run every unconditional plugin for `event`, then every conditioned
    /// plugin whose matcher accepts the context text. Invocations start in
    /// registration order and are isolated from each other.
    pub async fn dispatch(&self, event: ProtocolEvent, ctx: EventContext) -> DispatchReport {
        let bucket = self.registry.bucket(event);
        let mut calls: Vec<(Arc<Plugin>, EventContext)> = bucket
            .unconditional
            .into_iter()
            .map(|plugin| (plugin, ctx.clone()))
            .collect();
        if let Some(text) = ctx.text() {
            for plugin in bucket.conditioned {
                let matched = plugin.matcher.as_ref().and_then(|m| m.matches(text));
                if let Some(matched) = matched {
                    let extended = ctx.with_match(matched);
                    calls.push((plugin, extended));
                }
            }
        }
        if calls.is_empty() {
            return DispatchReport::default();
        }

        let outcomes = join_all(
            calls
                .iter()
                .map(|(plugin, ctx)| self.invoke(plugin, ctx, event)),
        )
        .await;
        let report = DispatchReport {
            invoked: outcomes.len(),
            failed: outcomes.iter().filter(|ok| !**ok).count(),
        };
        debug!(
            session_id = %ctx.session_id,
            %event,
            invoked = report.invoked,
            failed = report.failed,
            "event dispatched"
        );
        report
    }

    async fn invoke(&self, plugin: &Plugin, ctx: &EventContext, event: ProtocolEvent) -> bool {
        let call = AssertUnwindSafe(plugin.handler.invoke(&self.socket, ctx, event));
        match call.catch_unwind().await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(
                    plugin_id = %plugin.id,
                    session_id = %ctx.session_id,
                    %event,
                    error = %e,
                    "plugin failed"
                );
                false
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(
                    plugin_id = %plugin.id,
                    session_id = %ctx.session_id,
                    %event,
                    panic = %message,
                    "plugin panicked"
                );
                false
            }
        }
    }

    /// Unsubscribe everything and leave the registry. Idempotent.
    pub fn release(&self) {
        {
            let mut subscriptions = self.subscriptions.lock();
            if !self.alive.swap(false, Ordering::SeqCst) {
                return;
            }
            for (event, id) in subscriptions.drain() {
                self.socket.unsubscribe(event, id);
            }
        }
        self.registry.detach(self);
        debug!(session_id = %self.socket.session_id(), "dispatcher released");
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("session_id", &self.socket.session_id())
            .field("alive", &self.is_alive())
            .field("subscriptions", &self.subscribed_events())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use serde_json::json;
    use tether_core::context::{MatchResult, Matched};
    use tether_core::ids::{PluginId, SessionId};
    use tether_core::mock::MockSocket;
    use tokio::sync::mpsc;

    use crate::error::PluginError;
    use crate::matcher::{Matcher, PrefixPolicy, Trigger};
    use crate::plugin::handler_fn;

    const UPSERT: ProtocolEvent = ProtocolEvent::MessagesUpsert;

    fn setup() -> (Arc<PluginRegistry>, Arc<MockSocket>, Arc<dyn Socket>) {
        let mock = Arc::new(MockSocket::new(SessionId::new(1)));
        let socket: Arc<dyn Socket> = mock.clone();
        (PluginRegistry::new(), mock, socket)
    }

    fn counting(id: &str, events: &[ProtocolEvent], counter: &Arc<AtomicUsize>) -> Plugin {
        let counter = Arc::clone(counter);
        Plugin::new(
            PluginId::from_raw(id),
            handler_fn(move |_, _, _| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
            events.to_vec(),
        )
        .with_source(format!("/p/{id}.json"))
    }

    fn command(literal: &str) -> Option<Matcher> {
        Matcher::compile(
            vec![Trigger::Literal(literal.into())],
            &PrefixPolicy::Explicit(vec!['!']),
            &[],
        )
    }

    fn ctx(text: &str) -> EventContext {
        EventContext::from_payload(SessionId::new(1), UPSERT, json!({"chat": "room", "text": text}))
    }

    #[tokio::test]
    async fn subscribes_only_to_active_events() {
        let (registry, mock, socket) = setup();
        let counter = Arc::new(AtomicUsize::new(0));
        registry.register(counting("a", &[UPSERT], &counter));

        let dispatcher = Dispatcher::attach(Arc::clone(&registry), socket);
        assert_eq!(mock.subscribed_events(), vec![UPSERT]);
        assert_eq!(registry.instance_count(), 1);

        registry.register(counting("b", &[ProtocolEvent::Call], &counter));
        assert_eq!(mock.subscribed_events(), vec![UPSERT, ProtocolEvent::Call]);
        assert_eq!(dispatcher.subscribed_events(), vec![UPSERT, ProtocolEvent::Call]);

        registry.unregister(&PluginId::from_raw("a"));
        assert_eq!(mock.subscribed_events(), vec![ProtocolEvent::Call]);
        assert_eq!(mock.listener_count(UPSERT), 0);
    }

    #[tokio::test]
    async fn resync_never_double_subscribes() {
        let (registry, mock, socket) = setup();
        let counter = Arc::new(AtomicUsize::new(0));
        registry.register(counting("a", &[UPSERT], &counter));
        let dispatcher = Dispatcher::attach(Arc::clone(&registry), socket);
        registry.register(counting("b", &[UPSERT], &counter));
        dispatcher.resync();
        assert_eq!(mock.listener_count(UPSERT), 1);
    }

    #[tokio::test]
    async fn unconditional_then_conditioned_with_match() {
        let (registry, _mock, socket) = setup();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let seen = |label: &'static str, tx: mpsc::UnboundedSender<(&'static str, Option<MatchResult>)>| {
            handler_fn(move |_, ctx: EventContext, _| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send((label, ctx.matched));
                    Ok(())
                }
            })
        };
        registry.register(Plugin::new(PluginId::from_raw("all"), seen("all", tx.clone()), vec![UPSERT]));
        registry.register(
            Plugin::new(PluginId::from_raw("help"), seen("help", tx.clone()), vec![UPSERT])
                .with_matcher(command("help")),
        );
        registry.register(
            Plugin::new(PluginId::from_raw("ban"), seen("ban", tx), vec![UPSERT])
                .with_matcher(command("ban")),
        );

        let dispatcher = Dispatcher::attach(Arc::clone(&registry), socket);
        let report = dispatcher.dispatch(UPSERT, ctx("!help me")).await;
        assert_eq!(report, DispatchReport { invoked: 2, failed: 0 });

        assert_eq!(rx.recv().await.unwrap(), ("all", None));
        let (label, matched) = rx.recv().await.unwrap();
        assert_eq!(label, "help");
        let matched = matched.unwrap();
        assert_eq!(matched.matched, Matched::Literal("help".into()));
        assert_eq!(matched.prefix, Some('!'));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn conditioned_plugins_need_text() {
        let (registry, _mock, socket) = setup();
        let counter = Arc::new(AtomicUsize::new(0));
        registry.register(counting("help", &[UPSERT], &counter).with_matcher(command("help")));
        let dispatcher = Dispatcher::attach(Arc::clone(&registry), socket);

        let no_text = EventContext::from_payload(SessionId::new(1), UPSERT, json!({"chat": "room"}));
        assert_eq!(dispatcher.dispatch(UPSERT, no_text).await.invoked, 0);
        assert_eq!(dispatcher.dispatch(UPSERT, ctx("help")).await.invoked, 0);
        assert_eq!(dispatcher.dispatch(UPSERT, ctx("!help")).await.invoked, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_plugins_never_block_siblings() {
        let (registry, _mock, socket) = setup();
        let counter = Arc::new(AtomicUsize::new(0));
        registry.register(Plugin::new(
            PluginId::from_raw("broken"),
            handler_fn(|_, _, _| async { Err(PluginError::Handler("always".into())) }),
            vec![UPSERT],
        ));
        registry.register(Plugin::new(
            PluginId::from_raw("panics"),
            handler_fn(|_, _, _| async {
                let explode = true;
                if explode {
                    panic!("boom");
                }
                Ok(())
            }),
            vec![UPSERT],
        ));
        registry.register(counting("sibling", &[UPSERT], &counter));

        let dispatcher = Dispatcher::attach(Arc::clone(&registry), socket);
        for _ in 0..3 {
            let report = dispatcher.dispatch(UPSERT, ctx("hello")).await;
            assert_eq!(report, DispatchReport { invoked: 3, failed: 2 });
        }
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(dispatcher.is_alive());
    }

    #[tokio::test]
    async fn socket_events_reach_plugins() {
        let (registry, mock, socket) = setup();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(Plugin::new(
            PluginId::from_raw("tap"),
            handler_fn(move |_, ctx: EventContext, event| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send((event, ctx.text));
                    Ok(())
                }
            }),
            vec![UPSERT],
        ));
        let _dispatcher = Dispatcher::attach(Arc::clone(&registry), socket);

        assert_eq!(mock.emit(UPSERT, &json!({"chat": "room", "text": "hi"})), 1);
        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, (UPSERT, Some("hi".to_string())));
    }

    #[tokio::test]
    async fn release_unsubscribes_and_detaches() {
        let (registry, mock, socket) = setup();
        let counter = Arc::new(AtomicUsize::new(0));
        registry.register(counting("a", &[UPSERT], &counter));
        let dispatcher = Dispatcher::attach(Arc::clone(&registry), socket);

        dispatcher.release();
        dispatcher.release();
        assert!(!dispatcher.is_alive());
        assert!(mock.subscribed_events().is_empty());
        assert_eq!(registry.instance_count(), 0);

        registry.register(counting("b", &[ProtocolEvent::Call], &counter));
        assert!(mock.subscribed_events().is_empty());
    }

    #[tokio::test]
    async fn dropped_dispatchers_are_pruned() {
        let (registry, mock, socket) = setup();
        let counter = Arc::new(AtomicUsize::new(0));
        let dispatcher = Dispatcher::attach(Arc::clone(&registry), socket);
        drop(dispatcher);
        registry.register(counting("a", &[UPSERT], &counter));
        assert_eq!(registry.instance_count(), 0);
        // The stale listener is never installed.
        assert!(mock.subscribed_events().is_empty());
    }
}
