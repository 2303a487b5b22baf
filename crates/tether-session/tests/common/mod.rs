#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tether_core::ids::SessionId;
use tether_core::mock::MockTransport;
use tether_core::store::MemoryKeyStore;
use tether_plugins::PluginRegistry;
use tether_session::{
    ClientOptions, HookEvent, HookPoint, Hooks, HubConfig, PairingError, PairingMethod,
    PairingPrompt, SessionHub,
};
use tether_settings::SyncSettings;
use tether_store::SessionStore;
use tokio::sync::Notify;

pub struct Harness {
    pub transport: Arc<MockTransport>,
    pub store: SessionStore,
    pub plugins: Arc<PluginRegistry>,
    pub prompt: Arc<RecordingPrompt>,
    pub hub: SessionHub,
}

impl Harness {
    pub fn new(transport: MockTransport) -> Self {
        Self::build(transport, true, RecordingPrompt::new(PairingMethod::Qr))
    }

    /// Automatic background sync turned off.
    pub fn without_sync(transport: MockTransport) -> Self {
        Self::build(transport, false, RecordingPrompt::new(PairingMethod::Qr))
    }

    pub fn with_prompt(transport: MockTransport, prompt: RecordingPrompt) -> Self {
        Self::build(transport, false, prompt)
    }

    fn build(transport: MockTransport, sync: bool, prompt: RecordingPrompt) -> Self {
        let transport = Arc::new(transport);
        let store = SessionStore::new(Arc::new(MemoryKeyStore::new()));
        let plugins = PluginRegistry::new();
        let prompt = Arc::new(prompt);
        let config = HubConfig {
            sync: SyncSettings {
                enabled: sync,
                max_retries: 2,
            },
            ..HubConfig::default()
        };
        let hub = SessionHub::new(
            transport.clone(),
            store.clone(),
            Arc::clone(&plugins),
            prompt.clone(),
            config,
        );
        Self {
            transport,
            store,
            plugins,
            prompt,
            hub,
        }
    }

    pub async fn persist(&self, ids: &[u64]) {
        for id in ids {
            self.store
                .save_credentials(SessionId::new(*id), serde_json::json!({ "id": id }))
                .await
                .unwrap();
        }
    }
}

/// Options with a fast, fixed backoff.
pub fn fast_options() -> ClientOptions {
    ClientOptions::default().constant_backoff(Duration::from_millis(10))
}

/// Hooks that record every event they see.
pub fn recording_hooks() -> (Hooks, Arc<Mutex<Vec<HookEvent>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut hooks = Hooks::new();
    for point in [
        HookPoint::Connect,
        HookPoint::Reconnect,
        HookPoint::Disconnect,
        HookPoint::StateChange,
    ] {
        let seen = Arc::clone(&seen);
        hooks = hooks.on(point, move |event| {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().push(event);
                Ok(())
            }
        });
    }
    (hooks, seen)
}

/// Let spawned tasks run without crossing any reconnect deadline.
pub async fn settle() {
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        settle().await;
    }
    panic!("condition not reached");
}

pub struct RecordingPrompt {
    method: PairingMethod,
    gate: Option<Arc<Notify>>,
    pub choices: AtomicUsize,
    pub shown: Mutex<Vec<String>>,
}

impl RecordingPrompt {
    pub fn new(method: PairingMethod) -> Self {
        Self {
            method,
            gate: None,
            choices: AtomicUsize::new(0),
            shown: Mutex::new(Vec::new()),
        }
    }

    /// `choose_method` waits for a permit on `gate` before answering.
    pub fn gated(method: PairingMethod, gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new(method)
        }
    }

    pub fn choices(&self) -> usize {
        self.choices.load(Ordering::SeqCst)
    }

    pub fn shown(&self) -> Vec<String> {
        self.shown.lock().clone()
    }
}

#[async_trait]
impl PairingPrompt for RecordingPrompt {
    async fn choose_method(&self, _session_id: SessionId) -> Result<PairingMethod, PairingError> {
        self.choices.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        Ok(self.method)
    }

    async fn phone_number(&self, _session_id: SessionId) -> Result<String, PairingError> {
        Ok("15550001111".into())
    }

    fn show_qr(&self, _session_id: SessionId, payload: &str) {
        self.shown.lock().push(format!("qr:{payload}"));
    }

    fn show_code(&self, _session_id: SessionId, code: &str) {
        self.shown.lock().push(format!("code:{code}"));
    }
}
