//! # tether-session
//!
//! Connection lifecycle orchestration:
//!
//! - [`Client`]: per-session state machine (connect, pairing, close
//!   classification, reconnect with backoff)
//! - [`SessionHub`]: process-scoped table of live clients, the
//!   [`SessionRegistry`] and background restore of dormant sessions
//! - [`Hooks`]: one async, failure-isolated callback slot per [`HookPoint`]

#![deny(unsafe_code)]

pub mod backoff;
pub mod client;
pub mod hooks;
pub mod hub;
pub mod options;
pub mod pairing;
pub mod registry;
pub mod state;
pub mod sync;

pub use backoff::Backoff;
pub use client::Client;
pub use hooks::{HookEvent, HookFn, HookPoint, Hooks};
pub use hub::{Connected, HubConfig, SessionHub};
pub use options::ClientOptions;
pub use pairing::{
    pairing_handler, ConfiguredPrompt, PairingCodeRequester, PairingError, PairingHandler,
    PairingMethod, PairingPrompt, PairingRequest,
};
pub use registry::SessionRegistry;
pub use state::ConnectionState;
pub use sync::SyncReport;
