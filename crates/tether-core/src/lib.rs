//! # tether-core
//!
//! Foundation types shared by every tether crate:
//!
//! - **Ids**: [`SessionId`](ids::SessionId), [`PluginId`](ids::PluginId),
//!   [`ListenerId`](ids::ListenerId)
//! - **Protocol vocabulary**: [`ProtocolEvent`](events::ProtocolEvent) and the
//!   per-event [`EventContext`](context::EventContext)
//! - **Errors**: connection/transport errors and the disconnect-reason table
//! - **Collaborators**: the [`Transport`](transport::Transport) /
//!   [`Socket`](transport::Socket) and [`KeyStore`](store::KeyStore) traits
//! - **Test doubles**: [`mock::MockTransport`] and [`store::MemoryKeyStore`]

#![deny(unsafe_code)]

pub mod context;
pub mod errors;
pub mod events;
pub mod ids;
pub mod mock;
pub mod store;
pub mod transport;

pub use context::{EventContext, MatchResult, Matched};
pub use errors::{ConnectionError, DisconnectReason, TransportError};
pub use events::ProtocolEvent;
pub use ids::{ListenerId, PluginId, SessionId};
pub use store::{KeyStore, StoreError};
pub use transport::{Lifecycle, Socket, Transport};
