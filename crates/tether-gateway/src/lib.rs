//! # tether-gateway
//!
//! [`Transport`](tether_core::Transport) over a WebSocket gateway speaking
//! JSON text frames. The gateway owns the protocol session itself; this crate
//! only relays lifecycle notifications, inbound events and request/response
//! calls.

#![deny(unsafe_code)]

pub mod frame;
pub mod socket;
pub mod transport;

pub use frame::{ClientFrame, ServerFrame};
pub use socket::GatewaySocket;
pub use transport::GatewayTransport;
