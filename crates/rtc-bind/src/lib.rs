//! WireGuard-style datagram transport over WebRTC data channels.
//!
//! A [`Bind`] maps endpoint identifiers to peer sessions established on
//! demand through an [`rtc_signaling::Signaler`]. The first datagram of a
//! session rides inside the signaling offer and the peer's reply inside the
//! answer, so the tunnel handshake completes without waiting for a data
//! channel. Datagrams from every session are delivered through a single
//! [`PacketReceiver`].

mod bind;
pub mod classifier;
pub mod config;
pub mod endpoint;
mod engine;
pub mod error;
mod link;
pub mod liveness;
pub mod piggyback;

pub use bind::{BATCH_SIZE, Bind, PacketReceiver};
pub use classifier::{PacketClassifier, WireGuardClassifier};
pub use config::{BindConfig, IceTimeouts};
pub use endpoint::{Endpoint, Inbound, Outbound, Sender};
pub use error::{BindError, BindResult};
pub use link::DATA_CHANNEL_LABEL;
pub use liveness::{LIVENESS_CHANNEL_LABEL, LivenessConfig};
