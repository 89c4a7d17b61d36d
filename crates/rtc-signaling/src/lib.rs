//! Offer/answer exchange between two named endpoints.
//!
//! A [`Signaler`] sends offers to other endpoints ([`Signaler::handshake`])
//! and yields the offers addressed to itself as [`Session`]s
//! ([`Signaler::accept`]). Two transports are provided: [`local`] pairs
//! signalers through an in-process [`local::LocalRegistry`], and [`http`]
//! talks to a signaling server over HTTP with a server-push event stream.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

pub mod http;
pub mod local;

pub use http::HttpSignaler;
pub use local::{LocalRegistry, LocalSignaler};

/// Session description as exchanged on the wire: `{"type":"offer","sdp":"..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdpPayload {
    pub sdp: String,
    #[serde(rename = "type")]
    pub typ: String,
}

impl SdpPayload {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            typ: "offer".into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            typ: "answer".into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("endpoint {0} is not registered")]
    NotFound(String),
    #[error("endpoint {0} is not accepting sessions")]
    NotAccepting(String),
    #[error("offer rejected: {0}")]
    Rejected(String),
    #[error("session dropped without an answer")]
    Abandoned,
    #[error("signaling timed out")]
    Timeout,
    #[error("signaler closed")]
    Closed,
    #[error("signaler is already accepting sessions")]
    AlreadyAccepting,
    #[error("signaling request failed: {0}")]
    Http(String),
    #[error("server err. status: {status}. content: {body}")]
    Status { status: u16, body: String },
    #[error("invalid signaling payload: {0}")]
    Decode(String),
    #[error("invalid signaling url: {0}")]
    InvalidUrl(String),
}

pub type SignalingResult<T> = Result<T, SignalingError>;

/// One pending inbound offer. Exactly one of [`Session::resolve`] or
/// [`Session::reject`] is invoked; both consume the session.
#[async_trait]
pub trait Session: Send + Sync {
    fn description(&self) -> &SdpPayload;

    async fn resolve(self: Box<Self>, answer: SdpPayload) -> SignalingResult<()>;

    async fn reject(self: Box<Self>, reason: String);
}

#[async_trait]
pub trait Signaler: Send + Sync {
    /// Identifier other endpoints use to reach this signaler.
    fn local_id(&self) -> &str;

    /// Sends `offer` to `endpoint` and waits for its answer.
    ///
    /// Concurrent calls are allowed; calls for the same endpoint are not
    /// serialized here.
    async fn handshake(&self, endpoint: &str, offer: SdpPayload) -> SignalingResult<SdpPayload>;

    /// Stream of offers addressed to [`Signaler::local_id`], in arrival order.
    /// The stream ends when the signaler is closed.
    async fn accept(&self) -> SignalingResult<mpsc::Receiver<Box<dyn Session>>>;

    /// Ends the accept stream and releases transport resources. Idempotent.
    async fn close(&self) -> SignalingResult<()>;
}
