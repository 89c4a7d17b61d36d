use rtc_signaling::SignalingError;
use thiserror::Error;

/// Errors surfaced by the bind and its endpoints.
///
/// `Clone` so the error captured by a failed connection attempt can be
/// returned to every sender that waited on that attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BindError {
    #[error("bind is closed")]
    Closed,
    #[error("bind is already open")]
    AlreadyOpen,
    #[error("endpoint is not an rtc-bind endpoint")]
    EndpointImpl,
    #[error("endpoint data channel is not ready")]
    NotReady,
    #[error("first message initiator is required in sdp session information")]
    InitiatorRequired,
    #[error("first message responder is required in sdp session information")]
    ResponderRequired,
    #[error("invalid piggyback payload: {0}")]
    Piggyback(String),
    #[error("signaling failed: {0}")]
    Signaling(String),
    #[error("data channel did not open in time")]
    Timeout,
    #[error("data channel state is closed")]
    DataChannelClosed,
    #[error("peer stopped answering liveness probes")]
    Stale,
    #[error("transport setup failed: {0}")]
    Setup(String),
}

impl From<SignalingError> for BindError {
    fn from(err: SignalingError) -> Self {
        BindError::Signaling(err.to_string())
    }
}

pub type BindResult<T> = Result<T, BindError>;

pub(crate) fn to_setup_error<E: std::fmt::Display>(err: E) -> BindError {
    BindError::Setup(err.to_string())
}
