//! Heartbeat over a side data channel.
//!
//! The connecting side opens [`LIVENESS_CHANNEL_LABEL`] next to the data
//! channel and sends an 8-byte big-endian sequence number every
//! [`LivenessConfig::interval`]; the accepting side echoes every message back.
//! A connection whose echoes stop for [`LivenessConfig::timeout`] is reported
//! as [`LinkEvent::Stale`] so the link monitor can tear it down.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, trace, warn};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::peer_connection::RTCPeerConnection;

use crate::error::{BindResult, to_setup_error};
use crate::link::LinkEvent;

pub const LIVENESS_CHANNEL_LABEL: &str = "alive";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            timeout: Duration::from_secs(10),
        }
    }
}

struct EchoTracker {
    timeout: Duration,
    last_echo: Mutex<Instant>,
}

impl EchoTracker {
    fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_echo: Mutex::new(Instant::now()),
        }
    }

    fn record(&self, data: &[u8]) -> Option<u64> {
        let sequence = decode_sequence(data)?;
        *self.last_echo.lock() = Instant::now();
        Some(sequence)
    }

    /// Restarts the silence window, e.g. once the channel opens.
    fn reset(&self) {
        *self.last_echo.lock() = Instant::now();
    }

    fn is_stale(&self) -> bool {
        self.last_echo.lock().elapsed() > self.timeout
    }
}

fn decode_sequence(data: &[u8]) -> Option<u64> {
    let raw: [u8; 8] = data.try_into().ok()?;
    Some(u64::from_be_bytes(raw))
}

/// Opens the heartbeat channel on a connecting peer connection. Probing
/// starts when the channel opens and stops when it leaves the open state.
pub(crate) async fn create_prober(
    pc: &Arc<RTCPeerConnection>,
    config: LivenessConfig,
    endpoint_id: &str,
    events: mpsc::UnboundedSender<LinkEvent>,
) -> BindResult<()> {
    let init = RTCDataChannelInit {
        ordered: Some(false),
        ..Default::default()
    };
    let dc = pc
        .create_data_channel(LIVENESS_CHANNEL_LABEL, Some(init))
        .await
        .map_err(to_setup_error)?;

    let tracker = Arc::new(EchoTracker::new(config.timeout));
    let tracker_for_message = Arc::clone(&tracker);
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let tracker = Arc::clone(&tracker_for_message);
        Box::pin(async move {
            if let Some(sequence) = tracker.record(&msg.data) {
                trace!(target = "webrtc", sequence, "liveness echo");
            }
        })
    }));

    let weak_dc = Arc::downgrade(&dc);
    let endpoint_id = endpoint_id.to_string();
    dc.on_open(Box::new(move || {
        let tracker = Arc::clone(&tracker);
        let events = events.clone();
        let endpoint_id = endpoint_id.clone();
        let dc = weak_dc.upgrade();
        Box::pin(async move {
            let Some(dc) = dc else {
                return;
            };
            tracker.reset();
            tokio::spawn(probe(dc, config, tracker, endpoint_id, events));
        })
    }));
    Ok(())
}

async fn probe(
    dc: Arc<RTCDataChannel>,
    config: LivenessConfig,
    tracker: Arc<EchoTracker>,
    endpoint_id: String,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    let mut ticker = interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sequence = 0u64;
    loop {
        ticker.tick().await;
        if dc.ready_state() != RTCDataChannelState::Open {
            break;
        }
        if tracker.is_stale() {
            debug!(
                target = "webrtc",
                endpoint = %endpoint_id,
                timeout_ms = config.timeout.as_millis() as u64,
                "liveness probes unanswered"
            );
            let _ = events.send(LinkEvent::Stale);
            break;
        }
        sequence += 1;
        let ping = Bytes::copy_from_slice(&sequence.to_be_bytes());
        if let Err(err) = dc.send(&ping).await {
            warn!(target = "webrtc", endpoint = %endpoint_id, error = %err, "liveness send failed");
            break;
        }
    }
    trace!(target = "webrtc", endpoint = %endpoint_id, "liveness prober stopped");
}

/// Echoes every heartbeat received on an inbound liveness channel.
pub(crate) fn attach_echo(dc: &Arc<RTCDataChannel>) {
    let weak_dc = Arc::downgrade(dc);
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let dc = weak_dc.upgrade();
        Box::pin(async move {
            let Some(dc) = dc else {
                return;
            };
            if let Err(err) = dc.send(&msg.data).await {
                trace!(target = "webrtc", error = %err, "liveness echo dropped");
            }
        })
    }));
}
