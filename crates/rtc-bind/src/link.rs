use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, trace, warn};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

use crate::error::{BindError, BindResult};

/// Label of the channel carrying tunnel datagrams.
pub const DATA_CHANNEL_LABEL: &str = "wgortc";

/// Unordered with no retransmissions: datagrams, not a stream.
pub(crate) fn data_channel_init() -> RTCDataChannelInit {
    RTCDataChannelInit {
        ordered: Some(false),
        max_retransmits: Some(0),
        ..Default::default()
    }
}

/// Peer connection callbacks, forwarded to the endpoint's link monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkEvent {
    State(RTCPeerConnectionState),
    Stale,
}

/// An established data path: the peer connection, its data channel and the
/// pump writing queued datagrams into the channel.
pub(crate) struct Link {
    pub(crate) pc: Arc<RTCPeerConnection>,
    dc: Arc<RTCDataChannel>,
    outbound_tx: mpsc::UnboundedSender<Bytes>,
}

impl Link {
    pub(crate) fn new(endpoint_id: &str, pc: Arc<RTCPeerConnection>, dc: Arc<RTCDataChannel>) -> Arc<Self> {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Bytes>();
        let pump_dc = Arc::clone(&dc);
        let endpoint_id = endpoint_id.to_string();
        tokio::spawn(async move {
            while let Some(bytes) = outbound_rx.recv().await {
                match pump_dc.send(&bytes).await {
                    Ok(written) => {
                        trace!(target = "webrtc", endpoint = %endpoint_id, written, "sent datagram");
                    }
                    Err(err) => {
                        warn!(target = "webrtc", endpoint = %endpoint_id, error = %err, "data channel send error");
                        break;
                    }
                }
            }
            trace!(target = "webrtc", endpoint = %endpoint_id, "sender loop ended");
        });
        Arc::new(Self { pc, dc, outbound_tx })
    }

    pub(crate) fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open && !self.outbound_tx.is_closed()
    }

    /// Fire-and-forget; failures surface through the peer connection state.
    pub(crate) fn forward(&self, payload: &[u8]) {
        let _ = self.outbound_tx.send(Bytes::copy_from_slice(payload));
    }

    pub(crate) async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            debug!(target = "webrtc", error = %err, "closing peer connection failed");
        }
    }
}

const HELD_LIMIT: usize = 64;

/// Sink for a link's incoming datagrams. A held sink buffers them until
/// [`Delivery::release`] queues the piggybacked responder, so the responder
/// is always the first thing the endpoint delivers. A sink that is never
/// released delivers nothing.
pub(crate) struct Delivery {
    endpoint_id: String,
    queue: mpsc::Sender<Bytes>,
    held: Mutex<Option<Vec<Bytes>>>,
}

impl Delivery {
    pub(crate) fn direct(endpoint_id: &str, queue: mpsc::Sender<Bytes>) -> Arc<Self> {
        Self::new(endpoint_id, queue, None)
    }

    pub(crate) fn held(endpoint_id: &str, queue: mpsc::Sender<Bytes>) -> Arc<Self> {
        Self::new(endpoint_id, queue, Some(Vec::new()))
    }

    fn new(endpoint_id: &str, queue: mpsc::Sender<Bytes>, held: Option<Vec<Bytes>>) -> Arc<Self> {
        Arc::new(Self {
            endpoint_id: endpoint_id.to_string(),
            queue,
            held: Mutex::new(held),
        })
    }

    fn push(&self, data: Bytes) {
        let mut held = self.held.lock();
        match held.as_mut() {
            Some(buffer) if buffer.len() < HELD_LIMIT => buffer.push(data),
            Some(_) => {
                debug!(target = "webrtc", endpoint = %self.endpoint_id, len = data.len(), "held datagrams full; dropping datagram");
            }
            None => self.offer(data),
        }
    }

    /// Queues `first`, then everything held back, and lets later datagrams
    /// through directly.
    pub(crate) fn release(&self, first: Bytes) {
        let mut held = self.held.lock();
        let Some(buffer) = held.take() else {
            return;
        };
        self.offer(first);
        for data in buffer {
            self.offer(data);
        }
    }

    fn offer(&self, data: Bytes) {
        let len = data.len();
        match self.queue.try_send(data) {
            Ok(()) => trace!(target = "webrtc", endpoint = %self.endpoint_id, len, "received datagram"),
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(target = "webrtc", endpoint = %self.endpoint_id, len, "delivery queue full; dropping datagram");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

/// Routes data channel messages into `delivery`. Messages that do not fit
/// are dropped like any other datagram.
pub(crate) fn route_messages(dc: &Arc<RTCDataChannel>, delivery: Arc<Delivery>) {
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let delivery = Arc::clone(&delivery);
        Box::pin(async move {
            delivery.push(msg.data);
        })
    }));
}

/// Resolves once `dc` is open. Must be registered before the channel can
/// open, i.e. before the remote description is applied.
pub(crate) fn open_signal(dc: &Arc<RTCDataChannel>) -> oneshot::Receiver<BindResult<()>> {
    let (tx, rx) = oneshot::channel();
    let signal = Arc::new(Mutex::new(Some(tx)));
    let on_open = Arc::clone(&signal);
    dc.on_open(Box::new(move || {
        let signal = Arc::clone(&on_open);
        Box::pin(async move {
            if let Some(tx) = signal.lock().take() {
                let _ = tx.send(Ok(()));
            }
        })
    }));
    let on_close = Arc::clone(&signal);
    dc.on_close(Box::new(move || {
        let signal = Arc::clone(&on_close);
        Box::pin(async move {
            if let Some(tx) = signal.lock().take() {
                let _ = tx.send(Err(BindError::DataChannelClosed));
            }
        })
    }));
    dc.on_error(Box::new(move |err: webrtc::Error| {
        let signal = Arc::clone(&signal);
        Box::pin(async move {
            if let Some(tx) = signal.lock().take() {
                let _ = tx.send(Err(BindError::Setup(err.to_string())));
            }
        })
    }));
    rx
}

/// Waits for `opened` within `limit`, giving up early when the bind closes.
pub(crate) async fn wait_open(
    dc: &Arc<RTCDataChannel>,
    opened: oneshot::Receiver<BindResult<()>>,
    limit: Duration,
    mut closed: watch::Receiver<bool>,
) -> BindResult<()> {
    match dc.ready_state() {
        RTCDataChannelState::Open => return Ok(()),
        RTCDataChannelState::Closing | RTCDataChannelState::Closed => {
            return Err(BindError::DataChannelClosed);
        }
        _ => {}
    }
    tokio::select! {
        result = timeout(limit, opened) => match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(BindError::DataChannelClosed),
            Err(_) => Err(BindError::Timeout),
        },
        _ = closed.wait_for(|closed| *closed) => Err(BindError::Closed),
    }
}
