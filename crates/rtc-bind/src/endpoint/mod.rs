//! Session endpoints and the connection gate they share.
//!
//! Every endpoint owns at most one [`Link`]. The gate serializes concurrent
//! senders: the first one allowed to establish a path does so, everyone else
//! waits for that attempt and either forwards over the new path or receives
//! the attempt's error.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

use crate::classifier::PacketClassifier;
use crate::engine::{Engine, QueuedPacket};
use crate::error::{BindError, BindResult};
use crate::link::{Link, LinkEvent};

pub mod inbound;
pub mod outbound;

pub use inbound::Inbound;
pub use outbound::Outbound;

const DELIVERY_CAPACITY: usize = 256;

/// Whether a payload may open a new data path.
pub(crate) type Classify = fn(&dyn PacketClassifier, &[u8]) -> bool;

/// A remote peer as seen by the tunnel device.
pub trait Endpoint: Send + Sync + fmt::Debug {
    /// The peer's identifier.
    fn dst_to_string(&self) -> String;

    /// Identifier bytes, used by the tunnel for cookie calculations.
    fn dst_to_bytes(&self) -> Vec<u8> {
        self.dst_to_string().into_bytes()
    }

    /// The transmit capability, if this endpoint belongs to a bind.
    fn as_sender(&self) -> Option<&dyn Sender>;
}

#[async_trait]
pub trait Sender: Send + Sync {
    async fn send(&self, payload: &[u8]) -> BindResult<()>;
}

enum Phase {
    Idle,
    Connecting,
    Connected(Arc<Link>),
    Failed,
}

struct Gate {
    phase: Phase,
    generation: u64,
    /// Terminal error, returned while `Failed`.
    error: Option<BindError>,
    /// Error of the most recent failed attempt, for senders that waited on it.
    last_failure: Option<(u64, BindError)>,
    reconnect_disabled: bool,
}

enum Step {
    Forward(Arc<Link>),
    Wait(watch::Receiver<u64>, u64),
    Establish {
        engine: Arc<Engine>,
        generation: u64,
        stale: Option<Arc<Link>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Outbound,
    Inbound,
}

pub(crate) struct EndpointCore {
    pub(crate) id: String,
    direction: Direction,
    engine: Weak<Engine>,
    gate: Mutex<Gate>,
    epoch: watch::Sender<u64>,
    delivery: mpsc::Sender<Bytes>,
}

impl EndpointCore {
    pub(crate) fn new(
        id: &str,
        direction: Direction,
        engine: &Arc<Engine>,
    ) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (delivery, delivery_rx) = mpsc::channel(DELIVERY_CAPACITY);
        let (epoch, _) = watch::channel(0);
        let core = Arc::new(Self {
            id: id.to_string(),
            direction,
            engine: Arc::downgrade(engine),
            gate: Mutex::new(Gate {
                phase: Phase::Idle,
                generation: 0,
                error: None,
                last_failure: None,
                // An answered offer cannot be answered again.
                reconnect_disabled: direction == Direction::Inbound,
            }),
            epoch,
            delivery,
        });
        (core, delivery_rx)
    }

    fn engine(&self) -> BindResult<Arc<Engine>> {
        match self.engine.upgrade() {
            Some(engine) if !engine.is_closed() => Ok(engine),
            _ => Err(BindError::Closed),
        }
    }

    pub(crate) fn delivery(&self) -> mpsc::Sender<Bytes> {
        self.delivery.clone()
    }

    fn next_step(&self, payload: &[u8], may_establish: Classify) -> BindResult<Step> {
        let mut gate = self.gate.lock();
        match &gate.phase {
            Phase::Connected(link) if link.is_open() => return Ok(Step::Forward(Arc::clone(link))),
            Phase::Connecting => {
                return Ok(Step::Wait(self.epoch.subscribe(), gate.generation));
            }
            Phase::Failed => return Err(gate.error.clone().unwrap_or(BindError::NotReady)),
            Phase::Connected(_) if gate.reconnect_disabled => {
                return Err(BindError::DataChannelClosed);
            }
            Phase::Connected(_) | Phase::Idle => {}
        }

        let engine = self.engine()?;
        if !may_establish(engine.config.classifier.as_ref(), payload) {
            return Err(BindError::NotReady);
        }
        gate.generation += 1;
        let stale = match std::mem::replace(&mut gate.phase, Phase::Connecting) {
            Phase::Connected(link) => Some(link),
            _ => None,
        };
        Ok(Step::Establish {
            engine,
            generation: gate.generation,
            stale,
        })
    }

    fn failure_of(&self, generation: u64) -> Option<BindError> {
        let gate = self.gate.lock();
        match &gate.last_failure {
            Some((failed, err)) if *failed == generation => Some(err.clone()),
            _ => None,
        }
    }

    /// Drives one send through the gate. `may_establish` decides whether
    /// `payload` may open a new path; `establish` opens it and runs at most
    /// once per call.
    pub(crate) async fn send_with<F, Fut>(
        &self,
        payload: &[u8],
        may_establish: Classify,
        establish: F,
    ) -> BindResult<()>
    where
        F: FnOnce(Arc<Engine>, u64) -> Fut,
        Fut: Future<Output = BindResult<Arc<Link>>>,
    {
        let mut establish = Some(establish);
        loop {
            match self.next_step(payload, may_establish)? {
                Step::Forward(link) => {
                    link.forward(payload);
                    return Ok(());
                }
                Step::Wait(mut epoch, generation) => {
                    trace!(target = "webrtc", endpoint = %self.id, generation, "waiting for connection attempt");
                    let _ = epoch.changed().await;
                    if let Some(err) = self.failure_of(generation) {
                        return Err(err);
                    }
                }
                Step::Establish {
                    engine,
                    generation,
                    stale,
                } => {
                    if let Some(stale) = stale {
                        stale.close().await;
                    }
                    let establish = establish.take().ok_or(BindError::NotReady)?;
                    debug!(target = "webrtc", endpoint = %self.id, generation, direction = ?self.direction, "establishing data path");
                    let mut attempt = Attempt {
                        core: self,
                        generation,
                        settled: false,
                    };
                    let result = establish(engine, generation).await;
                    attempt.settled = true;
                    return self.finish(generation, result);
                }
            }
        }
    }

    fn finish(&self, generation: u64, result: BindResult<Arc<Link>>) -> BindResult<()> {
        let hub_closed = self.engine().is_err();
        let outcome = {
            let mut gate = self.gate.lock();
            match result {
                Ok(link) => {
                    // An open data channel implies the peer connection got
                    // there too, whether or not its state event arrived yet.
                    gate.phase = Phase::Connected(link);
                    gate.error = None;
                    gate.reconnect_disabled = true;
                    Ok(())
                }
                Err(err) => {
                    gate.last_failure = Some((generation, err.clone()));
                    if gate.reconnect_disabled || hub_closed {
                        gate.phase = Phase::Failed;
                        gate.error = Some(err.clone());
                    } else {
                        gate.phase = Phase::Idle;
                    }
                    Err(err)
                }
            }
        };
        if let Err(err) = &outcome {
            debug!(target = "webrtc", endpoint = %self.id, generation, error = %err, "connection attempt failed");
        }
        self.epoch.send_modify(|epoch| *epoch = epoch.wrapping_add(1));
        outcome
    }

    fn mark_connected(&self, generation: u64) {
        let mut gate = self.gate.lock();
        if gate.generation == generation {
            gate.reconnect_disabled = true;
        }
    }

    /// Takes the data path out of the gate for good; later sends fail with
    /// [`BindError::Closed`].
    pub(crate) fn retire(&self) -> Option<Arc<Link>> {
        let mut gate = self.gate.lock();
        gate.reconnect_disabled = true;
        gate.error = Some(BindError::Closed);
        match std::mem::replace(&mut gate.phase, Phase::Failed) {
            Phase::Connected(link) => Some(link),
            _ => None,
        }
    }

    /// Retires the data path of `generation` after it died.
    fn link_lost(&self, generation: u64, err: BindError) {
        let hub_closed = self.engine().is_err();
        let failed = {
            let mut gate = self.gate.lock();
            if gate.generation != generation || !matches!(gate.phase, Phase::Connected(_)) {
                return;
            }
            gate.last_failure = Some((generation, err.clone()));
            if gate.reconnect_disabled || hub_closed {
                gate.phase = Phase::Failed;
                gate.error = Some(err.clone());
                true
            } else {
                gate.phase = Phase::Idle;
                false
            }
        };
        debug!(target = "webrtc", endpoint = %self.id, generation, error = %err, "data path lost");
        self.epoch.send_modify(|epoch| *epoch = epoch.wrapping_add(1));
        if failed && self.direction == Direction::Outbound {
            if let Some(engine) = self.engine.upgrade() {
                engine.evict_outbound(&self.id, self);
            }
        }
    }
}

/// Releases the gate if a sender is dropped while establishing.
struct Attempt<'a> {
    core: &'a EndpointCore,
    generation: u64,
    settled: bool,
}

impl Drop for Attempt<'_> {
    fn drop(&mut self) {
        if !self.settled {
            let _ = self.core.finish(
                self.generation,
                Err(BindError::Setup("connection attempt cancelled".into())),
            );
        }
    }
}

/// Consumes the peer connection's events for one attempt until it closes.
pub(crate) fn spawn_link_monitor(
    core: Weak<EndpointCore>,
    generation: u64,
    pc: Arc<RTCPeerConnection>,
    mut events: mpsc::UnboundedReceiver<LinkEvent>,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                LinkEvent::State(RTCPeerConnectionState::Connected) => {
                    if let Some(core) = core.upgrade() {
                        core.mark_connected(generation);
                    }
                }
                LinkEvent::State(
                    RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed,
                ) => {
                    let _ = pc.close().await;
                }
                LinkEvent::State(RTCPeerConnectionState::Closed) => {
                    if let Some(core) = core.upgrade() {
                        core.link_lost(generation, BindError::DataChannelClosed);
                    }
                    break;
                }
                LinkEvent::Stale => {
                    if let Some(core) = core.upgrade() {
                        core.link_lost(generation, BindError::Stale);
                    }
                    let _ = pc.close().await;
                }
                LinkEvent::State(_) => {}
            }
        }
    });
}

/// Moves an endpoint's deliveries into the shared queue, tagged with the
/// endpoint, until the endpoint is gone or the bind closes.
pub(crate) async fn forward_deliveries<E>(
    engine: Arc<Engine>,
    endpoint: Weak<E>,
    mut delivery: mpsc::Receiver<Bytes>,
) where
    E: Endpoint + 'static,
{
    let mut closed = engine.closed_signal();
    loop {
        let payload = tokio::select! {
            payload = delivery.recv() => match payload {
                Some(payload) => payload,
                None => break,
            },
            _ = closed.wait_for(|closed| *closed) => break,
        };
        let Some(endpoint) = endpoint.upgrade() else {
            break;
        };
        let endpoint: Arc<dyn Endpoint> = endpoint;
        if !engine.enqueue(QueuedPacket { payload, endpoint }).await {
            break;
        }
    }
}
