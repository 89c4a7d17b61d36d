use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rtc_signaling::{SdpPayload, Session};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, trace};
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::RTCPeerConnection;

use super::{Direction, Endpoint, EndpointCore, Sender, spawn_link_monitor};
use crate::engine::Engine;
use crate::error::{BindError, BindResult, to_setup_error};
use crate::link::{DATA_CHANNEL_LABEL, Delivery, Link, open_signal, route_messages, wait_open};
use crate::liveness::{self, LIVENESS_CHANNEL_LABEL};
use crate::piggyback;

type OpenedChannel = (Arc<RTCDataChannel>, oneshot::Receiver<BindResult<()>>);

/// A session a peer initiated against this side. Answering the offer is
/// deferred until the tunnel sends its response, which then travels inside
/// the answer.
pub struct Inbound {
    core: Arc<EndpointCore>,
    offer: SdpPayload,
    session: Mutex<Option<Box<dyn Session>>>,
}

impl fmt::Debug for Inbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inbound")
            .field("id", &self.core.id)
            .field("answered", &self.session.lock().is_none())
            .finish()
    }
}

impl Inbound {
    pub(crate) fn new(
        engine: &Arc<Engine>,
        id: &str,
        session: Box<dyn Session>,
    ) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (core, delivery) = EndpointCore::new(id, Direction::Inbound, engine);
        let offer = session.description().clone();
        let inbound = Arc::new(Self {
            core,
            offer,
            session: Mutex::new(Some(session)),
        });
        (inbound, delivery)
    }

    /// The initiator piggybacked on the offer. Never blocks.
    pub fn extract_initiator(&self) -> BindResult<Bytes> {
        piggyback::extract_initiator(&self.offer)
    }

    /// Rejects the pending offer, if it was not answered yet.
    pub(crate) async fn reject(&self, reason: String) {
        let session = self.session.lock().take();
        if let Some(session) = session {
            session.reject(reason).await;
        }
    }

    async fn accept(
        &self,
        engine: Arc<Engine>,
        responder: &[u8],
        generation: u64,
    ) -> BindResult<Arc<Link>> {
        let session = self.session.lock().take().ok_or(BindError::NotReady)?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pc = match engine.new_peer_connection(events_tx).await {
            Ok(pc) => pc,
            Err(err) => {
                session.reject(err.to_string()).await;
                return Err(err);
            }
        };
        spawn_link_monitor(
            Arc::downgrade(&self.core),
            generation,
            Arc::clone(&pc),
            events_rx,
        );
        let result = self.answer_and_wait(&engine, &pc, session, responder).await;
        match result {
            Ok(dc) => Ok(Link::new(&self.core.id, pc, dc)),
            Err(err) => {
                let _ = pc.close().await;
                Err(err)
            }
        }
    }

    async fn answer_and_wait(
        &self,
        engine: &Arc<Engine>,
        pc: &Arc<RTCPeerConnection>,
        session: Box<dyn Session>,
        responder: &[u8],
    ) -> BindResult<Arc<RTCDataChannel>> {
        let id = self.core.id.as_str();
        let channel_rx = self.watch_data_channels(pc);

        let answer = match self.answer(engine, pc, responder).await {
            Ok(answer) => answer,
            Err(err) => {
                session.reject(err.to_string()).await;
                return Err(err);
            }
        };
        session.resolve(answer).await?;
        trace!(target = "webrtc", endpoint = %id, responder_len = responder.len(), "offer answered");

        let deadline = Instant::now() + engine.config.accept_timeout;
        let mut closed = engine.closed_signal();
        let (dc, opened) = tokio::select! {
            channel = timeout_at(deadline, channel_rx) => match channel {
                Ok(Ok(channel)) => channel,
                Ok(Err(_)) => return Err(BindError::DataChannelClosed),
                Err(_) => return Err(BindError::Timeout),
            },
            _ = closed.wait_for(|closed| *closed) => return Err(BindError::Closed),
        };
        wait_open(
            &dc,
            opened,
            deadline.saturating_duration_since(Instant::now()),
            closed,
        )
        .await?;
        debug!(target = "webrtc", endpoint = %id, "inbound data channel open");
        Ok(dc)
    }

    /// Wires the peer's channels as they arrive and hands over the data
    /// channel once it shows up.
    fn watch_data_channels(&self, pc: &Arc<RTCPeerConnection>) -> oneshot::Receiver<OpenedChannel> {
        let (tx, rx) = oneshot::channel::<OpenedChannel>();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let delivery = self.core.delivery();
        let id = self.core.id.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let slot = Arc::clone(&slot);
            let delivery = delivery.clone();
            let id = id.clone();
            Box::pin(async move {
                let label = dc.label().to_string();
                match label.as_str() {
                    DATA_CHANNEL_LABEL => {
                        route_messages(&dc, Delivery::direct(&id, delivery));
                        let opened = open_signal(&dc);
                        if let Some(tx) = slot.lock().take() {
                            let _ = tx.send((dc, opened));
                        }
                    }
                    LIVENESS_CHANNEL_LABEL => liveness::attach_echo(&dc),
                    other => {
                        debug!(target = "webrtc", endpoint = %id, label = %other, "ignoring unknown data channel");
                    }
                }
            })
        }));
        rx
    }

    async fn answer(
        &self,
        engine: &Arc<Engine>,
        pc: &Arc<RTCPeerConnection>,
        responder: &[u8],
    ) -> BindResult<SdpPayload> {
        pc.set_remote_description(piggyback::session_description_from_payload(&self.offer)?)
            .await
            .map_err(to_setup_error)?;
        let answer = pc.create_answer(None).await.map_err(to_setup_error)?;
        let mut gather = pc.gathering_complete_promise().await;
        pc.set_local_description(answer)
            .await
            .map_err(to_setup_error)?;
        let _ = gather.recv().await;
        let local = pc
            .local_description()
            .await
            .ok_or_else(|| BindError::Setup("missing local description".into()))?;
        piggyback::attach(
            &piggyback::payload_from_description(&local),
            engine.signaler.local_id(),
            responder,
        )
    }
}

impl Drop for Inbound {
    /// The tunnel let go of this endpoint: reject an unanswered offer and
    /// close a live data path instead of waiting for the peer to notice.
    fn drop(&mut self) {
        let session = self.session.get_mut().take();
        let link = self.core.retire();
        if session.is_none() && link.is_none() {
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            return;
        };
        let id = self.core.id.clone();
        runtime.spawn(async move {
            if let Some(session) = session {
                session.reject("endpoint dropped".into()).await;
            }
            if let Some(link) = link {
                link.close().await;
            }
            debug!(target = "webrtc", endpoint = %id, "inbound endpoint released");
        });
    }
}

impl Endpoint for Inbound {
    fn dst_to_string(&self) -> String {
        self.core.id.clone()
    }

    fn as_sender(&self) -> Option<&dyn Sender> {
        Some(self)
    }
}

#[async_trait]
impl Sender for Inbound {
    async fn send(&self, payload: &[u8]) -> BindResult<()> {
        self.core
            .send_with(
                payload,
                |classifier, payload| classifier.is_response(payload),
                |engine, generation| self.accept(engine, payload, generation),
            )
            .await
    }
}
