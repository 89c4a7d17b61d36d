use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::RTCPeerConnection;

use super::{Direction, Endpoint, EndpointCore, Sender, forward_deliveries, spawn_link_monitor};
use crate::engine::Engine;
use crate::error::{BindError, BindResult, to_setup_error};
use crate::link::{
    DATA_CHANNEL_LABEL, Delivery, Link, LinkEvent, data_channel_init, open_signal, route_messages,
    wait_open,
};
use crate::liveness;
use crate::piggyback;

/// A session this side initiates. The first initiation handed to
/// [`Sender::send`] travels inside the signaling offer; the peer's response
/// comes back inside the answer and is delivered once the data channel is
/// open, ahead of anything the channel carried.
pub struct Outbound {
    core: Arc<EndpointCore>,
}

impl fmt::Debug for Outbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outbound").field("id", &self.core.id).finish()
    }
}

impl Outbound {
    pub(crate) fn spawn(engine: &Arc<Engine>, id: &str) -> Arc<Self> {
        let (core, delivery) = EndpointCore::new(id, Direction::Outbound, engine);
        let outbound = Arc::new(Self { core });
        tokio::spawn(forward_deliveries(
            Arc::clone(engine),
            Arc::downgrade(&outbound),
            delivery,
        ));
        outbound
    }

    pub(crate) fn core(&self) -> &EndpointCore {
        &self.core
    }

    async fn connect(
        &self,
        engine: Arc<Engine>,
        initiator: &[u8],
        generation: u64,
    ) -> BindResult<Arc<Link>> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pc = engine.new_peer_connection(events_tx.clone()).await?;
        spawn_link_monitor(
            Arc::downgrade(&self.core),
            generation,
            Arc::clone(&pc),
            events_rx,
        );
        match self.dial(&engine, &pc, initiator, events_tx).await {
            Ok(dc) => Ok(Link::new(&self.core.id, pc, dc)),
            Err(err) => {
                let _ = pc.close().await;
                Err(err)
            }
        }
    }

    async fn dial(
        &self,
        engine: &Arc<Engine>,
        pc: &Arc<RTCPeerConnection>,
        initiator: &[u8],
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> BindResult<Arc<RTCDataChannel>> {
        let id = self.core.id.as_str();
        let dc = pc
            .create_data_channel(DATA_CHANNEL_LABEL, Some(data_channel_init()))
            .await
            .map_err(to_setup_error)?;
        let delivery = Delivery::held(id, self.core.delivery());
        route_messages(&dc, Arc::clone(&delivery));
        let opened = open_signal(&dc);
        if let Some(config) = engine.config.liveness {
            liveness::create_prober(pc, config, id, events).await?;
        }

        let offer = pc.create_offer(None).await.map_err(to_setup_error)?;
        let mut gather = pc.gathering_complete_promise().await;
        pc.set_local_description(offer)
            .await
            .map_err(to_setup_error)?;
        let _ = gather.recv().await;
        let local = pc
            .local_description()
            .await
            .ok_or_else(|| BindError::Setup("missing local description".into()))?;
        let offer = piggyback::attach(
            &piggyback::payload_from_description(&local),
            engine.signaler.local_id(),
            initiator,
        )?;

        trace!(target = "webrtc", endpoint = %id, initiator_len = initiator.len(), "sending offer");
        let mut closed = engine.closed_signal();
        let answer = tokio::select! {
            answer = engine.signaler.handshake(id, offer) => answer?,
            _ = closed.wait_for(|closed| *closed) => return Err(BindError::Closed),
        };
        let responder = piggyback::extract_responder(&answer)?;

        pc.set_remote_description(piggyback::session_description_from_payload(&answer)?)
            .await
            .map_err(to_setup_error)?;
        wait_open(&dc, opened, engine.config.open_timeout, closed).await?;
        debug!(target = "webrtc", endpoint = %id, "outbound data channel open");
        // The responder reaches the tunnel only over a path that exists.
        delivery.release(responder);
        Ok(dc)
    }
}

impl Endpoint for Outbound {
    fn dst_to_string(&self) -> String {
        self.core.id.clone()
    }

    fn as_sender(&self) -> Option<&dyn Sender> {
        Some(self)
    }
}

#[async_trait]
impl Sender for Outbound {
    async fn send(&self, payload: &[u8]) -> BindResult<()> {
        self.core
            .send_with(
                payload,
                |classifier, payload| classifier.is_initiation(payload),
                |engine, generation| self.connect(engine, payload, generation),
            )
            .await
    }
}
