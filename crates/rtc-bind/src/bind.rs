use std::sync::Arc;

use parking_lot::RwLock;
use rtc_signaling::{Session, Signaler};
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::BindConfig;
use crate::endpoint::{Endpoint, Inbound, forward_deliveries};
use crate::engine::{Engine, QueuedPacket};
use crate::error::{BindError, BindResult};
use crate::piggyback;

/// Datagrams handed out per [`PacketReceiver::receive_batch`] call.
pub const BATCH_SIZE: usize = 1;

struct OpenState {
    engine: Arc<Engine>,
    accept_task: JoinHandle<()>,
}

/// Carries tunnel datagrams over WebRTC data channels.
///
/// Outbound sessions are created lazily by the first initiation sent to an
/// endpoint from [`Bind::parse_endpoint`]; inbound sessions arrive through
/// the signaler. Everything received from any session lands in one queue
/// drained by [`PacketReceiver::receive_batch`].
pub struct Bind {
    signaler: Arc<dyn Signaler>,
    config: BindConfig,
    lifecycle: AsyncMutex<()>,
    state: RwLock<Option<OpenState>>,
}

impl Bind {
    pub fn new(signaler: Arc<dyn Signaler>, config: BindConfig) -> Self {
        Self {
            signaler,
            config,
            lifecycle: AsyncMutex::new(()),
            state: RwLock::new(None),
        }
    }

    fn engine(&self) -> BindResult<Arc<Engine>> {
        match self.state.read().as_ref() {
            Some(state) if !state.engine.is_closed() => Ok(Arc::clone(&state.engine)),
            _ => Err(BindError::Closed),
        }
    }

    /// Starts accepting sessions. Returns the receiver of the shared queue
    /// and the UDP port ICE traffic is multiplexed on (0 when not
    /// multiplexed).
    pub async fn open(&self, port: u16) -> BindResult<(PacketReceiver, u16)> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state.read().is_some() {
            return Err(BindError::AlreadyOpen);
        }

        let (engine, queue, bound_port) =
            Engine::start(Arc::clone(&self.signaler), self.config.clone(), port).await?;
        let sessions = match self.signaler.accept().await {
            Ok(sessions) => sessions,
            Err(err) => {
                engine.shutdown().await;
                return Err(err.into());
            }
        };
        let accept_task = tokio::spawn(accept_loop(Arc::clone(&engine), sessions));
        let receiver = PacketReceiver {
            queue,
            closed: engine.closed_signal(),
        };
        *self.state.write() = Some(OpenState {
            engine,
            accept_task,
        });
        info!(
            target = "webrtc",
            id = %self.signaler.local_id(),
            port = bound_port,
            "bind open"
        );
        Ok((receiver, bound_port))
    }

    /// Returns the outbound endpoint for `id`, creating it on first use.
    pub fn parse_endpoint(&self, id: &str) -> BindResult<Arc<dyn Endpoint>> {
        let outbound = self.engine()?.outbound(id)?;
        Ok(outbound)
    }

    /// Sends each buffer to `endpoint` in order, stopping at the first error.
    pub async fn send(&self, bufs: &[&[u8]], endpoint: &dyn Endpoint) -> BindResult<()> {
        self.engine()?;
        let sender = endpoint.as_sender().ok_or(BindError::EndpointImpl)?;
        for buf in bufs {
            sender.send(buf).await?;
        }
        Ok(())
    }

    /// Closes every session, the signaler and the shared queue. Safe to
    /// call repeatedly; a closed bind may be opened again.
    pub async fn close(&self) -> BindResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let state = self.state.write().take();
        let Some(state) = state else {
            return Ok(());
        };
        state.engine.shutdown().await;
        state.accept_task.abort();
        info!(target = "webrtc", id = %self.signaler.local_id(), "bind closed");
        Ok(())
    }

    pub fn batch_size(&self) -> usize {
        BATCH_SIZE
    }

    /// Peer connections currently tracked for shutdown.
    pub fn live_peer_connections(&self) -> usize {
        self.state
            .read()
            .as_ref()
            .map_or(0, |state| state.engine.live_peer_connections())
    }
}

/// Consumer side of the shared receive queue.
pub struct PacketReceiver {
    queue: mpsc::Receiver<QueuedPacket>,
    closed: watch::Receiver<bool>,
}

impl PacketReceiver {
    /// Waits for at least one datagram and copies up to `bufs.len()` of them
    /// (at most [`BATCH_SIZE`]) into `bufs`, recording each length in
    /// `sizes` and each origin in `endpoints`. Payloads longer than their
    /// buffer are truncated. Fails with [`BindError::Closed`] once the bind
    /// closed.
    pub async fn receive_batch(
        &mut self,
        bufs: &mut [&mut [u8]],
        sizes: &mut [usize],
        endpoints: &mut [Option<Arc<dyn Endpoint>>],
    ) -> BindResult<usize> {
        let capacity = bufs.len().min(sizes.len()).min(endpoints.len()).min(BATCH_SIZE);
        if capacity == 0 {
            return Ok(0);
        }
        let packet = tokio::select! {
            biased;
            _ = self.closed.wait_for(|closed| *closed) => return Err(BindError::Closed),
            packet = self.queue.recv() => packet.ok_or(BindError::Closed)?,
        };

        let mut count = 0;
        let mut next = Some(packet);
        while let Some(packet) = next.take() {
            let len = packet.payload.len().min(bufs[count].len());
            bufs[count][..len].copy_from_slice(&packet.payload[..len]);
            sizes[count] = len;
            endpoints[count] = Some(packet.endpoint);
            count += 1;
            if count < capacity {
                next = self.queue.try_recv().ok();
            }
        }
        trace!(target = "webrtc", count, "received batch");
        Ok(count)
    }
}

async fn accept_loop(engine: Arc<Engine>, mut sessions: mpsc::Receiver<Box<dyn Session>>) {
    let mut closed = engine.closed_signal();
    loop {
        let session = tokio::select! {
            session = sessions.recv() => match session {
                Some(session) => session,
                None => break,
            },
            _ = closed.wait_for(|closed| *closed) => break,
        };
        tokio::spawn(handle_session(Arc::clone(&engine), session));
    }
    debug!(target = "webrtc", "accept loop ended");
}

async fn handle_session(engine: Arc<Engine>, session: Box<dyn Session>) {
    let id = match piggyback::origin_of(session.description()) {
        Ok(Some(id)) => id,
        Ok(None) => {
            warn!(target = "webrtc", "offer without origin username");
            session
                .reject("offer carries no origin username".into())
                .await;
            return;
        }
        Err(err) => {
            warn!(target = "webrtc", error = %err, "unreadable offer");
            session.reject(err.to_string()).await;
            return;
        }
    };

    let (inbound, delivery) = Inbound::new(&engine, &id, session);
    let initiator = match inbound.extract_initiator() {
        Ok(initiator) => initiator,
        Err(err) => {
            warn!(target = "webrtc", endpoint = %id, error = %err, "rejecting offer");
            inbound.reject(err.to_string()).await;
            return;
        }
    };
    debug!(target = "webrtc", endpoint = %id, initiator_len = initiator.len(), "inbound session");

    let endpoint: Arc<dyn Endpoint> = inbound.clone();
    if !engine
        .enqueue(QueuedPacket {
            payload: initiator,
            endpoint,
        })
        .await
    {
        inbound.reject(BindError::Closed.to_string()).await;
        return;
    }
    let weak = Arc::downgrade(&inbound);
    drop(inbound);
    forward_deliveries(engine, weak, delivery).await;
}
