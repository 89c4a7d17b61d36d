//! State shared by everything a bind spawns while it is open: the WebRTC
//! API, the registry of live peer connections, the shared receive queue,
//! the closed flag and the cache of outbound endpoints.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rtc_signaling::Signaler;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice::udp_mux::{UDPMux, UDPMuxDefault, UDPMuxParams};
use webrtc::ice::udp_network::UDPNetwork;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

use crate::config::BindConfig;
use crate::endpoint::outbound::Outbound;
use crate::endpoint::{Endpoint, EndpointCore};
use crate::error::{BindError, BindResult, to_setup_error};
use crate::link::LinkEvent;

/// A received datagram and the endpoint it arrived from.
pub(crate) struct QueuedPacket {
    pub(crate) payload: Bytes,
    pub(crate) endpoint: Arc<dyn Endpoint>,
}

pub(crate) struct Engine {
    api: API,
    rtc_config: RTCConfiguration,
    pub(crate) config: BindConfig,
    pub(crate) signaler: Arc<dyn Signaler>,
    next_key: AtomicU64,
    peers: Mutex<HashMap<u64, Arc<RTCPeerConnection>>>,
    closed: RwLock<bool>,
    closed_tx: watch::Sender<bool>,
    queue: mpsc::Sender<QueuedPacket>,
    outbounds: Mutex<HashMap<String, Arc<Outbound>>>,
    udp_mux: Option<Arc<UDPMuxDefault>>,
}

fn build_api(setting: SettingEngine) -> BindResult<API> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

impl Engine {
    /// Builds the API for one open/close cycle. Returns the engine, the
    /// consumer side of the shared queue and the bound UDP port (0 when ICE
    /// is not multiplexed over a single socket).
    pub(crate) async fn start(
        signaler: Arc<dyn Signaler>,
        config: BindConfig,
        port: u16,
    ) -> BindResult<(Arc<Self>, mpsc::Receiver<QueuedPacket>, u16)> {
        let mut setting = SettingEngine::default();
        let timeouts = config.ice_timeouts;
        setting.set_ice_timeouts(
            Some(timeouts.disconnected),
            Some(timeouts.failed),
            Some(timeouts.keepalive),
        );

        let mut udp_mux = None;
        let mut bound_port = 0;
        if let Some(vnet) = &config.vnet {
            setting.set_vnet(Some(Arc::clone(vnet)));
        } else if config.udp_mux {
            let socket = UdpSocket::bind(("0.0.0.0", port))
                .await
                .map_err(to_setup_error)?;
            bound_port = socket.local_addr().map_err(to_setup_error)?.port();
            let mux = UDPMuxDefault::new(UDPMuxParams::new(socket));
            let shared: Arc<dyn UDPMux + Send + Sync> = mux.clone();
            setting.set_udp_network(UDPNetwork::Muxed(shared));
            udp_mux = Some(mux);
            debug!(target = "webrtc", port = bound_port, "ice udp mux bound");
        }

        let api = build_api(setting)?;
        let rtc_config = RTCConfiguration {
            ice_servers: config.ice_servers.clone(),
            ..Default::default()
        };
        let (queue, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (closed_tx, _) = watch::channel(false);

        let engine = Arc::new(Self {
            api,
            rtc_config,
            config,
            signaler,
            next_key: AtomicU64::new(0),
            peers: Mutex::new(HashMap::new()),
            closed: RwLock::new(false),
            closed_tx,
            queue,
            outbounds: Mutex::new(HashMap::new()),
            udp_mux,
        });
        Ok((engine, queue_rx, bound_port))
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.closed.read()
    }

    pub(crate) fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    pub(crate) fn live_peer_connections(&self) -> usize {
        self.peers.lock().len()
    }

    /// Creates a peer connection tracked for bulk shutdown. State changes are
    /// forwarded to `events`; the registry entry is dropped once the
    /// connection reports `closed`.
    pub(crate) async fn new_peer_connection(
        self: &Arc<Self>,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> BindResult<Arc<RTCPeerConnection>> {
        if self.is_closed() {
            return Err(BindError::Closed);
        }
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.rtc_config.clone())
                .await
                .map_err(to_setup_error)?,
        );

        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let engine = Arc::downgrade(self);
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let engine = engine.clone();
            let events = events.clone();
            Box::pin(async move {
                debug!(target = "webrtc", key, ?state, "peer connection state changed");
                if state == RTCPeerConnectionState::Closed {
                    if let Some(engine) = engine.upgrade() {
                        engine.peers.lock().remove(&key);
                    }
                }
                let _ = events.send(LinkEvent::State(state));
            })
        }));

        let registered = {
            let closed = self.closed.read();
            if *closed {
                false
            } else {
                self.peers.lock().insert(key, Arc::clone(&pc));
                true
            }
        };
        if !registered {
            let _ = pc.close().await;
            return Err(BindError::Closed);
        }
        trace!(target = "webrtc", key, "peer connection registered");
        Ok(pc)
    }

    /// Pushes a packet into the shared queue; `false` once the bind closed.
    pub(crate) async fn enqueue(&self, packet: QueuedPacket) -> bool {
        if self.is_closed() {
            return false;
        }
        let mut closed = self.closed_signal();
        tokio::select! {
            sent = self.queue.send(packet) => sent.is_ok(),
            _ = closed.wait_for(|closed| *closed) => false,
        }
    }

    pub(crate) fn outbound(self: &Arc<Self>, id: &str) -> BindResult<Arc<Outbound>> {
        if self.is_closed() {
            return Err(BindError::Closed);
        }
        let mut outbounds = self.outbounds.lock();
        if let Some(existing) = outbounds.get(id) {
            return Ok(Arc::clone(existing));
        }
        let outbound = Outbound::spawn(self, id);
        outbounds.insert(id.to_string(), Arc::clone(&outbound));
        Ok(outbound)
    }

    /// Forgets the cached outbound for `id` if it is still `core`'s owner.
    pub(crate) fn evict_outbound(&self, id: &str, core: &EndpointCore) {
        let mut outbounds = self.outbounds.lock();
        if outbounds
            .get(id)
            .is_some_and(|outbound| std::ptr::eq(outbound.core(), core))
        {
            outbounds.remove(id);
            debug!(target = "webrtc", endpoint = %id, "outbound endpoint evicted");
        }
    }

    /// Marks the engine closed and releases everything it owns. Idempotent.
    pub(crate) async fn shutdown(&self) {
        {
            let mut closed = self.closed.write();
            if *closed {
                return;
            }
            *closed = true;
        }
        self.closed_tx.send_replace(true);

        let peers: Vec<_> = self.peers.lock().drain().map(|(_, pc)| pc).collect();
        debug!(target = "webrtc", peers = peers.len(), "closing peer connections");
        for pc in peers {
            if let Err(err) = pc.close().await {
                warn!(target = "webrtc", error = %err, "failed to close peer connection");
            }
        }
        if let Err(err) = self.signaler.close().await {
            warn!(target = "webrtc", error = %err, "failed to close signaler");
        }
        if let Some(mux) = &self.udp_mux {
            if let Err(err) = mux.close().await {
                warn!(target = "webrtc", error = %err, "failed to close udp mux");
            }
        }
        self.outbounds.lock().clear();
    }
}
