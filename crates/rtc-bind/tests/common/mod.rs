#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use parking_lot::Mutex;
use rtc_bind::{BindConfig, BindError, Endpoint, IceTimeouts, LivenessConfig, PacketReceiver};
use rtc_signaling::{
    LocalRegistry, LocalSignaler, SdpPayload, Session, Signaler, SignalingError, SignalingResult,
};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::time::timeout;
use webrtc::api::APIBuilder;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::util::vnet::net::{Net, NetConfig};
use webrtc::util::vnet::router::{Router, RouterConfig};

pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Virtual LAN so ICE runs without OS networking. The router must outlive
/// every bind attached to it.
pub struct VirtualLan {
    _router: Arc<AsyncMutex<Router>>,
    nets: Vec<Arc<Net>>,
}

impl VirtualLan {
    pub async fn new(hosts: usize) -> Self {
        let router = Arc::new(AsyncMutex::new(
            Router::new(RouterConfig {
                cidr: "10.0.0.0/24".to_owned(),
                ..Default::default()
            })
            .expect("router"),
        ));

        let mut nets = Vec::with_capacity(hosts);
        for host in 0..hosts {
            let net = Arc::new(Net::new(Some(NetConfig {
                static_ips: vec![format!("10.0.0.{}", host + 2)],
                ..Default::default()
            })));
            attach_vnet_to_router(&net, &router).await;
            nets.push(net);
        }
        router.lock().await.start().await.expect("start router");

        Self {
            _router: router,
            nets,
        }
    }

    pub fn net(&self, index: usize) -> Arc<Net> {
        Arc::clone(&self.nets[index])
    }

    /// Bind configuration for host `index` with test-sized timeouts.
    pub fn config(&self, index: usize) -> BindConfig {
        BindConfig::localhost()
            .with_vnet(Arc::clone(&self.nets[index]))
            .with_ice_timeouts(IceTimeouts {
                disconnected: Duration::from_secs(1),
                failed: Duration::from_secs(1),
                keepalive: Duration::from_millis(200),
            })
            .with_liveness(LivenessConfig {
                interval: Duration::from_millis(250),
                timeout: Duration::from_secs(2),
            })
    }
}

async fn attach_vnet_to_router(vnet: &Arc<Net>, router: &Arc<AsyncMutex<Router>>) {
    let nic = vnet.get_nic().expect("nic");
    router
        .lock()
        .await
        .add_net(Arc::clone(&nic))
        .await
        .expect("add net");
    nic.lock()
        .await
        .set_router(Arc::clone(router))
        .await
        .expect("set router");
}

/// Local signaler that counts the offers it sends.
pub struct CountingSignaler {
    inner: LocalSignaler,
    handshakes: AtomicUsize,
}

impl CountingSignaler {
    pub fn new(registry: &Arc<LocalRegistry>, id: &str) -> Arc<Self> {
        Arc::new(Self {
            inner: LocalSignaler::new(Arc::clone(registry), id)
                .with_handshake_timeout(Duration::from_secs(15)),
            handshakes: AtomicUsize::new(0),
        })
    }

    pub fn handshakes(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Signaler for CountingSignaler {
    fn local_id(&self) -> &str {
        self.inner.local_id()
    }

    async fn handshake(&self, endpoint: &str, offer: SdpPayload) -> SignalingResult<SdpPayload> {
        self.handshakes.fetch_add(1, Ordering::SeqCst);
        self.inner.handshake(endpoint, offer).await
    }

    async fn accept(&self) -> SignalingResult<mpsc::Receiver<Box<dyn Session>>> {
        self.inner.accept().await
    }

    async fn close(&self) -> SignalingResult<()> {
        self.inner.close().await
    }
}

/// Answers every offer with a well-formed answer carrying `responder`, from
/// a peer connection that is closed before the answer is returned. The
/// offering side can apply the answer but never reaches anyone.
pub struct VanishingPeer {
    id: String,
    net: Arc<Net>,
    responder: Vec<u8>,
    handshakes: AtomicUsize,
    inbox: Mutex<Option<mpsc::Sender<Box<dyn Session>>>>,
}

impl VanishingPeer {
    pub fn new(id: &str, net: Arc<Net>, responder: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            net,
            responder: responder.to_vec(),
            handshakes: AtomicUsize::new(0),
            inbox: Mutex::new(None),
        })
    }

    pub fn handshakes(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }

    async fn answer(&self, offer: SdpPayload) -> Result<SdpPayload, webrtc::Error> {
        let mut setting = SettingEngine::default();
        setting.set_vnet(Some(Arc::clone(&self.net)));
        let api = APIBuilder::new().with_setting_engine(setting).build();
        let pc = api.new_peer_connection(RTCConfiguration::default()).await?;
        pc.set_remote_description(RTCSessionDescription::offer(offer.sdp)?)
            .await?;
        let answer = pc.create_answer(None).await?;
        let mut gather = pc.gathering_complete_promise().await;
        pc.set_local_description(answer).await?;
        let _ = gather.recv().await;
        let local = pc.local_description().await;
        pc.close().await?;
        let sdp = local.map(|local| local.sdp).unwrap_or_default();
        let session_information = format!("s=-\r\ni={}\r\n", STANDARD.encode(&self.responder));
        Ok(SdpPayload::answer(sdp.replacen("s=-\r\n", &session_information, 1)))
    }
}

#[async_trait]
impl Signaler for VanishingPeer {
    fn local_id(&self) -> &str {
        &self.id
    }

    async fn handshake(&self, _endpoint: &str, offer: SdpPayload) -> SignalingResult<SdpPayload> {
        self.handshakes.fetch_add(1, Ordering::SeqCst);
        self.answer(offer)
            .await
            .map_err(|err| SignalingError::Http(err.to_string()))
    }

    async fn accept(&self) -> SignalingResult<mpsc::Receiver<Box<dyn Session>>> {
        let (tx, rx) = mpsc::channel(1);
        *self.inbox.lock() = Some(tx);
        Ok(rx)
    }

    async fn close(&self) -> SignalingResult<()> {
        self.inbox.lock().take();
        Ok(())
    }
}

/// Waits for the next datagram on `receiver`.
pub async fn recv(receiver: &mut PacketReceiver) -> (Vec<u8>, Arc<dyn Endpoint>) {
    let mut buf = [0u8; 1500];
    let mut sizes = [0usize; 1];
    let mut endpoints: [Option<Arc<dyn Endpoint>>; 1] = [None];
    let count = {
        let mut bufs: [&mut [u8]; 1] = [&mut buf];
        timeout(
            RECEIVE_TIMEOUT,
            receiver.receive_batch(&mut bufs, &mut sizes, &mut endpoints),
        )
        .await
        .expect("receive timed out")
        .expect("receive")
    };
    assert_eq!(count, 1);
    let endpoint = endpoints[0].take().expect("endpoint");
    (buf[..sizes[0]].to_vec(), endpoint)
}

/// Receive attempt that reports errors instead of panicking.
pub async fn try_recv(receiver: &mut PacketReceiver) -> Result<usize, BindError> {
    let mut buf = [0u8; 1500];
    let mut sizes = [0usize; 1];
    let mut endpoints: [Option<Arc<dyn Endpoint>>; 1] = [None];
    let mut bufs: [&mut [u8]; 1] = [&mut buf];
    receiver
        .receive_batch(&mut bufs, &mut sizes, &mut endpoints)
        .await
}
