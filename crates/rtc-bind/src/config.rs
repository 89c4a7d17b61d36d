use std::sync::Arc;
use std::time::Duration;

use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::util::vnet::net::Net;

use crate::classifier::{PacketClassifier, WireGuardClassifier};
use crate::liveness::LivenessConfig;

const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// ICE agent timers applied to every peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IceTimeouts {
    pub disconnected: Duration,
    pub failed: Duration,
    pub keepalive: Duration,
}

impl Default for IceTimeouts {
    fn default() -> Self {
        Self {
            disconnected: Duration::from_secs(3),
            failed: Duration::from_secs(10),
            keepalive: Duration::from_millis(500),
        }
    }
}

/// Configuration shared by every peer connection a bind creates.
#[derive(Clone)]
pub struct BindConfig {
    pub ice_servers: Vec<RTCIceServer>,
    pub ice_timeouts: IceTimeouts,
    /// Bound on the outbound data channel reaching `open` after the answer.
    pub open_timeout: Duration,
    /// Bound on the peer opening its data channel after we answered.
    pub accept_timeout: Duration,
    /// Capacity of the shared receive queue.
    pub queue_capacity: usize,
    pub liveness: Option<LivenessConfig>,
    /// Multiplex ICE traffic over the single UDP port passed to `open`.
    pub udp_mux: bool,
    /// Route ICE over a virtual network instead of OS sockets.
    pub vnet: Option<Arc<Net>>,
    pub classifier: Arc<dyn PacketClassifier>,
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![RTCIceServer {
                urls: vec![DEFAULT_STUN_SERVER.to_string()],
                ..Default::default()
            }],
            ice_timeouts: IceTimeouts::default(),
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            accept_timeout: DEFAULT_ACCEPT_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            liveness: Some(LivenessConfig::default()),
            udp_mux: true,
            vnet: None,
            classifier: Arc::new(WireGuardClassifier),
        }
    }
}

impl BindConfig {
    /// No STUN/TURN servers; host candidates only.
    pub fn localhost() -> Self {
        Self {
            ice_servers: vec![],
            ..Default::default()
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from `RTC_BIND_*` variables resolved through `lookup`;
    /// unset or unparsable values keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(servers) = lookup("RTC_BIND_ICE_SERVERS") {
            config.ice_servers = servers
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(|url| RTCIceServer {
                    urls: vec![url.to_string()],
                    ..Default::default()
                })
                .collect();
        }
        let millis = |key: &str| {
            lookup(key)
                .and_then(|value| value.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
        };
        if let Some(timeout) = millis("RTC_BIND_OPEN_TIMEOUT_MS") {
            config.open_timeout = timeout;
        }
        if let Some(timeout) = millis("RTC_BIND_ACCEPT_TIMEOUT_MS") {
            config.accept_timeout = timeout;
        }
        if let Some(capacity) = lookup("RTC_BIND_QUEUE_CAPACITY")
            .and_then(|value| value.trim().parse::<usize>().ok())
            .filter(|capacity| *capacity > 0)
        {
            config.queue_capacity = capacity;
        }
        if lookup("RTC_BIND_LIVENESS").is_some_and(|value| is_disabled(&value)) {
            config.liveness = None;
        }
        if lookup("RTC_BIND_UDP_MUX").is_some_and(|value| is_disabled(&value)) {
            config.udp_mux = false;
        }
        config
    }

    pub fn with_ice_servers(mut self, ice_servers: Vec<RTCIceServer>) -> Self {
        self.ice_servers = ice_servers;
        self
    }

    pub fn with_ice_timeouts(mut self, ice_timeouts: IceTimeouts) -> Self {
        self.ice_timeouts = ice_timeouts;
        self
    }

    pub fn with_open_timeout(mut self, open_timeout: Duration) -> Self {
        self.open_timeout = open_timeout;
        self
    }

    pub fn with_accept_timeout(mut self, accept_timeout: Duration) -> Self {
        self.accept_timeout = accept_timeout;
        self
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity.max(1);
        self
    }

    pub fn with_liveness(mut self, liveness: LivenessConfig) -> Self {
        self.liveness = Some(liveness);
        self
    }

    pub fn without_liveness(mut self) -> Self {
        self.liveness = None;
        self
    }

    pub fn with_udp_mux(mut self, udp_mux: bool) -> Self {
        self.udp_mux = udp_mux;
        self
    }

    pub fn with_vnet(mut self, vnet: Arc<Net>) -> Self {
        self.vnet = Some(vnet);
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn PacketClassifier>) -> Self {
        self.classifier = classifier;
        self
    }
}

fn is_disabled(value: &str) -> bool {
    let value = value.trim();
    value == "0" || value.eq_ignore_ascii_case("false") || value.eq_ignore_ascii_case("off")
}
