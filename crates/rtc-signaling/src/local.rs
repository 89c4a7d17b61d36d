//! In-process signaling: signalers registered in the same [`LocalRegistry`]
//! hand offers to each other directly. Used by tests and single-process
//! setups.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::{SdpPayload, Session, SignalingError, SignalingResult, Signaler};

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const INBOX_CAPACITY: usize = 16;

type Inbox = mpsc::Sender<Box<dyn Session>>;

/// Maps endpoint identifiers to the inbox of the signaler accepting for them.
#[derive(Default)]
pub struct LocalRegistry {
    inboxes: RwLock<HashMap<String, Inbox>>,
}

impl LocalRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_accepting(&self, endpoint: &str) -> bool {
        self.inboxes.read().contains_key(endpoint)
    }

    fn find(&self, endpoint: &str) -> Option<Inbox> {
        self.inboxes.read().get(endpoint).cloned()
    }

    fn register(&self, endpoint: &str, inbox: Inbox) -> SignalingResult<()> {
        let mut guard = self.inboxes.write();
        if let Some(existing) = guard.get(endpoint) {
            if !existing.is_closed() {
                return Err(SignalingError::AlreadyAccepting);
            }
        }
        guard.insert(endpoint.to_string(), inbox);
        Ok(())
    }

    fn unregister(&self, endpoint: &str, inbox: &Inbox) {
        let mut guard = self.inboxes.write();
        if guard
            .get(endpoint)
            .is_some_and(|current| current.same_channel(inbox))
        {
            guard.remove(endpoint);
        }
    }
}

pub struct LocalSignaler {
    id: String,
    registry: Arc<LocalRegistry>,
    handshake_timeout: Duration,
    inbox: Mutex<Option<Inbox>>,
}

impl LocalSignaler {
    pub fn new(registry: Arc<LocalRegistry>, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            registry,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            inbox: Mutex::new(None),
        }
    }

    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }
}

#[async_trait]
impl Signaler for LocalSignaler {
    fn local_id(&self) -> &str {
        &self.id
    }

    async fn handshake(&self, endpoint: &str, offer: SdpPayload) -> SignalingResult<SdpPayload> {
        let inbox = self
            .registry
            .find(endpoint)
            .ok_or_else(|| SignalingError::NotFound(endpoint.to_string()))?;
        let (reply_tx, reply_rx) = oneshot::channel();
        let session = LocalSession {
            offer,
            reply: reply_tx,
        };
        trace!(
            target = "rtc_signaling",
            from = %self.id,
            to = %endpoint,
            "delivering local offer"
        );
        let exchange = async move {
            inbox
                .send(Box::new(session))
                .await
                .map_err(|_| SignalingError::NotAccepting(endpoint.to_string()))?;
            match reply_rx.await {
                Ok(Ok(answer)) => Ok(answer),
                Ok(Err(reason)) => Err(SignalingError::Rejected(reason)),
                Err(_) => Err(SignalingError::Abandoned),
            }
        };
        timeout(self.handshake_timeout, exchange)
            .await
            .map_err(|_| SignalingError::Timeout)?
    }

    async fn accept(&self) -> SignalingResult<mpsc::Receiver<Box<dyn Session>>> {
        let mut guard = self.inbox.lock();
        if guard.as_ref().is_some_and(|inbox| !inbox.is_closed()) {
            return Err(SignalingError::AlreadyAccepting);
        }
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        self.registry.register(&self.id, tx.clone())?;
        *guard = Some(tx);
        debug!(target = "rtc_signaling", id = %self.id, "local signaler accepting");
        Ok(rx)
    }

    async fn close(&self) -> SignalingResult<()> {
        if let Some(inbox) = self.inbox.lock().take() {
            self.registry.unregister(&self.id, &inbox);
            debug!(target = "rtc_signaling", id = %self.id, "local signaler closed");
        }
        Ok(())
    }
}

struct LocalSession {
    offer: SdpPayload,
    reply: oneshot::Sender<Result<SdpPayload, String>>,
}

#[async_trait]
impl Session for LocalSession {
    fn description(&self) -> &SdpPayload {
        &self.offer
    }

    async fn resolve(self: Box<Self>, answer: SdpPayload) -> SignalingResult<()> {
        self.reply
            .send(Ok(answer))
            .map_err(|_| SignalingError::Closed)
    }

    async fn reject(self: Box<Self>, reason: String) {
        let _ = self.reply.send(Err(reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(registry: &Arc<LocalRegistry>) -> (LocalSignaler, LocalSignaler) {
        (
            LocalSignaler::new(Arc::clone(registry), "s1"),
            LocalSignaler::new(Arc::clone(registry), "s2"),
        )
    }

    #[tokio::test]
    async fn handshake_returns_resolved_answer() {
        let registry = LocalRegistry::new();
        let (s1, s2) = pair(&registry);
        let mut sessions = s1.accept().await.expect("accept");

        let responder = tokio::spawn(async move {
            let session = sessions.recv().await.expect("session");
            assert_eq!(session.description().typ, "offer");
            session
                .resolve(SdpPayload::answer("v=0"))
                .await
                .expect("resolve");
        });

        let answer = s2
            .handshake("s1", SdpPayload::offer("v=0"))
            .await
            .expect("handshake");
        assert_eq!(answer.typ, "answer");
        responder.await.expect("responder task");
    }

    #[tokio::test]
    async fn rejected_session_surfaces_reason() {
        let registry = LocalRegistry::new();
        let (s1, s2) = pair(&registry);
        let mut sessions = s1.accept().await.expect("accept");
        tokio::spawn(async move {
            if let Some(session) = sessions.recv().await {
                session.reject("initiator required".into()).await;
            }
        });

        let err = s2
            .handshake("s1", SdpPayload::offer("v=0"))
            .await
            .expect_err("rejected");
        assert!(matches!(err, SignalingError::Rejected(reason) if reason == "initiator required"));
    }

    #[tokio::test]
    async fn dropped_session_is_abandoned() {
        let registry = LocalRegistry::new();
        let (s1, s2) = pair(&registry);
        let mut sessions = s1.accept().await.expect("accept");
        tokio::spawn(async move {
            let _ = sessions.recv().await;
        });

        let err = s2
            .handshake("s1", SdpPayload::offer("v=0"))
            .await
            .expect_err("abandoned");
        assert!(matches!(err, SignalingError::Abandoned));
    }

    #[tokio::test]
    async fn unknown_endpoint_is_not_found() {
        let registry = LocalRegistry::new();
        let (_s1, s2) = pair(&registry);
        let err = s2
            .handshake("nobody", SdpPayload::offer("v=0"))
            .await
            .expect_err("not found");
        assert!(matches!(err, SignalingError::NotFound(id) if id == "nobody"));
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_handshake_times_out() {
        let registry = LocalRegistry::new();
        let s1 = LocalSignaler::new(Arc::clone(&registry), "s1");
        let s2 = LocalSignaler::new(Arc::clone(&registry), "s2")
            .with_handshake_timeout(Duration::from_millis(200));
        let mut sessions = s1.accept().await.expect("accept");
        let holder = tokio::spawn(async move {
            let session = sessions.recv().await;
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(session);
        });

        let err = s2
            .handshake("s1", SdpPayload::offer("v=0"))
            .await
            .expect_err("timeout");
        assert!(matches!(err, SignalingError::Timeout));
        holder.abort();
    }

    #[tokio::test]
    async fn close_ends_accept_stream_and_is_idempotent() {
        let registry = LocalRegistry::new();
        let (s1, s2) = pair(&registry);
        let mut sessions = s1.accept().await.expect("accept");
        assert!(matches!(
            s1.accept().await,
            Err(SignalingError::AlreadyAccepting)
        ));
        assert!(registry.is_accepting("s1"));

        s1.close().await.expect("close");
        s1.close().await.expect("second close");
        assert!(sessions.recv().await.is_none());
        assert!(!registry.is_accepting("s1"));

        let err = s2
            .handshake("s1", SdpPayload::offer("v=0"))
            .await
            .expect_err("closed endpoint");
        assert!(matches!(err, SignalingError::NotFound(_)));

        // A closed signaler may accept again.
        let _sessions = s1.accept().await.expect("re-accept");
        assert!(registry.is_accepting("s1"));
    }
}
