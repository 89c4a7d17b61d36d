use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::stream;
use rtc_signaling::{HttpSignaler, SdpPayload, SignalingError, Signaler};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};
use tokio::time::timeout;
use tracing_subscriber::{EnvFilter, fmt::SubscriberBuilder};

// base64("user:pw")
const AUTHORIZATION: &str = "Basic dXNlcjpwdw==";

#[derive(Default)]
struct ServerState {
    topics: AsyncMutex<HashMap<String, mpsc::UnboundedSender<(String, String)>>>,
    pending: AsyncMutex<HashMap<String, oneshot::Sender<SdpPayload>>>,
    next_event: AtomicU64,
    subscriptions: AtomicUsize,
    /// Ends the first event stream right after it starts.
    hang_up_first: bool,
}

#[derive(Deserialize)]
struct TopicQuery {
    t: String,
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        == Some(AUTHORIZATION)
}

async fn subscribe(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<TopicQuery>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, "bad credentials").into_response();
    }
    let attempt = state.subscriptions.fetch_add(1, Ordering::SeqCst);
    if state.hang_up_first && attempt == 0 {
        let hello = stream::iter([Ok::<_, Infallible>(Event::default().comment("hello"))]);
        return Sse::new(hello).into_response();
    }
    let (tx, rx) = mpsc::unbounded_channel::<(String, String)>();
    state.topics.lock().await.insert(query.t, tx);
    let events = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|(id, data)| {
            (
                Ok::<_, Infallible>(Event::default().id(id).data(data)),
                rx,
            )
        })
    });
    Sse::new(events).into_response()
}

async fn post_offer(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<TopicQuery>,
    headers: HeaderMap,
    Json(offer): Json<SdpPayload>,
) -> Response {
    if !authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, "bad credentials").into_response();
    }
    let Some(topic) = state.topics.lock().await.get(&query.t).cloned() else {
        return (StatusCode::NOT_FOUND, "endpoint offline").into_response();
    };
    let event_id = state.next_event.fetch_add(1, Ordering::SeqCst).to_string();
    let (tx, rx) = oneshot::channel();
    state.pending.lock().await.insert(event_id.clone(), tx);
    let data = serde_json::to_string(&offer).expect("encode offer");
    if topic.send((event_id, data)).is_err() {
        return (StatusCode::NOT_FOUND, "endpoint offline").into_response();
    }
    match timeout(Duration::from_secs(5), rx).await {
        Ok(Ok(answer)) => Json(answer).into_response(),
        _ => (StatusCode::GATEWAY_TIMEOUT, "no answer").into_response(),
    }
}

async fn delete_answer(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(answer): Json<SdpPayload>,
) -> Response {
    if !authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, "bad credentials").into_response();
    }
    let Some(event_id) = headers.get("x-event-id").and_then(|v| v.to_str().ok()) else {
        return (StatusCode::BAD_REQUEST, "missing event id").into_response();
    };
    match state.pending.lock().await.remove(event_id) {
        Some(tx) => {
            let _ = tx.send(answer);
            StatusCode::NO_CONTENT.into_response()
        }
        None => (StatusCode::NOT_FOUND, "unknown event").into_response(),
    }
}

async fn spawn_server() -> SocketAddr {
    spawn_server_with(ServerState::default()).await.0
}

async fn spawn_server_with(state: ServerState) -> (SocketAddr, Arc<ServerState>) {
    let state = Arc::new(state);
    let app = Router::new()
        .route("/", get(subscribe).post(post_offer).delete(delete_answer))
        .with_state(Arc::clone(&state));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr, state)
}

fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

#[test_timeout::tokio_timeout_test(20, multi_thread)]
async fn offers_travel_over_event_stream_and_answers_come_back() {
    init_tracing();
    let addr = spawn_server().await;
    let url = format!("http://user:pw@{addr}/");
    let a = HttpSignaler::new("a", &url).expect("signaler a");
    let b = HttpSignaler::new("b", &url).expect("signaler b");

    let mut sessions = a.accept().await.expect("accept");
    let responder = tokio::spawn(async move {
        let session = sessions.recv().await.expect("session");
        assert_eq!(session.description(), &SdpPayload::offer("v=0 offer"));
        session
            .resolve(SdpPayload::answer("v=0 answer"))
            .await
            .expect("resolve");
        sessions
    });

    let answer = b
        .handshake("a", SdpPayload::offer("v=0 offer"))
        .await
        .expect("handshake");
    assert_eq!(answer, SdpPayload::answer("v=0 answer"));

    let mut sessions = responder.await.expect("responder task");
    a.close().await.expect("close");
    a.close().await.expect("close twice");
    let ended = timeout(Duration::from_secs(5), sessions.recv())
        .await
        .expect("stream end");
    assert!(ended.is_none());
}

#[test_timeout::tokio_timeout_test(20, multi_thread)]
async fn offline_endpoint_and_bad_credentials_surface_status() {
    init_tracing();
    let addr = spawn_server().await;
    let b = HttpSignaler::new("b", &format!("http://user:pw@{addr}/")).expect("signaler");
    let err = b
        .handshake("offline", SdpPayload::offer("v=0"))
        .await
        .expect_err("offline");
    assert!(matches!(err, SignalingError::Status { status: 404, .. }));

    let intruder = HttpSignaler::new("c", &format!("http://user:nope@{addr}/")).expect("signaler");
    let err = intruder.accept().await.expect_err("unauthorized");
    assert!(matches!(err, SignalingError::Status { status: 401, .. }));
}

#[test_timeout::tokio_timeout_test(30, multi_thread)]
async fn accept_stream_survives_server_hangup() {
    init_tracing();
    let (addr, state) = spawn_server_with(ServerState {
        hang_up_first: true,
        ..Default::default()
    })
    .await;
    let url = format!("http://user:pw@{addr}/");
    let a = HttpSignaler::new("a", &url).expect("signaler a");
    let b = HttpSignaler::new("b", &url).expect("signaler b");

    let mut sessions = a.accept().await.expect("accept");
    // The first stream ends at once; wait for the resubscription.
    while !state.topics.lock().await.contains_key("a") {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(state.subscriptions.load(Ordering::SeqCst) >= 2);

    let responder = tokio::spawn(async move {
        let session = timeout(Duration::from_secs(10), sessions.recv())
            .await
            .expect("offer after reconnect")
            .expect("stream still open");
        session
            .resolve(SdpPayload::answer("v=0 late answer"))
            .await
            .expect("resolve");
    });
    let answer = b
        .handshake("a", SdpPayload::offer("v=0 late offer"))
        .await
        .expect("handshake");
    assert_eq!(answer, SdpPayload::answer("v=0 late answer"));
    responder.await.expect("responder task");
    a.close().await.expect("close");
}
