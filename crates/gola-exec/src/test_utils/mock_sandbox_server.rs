// src/test_utils/mock_sandbox_server.rs
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

use crate::providers::cloud::{RemoteExecuteRequest, RemoteExecuteResponse};

/// Scripted reply for one `POST /v1/execute`.
#[derive(Debug, Clone)]
pub enum MockReply {
    Json(RemoteExecuteResponse),
    Status(u16),
    /// Never answers within any sane test budget.
    Hang,
    /// Sends the status line and the start of an error body, then stalls.
    StalledStatus(u16),
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub payload: RemoteExecuteRequest,
    pub authorization: Option<String>,
}

#[derive(Clone)]
struct MockServerState {
    replies: Arc<Mutex<VecDeque<MockReply>>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    healthy: Arc<AtomicBool>,
    abandoned: Arc<AtomicUsize>,
}

/// Counts handlers that were dropped before they could answer.
struct AbandonGuard {
    counter: Arc<AtomicUsize>,
    answered: bool,
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        if !self.answered {
            self.counter.fetch_add(1, Ordering::SeqCst);
        }
    }
}

async fn execute_handler(
    State(state): State<MockServerState>,
    headers: HeaderMap,
    Json(payload): Json<RemoteExecuteRequest>,
) -> Response {
    log::debug!("Mock sandbox received request: {:?}", payload);
    let authorization = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    state.requests.lock().unwrap().push(RecordedRequest {
        payload,
        authorization,
    });

    let reply = state.replies.lock().unwrap().pop_front();
    match reply {
        Some(MockReply::Json(resp)) => Json(resp).into_response(),
        Some(MockReply::Status(code)) => status_code(code).into_response(),
        Some(MockReply::Hang) => {
            let mut guard = AbandonGuard {
                counter: state.abandoned.clone(),
                answered: false,
            };
            tokio::time::sleep(Duration::from_secs(300)).await;
            guard.answered = true;
            StatusCode::GATEWAY_TIMEOUT.into_response()
        }
        Some(MockReply::StalledStatus(code)) => {
            let body = stream::once(async {
                Ok::<_, std::io::Error>(Bytes::from_static(b"{\"error\": \"sandbox overloaded"))
            })
            .chain(stream::pending());
            (status_code(code), Body::from_stream(body)).into_response()
        }
        None => {
            log::error!("Mock sandbox ran out of replies!");
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

fn status_code(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

async fn health_handler(State(state): State<MockServerState>) -> StatusCode {
    if state.healthy.load(Ordering::SeqCst) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

pub struct MockSandboxServer {
    addr: SocketAddr,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
    healthy: Arc<AtomicBool>,
    abandoned: Arc<AtomicUsize>,
    pub recorded_requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl MockSandboxServer {
    pub async fn start(replies: Vec<MockReply>) -> Self {
        let state = MockServerState {
            replies: Arc::new(Mutex::new(VecDeque::from(replies))),
            requests: Arc::new(Mutex::new(Vec::new())),
            healthy: Arc::new(AtomicBool::new(true)),
            abandoned: Arc::new(AtomicUsize::new(0)),
        };
        let recorded_requests = state.requests.clone();
        let healthy = state.healthy.clone();
        let abandoned = state.abandoned.clone();

        let app = Router::new()
            .route("/v1/execute", post(execute_handler))
            .route("/v1/health", get(health_handler))
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap_or_else(|e| {
            panic!("Failed to bind mock sandbox to 127.0.0.1:0. Error: {}", e);
        });
        let addr = listener.local_addr().unwrap();
        log::info!("Mock sandbox listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .unwrap_or_else(|e| {
                    log::error!("Mock sandbox server error: {}", e);
                });
        });

        MockSandboxServer {
            addr,
            shutdown_tx,
            healthy,
            abandoned,
            recorded_requests,
        }
    }

    pub fn address(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Requests whose handler was dropped mid-flight, i.e. the client hung up.
    pub fn abandoned_requests(&self) -> usize {
        self.abandoned.load(Ordering::SeqCst)
    }

    /// Polls until `abandoned_requests()` reaches `expected` or `within` elapses.
    pub async fn wait_for_abandoned(&self, expected: usize, within: Duration) -> usize {
        let start = tokio::time::Instant::now();
        while self.abandoned_requests() < expected && start.elapsed() < within {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.abandoned_requests()
    }

    pub async fn shutdown(self) {
        if self.shutdown_tx.send(()).is_err() {
            log::warn!("Mock sandbox shutdown signal already sent or receiver dropped.");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
