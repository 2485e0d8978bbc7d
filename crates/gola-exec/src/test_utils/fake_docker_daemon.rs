// src/test_utils/fake_docker_daemon.rs
use axum::extract::State;
use axum::http::{header, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

pub const FAKE_CONTAINER_ID: &str = "fakecontainer";

/// Just enough of the Docker Engine API for one container lifecycle. `wait`
/// never answers, so every execution runs into its deadline.
#[derive(Clone)]
struct FakeDaemonState {
    requests: Arc<Mutex<Vec<(Method, String)>>>,
    removals_completed: Arc<AtomicUsize>,
    remove_delay: Duration,
    stdout: &'static str,
}

/// One multiplexed log frame: stream type, three zero bytes, big-endian length.
fn log_frame(stream: u8, payload: &str) -> Vec<u8> {
    let mut frame = vec![stream, 0, 0, 0];
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload.as_bytes());
    frame
}

async fn handler(State(state): State<FakeDaemonState>, method: Method, uri: Uri) -> Response {
    let path = uri.path().to_string();
    log::debug!("Fake docker daemon received {} {}", method, path);
    state.requests.lock().unwrap().push((method.clone(), path.clone()));

    match method {
        Method::DELETE => {
            tokio::time::sleep(state.remove_delay).await;
            state.removals_completed.fetch_add(1, Ordering::SeqCst);
            StatusCode::NO_CONTENT.into_response()
        }
        Method::GET if path.ends_with("/_ping") => "OK".into_response(),
        Method::GET if path.contains("/images/") && path.ends_with("/json") => {
            Json(json!({ "Id": "sha256:fake" })).into_response()
        }
        Method::GET if path.ends_with("/logs") => (
            [(header::CONTENT_TYPE, "application/vnd.docker.multiplexed-stream")],
            log_frame(1, state.stdout),
        )
            .into_response(),
        Method::POST if path.ends_with("/containers/create") => (
            StatusCode::CREATED,
            Json(json!({ "Id": FAKE_CONTAINER_ID, "Warnings": [] })),
        )
            .into_response(),
        Method::POST if path.ends_with("/start") || path.ends_with("/kill") => {
            StatusCode::NO_CONTENT.into_response()
        }
        Method::POST if path.ends_with("/wait") => {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            StatusCode::GATEWAY_TIMEOUT.into_response()
        }
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

pub struct FakeDockerDaemon {
    addr: SocketAddr,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
    requests: Arc<Mutex<Vec<(Method, String)>>>,
    removals_completed: Arc<AtomicUsize>,
}

impl FakeDockerDaemon {
    /// `remove_delay` is how long each `DELETE` takes before it completes.
    pub async fn start(remove_delay: Duration, stdout: &'static str) -> Self {
        let state = FakeDaemonState {
            requests: Arc::new(Mutex::new(Vec::new())),
            removals_completed: Arc::new(AtomicUsize::new(0)),
            remove_delay,
            stdout,
        };
        let requests = state.requests.clone();
        let removals_completed = state.removals_completed.clone();

        let app = Router::new().fallback(handler).with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap_or_else(|e| {
            panic!("Failed to bind fake docker daemon to 127.0.0.1:0. Error: {}", e);
        });
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .unwrap_or_else(|e| {
                    log::error!("Fake docker daemon error: {}", e);
                });
        });

        FakeDockerDaemon {
            addr,
            shutdown_tx,
            requests,
            removals_completed,
        }
    }

    pub fn address(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn count(&self, method: Method, path_suffix: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, p)| *m == method && p.ends_with(path_suffix))
            .count()
    }

    pub fn removals_completed(&self) -> usize {
        self.removals_completed.load(Ordering::SeqCst)
    }

    /// Polls until `removals_completed()` reaches `expected` or `within` elapses.
    pub async fn wait_for_removals(&self, expected: usize, within: Duration) -> usize {
        let start = tokio::time::Instant::now();
        while self.removals_completed() < expected && start.elapsed() < within {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.removals_completed()
    }

    pub async fn shutdown(self) {
        if self.shutdown_tx.send(()).is_err() {
            log::warn!("Fake docker daemon shutdown signal already sent or receiver dropped.");
        }
    }
}
