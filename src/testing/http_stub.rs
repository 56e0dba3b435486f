//! Local HTTP endpoint with scripted responses, for unit tests.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

#[derive(Default)]
struct StubState {
    responses: Mutex<VecDeque<(u16, serde_json::Value)>>,
    bodies: Mutex<Vec<serde_json::Value>>,
    authorization: Mutex<Vec<Option<String>>>,
}

async fn respond(
    State(state): State<Arc<StubState>>,
    headers: HeaderMap,
    body: String,
) -> (StatusCode, Json<serde_json::Value>) {
    let parsed = serde_json::from_str(&body).unwrap_or(serde_json::Value::Null);
    state.bodies.lock().unwrap().push(parsed);
    state.authorization.lock().unwrap().push(
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    );

    let mut responses = state.responses.lock().unwrap();
    let (status, body) = if responses.len() > 1 {
        responses.pop_front().unwrap()
    } else {
        responses
            .front()
            .cloned()
            .unwrap_or((200, serde_json::Value::Null))
    };
    (
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        Json(body),
    )
}

/// Answers every request with the next scripted `(status, json)` pair; the
/// last pair repeats.
pub struct StubServer {
    addr: SocketAddr,
    state: Arc<StubState>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl StubServer {
    pub async fn start(responses: Vec<(u16, serde_json::Value)>) -> Self {
        let state = Arc::new(StubState {
            responses: Mutex::new(responses.into()),
            ..StubState::default()
        });
        let app = Router::new().fallback(respond).with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind should succeed");
        let addr = listener.local_addr().expect("local_addr should succeed");

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        Self {
            addr,
            state,
            shutdown: Some(shutdown_tx),
        }
    }

    /// Base URL, e.g. `http://127.0.0.1:PORT`.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn hits(&self) -> usize {
        self.state.bodies.lock().unwrap().len()
    }

    pub fn bodies(&self) -> Vec<serde_json::Value> {
        self.state.bodies.lock().unwrap().clone()
    }

    pub fn authorization(&self) -> Vec<Option<String>> {
        self.state.authorization.lock().unwrap().clone()
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}
