//! simwire integration test harness.
//!
//! Tests run against a scripted simulator served by axum on 127.0.0.1 and
//! real UDP sockets on loopback. No external setup is needed:
//!
//!   cargo test --test integration
//!
//! Each test starts its own mock simulator and transports.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use reqwest::Url;
use serde_json::Value;
use tokio::sync::mpsc;

use simwire_core::config::SimwireConfig;

mod caps;
mod event_queue;
mod transport;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(10);

type Script = Arc<Mutex<VecDeque<(StatusCode, Value)>>>;
type Log = Arc<Mutex<Vec<Value>>>;

#[derive(Clone, Default)]
struct SimState {
    seed_script: Script,
    seed_requests: Log,
    queue_script: Script,
    queue_requests: Log,
    queue_hold: Arc<Mutex<Duration>>,
    queue_answered: Arc<AtomicUsize>,
}

/// A scripted simulator with a seed capability at `/seed` and an event
/// queue at `/eq`.
///
/// Scripted responses are served in order. Once the seed script runs out it
/// answers 500; once the event-queue script runs out it holds each poll
/// briefly and answers 502, like an idle long-poll.
pub struct MockSim {
    addr: SocketAddr,
    state: SimState,
}

impl MockSim {
    pub async fn start() -> Result<Self> {
        let state = SimState::default();
        let app = Router::new()
            .route("/seed", post(handle_seed))
            .route("/eq", post(handle_event_queue))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind mock simulator")?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        Ok(Self { addr, state })
    }

    pub fn url(&self, path: &str) -> Url {
        Url::parse(&format!("http://{}{}", self.addr, path)).expect("valid mock URL")
    }

    pub fn seed_url(&self) -> Url {
        self.url("/seed")
    }

    pub fn push_seed(&self, status: StatusCode, body: Value) {
        self.state.seed_script.lock().unwrap().push_back((status, body));
    }

    pub fn push_poll(&self, status: StatusCode, body: Value) {
        self.state.queue_script.lock().unwrap().push_back((status, body));
    }

    /// Delay every event-queue answer, scripted or not, by `hold`.
    pub fn hold_polls(&self, hold: Duration) {
        *self.state.queue_hold.lock().unwrap() = hold;
    }

    pub fn seed_requests(&self) -> Vec<Value> {
        self.state.seed_requests.lock().unwrap().clone()
    }

    pub fn poll_requests(&self) -> Vec<Value> {
        self.state.queue_requests.lock().unwrap().clone()
    }

    /// Polls the simulator answered. A poll abandoned by the client is
    /// requested but never answered.
    pub fn polls_answered(&self) -> usize {
        self.state.queue_answered.load(Ordering::SeqCst)
    }
}

async fn handle_seed(State(state): State<SimState>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    state.seed_requests.lock().unwrap().push(body);
    let next = state.seed_script.lock().unwrap().pop_front();
    let (status, body) = next.unwrap_or((StatusCode::INTERNAL_SERVER_ERROR, Value::Null));
    (status, Json(body))
}

async fn handle_event_queue(
    State(state): State<SimState>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    state.queue_requests.lock().unwrap().push(body);
    let hold = *state.queue_hold.lock().unwrap();
    let next = state.queue_script.lock().unwrap().pop_front();
    let answer = match next {
        Some((status, body)) => {
            tokio::time::sleep(hold).await;
            (status, Json(body))
        }
        None => {
            tokio::time::sleep(hold.max(Duration::from_millis(50))).await;
            (StatusCode::BAD_GATEWAY, Json(Value::Null))
        }
    };
    state.queue_answered.fetch_add(1, Ordering::SeqCst);
    answer
}

/// Defaults with short retries and a loopback circuit address.
pub fn test_config() -> SimwireConfig {
    let mut config = SimwireConfig::default();
    config.network.bind_addr = "127.0.0.1:0".parse().unwrap();
    config.caps.retry_initial_ms = 10;
    config.caps.retry_max_ms = 50;
    config.caps.request_timeout_ms = 2_000;
    config.event_queue.poll_timeout_ms = 5_000;
    config
}

/// Receive until `pred` matches, skipping anything else.
pub async fn next_matching<T>(
    rx: &mut mpsc::UnboundedReceiver<T>,
    what: &str,
    pred: impl Fn(&T) -> bool,
) -> T {
    let found = tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Some(item) if pred(&item) => return Some(item),
                Some(_) => continue,
                None => return None,
            }
        }
    })
    .await;
    match found {
        Ok(Some(item)) => item,
        Ok(None) => panic!("channel closed while waiting for {what}"),
        Err(_) => panic!("timed out waiting for {what}"),
    }
}

/// Poll `condition` every 10ms until it holds or [`WAIT`] passes.
pub async fn wait_for_condition(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
