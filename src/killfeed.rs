use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use axum::extract::Json;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::{debug, info, warn};

use crate::error::TrackerError;
use crate::registry::MatchRegistry;
use crate::vehicles::{detect_tank_kill, KeywordSet};

pub const SECRET_HEADER: &str = "x-webhook-secret";

#[derive(Debug, Clone, Default, Serialize)]
pub struct ListenerStatus {
    pub running: bool,
    pub connected: bool,
    pub last_event_at: Option<DateTime<Utc>>,
    pub events_seen: u64,
    pub kills_attributed: u64,
    pub disabled_reason: Option<String>,
}

/// Shared ingestion health record; the status query is the only externally
/// consumed read path out of this component.
#[derive(Debug, Default)]
pub struct ListenerState {
    inner: Mutex<ListenerStatus>,
}

impl ListenerState {
    fn lock(&self) -> MutexGuard<'_, ListenerStatus> {
        self.inner.lock().unwrap_or_else(|err| err.into_inner())
    }

    pub fn snapshot(&self) -> ListenerStatus {
        self.lock().clone()
    }

    pub fn set_running(&self, running: bool) {
        self.lock().running = running;
    }

    pub fn set_connected(&self, connected: bool) {
        let mut status = self.lock();
        status.connected = connected;
        if connected {
            status.running = true;
        }
    }

    pub fn record_event(&self, at: DateTime<Utc>) {
        let mut status = self.lock();
        status.events_seen += 1;
        status.last_event_at = Some(at);
    }

    pub fn record_attribution(&self) {
        self.lock().kills_attributed += 1;
    }

    pub fn disable(&self, reason: String) {
        let mut status = self.lock();
        status.running = false;
        status.connected = false;
        status.disabled_reason = Some(reason);
    }
}

/// Pulls the kill entries out of a log-stream frame
/// (`{"logs": [{"id": .., "log": {...}}]}`); anything else yields nothing.
pub fn extract_log_payloads(text: &str) -> Vec<Value> {
    let Ok(root) = serde_json::from_str::<Value>(text) else {
        return Vec::new();
    };
    let Some(logs) = root.get("logs").and_then(Value::as_array) else {
        return Vec::new();
    };
    logs.iter()
        .filter_map(|entry| {
            let log = entry.get("log")?;
            let action = log.get("action").and_then(Value::as_str).unwrap_or("");
            if !action.eq_ignore_ascii_case("kill") {
                return None;
            }
            Some(log.clone())
        })
        .collect()
}

fn subscription_payload() -> Value {
    json!({ "actions": ["KILL"], "last_seen_id": null })
}

fn verify_secret(secret: Option<&str>, headers: &HeaderMap) -> Result<(), TrackerError> {
    let Some(expected) = secret else {
        return Ok(());
    };
    let provided = headers
        .get(SECRET_HEADER)
        .and_then(|value| value.to_str().ok());
    if provided == Some(expected) {
        Ok(())
    } else {
        Err(TrackerError::IngestionAuth)
    }
}

/// Inbound webhook delivery. A configured shared secret must match exactly or
/// the event is discarded with an authentication failure before any state is
/// touched.
pub fn handle_webhook(
    secret: Option<&str>,
    state: &ListenerState,
    tx: &UnboundedSender<Value>,
    headers: &HeaderMap,
    payload: Value,
) -> StatusCode {
    if let Err(err) = verify_secret(secret, headers) {
        warn!(%err, "inbound kill event rejected");
        return StatusCode::UNAUTHORIZED;
    }
    if !payload.is_object() {
        return StatusCode::BAD_REQUEST;
    }
    state.record_event(Utc::now());
    if tx.send(payload).is_ok() {
        StatusCode::ACCEPTED
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

pub fn ingest_router(
    path: &str,
    secret: Option<String>,
    state: Arc<ListenerState>,
    tx: UnboundedSender<Value>,
) -> Router {
    Router::new().route(
        path,
        post({
            move |headers: HeaderMap, payload: Json<Value>| {
                let secret = secret.clone();
                let state = state.clone();
                let tx = tx.clone();
                async move { handle_webhook(secret.as_deref(), &state, &tx, &headers, payload.0) }
            }
        }),
    )
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub url: String,
    pub api_key: String,
    pub backoff_base_secs: f64,
    pub backoff_max_secs: f64,
    pub auth_fail_limit: u32,
}

enum StreamError {
    Auth(u16),
    Other(String),
}

type KillSocket = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn open_stream(config: &StreamConfig) -> Result<KillSocket, StreamError> {
    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|err| StreamError::Other(err.to_string()))?;
    let bearer = HeaderValue::from_str(&format!("Bearer {}", config.api_key))
        .map_err(|err| StreamError::Other(err.to_string()))?;
    request.headers_mut().insert("Authorization", bearer);

    match connect_async(request).await {
        Ok((mut socket, _response)) => {
            socket
                .send(tokio_tungstenite::tungstenite::Message::Text(
                    subscription_payload().to_string(),
                ))
                .await
                .map_err(|err| StreamError::Other(err.to_string()))?;
            Ok(socket)
        }
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            let status = response.status().as_u16();
            if status == 401 || status == 403 {
                Err(StreamError::Auth(status))
            } else {
                Err(StreamError::Other(format!("http status {status}")))
            }
        }
        Err(err) => Err(StreamError::Other(err.to_string())),
    }
}

pub fn spawn_stream_listener(
    config: StreamConfig,
    state: Arc<ListenerState>,
    tx: UnboundedSender<Value>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        run_stream_listener(config, state, tx).await;
    })
}

/// Persistent subscription to the control API's log stream. Reconnects with
/// exponential backoff; repeated authentication rejections disable the
/// listener with a recorded reason instead of hammering the endpoint.
async fn run_stream_listener(config: StreamConfig, state: Arc<ListenerState>, tx: UnboundedSender<Value>) {
    state.set_running(true);
    let base = config.backoff_base_secs.max(0.01);
    let max = config.backoff_max_secs.max(base);
    let mut backoff = base;
    let mut auth_failures = 0u32;
    info!(url = %config.url, "kill feed stream listener started");

    loop {
        match open_stream(&config).await {
            Ok(mut socket) => {
                auth_failures = 0;
                backoff = base;
                state.set_connected(true);
                info!(url = %config.url, "kill feed stream connected");

                while let Some(next) = socket.next().await {
                    let text = match next {
                        Ok(tokio_tungstenite::tungstenite::Message::Text(text)) => text,
                        Ok(tokio_tungstenite::tungstenite::Message::Close(_)) => break,
                        Ok(_) => continue,
                        Err(err) => {
                            warn!(?err, "kill feed stream read error");
                            break;
                        }
                    };
                    for payload in extract_log_payloads(&text) {
                        state.record_event(Utc::now());
                        if tx.send(payload).is_err() {
                            warn!("kill receiver dropped; stopping stream listener");
                            state.set_connected(false);
                            state.set_running(false);
                            return;
                        }
                    }
                }
                state.set_connected(false);
                warn!("kill feed stream disconnected, retrying");
            }
            Err(StreamError::Auth(status)) => {
                auth_failures += 1;
                state.set_connected(false);
                warn!(status, auth_failures, "kill feed stream authentication rejected");
                if auth_failures >= config.auth_fail_limit {
                    state.disable(format!(
                        "Authentication failed {auth_failures} time(s); listener disabled"
                    ));
                    return;
                }
            }
            Err(StreamError::Other(reason)) => {
                state.set_connected(false);
                warn!(%reason, "failed connecting kill feed stream");
            }
        }

        sleep(Duration::from_secs_f64(backoff)).await;
        backoff = (backoff * 2.0).min(max);
    }
}

/// Drains raw kill payloads, filters them against the keyword set and feeds
/// qualifying events into the registry.
pub fn spawn_attribution_pump(
    registry: Arc<MatchRegistry>,
    keywords: KeywordSet,
    mut rx: UnboundedReceiver<Value>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            match detect_tank_kill(&payload, &keywords) {
                Some(detection) => {
                    let attributed = registry.attribute_kill(&detection);
                    debug!(
                        killer = %detection.killer_name,
                        keyword = %detection.keyword_match,
                        group = %detection.keyword_group,
                        attributed,
                        "tank kill processed"
                    );
                }
                None => debug!("kill event did not match keyword set; discarded"),
            }
        }
        info!("kill ingestion channel closed; attribution pump exiting");
    })
}
