mod clock;
mod config;
mod crcon;
mod error;
mod events;
mod killfeed;
mod reconcile;
mod registry;
mod score;
mod store;
mod vehicles;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::Query;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::{AppConfig, KillFeedMode};
use crate::error::TrackerError;
use crate::events::{ChannelId, DisplayEvent, Side, StopReason};
use crate::killfeed::ListenerState;
use crate::registry::MatchRegistry;
use crate::store::Store;
use crate::vehicles::{derive_keywords_from_tanks_file, KeywordSet};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Missing credentials are the only fatal startup condition; the check
    // runs before any match logic.
    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(err) => {
            error!(?err, "configuration invalid; refusing to start");
            return Err(err);
        }
    };
    info!(
        crcon = %config.crcon_url,
        interval_secs = config.update_interval_secs,
        auto_switch = config.auto_switch_default,
        "starting tank overwatch service"
    );

    let keywords = resolve_keywords(&config);
    info!(keywords = keywords.len(), "kill filter keyword set loaded");

    let (event_tx, event_rx) = mpsc::unbounded_channel::<DisplayEvent>();
    let (kill_tx, kill_rx) = mpsc::unbounded_channel::<Value>();
    let ingestion = Arc::new(ListenerState::default());
    let registry = MatchRegistry::new(
        config.clone(),
        Store::new(&config.data_dir),
        event_tx,
        ingestion.clone(),
    );

    let sink_task = tokio::spawn(run_display_sink(event_rx));
    let pump_task = killfeed::spawn_attribution_pump(registry.clone(), keywords, kill_rx);

    let mut app = command_router(registry.clone()).route("/health", get(|| async { "ok" }));
    let mut stream_task = None;
    match config.kill_feed_mode {
        KillFeedMode::Webhook => {
            app = app.merge(killfeed::ingest_router(
                &config.webhook_path,
                config.webhook_secret.clone(),
                ingestion.clone(),
                kill_tx.clone(),
            ));
            info!(path = %config.webhook_path, "kill webhook ingestion enabled");
        }
        KillFeedMode::Stream => {
            stream_task = Some(killfeed::spawn_stream_listener(
                killfeed::StreamConfig {
                    url: config.stream_url.clone(),
                    api_key: config.crcon_api_key.clone(),
                    backoff_base_secs: config.backoff_base_secs,
                    backoff_max_secs: config.backoff_max_secs,
                    auth_fail_limit: config.auth_fail_limit,
                },
                ingestion.clone(),
                kill_tx.clone(),
            ));
        }
        KillFeedMode::Off => info!("kill feed ingestion disabled"),
    }
    drop(kill_tx);

    let listener = TcpListener::bind(config.webhook_bind)
        .await
        .with_context(|| format!("failed binding http listener on {}", config.webhook_bind))?;
    info!("command api listening on http://{}", config.webhook_bind);
    if config.kill_feed_mode == KillFeedMode::Webhook {
        ingestion.set_connected(true);
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("http server failed")?;
    info!("shutdown requested");

    // Final flush: every live match gets one finalize and one last broadcast.
    for channel in registry.active_channels() {
        if let Err(err) = registry.stop_match(channel, StopReason::Manual).await {
            warn!(?err, channel, "failed stopping match during shutdown");
        }
    }
    if let Some(task) = stream_task {
        task.abort();
    }
    pump_task.abort();
    sink_task.abort();
    Ok(())
}

fn resolve_keywords(config: &AppConfig) -> KeywordSet {
    if let Some(path) = &config.tanks_file {
        match derive_keywords_from_tanks_file(path) {
            Ok(set) if !set.is_empty() => {
                info!(path = %path.display(), keywords = set.len(), "derived kill keywords from tanks file");
                return set;
            }
            Ok(_) => {
                warn!(path = %path.display(), "tanks file yielded no keywords; using builtin set")
            }
            Err(err) => {
                warn!(?err, path = %path.display(), "failed deriving keywords; using builtin set")
            }
        }
    }
    KeywordSet::builtin()
}

/// Journals every state event. The rendering front end consumes the same
/// event stream; this process makes no assumption about how it renders.
async fn run_display_sink(mut rx: mpsc::UnboundedReceiver<DisplayEvent>) {
    while let Some(event) = rx.recv().await {
        info!(target: "display", "{}", event.feed_label());
    }
}

#[derive(Debug, Deserialize)]
struct ChannelBody {
    channel: ChannelId,
}

#[derive(Debug, Deserialize)]
struct SwitchBody {
    channel: ChannelId,
    side: Side,
}

#[derive(Debug, Deserialize)]
struct ChannelQuery {
    channel: ChannelId,
}

/// One route per front-end command, mapped 1:1 onto coordinator operations.
fn command_router(registry: Arc<MatchRegistry>) -> Router {
    Router::new()
        .route(
            "/commands/start",
            post({
                let registry = registry.clone();
                move |payload: Json<ChannelBody>| {
                    let registry = registry.clone();
                    async move {
                        match registry.start_match(payload.0.channel).await {
                            Ok(outcome) => ok_response(json!({ "start": outcome })),
                            Err(err) => reject(err),
                        }
                    }
                }
            }),
        )
        .route(
            "/commands/switch",
            post({
                let registry = registry.clone();
                move |payload: Json<SwitchBody>| {
                    let registry = registry.clone();
                    async move {
                        match registry.manual_switch(payload.0.channel, payload.0.side).await {
                            Ok(snapshot) => ok_response(json!({ "snapshot": snapshot })),
                            Err(err) => reject(err),
                        }
                    }
                }
            }),
        )
        .route(
            "/commands/auto",
            post({
                let registry = registry.clone();
                move |payload: Json<ChannelBody>| {
                    let registry = registry.clone();
                    async move {
                        match registry.toggle_auto_switch(payload.0.channel).await {
                            Ok(enabled) => ok_response(json!({ "auto_switch": enabled })),
                            Err(err) => reject(err),
                        }
                    }
                }
            }),
        )
        .route(
            "/commands/stop",
            post({
                let registry = registry.clone();
                move |payload: Json<ChannelBody>| {
                    let registry = registry.clone();
                    async move {
                        match registry.stop_match(payload.0.channel, StopReason::Manual).await {
                            Ok(report) => ok_response(json!({ "report": report })),
                            Err(err) => reject(err),
                        }
                    }
                }
            }),
        )
        .route(
            "/commands/stats",
            get({
                let registry = registry.clone();
                move |query: Query<ChannelQuery>| {
                    let registry = registry.clone();
                    async move {
                        match registry.live_stats(query.0.channel).await {
                            Ok(stats) => {
                                let (allies_pct, axis_pct) =
                                    score::control_percentages(&stats.snapshot)
                                        .unwrap_or((0.0, 0.0));
                                let control = json!({
                                    "leader": stats.snapshot.leader(),
                                    "allies_pct": allies_pct,
                                    "axis_pct": axis_pct,
                                    "allies_clock": score::format_clock(stats.snapshot.seconds_allies),
                                    "axis_clock": score::format_clock(stats.snapshot.seconds_axis),
                                });
                                ok_response(json!({ "stats": stats, "control": control }))
                            }
                            Err(err) => reject(err),
                        }
                    }
                }
            }),
        )
        .route(
            "/commands/ingestion",
            get({
                let registry = registry.clone();
                move || {
                    let registry = registry.clone();
                    async move { ok_response(json!({ "ingestion": registry.ingestion_health() })) }
                }
            }),
        )
}

fn ok_response(mut body: Value) -> (StatusCode, Json<Value>) {
    if let Some(map) = body.as_object_mut() {
        map.insert("ok".to_owned(), Value::Bool(true));
    }
    (StatusCode::OK, Json(body))
}

/// Invalid transitions come back as clear rejections, never silent no-ops.
fn reject(err: TrackerError) -> (StatusCode, Json<Value>) {
    let status = match &err {
        TrackerError::UnknownChannel(_) => StatusCode::NOT_FOUND,
        TrackerError::State(_) => StatusCode::CONFLICT,
        TrackerError::Authentication { .. } | TrackerError::IngestionAuth => {
            StatusCode::UNAUTHORIZED
        }
        TrackerError::MessageTooLong { .. } => StatusCode::BAD_REQUEST,
        TrackerError::TransientFetch(_) => StatusCode::BAD_GATEWAY,
    };
    (status, Json(json!({ "ok": false, "error": err.to_string() })))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    use super::command_router;
    use crate::config::AppConfig;
    use crate::events::DisplayEvent;
    use crate::killfeed::ListenerState;
    use crate::registry::MatchRegistry;
    use crate::store::Store;

    async fn serve_commands() -> (String, mpsc::UnboundedReceiver<DisplayEvent>, std::path::PathBuf)
    {
        let unique = std::time::SystemTime::now()
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .expect("clock should be valid")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("overwatch_main_{unique}"));
        let config = AppConfig::from_lookup(|key| match key {
            "CRCON_API_KEY" => Some("test-key".to_owned()),
            _ => None,
        })
        .expect("test config should load");
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let registry = MatchRegistry::new(
            config,
            Store::new(&dir),
            event_tx,
            Arc::new(ListenerState::default()),
        );
        let app = command_router(registry);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("should bind test listener");
        let addr = listener.local_addr().expect("listener should have an addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        (format!("http://{addr}"), event_rx, dir)
    }

    #[tokio::test]
    async fn unknown_channel_commands_are_rejected_with_not_found() {
        let (base, _rx, dir) = serve_commands().await;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("client should build");

        let response = client
            .post(format!("{base}/commands/switch"))
            .json(&json!({"channel": 42, "side": "allies"}))
            .send()
            .await
            .expect("request should complete");
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
        let body: Value = response.json().await.expect("body should be json");
        assert_eq!(body["ok"], false);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn ingestion_health_is_always_queryable() {
        let (base, _rx, dir) = serve_commands().await;
        let client = reqwest::Client::new();

        let response = client
            .get(format!("{base}/commands/ingestion"))
            .send()
            .await
            .expect("request should complete");
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let body: Value = response.json().await.expect("body should be json");
        assert_eq!(body["ok"], true);
        assert_eq!(body["ingestion"]["events_seen"], 0);

        std::fs::remove_dir_all(&dir).ok();
    }
}
