use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::AUTHORIZATION;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::TrackerError;
use crate::events::{RemoteScores, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthStrategy {
    Bearer,
    RawAuthorization,
    ApiKeyHeader,
}

impl AuthStrategy {
    const ORDERED: [AuthStrategy; 3] = [
        AuthStrategy::Bearer,
        AuthStrategy::RawAuthorization,
        AuthStrategy::ApiKeyHeader,
    ];

    fn describe(self) -> &'static str {
        match self {
            AuthStrategy::Bearer => "bearer",
            AuthStrategy::RawAuthorization => "raw-authorization",
            AuthStrategy::ApiKeyHeader => "x-api-key",
        }
    }

    fn apply(self, request: reqwest::RequestBuilder, key: &str) -> reqwest::RequestBuilder {
        match self {
            AuthStrategy::Bearer => request.header(AUTHORIZATION, format!("Bearer {key}")),
            AuthStrategy::RawAuthorization => request.header(AUTHORIZATION, key.to_owned()),
            AuthStrategy::ApiKeyHeader => request.header("X-API-Key", key.to_owned()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CrconSettings {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
    pub message_cap: usize,
    pub bot_name: String,
}

/// Per-sub-fetch outcome. `Ok` carries the unwrapped `result` payload,
/// `Degraded` a decoded body without the expected envelope (cross-version
/// drift), `Failed` a transport or decode failure. Both non-`Ok` shapes
/// degrade that field for the cycle instead of failing the aggregate call.
#[derive(Debug)]
pub enum SubFetch {
    Ok(Value),
    Degraded(Value),
    Failed(String),
}

impl SubFetch {
    fn into_usable(self, endpoint: &str) -> Option<Value> {
        match self {
            SubFetch::Ok(payload) => Some(payload),
            SubFetch::Degraded(body) => {
                warn!(endpoint, body = %truncate_for_log(&body), "response missing result envelope; treating as unknown");
                None
            }
            SubFetch::Failed(reason) => {
                warn!(endpoint, %reason, "sub-fetch failed; treating as unknown");
                None
            }
        }
    }
}

pub fn result_of(payload: &Value) -> Option<&Value> {
    payload.as_object()?.get("result")
}

fn truncate_for_log(value: &Value) -> String {
    let mut text = value.to_string();
    if text.len() > 200 {
        text.truncate(200);
        text.push_str("...");
    }
    text
}

#[derive(Debug, Clone, Default)]
pub struct GameState {
    pub scores: RemoteScores,
    pub time_remaining: Option<f64>,
    pub num_allied_players: u32,
    pub num_axis_players: u32,
}

impl GameState {
    pub fn from_result(result: &Value) -> GameState {
        GameState {
            scores: RemoteScores {
                allies: result.get("allied_score").and_then(Value::as_i64).unwrap_or(0),
                axis: result.get("axis_score").and_then(Value::as_i64).unwrap_or(0),
            },
            time_remaining: result.get("time_remaining").and_then(Value::as_f64),
            num_allied_players: result
                .get("num_allied_players")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32,
            num_axis_players: result
                .get("num_axis_players")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32,
        }
    }

    pub fn player_count(&self) -> u32 {
        self.num_allied_players + self.num_axis_players
    }
}

#[derive(Debug, Clone)]
pub struct MapInfo {
    pub pretty_name: String,
    pub game_mode: Option<String>,
}

impl MapInfo {
    pub fn from_result(result: &Value) -> MapInfo {
        let nested = result.get("map").and_then(Value::as_object);
        let pretty_name = result
            .get("pretty_name")
            .and_then(Value::as_str)
            .or_else(|| nested.and_then(|map| map.get("pretty_name").and_then(Value::as_str)))
            .or_else(|| nested.and_then(|map| map.get("name").and_then(Value::as_str)))
            .unwrap_or("Unknown")
            .to_owned();
        let game_mode = result
            .get("game_mode")
            .and_then(Value::as_str)
            .or_else(|| nested.and_then(|map| map.get("game_mode").and_then(Value::as_str)))
            .map(|mode| mode.to_ascii_lowercase());
        MapInfo {
            pretty_name,
            game_mode,
        }
    }

    /// Only warfare maps have a contestable center objective. An unknown mode
    /// is assumed capturable unless the map name says otherwise.
    pub fn supports_capture(&self) -> bool {
        if let Some(mode) = &self.game_mode {
            return mode == "warfare";
        }
        let name = self.pretty_name.to_ascii_lowercase();
        !(name.contains("offensive") || name.contains("skirmish"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    pub name: String,
    pub player_id: String,
}

/// Roster payloads arrive either as `[name, id]` pairs or as objects, varying
/// with the remote version.
pub fn parse_roster(result: &Value) -> Vec<RosterEntry> {
    let entries = match result {
        Value::Array(entries) => entries.as_slice(),
        Value::Object(map) => match map.get("players").and_then(Value::as_array) {
            Some(entries) => entries.as_slice(),
            None => return Vec::new(),
        },
        _ => return Vec::new(),
    };

    let mut roster = Vec::with_capacity(entries.len());
    for entry in entries {
        match entry {
            Value::Array(pair) if pair.len() >= 2 => {
                let (Some(name), Some(player_id)) = (pair[0].as_str(), pair[1].as_str()) else {
                    continue;
                };
                roster.push(RosterEntry {
                    name: name.to_owned(),
                    player_id: player_id.to_owned(),
                });
            }
            Value::Object(map) => {
                let name = map.get("name").and_then(Value::as_str).unwrap_or_default();
                let player_id = map
                    .get("player_id")
                    .or_else(|| map.get("steam_id_64"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if name.is_empty() && player_id.is_empty() {
                    continue;
                }
                roster.push(RosterEntry {
                    name: name.to_owned(),
                    player_id: player_id.to_owned(),
                });
            }
            _ => continue,
        }
    }
    roster
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlayerDetail {
    pub name: String,
    pub player_id: Option<String>,
    pub team: Option<Side>,
    pub combat: f64,
    pub role: Option<String>,
}

impl PlayerDetail {
    pub fn is_commander(&self) -> bool {
        matches!(
            self.role.as_deref().map(str::to_ascii_lowercase).as_deref(),
            Some("armycommander") | Some("commander")
        )
    }
}

fn player_from_value(value: &Value, side_hint: Option<Side>) -> Option<PlayerDetail> {
    let map = value.as_object()?;
    let name = map.get("name").and_then(Value::as_str).unwrap_or_default();
    if name.is_empty() {
        return None;
    }
    Some(PlayerDetail {
        name: name.to_owned(),
        player_id: map
            .get("player_id")
            .or_else(|| map.get("steam_id_64"))
            .and_then(Value::as_str)
            .map(str::to_owned),
        team: map
            .get("team")
            .and_then(Value::as_str)
            .and_then(Side::parse)
            .or(side_hint),
        combat: map.get("combat").and_then(Value::as_f64).unwrap_or(0.0),
        role: map.get("role").and_then(Value::as_str).map(str::to_owned),
    })
}

/// Detailed-player payloads come as `{"players": {id: {...}}}`, as
/// `{"players": [...]}` or as a bare array depending on the remote version.
pub fn parse_player_details(result: &Value) -> Vec<PlayerDetail> {
    let mut out = Vec::new();
    let mut push = |value: &Value| out.extend(player_from_value(value, None));

    match result {
        Value::Array(entries) => entries.iter().for_each(&mut push),
        Value::Object(map) => match map.get("players") {
            Some(Value::Array(entries)) => entries.iter().for_each(&mut push),
            Some(Value::Object(by_id)) => by_id.values().for_each(&mut push),
            _ => {}
        },
        _ => {}
    }
    out
}

/// The team scoreboard nests players under per-team squads plus a commander
/// slot; used as the fallback source of player details when the detailed
/// stats endpoint degrades.
pub fn parse_team_view_players(result: &Value) -> Vec<PlayerDetail> {
    let mut out = Vec::new();
    let Some(teams) = result.as_object() else {
        return out;
    };
    for (team_name, team) in teams {
        let Some(side) = Side::parse(team_name) else {
            continue;
        };
        let Some(team_obj) = team.as_object() else {
            continue;
        };
        if let Some(commander) = team_obj.get("commander") {
            out.extend(player_from_value(commander, Some(side)));
        }
        if let Some(squads) = team_obj.get("squads").and_then(Value::as_object) {
            for squad in squads.values() {
                if let Some(players) = squad.get("players").and_then(Value::as_array) {
                    for player in players {
                        out.extend(player_from_value(player, Some(side)));
                    }
                }
            }
        }
    }
    out
}

#[derive(Debug, Clone)]
pub struct LiveState {
    pub game: Option<GameState>,
    pub map: Option<MapInfo>,
    pub roster: Option<Vec<RosterEntry>>,
    pub players: Option<Vec<PlayerDetail>>,
    pub fetched_at: DateTime<Utc>,
}

impl LiveState {
    pub fn player_details(&self) -> &[PlayerDetail] {
        self.players.as_deref().unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub total: usize,
}

/// Client for the game-server control API. One instance per match; a
/// reconnect replaces the whole client rather than layering sessions.
#[derive(Debug)]
pub struct CrconClient {
    settings: CrconSettings,
    http: reqwest::Client,
    auth: AuthStrategy,
}

impl CrconClient {
    /// Probes the ordered auth-strategy list against the status endpoint and
    /// caches the first accepted strategy for the client's lifetime.
    pub async fn connect(mut settings: CrconSettings) -> Result<CrconClient, TrackerError> {
        settings.base_url = settings.base_url.trim_end_matches('/').to_owned();
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|err| TrackerError::TransientFetch(err.to_string()))?;

        let status_url = format!("{}/api/get_status", settings.base_url);
        let mut saw_response = false;
        let mut last_transport_error = String::new();
        for strategy in AuthStrategy::ORDERED {
            let request = strategy.apply(http.get(&status_url), &settings.api_key);
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    info!(
                        strategy = strategy.describe(),
                        url = %settings.base_url,
                        "authenticated against control api"
                    );
                    return Ok(CrconClient {
                        settings,
                        http,
                        auth: strategy,
                    });
                }
                Ok(response) => {
                    saw_response = true;
                    debug!(
                        strategy = strategy.describe(),
                        status = %response.status(),
                        "auth strategy rejected"
                    );
                }
                Err(err) => {
                    last_transport_error = err.to_string();
                    warn!(?err, strategy = strategy.describe(), "status probe failed");
                }
            }
        }

        if saw_response {
            Err(TrackerError::Authentication {
                url: settings.base_url,
            })
        } else {
            Err(TrackerError::TransientFetch(format!(
                "control api unreachable at {}: {last_transport_error}",
                settings.base_url
            )))
        }
    }

    async fn get_endpoint(&self, endpoint: &str) -> SubFetch {
        let url = format!("{}{}", self.settings.base_url, endpoint);
        let request = self.auth.apply(self.http.get(&url), &self.settings.api_key);
        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => return SubFetch::Failed(err.to_string()),
        };
        if !response.status().is_success() {
            return SubFetch::Failed(format!("status {}", response.status()));
        }
        let payload = match response.json::<Value>().await {
            Ok(payload) => payload,
            Err(err) => return SubFetch::Failed(format!("invalid json: {err}")),
        };
        match result_of(&payload) {
            Some(result) => SubFetch::Ok(result.clone()),
            None => SubFetch::Degraded(payload),
        }
    }

    /// Best-effort aggregate of the live remote state. Sub-fetches run
    /// concurrently under the client's shared timeout and degrade
    /// independently; a missing field means "unknown, skip this check this
    /// cycle", never an error.
    pub async fn fetch_live_state(&self) -> LiveState {
        let (game, team_view, map, roster, details) = tokio::join!(
            self.get_endpoint("/api/get_gamestate"),
            self.get_endpoint("/api/get_team_view"),
            self.get_endpoint("/api/get_map"),
            self.get_endpoint("/api/get_playerids"),
            self.get_endpoint("/api/get_detailed_players"),
        );

        let players = details
            .into_usable("get_detailed_players")
            .map(|result| parse_player_details(&result))
            .or_else(|| {
                team_view
                    .into_usable("get_team_view")
                    .map(|result| parse_team_view_players(&result))
            });

        LiveState {
            game: game
                .into_usable("get_gamestate")
                .map(|result| GameState::from_result(&result)),
            map: map
                .into_usable("get_map")
                .map(|result| MapInfo::from_result(&result)),
            roster: roster
                .into_usable("get_playerids")
                .map(|result| parse_roster(&result)),
            players,
            fetched_at: Utc::now(),
        }
    }

    /// Delivers a message to every current player individually. Messages over
    /// the cap are rejected locally so a partial-delivery storm can never
    /// start.
    pub async fn send_message(&self, text: &str) -> Result<DeliveryReport, TrackerError> {
        let length = text.chars().count();
        if length > self.settings.message_cap {
            return Err(TrackerError::MessageTooLong {
                length,
                cap: self.settings.message_cap,
            });
        }

        let roster = match self.get_endpoint("/api/get_playerids").await {
            SubFetch::Ok(result) => parse_roster(&result),
            SubFetch::Degraded(_) | SubFetch::Failed(_) => {
                return Err(TrackerError::TransientFetch(
                    "could not resolve player roster for messaging".to_owned(),
                ))
            }
        };
        if roster.is_empty() {
            debug!("no players online to message");
            return Ok(DeliveryReport {
                delivered: 0,
                total: 0,
            });
        }

        let url = format!("{}/api/message_player", self.settings.base_url);
        let total = roster.len();
        let mut delivered = 0;
        for entry in roster {
            let payload = json!({
                "player_name": entry.name,
                "player_id": entry.player_id,
                "message": text,
                "by": self.settings.bot_name,
            });
            let request = self
                .auth
                .apply(self.http.post(&url), &self.settings.api_key)
                .json(&payload);
            match request.send().await {
                Ok(response) if response.status().is_success() => delivered += 1,
                Ok(response) => {
                    debug!(player = %entry.name, status = %response.status(), "player message rejected")
                }
                Err(err) => debug!(?err, player = %entry.name, "player message failed"),
            }
        }
        Ok(DeliveryReport { delivered, total })
    }
}
