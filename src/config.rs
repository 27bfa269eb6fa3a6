use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use crate::crcon::CrconSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillFeedMode {
    Off,
    Webhook,
    Stream,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub crcon_url: String,
    pub crcon_api_key: String,
    pub crcon_timeout_secs: u64,
    pub update_interval_secs: u64,
    pub auto_switch_default: bool,
    pub end_threshold_secs: f64,
    pub message_cap: usize,
    pub bot_name: String,
    pub kill_feed_mode: KillFeedMode,
    pub webhook_bind: SocketAddr,
    pub webhook_path: String,
    pub webhook_secret: Option<String>,
    pub stream_url: String,
    pub backoff_base_secs: f64,
    pub backoff_max_secs: f64,
    pub auth_fail_limit: u32,
    pub tanks_file: Option<PathBuf>,
    pub data_dir: PathBuf,
}

impl AppConfig {
    pub fn load() -> Result<AppConfig> {
        let dotenv = load_dotenv_fallback();
        AppConfig::from_lookup(|key| env_or_dotenv(key, &dotenv))
    }

    /// Builds the config from any key lookup so tests can feed a plain map
    /// instead of mutating the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<AppConfig> {
        let crcon_url = lookup("CRCON_URL")
            .unwrap_or_else(|| "http://localhost:8010".to_owned())
            .trim_end_matches('/')
            .to_owned();
        let Some(crcon_api_key) = lookup("CRCON_API_KEY").filter(|key| !key.is_empty()) else {
            bail!("CRCON_API_KEY is not configured; refusing to start");
        };

        let host = lookup("KILL_WEBHOOK_HOST").unwrap_or_else(|| "0.0.0.0".to_owned());
        let port = webhook_port(&lookup);
        let webhook_bind: SocketAddr = format!("{host}:{port}")
            .parse()
            .with_context(|| format!("invalid webhook bind address {host}:{port}"))?;

        let stream_url = lookup("KILL_FEED_WS_URL").unwrap_or_else(|| {
            let ws_base = crcon_url
                .replacen("https://", "wss://", 1)
                .replacen("http://", "ws://", 1);
            format!("{ws_base}/ws/logs")
        });

        Ok(AppConfig {
            crcon_api_key,
            crcon_timeout_secs: get_u64(&lookup, "CRCON_TIMEOUT", 15),
            update_interval_secs: get_u64(&lookup, "UPDATE_INTERVAL", 15).max(1),
            auto_switch_default: get_bool(&lookup, "CRCON_AUTO_SWITCH", false),
            end_threshold_secs: get_f64(&lookup, "MATCH_END_THRESHOLD", 30.0),
            message_cap: get_u64(&lookup, "MESSAGE_CAP", 240) as usize,
            bot_name: lookup("BOT_NAME").unwrap_or_else(|| "HLLTankBot".to_owned()),
            kill_feed_mode: kill_feed_mode(&lookup),
            webhook_bind,
            webhook_path: normalize_path(
                lookup("KILL_WEBHOOK_PATH").unwrap_or_else(|| "/kill-webhook".to_owned()),
            ),
            webhook_secret: lookup("KILL_WEBHOOK_SECRET").filter(|secret| !secret.is_empty()),
            stream_url,
            backoff_base_secs: get_f64(&lookup, "KILL_FEED_BACKOFF_BASE", 1.0),
            backoff_max_secs: get_f64(&lookup, "KILL_FEED_BACKOFF_MAX", 30.0),
            auth_fail_limit: get_u64(&lookup, "KILL_FEED_AUTH_FAIL_LIMIT", 3) as u32,
            tanks_file: lookup("TANKS_FILE")
                .filter(|path| !path.is_empty())
                .map(PathBuf::from),
            data_dir: PathBuf::from(lookup("DATA_DIR").unwrap_or_else(|| "match_data".to_owned())),
            crcon_url,
        })
    }

    pub fn crcon_settings(&self) -> CrconSettings {
        CrconSettings {
            base_url: self.crcon_url.clone(),
            api_key: self.crcon_api_key.clone(),
            timeout: Duration::from_secs(self.crcon_timeout_secs),
            message_cap: self.message_cap,
            bot_name: self.bot_name.clone(),
        }
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }
}

fn kill_feed_mode(lookup: &impl Fn(&str) -> Option<String>) -> KillFeedMode {
    if let Some(raw) = lookup("KILL_FEED_MODE") {
        return match raw.trim().to_ascii_lowercase().as_str() {
            "off" | "false" | "disabled" => KillFeedMode::Off,
            "stream" | "ws" | "websocket" => KillFeedMode::Stream,
            "webhook" | "" => KillFeedMode::Webhook,
            other => {
                warn!(mode = other, "unknown KILL_FEED_MODE; defaulting to webhook");
                KillFeedMode::Webhook
            }
        };
    }
    if get_bool(lookup, "ENABLE_KILL_FEED", true) {
        KillFeedMode::Webhook
    } else {
        KillFeedMode::Off
    }
}

/// `KILL_WEBHOOK_PORT=$PORT` is a common platform placeholder; resolve it
/// through `PORT` before falling back to the default.
fn webhook_port(lookup: &impl Fn(&str) -> Option<String>) -> u16 {
    let fallback = lookup("PORT").and_then(|raw| raw.trim().parse::<u16>().ok());
    if let Some(raw) = lookup("KILL_WEBHOOK_PORT") {
        let raw = raw.trim();
        if raw == "$PORT" {
            if let Some(port) = fallback {
                return port;
            }
        } else if let Ok(port) = raw.parse::<u16>() {
            return port;
        }
    }
    fallback.unwrap_or(8081)
}

fn normalize_path(raw: String) -> String {
    let value = raw.trim();
    if value.starts_with('/') {
        value.to_owned()
    } else {
        format!("/{value}")
    }
}

fn get_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    match lookup(key) {
        Some(raw) => raw.trim().eq_ignore_ascii_case("true"),
        None => default,
    }
}

fn get_u64(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> u64 {
    lookup(key)
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn get_f64(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: f64) -> f64 {
    lookup(key)
        .and_then(|raw| raw.trim().parse::<f64>().ok())
        .unwrap_or(default)
}

pub fn env_or_dotenv(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key)
        .ok()
        .or_else(|| dotenv.get(key).cloned())
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

pub fn load_dotenv_fallback() -> HashMap<String, String> {
    for path in dotenv_candidate_paths() {
        if !path.is_file() {
            continue;
        }
        match parse_dotenv_file(&path) {
            Ok(values) => {
                info!(path = %path.display(), entries = values.len(), "loaded .env fallback");
                return values;
            }
            Err(err) => {
                warn!(?err, path = %path.display(), "failed parsing .env fallback file");
            }
        }
    }
    HashMap::new()
}

fn dotenv_candidate_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        paths.push(cwd.join(".env"));
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(exe_dir) = exe.parent() {
            paths.push(exe_dir.join(".env"));
        }
    }
    paths
}

fn parse_dotenv_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut out = HashMap::new();
    let text =
        fs::read_to_string(path).with_context(|| format!("failed reading {}", path.display()))?;
    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value.trim().trim_matches('"').trim_matches('\'').to_owned();
        out.insert(key.to_owned(), value);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::{fs, path::PathBuf, time::SystemTime};

    use super::{parse_dotenv_file, AppConfig, KillFeedMode};

    fn config_with(pairs: &[(&str, &str)]) -> anyhow::Result<AppConfig> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
            .collect();
        AppConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn missing_api_key_is_fatal() {
        let err = config_with(&[]).expect_err("config without key must fail");
        assert!(err.to_string().contains("CRCON_API_KEY"));
    }

    #[test]
    fn defaults_apply_with_only_the_key_set() {
        let config = config_with(&[("CRCON_API_KEY", "secret")]).expect("config should load");
        assert_eq!(config.crcon_url, "http://localhost:8010");
        assert_eq!(config.update_interval_secs, 15);
        assert_eq!(config.end_threshold_secs, 30.0);
        assert_eq!(config.kill_feed_mode, KillFeedMode::Webhook);
        assert_eq!(config.webhook_bind.port(), 8081);
        assert_eq!(config.webhook_path, "/kill-webhook");
        assert_eq!(config.stream_url, "ws://localhost:8010/ws/logs");
        assert!(!config.auto_switch_default);
    }

    #[test]
    fn port_placeholder_resolves_through_platform_port() {
        let config = config_with(&[
            ("CRCON_API_KEY", "secret"),
            ("KILL_WEBHOOK_PORT", "$PORT"),
            ("PORT", "9000"),
        ])
        .expect("config should load");
        assert_eq!(config.webhook_bind.port(), 9000);
    }

    #[test]
    fn webhook_path_gains_leading_slash() {
        let config = config_with(&[
            ("CRCON_API_KEY", "secret"),
            ("KILL_WEBHOOK_PATH", "events/kill"),
        ])
        .expect("config should load");
        assert_eq!(config.webhook_path, "/events/kill");
    }

    #[test]
    fn kill_feed_mode_parses_and_honors_legacy_toggle() {
        let stream = config_with(&[("CRCON_API_KEY", "secret"), ("KILL_FEED_MODE", "stream")])
            .expect("config should load");
        assert_eq!(stream.kill_feed_mode, KillFeedMode::Stream);

        let off = config_with(&[("CRCON_API_KEY", "secret"), ("ENABLE_KILL_FEED", "false")])
            .expect("config should load");
        assert_eq!(off.kill_feed_mode, KillFeedMode::Off);
    }

    #[test]
    fn stream_url_derives_from_https_base() {
        let config = config_with(&[
            ("CRCON_API_KEY", "secret"),
            ("CRCON_URL", "https://rcon.example.net/"),
        ])
        .expect("config should load");
        assert_eq!(config.stream_url, "wss://rcon.example.net/ws/logs");
    }

    #[test]
    fn parse_dotenv_supports_comments_export_and_quotes() {
        let unique = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .expect("clock should be valid")
            .as_nanos();
        let path: PathBuf = std::env::temp_dir().join(format!("overwatch_env_{unique}.env"));
        let body = r#"
# comment
export CRCON_API_KEY=abc123
CRCON_URL="http://10.0.0.2:8010"
EMPTY=
"#;
        fs::write(&path, body).expect("should write temp env file");
        let parsed = parse_dotenv_file(&path).expect("should parse dotenv");
        fs::remove_file(&path).ok();

        assert_eq!(parsed.get("CRCON_API_KEY").map(String::as_str), Some("abc123"));
        assert_eq!(
            parsed.get("CRCON_URL").map(String::as_str),
            Some("http://10.0.0.2:8010")
        );
        assert_eq!(parsed.get("EMPTY").map(String::as_str), Some(""));
    }
}
