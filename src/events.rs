use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type ChannelId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Allies,
    Axis,
}

impl Side {
    pub fn label(self) -> &'static str {
        match self {
            Side::Allies => "Allies",
            Side::Axis => "Axis",
        }
    }

    /// Lenient team-name parsing; remote payloads carry faction names as
    /// well as team names.
    pub fn parse(raw: &str) -> Option<Side> {
        let value = raw.trim().to_ascii_lowercase();
        if value.is_empty() {
            return None;
        }
        if value.starts_with("alli") {
            return Some(Side::Allies);
        }
        match value.as_str() {
            "us" | "usa" | "rus" | "sov" | "gb" | "brit" => Some(Side::Allies),
            "axis" | "ger" | "germany" => Some(Side::Axis),
            _ => None,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchCause {
    Start,
    Manual,
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Manual,
    TimeExpired,
}

#[derive(Debug, Clone, Serialize)]
pub struct SwitchRecord {
    pub from: Option<Side>,
    pub to: Side,
    pub cause: SwitchCause,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteScores {
    pub allies: i64,
    pub axis: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ScorePair {
    pub allies: f64,
    pub axis: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeReason {
    Started,
    Switch,
    AutoToggled,
    KillRecorded,
    Refresh,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchReport {
    pub channel: ChannelId,
    pub map: Option<String>,
    pub seconds_allies: f64,
    pub seconds_axis: f64,
    pub winner: Option<Side>,
    pub advantage_seconds: f64,
    pub switch_count: u32,
    pub scores: ScorePair,
    pub tank_kills_allies: u32,
    pub tank_kills_axis: u32,
    pub switches: Vec<SwitchRecord>,
    pub end_reason: StopReason,
    pub ended_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DisplayEvent {
    StateChanged {
        channel: ChannelId,
        controlling: Option<Side>,
        seconds_allies: f64,
        seconds_axis: f64,
        switch_count: u32,
        scores: ScorePair,
        reason: ChangeReason,
        at: DateTime<Utc>,
    },
    MatchComplete {
        channel: ChannelId,
        report: MatchReport,
        at: DateTime<Utc>,
    },
}

impl DisplayEvent {
    pub fn feed_label(&self) -> String {
        match self {
            DisplayEvent::StateChanged {
                channel,
                controlling,
                seconds_allies,
                seconds_axis,
                switch_count,
                reason,
                ..
            } => {
                let holder = controlling.map(Side::label).unwrap_or("nobody");
                format!(
                    "match {channel}: {holder} holds | Allies {:.0}s Axis {:.0}s | switches {switch_count} ({reason:?})",
                    seconds_allies, seconds_axis
                )
            }
            DisplayEvent::MatchComplete {
                channel, report, ..
            } => {
                let winner = report.winner.map(Side::label).unwrap_or("draw");
                format!(
                    "match {channel} complete: {winner} | Allies {:.0}s Axis {:.0}s | +{:.0}s advantage",
                    report.seconds_allies, report.seconds_axis, report.advantage_seconds
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Side;

    #[test]
    fn parses_team_and_faction_names() {
        assert_eq!(Side::parse("Allies"), Some(Side::Allies));
        assert_eq!(Side::parse("allied"), Some(Side::Allies));
        assert_eq!(Side::parse(" US "), Some(Side::Allies));
        assert_eq!(Side::parse("Axis"), Some(Side::Axis));
        assert_eq!(Side::parse("GER"), Some(Side::Axis));
        assert_eq!(Side::parse("spectator"), None);
        assert_eq!(Side::parse(""), None);
    }
}
