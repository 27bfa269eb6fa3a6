use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::{ClockSnapshot, MatchClock, RecordedKill};
use crate::config::AppConfig;
use crate::crcon::CrconClient;
use crate::error::TrackerError;
use crate::events::{
    ChangeReason, ChannelId, DisplayEvent, MatchReport, ScorePair, Side, StopReason, SwitchCause,
};
use crate::killfeed::{ListenerState, ListenerStatus};
use crate::reconcile;
use crate::score;
use crate::store::{self, Store};
use crate::vehicles::KillDetection;

/// One active match: the clock record, the control-api session and the
/// reconciler task driving it. The clock mutex is the match's mutation lock;
/// nothing holds it across a suspension point.
pub struct MatchHandle {
    pub channel: ChannelId,
    clock: Mutex<MatchClock>,
    client: Mutex<Option<Arc<CrconClient>>>,
    reconciler: Mutex<Option<JoinHandle<()>>>,
    pub consecutive_failures: AtomicU32,
}

impl MatchHandle {
    fn new(channel: ChannelId, clock: MatchClock, client: Option<Arc<CrconClient>>) -> MatchHandle {
        MatchHandle {
            channel,
            clock: Mutex::new(clock),
            client: Mutex::new(client),
            reconciler: Mutex::new(None),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn lock_clock(&self) -> MutexGuard<'_, MatchClock> {
        // A poisoned guard still refers to the same record.
        self.clock.lock().unwrap_or_else(|err| err.into_inner())
    }

    pub fn client(&self) -> Option<Arc<CrconClient>> {
        self.client
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .clone()
    }

    /// Installs a fresh session, dropping (closing) any previous one.
    pub fn replace_client(&self, client: Option<Arc<CrconClient>>) {
        *self.client.lock().unwrap_or_else(|err| err.into_inner()) = client;
    }

    fn set_reconciler(&self, task: JoinHandle<()>) {
        let mut slot = self.reconciler.lock().unwrap_or_else(|err| err.into_inner());
        if let Some(previous) = slot.replace(task) {
            previous.abort();
        }
    }

    fn abort_reconciler(&self) {
        if let Some(task) = self
            .reconciler
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .take()
        {
            task.abort();
        }
    }

    async fn try_message(&self, text: &str) {
        let Some(client) = self.client() else {
            return;
        };
        match client.send_message(text).await {
            Ok(report) => debug!(
                channel = self.channel,
                delivered = report.delivered,
                total = report.total,
                "in-game message delivered"
            ),
            Err(err) => warn!(?err, channel = self.channel, "in-game message not delivered"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StartOutcome {
    pub snapshot: ClockSnapshot,
    pub connected: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LiveStats {
    pub snapshot: ClockSnapshot,
    pub scores: ScorePair,
    pub map: Option<String>,
    pub time_remaining: Option<f64>,
    pub player_count: Option<u32>,
    pub last_update: Option<chrono::DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub connected: bool,
}

/// Registry of active matches keyed by channel, owned by the one coordinator
/// instance and shared by reference with every task that needs a lookup.
pub struct MatchRegistry {
    matches: Mutex<HashMap<ChannelId, Arc<MatchHandle>>>,
    events: UnboundedSender<DisplayEvent>,
    config: AppConfig,
    store: Store,
    ingestion: Arc<ListenerState>,
}

impl MatchRegistry {
    pub fn new(
        config: AppConfig,
        store: Store,
        events: UnboundedSender<DisplayEvent>,
        ingestion: Arc<ListenerState>,
    ) -> Arc<MatchRegistry> {
        Arc::new(MatchRegistry {
            matches: Mutex::new(HashMap::new()),
            events,
            config,
            store,
            ingestion,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    fn lock_matches(&self) -> MutexGuard<'_, HashMap<ChannelId, Arc<MatchHandle>>> {
        self.matches.lock().unwrap_or_else(|err| err.into_inner())
    }

    pub fn get(&self, channel: ChannelId) -> Option<Arc<MatchHandle>> {
        self.lock_matches().get(&channel).cloned()
    }

    pub fn active_channels(&self) -> Vec<ChannelId> {
        self.lock_matches().keys().copied().collect()
    }

    fn handles(&self) -> Vec<Arc<MatchHandle>> {
        self.lock_matches().values().cloned().collect()
    }

    pub fn emit_state(&self, channel: ChannelId, snapshot: &ClockSnapshot, scores: ScorePair, reason: ChangeReason) {
        let event = DisplayEvent::StateChanged {
            channel,
            controlling: snapshot.controlling,
            seconds_allies: snapshot.seconds_allies,
            seconds_axis: snapshot.seconds_axis,
            switch_count: snapshot.switch_count,
            scores,
            reason,
            at: snapshot.taken_at,
        };
        if self.events.send(event).is_err() {
            warn!(channel, "display sink dropped; state event lost");
        }
    }

    /// Creates the match record, connects the control-api session and spawns
    /// the reconciliation loop. The match starts even when the remote
    /// connection fails; the loop keeps retrying the session on its own
    /// cadence.
    pub async fn start_match(self: &Arc<Self>, channel: ChannelId) -> Result<StartOutcome, TrackerError> {
        if self.get(channel).is_some() {
            return Err(TrackerError::state("match already running for this channel"));
        }

        // Network happens before any lock is taken.
        let client = match CrconClient::connect(self.config.crcon_settings()).await {
            Ok(client) => Some(Arc::new(client)),
            Err(err) => {
                warn!(?err, channel, "starting match without control-api session");
                None
            }
        };
        let connected = client.is_some();

        let now = Utc::now();
        let mut clock = MatchClock::new(self.config.auto_switch_default);
        clock.start(now)?;
        let handle = Arc::new(MatchHandle::new(channel, clock, client));

        {
            let mut matches = self.lock_matches();
            if matches.contains_key(&channel) {
                return Err(TrackerError::state("match already running for this channel"));
            }
            matches.insert(channel, handle.clone());
        }

        handle.set_reconciler(reconcile::spawn_reconciler(self.clone(), channel));
        info!(channel, connected, "match started");

        let snapshot = handle.lock_clock().snapshot(now);
        self.emit_state(
            channel,
            &snapshot,
            score::score_pair(&snapshot, &[]),
            ChangeReason::Started,
        );
        handle
            .try_message("Match started! Center point control timer active.")
            .await;

        Ok(StartOutcome { snapshot, connected })
    }

    pub async fn manual_switch(&self, channel: ChannelId, side: Side) -> Result<ClockSnapshot, TrackerError> {
        self.switch(channel, side, SwitchCause::Manual).await
    }

    pub async fn apply_auto_switch(&self, channel: ChannelId, side: Side) -> Result<ClockSnapshot, TrackerError> {
        self.switch(channel, side, SwitchCause::Auto).await
    }

    async fn switch(&self, channel: ChannelId, side: Side, cause: SwitchCause) -> Result<ClockSnapshot, TrackerError> {
        let handle = self.get(channel).ok_or(TrackerError::UnknownChannel(channel))?;
        let now = Utc::now();
        let (outcome, snapshot) = {
            let mut clock = handle.lock_clock();
            let outcome = clock.switch_to(side, cause, now)?;
            (outcome, clock.snapshot(now))
        };

        if outcome.switched {
            info!(channel, side = %side, from = ?outcome.from, ?cause, "objective control switched");
            self.emit_state(
                channel,
                &snapshot,
                score::score_pair(&snapshot, &[]),
                ChangeReason::Switch,
            );
            handle
                .try_message(&format!(
                    "{} captured the center point! Allies: {} | Axis: {}",
                    side.label(),
                    score::format_clock(snapshot.seconds_allies),
                    score::format_clock(snapshot.seconds_axis),
                ))
                .await;
        }
        Ok(snapshot)
    }

    pub async fn toggle_auto_switch(&self, channel: ChannelId) -> Result<bool, TrackerError> {
        let handle = self.get(channel).ok_or(TrackerError::UnknownChannel(channel))?;
        let now = Utc::now();
        let (enabled, snapshot) = {
            let mut clock = handle.lock_clock();
            if clock.ended() {
                return Err(TrackerError::state("match already ended"));
            }
            (clock.toggle_auto(), clock.snapshot(now))
        };
        info!(channel, enabled, "auto-switch toggled");
        self.emit_state(
            channel,
            &snapshot,
            score::score_pair(&snapshot, &[]),
            ChangeReason::AutoToggled,
        );
        handle
            .try_message(&format!(
                "Auto-switch {}",
                if enabled { "enabled" } else { "disabled" }
            ))
            .await;
        Ok(enabled)
    }

    /// The single stop path shared by the manual command, the front end's
    /// stop button and end-of-match detection, so results formatting and
    /// logging cannot diverge. Returns `None` when a concurrent stop already
    /// finalized this match.
    pub async fn stop_match(
        &self,
        channel: ChannelId,
        reason: StopReason,
    ) -> Result<Option<MatchReport>, TrackerError> {
        let handle = self.get(channel).ok_or(TrackerError::UnknownChannel(channel))?;

        let now = Utc::now();
        let (first, snapshot) = {
            let mut clock = handle.lock_clock();
            let first = clock.finalize_and_stop(now)?;
            (first, clock.snapshot(now))
        };
        if !first {
            self.lock_matches().remove(&channel);
            return Ok(None);
        }

        // Timers are frozen; the final fetch only enriches the report.
        let (map, players) = match handle.client() {
            Some(client) => {
                let live = client.fetch_live_state().await;
                (
                    live.map.as_ref().map(|map| map.pretty_name.clone()),
                    live.players.unwrap_or_default(),
                )
            }
            None => (None, Vec::new()),
        };

        let scores = score::score_pair(&snapshot, &players);
        let (winner, advantage) = score::control_winner(snapshot.seconds_allies, snapshot.seconds_axis);
        let report = MatchReport {
            channel,
            map,
            seconds_allies: snapshot.seconds_allies,
            seconds_axis: snapshot.seconds_axis,
            winner,
            advantage_seconds: advantage,
            switch_count: snapshot.switch_count,
            scores,
            tank_kills_allies: snapshot.tank_kills_allies,
            tank_kills_axis: snapshot.tank_kills_axis,
            switches: snapshot.switches.clone(),
            end_reason: reason,
            ended_at: now,
        };

        self.emit_state(channel, &snapshot, scores, ChangeReason::Stopped);
        let event = DisplayEvent::MatchComplete {
            channel,
            report: report.clone(),
            at: now,
        };
        if self.events.send(event).is_err() {
            warn!(channel, "display sink dropped; final report event lost");
        }
        if let Err(err) = self.store.append_jsonl(store::REPORTS_FILE, &report) {
            warn!(?err, channel, "failed mirroring match report");
        }

        let winner_text = match winner {
            Some(side) => format!("{} controlled the center longer!", side.label()),
            None => "Perfect tie - equal control time!".to_owned(),
        };
        handle
            .try_message(&format!(
                "Match complete! {winner_text} Allies: {} | Axis: {}",
                score::format_clock(snapshot.seconds_allies),
                score::format_clock(snapshot.seconds_axis),
            ))
            .await;
        info!(channel, ?reason, ?winner, "match stopped");

        // Drop the session and cancel the loop last so a reconciler-triggered
        // stop finishes its own final broadcast before the abort lands.
        self.lock_matches().remove(&channel);
        handle.replace_client(None);
        handle.abort_reconciler();
        Ok(Some(report))
    }

    pub async fn live_stats(&self, channel: ChannelId) -> Result<LiveStats, TrackerError> {
        let handle = self.get(channel).ok_or(TrackerError::UnknownChannel(channel))?;

        let (live, connected) = match handle.client() {
            Some(client) => (Some(client.fetch_live_state().await), true),
            None => (None, false),
        };
        let now = Utc::now();
        let snapshot = handle.lock_clock().snapshot(now);
        let players = live
            .as_ref()
            .and_then(|state| state.players.as_deref())
            .unwrap_or(&[]);
        let scores = score::score_pair(&snapshot, players);

        Ok(LiveStats {
            scores,
            map: live
                .as_ref()
                .and_then(|state| state.map.as_ref())
                .map(|map| map.pretty_name.clone()),
            time_remaining: live
                .as_ref()
                .and_then(|state| state.game.as_ref())
                .and_then(|game| game.time_remaining),
            player_count: live.as_ref().and_then(|state| {
                state
                    .game
                    .as_ref()
                    .map(|game| game.player_count())
                    .or_else(|| state.roster.as_ref().map(|roster| roster.len() as u32))
            }),
            last_update: live.as_ref().map(|state| state.fetched_at),
            consecutive_failures: handle.consecutive_failures.load(Ordering::Relaxed),
            connected,
            snapshot,
        })
    }

    /// Fans a qualifying kill into every started match. Events carry no
    /// channel, and all matches track the same game server, so normally this
    /// is exactly one clock. Returns the number of matches updated.
    pub fn attribute_kill(&self, detection: &KillDetection) -> usize {
        let Some(side) = detection.killer_team else {
            warn!(
                killer = %detection.killer_name,
                keyword = %detection.keyword_match,
                "tank kill without a killer team; not attributed"
            );
            return 0;
        };

        let now = Utc::now();
        let mut attributed = 0;
        for handle in self.handles() {
            let kill = RecordedKill {
                killer: detection.killer_name.clone(),
                victim: detection.victim_name.clone(),
                side,
                keyword_match: detection.keyword_match.clone(),
                vehicle: detection.vehicle.clone(),
                at: now,
            };
            let snapshot = {
                let mut clock = handle.lock_clock();
                if !clock.started() || clock.ended() {
                    continue;
                }
                match clock.record_tank_kill(kill) {
                    Ok(()) => clock.snapshot(now),
                    Err(err) => {
                        warn!(?err, channel = handle.channel, "kill not attributed");
                        continue;
                    }
                }
            };
            attributed += 1;
            self.emit_state(
                handle.channel,
                &snapshot,
                score::score_pair(&snapshot, &[]),
                ChangeReason::KillRecorded,
            );
        }

        if attributed > 0 {
            self.ingestion.record_attribution();
            if let Err(err) = self.store.append_jsonl(store::KILLS_FILE, detection) {
                warn!(?err, "failed mirroring tank kill");
            }
        }
        attributed
    }

    pub fn ingestion_health(&self) -> ListenerStatus {
        self.ingestion.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use super::{MatchHandle, MatchRegistry};
    use crate::clock::MatchClock;
    use crate::config::AppConfig;
    use crate::events::{DisplayEvent, Side};
    use crate::killfeed::ListenerState;
    use crate::store::Store;
    use crate::vehicles::KillDetection;

    fn test_registry() -> (
        Arc<MatchRegistry>,
        mpsc::UnboundedReceiver<DisplayEvent>,
        std::path::PathBuf,
    ) {
        let unique = std::time::SystemTime::now()
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .expect("clock should be valid")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("overwatch_registry_{unique}"));
        let config = AppConfig::from_lookup(|key| match key {
            "CRCON_API_KEY" => Some("test-key".to_owned()),
            _ => None,
        })
        .expect("test config should load");
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = MatchRegistry::new(
            config,
            Store::new(&dir),
            tx,
            Arc::new(ListenerState::default()),
        );
        (registry, rx, dir)
    }

    fn insert_started_match(registry: &Arc<MatchRegistry>, channel: u64) {
        let mut clock = MatchClock::new(true);
        clock.start(chrono::Utc::now()).expect("start should succeed");
        let handle = Arc::new(MatchHandle::new(channel, clock, None));
        registry.lock_matches().insert(channel, handle);
    }

    fn detection(team: Option<Side>) -> KillDetection {
        KillDetection {
            killer_name: "Able Gunner".to_owned(),
            killer_team: team,
            victim_name: "Tiger Crew".to_owned(),
            victim_team: Some(Side::Axis),
            weapon: Some("75mm AP Shell".to_owned()),
            vehicle: Some("Tiger".to_owned()),
            vehicle_class: None,
            keyword_group: "cannons".to_owned(),
            keyword_match: "75mm".to_owned(),
        }
    }

    #[tokio::test]
    async fn kill_attribution_reaches_every_started_match() {
        let (registry, mut rx, dir) = test_registry();
        insert_started_match(&registry, 1);
        insert_started_match(&registry, 2);

        let attributed = registry.attribute_kill(&detection(Some(Side::Allies)));
        assert_eq!(attributed, 2);
        assert!(rx.try_recv().is_ok());
        assert_eq!(registry.ingestion_health().kills_attributed, 1);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn kill_without_team_is_not_attributed() {
        let (registry, mut rx, dir) = test_registry();
        insert_started_match(&registry, 1);

        assert_eq!(registry.attribute_kill(&detection(None)), 0);
        assert!(rx.try_recv().is_err());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn operations_on_unknown_channels_reject_cleanly() {
        let (registry, _rx, dir) = test_registry();

        assert!(registry.manual_switch(99, Side::Allies).await.is_err());
        assert!(registry.toggle_auto_switch(99).await.is_err());
        assert!(registry
            .stop_match(99, crate::events::StopReason::Manual)
            .await
            .is_err());
        assert!(registry.live_stats(99).await.is_err());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn manual_switch_and_stop_share_state() {
        let (registry, mut rx, dir) = test_registry();
        insert_started_match(&registry, 7);

        let snapshot = registry
            .manual_switch(7, Side::Axis)
            .await
            .expect("switch should succeed");
        assert_eq!(snapshot.controlling, Some(Side::Axis));
        assert!(rx.try_recv().is_ok());

        let report = registry
            .stop_match(7, crate::events::StopReason::Manual)
            .await
            .expect("stop should succeed")
            .expect("first stop finalizes");
        assert_eq!(report.channel, 7);
        assert!(registry.get(7).is_none());

        // The match is gone, so a repeated stop rejects with unknown channel.
        assert!(registry
            .stop_match(7, crate::events::StopReason::Manual)
            .await
            .is_err());

        std::fs::remove_dir_all(&dir).ok();
    }
}
