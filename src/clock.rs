use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::TrackerError;
use crate::events::{RemoteScores, Side, SwitchCause, SwitchRecord};

const RECENT_KILLS_CAP: usize = 25;

#[derive(Debug, Clone, Default, Serialize)]
pub struct PlayerContribution {
    pub side: Option<Side>,
    pub tank_kills: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordedKill {
    pub killer: String,
    pub victim: String,
    pub side: Side,
    pub keyword_match: String,
    pub vehicle: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct SwitchOutcome {
    pub switched: bool,
    pub from: Option<Side>,
}

/// Per-match mutable clock record. Every method is synchronous; the owning
/// handle wraps the record in a mutex and no caller holds that lock across a
/// suspension point.
#[derive(Debug)]
pub struct MatchClock {
    started: bool,
    ended: bool,
    controlling: Option<Side>,
    seconds_allies: f64,
    seconds_axis: f64,
    last_switch: Option<DateTime<Utc>>,
    switch_count: u32,
    auto_switch: bool,
    last_scores: Option<RemoteScores>,
    match_start: Option<DateTime<Utc>>,
    switches: Vec<SwitchRecord>,
    stats: HashMap<String, PlayerContribution>,
    recent_kills: VecDeque<RecordedKill>,
    kills_allies: u32,
    kills_axis: u32,
}

impl MatchClock {
    pub fn new(auto_switch: bool) -> Self {
        Self {
            started: false,
            ended: false,
            controlling: None,
            seconds_allies: 0.0,
            seconds_axis: 0.0,
            last_switch: None,
            switch_count: 0,
            auto_switch,
            last_scores: None,
            match_start: None,
            switches: Vec::new(),
            stats: HashMap::new(),
            recent_kills: VecDeque::new(),
            kills_allies: 0,
            kills_axis: 0,
        }
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn ended(&self) -> bool {
        self.ended
    }

    pub fn controlling(&self) -> Option<Side> {
        self.controlling
    }

    pub fn auto_switch(&self) -> bool {
        self.auto_switch
    }

    pub fn toggle_auto(&mut self) -> bool {
        self.auto_switch = !self.auto_switch;
        self.auto_switch
    }

    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), TrackerError> {
        if self.started {
            return Err(TrackerError::state("match already started"));
        }
        self.started = true;
        self.ended = false;
        self.controlling = None;
        self.seconds_allies = 0.0;
        self.seconds_axis = 0.0;
        self.switch_count = 0;
        self.last_switch = Some(now);
        self.match_start = Some(now);
        Ok(())
    }

    /// Finalizes the interval held by the current controller and hands the
    /// objective to `side`. Switching to the side already in control is a
    /// no-op so a repeated capture report cannot inflate the counters.
    pub fn switch_to(
        &mut self,
        side: Side,
        cause: SwitchCause,
        now: DateTime<Utc>,
    ) -> Result<SwitchOutcome, TrackerError> {
        if !self.started {
            return Err(TrackerError::state("match has not started"));
        }
        if self.ended {
            return Err(TrackerError::state("match already ended"));
        }
        let from = self.controlling;
        if from == Some(side) {
            return Ok(SwitchOutcome {
                switched: false,
                from,
            });
        }

        self.finalize_open_interval(now);
        // The transition out of the no-controller start state does not count
        // as a switch.
        if from.is_some() {
            self.switch_count += 1;
        }
        self.controlling = Some(side);
        self.last_switch = Some(now);
        self.switches.push(SwitchRecord {
            from,
            to: side,
            cause,
            at: now,
        });
        Ok(SwitchOutcome {
            switched: true,
            from,
        })
    }

    /// Returns `true` for the caller that performed the finalization; a
    /// concurrent second stop observes `ended` and gets `false` without
    /// touching the timers.
    pub fn finalize_and_stop(&mut self, now: DateTime<Utc>) -> Result<bool, TrackerError> {
        if !self.started {
            return Err(TrackerError::state("match has not started"));
        }
        if self.ended {
            return Ok(false);
        }
        self.finalize_open_interval(now);
        self.ended = true;
        self.controlling = None;
        self.last_switch = None;
        Ok(true)
    }

    fn finalize_open_interval(&mut self, now: DateTime<Utc>) {
        if let (Some(holder), Some(last)) = (self.controlling, self.last_switch) {
            let elapsed = elapsed_secs(last, now);
            match holder {
                Side::Allies => self.seconds_allies += elapsed,
                Side::Axis => self.seconds_axis += elapsed,
            }
        }
    }

    /// Finalized seconds plus the in-progress interval when `side` currently
    /// holds the objective. Callers read this under the handle's lock so the
    /// value cannot tear against a concurrent switch.
    pub fn current_elapsed(&self, side: Side, now: DateTime<Utc>) -> f64 {
        let base = match side {
            Side::Allies => self.seconds_allies,
            Side::Axis => self.seconds_axis,
        };
        if self.ended || self.controlling != Some(side) {
            return base;
        }
        match self.last_switch {
            Some(last) => base + elapsed_secs(last, now),
            None => base,
        }
    }

    /// Stores the fresh scoreboard as the new change-detection baseline and
    /// returns the previous one. The baseline advances whether or not the
    /// caller acts on the delta, so a capture is detected at most once.
    pub fn observe_scores(&mut self, fresh: RemoteScores) -> Option<RemoteScores> {
        self.last_scores.replace(fresh)
    }

    pub fn record_tank_kill(&mut self, kill: RecordedKill) -> Result<(), TrackerError> {
        if !self.started {
            return Err(TrackerError::state("match has not started"));
        }
        if self.ended {
            return Err(TrackerError::state("match already ended"));
        }
        match kill.side {
            Side::Allies => self.kills_allies += 1,
            Side::Axis => self.kills_axis += 1,
        }
        let entry = self.stats.entry(kill.killer.clone()).or_default();
        entry.side = Some(kill.side);
        entry.tank_kills += 1;
        self.recent_kills.push_back(kill);
        while self.recent_kills.len() > RECENT_KILLS_CAP {
            self.recent_kills.pop_front();
        }
        Ok(())
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> ClockSnapshot {
        ClockSnapshot {
            started: self.started,
            ended: self.ended,
            controlling: self.controlling,
            auto_switch: self.auto_switch,
            seconds_allies: self.current_elapsed(Side::Allies, now),
            seconds_axis: self.current_elapsed(Side::Axis, now),
            switch_count: self.switch_count,
            tank_kills_allies: self.kills_allies,
            tank_kills_axis: self.kills_axis,
            recent_kills: self.recent_kills.iter().cloned().collect(),
            switches: self.switches.clone(),
            stats: self.stats.clone(),
            started_at: self.match_start,
            taken_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClockSnapshot {
    pub started: bool,
    pub ended: bool,
    pub controlling: Option<Side>,
    pub auto_switch: bool,
    pub seconds_allies: f64,
    pub seconds_axis: f64,
    pub switch_count: u32,
    pub tank_kills_allies: u32,
    pub tank_kills_axis: u32,
    pub recent_kills: Vec<RecordedKill>,
    pub switches: Vec<SwitchRecord>,
    pub stats: HashMap<String, PlayerContribution>,
    pub started_at: Option<DateTime<Utc>>,
    pub taken_at: DateTime<Utc>,
}

impl ClockSnapshot {
    pub fn seconds(&self, side: Side) -> f64 {
        match side {
            Side::Allies => self.seconds_allies,
            Side::Axis => self.seconds_axis,
        }
    }

    pub fn leader(&self) -> Option<Side> {
        if self.seconds_allies > self.seconds_axis {
            Some(Side::Allies)
        } else if self.seconds_axis > self.seconds_allies {
            Some(Side::Axis)
        } else {
            None
        }
    }
}

fn elapsed_secs(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    to.signed_duration_since(from).num_milliseconds().max(0) as f64 / 1000.0
}
