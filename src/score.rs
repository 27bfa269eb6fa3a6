use std::cmp::Ordering;

use crate::clock::ClockSnapshot;
use crate::crcon::PlayerDetail;
use crate::events::{ScorePair, Side};

/// Crew members counted toward the score per side.
pub const CREW_TOP_N: usize = 3;
pub const CREW_MULTIPLIER: f64 = 3.0;
pub const CONTROL_POINTS_PER_SECOND: f64 = 0.5;

/// The tournament score for one side. Control time is the guaranteed term;
/// the crew and commander terms come from the detailed-player fetch and
/// degrade to zero whenever that data is missing, so the score stays defined
/// under partial remote failure. Every display path goes through here.
pub fn dmt_score(side: Side, control_seconds: f64, players: &[PlayerDetail]) -> f64 {
    let mut crew: Vec<f64> = players
        .iter()
        .filter(|player| player.team == Some(side) && !player.is_commander())
        .map(|player| player.combat)
        .collect();
    crew.sort_by(|a, b| b.partial_cmp(a).unwrap_or(Ordering::Equal));
    let crew_sum: f64 = crew.iter().take(CREW_TOP_N).sum();

    let commander = players
        .iter()
        .filter(|player| player.team == Some(side) && player.is_commander())
        .map(|player| player.combat)
        .fold(0.0, f64::max);

    CREW_MULTIPLIER * crew_sum + commander + CONTROL_POINTS_PER_SECOND * control_seconds
}

pub fn score_pair(snapshot: &ClockSnapshot, players: &[PlayerDetail]) -> ScorePair {
    ScorePair {
        allies: dmt_score(Side::Allies, snapshot.seconds(Side::Allies), players),
        axis: dmt_score(Side::Axis, snapshot.seconds(Side::Axis), players),
    }
}

/// Share of total control time per side, `None` before anyone has held the
/// objective.
pub fn control_percentages(snapshot: &ClockSnapshot) -> Option<(f64, f64)> {
    let total = snapshot.seconds_allies + snapshot.seconds_axis;
    if total <= 0.0 {
        return None;
    }
    Some((
        snapshot.seconds_allies / total * 100.0,
        snapshot.seconds_axis / total * 100.0,
    ))
}

/// Winner by control time with the advantage delta in seconds.
pub fn control_winner(seconds_allies: f64, seconds_axis: f64) -> (Option<Side>, f64) {
    if seconds_allies > seconds_axis {
        (Some(Side::Allies), seconds_allies - seconds_axis)
    } else if seconds_axis > seconds_allies {
        (Some(Side::Axis), seconds_axis - seconds_allies)
    } else {
        (None, 0.0)
    }
}

pub fn format_clock(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    let secs = total % 60;
    let minutes = (total / 60) % 60;
    let hours = total / 3600;
    format!("{hours}:{minutes:02}:{secs:02}")
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{control_percentages, control_winner, dmt_score, format_clock, score_pair};
    use crate::clock::MatchClock;
    use crate::crcon::PlayerDetail;
    use crate::events::Side;

    fn player(name: &str, team: Side, combat: f64, role: &str) -> PlayerDetail {
        PlayerDetail {
            name: name.to_owned(),
            player_id: None,
            team: Some(team),
            combat,
            role: Some(role.to_owned()),
        }
    }

    #[test]
    fn control_time_term_dominates_without_player_data() {
        let score = dmt_score(Side::Allies, 120.0, &[]);
        assert!((score - 60.0).abs() < 1e-9);
    }

    #[test]
    fn takes_top_three_crew_and_best_commander() {
        let players = vec![
            player("a", Side::Allies, 100.0, "tankcommander"),
            player("b", Side::Allies, 80.0, "crewman"),
            player("c", Side::Allies, 60.0, "crewman"),
            player("d", Side::Allies, 40.0, "crewman"),
            player("cmd", Side::Allies, 50.0, "armycommander"),
            player("enemy", Side::Axis, 500.0, "crewman"),
        ];
        // tankcommander is still crew; only the army commander fills the
        // commander term.
        let score = dmt_score(Side::Allies, 0.0, &players);
        assert!((score - (3.0 * (100.0 + 80.0 + 60.0) + 50.0)).abs() < 1e-9);
    }

    #[test]
    fn fewer_than_top_n_uses_all_available() {
        let players = vec![player("a", Side::Axis, 30.0, "crewman")];
        let score = dmt_score(Side::Axis, 10.0, &players);
        assert!((score - (3.0 * 30.0 + 5.0)).abs() < 1e-9);
    }

    #[test]
    fn monotonic_in_control_seconds() {
        let players = vec![player("a", Side::Allies, 75.0, "crewman")];
        let mut previous = f64::MIN;
        for seconds in [0.0, 1.0, 90.0, 3600.0] {
            let score = dmt_score(Side::Allies, seconds, &players);
            assert!(score >= previous);
            previous = score;
        }
    }

    #[test]
    fn score_pair_reads_both_sides_from_one_snapshot() {
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut clock = MatchClock::new(false);
        clock.start(t0).expect("start should succeed");
        clock
            .switch_to(Side::Axis, crate::events::SwitchCause::Manual, t0)
            .expect("switch should succeed");
        let snapshot = clock.snapshot(t0 + chrono::Duration::seconds(40));

        let scores = score_pair(&snapshot, &[]);
        assert!((scores.axis - 20.0).abs() < 0.01);
        assert!(scores.allies.abs() < 1e-9);
    }

    #[test]
    fn percentages_and_winner() {
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut clock = MatchClock::new(false);
        clock.start(t0).expect("start should succeed");
        clock
            .switch_to(Side::Allies, crate::events::SwitchCause::Manual, t0)
            .expect("switch should succeed");
        clock
            .switch_to(Side::Axis, crate::events::SwitchCause::Manual, t0 + chrono::Duration::seconds(75))
            .expect("switch should succeed");
        clock
            .finalize_and_stop(t0 + chrono::Duration::seconds(100))
            .expect("stop should succeed");
        let snapshot = clock.snapshot(t0 + chrono::Duration::seconds(100));

        let (allies_pct, axis_pct) = control_percentages(&snapshot).expect("nonzero control time");
        assert!((allies_pct - 75.0).abs() < 0.01);
        assert!((axis_pct - 25.0).abs() < 0.01);

        let (winner, advantage) = control_winner(snapshot.seconds_allies, snapshot.seconds_axis);
        assert_eq!(winner, Some(Side::Allies));
        assert!((advantage - 50.0).abs() < 0.01);
    }

    #[test]
    fn formats_control_time_like_a_clock() {
        assert_eq!(format_clock(0.0), "0:00:00");
        assert_eq!(format_clock(40.0), "0:00:40");
        assert_eq!(format_clock(3903.0), "1:05:03");
        assert_eq!(format_clock(-5.0), "0:00:00");
    }
}
