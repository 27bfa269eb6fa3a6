use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::clock::MatchClock;
use crate::crcon::{CrconClient, MapInfo};
use crate::events::{ChangeReason, ChannelId, RemoteScores, Side, StopReason};
use crate::registry::MatchRegistry;
use crate::score;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureSignal {
    None,
    Captured(Side),
    /// Both sides' scores rose in the same tick. Treated as ambiguous and
    /// left to manual control.
    Ambiguous,
}

/// A side's score increasing against the stored baseline means that side just
/// captured the objective.
pub fn detect_capture(baseline: RemoteScores, fresh: RemoteScores) -> CaptureSignal {
    let allies_up = fresh.allies > baseline.allies;
    let axis_up = fresh.axis > baseline.axis;
    match (allies_up, axis_up) {
        (true, true) => CaptureSignal::Ambiguous,
        (true, false) => CaptureSignal::Captured(Side::Allies),
        (false, true) => CaptureSignal::Captured(Side::Axis),
        (false, false) => CaptureSignal::None,
    }
}

/// One locked evaluation step: advances the baseline unconditionally (so each
/// capture is seen at most once) and decides whether an auto switch fires.
/// The first observation only primes the baseline.
fn evaluate_scores(
    clock: &mut MatchClock,
    fresh: RemoteScores,
    capturable: bool,
) -> (CaptureSignal, Option<Side>) {
    let baseline = clock.observe_scores(fresh);
    if !capturable {
        return (CaptureSignal::None, None);
    }
    let Some(baseline) = baseline else {
        return (CaptureSignal::None, None);
    };
    let signal = detect_capture(baseline, fresh);
    let fire = match signal {
        CaptureSignal::Captured(side)
            if clock.auto_switch() && clock.controlling() != Some(side) =>
        {
            Some(side)
        }
        _ => None,
    };
    (signal, fire)
}

pub fn spawn_reconciler(registry: Arc<MatchRegistry>, channel: ChannelId) -> JoinHandle<()> {
    tokio::spawn(async move {
        run_reconcile_loop(registry, channel).await;
    })
}

async fn run_reconcile_loop(registry: Arc<MatchRegistry>, channel: ChannelId) {
    let interval = registry.config().update_interval();
    let end_threshold = registry.config().end_threshold_secs;
    info!(
        channel,
        period_secs = interval.as_secs(),
        "reconciliation loop started"
    );

    loop {
        sleep(interval).await;

        let Some(handle) = registry.get(channel) else {
            info!(channel, "match gone from registry; reconciliation loop exiting");
            return;
        };
        {
            let clock = handle.lock_clock();
            if !clock.started() || clock.ended() {
                info!(channel, "match no longer live; reconciliation loop exiting");
                return;
            }
        }

        // A lost session is replaced wholesale on the next tick.
        let client = match handle.client() {
            Some(client) => client,
            None => match CrconClient::connect(registry.config().crcon_settings()).await {
                Ok(client) => {
                    let client = Arc::new(client);
                    handle.replace_client(Some(client.clone()));
                    info!(channel, "control api session established");
                    client
                }
                Err(err) => {
                    handle.consecutive_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(?err, channel, "control api unavailable; skipping tick");
                    continue;
                }
            },
        };

        let live = client.fetch_live_state().await;
        let Some(game) = live.game.clone() else {
            handle.consecutive_failures.fetch_add(1, Ordering::Relaxed);
            warn!(channel, "game state unknown this cycle; skipping tick");
            continue;
        };
        handle.consecutive_failures.store(0, Ordering::Relaxed);

        // End-of-match detection runs through the same stop path as the
        // manual command.
        if let Some(remaining) = game.time_remaining {
            if remaining <= end_threshold {
                info!(channel, remaining, "match time expired; stopping");
                if let Err(err) = registry.stop_match(channel, StopReason::TimeExpired).await {
                    warn!(?err, channel, "automatic stop failed");
                }
                return;
            }
        }

        let capturable = live
            .map
            .as_ref()
            .map(MapInfo::supports_capture)
            .unwrap_or(true);
        if !capturable {
            debug!(channel, "map mode without objective capture; auto-switch skipped");
        }

        let (signal, fire) = {
            let mut clock = handle.lock_clock();
            if clock.ended() {
                // Raced a concurrent stop between the liveness check and now.
                return;
            }
            evaluate_scores(&mut clock, game.scores, capturable)
        };

        match signal {
            CaptureSignal::Ambiguous => warn!(
                channel,
                "both sides' scores rose in one tick; ambiguous, leaving control manual"
            ),
            CaptureSignal::Captured(side) if fire.is_none() => {
                debug!(channel, %side, "capture observed without auto switch")
            }
            _ => {}
        }

        if let Some(side) = fire {
            if let Err(err) = registry.apply_auto_switch(channel, side).await {
                warn!(?err, channel, %side, "auto switch rejected");
            }
        } else {
            // Plain display refresh; the switch path emits its own event.
            let snapshot = handle.lock_clock().snapshot(Utc::now());
            registry.emit_state(
                channel,
                &snapshot,
                score::score_pair(&snapshot, live.player_details()),
                ChangeReason::Refresh,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{detect_capture, evaluate_scores, CaptureSignal};
    use crate::clock::MatchClock;
    use crate::events::{RemoteScores, Side};

    fn scores(allies: i64, axis: i64) -> RemoteScores {
        RemoteScores { allies, axis }
    }

    #[test]
    fn score_increase_maps_to_the_capturing_side() {
        assert_eq!(
            detect_capture(scores(10, 5), scores(10, 6)),
            CaptureSignal::Captured(Side::Axis)
        );
        assert_eq!(
            detect_capture(scores(1, 1), scores(2, 1)),
            CaptureSignal::Captured(Side::Allies)
        );
        assert_eq!(detect_capture(scores(3, 3), scores(3, 3)), CaptureSignal::None);
        assert_eq!(
            detect_capture(scores(1, 1), scores(2, 2)),
            CaptureSignal::Ambiguous
        );
        // A decrease is a map rotation artifact, never a capture.
        assert_eq!(detect_capture(scores(5, 5), scores(0, 5)), CaptureSignal::None);
    }

    #[test]
    fn first_observation_only_primes_the_baseline() {
        let mut clock = MatchClock::new(true);
        clock.start(Utc::now()).expect("start should succeed");

        let (signal, fire) = evaluate_scores(&mut clock, scores(10, 5), true);
        assert_eq!(signal, CaptureSignal::None);
        assert_eq!(fire, None);

        let (signal, fire) = evaluate_scores(&mut clock, scores(10, 6), true);
        assert_eq!(signal, CaptureSignal::Captured(Side::Axis));
        assert_eq!(fire, Some(Side::Axis));
    }

    #[test]
    fn capture_fires_at_most_once_per_delta() {
        let mut clock = MatchClock::new(true);
        clock.start(Utc::now()).expect("start should succeed");
        evaluate_scores(&mut clock, scores(10, 5), true);

        let (_, fire) = evaluate_scores(&mut clock, scores(10, 6), true);
        assert_eq!(fire, Some(Side::Axis));

        // Unchanged scoreboard on later ticks never re-triggers.
        for _ in 0..3 {
            let (signal, fire) = evaluate_scores(&mut clock, scores(10, 6), true);
            assert_eq!(signal, CaptureSignal::None);
            assert_eq!(fire, None);
        }
    }

    #[test]
    fn disabled_auto_switch_never_fires() {
        let mut clock = MatchClock::new(false);
        clock.start(Utc::now()).expect("start should succeed");
        evaluate_scores(&mut clock, scores(0, 0), true);

        let (signal, fire) = evaluate_scores(&mut clock, scores(4, 0), true);
        assert_eq!(signal, CaptureSignal::Captured(Side::Allies));
        assert_eq!(fire, None);
    }

    #[test]
    fn ambiguous_double_increase_fires_nothing() {
        let mut clock = MatchClock::new(true);
        clock.start(Utc::now()).expect("start should succeed");
        evaluate_scores(&mut clock, scores(1, 1), true);

        let (signal, fire) = evaluate_scores(&mut clock, scores(2, 2), true);
        assert_eq!(signal, CaptureSignal::Ambiguous);
        assert_eq!(fire, None);
    }

    #[test]
    fn controlling_side_capture_does_not_refire() {
        let mut clock = MatchClock::new(true);
        clock.start(Utc::now()).expect("start should succeed");
        clock
            .switch_to(Side::Allies, crate::events::SwitchCause::Manual, Utc::now())
            .expect("switch should succeed");
        evaluate_scores(&mut clock, scores(1, 0), true);

        let (signal, fire) = evaluate_scores(&mut clock, scores(2, 0), true);
        assert_eq!(signal, CaptureSignal::Captured(Side::Allies));
        assert_eq!(fire, None);
    }

    #[test]
    fn non_capturable_map_still_advances_the_baseline() {
        let mut clock = MatchClock::new(true);
        clock.start(Utc::now()).expect("start should succeed");
        evaluate_scores(&mut clock, scores(0, 0), true);

        // Offensive round: the delta is observed but nothing fires, and the
        // baseline moves so the capture is not replayed later.
        let (signal, fire) = evaluate_scores(&mut clock, scores(0, 3), false);
        assert_eq!(signal, CaptureSignal::None);
        assert_eq!(fire, None);

        let (signal, fire) = evaluate_scores(&mut clock, scores(0, 3), true);
        assert_eq!(signal, CaptureSignal::None);
        assert_eq!(fire, None);
    }
}
