//! Debouncer/hold for drive-mode decisions.
//!
//! Two phases: `Idle` (nothing being held) and `Holding` (a decision is
//! within its minimum display window). All mutation happens under a single
//! mutex region; expiry is evaluated lazily on every entry, so readers never
//! observe a hold older than their own call.

use std::cmp;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::policy::DriveModeDecision;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldPhase {
    Idle,
    Holding { held_until: DateTime<Utc> },
}

#[derive(Debug)]
struct HoldInner {
    phase: HoldPhase,
    current: Option<DriveModeDecision>,
}

/// Owns the single current decision and its hold window.
///
/// `submit` and the readers are safe to call from any thread or task. The
/// current decision persists across hold expiry; only a qualifying
/// opposite-mode decision replaces it.
#[derive(Debug)]
pub struct DecisionHold {
    hold_duration: Duration,
    inner: Mutex<HoldInner>,
}

impl DecisionHold {
    pub fn new(hold_duration_ms: u64) -> Self {
        Self {
            hold_duration: Duration::milliseconds(hold_duration_ms as i64),
            inner: Mutex::new(HoldInner {
                phase: HoldPhase::Idle,
                current: None,
            }),
        }
    }

    /// Submits a decision. Returns the decision if it changed the presented
    /// mode (and therefore must be delivered to subscribers), `None` for
    /// same-mode refreshes.
    pub fn submit(&self, decision: DriveModeDecision) -> Option<DriveModeDecision> {
        self.submit_at(decision, Utc::now())
    }

    /// Point-in-time read of the current decision, applying lazy expiry.
    pub fn current_decision(&self) -> Option<DriveModeDecision> {
        self.current_decision_at(Utc::now())
    }

    pub fn phase(&self) -> HoldPhase {
        self.phase_at(Utc::now())
    }

    pub(crate) fn submit_at(
        &self,
        decision: DriveModeDecision,
        now: DateTime<Utc>,
    ) -> Option<DriveModeDecision> {
        let mut inner = self.lock();
        Self::expire(&mut inner, now);

        let held_until = self.deadline(&decision, now);
        match &inner.current {
            Some(current) if current.mode == decision.mode => {
                // Same target mode: the presented decision stays as-is, a
                // running hold is refreshed from the new decision's time.
                if matches!(inner.phase, HoldPhase::Holding { .. }) {
                    inner.phase = HoldPhase::Holding { held_until };
                    debug!(mode = %decision.mode, "hold refreshed until {}", held_until);
                }
                None
            }
            _ => {
                // First decision, or an urgent mode change preempting a
                // stale hold: replace immediately, never suppress it.
                inner.phase = HoldPhase::Holding { held_until };
                inner.current = Some(decision.clone());
                Some(decision)
            }
        }
    }

    pub(crate) fn current_decision_at(&self, now: DateTime<Utc>) -> Option<DriveModeDecision> {
        let mut inner = self.lock();
        Self::expire(&mut inner, now);
        inner.current.clone()
    }

    pub(crate) fn phase_at(&self, now: DateTime<Utc>) -> HoldPhase {
        let mut inner = self.lock();
        Self::expire(&mut inner, now);
        inner.phase
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HoldInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // held_until must never precede effective_from, even for decisions
    // stamped ahead of the local clock.
    fn deadline(&self, decision: &DriveModeDecision, now: DateTime<Utc>) -> DateTime<Utc> {
        cmp::max(decision.effective_from, now) + self.hold_duration
    }

    fn expire(inner: &mut HoldInner, now: DateTime<Utc>) {
        if let HoldPhase::Holding { held_until } = inner.phase {
            if now >= held_until {
                // Internal bookkeeping only: the decision stays presented.
                inner.phase = HoldPhase::Idle;
                debug!("hold window elapsed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::event::EmotionLabel;
    use crate::policy::DriveMode;
    use chrono::TimeZone;

    const HOLD_MS: u64 = 5_000;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 6, 10, 0, 0).unwrap()
    }

    fn at(offset_ms: i64) -> DateTime<Utc> {
        t0() + Duration::milliseconds(offset_ms)
    }

    fn decision(mode: DriveMode, label: EmotionLabel, effective_from: DateTime<Utc>) -> DriveModeDecision {
        DriveModeDecision {
            mode,
            triggering_emotion: label,
            effective_from,
            reason: format!("driver appears {}", label),
        }
    }

    #[test]
    fn first_decision_is_emitted_and_held() {
        let hold = DecisionHold::new(HOLD_MS);
        let restricted = decision(DriveMode::Restricted, EmotionLabel::Sad, t0());

        let emitted = hold.submit_at(restricted.clone(), t0());
        assert_eq!(emitted, Some(restricted.clone()));
        assert_eq!(hold.current_decision_at(t0()), Some(restricted));
        assert_eq!(
            hold.phase_at(t0()),
            HoldPhase::Holding { held_until: at(HOLD_MS as i64) }
        );
    }

    #[test]
    fn decision_survives_hold_expiry_without_reverting() {
        // Restricted at t0; still presented right before expiry, and still
        // presented after, with the phase back to Idle.
        let hold = DecisionHold::new(HOLD_MS);
        let restricted = decision(DriveMode::Restricted, EmotionLabel::Sad, t0());
        hold.submit_at(restricted.clone(), t0());

        assert_eq!(
            hold.current_decision_at(at(4_900)).map(|d| d.mode),
            Some(DriveMode::Restricted)
        );

        assert_eq!(hold.phase_at(at(5_100)), HoldPhase::Idle);
        assert_eq!(
            hold.current_decision_at(at(5_100)).map(|d| d.mode),
            Some(DriveMode::Restricted)
        );
    }

    #[test]
    fn same_mode_decision_extends_the_hold() {
        // Restricted active, angry arrives mid-hold: mode stays, no second
        // emission, held_until extends from the new decision's time.
        let hold = DecisionHold::new(HOLD_MS);
        hold.submit_at(decision(DriveMode::Restricted, EmotionLabel::Sad, t0()), t0());

        let angry = decision(DriveMode::Restricted, EmotionLabel::Angry, at(2_000));
        assert_eq!(hold.submit_at(angry, at(2_000)), None);

        let current = hold.current_decision_at(at(2_000)).unwrap();
        assert_eq!(current.triggering_emotion, EmotionLabel::Sad);
        assert_eq!(
            hold.phase_at(at(2_000)),
            HoldPhase::Holding { held_until: at(2_000 + HOLD_MS as i64) }
        );
    }

    #[test]
    fn opposite_mode_decision_preempts_the_hold() {
        let hold = DecisionHold::new(HOLD_MS);
        hold.submit_at(decision(DriveMode::Restricted, EmotionLabel::Sad, t0()), t0());

        let happy = decision(DriveMode::Normal, EmotionLabel::Happy, at(2_000));
        let emitted = hold.submit_at(happy.clone(), at(2_000));
        assert_eq!(emitted, Some(happy));

        let current = hold.current_decision_at(at(2_000)).unwrap();
        assert_eq!(current.mode, DriveMode::Normal);
        assert_eq!(
            hold.phase_at(at(2_000)),
            HoldPhase::Holding { held_until: at(2_000 + HOLD_MS as i64) }
        );
    }

    #[test]
    fn resubmitting_the_same_decision_is_idempotent() {
        let hold = DecisionHold::new(HOLD_MS);
        let restricted = decision(DriveMode::Restricted, EmotionLabel::Sad, t0());

        assert!(hold.submit_at(restricted.clone(), t0()).is_some());
        assert!(hold.submit_at(restricted.clone(), at(10)).is_none());
        assert_eq!(hold.current_decision_at(at(10)), Some(restricted));
        // Only held_until moved.
        assert_eq!(
            hold.phase_at(at(10)),
            HoldPhase::Holding { held_until: at(10 + HOLD_MS as i64) }
        );
    }

    #[test]
    fn hold_never_reverts_to_prior_decision_mid_window() {
        let hold = DecisionHold::new(HOLD_MS);
        hold.submit_at(decision(DriveMode::Normal, EmotionLabel::Happy, t0()), t0());
        hold.submit_at(decision(DriveMode::Restricted, EmotionLabel::Sad, at(1_000)), at(1_000));

        // Same-mode superseding events must not bring Normal back.
        hold.submit_at(decision(DriveMode::Restricted, EmotionLabel::Fearful, at(2_000)), at(2_000));
        for offset in [1_500, 3_000, 5_500] {
            assert_eq!(
                hold.current_decision_at(at(offset)).map(|d| d.mode),
                Some(DriveMode::Restricted)
            );
        }
    }

    #[test]
    fn same_mode_while_idle_does_not_rearm_the_hold() {
        let hold = DecisionHold::new(HOLD_MS);
        hold.submit_at(decision(DriveMode::Restricted, EmotionLabel::Sad, t0()), t0());

        // Past expiry: phase is Idle, decision persists.
        let offset = HOLD_MS as i64 + 1_000;
        assert_eq!(hold.phase_at(at(offset)), HoldPhase::Idle);

        let again = decision(DriveMode::Restricted, EmotionLabel::Sad, at(offset));
        assert_eq!(hold.submit_at(again, at(offset)), None);
        assert_eq!(hold.phase_at(at(offset)), HoldPhase::Idle);
    }

    #[test]
    fn deadline_respects_future_effective_from() {
        let hold = DecisionHold::new(HOLD_MS);
        // Decision stamped 1s ahead of the local clock.
        let ahead = decision(DriveMode::Restricted, EmotionLabel::Sad, at(1_000));
        hold.submit_at(ahead, t0());

        assert_eq!(
            hold.phase_at(t0()),
            HoldPhase::Holding { held_until: at(1_000 + HOLD_MS as i64) }
        );
    }
}
