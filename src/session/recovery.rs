//! Pure recovery-decision logic, kept free of I/O and tested against
//! constructed fixtures the way teacher's `runtime/recovery.rs` tests
//! `should_auto_continue` — this module is its analogue for Session
//! staleness rather than mid-turn tool-call interruption.

use chrono::{DateTime, Duration as ChronoDuration, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryTrigger {
    /// Session is fresh; no recovery context needed.
    None,
    /// More than `context_stale_threshold` elapsed since last activity.
    Stale,
    /// The prior LLM call reported the remote session as unknown.
    RemoteUnknown,
}

/// Decide whether `recover_context` should run before the next LLM call,
/// given how long the session has been idle and whether the previous call
/// just failed with `remote_unknown`.
pub fn recovery_trigger(
    last_activity: DateTime<Utc>,
    now: DateTime<Utc>,
    stale_threshold: std::time::Duration,
    last_call_was_remote_unknown: bool,
) -> RecoveryTrigger {
    if last_call_was_remote_unknown {
        return RecoveryTrigger::RemoteUnknown;
    }
    let elapsed = now - last_activity;
    let threshold = ChronoDuration::from_std(stale_threshold).unwrap_or(ChronoDuration::zero());
    if elapsed > threshold {
        RecoveryTrigger::Stale
    } else {
        RecoveryTrigger::None
    }
}

/// Whether a session has timed out and should be expired before serving a
/// new message.
pub fn is_timed_out(
    last_activity: DateTime<Utc>,
    now: DateTime<Utc>,
    timeout: std::time::Duration,
) -> bool {
    let elapsed = now - last_activity;
    let timeout = ChronoDuration::from_std(timeout).unwrap_or(ChronoDuration::zero());
    elapsed >= timeout
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minutes_ago(n: i64) -> DateTime<Utc> {
        Utc::now() - ChronoDuration::minutes(n)
    }

    #[test]
    fn remote_unknown_always_wins() {
        let trigger = recovery_trigger(
            minutes_ago(0),
            Utc::now(),
            std::time::Duration::from_secs(600),
            true,
        );
        assert_eq!(trigger, RecoveryTrigger::RemoteUnknown);
    }

    #[test]
    fn fresh_session_needs_no_recovery() {
        let trigger = recovery_trigger(
            minutes_ago(1),
            Utc::now(),
            std::time::Duration::from_secs(600),
            false,
        );
        assert_eq!(trigger, RecoveryTrigger::None);
    }

    #[test]
    fn stale_session_over_threshold_triggers_recovery() {
        // active 59 minutes, last_activity 11 minutes ago, stale threshold
        // 10 minutes -> recovery triggers, timeout (60m) not yet reached
        let last_activity = minutes_ago(11);
        let now = Utc::now();
        let trigger = recovery_trigger(last_activity, now, std::time::Duration::from_secs(600), false);
        assert_eq!(trigger, RecoveryTrigger::Stale);
        assert!(!is_timed_out(last_activity, now, std::time::Duration::from_secs(3600)));
    }

    #[test]
    fn timeout_boundary_is_inclusive() {
        let last_activity = minutes_ago(60);
        assert!(is_timed_out(last_activity, Utc::now(), std::time::Duration::from_secs(3600)));
    }
}
