use chrono::Utc;
use std::sync::Mutex;
use tracing::warn;

/// Requests are withheld once fewer than this many remain in the window.
pub const LOW_WATER: u64 = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateState {
    /// Unknown until the first response carrying the header.
    pub remaining: Option<u64>,
    /// Epoch seconds at which the quota window resets.
    pub reset_at: i64,
}

/// Tracks quota signals from API responses and decides whether a request may go out.
#[derive(Debug, Default)]
pub struct RateGate {
    state: Mutex<RateState>,
}

impl RateGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn may_proceed(&self) -> bool {
        self.may_proceed_at(Utc::now().timestamp())
    }

    pub fn may_proceed_at(&self, now: i64) -> bool {
        let state = self.snapshot();
        match state.remaining {
            Some(remaining) if remaining < LOW_WATER && state.reset_at > now => {
                warn!(
                    remaining,
                    reset_in_secs = state.reset_at - now,
                    "rate limited; withholding request"
                );
                false
            }
            _ => true,
        }
    }

    /// Absent values leave the prior state untouched.
    pub fn record(&self, remaining: Option<u64>, reset_at: Option<i64>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(remaining) = remaining {
            state.remaining = Some(remaining);
        }
        if let Some(reset_at) = reset_at {
            state.reset_at = reset_at;
        }
    }

    pub fn snapshot(&self) -> RateState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_quota_proceeds() {
        let gate = RateGate::new();
        assert!(gate.may_proceed_at(1_000));
    }

    #[test]
    fn low_quota_blocks_until_reset() {
        let gate = RateGate::new();
        gate.record(Some(9), Some(2_000));
        assert!(!gate.may_proceed_at(1_000));
        assert!(!gate.may_proceed_at(1_999));
        assert!(gate.may_proceed_at(2_000));
        assert!(gate.may_proceed_at(5_000));
    }

    #[test]
    fn threshold_is_exclusive() {
        let gate = RateGate::new();
        gate.record(Some(LOW_WATER), Some(2_000));
        assert!(gate.may_proceed_at(1_000));
    }

    #[test]
    fn missing_headers_keep_prior_state() {
        let gate = RateGate::new();
        gate.record(Some(3), Some(2_000));
        gate.record(None, None);
        assert_eq!(
            gate.snapshot(),
            RateState {
                remaining: Some(3),
                reset_at: 2_000
            }
        );
        assert!(!gate.may_proceed_at(1_500));

        gate.record(Some(4_000), None);
        assert!(gate.may_proceed_at(1_500));
        assert_eq!(gate.snapshot().reset_at, 2_000);
    }
}
