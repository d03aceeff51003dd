use std::time::Duration;

pub const DEFAULT_BACKOFF_MIN: Duration = Duration::from_millis(250);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(15);
pub const DEFAULT_BACKOFF_ATTEMPTS: u32 = 8;

/// Exponential delay between ssh connection attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub min: Duration,
    pub max: Duration,
    /// Attempts in one series before giving up; never less than one.
    pub attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            min: DEFAULT_BACKOFF_MIN,
            max: DEFAULT_BACKOFF_MAX,
            attempts: DEFAULT_BACKOFF_ATTEMPTS,
        }
    }
}

impl Backoff {
    pub fn limit(&self) -> u32 {
        self.attempts.max(1)
    }

    /// Delay after the failed `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.min
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max)
    }
}
