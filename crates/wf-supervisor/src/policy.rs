use std::cmp;
use std::time::Duration;

/// Bounded descriptor polling after a launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartPolicy {
    pub poll_interval: Duration,
    pub max_attempts: u32,
}

impl Default for StartPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            max_attempts: 50,
        }
    }
}

impl StartPolicy {
    pub fn budget(&self) -> Duration {
        self.poll_interval.saturating_mul(self.max_attempts)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchPolicy {
    pub interval: Duration,
}

impl Default for WatchPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
        }
    }
}

/// Cool-down between failed restarts after a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub cooldown: Duration,
    pub max_cooldown: Duration,
    /// `None` keeps retrying for the life of the supervisor.
    pub max_attempts: Option<u32>,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(5),
            max_cooldown: Duration::from_secs(60),
            max_attempts: None,
        }
    }
}

impl RestartPolicy {
    /// Delay before retrying after the `failures`-th consecutive failed
    /// restart, or `None` once the attempt budget is spent.
    pub fn delay_after(&self, failures: u32) -> Option<Duration> {
        if let Some(max) = self.max_attempts {
            if failures >= max {
                return None;
            }
        }
        let step = self.cooldown.saturating_mul(failures.max(1));
        Some(cmp::min(step, self.max_cooldown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_budget_is_five_seconds_by_default() {
        assert_eq!(StartPolicy::default().budget(), Duration::from_secs(5));
    }

    #[test]
    fn restart_delay_grows_linearly_and_caps() {
        let policy = RestartPolicy {
            cooldown: Duration::from_secs(5),
            max_cooldown: Duration::from_secs(12),
            max_attempts: None,
        };
        assert_eq!(policy.delay_after(1), Some(Duration::from_secs(5)));
        assert_eq!(policy.delay_after(2), Some(Duration::from_secs(10)));
        assert_eq!(policy.delay_after(3), Some(Duration::from_secs(12)));
        assert_eq!(policy.delay_after(500), Some(Duration::from_secs(12)));
    }

    #[test]
    fn restart_budget_exhausts() {
        let policy = RestartPolicy {
            max_attempts: Some(2),
            ..RestartPolicy::default()
        };
        assert!(policy.delay_after(1).is_some());
        assert!(policy.delay_after(2).is_none());
    }
}
