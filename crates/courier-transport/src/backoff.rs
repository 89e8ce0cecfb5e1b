// Reconnect delay schedule.
use std::time::Duration;

/// Exponential reconnect policy.
///
/// The default waits 1s before the first attempt, grows the delay by 10%
/// per attempt and caps it at 60s, retrying forever.
///
/// ```
/// use courier_transport::ReconnectPolicy;
/// use std::time::Duration;
///
/// let policy = ReconnectPolicy {
///     initial_delay: Duration::from_millis(100),
///     max_delay: Duration::from_millis(300),
///     multiplier: 2.0,
///     max_attempts: Some(4),
/// };
/// let delays: Vec<_> = policy.delays().collect();
/// assert_eq!(
///     delays,
///     vec![
///         Duration::from_millis(100),
///         Duration::from_millis(200),
///         Duration::from_millis(300),
///         Duration::from_millis(300),
///     ]
/// );
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    // None retries until the caller disconnects.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 1.1,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    pub fn delays(&self) -> Backoff {
        Backoff {
            next_delay: self.initial_delay.min(self.max_delay),
            max_delay: self.max_delay,
            multiplier: if self.multiplier.is_finite() && self.multiplier >= 1.0 {
                self.multiplier
            } else {
                1.0
            },
            remaining: self.max_attempts,
        }
    }
}

/// Iterator over the delays before each reconnect attempt.
#[derive(Debug, Clone)]
pub struct Backoff {
    next_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    remaining: Option<u32>,
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining == 0 {
                return None;
            }
            *remaining -= 1;
        }
        let delay = self.next_delay;
        let grown = delay.as_secs_f64() * self.multiplier;
        self.next_delay = if grown >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(grown)
        };
        Some(delay)
    }
}
