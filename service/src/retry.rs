//! Client reconnection policies.

use rand::Rng;
use std::time::Duration;

/// How a client behaves after a connect failure or a poisoned disconnect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Fail permanently on the first disconnect.
    None,
    /// Retry at a fixed interval.
    Fixed(Duration),
    /// Retry with doubling delays bounded by `cap`, optionally jittered to
    /// spread reconnect storms.
    ExponentialBackoff {
        base: Duration,
        cap: Duration,
        jitter: bool,
    },
}

impl RetryPolicy {
    /// Delay before attempt `attempt` (zero-based), or `None` to give up.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        match self {
            RetryPolicy::None => None,
            RetryPolicy::Fixed(delay) => Some(*delay),
            RetryPolicy::ExponentialBackoff { base, cap, jitter } => {
                let exponent = attempt.min(16);
                let mut delay = base
                    .saturating_mul(2u32.saturating_pow(exponent))
                    .min(*cap);
                if *jitter {
                    let factor = rand::thread_rng().gen_range(0.5..1.5);
                    delay = delay.mul_f64(factor).min(*cap);
                }
                Some(delay)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_gives_up() {
        assert_eq!(RetryPolicy::None.delay(0), None);
    }

    #[test]
    fn test_fixed_is_constant() {
        let policy = RetryPolicy::Fixed(Duration::from_millis(250));
        assert_eq!(policy.delay(0), Some(Duration::from_millis(250)));
        assert_eq!(policy.delay(9), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_backoff_doubles_to_cap() {
        let policy = RetryPolicy::ExponentialBackoff {
            base: Duration::from_millis(100),
            cap: Duration::from_secs(2),
            jitter: false,
        };
        assert_eq!(policy.delay(0), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay(1), Some(Duration::from_millis(200)));
        assert_eq!(policy.delay(2), Some(Duration::from_millis(400)));
        assert_eq!(policy.delay(10), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_jitter_stays_bounded() {
        let policy = RetryPolicy::ExponentialBackoff {
            base: Duration::from_millis(100),
            cap: Duration::from_secs(1),
            jitter: true,
        };
        for attempt in 0..8 {
            let delay = policy.delay(attempt).unwrap();
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= Duration::from_secs(1));
        }
    }
}
