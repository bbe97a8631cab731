use std::time::Duration;

use rand::Rng;

/// Backoff delays for the supervisory retry loops.
///
/// The defaults are fixed placeholders (1/3/5 s). Callers may
/// override any field; `jitter` adds bounded randomization on top of
/// whichever delay is chosen, but the relative ordering documented on each
/// field — connection-drop reconnect fastest, then channel-create retry,
/// then fresh-connect retry slowest of the two five-second delays — is the
/// caller's responsibility to preserve if overriding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Delay before retrying a fresh connect after `TransientConnect`.
    pub connect_failure: Duration,
    /// Delay before retrying after a live connection drops.
    pub connection_dropped: Duration,
    /// Delay before retrying channel creation after `ChannelCreateFailed`.
    pub channel_create_failure: Duration,
    /// Delay before recreating a channel after it drops mid-life.
    pub channel_dropped: Duration,
    /// Fraction in `[0.0, 1.0]` of symmetric jitter applied to every delay
    /// above. `0.0` (the default) leaves the base delay untouched.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            connect_failure: Duration::from_secs(5),
            connection_dropped: Duration::from_secs(1),
            channel_create_failure: Duration::from_secs(5),
            channel_dropped: Duration::from_secs(3),
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Apply `self.jitter` to `base`, clamped to never go negative.
    pub(crate) fn jittered(&self, base: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return base;
        }
        let bound = self.jitter.min(1.0);
        let factor = 1.0 + rand::thread_rng().gen_range(-bound..=bound);
        Duration::from_secs_f64((base.as_secs_f64() * factor).max(0.0))
    }

    pub(crate) fn connect_failure_delay(&self) -> Duration {
        self.jittered(self.connect_failure)
    }

    pub(crate) fn connection_dropped_delay(&self) -> Duration {
        self.jittered(self.connection_dropped)
    }

    pub(crate) fn channel_create_failure_delay(&self) -> Duration {
        self.jittered(self.channel_create_failure)
    }

    pub(crate) fn channel_dropped_delay(&self) -> Duration {
        self.jittered(self.channel_dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_source_placeholders() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.connect_failure, Duration::from_secs(5));
        assert_eq!(policy.connection_dropped, Duration::from_secs(1));
        assert_eq!(policy.channel_create_failure, Duration::from_secs(5));
        assert_eq!(policy.channel_dropped, Duration::from_secs(3));
        assert_eq!(policy.jitter, 0.0);
    }

    #[test]
    fn zero_jitter_is_exact() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.jittered(Duration::from_secs(5)), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            jitter: 0.5,
            ..RetryPolicy::default()
        };
        let base = Duration::from_secs(10);
        for _ in 0..100 {
            let d = policy.jittered(base);
            assert!(d.as_secs_f64() >= 5.0 && d.as_secs_f64() <= 15.0);
        }
    }

    #[test]
    fn retry_ordering_preserved_by_default() {
        let policy = RetryPolicy::default();
        assert!(policy.connection_dropped < policy.channel_dropped);
        assert!(policy.channel_dropped < policy.channel_create_failure);
        assert_eq!(policy.channel_create_failure, policy.connect_failure);
    }
}
