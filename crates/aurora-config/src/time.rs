//! Time source for anything that depends on "now", such as TTL labels.
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;

    /// Seconds since the Unix epoch `offset` from now. Times before the epoch
    /// count as zero and the sum saturates at [`u64::MAX`].
    fn epoch_seconds_after(&self, offset: Duration) -> u64 {
        self.now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_secs())
            .saturating_add(offset.as_secs())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Always returns the same instant.
#[derive(Clone, Copy, Debug)]
pub struct FixedClock(pub SystemTime);

impl FixedClock {
    pub fn from_epoch_seconds(seconds: u64) -> Self {
        Self(UNIX_EPOCH + Duration::from_secs(seconds))
    }
}

impl Clock for FixedClock {
    fn now(&self) -> SystemTime {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock_adds_offsets() {
        let clock = FixedClock::from_epoch_seconds(1_000);
        assert_eq!(clock.epoch_seconds_after(Duration::from_secs(60)), 1_060);
    }

    #[test]
    fn huge_offsets_saturate() {
        let clock = FixedClock::from_epoch_seconds(1_700_000_000);
        let offset = humantime::parse_duration("292300000000y").expect("fits in a Duration");

        assert_eq!(clock.epoch_seconds_after(offset), u64::MAX);
        assert_eq!(clock.epoch_seconds_after(Duration::MAX), u64::MAX);
    }
}
