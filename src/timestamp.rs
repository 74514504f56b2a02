use std::fmt::{self, Display, Formatter};
use std::ops::Add;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Number of microseconds in a second.
pub const MICROS_PER_SECOND: i64 = 1_000_000;

/// A point in time with microsecond resolution, counted from the UNIX epoch.
///
/// Used for poll-return times, timer expirations and log lines; the zero
/// value means "not set".
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Default)]
pub struct Timestamp {
    micros: i64,
}

impl Timestamp {
    /// Reads the current wall-clock time.
    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock set before the UNIX epoch");
        Timestamp {
            micros: since_epoch.as_micros() as i64,
        }
    }

    /// Constructs a timestamp from a raw microsecond count.
    pub fn from_micros(micros: i64) -> Self { Timestamp { micros } }

    /// An unset timestamp, ordered before every valid one.
    pub fn invalid() -> Self { Timestamp { micros: 0 } }

    pub fn is_valid(self) -> bool { self.micros > 0 }

    pub fn micros_since_epoch(self) -> i64 { self.micros }

    /// Time elapsed from `earlier` to `self`; zero if `earlier` is later.
    pub fn duration_since(self, earlier: Timestamp) -> Duration {
        if self.micros <= earlier.micros {
            return Duration::ZERO;
        }
        Duration::from_micros((self.micros - earlier.micros) as u64)
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp {
            micros: self.micros + rhs.as_micros() as i64,
        }
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.micros / MICROS_PER_SECOND, self.micros % MICROS_PER_SECOND)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_and_arithmetic() {
        let base = Timestamp::from_micros(5 * MICROS_PER_SECOND);
        let later = base + Duration::from_millis(1500);
        assert!(later > base);
        assert_eq!(later.duration_since(base), Duration::from_millis(1500));
        assert_eq!(base.duration_since(later), Duration::ZERO);
        assert_eq!(later.micros_since_epoch(), 6_500_000);
    }

    #[test]
    fn validity() {
        assert!(!Timestamp::invalid().is_valid());
        assert!(Timestamp::now().is_valid());
        assert!(Timestamp::invalid() < Timestamp::now());
    }

    #[test]
    fn display_pads_fraction() {
        let t = Timestamp::from_micros(3 * MICROS_PER_SECOND + 42);
        assert_eq!(t.to_string(), "3.000042");
    }
}
