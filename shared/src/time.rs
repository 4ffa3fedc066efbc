use std::{
    fmt,
    num::ParseIntError,
    str::FromStr,
    time::{Duration, SystemTime},
};

use thiserror::Error;

/// Error type for timestamp operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TimeError {
    #[error("System time is before UNIX epoch")]
    SystemTimeBeforeEpoch,
}

/// Wall-clock time in milliseconds since the UNIX epoch.
///
/// Used wherever a point in time has to be shown to users or carried over
/// the wire (request expiry, "last alive" of a host). Deadlines that only
/// matter inside the process use `std::time::Instant` instead.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const EPOCH: Timestamp = Timestamp(0);

    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the current timestamp.
    ///
    /// # Errors
    /// Returns `TimeError::SystemTimeBeforeEpoch` if system time is before UNIX epoch.
    pub fn try_now() -> Result<Self, TimeError> {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| Self(d.as_millis() as u64))
            .map_err(|_| TimeError::SystemTimeBeforeEpoch)
    }

    /// Returns the current timestamp, or the epoch if the clock is unusable.
    pub fn now_or_epoch() -> Self {
        Self::try_now().unwrap_or(Self::EPOCH)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    pub fn is_epoch(&self) -> bool {
        self.0 == 0
    }

    pub fn after(&self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration.as_millis() as u64))
    }

    /// Time elapsed between `earlier` and `self`, zero if `earlier` is later.
    pub fn since(&self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Timestamp {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>().map(Self)
    }
}
