//! Wall-clock timestamps with millisecond resolution
//!
//! Data objects and node descriptions carry creator wall-clock times; the
//! metadata wire format writes them as `sec.usec`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Current wall clock
    pub fn now() -> Self {
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis() as u64;
        Timestamp(ms)
    }

    pub fn from_millis(ms: u64) -> Self {
        Timestamp(ms)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1000.0
    }

    /// Parse the `sec.usec` form used in metadata documents
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.splitn(2, '.');
        let secs: u64 = parts.next()?.parse().ok()?;
        let frac = parts.next().unwrap_or("0");
        // Fractional part is microseconds, possibly short
        let usecs: u64 = if frac.is_empty() {
            0
        } else {
            let padded = format!("{:0<6}", frac);
            padded[..6].parse().ok()?
        };
        Some(Timestamp(secs * 1000 + usecs / 1000))
    }

    pub fn saturating_sub(&self, other: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(other.0))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // sec.usec, microseconds zero-padded
        write!(f, "{}.{:06}", self.0 / 1000, (self.0 % 1000) * 1000)
    }
}
