//! Named virtual clocks.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Clock used for commands that do not name one.
pub const DEFAULT_CLOCK: &str = "default";

/// A named timeline commands are due against.
///
/// `utc_now` never decreases. Each clock is advanced explicitly, so tests and
/// simulations can move days ahead in one call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clock {
    pub name: String,
    pub utc_now: DateTime<Utc>,
    pub start_time: DateTime<Utc>,
}

impl Clock {
    /// A clock starting, and currently standing, at `start_time`.
    pub fn new(name: impl Into<String>, start_time: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            utc_now: start_time,
            start_time,
        }
    }
}

/// Target of a clock advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceTo {
    /// An absolute instant.
    Time(DateTime<Utc>),
    /// An offset from the clock's current time.
    By(Duration),
}

impl AdvanceTo {
    /// The instant this advance lands on for a clock standing at `current`,
    /// or `None` when that instant is out of range.
    pub fn resolve(&self, current: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match *self {
            AdvanceTo::Time(at) => Some(at),
            AdvanceTo::By(by) => current.checked_add_signed(by),
        }
    }
}

/// End of a lease of length `lease` taken at `from`, clamped to the
/// latest representable instant.
pub(crate) fn lease_end(from: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    from.checked_add_signed(lease).unwrap_or(DateTime::<Utc>::MAX_UTC)
}
