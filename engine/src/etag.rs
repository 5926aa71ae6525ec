//! Logical clock values assigned to every physical write.
//!
//! An [`Etag`] is per-database and totally ordered: a later write always
//! carries a greater etag. Etags double as optimistic-concurrency tokens and
//! as cursors for incremental ("since") reads.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

/// A monotonically increasing logical clock value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Etag(u64);

impl Etag {
    /// The etag that precedes every write. Used as the "since the beginning"
    /// cursor and as the bookmark of a source we have never heard from.
    pub const EMPTY: Etag = Etag(0);

    /// Create an etag from its raw counter value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw counter value.
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The etag immediately after this one.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Whether this is the empty etag.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl From<u64> for Etag {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for Etag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Etag {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u64>().map(Etag)
    }
}

// Remote peers may send etags either as JSON numbers or as strings.
impl<'de> Deserialize<'de> for Etag {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(Etag(n)),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}
