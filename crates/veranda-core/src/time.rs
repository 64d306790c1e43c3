//! Millisecond timestamps.
//!
//! All ordering and watermark comparisons in the engine run on unix
//! milliseconds carried as a plain `u64`. The newtype keeps provider rows,
//! watermarks, and clock reads from mixing with unrelated integers.

use std::fmt;
use std::ops::{Add, Sub};

use serde::{Deserialize, Serialize};

/// A unix timestamp in milliseconds.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The zero timestamp (unix epoch).
    pub const ZERO: Self = Self(0);

    /// Wrap a millisecond count.
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// The raw millisecond count.
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// This timestamp moved forward by `millis`, saturating at the maximum.
    pub const fn saturating_add(&self, millis: u64) -> Self {
        Self(self.0.saturating_add(millis))
    }

    /// This timestamp moved backward by `millis`, saturating at zero.
    pub const fn saturating_sub(&self, millis: u64) -> Self {
        Self(self.0.saturating_sub(millis))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Timestamp {
    fn from(millis: u64) -> Self {
        Self(millis)
    }
}

impl From<Timestamp> for u64 {
    fn from(ts: Timestamp) -> Self {
        ts.0
    }
}

impl Add<u64> for Timestamp {
    type Output = Timestamp;

    fn add(self, millis: u64) -> Timestamp {
        self.saturating_add(millis)
    }
}

impl Sub<u64> for Timestamp {
    type Output = Timestamp;

    fn sub(self, millis: u64) -> Timestamp {
        self.saturating_sub(millis)
    }
}
