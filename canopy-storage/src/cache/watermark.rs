//! Watermarks for racing fills against invalidations.
//!
//! Every cache tier carries a monotonically increasing invalidation sequence.
//! A reader takes a watermark before it calls the repository and hands it
//! back when it inserts the fetched value; the tier refuses the insert if the
//! key was invalidated (or the tier cleared) after that watermark was taken.

use std::sync::atomic::{AtomicU64, Ordering};

/// A point in a tier's invalidation history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Watermark {
    /// Invalidation sequence observed when the watermark was taken.
    pub sequence: u64,
}

impl Watermark {
    /// Create a watermark at the given sequence number.
    pub fn new(sequence: u64) -> Self {
        Self { sequence }
    }

    /// The watermark before any invalidation happened.
    pub fn zero() -> Self {
        Self { sequence: 0 }
    }

    /// Check if this watermark is newer than another.
    pub fn is_newer_than(&self, other: &Watermark) -> bool {
        self.sequence > other.sequence
    }

    /// Check if this watermark is at least as fresh as another.
    pub fn is_at_least(&self, other: &Watermark) -> bool {
        self.sequence >= other.sequence
    }
}

/// Source of watermarks for one tier.
#[derive(Debug, Default)]
pub struct InvalidationClock {
    sequence: AtomicU64,
}

impl InvalidationClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Watermark for a fill that is about to start.
    pub fn current(&self) -> Watermark {
        Watermark::new(self.sequence.load(Ordering::Acquire))
    }

    /// Advance the clock and return the watermark of the new invalidation.
    pub fn advance(&self) -> Watermark {
        Watermark::new(self.sequence.fetch_add(1, Ordering::AcqRel) + 1)
    }
}
