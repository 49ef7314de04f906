//! Priority levels.

use crate::error::{SchedError, SchedResult};
use std::fmt;

/// Number of fixed priority buckets.
pub const PRIORITY_LEVELS: usize = 8;

/// A priority level; higher runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Priority(u8);

impl Priority {
    /// Lowest priority.
    pub const MIN: Self = Self(0);
    /// Highest priority.
    pub const MAX: Self = Self((PRIORITY_LEVELS - 1) as u8);

    /// Validate a level.
    pub fn new(level: usize) -> SchedResult<Self> {
        if level < PRIORITY_LEVELS {
            Ok(Self(level as u8))
        } else {
            Err(SchedError::InvalidPriority {
                level,
                levels: PRIORITY_LEVELS,
            })
        }
    }

    /// Clamp a level into range.
    #[must_use]
    pub const fn saturating(level: usize) -> Self {
        if level < PRIORITY_LEVELS {
            Self(level as u8)
        } else {
            Self::MAX
        }
    }

    /// The bucket index.
    #[must_use]
    pub const fn level(self) -> usize {
        self.0 as usize
    }

    /// All levels from highest down to `cutoff`.
    pub(crate) fn descending_to(cutoff: Self) -> impl Iterator<Item = Self> {
        (cutoff.level()..PRIORITY_LEVELS).rev().map(Self::saturating)
    }
}

impl TryFrom<usize> for Priority {
    type Error = SchedError;

    fn try_from(level: usize) -> SchedResult<Self> {
        Self::new(level)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}
