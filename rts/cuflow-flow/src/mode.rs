//! Control-flow modes.
//!
//! A mode declares what a computation is allowed to do with [`split`]:
//! whether it may fail (a zero-way split) and whether it may branch into
//! more than one way. The four classic determinism categories fall out of
//! the two bits:
//!
//! ```text
//!                 may_branch = false   may_branch = true
//! may_fail=false  DET                  MULTI
//! may_fail=true   SEMIDET              NONDET
//! ```
//!
//! [`split`]: crate::split

use std::fmt;

/// Declared split capabilities of a computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FlowMode {
    /// The computation may perform a zero-way split (fail).
    pub may_fail: bool,
    /// The computation may perform a split of more than one way.
    pub may_branch: bool,
}

impl FlowMode {
    /// Exactly one solution.
    pub const DET: Self = Self::new(false, false);
    /// Zero or one solution.
    pub const SEMIDET: Self = Self::new(true, false);
    /// One or more solutions.
    pub const MULTI: Self = Self::new(false, true);
    /// Any number of solutions.
    pub const NONDET: Self = Self::new(true, true);

    /// Build a mode from its two capabilities.
    #[must_use]
    pub const fn new(may_fail: bool, may_branch: bool) -> Self {
        Self {
            may_fail,
            may_branch,
        }
    }

    /// The same mode with branching removed.
    #[must_use]
    pub const fn degraded(self) -> Self {
        Self::new(self.may_fail, false)
    }

    /// Whether a split of `ways` is allowed in this mode.
    #[must_use]
    pub const fn permits(self, ways: usize) -> bool {
        match ways {
            0 => self.may_fail,
            1 => true,
            _ => self.may_branch,
        }
    }
}

impl fmt::Display for FlowMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match (self.may_fail, self.may_branch) {
            (false, false) => "det",
            (true, false) => "semidet",
            (false, true) => "multi",
            (true, true) => "nondet",
        };
        f.write_str(name)
    }
}
