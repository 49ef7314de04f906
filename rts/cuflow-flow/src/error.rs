//! Flow consistency violations and user exceptions.

use crate::mode::FlowMode;
use std::any::Any;
use std::fmt;
use thiserror::Error;

/// A broken flow-control contract.
///
/// Violations are programming errors. They are never delivered to
/// [`catch`](crate::catch) handlers; raising one panics with the message
/// below after logging it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
    /// An invalidated continuation was invoked.
    #[error("invoked an invalidated continuation (level {level})")]
    InvalidContinuation {
        /// Depth of the continuation's frame.
        level: usize,
    },
    /// A trunk returned in a different mode than it was entered with.
    #[error("trunk returned in mode {observed}, entered in mode {expected}")]
    ModeMismatch {
        /// Mode the trunk was entered with.
        expected: FlowMode,
        /// Mode observed on return.
        observed: FlowMode,
    },
    /// A split was requested that the current mode forbids.
    #[error("{ways}-way split is not permitted in mode {mode}")]
    ForbiddenSplit {
        /// Requested number of ways.
        ways: usize,
        /// Mode in effect.
        mode: FlowMode,
    },
    /// A rerun of a root took a different path than the recorded one.
    #[error("replay diverged at decision {position}: {detail}")]
    ReplayDiverged {
        /// Index of the decision in the root's log.
        position: usize,
        /// What differed.
        detail: &'static str,
    },
    /// An operation needing a root frame ran outside of one.
    #[error("{op} requires an enclosing root frame")]
    NoRoot {
        /// The operation.
        op: &'static str,
    },
    /// A continuation was resumed with a value of the wrong type.
    #[error("continuation resumed with a value of an unexpected type")]
    ArgumentType,
}

/// Log and raise a violation.
#[cold]
#[track_caller]
pub(crate) fn fatal(violation: Violation) -> ! {
    tracing::error!(%violation, "flow consistency violation");
    panic!("flow consistency violation: {violation}")
}

/// A payload raised by [`throw`](crate::throw).
pub struct Exception(Box<dyn Any>);

impl Exception {
    pub(crate) fn new(payload: Box<dyn Any>) -> Self {
        Self(payload)
    }

    /// Whether the payload is a `T`.
    #[must_use]
    pub fn is<T: Any>(&self) -> bool {
        self.0.is::<T>()
    }

    /// Borrow the payload as a `T`.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }

    /// Take the payload as a `T`, or get the exception back.
    pub fn downcast<T: Any>(self) -> Result<T, Self> {
        self.0.downcast().map(|b| *b).map_err(Self)
    }

    /// The raw payload.
    #[must_use]
    pub fn into_inner(self) -> Box<dyn Any> {
        self.0
    }
}

impl fmt::Debug for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Exception").field(&describe(&*self.0)).finish()
    }
}

/// Best-effort text for a payload.
pub(crate) fn describe(payload: &dyn Any) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<opaque payload>".to_string()
    }
}
