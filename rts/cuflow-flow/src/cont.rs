//! Captured continuations and choice points.

use crate::error::{fatal, Violation};
use crate::state::{
    current_mode, decide_capture, decide_split, exit_of, pop_frame, push_frame, signal_of,
    unwind, with_state, ContState, Decision, Exit, Frame, FrameKind, Signal,
};
use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

/// Outcome of [`call_with_cc`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Captured<R, T> {
    /// The trunk returned normally.
    Returned(R),
    /// The continuation was invoked with this argument.
    Resumed(T),
}

impl<R, T> Captured<R, T> {
    /// Whether the continuation was invoked.
    #[must_use]
    pub const fn is_resumed(&self) -> bool {
        matches!(self, Self::Resumed(_))
    }
}

/// A reified point in the call chain, resumable with a `T`.
///
/// Handles are tied to the thread that captured them.
pub struct Continuation<T> {
    frame: Rc<Frame>,
    _arg: PhantomData<fn(T)>,
}

impl<T> Clone for Continuation<T> {
    fn clone(&self) -> Self {
        Self {
            frame: Rc::clone(&self.frame),
            _arg: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Continuation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuation")
            .field("level", &self.frame.level)
            .field("state", &self.frame.state.get())
            .finish()
    }
}

impl<T: Clone + 'static> Continuation<T> {
    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ContState {
        self.frame.state.get()
    }

    /// Whether the continuation may still be invoked.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.state() != ContState::Invalid
    }

    /// Depth of the captured frame.
    #[must_use]
    pub fn level(&self) -> usize {
        self.frame.level
    }

    /// Jump to the captured point, making its [`call_with_cc`] return
    /// [`Captured::Resumed`] with a copy of `value`.
    ///
    /// Exit hooks of every frame left on the way run. If the captured frame
    /// is still on the call chain control unwinds to it directly; otherwise
    /// its root reruns and replays up to the capture point, running entry
    /// hooks on the way back in.
    ///
    /// # Panics
    ///
    /// Raises [`Violation::InvalidContinuation`] if the continuation was
    /// invalidated.
    pub fn call(&self, value: T) -> ! {
        let frame = &self.frame;
        match frame.state.get() {
            ContState::Invalid => fatal(Violation::InvalidContinuation { level: frame.level }),
            ContState::Live => {
                let on_chain = with_state(|s| {
                    s.ancestor_at(frame.level)
                        .is_some_and(|a| Rc::ptr_eq(&a, frame))
                });
                if !on_chain {
                    fatal(Violation::InvalidContinuation { level: frame.level });
                }
                self.record(&value);
                with_state(|s| s.in_flight = Some(Box::new(value)));
                unwind(Signal::Escape { frame: frame.id })
            }
            ContState::Saved => {
                let Some(root) = frame.root else {
                    fatal(Violation::InvalidContinuation { level: frame.level });
                };
                self.record(&value);
                let twin = with_state(|s| {
                    let mut cursor = s.chain.clone();
                    while let Some(f) = cursor {
                        let same_point = f.root == Some(root) && f.mark == frame.mark;
                        if f.kind == FrameKind::Capture && same_point {
                            return Some(f.id);
                        }
                        cursor = f.up.clone();
                    }
                    None
                });
                match twin {
                    Some(id) => {
                        with_state(|s| s.in_flight = Some(Box::new(value)));
                        unwind(Signal::Escape { frame: id })
                    }
                    None => {
                        tracing::debug!(root, level = frame.level, "replaying to saved frame");
                        unwind(Signal::Reenter { root })
                    }
                }
            }
        }
    }

    /// Make the root's log resume this capture point with `value`,
    /// abandoning every decision taken after it.
    fn record(&self, value: &T) {
        let (Some(root), Some(mark)) = (self.frame.root, self.frame.mark) else {
            return;
        };
        let recorded = with_state(|s| {
            let Some(r) = s.root_mut(root) else {
                return false;
            };
            if r.log.len() <= mark {
                return false;
            }
            r.log.truncate(mark + 1);
            r.log[mark] = Decision::Capture {
                resume: Some(Rc::new(value.clone()) as Rc<dyn Any>),
            };
            // execution continues right after the capture point
            r.cursor = mark + 1;
            r.invalidate_after(mark);
            true
        });
        if !recorded {
            fatal(Violation::InvalidContinuation {
                level: self.frame.level,
            });
        }
    }
}

/// Run `trunk` with a handle to the point just after this call.
///
/// Returns [`Captured::Returned`] with the trunk's value, or
/// [`Captured::Resumed`] with a copy of the argument if the handle was
/// invoked, whether from inside the trunk or, under a root, after this call
/// had already returned. Resuming twice leaves the second argument: the
/// later resume behaves as if the first had never happened.
pub fn call_with_cc<T, R>(trunk: impl FnOnce(Continuation<T>) -> R) -> Captured<R, T>
where
    T: Clone + 'static,
{
    let (mark, resumed) = decide_capture();
    if let Some(value) = resumed {
        return Captured::Resumed(downcast_arg::<T>(&*value).clone());
    }

    let frame = push_frame(FrameKind::Capture, mark);
    let handle = Continuation {
        frame: Rc::clone(&frame),
        _arg: PhantomData,
    };
    match panic::catch_unwind(AssertUnwindSafe(|| trunk(handle))) {
        Ok(value) => {
            pop_frame(&frame, Exit::Return);
            Captured::Returned(value)
        }
        Err(payload) if signal_of(&*payload) == Some(Signal::Escape { frame: frame.id }) => {
            pop_frame(&frame, Exit::Return);
            let arg = with_state(|s| s.in_flight.take())
                .unwrap_or_else(|| fatal(Violation::ArgumentType));
            Captured::Resumed(downcast_arg::<T>(&*arg).clone())
        }
        Err(payload) => {
            pop_frame(&frame, exit_of(&*payload));
            panic::resume_unwind(payload)
        }
    }
}

fn downcast_arg<T: 'static>(value: &dyn Any) -> &T {
    value
        .downcast_ref::<T>()
        .unwrap_or_else(|| fatal(Violation::ArgumentType))
}

/// Choose one of `ways` branches.
///
/// `split(1)` returns 0. `split(0)` fails: control goes back to the most
/// recent choice point with an alternative left, or the enclosing root
/// gives up. A split of more ways returns 0 now and, each time execution
/// backtracks into it, the next branch in increasing order.
///
/// # Replay
///
/// Backtracking reruns the enclosing root's trunk from the top and replays
/// the recorded decisions up to this split. Everything between the root and
/// the split therefore runs again for each branch, and must take the same
/// decisions each time; side effects there should be idempotent.
///
/// ```
/// use cuflow_flow::{solutions, split};
/// use std::cell::Cell;
///
/// let before = Cell::new(0);
/// let branches = solutions(|| {
///     before.set(before.get() + 1);
///     split(3)
/// });
/// assert_eq!(branches, vec![0, 1, 2]);
/// assert_eq!(before.get(), 3);
/// ```
///
/// # Panics
///
/// Raises [`Violation::ForbiddenSplit`] if the current mode does not permit
/// the split, [`Violation::NoRoot`] outside a root frame, and
/// [`Violation::ReplayDiverged`] if a rerun reaches this point with a
/// different arity or in place of a capture point.
pub fn split(ways: usize) -> usize {
    match ways {
        1 => 0,
        0 => fail(),
        _ => {
            let mode = current_mode();
            if !mode.permits(ways) {
                fatal(Violation::ForbiddenSplit { ways, mode });
            }
            let branch = decide_split(ways);
            tracing::trace!(ways, branch, "split");
            branch
        }
    }
}

/// A zero-way split.
pub fn fail() -> ! {
    let mode = current_mode();
    if !mode.may_fail {
        fatal(Violation::ForbiddenSplit { ways: 0, mode });
    }
    let root = with_state(|s| s.roots.last().map(|r| r.id))
        .unwrap_or_else(|| fatal(Violation::NoRoot { op: "fail" }));
    unwind(Signal::Fail { root })
}
