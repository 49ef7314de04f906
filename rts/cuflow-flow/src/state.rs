//! Thread-local flow state: the frame chain, live root frames and their
//! decision logs, and the unwinding signals that carry non-local exits.

use crate::error::{fatal, Violation};
use crate::mode::FlowMode;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::panic;
use std::rc::{Rc, Weak};

pub(crate) type FrameId = u64;
pub(crate) type RootId = u64;

/// What kind of frame a continuation record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameKind {
    /// A root frame: the replay boundary.
    Root,
    /// A dynamic-wind frame.
    Wind,
    /// A frame with an exception hook.
    Catch,
    /// A capturable continuation point.
    Capture,
}

/// Lifecycle of a continuation.
///
/// ```text
/// Live ──(frame left, root can replay)──> Saved ──(re-entered)──> Live
///   │                                       │
///   └──────(throw / superseded / root gone)─┴──> Invalid
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContState {
    /// The frame is on the current call chain.
    Live,
    /// The frame has been left but its root can still replay it.
    Saved,
    /// Terminal; invoking it is a violation.
    Invalid,
}

/// A continuation record.
#[derive(Debug)]
pub(crate) struct Frame {
    pub(crate) id: FrameId,
    pub(crate) kind: FrameKind,
    /// Depth of the `up` chain.
    pub(crate) level: usize,
    pub(crate) up: Option<Rc<Frame>>,
    pub(crate) state: Cell<ContState>,
    /// Innermost root live when the frame was created.
    pub(crate) root: Option<RootId>,
    /// Position of this frame's decision in the root's log.
    pub(crate) mark: Option<usize>,
}

/// A recorded decision in a root's log.
#[derive(Clone)]
pub(crate) enum Decision {
    Split { taken: usize, arity: usize },
    Capture { resume: Option<Rc<dyn Any>> },
}

/// A live root frame: the replay driver for everything beneath it.
pub(crate) struct RootFrame {
    pub(crate) id: RootId,
    pub(crate) frame: Rc<Frame>,
    pub(crate) mode: FlowMode,
    pub(crate) log: Vec<Decision>,
    pub(crate) cursor: usize,
    captured: Vec<Weak<Frame>>,
}

impl RootFrame {
    /// Pick the next alternative of the deepest split with one left.
    ///
    /// Exhausted splits are dropped from the log; continuations captured
    /// after the resumed split are superseded.
    pub(crate) fn backtrack(&mut self) -> bool {
        while let Some(decision) = self.log.pop() {
            if let Decision::Split { taken, arity } = decision {
                if taken + 1 < arity {
                    let position = self.log.len();
                    self.log.push(Decision::Split {
                        taken: taken + 1,
                        arity,
                    });
                    self.invalidate_after(position);
                    tracing::trace!(root = self.id, position, branch = taken + 1, "backtrack");
                    return true;
                }
            }
        }
        false
    }

    /// Invalidate every captured record whose decision comes after `position`.
    pub(crate) fn invalidate_after(&mut self, position: usize) {
        self.captured.retain(|weak| match weak.upgrade() {
            Some(frame) if frame.mark.is_some_and(|m| m > position) => {
                frame.state.set(ContState::Invalid);
                false
            }
            Some(frame) => frame.state.get() != ContState::Invalid,
            None => false,
        });
    }

    fn invalidate_all(&mut self) {
        for frame in self.captured.drain(..).filter_map(|w| w.upgrade()) {
            frame.state.set(ContState::Invalid);
        }
        self.frame.state.set(ContState::Invalid);
    }

    fn live_branches(&self) -> usize {
        self.log
            .iter()
            .filter(|d| matches!(d, Decision::Split { taken, arity } if taken + 1 < *arity))
            .count()
    }
}

/// Per-thread flow state.
pub(crate) struct FlowState {
    /// Innermost live frame.
    pub(crate) chain: Option<Rc<Frame>>,
    pub(crate) roots: Vec<RootFrame>,
    pub(crate) mode: FlowMode,
    /// Exception payload or continuation argument in transit.
    pub(crate) in_flight: Option<Box<dyn Any>>,
    pub(crate) backtrace_hook: Option<Rc<dyn Fn()>>,
    next_id: u64,
}

impl FlowState {
    fn new() -> Self {
        Self {
            chain: None,
            roots: Vec::new(),
            mode: FlowMode::DET,
            in_flight: None,
            backtrace_hook: None,
            next_id: 0,
        }
    }

    fn fresh_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub(crate) fn root_mut(&mut self, id: RootId) -> Option<&mut RootFrame> {
        self.roots.iter_mut().rev().find(|r| r.id == id)
    }

    /// Walk up from the innermost frame to the first frame at or above
    /// `level`, the way a common ancestor is located.
    pub(crate) fn ancestor_at(&self, level: usize) -> Option<Rc<Frame>> {
        let mut cursor = self.chain.clone();
        while let Some(frame) = cursor {
            if frame.level <= level {
                return Some(frame);
            }
            cursor = frame.up.clone();
        }
        None
    }
}

thread_local! {
    static FLOW: RefCell<FlowState> = RefCell::new(FlowState::new());
}

/// Run `f` with the thread's flow state borrowed.
///
/// `f` must not call back into user code.
pub(crate) fn with_state<R>(f: impl FnOnce(&mut FlowState) -> R) -> R {
    FLOW.with(|state| f(&mut state.borrow_mut()))
}

// ============================================================================
// Frames
// ============================================================================

/// Push a new frame onto the chain.
pub(crate) fn push_frame(kind: FrameKind, mark: Option<usize>) -> Rc<Frame> {
    with_state(|s| {
        let id = s.fresh_id();
        let up = s.chain.clone();
        let frame = Rc::new(Frame {
            id,
            kind,
            level: up.as_ref().map_or(0, |f| f.level + 1),
            up,
            state: Cell::new(ContState::Live),
            root: s.roots.last().map(|r| r.id),
            mark,
        });
        if kind == FrameKind::Capture && mark.is_some() {
            if let Some(root) = s.roots.last_mut() {
                root.captured.push(Rc::downgrade(&frame));
            }
        }
        s.chain = Some(Rc::clone(&frame));
        frame
    })
}

/// How control left a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Exit {
    /// Normal return, or an unwind the root may replay.
    Return,
    /// An exception passed through.
    Throw,
}

/// Pop `frame` off the chain.
pub(crate) fn pop_frame(frame: &Rc<Frame>, exit: Exit) {
    with_state(|s| {
        s.chain = frame.up.clone();
    });
    if frame.state.get() == ContState::Live {
        let replayable = exit == Exit::Return && frame.mark.is_some();
        frame.state.set(if replayable {
            ContState::Saved
        } else {
            ContState::Invalid
        });
    }
}

// ============================================================================
// Roots
// ============================================================================

/// Open a root frame under `mode`.
pub(crate) fn push_root(mode: FlowMode) -> RootGuard {
    let frame = push_frame(FrameKind::Root, None);
    let (id, caller_mode) = with_state(|s| {
        let id = s.fresh_id();
        s.roots.push(RootFrame {
            id,
            frame: Rc::clone(&frame),
            mode,
            log: Vec::new(),
            cursor: 0,
            captured: Vec::new(),
        });
        (id, std::mem::replace(&mut s.mode, mode))
    });
    RootGuard {
        id,
        frame,
        caller_mode,
    }
}

/// Closes a root frame on every exit path: pops it, invalidates everything
/// captured under it and restores the caller's mode.
pub(crate) struct RootGuard {
    pub(crate) id: RootId,
    frame: Rc<Frame>,
    caller_mode: FlowMode,
}

impl RootGuard {
    /// Reset the thread state for another run of the root's trunk.
    pub(crate) fn rewind(&self) {
        with_state(|s| {
            s.chain = Some(Rc::clone(&self.frame));
            if let Some(root) = s.root_mut(self.id) {
                root.cursor = 0;
                s.mode = root.mode;
            }
        });
    }

    pub(crate) fn backtrack(&self) -> bool {
        with_state(|s| s.root_mut(self.id).is_some_and(RootFrame::backtrack))
    }
}

impl Drop for RootGuard {
    fn drop(&mut self) {
        with_state(|s| {
            if let Some(pos) = s.roots.iter().rposition(|r| r.id == self.id) {
                let mut root = s.roots.remove(pos);
                root.invalidate_all();
            }
            s.chain = self.frame.up.clone();
            s.mode = self.caller_mode;
        });
    }
}

// ============================================================================
// Signals
// ============================================================================

/// Non-local exits, carried as unwinding payloads.
///
/// Values travelling with a signal stay in [`FlowState::in_flight`] so the
/// signal itself is `Send`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signal {
    /// Zero-way split: backtrack in the given root.
    Fail { root: RootId },
    /// Rerun the given root, replaying its log.
    Reenter { root: RootId },
    /// Return to a live capture frame.
    Escape { frame: FrameId },
    /// Deliver the in-flight exception to the nearest catch frame.
    Throw,
}

pub(crate) fn unwind(signal: Signal) -> ! {
    panic::resume_unwind(Box::new(signal))
}

pub(crate) fn signal_of(payload: &(dyn Any + Send)) -> Option<Signal> {
    payload.downcast_ref::<Signal>().copied()
}

pub(crate) fn exit_of(payload: &(dyn Any + Send)) -> Exit {
    match signal_of(payload) {
        Some(Signal::Throw) => Exit::Throw,
        _ => Exit::Return,
    }
}

// ============================================================================
// Decisions
// ============================================================================

/// Record or replay a split of `ways` in the innermost root.
pub(crate) fn decide_split(ways: usize) -> usize {
    let outcome = with_state(|s| {
        let root = s.roots.last_mut().ok_or(Violation::NoRoot { op: "split" })?;
        let position = root.cursor;
        root.cursor += 1;
        match root.log.get(position) {
            Some(Decision::Split { taken, arity }) if *arity == ways => Ok(*taken),
            Some(Decision::Split { .. }) => Err(Violation::ReplayDiverged {
                position,
                detail: "split arity changed",
            }),
            Some(Decision::Capture { .. }) => Err(Violation::ReplayDiverged {
                position,
                detail: "expected a capture point, found a split",
            }),
            None => {
                debug_assert_eq!(position, root.log.len(), "replay cursor past the log");
                root.log.push(Decision::Split {
                    taken: 0,
                    arity: ways,
                });
                Ok(0)
            }
        }
    });
    outcome.unwrap_or_else(|v| fatal(v))
}

/// Record or replay a capture point in the innermost root, if any.
///
/// Returns the decision's position and the value it was resumed with.
pub(crate) fn decide_capture() -> (Option<usize>, Option<Rc<dyn Any>>) {
    let outcome = with_state(|s| {
        let Some(root) = s.roots.last_mut() else {
            return Ok((None, None));
        };
        let position = root.cursor;
        root.cursor += 1;
        match root.log.get(position) {
            Some(Decision::Capture { resume }) => Ok((Some(position), resume.clone())),
            Some(Decision::Split { .. }) => Err(Violation::ReplayDiverged {
                position,
                detail: "expected a split, found a capture point",
            }),
            None => {
                debug_assert_eq!(position, root.log.len(), "replay cursor past the log");
                root.log.push(Decision::Capture { resume: None });
                Ok((Some(position), None))
            }
        }
    });
    outcome.unwrap_or_else(|v| fatal(v))
}

// ============================================================================
// Introspection
// ============================================================================

/// A choice point with alternatives outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitPoint {
    /// Branch currently being explored.
    pub taken: usize,
    /// Number of ways.
    pub arity: usize,
}

/// A view of the calling thread's flow state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowSnapshot {
    /// Current mode.
    pub mode: FlowMode,
    /// Depth of the innermost live frame, if any.
    pub depth: Option<usize>,
    /// Number of live root frames.
    pub roots: usize,
    /// Choice points with alternatives outstanding.
    pub live_branches: usize,
    /// The innermost such choice point.
    pub innermost_split: Option<SplitPoint>,
}

/// Capture the calling thread's flow state.
#[must_use]
pub fn snapshot() -> FlowSnapshot {
    with_state(|s| FlowSnapshot {
        mode: s.mode,
        depth: s.chain.as_ref().map(|f| f.level),
        roots: s.roots.len(),
        live_branches: s.roots.iter().map(RootFrame::live_branches).sum(),
        innermost_split: s.roots.iter().rev().find_map(|r| {
            r.log.iter().rev().find_map(|d| match d {
                Decision::Split { taken, arity } if taken + 1 < *arity => Some(SplitPoint {
                    taken: *taken,
                    arity: *arity,
                }),
                _ => None,
            })
        }),
    })
}

/// The calling thread's current mode.
#[must_use]
pub fn current_mode() -> FlowMode {
    with_state(|s| s.mode)
}

/// Replace the current mode, returning the previous one.
///
/// A trunk that changes its mode must restore it before returning.
pub fn set_mode(mode: FlowMode) -> FlowMode {
    with_state(|s| std::mem::replace(&mut s.mode, mode))
}

/// Number of choice points with alternatives outstanding on this thread.
#[must_use]
pub fn live_branches() -> usize {
    snapshot().live_branches
}

/// Install a hook run before aborting on an uncaught exception.
pub fn set_backtrace_hook(hook: impl Fn() + 'static) {
    with_state(|s| s.backtrace_hook = Some(Rc::new(hook)));
}

/// Remove the backtrace hook.
pub fn clear_backtrace_hook() {
    with_state(|s| s.backtrace_hook = None);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root_with(log: Vec<Decision>) -> RootFrame {
        RootFrame {
            id: 1,
            frame: push_frame(FrameKind::Root, None),
            mode: FlowMode::NONDET,
            log,
            cursor: 0,
            captured: Vec::new(),
        }
    }

    #[test]
    fn test_backtrack_drops_exhausted_splits() {
        let mut root = root_with(vec![
            Decision::Split { taken: 0, arity: 2 },
            Decision::Capture { resume: None },
            Decision::Split { taken: 2, arity: 3 },
        ]);
        assert!(root.backtrack());
        assert_eq!(root.log.len(), 1);
        assert!(matches!(root.log[0], Decision::Split { taken: 1, arity: 2 }));
        assert!(!root.backtrack());
        assert!(root.log.is_empty());
    }

    #[test]
    fn test_backtrack_supersedes_later_captures() {
        let mut root = root_with(vec![Decision::Split { taken: 0, arity: 2 }]);
        let early = Rc::new(Frame {
            id: 10,
            kind: FrameKind::Capture,
            level: 1,
            up: None,
            state: Cell::new(ContState::Saved),
            root: Some(1),
            mark: Some(0),
        });
        let late = Rc::new(Frame {
            id: 11,
            kind: FrameKind::Capture,
            level: 2,
            up: Some(Rc::clone(&early)),
            state: Cell::new(ContState::Saved),
            root: Some(1),
            mark: Some(1),
        });
        root.captured.push(Rc::downgrade(&early));
        root.captured.push(Rc::downgrade(&late));
        root.log.push(Decision::Capture { resume: None });

        assert!(root.backtrack());
        assert_eq!(late.state.get(), ContState::Invalid);
        assert_eq!(early.state.get(), ContState::Saved);
    }

    #[test]
    fn test_live_branches_counts_open_splits() {
        let root = root_with(vec![
            Decision::Split { taken: 0, arity: 2 },
            Decision::Split { taken: 1, arity: 2 },
            Decision::Split { taken: 0, arity: 4 },
        ]);
        assert_eq!(root.live_branches(), 2);
    }

    #[test]
    fn test_push_pop_levels() {
        let outer = push_frame(FrameKind::Wind, None);
        let inner = push_frame(FrameKind::Catch, None);
        assert_eq!(inner.level, outer.level + 1);
        assert_eq!(snapshot().depth, Some(inner.level));
        pop_frame(&inner, Exit::Return);
        assert_eq!(inner.state.get(), ContState::Invalid);
        pop_frame(&outer, Exit::Return);
    }

    #[test]
    fn test_set_mode_returns_previous() {
        let before = set_mode(FlowMode::NONDET);
        assert_eq!(current_mode(), FlowMode::NONDET);
        set_mode(before);
        assert_eq!(current_mode(), before);
    }
}
