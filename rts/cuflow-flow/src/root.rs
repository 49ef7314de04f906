//! Root frames: the boundary of replay.
//!
//! A root runs its trunk, and whenever control must go back to a point the
//! trunk already passed (a failed split, or a saved continuation being
//! re-entered) it reruns the trunk from the top, replaying the decisions
//! recorded in its log until execution reaches that point again.

use crate::error::{fatal, Violation};
use crate::mode::FlowMode;
use crate::state::{current_mode, push_root, signal_of, with_state, Signal};
use std::panic::{self, AssertUnwindSafe};

/// What a driver does after a solution was delivered.
enum Next {
    Stop,
    More,
}

/// Run `trunk` under a root until `deliver` stops it or the root's choice
/// points are exhausted.
fn drive<R>(mode: FlowMode, mut trunk: impl FnMut() -> R, mut deliver: impl FnMut(R) -> Next) {
    let root = push_root(mode);
    let mut runs = 0_usize;
    loop {
        root.rewind();
        runs += 1;
        match panic::catch_unwind(AssertUnwindSafe(&mut trunk)) {
            Ok(value) => {
                check_mode(mode);
                if matches!(deliver(value), Next::Stop) || !root.backtrack() {
                    break;
                }
            }
            Err(payload) => match signal_of(&*payload) {
                Some(Signal::Fail { root: id }) if id == root.id => {
                    if !root.backtrack() {
                        break;
                    }
                }
                Some(Signal::Reenter { root: id }) if id == root.id => {
                    tracing::debug!(root = root.id, runs, "re-entering saved continuation");
                }
                _ => {
                    drop(root);
                    panic::resume_unwind(payload);
                }
            },
        }
    }
    tracing::trace!(root = root.id, runs, "root exhausted");
}

fn check_mode(expected: FlowMode) {
    let observed = current_mode();
    if observed != expected {
        fatal(Violation::ModeMismatch { expected, observed });
    }
}

/// Run `trunk` in a fresh root frame.
///
/// No continuation created inside `trunk` can be re-entered once this call
/// returns. The trunk runs under `mode` with branching removed; the caller's
/// mode is restored on return. Returns `None` if the trunk failed with no
/// alternative left.
///
/// # Replay
///
/// Re-entering a saved continuation captured inside `trunk` reruns `trunk`
/// from the top, replaying recorded decisions up to the capture point. The
/// trunk must be deterministic up to each capture point it may be resumed
/// at, and side effects before that point run once per re-entry.
///
/// # Panics
///
/// Raises [`Violation::ModeMismatch`] if `trunk` returns in a different mode
/// than it was given.
pub fn call_in_root<R>(mode: FlowMode, trunk: impl FnMut() -> R) -> Option<R> {
    let mut result = None;
    drive(mode.degraded(), trunk, |value| {
        result = Some(value);
        Next::Stop
    });
    result
}

/// Enumerate every solution of a nondeterministic `trunk`.
///
/// Each normal return of the trunk is handed to `on_solution`, after which
/// the root backtracks into the most recent split with an alternative left.
/// Returns the number of solutions delivered.
///
/// # Replay
///
/// Each backtrack reruns `trunk` from the top. It must take the same
/// decisions on every rerun up to the split being resumed; a change of
/// arity there raises [`Violation::ReplayDiverged`]. Side effects before a
/// split run once per branch explored through it.
pub fn explore<R>(
    mode: FlowMode,
    trunk: impl FnMut() -> R,
    mut on_solution: impl FnMut(R),
) -> usize {
    let mut count = 0;
    drive(mode, trunk, |value| {
        count += 1;
        on_solution(value);
        Next::More
    });
    count
}

/// Collect every solution of `trunk`, run in [`FlowMode::NONDET`].
///
/// `trunk` reruns once per branch; see [`explore`] for what that requires.
///
/// ```
/// use cuflow_flow::{solutions, split};
///
/// let pairs = solutions(|| (split(2), split(2)));
/// assert_eq!(pairs, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);
/// ```
pub fn solutions<R>(trunk: impl FnMut() -> R) -> Vec<R> {
    let mut out = Vec::new();
    explore(FlowMode::NONDET, trunk, |value| out.push(value));
    out
}

/// Whether the calling thread is inside a root frame.
#[must_use]
pub fn in_root() -> bool {
    with_state(|s| !s.roots.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cont::{fail, split};
    use crate::state::{live_branches, set_mode};

    #[test]
    fn test_call_in_root_returns_value() {
        assert_eq!(call_in_root(FlowMode::DET, || 7), Some(7));
        assert!(!in_root());
    }

    #[test]
    fn test_call_in_root_failure_is_none() {
        let r: Option<u32> = call_in_root(FlowMode::SEMIDET, || fail());
        assert_eq!(r, None);
    }

    #[test]
    fn test_call_in_root_degrades_mode() {
        let seen = call_in_root(FlowMode::NONDET, current_mode);
        assert_eq!(seen, Some(FlowMode::SEMIDET));
    }

    #[test]
    fn test_call_in_root_restores_caller_mode() {
        let before = current_mode();
        call_in_root(FlowMode::SEMIDET, || ());
        assert_eq!(current_mode(), before);
    }

    #[test]
    #[should_panic(expected = "flow consistency violation")]
    fn test_call_in_root_rejects_mode_change() {
        call_in_root(FlowMode::DET, || {
            set_mode(FlowMode::NONDET);
        });
    }

    #[test]
    fn test_explore_counts_solutions() {
        let mut seen = Vec::new();
        let n = explore(FlowMode::NONDET, || split(3), |v| seen.push(v));
        assert_eq!(n, 3);
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn test_explore_skips_failed_branches() {
        let odd = solutions(|| {
            let v = split(6);
            if v % 2 == 0 {
                fail();
            }
            v
        });
        assert_eq!(odd, vec![1, 3, 5]);
    }

    #[test]
    fn test_nested_split_order() {
        let all = solutions(|| split(2) * 10 + split(3));
        assert_eq!(all, vec![0, 1, 2, 10, 11, 12]);
    }

    #[test]
    fn test_inner_root_is_isolated() {
        let all = solutions(|| {
            let outer = split(2);
            call_in_root(FlowMode::SEMIDET, || {
                if outer == 0 {
                    fail()
                }
                outer
            })
        });
        assert_eq!(all, vec![None, Some(1)]);
    }

    #[test]
    fn test_live_branches_during_exploration() {
        let counts = solutions(|| {
            split(3);
            live_branches()
        });
        assert_eq!(counts, vec![1, 1, 0]);
        assert_eq!(live_branches(), 0);
    }
}
