//! Dynamic-wind frames and exceptions.

use crate::error::{describe, fatal, Exception, Violation};
use crate::mode::FlowMode;
use crate::state::{
    exit_of, pop_frame, push_frame, set_mode, signal_of, unwind, with_state, ContState, Exit,
    FrameKind, Signal,
};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

/// Run `trunk` between an entry and an exit hook.
///
/// `on_exit` runs exactly once on every path out of `trunk`: normal return,
/// a thrown exception, a failed split, a continuation jumping out, or a
/// foreign panic. It never runs if `on_entry` did not complete. When the
/// surrounding root replays past this frame the whole sequence, entry hook
/// included, runs again.
///
/// # Panics
///
/// Raises [`Violation::ModeMismatch`] if `trunk` returns in a different mode
/// than `mode`.
pub fn dynamic_wind<R>(
    on_entry: impl FnOnce(),
    trunk: impl FnOnce() -> R,
    on_exit: impl FnOnce(),
    mode: FlowMode,
) -> R {
    let frame = push_frame(FrameKind::Wind, None);
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(on_entry)) {
        pop_frame(&frame, exit_of(&*payload));
        panic::resume_unwind(payload);
    }

    let caller_mode = set_mode(mode);
    match panic::catch_unwind(AssertUnwindSafe(trunk)) {
        Ok(value) => {
            let observed = set_mode(caller_mode);
            on_exit();
            pop_frame(&frame, Exit::Return);
            if observed != mode {
                fatal(Violation::ModeMismatch {
                    expected: mode,
                    observed,
                });
            }
            value
        }
        Err(payload) => {
            set_mode(caller_mode);
            on_exit();
            pop_frame(&frame, exit_of(&*payload));
            panic::resume_unwind(payload)
        }
    }
}

/// Run `trunk`, handing any exception it throws to `on_exception`.
///
/// Only payloads raised by [`throw`] are caught; failed splits, continuation
/// jumps and ordinary panics pass through untouched.
pub fn catch<R>(trunk: impl FnOnce() -> R, on_exception: impl FnOnce(Exception) -> R) -> R {
    let frame = push_frame(FrameKind::Catch, None);
    let caller_mode = crate::state::current_mode();
    match panic::catch_unwind(AssertUnwindSafe(trunk)) {
        Ok(value) => {
            pop_frame(&frame, Exit::Return);
            value
        }
        Err(payload) if signal_of(&*payload) == Some(Signal::Throw) => {
            pop_frame(&frame, Exit::Throw);
            set_mode(caller_mode);
            let raised = with_state(|s| s.in_flight.take())
                .unwrap_or_else(|| Box::new(()) as Box<dyn Any>);
            on_exception(Exception::new(raised))
        }
        Err(payload) => {
            pop_frame(&frame, exit_of(&*payload));
            panic::resume_unwind(payload)
        }
    }
}

/// Raise `payload` to the nearest enclosing [`catch`].
///
/// Every frame between here and the handler is invalidated. With no
/// handler on the chain the payload is reported, the backtrace hook (if
/// any) runs, and the process aborts.
pub fn throw<E: Any>(payload: E) -> ! {
    let handled = with_state(|s| {
        let mut cursor = s.chain.clone();
        while let Some(frame) = cursor {
            if frame.kind == FrameKind::Catch {
                return true;
            }
            frame.state.set(ContState::Invalid);
            cursor = frame.up.clone();
        }
        false
    });

    if !handled {
        uncaught(&payload);
    }
    with_state(|s| s.in_flight = Some(Box::new(payload)));
    unwind(Signal::Throw)
}

#[cold]
fn uncaught(payload: &dyn Any) -> ! {
    tracing::error!(payload = %describe(payload), "uncaught exception");
    eprintln!("cuflow: uncaught exception: {}", describe(payload));
    if let Some(hook) = with_state(|s| s.backtrace_hook.clone()) {
        hook();
    }
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cont::{fail, split};
    use crate::root::{call_in_root, solutions};
    use crate::state::current_mode;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn recorder() -> (Rc<RefCell<Vec<&'static str>>>, impl Fn(&'static str) -> Box<dyn Fn()>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&log);
        let push = move |what: &'static str| -> Box<dyn Fn()> {
            let sink = Rc::clone(&sink);
            Box::new(move || sink.borrow_mut().push(what))
        };
        (log, push)
    }

    #[test]
    fn test_wind_normal_path() {
        let (log, push) = recorder();
        let r = dynamic_wind(push("enter"), || 5, push("exit"), FlowMode::DET);
        assert_eq!(r, 5);
        assert_eq!(*log.borrow(), vec!["enter", "exit"]);
    }

    #[test]
    fn test_wind_exit_runs_on_throw() {
        let (log, push) = recorder();
        let caught = catch(
            || {
                dynamic_wind(push("enter"), || throw("boom"), push("exit"), FlowMode::DET);
                0
            },
            |e| {
                assert_eq!(e.downcast_ref::<&str>(), Some(&"boom"));
                1
            },
        );
        assert_eq!(caught, 1);
        assert_eq!(*log.borrow(), vec!["enter", "exit"]);
    }

    #[test]
    fn test_wind_exit_runs_on_fail() {
        let (log, push) = recorder();
        let r: Option<()> = call_in_root(FlowMode::SEMIDET, || {
            dynamic_wind(push("enter"), || fail(), push("exit"), FlowMode::SEMIDET)
        });
        assert_eq!(r, None);
        assert_eq!(*log.borrow(), vec!["enter", "exit"]);
    }

    #[test]
    fn test_wind_replays_entry_per_branch() {
        let (log, push) = recorder();
        let all = solutions(|| {
            dynamic_wind(push("enter"), || split(2), push("exit"), FlowMode::NONDET)
        });
        assert_eq!(all, vec![0, 1]);
        assert_eq!(*log.borrow(), vec!["enter", "exit", "enter", "exit"]);
    }

    #[test]
    fn test_wind_exit_skipped_when_entry_throws() {
        let (log, push) = recorder();
        catch(
            || dynamic_wind(|| throw(1_u8), || (), push("exit"), FlowMode::DET),
            |_| (),
        );
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_wind_sets_and_restores_mode() {
        let before = current_mode();
        let inside = dynamic_wind(|| (), current_mode, || (), FlowMode::SEMIDET);
        assert_eq!(inside, FlowMode::SEMIDET);
        assert_eq!(current_mode(), before);
    }

    #[test]
    #[should_panic(expected = "flow consistency violation")]
    fn test_wind_rejects_mode_change() {
        dynamic_wind(
            || (),
            || {
                set_mode(FlowMode::NONDET);
            },
            || (),
            FlowMode::DET,
        );
    }

    #[test]
    fn test_catch_without_throw() {
        let mut handled = false;
        let r = catch(|| 3, |_| {
            handled = true;
            4
        });
        assert_eq!(r, 3);
        assert!(!handled);
    }

    #[test]
    fn test_nearest_catch_wins() {
        let r = catch(
            || catch(|| throw(String::from("inner")), |e| e.downcast::<String>().unwrap()),
            |_| String::from("outer"),
        );
        assert_eq!(r, "inner");
    }

    #[test]
    fn test_catch_passes_failure_through() {
        let r: Option<u8> = call_in_root(FlowMode::SEMIDET, || catch(|| fail(), |_| 9));
        assert_eq!(r, None);
    }

    #[test]
    fn test_rethrow_from_handler() {
        let r = catch(
            || catch(|| throw(1_i32), |e| throw(e.downcast::<i32>().unwrap() + 1)),
            |e| e.downcast::<i32>().unwrap(),
        );
        assert_eq!(r, 2);
    }
}
