//! Continuation engine for the cuflow runtime.
//!
//! This crate provides single-threaded, cooperative control flow:
//!
//! - **Choice points** - [`split`] branches a computation `n` ways and
//!   [`fail`] backtracks into the most recent alternative
//! - **Dynamic wind** - [`dynamic_wind`] brackets a computation with entry
//!   and exit hooks that run on every path in and out
//! - **Exceptions** - [`throw`] and [`catch`]
//! - **Captured continuations** - [`call_with_cc`] reifies the current point
//!   so it can be resumed later, even after the capturing call returned
//! - **Flow modes** - every computation declares whether it may fail and
//!   whether it may branch; breaking the declaration is fatal
//!
//! # Roots and replay
//!
//! A root frame ([`call_in_root`], [`explore`]) is the boundary within which
//! control may go back to an earlier point. The root records each split and
//! capture decision in a log. Going back reruns the root's trunk, replaying
//! the log up to the target point, so the machine stack is never copied.
//! Entry hooks of [`dynamic_wind`] frames run again on the way back in,
//! exactly once per re-entry, and exit hooks run once per exit.
//!
//! ```
//! use cuflow_flow::{explore, fail, split, FlowMode};
//!
//! let mut found = Vec::new();
//! explore(
//!     FlowMode::NONDET,
//!     || {
//!         let (a, b) = (split(4), split(4));
//!         if a + b != 3 {
//!             fail();
//!         }
//!         (a, b)
//!     },
//!     |pair| found.push(pair),
//! );
//! assert_eq!(found, vec![(0, 3), (1, 2), (2, 1), (3, 0)]);
//! ```
//!
//! # Continuation lifecycle
//!
//! ```text
//!   capture      leave frame          re-enter
//!      |             |                    |
//!      v             v                    v
//!  +------+     +-------+           +------+
//!  | Live | --> | Saved | --------> | Live |
//!  +------+     +-------+           +------+
//!      |             |
//!      | throw       | superseded / root returned
//!      v             v
//!   +---------------------+
//!   |       Invalid       |
//!   +---------------------+
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

mod cont;
mod error;
mod mode;
mod root;
mod state;
mod wind;

pub use cont::{call_with_cc, fail, split, Captured, Continuation};
pub use error::{Exception, Violation};
pub use mode::FlowMode;
pub use root::{call_in_root, explore, in_root, solutions};
pub use state::{
    clear_backtrace_hook, current_mode, live_branches, set_backtrace_hook, set_mode, snapshot,
    ContState, FlowSnapshot, SplitPoint,
};
pub use wind::{catch, dynamic_wind, throw};
