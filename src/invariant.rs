//! Fatal path for broken invariants.
//!
//! A broken invariant (unbalanced async-id stack, double start, two current
//! engine instances) leaves the process in a state nothing can recover from.
//! It is logged and turned into a panic; release builds set `panic = "abort"`
//! to terminate immediately.

use std::fmt::Display;

#[track_caller]
pub fn fatal_error(message: impl Display) -> ! {
    let location = std::panic::Location::caller();
    tracing::error!(%location, "FATAL ERROR: {}", message);
    panic!("FATAL ERROR: {message}");
}

/// `fatal_error` unless `condition` holds.
#[track_caller]
pub fn check(condition: bool, message: impl Display) {
    if !condition {
        fatal_error(message);
    }
}
