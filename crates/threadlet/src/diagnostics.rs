//! Internal diagnostics for scheduler invariant violations.
//!
//! These indicate a defect in the scheduler rather than in user code, so they
//! are logged with a backtrace and dispatching carries on.

use std::backtrace::Backtrace;

/// Log an internal invariant violation with the current stack
pub(crate) fn internal(message: &str) {
    let stack = Backtrace::capture();
    tracing::error!(target: "threadlet::internal", %stack, "{}", message);
}
