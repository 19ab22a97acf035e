//! Crate-wide error type and thread-local last-error slot.
//!
//! Callers need to branch on "bad argument" vs. "driver call failed" vs.
//! "timed out" rather than match on a single opaque failure, so this is a
//! `thiserror` enum instead of a bare `io::Error`.

use std::cell::RefCell;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error kinds.
#[derive(Debug, Error, Clone)]
pub enum Error {
    /// Bad arguments, overlapping MRs, malformed NIC address strings.
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    /// A stream/QP operation was attempted before `open_device`/`prepare`.
    #[error("not initialized: {0}")]
    NotInitialized(String),

    /// A driver call returned a nonzero status. `detail` carries whatever
    /// context the driver surfaced.
    #[error("driver call failed: {0}")]
    DlFail(String),

    /// `wait_qp_ready` or a notify wait exceeded its budget.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Generic transport error surfaced after local retry exhaustion, or
    /// after a peer was removed mid-flight.
    #[error("transport error: {0}")]
    Transport(String),

    /// Host or device allocation failed.
    #[error("allocation failed: {0}")]
    MallocFailed(String),
}

impl Error {
    /// Record this error in the calling thread's last-error slot and return
    /// it, for call sites that want to both propagate and let the caller
    /// later inspect `last_error()`.
    pub fn record(self) -> Self {
        LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(self.to_string()));
        self
    }
}

thread_local! {
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Read the calling thread's last recorded error message, if any.
pub fn last_error() -> Option<String> {
    LAST_ERROR.with(|slot| slot.borrow().clone())
}

/// Clear the calling thread's last-error message.
pub fn clear_last_error() {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = None);
}
