// MIT License
// Copyright 2023--present dpot developers

//! Status codes and thread-local error reporting for the C API.
//!
//! Every `extern "C"` function returns a [`dpot_status_t`]. On failure a
//! human-readable message is left in a thread-local slot that C callers read
//! back with [`dpot_last_error()`]; the pointer stays valid until the next
//! `dpot_*` call on the same thread. Bodies run inside [`catch_unwind`] so
//! that a Rust panic never unwinds across the FFI boundary.
//!
//! Potential callbacks run on rank threads, so they report failures through
//! the same slot: a callback calls [`dpot_set_last_error()`] before returning
//! a non-success status, and the rank that invoked it picks the message up
//! from its own thread.
//!
//! ```c
//! dpot_status_t s = dpot_call_potential_distributed(session, &input, &out);
//! if (s != DPOT_SUCCESS) {
//!     fprintf(stderr, "dpot error: %s\n", dpot_last_error());
//! }
//! ```

use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;

use crate::error::DpotError;

/// Status codes returned by all C API functions.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum dpot_status_t {
    /// Operation completed successfully.
    DPOT_SUCCESS = 0,
    /// An invalid parameter was passed (null pointer, wrong shape, etc.).
    DPOT_INVALID_PARAMETER = 1,
    /// An internal error occurred (e.g. a Rust panic was caught).
    DPOT_INTERNAL_ERROR = 2,
    /// The session is missing, closed, or was aborted.
    DPOT_NOT_INITIALIZED = 3,
    /// The rank pool could not be formed.
    DPOT_INITIALIZATION_ERROR = 4,
    /// A collective round saw mismatched participation or timed out; the
    /// session has been aborted.
    DPOT_PROTOCOL_ERROR = 5,
    /// The potential failed for a configuration.
    DPOT_EVALUATION_ERROR = 6,
    /// A buffer was too small for the requested operation.
    DPOT_BUFFER_SIZE_ERROR = 7,
}

impl From<&DpotError> for dpot_status_t {
    fn from(err: &DpotError) -> Self {
        match err {
            DpotError::NotInitialized => dpot_status_t::DPOT_NOT_INITIALIZED,
            DpotError::Initialization(_) | DpotError::Config(_) => {
                dpot_status_t::DPOT_INITIALIZATION_ERROR
            }
            DpotError::Protocol { .. } | DpotError::RoundTimeout { .. } => {
                dpot_status_t::DPOT_PROTOCOL_ERROR
            }
            DpotError::InvalidBatch(_) => dpot_status_t::DPOT_INVALID_PARAMETER,
        }
    }
}

thread_local! {
    static LAST_ERROR: RefCell<CString> = RefCell::new(CString::default());
}

/// Store an error message in the thread-local slot.
pub(crate) fn set_last_error(msg: &str) {
    LAST_ERROR.with(|cell| {
        let c = CString::new(msg).unwrap_or_else(|_| {
            CString::new(msg.replace('\0', "\u{FFFD}")).unwrap_or_default()
        });
        *cell.borrow_mut() = c;
    });
}

/// Take the current message out of the slot, leaving it empty.
pub(crate) fn take_last_error() -> Option<String> {
    LAST_ERROR.with(|cell| {
        let msg = std::mem::take(&mut *cell.borrow_mut());
        let msg = msg.to_string_lossy().into_owned();
        (!msg.is_empty()).then_some(msg)
    })
}

/// Record `err` for the C caller and return the matching status.
pub(crate) fn report(context: &str, err: &DpotError) -> dpot_status_t {
    set_last_error(&format!("{context}: {err}"));
    err.into()
}

/// Retrieve a pointer to the last error message for the current thread.
///
/// # Safety
/// The returned pointer must not be freed by the caller and is invalidated
/// by the next `dpot_*` call on the same thread.
#[no_mangle]
pub unsafe extern "C" fn dpot_last_error() -> *const c_char {
    LAST_ERROR.with(|cell| cell.borrow().as_ptr())
}

/// Store a message in the calling thread's error slot.
///
/// Intended for potential callbacks: set a message, then return a
/// non-success status. `NULL` clears the slot.
///
/// # Safety
/// `msg` must be NULL or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn dpot_set_last_error(msg: *const c_char) {
    if msg.is_null() {
        set_last_error("");
        return;
    }
    let text = unsafe { CStr::from_ptr(msg) }.to_string_lossy();
    set_last_error(&text);
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Execute a closure, catching any panics and converting them to status codes.
pub(crate) fn catch_unwind<F>(f: F) -> dpot_status_t
where
    F: FnOnce() -> dpot_status_t + std::panic::UnwindSafe,
{
    match std::panic::catch_unwind(f) {
        Ok(status) => status,
        Err(e) => {
            set_last_error(&panic_message(e.as_ref()));
            dpot_status_t::DPOT_INTERNAL_ERROR
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn last_error() -> String {
        let ptr = unsafe { dpot_last_error() };
        unsafe { CStr::from_ptr(ptr) }.to_str().unwrap().to_owned()
    }

    #[test]
    fn set_and_get_last_error() {
        set_last_error("test error");
        assert_eq!(last_error(), "test error");
    }

    #[test]
    fn interior_nul_is_replaced() {
        set_last_error("bad\0byte");
        assert_eq!(last_error(), "bad\u{FFFD}byte");
    }

    #[test]
    fn take_clears_slot() {
        set_last_error("once");
        assert_eq!(take_last_error().as_deref(), Some("once"));
        assert_eq!(take_last_error(), None);
    }

    #[test]
    fn c_setter_round_trips() {
        let msg = CString::new("from callback").unwrap();
        unsafe { dpot_set_last_error(msg.as_ptr()) };
        assert_eq!(last_error(), "from callback");
        unsafe { dpot_set_last_error(std::ptr::null()) };
        assert_eq!(last_error(), "");
    }

    #[test]
    fn catch_unwind_passes_status_through() {
        let status = catch_unwind(|| dpot_status_t::DPOT_SUCCESS);
        assert_eq!(status, dpot_status_t::DPOT_SUCCESS);
    }

    #[test]
    fn catch_unwind_converts_panic() {
        let status = catch_unwind(|| panic!("boom"));
        assert_eq!(status, dpot_status_t::DPOT_INTERNAL_ERROR);
        assert_eq!(last_error(), "boom");
    }

    #[test]
    fn errors_map_to_status_codes() {
        let cases = [
            (DpotError::NotInitialized, dpot_status_t::DPOT_NOT_INITIALIZED),
            (
                DpotError::Initialization("x".into()),
                dpot_status_t::DPOT_INITIALIZATION_ERROR,
            ),
            (
                DpotError::protocol(1, "x"),
                dpot_status_t::DPOT_PROTOCOL_ERROR,
            ),
            (
                DpotError::RoundTimeout {
                    round: 1,
                    elapsed: Duration::ZERO,
                },
                dpot_status_t::DPOT_PROTOCOL_ERROR,
            ),
            (
                DpotError::InvalidBatch("x".into()),
                dpot_status_t::DPOT_INVALID_PARAMETER,
            ),
        ];
        for (err, status) in &cases {
            assert_eq!(dpot_status_t::from(err), *status);
        }
    }

    #[test]
    fn report_prefixes_context() {
        let status = report("dpot_get_session_info", &DpotError::NotInitialized);
        assert_eq!(status, dpot_status_t::DPOT_NOT_INITIALIZED);
        assert_eq!(
            last_error(),
            "dpot_get_session_info: session is not initialized"
        );
    }
}
