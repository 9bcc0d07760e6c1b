// MIT License
// Copyright 2023--present dpot developers

//! C API for the session lifecycle.
//!
//! ```c
//! dpot_session_t *s = dpot_session_init(pot, 4, DPOT_BROADCAST_ALL, 0);
//! if (!s) { fprintf(stderr, "%s\n", dpot_last_error()); return 1; }
//!
//! dpot_session_info_t info;
//! dpot_get_session_info(s, &info);   // info.rank_count == 4, info.this_rank == 0
//!
//! /* ... dpot_call_potential_* ... */
//!
//! dpot_close_session(s);             // idempotent
//! dpot_session_free(s);
//! ```

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{DeliveryMode, SessionConfig};
use crate::error::Result;
use crate::logging;
use crate::potential::{dpot_potential_t, Potential};
use crate::session::Session;
use crate::status::{catch_unwind, dpot_status_t, panic_message, report, set_last_error};
use crate::types::{dpot_delivery_t, dpot_session_info_t};

/// Opaque session handle exposed to C.
pub type dpot_session_t = Session;

/// Take ownership of `pot` and start a session with the configuration
/// produced by `configure`. Returns NULL (with the reason in the last-error
/// slot) on failure; `pot` is consumed either way.
unsafe fn start(
    context: &str,
    pot: *mut dpot_potential_t,
    configure: impl FnOnce() -> Result<SessionConfig>,
) -> *mut dpot_session_t {
    logging::init();
    if pot.is_null() {
        set_last_error(&format!("{context}: pot is NULL"));
        return std::ptr::null_mut();
    }
    let potential: Arc<dyn Potential> = Arc::new(*unsafe { Box::from_raw(pot) });

    let started = panic::catch_unwind(AssertUnwindSafe(|| {
        let config = configure()?;
        Session::initialize(&config, potential)
    }));
    match started {
        Ok(Ok(session)) => Box::into_raw(Box::new(session)),
        Ok(Err(e)) => {
            report(context, &e);
            std::ptr::null_mut()
        }
        Err(panic) => {
            set_last_error(&format!("{context}: {}", panic_message(panic.as_ref())));
            std::ptr::null_mut()
        }
    }
}

/// Start a session that evaluates `pot` on `rank_count` ranks.
///
/// The `DPOT_*` environment is read first; explicit arguments then take
/// precedence. `rank_count == 0` keeps `DPOT_RANKS` (or the machine's
/// parallelism) and `round_timeout_ms == 0` keeps `DPOT_ROUND_TIMEOUT_MS`
/// (or no timeout).
///
/// Ownership of `pot` passes to the library, even on failure.
#[no_mangle]
pub unsafe extern "C" fn dpot_session_init(
    pot: *mut dpot_potential_t,
    rank_count: usize,
    delivery: dpot_delivery_t,
    round_timeout_ms: u64,
) -> *mut dpot_session_t {
    unsafe {
        start("dpot_session_init", pot, || {
            let mut config = SessionConfig::from_env()?.with_delivery(DeliveryMode::from(delivery));
            if rank_count > 0 {
                config = config.with_ranks(rank_count);
            }
            if round_timeout_ms > 0 {
                config = config.with_round_timeout(Duration::from_millis(round_timeout_ms));
            }
            Ok(config)
        })
    }
}

/// Start a session configured entirely from `DPOT_*` environment variables.
#[no_mangle]
pub unsafe extern "C" fn dpot_session_init_from_env(
    pot: *mut dpot_potential_t,
) -> *mut dpot_session_t {
    unsafe { start("dpot_session_init_from_env", pot, SessionConfig::from_env) }
}

/// Report the rank count and this handle's rank (always 0).
///
/// Returns `DPOT_NOT_INITIALIZED` for a NULL session and once the session
/// is closed or aborted.
#[no_mangle]
pub unsafe extern "C" fn dpot_get_session_info(
    session: *const dpot_session_t,
    info: *mut dpot_session_info_t,
) -> dpot_status_t {
    catch_unwind(AssertUnwindSafe(|| {
        if session.is_null() {
            set_last_error("dpot_get_session_info: session is NULL");
            return dpot_status_t::DPOT_NOT_INITIALIZED;
        }
        if info.is_null() {
            set_last_error("dpot_get_session_info: info is NULL");
            return dpot_status_t::DPOT_INVALID_PARAMETER;
        }
        match unsafe { &*session }.info() {
            Ok(i) => {
                unsafe {
                    *info = dpot_session_info_t {
                        rank_count: i.rank_count,
                        this_rank: i.this_rank,
                    }
                };
                dpot_status_t::DPOT_SUCCESS
            }
            Err(e) => report("dpot_get_session_info", &e),
        }
    }))
}

/// Stop every rank. Safe to call repeatedly; NULL is a no-op. The handle
/// itself stays allocated until `dpot_session_free`.
#[no_mangle]
pub unsafe extern "C" fn dpot_close_session(session: *mut dpot_session_t) {
    if session.is_null() {
        return;
    }
    let _ = catch_unwind(AssertUnwindSafe(|| {
        unsafe { &mut *session }.teardown();
        dpot_status_t::DPOT_SUCCESS
    }));
}

/// Close (if needed) and free a session. NULL is a no-op.
#[no_mangle]
pub unsafe extern "C" fn dpot_session_free(session: *mut dpot_session_t) {
    if session.is_null() {
        return;
    }
    let _ = catch_unwind(AssertUnwindSafe(|| {
        drop(unsafe { Box::from_raw(session) });
        dpot_status_t::DPOT_SUCCESS
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::c_api::fixtures::harmonic;
    use crate::c_api::potential::dpot_potential_new;
    use crate::status::dpot_last_error;
    use std::os::raw::c_void;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn new_pot() -> *mut dpot_potential_t {
        unsafe { dpot_potential_new(harmonic, std::ptr::null_mut(), None) }
    }

    fn last_error() -> String {
        unsafe { std::ffi::CStr::from_ptr(dpot_last_error()) }
            .to_string_lossy()
            .into_owned()
    }

    fn info_of(s: *const dpot_session_t) -> (dpot_status_t, dpot_session_info_t) {
        let mut info = dpot_session_info_t {
            rank_count: 0,
            this_rank: usize::MAX,
        };
        let status = unsafe { dpot_get_session_info(s, &mut info) };
        (status, info)
    }

    #[test]
    fn init_info_close_free() {
        let s = unsafe { dpot_session_init(new_pot(), 3, dpot_delivery_t::DPOT_BROADCAST_ALL, 0) };
        assert!(!s.is_null());

        let (status, info) = info_of(s);
        assert_eq!(status, dpot_status_t::DPOT_SUCCESS);
        assert_eq!(
            info,
            dpot_session_info_t {
                rank_count: 3,
                this_rank: 0
            }
        );

        unsafe { dpot_close_session(s) };
        let (status, _) = info_of(s);
        assert_eq!(status, dpot_status_t::DPOT_NOT_INITIALIZED);

        unsafe {
            dpot_close_session(s);
            dpot_session_free(s);
        }
    }

    #[test]
    fn init_with_null_potential_fails() {
        let s = unsafe {
            dpot_session_init(std::ptr::null_mut(), 2, dpot_delivery_t::DPOT_BROADCAST_ALL, 0)
        };
        assert!(s.is_null());
        assert!(last_error().contains("pot is NULL"));
    }

    /// `user_data` is an `AtomicBool` raised when the library releases it.
    unsafe extern "C" fn raise_flag(ptr: *mut c_void) {
        unsafe { &*(ptr as *const AtomicBool) }.store(true, Ordering::SeqCst);
    }

    fn tracked_pot(freed: &AtomicBool) -> *mut dpot_potential_t {
        unsafe {
            dpot_potential_new(harmonic, freed as *const AtomicBool as *mut c_void, Some(raise_flag))
        }
    }

    #[test]
    fn failed_init_still_consumes_potential() {
        let freed = AtomicBool::new(false);
        let s = unsafe {
            dpot_session_init(
                tracked_pot(&freed),
                usize::MAX,
                dpot_delivery_t::DPOT_COORDINATOR_ONLY,
                0,
            )
        };
        assert!(s.is_null());
        assert!(last_error().starts_with("dpot_session_init"));
        assert!(freed.load(Ordering::SeqCst));
    }

    #[test]
    fn session_free_closes_running_session() {
        let freed = AtomicBool::new(false);
        let s = unsafe {
            dpot_session_init(tracked_pot(&freed), 2, dpot_delivery_t::DPOT_BROADCAST_ALL, 0)
        };
        assert!(!s.is_null());
        assert!(!freed.load(Ordering::SeqCst));
        unsafe { dpot_session_free(s) };
        assert!(freed.load(Ordering::SeqCst));
    }

    #[test]
    fn close_and_free_accept_null() {
        unsafe {
            dpot_close_session(std::ptr::null_mut());
            dpot_session_free(std::ptr::null_mut());
        }
    }

    #[test]
    fn info_rejects_null_arguments() {
        let (status, _) = info_of(std::ptr::null());
        assert_eq!(status, dpot_status_t::DPOT_NOT_INITIALIZED);
        assert!(last_error().contains("session is NULL"));

        let s = unsafe { dpot_session_init(new_pot(), 1, dpot_delivery_t::DPOT_BROADCAST_ALL, 0) };
        let status = unsafe { dpot_get_session_info(s, std::ptr::null_mut()) };
        assert_eq!(status, dpot_status_t::DPOT_INVALID_PARAMETER);
        unsafe { dpot_session_free(s) };
    }
}
