// MIT License
// Copyright 2023--present dpot developers

//! C API for the potential handle: create, call directly, free.
//!
//! ```c
//! dpot_potential_t *pot = dpot_potential_new(my_callback, my_model, my_model_free);
//!
//! // Optional: call the callback once, outside any session.
//! dpot_config_in_t in = dpot_config_in_create(n, dim, coords);
//! dpot_energy_out_t out = dpot_energy_out_create();
//! if (dpot_potential_calculate(pot, &in, &out) == DPOT_SUCCESS) { ... }
//! dpot_energy_out_free(&out);
//! dpot_config_in_free(&in);
//!
//! // Hand the handle to a session, which takes ownership...
//! dpot_session_t *s = dpot_session_init(pot, 4, DPOT_BROADCAST_ALL, 0);
//! // ...or release it yourself if it was never handed over.
//! // dpot_potential_free(pot);
//! ```

use std::os::raw::c_void;

use crate::potential::{dpot_potential_t, CallbackPotential, FreeFn, PotentialCallback};
use crate::status::{catch_unwind, dpot_status_t, set_last_error};
use crate::types::{dpot_config_in_t, dpot_energy_out_t};

/// Create a potential handle from a callback.
///
/// - `callback`: evaluates a `[n, dim]` block of configurations.
/// - `user_data`: forwarded to every invocation. Ranks call the callback
///   from several threads at once.
/// - `free_fn`: optional destructor for `user_data`, run when the handle
///   (or the session that took it) is freed.
///
/// The returned pointer must be passed to exactly one of
/// `dpot_session_init`, `dpot_session_init_from_env` or
/// `dpot_potential_free`.
#[no_mangle]
pub unsafe extern "C" fn dpot_potential_new(
    callback: PotentialCallback,
    user_data: *mut c_void,
    free_fn: Option<FreeFn>,
) -> *mut dpot_potential_t {
    Box::into_raw(Box::new(CallbackPotential::new(callback, user_data, free_fn)))
}

/// Invoke the callback once on the calling thread.
///
/// On success `output->energies` (and possibly `output->gradients`) hold
/// callee-allocated tensors that the caller frees.
#[no_mangle]
pub unsafe extern "C" fn dpot_potential_calculate(
    pot: *const dpot_potential_t,
    input: *const dpot_config_in_t,
    output: *mut dpot_energy_out_t,
) -> dpot_status_t {
    catch_unwind(std::panic::AssertUnwindSafe(|| {
        if pot.is_null() {
            set_last_error("dpot_potential_calculate: pot is NULL");
            return dpot_status_t::DPOT_INVALID_PARAMETER;
        }
        if input.is_null() {
            set_last_error("dpot_potential_calculate: input is NULL");
            return dpot_status_t::DPOT_INVALID_PARAMETER;
        }
        if output.is_null() {
            set_last_error("dpot_potential_calculate: output is NULL");
            return dpot_status_t::DPOT_INVALID_PARAMETER;
        }
        if let Err(msg) = unsafe { (*input).dims() } {
            set_last_error(&format!("dpot_potential_calculate: {msg}"));
            return dpot_status_t::DPOT_INVALID_PARAMETER;
        }
        unsafe { (*pot).calculate(input, output) }
    }))
}

/// Free a handle that was not handed to a session. NULL is a no-op.
#[no_mangle]
pub unsafe extern "C" fn dpot_potential_free(pot: *mut dpot_potential_t) {
    if !pot.is_null() {
        drop(unsafe { Box::from_raw(pot) });
    }
}
