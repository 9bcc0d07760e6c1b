// MIT License
// Copyright 2023--present dpot developers

//! Constructors and destructors for the exchange structs.
//!
//! The struct definitions live in [`crate::types`]. `dpot_config_in_create`
//! wraps caller memory without copying; the `*_out_create` functions return
//! structs whose tensors are NULL until a call fills them.

use crate::tensor::{dpot_tensor_cpu_f64_2d, dpot_tensor_free};
use crate::types::{dpot_batch_out_t, dpot_config_in_t, dpot_energy_out_t};

/// Wrap a row-major `[n_configs, dim]` buffer as a batch.
///
/// Only the tensor metadata is allocated; release it with
/// `dpot_config_in_free`. The buffer itself stays owned by the caller.
///
/// # Safety
/// `coords` must point to at least `n_configs * dim` doubles that outlive
/// the returned struct.
#[no_mangle]
pub unsafe extern "C" fn dpot_config_in_create(
    n_configs: usize,
    dim: usize,
    coords: *mut f64,
) -> dpot_config_in_t {
    dpot_config_in_t {
        coordinates: unsafe { dpot_tensor_cpu_f64_2d(coords, n_configs as i64, dim as i64) },
    }
}

/// Free the metadata created by `dpot_config_in_create` and NULL the
/// field. NULL is a no-op.
///
/// # Safety
/// `input` must be NULL or point to a struct from `dpot_config_in_create`.
#[no_mangle]
pub unsafe extern "C" fn dpot_config_in_free(input: *mut dpot_config_in_t) {
    if input.is_null() {
        return;
    }
    let inp = unsafe { &mut *input };
    unsafe { dpot_tensor_free(inp.coordinates) };
    inp.coordinates = std::ptr::null_mut();
}

#[no_mangle]
pub extern "C" fn dpot_energy_out_create() -> dpot_energy_out_t {
    dpot_energy_out_t::empty()
}

/// Free any tensors held by `output` and reset it. NULL is a no-op.
///
/// # Safety
/// `output` must be NULL or point to a valid `dpot_energy_out_t`.
#[no_mangle]
pub unsafe extern "C" fn dpot_energy_out_free(output: *mut dpot_energy_out_t) {
    if output.is_null() {
        return;
    }
    let out = unsafe { &mut *output };
    unsafe {
        dpot_tensor_free(out.energies);
        dpot_tensor_free(out.gradients);
    }
    *out = dpot_energy_out_t::empty();
}

#[no_mangle]
pub extern "C" fn dpot_batch_out_create() -> dpot_batch_out_t {
    dpot_batch_out_t::empty()
}

/// Free any tensors held by `output` and reset it. NULL is a no-op.
///
/// # Safety
/// `output` must be NULL or point to a valid `dpot_batch_out_t`.
#[no_mangle]
pub unsafe extern "C" fn dpot_batch_out_free(output: *mut dpot_batch_out_t) {
    if output.is_null() {
        return;
    }
    let out = unsafe { &mut *output };
    unsafe {
        dpot_tensor_free(out.energies);
        dpot_tensor_free(out.gradients);
        dpot_tensor_free(out.item_status);
    }
    *out = dpot_batch_out_t::empty();
}
