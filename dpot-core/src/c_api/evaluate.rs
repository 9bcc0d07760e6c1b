// MIT License
// Copyright 2023--present dpot developers

//! C API for evaluation.
//!
//! - `dpot_call_potential`: one configuration, result in a
//!   `dpot_energy_out_t`. An evaluation failure is returned as
//!   `DPOT_EVALUATION_ERROR`.
//! - `dpot_call_potential_distributed` and `dpot_call_potential_vectorized`:
//!   a `[N, D]` batch, result in a `dpot_batch_out_t`. Per-item failures do
//!   not fail the call; they are flagged in `item_status` and counted in
//!   `n_failed`, and the first failure's message is left in the last-error
//!   slot.
//!
//! Any non-success status other than `DPOT_EVALUATION_ERROR` and
//! `DPOT_INVALID_PARAMETER` means the session is no longer usable. A NULL
//! session is `DPOT_NOT_INITIALIZED`.

use std::panic::AssertUnwindSafe;

use crate::batch::{Batch, Configuration, Evaluation, Outcome};
use crate::c_api::session::dpot_session_t;
use crate::status::{catch_unwind, dpot_status_t, report, set_last_error};
use crate::tensor::owned_tensor;
use crate::types::{dpot_batch_out_t, dpot_config_in_t, dpot_energy_out_t};

/// Evaluate a single configuration of `dim` coordinates.
///
/// On success `out->energies` is a `[1]` tensor and `out->gradients` a
/// `[1, dim]` tensor or NULL. Both belong to the caller.
///
/// # Safety
/// `coords` must point to `dim` doubles; `session` and `out` must be valid.
#[no_mangle]
pub unsafe extern "C" fn dpot_call_potential(
    session: *mut dpot_session_t,
    coords: *const f64,
    dim: usize,
    out: *mut dpot_energy_out_t,
) -> dpot_status_t {
    catch_unwind(AssertUnwindSafe(|| {
        const CTX: &str = "dpot_call_potential";
        if session.is_null() {
            set_last_error(&format!("{CTX}: session is NULL"));
            return dpot_status_t::DPOT_NOT_INITIALIZED;
        }
        if out.is_null() {
            set_last_error(&format!("{CTX}: out is NULL"));
            return dpot_status_t::DPOT_INVALID_PARAMETER;
        }
        if coords.is_null() && dim > 0 {
            set_last_error(&format!("{CTX}: coords is NULL"));
            return dpot_status_t::DPOT_INVALID_PARAMETER;
        }
        let values = if dim == 0 {
            &[][..]
        } else {
            unsafe { std::slice::from_raw_parts(coords, dim) }
        };
        let session = unsafe { &mut *session };
        let out = unsafe { &mut *out };

        match session.call_potential(&Configuration::from(values)) {
            Ok(Ok(e)) => {
                out.energies = owned_tensor(vec![e.energy], vec![1]);
                out.gradients = match e.gradient {
                    Some(g) => owned_tensor(g, vec![1, dim as i64]),
                    None => std::ptr::null_mut(),
                };
                dpot_status_t::DPOT_SUCCESS
            }
            Ok(Err(item)) => {
                set_last_error(&format!("{CTX}: {}", item.message));
                dpot_status_t::DPOT_EVALUATION_ERROR
            }
            Err(e) => report(CTX, &e),
        }
    }))
}

/// Evaluate every row of `input`, spreading rows across the ranks.
///
/// # Safety
/// `input` must hold a valid `[N, D]` coordinates tensor; `session` and
/// `out` must be valid.
#[no_mangle]
pub unsafe extern "C" fn dpot_call_potential_distributed(
    session: *mut dpot_session_t,
    input: *const dpot_config_in_t,
    out: *mut dpot_batch_out_t,
) -> dpot_status_t {
    catch_unwind(AssertUnwindSafe(|| {
        const CTX: &str = "dpot_call_potential_distributed";
        let (session, batch, out) = match unsafe { batch_call_args(CTX, session, input, out) } {
            Ok(args) => args,
            Err(status) => return status,
        };
        match session.call_potential_distributed(&batch) {
            Ok(rows) => {
                write_batch_out(CTX, out, batch.dim(), rows);
                dpot_status_t::DPOT_SUCCESS
            }
            Err(e) => report(CTX, &e),
        }
    }))
}

/// Evaluate `input` in contiguous groups of `group_size` rows, one
/// potential call per group, spreading groups across the ranks.
///
/// Output rows are per configuration. If a group fails, every row in it is
/// marked failed.
///
/// # Safety
/// As for `dpot_call_potential_distributed`.
#[no_mangle]
pub unsafe extern "C" fn dpot_call_potential_vectorized(
    session: *mut dpot_session_t,
    input: *const dpot_config_in_t,
    group_size: usize,
    out: *mut dpot_batch_out_t,
) -> dpot_status_t {
    catch_unwind(AssertUnwindSafe(|| {
        const CTX: &str = "dpot_call_potential_vectorized";
        let (session, batch, out) = match unsafe { batch_call_args(CTX, session, input, out) } {
            Ok(args) => args,
            Err(status) => return status,
        };
        let groups = match batch.chunks(group_size) {
            Ok(groups) => groups,
            Err(e) => return report(CTX, &e),
        };
        match session.call_potential_vectorized(&groups) {
            Ok(outcomes) => {
                let rows = groups
                    .iter()
                    .zip(outcomes)
                    .flat_map(|(group, outcome)| -> Vec<Outcome> {
                        match outcome {
                            Ok(evals) => evals.into_iter().map(Ok).collect(),
                            Err(e) => vec![Err(e); group.len()],
                        }
                    })
                    .collect();
                write_batch_out(CTX, out, batch.dim(), rows);
                dpot_status_t::DPOT_SUCCESS
            }
            Err(e) => report(CTX, &e),
        }
    }))
}

/// Null-check the arguments of a batch call and copy the input rows.
unsafe fn batch_call_args<'a>(
    context: &str,
    session: *mut dpot_session_t,
    input: *const dpot_config_in_t,
    out: *mut dpot_batch_out_t,
) -> Result<(&'a mut dpot_session_t, Batch, &'a mut dpot_batch_out_t), dpot_status_t> {
    let invalid = |what: &str| {
        set_last_error(&format!("{context}: {what}"));
        dpot_status_t::DPOT_INVALID_PARAMETER
    };
    if session.is_null() {
        set_last_error(&format!("{context}: session is NULL"));
        return Err(dpot_status_t::DPOT_NOT_INITIALIZED);
    }
    if input.is_null() {
        return Err(invalid("input is NULL"));
    }
    if out.is_null() {
        return Err(invalid("out is NULL"));
    }
    let inp = unsafe { &*input };
    let (n, dim) = unsafe { inp.dims() }.map_err(|msg| invalid(&msg))?;
    let values = unsafe { inp.values() }.map_err(|msg| invalid(&msg))?;
    let batch = Batch::from_flat(n, dim, values).map_err(|e| report(context, &e))?;
    Ok((unsafe { &mut *session }, batch, unsafe { &mut *out }))
}

/// Fill `out` from per-row outcomes. Failed rows get a NaN energy and
/// `DPOT_EVALUATION_ERROR` status.
fn write_batch_out(context: &str, out: &mut dpot_batch_out_t, dim: usize, rows: Vec<Outcome>) {
    let n = rows.len();
    let mut energies = Vec::with_capacity(n);
    let mut status = Vec::with_capacity(n);
    let mut gradients: Option<Vec<f64>> = None;
    let mut first_failure = None;

    for (i, row) in rows.into_iter().enumerate() {
        match row {
            Ok(Evaluation { energy, gradient }) => {
                energies.push(energy);
                status.push(dpot_status_t::DPOT_SUCCESS as i32);
                if let Some(g) = gradient {
                    let buf = gradients.get_or_insert_with(|| vec![f64::NAN; n * dim]);
                    buf[i * dim..(i + 1) * dim].copy_from_slice(&g);
                }
            }
            Err(e) => {
                energies.push(f64::NAN);
                status.push(dpot_status_t::DPOT_EVALUATION_ERROR as i32);
                first_failure.get_or_insert_with(|| format!("{context}: row {i}: {}", e.message));
            }
        }
    }

    let n_failed = status
        .iter()
        .filter(|&&s| s != dpot_status_t::DPOT_SUCCESS as i32)
        .count();
    if let Some(msg) = first_failure {
        set_last_error(&msg);
    }

    out.energies = owned_tensor(energies, vec![n as i64]);
    out.gradients = match gradients {
        Some(g) => owned_tensor(g, vec![n as i64, dim as i64]),
        None => std::ptr::null_mut(),
    };
    out.item_status = owned_tensor(status, vec![n as i64]);
    out.n_failed = n_failed;
}
