// MIT License
// Copyright 2023--present dpot developers

//! Potential functions and how a rank applies them to work items.
//!
//! A potential is anything implementing [`Potential`]: a pure map from a
//! configuration to an [`Evaluation`]. Rust callers implement the trait or
//! wrap a closure in [`PotentialFn`]; C callers register a callback that is
//! held by a [`CallbackPotential`].
//!
//! **C callback contract**
//!
//! 1. The callback receives `user_data`, a `[n, dim]` coordinates tensor,
//!    and an output struct whose tensors are NULL.
//! 2. On success it sets `output->energies` to a `[n]` tensor and optionally
//!    `output->gradients` to a `[n, dim]` tensor, both created with the
//!    `dpot_tensor_owned_*` helpers (or any DLPack tensor with a deleter).
//! 3. On failure it calls `dpot_set_last_error` and returns a non-success
//!    status.
//!
//! Single mode invokes the callback with `n = 1`; vectorized mode invokes it
//! once per group. Ranks call it concurrently from different threads, so the
//! callback and `user_data` must be thread-safe.

use std::os::raw::c_void;
use std::panic::{self, AssertUnwindSafe};

use tracing::warn;

use crate::batch::{
    Batch, EvaluationError, EvaluationResult, Evaluation, Output, Payload, WorkItem,
};
use crate::status::{dpot_status_t, panic_message, take_last_error};
use crate::tensor::{borrowed_tensor, dpot_tensor_free, f64_slice, validate_f64};
use crate::types::{dpot_config_in_t, dpot_energy_out_t};

pub trait Potential: Send + Sync {
    /// Energy (and optionally gradient) for one configuration.
    fn evaluate(&self, configuration: &[f64]) -> Result<Evaluation, String>;

    /// Evaluate a whole group in one call.
    ///
    /// The default loops over [`evaluate`](Potential::evaluate); override it
    /// when the underlying code is faster on blocks.
    fn evaluate_group(&self, group: &Batch) -> Result<Vec<Evaluation>, String> {
        group.iter().map(|c| self.evaluate(c)).collect()
    }
}

/// A [`Potential`] backed by a closure.
pub struct PotentialFn<F>(pub F);

impl<F> PotentialFn<F>
where
    F: Fn(&[f64]) -> Result<Evaluation, String> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> Potential for PotentialFn<F>
where
    F: Fn(&[f64]) -> Result<Evaluation, String> + Send + Sync,
{
    fn evaluate(&self, configuration: &[f64]) -> Result<Evaluation, String> {
        (self.0)(configuration)
    }
}

/// Apply `potential` to one work item. Never panics: failures and panics
/// inside the potential become an [`EvaluationError`] for the item.
pub(crate) fn evaluate_item(potential: &dyn Potential, item: WorkItem) -> EvaluationResult {
    let WorkItem {
        original_index,
        payload,
    } = item;
    let caught = panic::catch_unwind(AssertUnwindSafe(|| match &payload {
        Payload::Single(c) => {
            let e = potential.evaluate(c)?;
            check_gradient(&e, c.dim())?;
            Ok(Output::Single(e))
        }
        Payload::Group(group) => {
            let evals = potential.evaluate_group(group)?;
            if evals.len() != group.len() {
                return Err(format!(
                    "group of {} configurations produced {} evaluations",
                    group.len(),
                    evals.len()
                ));
            }
            for e in &evals {
                check_gradient(e, group.dim())?;
            }
            Ok(Output::Group(evals))
        }
    }));
    let outcome = match caught {
        Ok(result) => result,
        Err(panic) => Err(format!("potential panicked: {}", panic_message(panic.as_ref()))),
    }
    .map_err(|message| {
        warn!(original_index, %message, "potential evaluation failed");
        EvaluationError {
            original_index,
            message,
        }
    });
    EvaluationResult {
        original_index,
        outcome,
    }
}

fn check_gradient(e: &Evaluation, dim: usize) -> Result<(), String> {
    match &e.gradient {
        Some(g) if g.len() != dim => Err(format!(
            "gradient has {} components, expected {dim}",
            g.len()
        )),
        _ => Ok(()),
    }
}

/// Function pointer type for a C potential.
///
/// Returns `DPOT_SUCCESS` on success, or an error status code.
pub type PotentialCallback = unsafe extern "C" fn(
    user_data: *mut c_void,
    input: *const dpot_config_in_t,
    output: *mut dpot_energy_out_t,
) -> dpot_status_t;

/// Destructor for the user_data pointer.
pub type FreeFn = unsafe extern "C" fn(*mut c_void);

/// A C callback together with its opaque state and optional destructor.
///
/// If a `free_fn` is given it is called on drop when `user_data` is
/// non-null, transferring ownership of `user_data` to the handle.
pub struct CallbackPotential {
    pub(crate) callback: PotentialCallback,
    pub(crate) user_data: *mut c_void,
    pub(crate) free_fn: Option<FreeFn>,
}

// The handle is shared by every rank of a session; registering a callback
// asserts that it may be invoked concurrently.
unsafe impl Send for CallbackPotential {}
unsafe impl Sync for CallbackPotential {}

impl CallbackPotential {
    pub fn new(callback: PotentialCallback, user_data: *mut c_void, free_fn: Option<FreeFn>) -> Self {
        Self {
            callback,
            user_data,
            free_fn,
        }
    }

    /// Invoke the callback on a raw input/output pair.
    ///
    /// # Safety
    /// `input` and `output` must point to valid structures.
    pub unsafe fn calculate(
        &self,
        input: *const dpot_config_in_t,
        output: *mut dpot_energy_out_t,
    ) -> dpot_status_t {
        unsafe { (self.callback)(self.user_data, input, output) }
    }

    /// Run the callback on a row-major `[n, dim]` block and copy the results.
    fn call_block(&self, coords: &[f64], n: usize, dim: usize) -> Result<Vec<Evaluation>, String> {
        // The callback only reads its input, so lending the shared buffer
        // through a `*mut` is sound.
        let input = dpot_config_in_t {
            coordinates: unsafe {
                borrowed_tensor(coords.as_ptr() as *mut f64, vec![n as i64, dim as i64])
            },
        };
        let mut output = dpot_energy_out_t::empty();

        let _ = take_last_error();
        let status = unsafe { self.calculate(&input, &mut output) };
        let result = if status == dpot_status_t::DPOT_SUCCESS {
            unsafe { read_block(&output, n, dim) }
        } else {
            Err(match take_last_error() {
                Some(msg) => format!("{status:?}: {msg}"),
                None => format!("potential callback returned {status:?}"),
            })
        };

        unsafe {
            dpot_tensor_free(input.coordinates);
            dpot_tensor_free(output.energies);
            dpot_tensor_free(output.gradients);
        }
        result
    }
}

/// Copy energies and gradients out of a filled callback output.
unsafe fn read_block(
    output: &dpot_energy_out_t,
    n: usize,
    dim: usize,
) -> Result<Vec<Evaluation>, String> {
    validate_f64(output.energies, "energies", &[Some(n as i64)])?;
    let energies = unsafe { f64_slice(output.energies) };
    let gradients = if output.gradients.is_null() {
        None
    } else {
        validate_f64(output.gradients, "gradients", &[Some(n as i64), Some(dim as i64)])?;
        Some(unsafe { f64_slice(output.gradients) })
    };
    Ok(energies
        .iter()
        .enumerate()
        .map(|(i, &energy)| Evaluation {
            energy,
            gradient: gradients.map(|g| g[i * dim..(i + 1) * dim].to_vec()),
        })
        .collect())
}

impl Potential for CallbackPotential {
    fn evaluate(&self, configuration: &[f64]) -> Result<Evaluation, String> {
        let mut evals = self.call_block(configuration, 1, configuration.len())?;
        evals
            .pop()
            .ok_or_else(|| "potential callback returned no energy".to_string())
    }

    fn evaluate_group(&self, group: &Batch) -> Result<Vec<Evaluation>, String> {
        if group.is_empty() {
            return Ok(Vec::new());
        }
        let flat: Vec<f64> = group.iter().flat_map(|c| c.iter().copied()).collect();
        self.call_block(&flat, group.len(), group.dim())
    }
}

impl Drop for CallbackPotential {
    fn drop(&mut self) {
        if let Some(free) = self.free_fn {
            if !self.user_data.is_null() {
                unsafe { free(self.user_data) };
            }
        }
    }
}

/// Opaque handle exposed to C as `dpot_potential_t`.
pub type dpot_potential_t = CallbackPotential;
