// MIT License
// Copyright 2023--present dpot developers

//! C-compatible data exchange types.
//!
//! ## Memory Model
//!
//! - **Input tensors** are *borrowed*: the caller keeps ownership.
//! - **Output tensors** are *callee-allocated*: whoever fills an output
//!   struct sets its tensor fields, and the receiver frees them with
//!   `dpot_tensor_free` (or the struct's `*_free` helper).
//!
//! ## DLPack Tensor Shapes
//!
//! | Struct | Field | dtype | shape |
//! |--------|-------|-------|-------|
//! | `dpot_config_in_t` | `coordinates` | f64 | `[n_configs, dim]` |
//! | `dpot_energy_out_t` | `energies` | f64 | `[n_configs]` |
//! | `dpot_energy_out_t` | `gradients` | f64 | `[n_configs, dim]` or NULL |
//! | `dpot_batch_out_t` | `energies` | f64 | `[n]` |
//! | `dpot_batch_out_t` | `gradients` | f64 | `[n, dim]` or NULL |
//! | `dpot_batch_out_t` | `item_status` | i32 | `[n]` |

use dlpk::sys::DLManagedTensorVersioned;

use crate::tensor::{f64_slice, validate_f64};

/// A block of configurations, used both for batches passed into the library
/// and for the input of a potential callback.
#[repr(C)]
pub struct dpot_config_in_t {
    /// Coordinates tensor: `[n_configs, dim]`, f64, CPU, row-major.
    pub coordinates: *mut DLManagedTensorVersioned,
}

/// Output of a potential callback (and of `dpot_call_potential`).
///
/// Both fields start as NULL. `energies` must be set on success;
/// `gradients` is optional.
#[repr(C)]
pub struct dpot_energy_out_t {
    /// Energies tensor `[n_configs]`, f64.
    pub energies: *mut DLManagedTensorVersioned,
    /// Gradients tensor `[n_configs, dim]`, f64, or NULL.
    pub gradients: *mut DLManagedTensorVersioned,
}

/// Ordered output of a distributed or vectorized round.
///
/// Rows whose `item_status` is non-zero failed inside the potential; their
/// energy is NaN. When no item produced a gradient, `gradients` is NULL;
/// otherwise rows without one are NaN-filled.
#[repr(C)]
pub struct dpot_batch_out_t {
    pub energies: *mut DLManagedTensorVersioned,
    pub gradients: *mut DLManagedTensorVersioned,
    /// Per-item status tensor `[n]`, i32: `DPOT_SUCCESS` or
    /// `DPOT_EVALUATION_ERROR`.
    pub item_status: *mut DLManagedTensorVersioned,
    /// Number of rows whose status is not `DPOT_SUCCESS`.
    pub n_failed: usize,
}

/// Snapshot returned by `dpot_get_session_info`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct dpot_session_info_t {
    pub rank_count: usize,
    pub this_rank: usize,
}

/// Result delivery policy for non-coordinator ranks.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum dpot_delivery_t {
    /// Every rank receives the full ordered result.
    DPOT_BROADCAST_ALL = 0,
    /// Only the coordinator receives results.
    DPOT_COORDINATOR_ONLY = 1,
}

impl dpot_config_in_t {
    /// Validate the coordinates tensor and return `(n_configs, dim)`.
    ///
    /// # Safety
    ///
    /// `coordinates` must be NULL or a valid DLPack tensor.
    pub unsafe fn dims(&self) -> Result<(usize, usize), String> {
        let shape = validate_f64(self.coordinates, "coordinates", &[None, None])?;
        Ok((shape[0] as usize, shape[1] as usize))
    }

    /// Flat row-major view of the coordinates.
    ///
    /// # Safety
    ///
    /// `coordinates` must be a valid DLPack tensor that outlives the slice.
    pub unsafe fn values(&self) -> Result<&[f64], String> {
        unsafe { self.dims() }?;
        Ok(unsafe { f64_slice(self.coordinates) })
    }
}

impl dpot_energy_out_t {
    pub(crate) fn empty() -> Self {
        Self {
            energies: std::ptr::null_mut(),
            gradients: std::ptr::null_mut(),
        }
    }
}

impl dpot_batch_out_t {
    pub(crate) fn empty() -> Self {
        Self {
            energies: std::ptr::null_mut(),
            gradients: std::ptr::null_mut(),
            item_status: std::ptr::null_mut(),
            n_failed: 0,
        }
    }
}
