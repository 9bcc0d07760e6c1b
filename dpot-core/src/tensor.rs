// MIT License
// Copyright 2023--present dpot developers

//! DLPack tensor helpers for the C boundary.
//!
//! Batches enter and results leave the library as `DLManagedTensorVersioned`
//! pointers so that scripting hosts (NumPy, PyTorch, JAX) can hand over and
//! take back arrays without copying. Two kinds of tensors are produced:
//!
//! - **Borrowed**: wraps caller memory. The deleter frees only the metadata.
//! - **Owned**: wraps a `Vec<T>` moved into the manager context. The deleter
//!   frees data and metadata together.
//!
//! Only CPU, row-major, `f64`/`i32` tensors are accepted on input.

use std::os::raw::c_void;

use dlpk::sys::{
    DLDataType, DLDataTypeCode, DLDevice, DLDeviceType, DLManagedTensorVersioned, DLPackVersion,
    DLTensor, DLPACK_FLAG_BITMASK_IS_COPIED,
};

fn row_major_strides(shape: &[i64]) -> Vec<i64> {
    let mut strides = vec![1i64; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

fn cpu_device() -> DLDevice {
    DLDevice {
        device_type: DLDeviceType::kDLCPU,
        device_id: 0,
    }
}

/// Element types that can back a tensor created by this crate.
pub(crate) trait Element: Copy + 'static {
    fn dtype() -> DLDataType;
}

impl Element for f64 {
    fn dtype() -> DLDataType {
        DLDataType {
            code: DLDataTypeCode::kDLFloat,
            bits: 64,
            lanes: 1,
        }
    }
}

impl Element for i32 {
    fn dtype() -> DLDataType {
        DLDataType {
            code: DLDataTypeCode::kDLInt,
            bits: 32,
            lanes: 1,
        }
    }
}

/// Manager context: owns shape/strides and, for owned tensors, the data.
struct TensorContext<T> {
    _data: Option<Vec<T>>,
    shape: Vec<i64>,
    strides: Vec<i64>,
}

unsafe extern "C" fn context_deleter<T>(ptr: *mut DLManagedTensorVersioned) {
    if ptr.is_null() {
        return;
    }
    let ctx = unsafe { (*ptr).manager_ctx.cast::<TensorContext<T>>() };
    if !ctx.is_null() {
        drop(unsafe { Box::from_raw(ctx) });
    }
    drop(unsafe { Box::from_raw(ptr) });
}

fn assemble<T: Element>(
    data: *mut c_void,
    owned: Option<Vec<T>>,
    shape: Vec<i64>,
) -> *mut DLManagedTensorVersioned {
    let flags = if owned.is_some() {
        DLPACK_FLAG_BITMASK_IS_COPIED
    } else {
        0
    };
    let strides = row_major_strides(&shape);
    let mut ctx = Box::new(TensorContext {
        _data: owned,
        shape,
        strides,
    });

    let dl_tensor = DLTensor {
        data,
        device: cpu_device(),
        ndim: ctx.shape.len() as i32,
        dtype: T::dtype(),
        shape: ctx.shape.as_mut_ptr(),
        strides: ctx.strides.as_mut_ptr(),
        byte_offset: 0,
    };

    Box::into_raw(Box::new(DLManagedTensorVersioned {
        version: DLPackVersion { major: 1, minor: 0 },
        manager_ctx: Box::into_raw(ctx).cast(),
        deleter: Some(context_deleter::<T>),
        flags,
        dl_tensor,
    }))
}

/// Wrap caller memory without taking ownership.
///
/// # Safety
/// `data` must stay valid, and hold `shape.product()` elements, for the
/// lifetime of the returned tensor.
pub(crate) unsafe fn borrowed_tensor<T: Element>(
    data: *mut T,
    shape: Vec<i64>,
) -> *mut DLManagedTensorVersioned {
    assemble::<T>(data.cast(), None, shape)
}

/// Move `data` into a new tensor. Freed by the tensor's deleter.
pub(crate) fn owned_tensor<T: Element>(
    mut data: Vec<T>,
    shape: Vec<i64>,
) -> *mut DLManagedTensorVersioned {
    debug_assert_eq!(data.len() as i64, shape.iter().product::<i64>());
    let ptr = data.as_mut_ptr();
    assemble::<T>(ptr.cast(), Some(data), shape)
}

/// Check that `tensor` is a CPU `f64` tensor whose shape matches `expected`
/// (`None` entries match any extent). Returns the actual shape.
pub(crate) fn validate_f64(
    tensor: *const DLManagedTensorVersioned,
    name: &str,
    expected: &[Option<i64>],
) -> Result<Vec<i64>, String> {
    if tensor.is_null() {
        return Err(format!("{name} tensor is NULL"));
    }
    let t = unsafe { &(*tensor).dl_tensor };
    if t.device.device_type != DLDeviceType::kDLCPU {
        return Err(format!("{name}: only CPU tensors are supported"));
    }
    if t.dtype != f64::dtype() {
        return Err(format!("{name}: expected f64, got {:?}", t.dtype));
    }
    if t.ndim as usize != expected.len() {
        return Err(format!(
            "{name}: expected ndim={}, got {}",
            expected.len(),
            t.ndim
        ));
    }
    let shape = if t.ndim == 0 {
        Vec::new()
    } else {
        unsafe { std::slice::from_raw_parts(t.shape, t.ndim as usize) }.to_vec()
    };
    for (axis, (&got, want)) in shape.iter().zip(expected.iter().copied()).enumerate() {
        if got < 0 || want.is_some_and(|w| w != got) {
            return Err(format!(
                "{name}: shape[{axis}] is {got}, expected {}",
                want.map_or_else(|| "non-negative".to_string(), |w| w.to_string())
            ));
        }
    }
    if !t.strides.is_null() {
        let strides = unsafe { std::slice::from_raw_parts(t.strides, t.ndim as usize) };
        let compact = row_major_strides(&shape);
        let mismatched = shape
            .iter()
            .zip(strides.iter().zip(&compact))
            .any(|(&extent, (s, c))| extent > 1 && s != c);
        if mismatched {
            return Err(format!("{name}: only row-major contiguous tensors are supported"));
        }
    }
    Ok(shape)
}

/// View the elements of a validated `f64` tensor.
///
/// # Safety
/// `tensor` must have passed [`validate_f64`] and remain alive for `'a`.
pub(crate) unsafe fn f64_slice<'a>(tensor: *const DLManagedTensorVersioned) -> &'a [f64] {
    let t = unsafe { &(*tensor).dl_tensor };
    let len: i64 = if t.ndim == 0 {
        1
    } else {
        unsafe { std::slice::from_raw_parts(t.shape, t.ndim as usize) }
            .iter()
            .product()
    };
    if len == 0 {
        return &[];
    }
    let base = unsafe { (t.data as *const u8).add(t.byte_offset as usize) } as *const f64;
    unsafe { std::slice::from_raw_parts(base, len as usize) }
}

// ---------------------------------------------------------------------------
// C-exported tensor functions
// ---------------------------------------------------------------------------

/// Create a non-owning 2-D f64 tensor on CPU wrapping an existing buffer.
///
/// This is the usual way to hand a `[n_configs, dim]` batch to
/// `dpot_config_in_create`. Call `dpot_tensor_free` when done; the buffer
/// itself is not freed.
///
/// # Safety
/// `data` must point to at least `rows * cols` contiguous `f64` values.
#[no_mangle]
pub unsafe extern "C" fn dpot_tensor_cpu_f64_2d(
    data: *mut f64,
    rows: i64,
    cols: i64,
) -> *mut DLManagedTensorVersioned {
    unsafe { borrowed_tensor(data, vec![rows, cols]) }
}

/// Create a non-owning 1-D f64 tensor on CPU.
///
/// # Safety
/// `data` must point to at least `len` contiguous `f64` values.
#[no_mangle]
pub unsafe extern "C" fn dpot_tensor_cpu_f64_1d(
    data: *mut f64,
    len: i64,
) -> *mut DLManagedTensorVersioned {
    unsafe { borrowed_tensor(data, vec![len]) }
}

/// Create an **owning** 2-D f64 tensor on CPU by copying data.
///
/// Potential callbacks use this to return `energies`/`gradients` whose
/// lifetime the library then manages.
///
/// # Safety
/// `data` must point to at least `rows * cols` contiguous `f64` values.
#[no_mangle]
pub unsafe extern "C" fn dpot_tensor_owned_cpu_f64_2d(
    data: *const f64,
    rows: i64,
    cols: i64,
) -> *mut DLManagedTensorVersioned {
    let len = (rows.max(0) * cols.max(0)) as usize;
    let copy = if len == 0 {
        Vec::new()
    } else {
        unsafe { std::slice::from_raw_parts(data, len) }.to_vec()
    };
    owned_tensor(copy, vec![rows.max(0), cols.max(0)])
}

/// Create an **owning** 1-D f64 tensor on CPU by copying data.
///
/// # Safety
/// `data` must point to at least `len` contiguous `f64` values.
#[no_mangle]
pub unsafe extern "C" fn dpot_tensor_owned_cpu_f64_1d(
    data: *const f64,
    len: i64,
) -> *mut DLManagedTensorVersioned {
    let n = len.max(0) as usize;
    let copy = if n == 0 {
        Vec::new()
    } else {
        unsafe { std::slice::from_raw_parts(data, n) }.to_vec()
    };
    owned_tensor(copy, vec![n as i64])
}

/// Free a DLPack tensor by invoking its deleter. `NULL` is a no-op.
///
/// # Safety
/// `tensor` must be NULL or a valid `DLManagedTensorVersioned` that has not
/// been freed yet.
#[no_mangle]
pub unsafe extern "C" fn dpot_tensor_free(tensor: *mut DLManagedTensorVersioned) {
    if tensor.is_null() {
        return;
    }
    if let Some(deleter) = unsafe { (*tensor).deleter } {
        unsafe { deleter(tensor) };
    }
}

/// Raw data pointer of a DLPack tensor.
///
/// # Safety
/// `tensor` must be a valid, non-null `DLManagedTensorVersioned*`.
#[no_mangle]
pub unsafe extern "C" fn dpot_tensor_data(
    tensor: *const DLManagedTensorVersioned,
) -> *const c_void {
    unsafe { (*tensor).dl_tensor.data as *const c_void }
}

/// Shape array of a DLPack tensor; the number of dimensions is written to
/// `*ndim_out`.
///
/// # Safety
/// Both `tensor` and `ndim_out` must be valid, non-null pointers.
#[no_mangle]
pub unsafe extern "C" fn dpot_tensor_shape(
    tensor: *const DLManagedTensorVersioned,
    ndim_out: *mut i32,
) -> *const i64 {
    let t = unsafe { &(*tensor).dl_tensor };
    unsafe { *ndim_out = t.ndim };
    t.shape as *const i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn borrowed_2d_points_at_caller_memory() {
        let mut data = [1.0_f64, 2.0, 3.0, 4.0, 5.0, 6.0];
        let tensor = unsafe { dpot_tensor_cpu_f64_2d(data.as_mut_ptr(), 3, 2) };
        let t = unsafe { &(*tensor).dl_tensor };
        assert_eq!(t.dtype, f64::dtype());
        assert_eq!(t.device, cpu_device());
        let strides = unsafe { std::slice::from_raw_parts(t.strides, 2) };
        assert_eq!(strides, &[2, 1]);
        assert_eq!(t.data as *const f64, data.as_ptr());
        assert_eq!(unsafe { (*tensor).flags } & DLPACK_FLAG_BITMASK_IS_COPIED, 0);
        unsafe { dpot_tensor_free(tensor) };
        assert_eq!(data[5], 6.0);
    }

    #[test]
    fn owned_tensor_outlives_source() {
        let tensor = owned_tensor(vec![7_i32, 8, 9], vec![3]);
        let t = unsafe { &(*tensor).dl_tensor };
        assert_eq!(t.dtype, i32::dtype());
        let values = unsafe { std::slice::from_raw_parts(t.data as *const i32, 3) };
        assert_eq!(values, &[7, 8, 9]);
        assert_ne!(unsafe { (*tensor).flags } & DLPACK_FLAG_BITMASK_IS_COPIED, 0);
        unsafe { dpot_tensor_free(tensor) };
    }

    #[test]
    fn owned_copy_does_not_alias() {
        let source = [1.5_f64, 2.5];
        let tensor = unsafe { dpot_tensor_owned_cpu_f64_1d(source.as_ptr(), 2) };
        assert_ne!(unsafe { dpot_tensor_data(tensor) } as *const f64, source.as_ptr());
        assert_eq!(unsafe { f64_slice(tensor) }, &source);
        unsafe { dpot_tensor_free(tensor) };
    }

    #[test]
    fn shape_accessor() {
        let tensor = owned_tensor(vec![0.0_f64; 12], vec![4, 3]);
        let mut ndim = 0;
        let shape = unsafe { dpot_tensor_shape(tensor, &mut ndim) };
        assert_eq!(ndim, 2);
        assert_eq!(unsafe { std::slice::from_raw_parts(shape, 2) }, &[4, 3]);
        unsafe { dpot_tensor_free(tensor) };
    }

    #[test]
    fn validate_accepts_wildcard_extent() {
        let tensor = owned_tensor(vec![0.0_f64; 6], vec![2, 3]);
        assert_eq!(validate_f64(tensor, "batch", &[None, Some(3)]), Ok(vec![2, 3]));
        assert!(validate_f64(tensor, "batch", &[None, Some(4)]).is_err());
        assert!(validate_f64(tensor, "batch", &[None]).is_err());
        unsafe { dpot_tensor_free(tensor) };
    }

    #[test]
    fn validate_rejects_int_tensor_and_null() {
        let tensor = owned_tensor(vec![1_i32; 2], vec![2]);
        let err = validate_f64(tensor, "energies", &[Some(2)]).unwrap_err();
        assert!(err.starts_with("energies: expected f64"));
        unsafe { dpot_tensor_free(tensor) };
        assert!(validate_f64(std::ptr::null(), "energies", &[None]).is_err());
    }

    #[test]
    fn empty_tensor_reads_as_empty_slice() {
        let tensor = owned_tensor(Vec::<f64>::new(), vec![0, 3]);
        assert_eq!(validate_f64(tensor, "batch", &[None, Some(3)]), Ok(vec![0, 3]));
        assert!(unsafe { f64_slice(tensor) }.is_empty());
        unsafe { dpot_tensor_free(tensor) };
    }

    #[test]
    fn free_null_is_noop() {
        unsafe { dpot_tensor_free(std::ptr::null_mut()) };
    }

    #[test]
    fn strides_follow_row_major_order() {
        assert_eq!(row_major_strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(row_major_strides(&[5]), vec![1]);
        assert!(row_major_strides(&[]).is_empty());
    }
}
