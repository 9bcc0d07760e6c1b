// MIT License
// Copyright 2023--present dpot developers

//! Public C API entry points.
//!
//! Each submodule exposes `extern "C"` functions that cbindgen collects into
//! `dpot-core/include/dpot.h`. All functions in this module follow three
//! invariants:
//!
//! 1. **Return [`dpot_status_t`](crate::status::dpot_status_t)** (or a
//!    pointer / void for constructors and destructors).
//! 2. **Wrap the body in [`catch_unwind`](crate::status::catch_unwind)** to
//!    prevent panics from crossing the FFI boundary.
//! 3. **Validate pointer arguments** and call
//!    [`set_last_error`](crate::status::set_last_error) before returning a
//!    non-success status.
//!
//! ## Submodules
//!
//! - [`types`]: constructors and destructors for the exchange structs.
//! - [`potential`]: create, call and free a callback potential.
//! - [`session`]: bring a rank pool up, inspect it, close it.
//! - [`evaluate`]: single, distributed and vectorized evaluation.

pub mod evaluate;
pub mod potential;
pub mod session;
pub mod types;
