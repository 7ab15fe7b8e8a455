//! `burn-cpp-template` generates C++ kernels for batched matrix multiplication.
//!
//! A batched GEMM is assembled from two versions of a single-item GEMM template, one running on
//! a single thread and one spreading its blocks over OpenMP threads. The exported function splits
//! the batch between the two so that every thread stays busy without nested parallelism. The
//! weight is padded, blocked and packed for the micro-kernel before the GEMM reads it.

#[macro_use]
extern crate derive_new;

/// Batched GEMM: weight preparation, per-item calls and the batch loop.
pub mod bmm;
/// Single-item GEMM templates and micro-kernels.
pub mod gemm;
/// Tensor descriptors and symbolic sizes.
pub mod ir;
/// Arguments and placeholders of the kernel being generated.
pub mod kernel;

mod config;
mod error;
mod logger;

pub use config::*;
pub use error::*;
pub use logger::*;
