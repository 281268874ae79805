//! # nnrt-kernels
//!
//! Kernel compilation and dispatch for nnrt.
//!
//! Provides:
//! - `Compiler` / `Kernel`: per-element and block kernels dispatched over
//!   the rayon pool, with results kept device-resident in pipeline mode
//! - Runtime SIMD capability detection
//! - Tiled CPU matmul with an AVX2/FMA inner loop
//! - Batched matmul kernels with transpose and batch broadcast
//! - Unfold (im2col) and fold (col2im) kernels

pub mod cpu_matmul;
pub mod kernel;
pub mod matmul;
pub mod simd;
pub mod unfold;

pub use kernel::{Compiler, Kernel};
pub use simd::SimdCapability;
pub use unfold::{conv_output_size, deconv_output_size, Window};
