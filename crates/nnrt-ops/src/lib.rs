//! # nnrt-ops
//!
//! The operator library. Each operator kind owns its attribute record and
//! the kernels it compiles at setup:
//!
//! - Elementwise: `Add2`/`Sub2`/`Mul2`/`Div2`/`Pow2`, scalar variants, unary
//!   activations
//! - `Affine`, `Convolution`, `Deconvolution`, `DepthwiseConvolution`
//! - `MaxPooling`, `AveragePooling`, `GlobalAveragePooling`
//! - `BatchNormalization` (inference statistics), `Softmax`
//! - `Concatenate`, `Split`, `Slice`, `Transpose`, `Reshape`
//! - `Arange`, `Randn`
//! - `NmsDetection2d` (host only)
//!
//! Graph code only sees [`Operator`], built from a kind name and a JSON
//! attribute object.

pub mod affine;
pub mod conv;
pub mod elementwise;
pub mod generator;
pub mod manipulation;
pub mod nms;
pub mod normalization;
pub mod operator;
pub mod pool;
pub mod softmax;

pub use operator::{Op, Operator};
