//! # nnrt-core
//!
//! Core types for the nnrt inference runtime.
//!
//! Provides:
//! - `Shape` with placeholder-batch resolution and axis helpers
//! - `DeviceContext` / `DeviceBuffer`, an explicit accelerator handle
//! - `Payload`, the host/device tagged union for tensor data
//! - `Variable`, a named fixed-shape tensor with a single producer
//! - `NnrtError`, the error taxonomy shared by every crate

pub mod device;
pub mod error;
pub mod payload;
pub mod shape;
pub mod variable;

pub use device::{DeviceBuffer, DeviceContext, DeviceStats};
pub use error::{EntityKind, NnrtError};
pub use payload::{Payload, PayloadView};
pub use shape::Shape;
pub use variable::{FuncId, VarId, Variable, VariableKind};

pub type Result<T> = std::result::Result<T, NnrtError>;
