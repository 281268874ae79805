//! # nnrt-runtime
//!
//! Graph runtime for nnrt: rebuilds networks from a parsed description and
//! persisted parameters, then runs lazy forward passes over them.
//!
//! ```text
//! Session ─┬─ GraphArena (VariableManager + functions)
//!          ├─ Network   name → VarId / FuncId
//!          └─ Executor  inputs, outputs → post-order evaluation
//! ```
//!
//! Models arrive either as a [`ModelDescription`] plus [`ParameterRecord`]s,
//! or as a single `.nnrt` container (see [`format`]). With the `loader`
//! feature, parameters can also be read from safetensors.

pub mod arena;
pub mod config;
pub mod desc;
pub mod executor;
pub mod format;
pub mod function;
#[cfg(feature = "loader")]
pub mod loader;
pub mod network;
pub mod session;
pub mod variable_manager;

pub use arena::GraphArena;
pub use config::SessionConfig;
pub use desc::{ExecutorDesc, FunctionDesc, ModelDescription, NetworkDesc, ParameterRecord, VariableDesc, VariableType};
pub use executor::{Executor, ForwardOptions};
pub use format::{Container, ContainerBuilder, FormatError};
pub use function::Function;
#[cfg(feature = "loader")]
pub use loader::{inspect_safetensors, load_safetensors};
pub use network::Network;
pub use session::Session;
pub use variable_manager::VariableManager;

pub use nnrt_core::{DeviceContext, NnrtError, Result};
