use std::fmt;

use crate::device::DeviceContext;
use crate::payload::Payload;
use crate::shape::Shape;
use crate::{NnrtError, Result};

/// Stable index of a variable in its graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub usize);

/// Stable index of a function in its graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(pub usize);

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl fmt::Display for FuncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f{}", self.0)
    }
}

/// Whether a variable holds persisted weights or per-call activations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableKind {
    /// Zero-filled at allocation, overwritten by every forward call.
    Buffer,
    /// Loaded from persisted values, never re-zeroed.
    Parameter,
}

/// A named tensor with a fixed shape.
///
/// A variable has at most one producing function. Its payload lives on the
/// host or the device; `cache` moves it to the device once and keeps it
/// there.
#[derive(Debug)]
pub struct Variable {
    name: String,
    shape: Shape,
    kind: VariableKind,
    payload: Payload,
    producer: Option<FuncId>,
}

impl Variable {
    /// Zero-filled buffer variable.
    pub fn buffer(name: impl Into<String>, shape: Shape) -> Self {
        let payload = Payload::zeros(shape.numel());
        Self {
            name: name.into(),
            shape,
            kind: VariableKind::Buffer,
            payload,
            producer: None,
        }
    }

    /// Parameter variable initialized from persisted values.
    pub fn parameter(name: impl Into<String>, shape: Shape, values: Vec<f32>) -> Result<Self> {
        let name = name.into();
        if values.len() != shape.numel() {
            return Err(NnrtError::size_mismatch(&name, shape.dims(), values.len()));
        }
        Ok(Self {
            name,
            shape,
            kind: VariableKind::Parameter,
            payload: Payload::Host(values),
            producer: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Number of elements.
    pub fn size(&self) -> usize {
        self.shape.numel()
    }

    pub fn kind(&self) -> VariableKind {
        self.kind
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn is_device(&self) -> bool {
        self.payload.is_device()
    }

    pub fn producer(&self) -> Option<FuncId> {
        self.producer
    }

    /// Bind the producing function. A variable is assigned exactly once.
    pub fn set_producer(&mut self, func: FuncId) -> Result<()> {
        if let Some(existing) = self.producer {
            return Err(NnrtError::InvariantViolation(format!(
                "variable {} already has producer {existing}, cannot assign {func}",
                self.name
            )));
        }
        self.producer = Some(func);
        Ok(())
    }

    /// Replace the payload with host values.
    pub fn set_data(&mut self, values: Vec<f32>) -> Result<()> {
        self.set_payload(Payload::Host(values))
    }

    /// Replace the payload. The length must match the declared shape.
    pub fn set_payload(&mut self, payload: Payload) -> Result<()> {
        if payload.len() != self.size() {
            return Err(NnrtError::size_mismatch(
                &self.name,
                self.shape.dims(),
                payload.len(),
            ));
        }
        self.payload = payload;
        Ok(())
    }

    /// Read the values on the host. Device payloads are downloaded; the
    /// stored payload is left as it is.
    pub fn to_host(&self) -> Result<Vec<f32>> {
        self.payload.to_host()
    }

    /// Upload a host payload to `ctx`. Subsequent calls are no-ops while the
    /// payload stays on the device.
    pub fn cache(&mut self, ctx: &DeviceContext) -> Result<()> {
        if self.payload.is_host() {
            self.payload = self.payload.to_device(ctx)?;
        }
        Ok(())
    }
}
