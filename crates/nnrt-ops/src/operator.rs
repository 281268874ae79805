//! The closed set of operator kinds.
//!
//! `Operator::from_descriptor` is the only place an operator kind is looked up
//! by name. Everything after construction dispatches over the enum.

use nnrt_core::{NnrtError, Payload, Result, Shape};
use nnrt_kernels::Compiler;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::affine::Affine;
use crate::conv::{Convolution, Deconvolution, DepthwiseConvolution};
use crate::elementwise::{Binary, BinaryKind, Scalar, ScalarKind, Unary, UnaryKind};
use crate::generator::{Arange, Randn};
use crate::manipulation::{Concatenate, Reshape, Slice, Split, Transpose};
use crate::nms::NmsDetection2d;
use crate::normalization::BatchNormalization;
use crate::pool::{GlobalAveragePooling, PoolMode, Pooling};
use crate::softmax::Softmax;

/// Two-phase operator contract.
///
/// `setup` runs once per shape configuration and compiles whatever kernels
/// the operator needs; `forward` may then run any number of times.
pub trait Op {
    /// Operator kind name as it appears in graph descriptions.
    fn kind(&self) -> &'static str;

    /// Output shapes implied by the given input shapes.
    fn output_shapes(&self, inputs: &[Shape]) -> Result<Vec<Shape>>;

    fn setup(&mut self, compiler: &Compiler, inputs: &[Shape], outputs: &[Shape]) -> Result<()>;

    /// Compute outputs from the currently bound inputs.
    fn forward(&self, inputs: &[&Payload]) -> Result<Vec<Payload>>;

    /// Input positions treated as constants and cached on the device before
    /// the first forward.
    fn constant_inputs(&self) -> &'static [usize] {
        &[]
    }
}

/// Every supported operator, each variant owning its attribute record and
/// compiled state.
#[derive(Debug)]
pub enum Operator {
    Binary(Binary),
    Scalar(Scalar),
    Unary(Unary),
    Affine(Affine),
    Convolution(Convolution),
    Deconvolution(Deconvolution),
    DepthwiseConvolution(DepthwiseConvolution),
    Pooling(Pooling),
    GlobalAveragePooling(GlobalAveragePooling),
    BatchNormalization(BatchNormalization),
    Softmax(Softmax),
    Concatenate(Concatenate),
    Split(Split),
    Slice(Slice),
    Transpose(Transpose),
    Reshape(Reshape),
    Arange(Arange),
    Randn(Randn),
    NmsDetection2d(NmsDetection2d),
}

macro_rules! dispatch {
    ($self:expr, $op:ident => $body:expr) => {
        match $self {
            Operator::Binary($op) => $body,
            Operator::Scalar($op) => $body,
            Operator::Unary($op) => $body,
            Operator::Affine($op) => $body,
            Operator::Convolution($op) => $body,
            Operator::Deconvolution($op) => $body,
            Operator::DepthwiseConvolution($op) => $body,
            Operator::Pooling($op) => $body,
            Operator::GlobalAveragePooling($op) => $body,
            Operator::BatchNormalization($op) => $body,
            Operator::Softmax($op) => $body,
            Operator::Concatenate($op) => $body,
            Operator::Split($op) => $body,
            Operator::Slice($op) => $body,
            Operator::Transpose($op) => $body,
            Operator::Reshape($op) => $body,
            Operator::Arange($op) => $body,
            Operator::Randn($op) => $body,
            Operator::NmsDetection2d($op) => $body,
        }
    };
}

impl Operator {
    /// Build an operator from its kind name and attribute object.
    ///
    /// `function` names the graph node and only feeds error messages.
    pub fn from_descriptor(function: &str, kind: &str, attrs: &Value) -> Result<Self> {
        let op = match kind {
            "Add2" => Operator::Binary(Binary::new(BinaryKind::Add)),
            "Sub2" => Operator::Binary(Binary::new(BinaryKind::Sub)),
            "Mul2" => Operator::Binary(Binary::new(BinaryKind::Mul)),
            "Div2" => Operator::Binary(Binary::new(BinaryKind::Div)),
            "Pow2" => Operator::Binary(Binary::new(BinaryKind::Pow)),

            "AddScalar" => Operator::Scalar(Scalar::new(ScalarKind::Add, parse_attrs(function, attrs)?)),
            "MulScalar" => Operator::Scalar(Scalar::new(ScalarKind::Mul, parse_attrs(function, attrs)?)),
            "PowScalar" => Operator::Scalar(Scalar::new(ScalarKind::Pow, parse_attrs(function, attrs)?)),
            "RSubScalar" => Operator::Scalar(Scalar::new(ScalarKind::RSub, parse_attrs(function, attrs)?)),
            "RDivScalar" => Operator::Scalar(Scalar::new(ScalarKind::RDiv, parse_attrs(function, attrs)?)),

            "ReLU" => Operator::Unary(Unary::new(UnaryKind::ReLU)),
            "Sigmoid" => Operator::Unary(Unary::new(UnaryKind::Sigmoid)),
            "Tanh" => Operator::Unary(Unary::new(UnaryKind::Tanh)),
            "Exp" => Operator::Unary(Unary::new(UnaryKind::Exp)),
            "Identity" => Operator::Unary(Unary::new(UnaryKind::Identity)),
            "ELU" => {
                let alpha = parse_alpha(function, attrs, 1.0)?;
                Operator::Unary(Unary::new(UnaryKind::Elu { alpha }))
            }
            "LeakyReLU" => {
                let alpha = parse_alpha(function, attrs, 0.1)?;
                Operator::Unary(Unary::new(UnaryKind::LeakyReLU { alpha }))
            }

            "Affine" => Operator::Affine(Affine::new(parse_attrs(function, attrs)?)),
            "Convolution" => Operator::Convolution(Convolution::new(parse_attrs(function, attrs)?)),
            "Deconvolution" => Operator::Deconvolution(Deconvolution::new(parse_attrs(function, attrs)?)),
            "DepthwiseConvolution" => {
                Operator::DepthwiseConvolution(DepthwiseConvolution::new(parse_attrs(function, attrs)?))
            }
            "MaxPooling" => Operator::Pooling(Pooling::new(PoolMode::Max, parse_attrs(function, attrs)?)),
            "AveragePooling" => {
                Operator::Pooling(Pooling::new(PoolMode::Average, parse_attrs(function, attrs)?))
            }
            "GlobalAveragePooling" => Operator::GlobalAveragePooling(GlobalAveragePooling::new()),
            "BatchNormalization" => {
                Operator::BatchNormalization(BatchNormalization::new(parse_attrs(function, attrs)?))
            }
            "Softmax" => Operator::Softmax(Softmax::new(parse_attrs(function, attrs)?)),
            "Concatenate" => Operator::Concatenate(Concatenate::new(parse_attrs(function, attrs)?)),
            "Split" => Operator::Split(Split::new(parse_attrs(function, attrs)?)),
            "Slice" => Operator::Slice(Slice::new(parse_attrs(function, attrs)?)),
            "Transpose" => Operator::Transpose(Transpose::new(parse_attrs(function, attrs)?)),
            "Reshape" => Operator::Reshape(Reshape::new(parse_attrs(function, attrs)?)),
            "Arange" => Operator::Arange(Arange::new(parse_attrs(function, attrs)?)),
            "Randn" => Operator::Randn(Randn::new(parse_attrs(function, attrs)?)),
            "NmsDetection2d" => Operator::NmsDetection2d(NmsDetection2d::new(parse_attrs(function, attrs)?)),

            other => return Err(NnrtError::UnsupportedOperator(other.to_string())),
        };
        Ok(op)
    }

    pub fn kind(&self) -> &'static str {
        dispatch!(self, op => op.kind())
    }

    pub fn output_shapes(&self, inputs: &[Shape]) -> Result<Vec<Shape>> {
        dispatch!(self, op => op.output_shapes(inputs))
    }

    /// Check the declared outputs against the inferred ones, then let the
    /// operator compile its kernels. Declared dims must match exactly; for
    /// Reshape only the element count has to agree.
    pub fn setup(&mut self, compiler: &Compiler, inputs: &[Shape], outputs: &[Shape]) -> Result<()> {
        let expected = self.output_shapes(inputs)?;
        if expected.len() != outputs.len() {
            return Err(NnrtError::InvariantViolation(format!(
                "{} produces {} outputs, graph declares {}",
                self.kind(),
                expected.len(),
                outputs.len()
            )));
        }
        // Reshape is defined by its element count; every other kernel indexes
        // by the inferred dims.
        let size_only = matches!(self, Operator::Reshape(_));
        for (i, (inferred, declared)) in expected.iter().zip(outputs).enumerate() {
            let agrees = if size_only {
                inferred.numel() == declared.numel()
            } else {
                inferred == declared
            };
            if !agrees {
                return Err(NnrtError::ShapeMismatch {
                    context: format!("{} output {i}", self.kind()),
                    expected: inferred.to_vec(),
                    got: declared.to_vec(),
                });
            }
        }
        dispatch!(self, op => op.setup(compiler, inputs, outputs))
    }

    pub fn forward(&self, inputs: &[&Payload]) -> Result<Vec<Payload>> {
        dispatch!(self, op => op.forward(inputs))
    }

    pub fn constant_inputs(&self) -> &'static [usize] {
        dispatch!(self, op => op.constant_inputs())
    }
}

/// Deserialize an attribute record; a missing (null) object yields the
/// defaults.
pub(crate) fn parse_attrs<T: DeserializeOwned + Default>(function: &str, attrs: &Value) -> Result<T> {
    if attrs.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(attrs.clone()).map_err(|e| NnrtError::InvalidAttribute {
        function: function.to_string(),
        message: e.to_string(),
    })
}

fn parse_alpha(function: &str, attrs: &Value, default: f32) -> Result<f32> {
    #[derive(Default, serde::Deserialize)]
    struct AlphaParam {
        alpha: Option<f32>,
    }
    let param: AlphaParam = parse_attrs(function, attrs)?;
    Ok(param.alpha.unwrap_or(default))
}

pub(crate) fn not_setup(kind: &str) -> NnrtError {
    NnrtError::IllegalState(format!("{kind}: call setup before forward"))
}

/// Input count must lie in `min..=max`.
pub(crate) fn check_inputs(kind: &str, got: usize, min: usize, max: usize) -> Result<()> {
    if got < min || got > max {
        let expected = if min == max {
            min.to_string()
        } else {
            format!("{min}..={max}")
        };
        return Err(NnrtError::InvariantViolation(format!(
            "{kind}: expected {expected} inputs, got {got}"
        )));
    }
    Ok(())
}

/// Two inputs must hold the same number of elements.
pub(crate) fn check_same_size(kind: &str, a: &Shape, b: &Shape) -> Result<()> {
    if a.numel() != b.numel() {
        return Err(NnrtError::ShapeMismatch {
            context: format!("{kind} operands"),
            expected: a.to_vec(),
            got: b.to_vec(),
        });
    }
    Ok(())
}

/// Spatial attribute as a `[h, w]` pair.
pub(crate) fn pair(kind: &str, name: &str, values: &[usize]) -> Result<[usize; 2]> {
    match values {
        &[h, w] => Ok([h, w]),
        _ => Err(NnrtError::Unsupported(format!(
            "{kind}: only 2-D {name} is supported, got {values:?}"
        ))),
    }
}
