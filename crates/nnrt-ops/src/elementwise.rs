//! Per-index elementwise operators. Operand sizes must match exactly; there
//! is no implicit broadcasting.

use nnrt_core::{Payload, Result, Shape};
use nnrt_kernels::{Compiler, Kernel};
use serde::Deserialize;

use crate::operator::{check_inputs, check_same_size, not_setup, Op};

// ============================================================================
// Binary
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryKind {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

impl BinaryKind {
    #[inline]
    pub fn apply(self, a: f32, b: f32) -> f32 {
        match self {
            BinaryKind::Add => a + b,
            BinaryKind::Sub => a - b,
            BinaryKind::Mul => a * b,
            BinaryKind::Div => a / b,
            BinaryKind::Pow => a.powf(b),
        }
    }

    fn name(self) -> &'static str {
        match self {
            BinaryKind::Add => "Add2",
            BinaryKind::Sub => "Sub2",
            BinaryKind::Mul => "Mul2",
            BinaryKind::Div => "Div2",
            BinaryKind::Pow => "Pow2",
        }
    }
}

/// `y[i] = x0[i] ∘ x1[i]`.
#[derive(Debug)]
pub struct Binary {
    kind: BinaryKind,
    kernel: Option<Kernel>,
}

impl Binary {
    pub fn new(kind: BinaryKind) -> Self {
        Self { kind, kernel: None }
    }
}

impl Op for Binary {
    fn kind(&self) -> &'static str {
        self.kind.name()
    }

    fn output_shapes(&self, inputs: &[Shape]) -> Result<Vec<Shape>> {
        check_inputs(self.kind(), inputs.len(), 2, 2)?;
        check_same_size(self.kind(), &inputs[0], &inputs[1])?;
        Ok(vec![inputs[0].clone()])
    }

    fn setup(&mut self, compiler: &Compiler, inputs: &[Shape], _outputs: &[Shape]) -> Result<()> {
        let n = inputs[0].numel();
        let kind = self.kind;
        let kernel = compiler
            .element(self.kind.name(), n, move |i, args| kind.apply(args[0][i], args[1][i]))
            .with_arg_lens(&[n, n]);
        self.kernel = Some(kernel);
        Ok(())
    }

    fn forward(&self, inputs: &[&Payload]) -> Result<Vec<Payload>> {
        let kernel = self.kernel.as_ref().ok_or_else(|| not_setup(self.kind()))?;
        Ok(vec![kernel.dispatch(&[inputs[0], inputs[1]])?])
    }
}

// ============================================================================
// Scalar
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    Add,
    Mul,
    Pow,
    /// `val - x`
    RSub,
    /// `val / x`
    RDiv,
}

impl ScalarKind {
    #[inline]
    pub fn apply(self, x: f32, val: f32) -> f32 {
        match self {
            ScalarKind::Add => x + val,
            ScalarKind::Mul => x * val,
            ScalarKind::Pow => x.powf(val),
            ScalarKind::RSub => val - x,
            ScalarKind::RDiv => val / x,
        }
    }

    fn name(self) -> &'static str {
        match self {
            ScalarKind::Add => "AddScalar",
            ScalarKind::Mul => "MulScalar",
            ScalarKind::Pow => "PowScalar",
            ScalarKind::RSub => "RSubScalar",
            ScalarKind::RDiv => "RDivScalar",
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ScalarParam {
    pub val: f32,
}

impl Default for ScalarParam {
    fn default() -> Self {
        Self { val: 1.0 }
    }
}

/// `y[i] = x[i] ∘ val`.
#[derive(Debug)]
pub struct Scalar {
    kind: ScalarKind,
    param: ScalarParam,
    kernel: Option<Kernel>,
}

impl Scalar {
    pub fn new(kind: ScalarKind, param: ScalarParam) -> Self {
        Self {
            kind,
            param,
            kernel: None,
        }
    }
}

impl Op for Scalar {
    fn kind(&self) -> &'static str {
        self.kind.name()
    }

    fn output_shapes(&self, inputs: &[Shape]) -> Result<Vec<Shape>> {
        check_inputs(self.kind(), inputs.len(), 1, 1)?;
        Ok(vec![inputs[0].clone()])
    }

    fn setup(&mut self, compiler: &Compiler, inputs: &[Shape], _outputs: &[Shape]) -> Result<()> {
        let n = inputs[0].numel();
        let (kind, val) = (self.kind, self.param.val);
        let kernel = compiler
            .element(self.kind.name(), n, move |i, args| kind.apply(args[0][i], val))
            .with_arg_lens(&[n]);
        self.kernel = Some(kernel);
        Ok(())
    }

    fn forward(&self, inputs: &[&Payload]) -> Result<Vec<Payload>> {
        let kernel = self.kernel.as_ref().ok_or_else(|| not_setup(self.kind()))?;
        Ok(vec![kernel.dispatch(&[inputs[0]])?])
    }
}

// ============================================================================
// Unary
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnaryKind {
    ReLU,
    Sigmoid,
    Tanh,
    Elu { alpha: f32 },
    LeakyReLU { alpha: f32 },
    Exp,
    Identity,
}

impl UnaryKind {
    #[inline]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            UnaryKind::ReLU => x.max(0.0),
            UnaryKind::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            UnaryKind::Tanh => x.tanh(),
            UnaryKind::Elu { alpha } => {
                if x >= 0.0 {
                    x
                } else {
                    alpha * (x.exp() - 1.0)
                }
            }
            UnaryKind::LeakyReLU { alpha } => {
                if x >= 0.0 {
                    x
                } else {
                    alpha * x
                }
            }
            UnaryKind::Exp => x.exp(),
            UnaryKind::Identity => x,
        }
    }

    fn name(self) -> &'static str {
        match self {
            UnaryKind::ReLU => "ReLU",
            UnaryKind::Sigmoid => "Sigmoid",
            UnaryKind::Tanh => "Tanh",
            UnaryKind::Elu { .. } => "ELU",
            UnaryKind::LeakyReLU { .. } => "LeakyReLU",
            UnaryKind::Exp => "Exp",
            UnaryKind::Identity => "Identity",
        }
    }
}

/// `y[i] = f(x[i])`.
#[derive(Debug)]
pub struct Unary {
    kind: UnaryKind,
    kernel: Option<Kernel>,
}

impl Unary {
    pub fn new(kind: UnaryKind) -> Self {
        Self { kind, kernel: None }
    }
}

impl Op for Unary {
    fn kind(&self) -> &'static str {
        self.kind.name()
    }

    fn output_shapes(&self, inputs: &[Shape]) -> Result<Vec<Shape>> {
        check_inputs(self.kind(), inputs.len(), 1, 1)?;
        Ok(vec![inputs[0].clone()])
    }

    fn setup(&mut self, compiler: &Compiler, inputs: &[Shape], _outputs: &[Shape]) -> Result<()> {
        let n = inputs[0].numel();
        let kind = self.kind;
        let kernel = compiler
            .element(self.kind.name(), n, move |i, args| kind.apply(args[0][i]))
            .with_arg_lens(&[n]);
        self.kernel = Some(kernel);
        Ok(())
    }

    fn forward(&self, inputs: &[&Payload]) -> Result<Vec<Payload>> {
        let kernel = self.kernel.as_ref().ok_or_else(|| not_setup(self.kind()))?;
        Ok(vec![kernel.dispatch(&[inputs[0]])?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nnrt_core::{DeviceContext, NnrtError};

    fn run(op: &mut dyn Op, shapes: &[Shape], inputs: &[Vec<f32>]) -> Vec<f32> {
        let compiler = Compiler::new(DeviceContext::new(), true);
        let outputs = op.output_shapes(shapes).unwrap();
        op.setup(&compiler, shapes, &outputs).unwrap();
        let payloads: Vec<Payload> = inputs.iter().cloned().map(Payload::from).collect();
        let refs: Vec<&Payload> = payloads.iter().collect();
        op.forward(&refs).unwrap()[0].to_host().unwrap()
    }

    #[test]
    fn test_binary_ops() {
        let shape = Shape::new(&[4]);
        let a = vec![1.0, 2.0, 3.0, 4.0];
        let b = vec![2.0, 2.0, 2.0, 2.0];
        let cases = [
            (BinaryKind::Add, vec![3.0, 4.0, 5.0, 6.0]),
            (BinaryKind::Sub, vec![-1.0, 0.0, 1.0, 2.0]),
            (BinaryKind::Mul, vec![2.0, 4.0, 6.0, 8.0]),
            (BinaryKind::Div, vec![0.5, 1.0, 1.5, 2.0]),
            (BinaryKind::Pow, vec![1.0, 4.0, 9.0, 16.0]),
        ];
        for (kind, expected) in cases {
            let mut op = Binary::new(kind);
            let y = run(&mut op, &[shape.clone(), shape.clone()], &[a.clone(), b.clone()]);
            assert_eq!(y, expected, "{kind:?}");
        }
    }

    #[test]
    fn test_binary_rejects_size_mismatch() {
        let op = Binary::new(BinaryKind::Add);
        let err = op
            .output_shapes(&[Shape::new(&[2, 3]), Shape::new(&[3])])
            .unwrap_err();
        assert!(matches!(err, NnrtError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_scalar_ops() {
        let shape = Shape::new(&[3]);
        let x = vec![1.0, 2.0, 4.0];
        let cases = [
            (ScalarKind::Add, 0.5, vec![1.5, 2.5, 4.5]),
            (ScalarKind::Mul, 3.0, vec![3.0, 6.0, 12.0]),
            (ScalarKind::Pow, 2.0, vec![1.0, 4.0, 16.0]),
            (ScalarKind::RSub, 1.0, vec![0.0, -1.0, -3.0]),
            (ScalarKind::RDiv, 8.0, vec![8.0, 4.0, 2.0]),
        ];
        for (kind, val, expected) in cases {
            let mut op = Scalar::new(kind, ScalarParam { val });
            let y = run(&mut op, &[shape.clone()], &[x.clone()]);
            assert_eq!(y, expected, "{kind:?}");
        }
    }

    #[test]
    fn test_unary_ops() {
        let shape = Shape::new(&[3]);
        let x = vec![-2.0, 0.0, 1.5];

        let y = run(&mut Unary::new(UnaryKind::ReLU), &[shape.clone()], &[x.clone()]);
        assert_eq!(y, vec![0.0, 0.0, 1.5]);

        let y = run(&mut Unary::new(UnaryKind::LeakyReLU { alpha: 0.1 }), &[shape.clone()], &[x.clone()]);
        assert!((y[0] + 0.2).abs() < 1e-6);
        assert_eq!(y[2], 1.5);

        let y = run(&mut Unary::new(UnaryKind::Elu { alpha: 1.0 }), &[shape.clone()], &[x.clone()]);
        assert!((y[0] - ((-2.0f32).exp() - 1.0)).abs() < 1e-6);

        let y = run(&mut Unary::new(UnaryKind::Sigmoid), &[shape.clone()], &[x.clone()]);
        assert!((y[1] - 0.5).abs() < 1e-6);

        let y = run(&mut Unary::new(UnaryKind::Tanh), &[shape.clone()], &[x.clone()]);
        assert!((y[2] - 1.5f32.tanh()).abs() < 1e-6);

        let y = run(&mut Unary::new(UnaryKind::Exp), &[shape.clone()], &[x.clone()]);
        assert!((y[1] - 1.0).abs() < 1e-6);

        let y = run(&mut Unary::new(UnaryKind::Identity), &[shape], &[x.clone()]);
        assert_eq!(y, x);
    }
}
