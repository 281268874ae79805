use nnrt_core::{NnrtError, Payload, Result, Shape};
use nnrt_kernels::matmul::matmul_kernel;
use nnrt_kernels::{Compiler, Kernel};
use serde::Deserialize;

use crate::operator::{check_inputs, not_setup, Op};

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct AffineParam {
    pub base_axis: i64,
}

impl Default for AffineParam {
    fn default() -> Self {
        Self { base_axis: 1 }
    }
}

#[derive(Debug)]
struct AffineKernels {
    matmul: Kernel,
    bias: Option<Kernel>,
}

/// Fully connected layer.
///
/// The input is flattened to `[rows, cols]` about `base_axis`:
/// `rows = ∏ shape[..base_axis]`, `cols = ∏ shape[base_axis..]`. The weight
/// is `[cols, out...]` and the optional bias holds `∏ out` values added to
/// every row.
#[derive(Debug)]
pub struct Affine {
    param: AffineParam,
    kernels: Option<AffineKernels>,
}

impl Affine {
    pub fn new(param: AffineParam) -> Self {
        Self {
            param,
            kernels: None,
        }
    }

    /// `(base_axis, rows, cols, out)` for the given input and weight shapes.
    fn geometry(&self, x: &Shape, w: &Shape) -> Result<(usize, usize, usize, usize)> {
        let base_axis = x.resolve_axis(self.param.base_axis).ok_or_else(|| {
            NnrtError::InvariantViolation(format!(
                "Affine: base_axis {} out of range for {x}",
                self.param.base_axis
            ))
        })?;
        let rows = x.outer_size(base_axis);
        let cols: usize = x.dims()[base_axis..].iter().product();
        if w.ndim() < 2 || w.dims()[0] != cols {
            return Err(NnrtError::ShapeMismatch {
                context: "Affine weight".into(),
                expected: vec![cols],
                got: w.to_vec(),
            });
        }
        let out: usize = w.dims()[1..].iter().product();
        Ok((base_axis, rows, cols, out))
    }
}

impl Op for Affine {
    fn kind(&self) -> &'static str {
        "Affine"
    }

    fn output_shapes(&self, inputs: &[Shape]) -> Result<Vec<Shape>> {
        check_inputs(self.kind(), inputs.len(), 2, 3)?;
        let (x, w) = (&inputs[0], &inputs[1]);
        let (base_axis, _, _, out) = self.geometry(x, w)?;
        if let Some(b) = inputs.get(2) {
            if b.numel() != out {
                return Err(NnrtError::ShapeMismatch {
                    context: "Affine bias".into(),
                    expected: w.dims()[1..].to_vec(),
                    got: b.to_vec(),
                });
            }
        }
        let mut dims = x.dims()[..base_axis].to_vec();
        dims.extend_from_slice(&w.dims()[1..]);
        Ok(vec![Shape::from(dims)])
    }

    fn setup(&mut self, compiler: &Compiler, inputs: &[Shape], _outputs: &[Shape]) -> Result<()> {
        let (_, rows, cols, out) = self.geometry(&inputs[0], &inputs[1])?;
        let matmul = matmul_kernel(compiler, rows, cols, out)?;
        let bias = (inputs.len() == 3).then(|| {
            compiler
                .element("affine_bias", rows * out, move |i, args| args[0][i] + args[1][i % out])
                .with_arg_lens(&[rows * out, out])
        });
        self.kernels = Some(AffineKernels { matmul, bias });
        Ok(())
    }

    fn forward(&self, inputs: &[&Payload]) -> Result<Vec<Payload>> {
        let kernels = self.kernels.as_ref().ok_or_else(|| not_setup(self.kind()))?;
        let mut y = kernels.matmul.dispatch(&[inputs[0], inputs[1]])?;
        if let (Some(bias), Some(&b)) = (&kernels.bias, inputs.get(2)) {
            y = bias.dispatch(&[&y, b])?;
        }
        Ok(vec![y])
    }

    fn constant_inputs(&self) -> &'static [usize] {
        &[1, 2]
    }
}
