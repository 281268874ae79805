use nnrt_core::{NnrtError, Payload, Result, Shape};
use nnrt_kernels::{Compiler, Kernel};
use rayon::prelude::*;
use serde::Deserialize;

use crate::operator::{check_inputs, not_setup, Op};

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct SoftmaxParam {
    /// End-relative when negative; the last axis when absent.
    pub axis: Option<i64>,
}

/// Numerically stable softmax along one axis.
///
/// The input is viewed as `[outer, axis, inner]`; each `(outer, inner)` pair
/// is one group normalized over the axis.
#[derive(Debug)]
pub struct Softmax {
    param: SoftmaxParam,
    kernel: Option<Kernel>,
}

impl Softmax {
    pub fn new(param: SoftmaxParam) -> Self {
        Self {
            param,
            kernel: None,
        }
    }

    fn axis(&self, x: &Shape) -> Result<usize> {
        let axis = self.param.axis.unwrap_or(-1);
        x.resolve_axis(axis).ok_or_else(|| NnrtError::InvalidAttribute {
            function: self.kind().to_string(),
            message: format!("axis {axis} out of range for {x}"),
        })
    }
}

impl Op for Softmax {
    fn kind(&self) -> &'static str {
        "Softmax"
    }

    fn output_shapes(&self, inputs: &[Shape]) -> Result<Vec<Shape>> {
        check_inputs(self.kind(), inputs.len(), 1, 1)?;
        self.axis(&inputs[0])?;
        Ok(vec![inputs[0].clone()])
    }

    fn setup(&mut self, compiler: &Compiler, inputs: &[Shape], _outputs: &[Shape]) -> Result<()> {
        let x = &inputs[0];
        let axis = self.axis(x)?;
        let size1 = x.dims()[axis];
        let size2 = x.inner_size(axis);
        let block = size1 * size2;

        let kernel = compiler
            .block("softmax", x.numel(), move |args, out| {
                if block == 0 {
                    return;
                }
                out.par_chunks_mut(block)
                    .zip(args[0].par_chunks(block))
                    .for_each(|(y, x)| {
                        for i2 in 0..size2 {
                            let max = (0..size1)
                                .map(|i1| x[i1 * size2 + i2])
                                .fold(f32::NEG_INFINITY, f32::max);
                            let mut sum = 0.0f32;
                            for i1 in 0..size1 {
                                let e = (x[i1 * size2 + i2] - max).exp();
                                y[i1 * size2 + i2] = e;
                                sum += e;
                            }
                            for i1 in 0..size1 {
                                y[i1 * size2 + i2] /= sum;
                            }
                        }
                    });
            })
            .with_arg_lens(&[x.numel()]);
        self.kernel = Some(kernel);
        Ok(())
    }

    fn forward(&self, inputs: &[&Payload]) -> Result<Vec<Payload>> {
        let kernel = self.kernel.as_ref().ok_or_else(|| not_setup(self.kind()))?;
        Ok(vec![kernel.dispatch(&[inputs[0]])?])
    }
}
