use nnrt_core::{NnrtError, Payload, Result, Shape};
use nnrt_kernels::{Compiler, Kernel};
use serde::Deserialize;

use crate::operator::{check_inputs, not_setup, Op};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchNormalizationParam {
    pub axes: Vec<i64>,
    pub eps: f32,
    pub batch_stat: bool,
}

impl Default for BatchNormalizationParam {
    fn default() -> Self {
        Self {
            axes: vec![1],
            eps: 1e-5,
            batch_stat: false,
        }
    }
}

/// Which optional affine terms are present, by input count.
#[derive(Debug, Clone, Copy)]
struct Layout {
    beta: Option<usize>,
    gamma: Option<usize>,
    mean: usize,
    var: usize,
}

impl Layout {
    /// `(x, mean, var)`, `(x, gamma, mean, var)` or
    /// `(x, beta, gamma, mean, var)`.
    fn for_inputs(n: usize) -> Self {
        match n {
            5 => Layout { beta: Some(1), gamma: Some(2), mean: 3, var: 4 },
            4 => Layout { beta: None, gamma: Some(1), mean: 2, var: 3 },
            _ => Layout { beta: None, gamma: None, mean: 1, var: 2 },
        }
    }
}

/// Inference-mode batch normalization with stored statistics:
/// `y = (x − mean) · gamma / sqrt(var + eps) + beta`, per channel along the
/// single normalized axis.
#[derive(Debug)]
pub struct BatchNormalization {
    param: BatchNormalizationParam,
    kernel: Option<Kernel>,
}

impl BatchNormalization {
    pub fn new(param: BatchNormalizationParam) -> Self {
        Self {
            param,
            kernel: None,
        }
    }

    fn axis(&self, x: &Shape) -> Result<usize> {
        if self.param.batch_stat {
            return Err(NnrtError::Unsupported("BatchNormalization: batch_stat=true".into()));
        }
        let &[axis] = self.param.axes.as_slice() else {
            return Err(NnrtError::Unsupported(format!(
                "BatchNormalization: only a single axis is supported, got {:?}",
                self.param.axes
            )));
        };
        x.resolve_axis(axis).ok_or_else(|| NnrtError::InvalidAttribute {
            function: self.kind().to_string(),
            message: format!("axis {axis} out of range for {x}"),
        })
    }
}

impl Op for BatchNormalization {
    fn kind(&self) -> &'static str {
        "BatchNormalization"
    }

    fn output_shapes(&self, inputs: &[Shape]) -> Result<Vec<Shape>> {
        check_inputs(self.kind(), inputs.len(), 3, 5)?;
        let x = &inputs[0];
        let channels = x.dims()[self.axis(x)?];
        for stat in &inputs[1..] {
            if stat.numel() != channels {
                return Err(NnrtError::ShapeMismatch {
                    context: "BatchNormalization statistics".into(),
                    expected: vec![channels],
                    got: stat.to_vec(),
                });
            }
        }
        Ok(vec![x.clone()])
    }

    fn setup(&mut self, compiler: &Compiler, inputs: &[Shape], _outputs: &[Shape]) -> Result<()> {
        let x = &inputs[0];
        let axis = self.axis(x)?;
        let channels = x.dims()[axis];
        let spatial = x.inner_size(axis);
        let layout = Layout::for_inputs(inputs.len());
        let eps = self.param.eps;

        let mut arg_lens = vec![x.numel()];
        arg_lens.resize(inputs.len(), channels);

        let kernel = compiler
            .element("batch_norm", x.numel(), move |i, args| {
                let c = (i / spatial) % channels;
                let stddev = (args[layout.var][c] + eps).sqrt();
                let gamma = layout.gamma.map_or(1.0, |g| args[g][c]);
                let beta = layout.beta.map_or(0.0, |b| args[b][c]);
                (args[0][i] - args[layout.mean][c]) * gamma / stddev + beta
            })
            .with_arg_lens(&arg_lens);
        self.kernel = Some(kernel);
        Ok(())
    }

    fn forward(&self, inputs: &[&Payload]) -> Result<Vec<Payload>> {
        let kernel = self.kernel.as_ref().ok_or_else(|| not_setup(self.kind()))?;
        Ok(vec![kernel.dispatch(inputs)?])
    }

    fn constant_inputs(&self) -> &'static [usize] {
        &[1, 2, 3, 4]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nnrt_core::DeviceContext;

    fn run(op: &mut BatchNormalization, shapes: &[Shape], inputs: &[Vec<f32>]) -> Vec<f32> {
        let compiler = Compiler::new(DeviceContext::new(), true);
        let outputs = op.output_shapes(shapes).unwrap();
        op.setup(&compiler, shapes, &outputs).unwrap();
        let payloads: Vec<Payload> = inputs.iter().cloned().map(Payload::from).collect();
        let refs: Vec<&Payload> = payloads.iter().collect();
        op.forward(&refs).unwrap()[0].to_host().unwrap()
    }

    #[test]
    fn test_full_affine_terms() {
        let mut op = BatchNormalization::new(BatchNormalizationParam {
            eps: 0.0,
            ..Default::default()
        });
        let c = Shape::new(&[1, 2, 1, 1]);
        let shapes = [Shape::new(&[1, 2, 1, 2]), c.clone(), c.clone(), c.clone(), c];
        let y = run(
            &mut op,
            &shapes,
            &[
                vec![1.0, 3.0, 10.0, 14.0],
                vec![0.5, -1.0],  // beta
                vec![2.0, 1.0],   // gamma
                vec![2.0, 12.0],  // mean
                vec![4.0, 16.0],  // var
            ],
        );
        assert_eq!(y, vec![-0.5, 1.5, -1.5, -0.5]);
    }

    #[test]
    fn test_statistics_only() {
        let mut op = BatchNormalization::new(BatchNormalizationParam::default());
        let shapes = [Shape::new(&[2, 3]), Shape::new(&[3]), Shape::new(&[3])];
        let y = run(
            &mut op,
            &shapes,
            &[vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![1.0, 2.0, 3.0], vec![1.0; 3]],
        );
        let expected = [0.0, 0.0, 0.0, 3.0, 3.0, 3.0];
        for (a, b) in y.iter().zip(expected) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn test_batch_stat_unsupported() {
        let op = BatchNormalization::new(BatchNormalizationParam {
            batch_stat: true,
            ..Default::default()
        });
        let shapes = [Shape::new(&[2, 3]), Shape::new(&[3]), Shape::new(&[3])];
        assert!(matches!(op.output_shapes(&shapes), Err(NnrtError::Unsupported(_))));
    }
}
