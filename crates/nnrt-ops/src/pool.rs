//! Pooling over `[B, C, H, W]` tensors.
//!
//! Windowed pooling unfolds the input into `[B, C, K, L]` and reduces over
//! the K axis. Output spatial size is `(in + 2·pad − k) / stride + 1`.

use nnrt_core::{NnrtError, Payload, Result, Shape};
use nnrt_kernels::unfold::im2col_kernel;
use nnrt_kernels::{Compiler, Kernel, Window};
use serde::Deserialize;

use crate::operator::{check_inputs, not_setup, pair, Op};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolMode {
    Max,
    Average,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolingParam {
    pub kernel: Vec<usize>,
    /// Defaults to the kernel size.
    pub stride: Option<Vec<usize>>,
    pub pad: Vec<usize>,
    pub ignore_border: bool,
    pub channel_last: bool,
    /// Average pooling only: count padded positions in the divisor.
    pub including_pad: bool,
}

impl Default for PoolingParam {
    fn default() -> Self {
        Self {
            kernel: Vec::new(),
            stride: None,
            pad: vec![0, 0],
            ignore_border: true,
            channel_last: false,
            including_pad: true,
        }
    }
}

#[derive(Debug)]
struct PoolKernels {
    im2col: Kernel,
    reduce: Kernel,
}

/// `MaxPooling` / `AveragePooling`.
#[derive(Debug)]
pub struct Pooling {
    mode: PoolMode,
    param: PoolingParam,
    kernels: Option<PoolKernels>,
}

impl Pooling {
    pub fn new(mode: PoolMode, param: PoolingParam) -> Self {
        Self {
            mode,
            param,
            kernels: None,
        }
    }

    fn window(&self, x: &Shape) -> Result<Window> {
        let kind = self.kind();
        if self.param.channel_last {
            return Err(NnrtError::Unsupported(format!("{kind}: channel_last")));
        }
        if !self.param.ignore_border {
            return Err(NnrtError::Unsupported(format!("{kind}: ignore_border=false")));
        }
        let kernel = pair(kind, "kernel", &self.param.kernel)?;
        let stride = match &self.param.stride {
            Some(stride) => pair(kind, "stride", stride)?,
            None => kernel,
        };
        let pad = pair(kind, "pad", &self.param.pad)?;
        Window::new(x.dims(), kernel, stride, pad)
    }
}

impl Op for Pooling {
    fn kind(&self) -> &'static str {
        match self.mode {
            PoolMode::Max => "MaxPooling",
            PoolMode::Average => "AveragePooling",
        }
    }

    fn output_shapes(&self, inputs: &[Shape]) -> Result<Vec<Shape>> {
        check_inputs(self.kind(), inputs.len(), 1, 1)?;
        let window = self.window(&inputs[0])?;
        Ok(vec![Shape::from(window.output_shape(window.channels))])
    }

    fn setup(&mut self, compiler: &Compiler, inputs: &[Shape], _outputs: &[Shape]) -> Result<()> {
        let window = self.window(&inputs[0])?;
        let [b, c, k, l] = window.unfolded_shape();

        let fill = match self.mode {
            PoolMode::Max => f32::NEG_INFINITY,
            PoolMode::Average => 0.0,
        };
        let im2col = im2col_kernel(compiler, &window, fill);

        let reduce = match self.mode {
            PoolMode::Max => compiler.element("max_pool", b * c * l, move |i, args| {
                let base = (i / l) * k * l + i % l;
                (0..k).fold(f32::NEG_INFINITY, |acc, ki| acc.max(args[0][base + ki * l]))
            }),
            PoolMode::Average => {
                let including_pad = self.param.including_pad;
                compiler.element("average_pool", b * c * l, move |i, args| {
                    let base = (i / l) * k * l + i % l;
                    let sum: f32 = (0..k).map(|ki| args[0][base + ki * l]).sum();
                    let count = if including_pad {
                        k
                    } else {
                        window.valid_count(i % l).max(1)
                    };
                    sum / count as f32
                })
            }
        }
        .with_arg_lens(&[b * c * k * l]);

        self.kernels = Some(PoolKernels { im2col, reduce });
        Ok(())
    }

    fn forward(&self, inputs: &[&Payload]) -> Result<Vec<Payload>> {
        let kernels = self.kernels.as_ref().ok_or_else(|| not_setup(self.kind()))?;
        let cols = kernels.im2col.dispatch(&[inputs[0]])?;
        Ok(vec![kernels.reduce.dispatch(&[&cols])?])
    }
}

/// Mean over every axis after the channel axis: `[B, C, ...] -> [B, C, 1, 1]`.
#[derive(Debug, Default)]
pub struct GlobalAveragePooling {
    kernel: Option<Kernel>,
}

impl GlobalAveragePooling {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Op for GlobalAveragePooling {
    fn kind(&self) -> &'static str {
        "GlobalAveragePooling"
    }

    fn output_shapes(&self, inputs: &[Shape]) -> Result<Vec<Shape>> {
        check_inputs(self.kind(), inputs.len(), 1, 1)?;
        let x = &inputs[0];
        if x.ndim() < 2 {
            return Err(NnrtError::Unsupported(format!(
                "GlobalAveragePooling needs at least [B, C], got {x}"
            )));
        }
        Ok(vec![Shape::from([x.dims()[0], x.dims()[1], 1, 1])])
    }

    fn setup(&mut self, compiler: &Compiler, inputs: &[Shape], _outputs: &[Shape]) -> Result<()> {
        let x = &inputs[0];
        let groups = x.outer_size(2);
        let plane = x.inner_size(1);
        let kernel = compiler
            .element("global_average_pool", groups, move |i, args| {
                let sum: f32 = args[0][i * plane..(i + 1) * plane].iter().sum();
                sum / plane as f32
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

#[cfg(test)]
mod tests {
    use super::*;
    use nnrt_core::DeviceContext;

    fn run(op: &mut dyn Op, shape: Shape, x: Vec<f32>) -> (Shape, Vec<f32>) {
        let compiler = Compiler::new(DeviceContext::new(), false);
        let outputs = op.output_shapes(&[shape.clone()]).unwrap();
        op.setup(&compiler, &[shape], &outputs).unwrap();
        let y = op.forward(&[&Payload::from(x)]).unwrap()[0].to_host().unwrap();
        (outputs[0].clone(), y)
    }

    fn param(kernel: usize, stride: usize, pad: usize) -> PoolingParam {
        PoolingParam {
            kernel: vec![kernel, kernel],
            stride: Some(vec![stride, stride]),
            pad: vec![pad, pad],
            ..Default::default()
        }
    }

    #[test]
    fn test_max_pool_2x2() {
        let x: Vec<f32> = (1..=16).map(|v| v as f32).collect();
        let (shape, y) = run(&mut Pooling::new(PoolMode::Max, param(2, 2, 0)), Shape::new(&[1, 1, 4, 4]), x);
        assert_eq!(shape.dims(), &[1, 1, 2, 2]);
        assert_eq!(y, vec![6.0, 8.0, 14.0, 16.0]);
    }

    #[test]
    fn test_max_pool_padding_ignores_fill() {
        // all-negative input: padded positions must not win the max
        let x = vec![-5.0, -4.0, -3.0, -2.0];
        let (_, y) = run(&mut Pooling::new(PoolMode::Max, param(2, 1, 1)), Shape::new(&[1, 1, 2, 2]), x);
        assert_eq!(y, vec![-5.0, -4.0, -4.0, -3.0, -2.0, -2.0, -3.0, -2.0, -2.0]);
    }

    #[test]
    fn test_average_pool_including_pad() {
        let x = vec![4.0; 4];
        let (shape, y) = run(&mut Pooling::new(PoolMode::Average, param(2, 1, 1)), Shape::new(&[1, 1, 2, 2]), x.clone());
        assert_eq!(shape.dims(), &[1, 1, 3, 3]);
        assert_eq!(y[0], 1.0);
        assert_eq!(y[4], 4.0);

        let mut excluding = param(2, 1, 1);
        excluding.including_pad = false;
        let (_, y) = run(&mut Pooling::new(PoolMode::Average, excluding), Shape::new(&[1, 1, 2, 2]), x);
        assert!(y.iter().all(|&v| v == 4.0));
    }

    #[test]
    fn test_stride_defaults_to_kernel() {
        let op = Pooling::new(
            PoolMode::Average,
            PoolingParam {
                kernel: vec![2, 2],
                ..Default::default()
            },
        );
        let shapes = op.output_shapes(&[Shape::new(&[2, 3, 8, 6])]).unwrap();
        assert_eq!(shapes[0].dims(), &[2, 3, 4, 3]);
    }

    #[test]
    fn test_ignore_border_false_unsupported() {
        let mut p = param(2, 2, 0);
        p.ignore_border = false;
        let err = Pooling::new(PoolMode::Max, p)
            .output_shapes(&[Shape::new(&[1, 1, 4, 4])])
            .unwrap_err();
        assert!(matches!(err, NnrtError::Unsupported(_)));
    }

    #[test]
    fn test_global_average_pool() {
        let x: Vec<f32> = (0..12).map(|v| v as f32).collect();
        let (shape, y) = run(&mut GlobalAveragePooling::new(), Shape::new(&[1, 3, 2, 2]), x);
        assert_eq!(shape.dims(), &[1, 3, 1, 1]);
        assert_eq!(y, vec![1.5, 5.5, 9.5]);
    }
}
