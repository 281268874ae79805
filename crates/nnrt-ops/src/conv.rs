//! Convolution family over `[B, C, H, W]` tensors.
//!
//! Convolution lowers to unfold + batched matmul; deconvolution to a
//! transposed matmul + fold; depthwise convolution to unfold + a per-channel
//! reduction.

use nnrt_core::{NnrtError, Payload, Result, Shape};
use nnrt_kernels::matmul::batch_matmul_kernel;
use nnrt_kernels::unfold::{col2im_kernel, im2col_kernel};
use nnrt_kernels::{deconv_output_size, Compiler, Kernel, Window};
use serde::Deserialize;

use crate::operator::{check_inputs, not_setup, pair, Op};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConvolutionParam {
    pub base_axis: i64,
    pub pad: Vec<usize>,
    pub stride: Vec<usize>,
    pub dilation: Vec<usize>,
    pub group: usize,
    pub channel_last: bool,
}

impl Default for ConvolutionParam {
    fn default() -> Self {
        Self {
            base_axis: 1,
            pad: vec![0, 0],
            stride: vec![1, 1],
            dilation: vec![1, 1],
            group: 1,
            channel_last: false,
        }
    }
}

impl ConvolutionParam {
    /// `(stride, pad)` after rejecting the configurations nnrt does not run.
    fn spatial(&self, kind: &str) -> Result<([usize; 2], [usize; 2])> {
        if self.channel_last {
            return Err(NnrtError::Unsupported(format!("{kind}: channel_last")));
        }
        if self.group != 1 {
            return Err(NnrtError::Unsupported(format!("{kind}: group={}", self.group)));
        }
        check_dilation(kind, &self.dilation)?;
        Ok((pair(kind, "stride", &self.stride)?, pair(kind, "pad", &self.pad)?))
    }
}

/// Only the channel axis directly ahead of the two spatial axes is supported.
fn check_base_axis(kind: &str, base_axis: i64, x: &Shape) -> Result<()> {
    let channel_axis = x.ndim().checked_sub(3);
    if channel_axis.is_none() || x.resolve_axis(base_axis) != channel_axis {
        return Err(NnrtError::Unsupported(format!(
            "{kind}: base_axis={base_axis} for {x}, only the axis before H and W is supported"
        )));
    }
    Ok(())
}

fn check_dilation(kind: &str, dilation: &[usize]) -> Result<()> {
    if dilation.iter().any(|&d| d != 1) {
        return Err(NnrtError::Unsupported(format!("{kind}: dilation={dilation:?}")));
    }
    Ok(())
}

fn weight_mismatch(kind: &str, expected: Vec<usize>, w: &Shape) -> NnrtError {
    NnrtError::ShapeMismatch {
        context: format!("{kind} weight"),
        expected,
        got: w.to_vec(),
    }
}

fn check_bias(kind: &str, inputs: &[Shape], channels: usize) -> Result<()> {
    match inputs.get(2) {
        Some(b) if b.numel() != channels => Err(NnrtError::ShapeMismatch {
            context: format!("{kind} bias"),
            expected: vec![channels],
            got: b.to_vec(),
        }),
        _ => Ok(()),
    }
}

/// Adds `b[c]` to every element of channel `c` in a `[B, C, L]` tensor.
fn channel_bias_kernel(compiler: &Compiler, batch: usize, channels: usize, l: usize) -> Kernel {
    let n = batch * channels * l;
    compiler
        .element("channel_bias", n, move |i, args| args[0][i] + args[1][(i / l) % channels])
        .with_arg_lens(&[n, channels])
}

// ============================================================================
// Convolution
// ============================================================================

#[derive(Debug)]
struct ConvKernels {
    im2col: Kernel,
    matmul: Kernel,
    bias: Option<Kernel>,
}

/// 2-D convolution. Weight `[OC, C, kH, kW]`, optional bias `[OC]`.
#[derive(Debug)]
pub struct Convolution {
    param: ConvolutionParam,
    kernels: Option<ConvKernels>,
}

impl Convolution {
    pub fn new(param: ConvolutionParam) -> Self {
        Self {
            param,
            kernels: None,
        }
    }

    fn window(&self, x: &Shape, w: &Shape) -> Result<(Window, usize)> {
        let (stride, pad) = self.param.spatial(self.kind())?;
        check_base_axis(self.kind(), self.param.base_axis, x)?;
        let &[oc, c, kh, kw] = w.dims() else {
            return Err(weight_mismatch(self.kind(), vec![0, x.dim(1).unwrap_or(0), 0, 0], w));
        };
        let window = Window::new(x.dims(), [kh, kw], stride, pad)?;
        if c != window.channels {
            return Err(weight_mismatch(self.kind(), vec![oc, window.channels, kh, kw], w));
        }
        Ok((window, oc))
    }
}

impl Op for Convolution {
    fn kind(&self) -> &'static str {
        "Convolution"
    }

    fn output_shapes(&self, inputs: &[Shape]) -> Result<Vec<Shape>> {
        check_inputs(self.kind(), inputs.len(), 2, 3)?;
        let (window, oc) = self.window(&inputs[0], &inputs[1])?;
        check_bias(self.kind(), inputs, oc)?;
        Ok(vec![Shape::from(window.output_shape(oc))])
    }

    fn setup(&mut self, compiler: &Compiler, inputs: &[Shape], _outputs: &[Shape]) -> Result<()> {
        let (window, oc) = self.window(&inputs[0], &inputs[1])?;
        let [b, c, k, l] = window.unfolded_shape();

        let im2col = im2col_kernel(compiler, &window, 0.0);
        // [1, OC, C·K] @ [B, C·K, L] -> [B, OC, L]
        let (matmul, _) = batch_matmul_kernel(compiler, [1, oc, c * k], [b, c * k, l], false, false)?;
        let bias = (inputs.len() == 3).then(|| channel_bias_kernel(compiler, b, oc, l));

        self.kernels = Some(ConvKernels { im2col, matmul, bias });
        Ok(())
    }

    fn forward(&self, inputs: &[&Payload]) -> Result<Vec<Payload>> {
        let kernels = self.kernels.as_ref().ok_or_else(|| not_setup(self.kind()))?;
        let cols = kernels.im2col.dispatch(&[inputs[0]])?;
        let mut y = kernels.matmul.dispatch(&[inputs[1], &cols])?;
        if let (Some(bias), Some(&b)) = (&kernels.bias, inputs.get(2)) {
            y = bias.dispatch(&[&y, b])?;
        }
        Ok(vec![y])
    }

    fn constant_inputs(&self) -> &'static [usize] {
        &[1, 2]
    }
}

// ============================================================================
// Deconvolution
// ============================================================================

#[derive(Debug)]
struct DeconvKernels {
    matmul: Kernel,
    col2im: Kernel,
    bias: Option<Kernel>,
}

struct DeconvGeometry {
    batch: usize,
    channels: usize,
    in_hw: [usize; 2],
    out_channels: usize,
    kernel: [usize; 2],
    stride: [usize; 2],
    pad: [usize; 2],
    out_hw: [usize; 2],
}

/// Transposed 2-D convolution. Weight `[C, OC, kH, kW]`, optional bias `[OC]`.
#[derive(Debug)]
pub struct Deconvolution {
    param: ConvolutionParam,
    kernels: Option<DeconvKernels>,
}

impl Deconvolution {
    pub fn new(param: ConvolutionParam) -> Self {
        Self {
            param,
            kernels: None,
        }
    }

    fn geometry(&self, x: &Shape, w: &Shape) -> Result<DeconvGeometry> {
        let (stride, pad) = self.param.spatial(self.kind())?;
        check_base_axis(self.kind(), self.param.base_axis, x)?;
        let &[batch, channels, h, wd] = x.dims() else {
            return Err(NnrtError::Unsupported(format!(
                "Deconvolution only supports [B, C, H, W] inputs, got {x}"
            )));
        };
        let &[wc, out_channels, kh, kw] = w.dims() else {
            return Err(weight_mismatch(self.kind(), vec![channels, 0, 0, 0], w));
        };
        if wc != channels {
            return Err(weight_mismatch(self.kind(), vec![channels, out_channels, kh, kw], w));
        }
        let out_hw = [
            deconv_output_size(h, kh, stride[0], pad[0])?,
            deconv_output_size(wd, kw, stride[1], pad[1])?,
        ];
        Ok(DeconvGeometry {
            batch,
            channels,
            in_hw: [h, wd],
            out_channels,
            kernel: [kh, kw],
            stride,
            pad,
            out_hw,
        })
    }
}

impl Op for Deconvolution {
    fn kind(&self) -> &'static str {
        "Deconvolution"
    }

    fn output_shapes(&self, inputs: &[Shape]) -> Result<Vec<Shape>> {
        check_inputs(self.kind(), inputs.len(), 2, 3)?;
        let g = self.geometry(&inputs[0], &inputs[1])?;
        check_bias(self.kind(), inputs, g.out_channels)?;
        Ok(vec![Shape::from([g.batch, g.out_channels, g.out_hw[0], g.out_hw[1]])])
    }

    fn setup(&mut self, compiler: &Compiler, inputs: &[Shape], _outputs: &[Shape]) -> Result<()> {
        let g = self.geometry(&inputs[0], &inputs[1])?;
        let k = g.kernel[0] * g.kernel[1];
        let l = g.in_hw[0] * g.in_hw[1];

        // [1, C, OC·K]ᵀ @ [B, C, H·W] -> [B, OC·K, H·W]
        let (matmul, _) = batch_matmul_kernel(
            compiler,
            [1, g.channels, g.out_channels * k],
            [g.batch, g.channels, l],
            true,
            false,
        )?;
        let col2im = col2im_kernel(
            compiler,
            g.batch,
            g.out_channels,
            g.in_hw,
            g.out_hw,
            g.kernel,
            g.stride,
            g.pad,
        )?;
        let bias = (inputs.len() == 3)
            .then(|| channel_bias_kernel(compiler, g.batch, g.out_channels, g.out_hw[0] * g.out_hw[1]));

        self.kernels = Some(DeconvKernels { matmul, col2im, bias });
        Ok(())
    }

    fn forward(&self, inputs: &[&Payload]) -> Result<Vec<Payload>> {
        let kernels = self.kernels.as_ref().ok_or_else(|| not_setup(self.kind()))?;
        let cols = kernels.matmul.dispatch(&[inputs[1], inputs[0]])?;
        let mut y = kernels.col2im.dispatch(&[&cols])?;
        if let (Some(bias), Some(&b)) = (&kernels.bias, inputs.get(2)) {
            y = bias.dispatch(&[&y, b])?;
        }
        Ok(vec![y])
    }

    fn constant_inputs(&self) -> &'static [usize] {
        &[1, 2]
    }
}

// ============================================================================
// DepthwiseConvolution
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DepthwiseConvolutionParam {
    pub base_axis: i64,
    pub pad: Vec<usize>,
    pub stride: Vec<usize>,
    pub dilation: Vec<usize>,
    pub multiplier: usize,
}

impl Default for DepthwiseConvolutionParam {
    fn default() -> Self {
        Self {
            base_axis: 1,
            pad: vec![0, 0],
            stride: vec![1, 1],
            dilation: vec![1, 1],
            multiplier: 1,
        }
    }
}

#[derive(Debug)]
struct DepthwiseKernels {
    im2col: Kernel,
    reduce: Kernel,
}

/// Per-channel convolution. Weight `[C, kH, kW]`, optional bias `[C]`.
#[derive(Debug)]
pub struct DepthwiseConvolution {
    param: DepthwiseConvolutionParam,
    kernels: Option<DepthwiseKernels>,
}

impl DepthwiseConvolution {
    pub fn new(param: DepthwiseConvolutionParam) -> Self {
        Self {
            param,
            kernels: None,
        }
    }

    fn window(&self, x: &Shape, w: &Shape) -> Result<Window> {
        let kind = self.kind();
        if self.param.multiplier != 1 {
            return Err(NnrtError::Unsupported(format!(
                "{kind}: multiplier={}",
                self.param.multiplier
            )));
        }
        check_dilation(kind, &self.param.dilation)?;
        check_base_axis(kind, self.param.base_axis, x)?;
        let stride = pair(kind, "stride", &self.param.stride)?;
        let pad = pair(kind, "pad", &self.param.pad)?;

        let &[c, kh, kw] = w.dims() else {
            return Err(weight_mismatch(kind, vec![x.dim(1).unwrap_or(0), 0, 0], w));
        };
        let window = Window::new(x.dims(), [kh, kw], stride, pad)?;
        if c != window.channels {
            return Err(weight_mismatch(kind, vec![window.channels, kh, kw], w));
        }
        Ok(window)
    }
}

impl Op for DepthwiseConvolution {
    fn kind(&self) -> &'static str {
        "DepthwiseConvolution"
    }

    fn output_shapes(&self, inputs: &[Shape]) -> Result<Vec<Shape>> {
        check_inputs(self.kind(), inputs.len(), 2, 3)?;
        let window = self.window(&inputs[0], &inputs[1])?;
        check_bias(self.kind(), inputs, window.channels)?;
        Ok(vec![Shape::from(window.output_shape(window.channels))])
    }

    fn setup(&mut self, compiler: &Compiler, inputs: &[Shape], _outputs: &[Shape]) -> Result<()> {
        let window = self.window(&inputs[0], &inputs[1])?;
        let [b, c, k, l] = window.unfolded_shape();
        let has_bias = inputs.len() == 3;

        let im2col = im2col_kernel(compiler, &window, 0.0);
        // [B, C, K, L] -> [B, C, L]
        let reduce = compiler.element("depthwise_reduce", b * c * l, move |i, args| {
            let (cols, w) = (args[0], args[1]);
            let ch = (i / l) % c;
            let base = (i / l) * k * l + i % l;
            let mut value = 0.0f32;
            for ki in 0..k {
                value += cols[base + ki * l] * w[ch * k + ki];
            }
            if has_bias {
                value += args[2][ch];
            }
            value
        });
        let reduce = if has_bias {
            reduce.with_arg_lens(&[b * c * k * l, c * k, c])
        } else {
            reduce.with_arg_lens(&[b * c * k * l, c * k])
        };

        self.kernels = Some(DepthwiseKernels { im2col, reduce });
        Ok(())
    }

    fn forward(&self, inputs: &[&Payload]) -> Result<Vec<Payload>> {
        let kernels = self.kernels.as_ref().ok_or_else(|| not_setup(self.kind()))?;
        let cols = kernels.im2col.dispatch(&[inputs[0]])?;
        let mut args = vec![&cols];
        args.extend_from_slice(&inputs[1..]);
        Ok(vec![kernels.reduce.dispatch(&args)?])
    }

    fn constant_inputs(&self) -> &'static [usize] {
        &[1, 2]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nnrt_core::DeviceContext;

    fn run(op: &mut dyn Op, shapes: &[Shape], inputs: &[Vec<f32>]) -> (Shape, Vec<f32>) {
        let compiler = Compiler::new(DeviceContext::new(), true);
        let outputs = op.output_shapes(shapes).unwrap();
        op.setup(&compiler, shapes, &outputs).unwrap();
        let payloads: Vec<Payload> = inputs.iter().cloned().map(Payload::from).collect();
        let refs: Vec<&Payload> = payloads.iter().collect();
        let y = op.forward(&refs).unwrap()[0].to_host().unwrap();
        (outputs[0].clone(), y)
    }

    /// Direct nested-loop convolution.
    fn naive_conv(
        x: &[f32],
        [b, c, h, w]: [usize; 4],
        wt: &[f32],
        [oc, kh, kw]: [usize; 3],
        stride: usize,
        pad: usize,
    ) -> Vec<f32> {
        let oh = (h + 2 * pad - kh) / stride + 1;
        let ow = (w + 2 * pad - kw) / stride + 1;
        let mut y = vec![0.0; b * oc * oh * ow];
        for bi in 0..b {
            for o in 0..oc {
                for i in 0..oh {
                    for j in 0..ow {
                        let mut acc = 0.0;
                        for ci in 0..c {
                            for u in 0..kh {
                                for v in 0..kw {
                                    let ih = (i * stride + u) as isize - pad as isize;
                                    let iw = (j * stride + v) as isize - pad as isize;
                                    if ih < 0 || iw < 0 || ih as usize >= h || iw as usize >= w {
                                        continue;
                                    }
                                    acc += x[((bi * c + ci) * h + ih as usize) * w + iw as usize]
                                        * wt[((o * c + ci) * kh + u) * kw + v];
                                }
                            }
                        }
                        y[((bi * oc + o) * oh + i) * ow + j] = acc;
                    }
                }
            }
        }
        y
    }

    #[test]
    fn test_convolution_matches_naive() {
        let param = ConvolutionParam {
            pad: vec![1, 1],
            stride: vec![2, 2],
            ..Default::default()
        };
        let x: Vec<f32> = (0..2 * 3 * 7 * 7).map(|i| ((i % 13) as f32 - 6.0) * 0.1).collect();
        let w: Vec<f32> = (0..4 * 3 * 3 * 3).map(|i| ((i % 7) as f32 - 3.0) * 0.05).collect();
        let (shape, y) = run(
            &mut Convolution::new(param),
            &[Shape::new(&[2, 3, 7, 7]), Shape::new(&[4, 3, 3, 3])],
            &[x.clone(), w.clone()],
        );
        assert_eq!(shape.dims(), &[2, 4, 4, 4]);
        let expected = naive_conv(&x, [2, 3, 7, 7], &w, [4, 3, 3], 2, 1);
        for (a, b) in y.iter().zip(&expected) {
            assert!((a - b).abs() < 1e-5, "{a} vs {b}");
        }
    }

    #[test]
    fn test_convolution_bias() {
        let (_, y) = run(
            &mut Convolution::new(ConvolutionParam::default()),
            &[Shape::new(&[1, 1, 2, 2]), Shape::new(&[2, 1, 1, 1]), Shape::new(&[2])],
            &[vec![1.0, 2.0, 3.0, 4.0], vec![1.0, -1.0], vec![10.0, 20.0]],
        );
        assert_eq!(y, vec![11.0, 12.0, 13.0, 14.0, 19.0, 18.0, 17.0, 16.0]);
    }

    #[test]
    fn test_convolution_rejects_unsupported() {
        let shapes = [Shape::new(&[1, 2, 4, 4]), Shape::new(&[2, 1, 3, 3])];
        let grouped = Convolution::new(ConvolutionParam {
            group: 2,
            ..Default::default()
        });
        assert!(matches!(grouped.output_shapes(&shapes), Err(NnrtError::Unsupported(_))));

        let dilated = Convolution::new(ConvolutionParam {
            dilation: vec![2, 2],
            ..Default::default()
        });
        assert!(matches!(dilated.output_shapes(&shapes), Err(NnrtError::Unsupported(_))));

        let channel_last = Convolution::new(ConvolutionParam {
            channel_last: true,
            ..Default::default()
        });
        assert!(matches!(channel_last.output_shapes(&shapes), Err(NnrtError::Unsupported(_))));
    }

    #[test]
    fn test_base_axis_must_precede_spatial_axes() {
        let shapes = [Shape::new(&[1, 2, 4, 4]), Shape::new(&[2, 2, 3, 3])];
        let end_relative = Convolution::new(ConvolutionParam {
            base_axis: -3,
            ..Default::default()
        });
        assert_eq!(end_relative.output_shapes(&shapes).unwrap()[0].dims(), &[1, 2, 2, 2]);

        for base_axis in [0, 2] {
            let conv = Convolution::new(ConvolutionParam {
                base_axis,
                ..Default::default()
            });
            assert!(matches!(conv.output_shapes(&shapes), Err(NnrtError::Unsupported(_))));

            let deconv = Deconvolution::new(ConvolutionParam {
                base_axis,
                ..Default::default()
            });
            assert!(matches!(deconv.output_shapes(&shapes), Err(NnrtError::Unsupported(_))));

            let depthwise = DepthwiseConvolution::new(DepthwiseConvolutionParam {
                base_axis,
                ..Default::default()
            });
            let err = depthwise
                .output_shapes(&[Shape::new(&[1, 2, 4, 4]), Shape::new(&[2, 3, 3])])
                .unwrap_err();
            assert!(matches!(err, NnrtError::Unsupported(_)));
        }
    }

    #[test]
    fn test_deconvolution_output_and_values() {
        // 1x1 input, 2x2 kernel, stride 1: output is the kernel scaled by x
        let (shape, y) = run(
            &mut Deconvolution::new(ConvolutionParam::default()),
            &[Shape::new(&[1, 1, 1, 1]), Shape::new(&[1, 1, 2, 2])],
            &[vec![2.0], vec![1.0, 2.0, 3.0, 4.0]],
        );
        assert_eq!(shape.dims(), &[1, 1, 2, 2]);
        assert_eq!(y, vec![2.0, 4.0, 6.0, 8.0]);

        // overlapping windows sum: 1x1x2x2 ones with a 2x2 ones kernel
        let (shape, y) = run(
            &mut Deconvolution::new(ConvolutionParam::default()),
            &[Shape::new(&[1, 1, 2, 2]), Shape::new(&[1, 1, 2, 2]), Shape::new(&[1])],
            &[vec![1.0; 4], vec![1.0; 4], vec![0.5]],
        );
        assert_eq!(shape.dims(), &[1, 1, 3, 3]);
        assert_eq!(y, vec![1.5, 2.5, 1.5, 2.5, 4.5, 2.5, 1.5, 2.5, 1.5]);
    }

    #[test]
    fn test_deconvolution_shape_formula() {
        let op = Deconvolution::new(ConvolutionParam {
            stride: vec![2, 2],
            pad: vec![1, 1],
            ..Default::default()
        });
        let shapes = op
            .output_shapes(&[Shape::new(&[2, 8, 4, 4]), Shape::new(&[8, 3, 3, 3])])
            .unwrap();
        assert_eq!(shapes[0].dims(), &[2, 3, 7, 7]);
    }

    #[test]
    fn test_depthwise_convolution() {
        // two channels, 2x2 kernels of ones and twos, no padding
        let x: Vec<f32> = (1..=18).map(|v| v as f32).collect();
        let (shape, y) = run(
            &mut DepthwiseConvolution::new(DepthwiseConvolutionParam::default()),
            &[Shape::new(&[1, 2, 3, 3]), Shape::new(&[2, 2, 2]), Shape::new(&[2])],
            &[x, vec![1.0, 1.0, 1.0, 1.0, 2.0, 2.0, 2.0, 2.0], vec![0.0, 1.0]],
        );
        assert_eq!(shape.dims(), &[1, 2, 2, 2]);
        assert_eq!(y, vec![12.0, 16.0, 24.0, 28.0, 97.0, 105.0, 121.0, 129.0]);
    }

    #[test]
    fn test_depthwise_multiplier_unsupported() {
        let op = DepthwiseConvolution::new(DepthwiseConvolutionParam {
            multiplier: 2,
            ..Default::default()
        });
        let err = op
            .output_shapes(&[Shape::new(&[1, 2, 3, 3]), Shape::new(&[2, 2, 2])])
            .unwrap_err();
        assert!(matches!(err, NnrtError::Unsupported(_)));
    }
}
