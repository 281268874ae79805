//! Unfold (im2col) and fold (col2im) kernels for `[B, C, H, W]` tensors.
//!
//! Unfold gathers, for each output location and kernel offset, the input
//! value under the window, producing `[B, C, K, L]` where `K = kH·kW` and
//! `L = oH·oW`. Fold is the scatter-add inverse used by deconvolution.

use nnrt_core::{NnrtError, Result};

use crate::kernel::{Compiler, Kernel};

/// Output extent of a strided window: `floor((input + 2·pad − kernel) / stride) + 1`.
pub fn conv_output_size(input: usize, kernel: usize, stride: usize, pad: usize) -> Result<usize> {
    if stride == 0 {
        return Err(NnrtError::Unsupported("stride of 0".into()));
    }
    if kernel == 0 || input + 2 * pad < kernel {
        return Err(NnrtError::ShapeMismatch {
            context: "window larger than padded input".into(),
            expected: vec![input + 2 * pad],
            got: vec![kernel],
        });
    }
    Ok((input + 2 * pad - kernel) / stride + 1)
}

/// Output extent of a transposed window: `(input − 1)·stride − 2·pad + kernel`.
pub fn deconv_output_size(input: usize, kernel: usize, stride: usize, pad: usize) -> Result<usize> {
    let full = input.saturating_sub(1) * stride + kernel;
    if input == 0 || full <= 2 * pad {
        return Err(NnrtError::ShapeMismatch {
            context: "transposed window leaves no output".into(),
            expected: vec![2 * pad + 1],
            got: vec![full],
        });
    }
    Ok(full - 2 * pad)
}

/// Window geometry over a `[B, C, H, W]` input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub batch: usize,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub kernel: [usize; 2],
    pub stride: [usize; 2],
    pub pad: [usize; 2],
    pub out_h: usize,
    pub out_w: usize,
}

impl Window {
    pub fn new(input: &[usize], kernel: [usize; 2], stride: [usize; 2], pad: [usize; 2]) -> Result<Self> {
        let [batch, channels, height, width] = match input {
            &[b, c, h, w] => [b, c, h, w],
            _ => {
                return Err(NnrtError::Unsupported(format!(
                    "unfold only supports [B, C, H, W] inputs, got {input:?}"
                )))
            }
        };
        let out_h = conv_output_size(height, kernel[0], stride[0], pad[0])?;
        let out_w = conv_output_size(width, kernel[1], stride[1], pad[1])?;
        Ok(Self {
            batch,
            channels,
            height,
            width,
            kernel,
            stride,
            pad,
            out_h,
            out_w,
        })
    }

    /// Kernel positions per window.
    pub fn k(&self) -> usize {
        self.kernel[0] * self.kernel[1]
    }

    /// Output positions per channel.
    pub fn l(&self) -> usize {
        self.out_h * self.out_w
    }

    /// `[B, C, K, L]`.
    pub fn unfolded_shape(&self) -> [usize; 4] {
        [self.batch, self.channels, self.k(), self.l()]
    }

    /// `[B, channels, oH, oW]`.
    pub fn output_shape(&self, channels: usize) -> [usize; 4] {
        [self.batch, channels, self.out_h, self.out_w]
    }

    /// Number of kernel positions of window `l` that land inside the input.
    pub fn valid_count(&self, l: usize) -> usize {
        let (oh, ow) = (l / self.out_w, l % self.out_w);
        let rows = axis_overlap(oh, self.stride[0], self.pad[0], self.kernel[0], self.height);
        let cols = axis_overlap(ow, self.stride[1], self.pad[1], self.kernel[1], self.width);
        rows * cols
    }
}

fn axis_overlap(out: usize, stride: usize, pad: usize, kernel: usize, extent: usize) -> usize {
    let start = (out * stride) as isize - pad as isize;
    let end = start + kernel as isize;
    let lo = start.max(0);
    let hi = end.min(extent as isize);
    (hi - lo).max(0) as usize
}

/// Unfold `[B, C, H, W]` into `[B, C, K, L]`. Positions outside the input
/// read `fill` (0 for convolution and average pooling, −∞ for max pooling).
pub fn im2col_kernel(compiler: &Compiler, window: &Window, fill: f32) -> Kernel {
    let w = *window;
    let [b, c, k, l] = w.unfolded_shape();
    let plane = w.height * w.width;

    compiler
        .element("im2col", b * c * k * l, move |idx, args| {
            let x = args[0];
            let li = idx % l;
            let ki = (idx / l) % k;
            let bc = idx / (k * l);

            let (oh, ow) = (li / w.out_w, li % w.out_w);
            let (kh, kw) = (ki / w.kernel[1], ki % w.kernel[1]);
            let ih = (oh * w.stride[0] + kh) as isize - w.pad[0] as isize;
            let iw = (ow * w.stride[1] + kw) as isize - w.pad[1] as isize;

            if ih >= 0 && iw >= 0 && (ih as usize) < w.height && (iw as usize) < w.width {
                x[bc * plane + ih as usize * w.width + iw as usize]
            } else {
                fill
            }
        })
        .with_arg_lens(&[b * c * plane])
}

/// Fold `[B, C, K, L]` (L over an `in_hw` grid) back into `[B, C, out_hw]`,
/// summing every kernel-window contribution that lands on a position.
#[allow(clippy::too_many_arguments)]
pub fn col2im_kernel(
    compiler: &Compiler,
    batch: usize,
    channels: usize,
    in_hw: [usize; 2],
    out_hw: [usize; 2],
    kernel: [usize; 2],
    stride: [usize; 2],
    pad: [usize; 2],
) -> Result<Kernel> {
    if stride[0] == 0 || stride[1] == 0 {
        return Err(NnrtError::Unsupported("stride of 0".into()));
    }
    let [in_h, in_w] = in_hw;
    let [out_h, out_w] = out_hw;
    let [k_h, k_w] = kernel;
    let k = k_h * k_w;
    let l = in_h * in_w;
    let out_plane = out_h * out_w;

    let kernel = compiler
        .element("col2im", batch * channels * out_plane, move |idx, args| {
            let x = args[0];
            let bc = idx / out_plane;
            let h = (idx % out_plane) / out_w;
            let w = idx % out_w;
            let base = bc * k * l;

            let mut value = 0.0f32;
            for kh in 0..k_h {
                let th = (h + pad[0]) as isize - kh as isize;
                if th < 0 || th as usize % stride[0] != 0 {
                    continue;
                }
                let ih = th as usize / stride[0];
                if ih >= in_h {
                    continue;
                }
                for kw in 0..k_w {
                    let tw = (w + pad[1]) as isize - kw as isize;
                    if tw < 0 || tw as usize % stride[1] != 0 {
                        continue;
                    }
                    let iw = tw as usize / stride[1];
                    if iw >= in_w {
                        continue;
                    }
                    value += x[base + (kh * k_w + kw) * l + ih * in_w + iw];
                }
            }
            value
        })
        .with_arg_lens(&[batch * channels * k * l]);

    Ok(kernel)
}
