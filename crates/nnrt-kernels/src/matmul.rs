//! Matmul kernels built on the tiled CPU matmul.

use std::borrow::Cow;

use nnrt_core::{NnrtError, Result};
use rayon::prelude::*;

use crate::cpu_matmul::{matmul_unchecked, transpose_2d};
use crate::kernel::{Compiler, Kernel};

/// Batched matmul `[bx, r, c] @ [by, r, c] → [max(bx, by), m, n]`, either
/// operand optionally transposed. A batch of 1 is broadcast against the
/// other operand.
///
/// Returns the kernel and its output shape `[batch, m, n]`.
pub fn batch_matmul_kernel(
    compiler: &Compiler,
    x_shape: [usize; 3],
    y_shape: [usize; 3],
    transpose_x: bool,
    transpose_y: bool,
) -> Result<(Kernel, [usize; 3])> {
    let [x_batch, x_rows, x_cols] = x_shape;
    let [y_batch, y_rows, y_cols] = y_shape;

    if x_batch != 1 && y_batch != 1 && x_batch != y_batch {
        return Err(NnrtError::ShapeMismatch {
            context: "batch matmul batch size".into(),
            expected: vec![x_batch],
            got: vec![y_batch],
        });
    }

    let (m, k) = if transpose_x { (x_cols, x_rows) } else { (x_rows, x_cols) };
    let (k2, n) = if transpose_y { (y_cols, y_rows) } else { (y_rows, y_cols) };
    if k != k2 {
        return Err(NnrtError::ShapeMismatch {
            context: "batch matmul inner dimension".into(),
            expected: vec![k],
            got: vec![k2],
        });
    }

    let batch = x_batch.max(y_batch);
    let x_size = x_rows * x_cols;
    let y_size = y_rows * y_cols;

    let kernel = compiler
        .block("batch_matmul", batch * m * n, move |args, out| {
            if m * n == 0 {
                return;
            }
            out.par_chunks_mut(m * n).enumerate().for_each(|(b, c)| {
                let xb = if x_batch == 1 { 0 } else { b };
                let yb = if y_batch == 1 { 0 } else { b };
                let x = &args[0][xb * x_size..(xb + 1) * x_size];
                let y = &args[1][yb * y_size..(yb + 1) * y_size];
                let x: Cow<'_, [f32]> = if transpose_x {
                    Cow::Owned(transpose_2d(x, x_rows, x_cols))
                } else {
                    Cow::Borrowed(x)
                };
                let y: Cow<'_, [f32]> = if transpose_y {
                    Cow::Owned(transpose_2d(y, y_rows, y_cols))
                } else {
                    Cow::Borrowed(y)
                };
                matmul_unchecked(&x, &y, c, m, k, n);
            });
        })
        .with_arg_lens(&[x_batch * x_size, y_batch * y_size]);

    Ok((kernel, [batch, m, n]))
}

/// Plain 2-D matmul `[m, k] @ [k, n]`.
pub fn matmul_kernel(compiler: &Compiler, m: usize, k: usize, n: usize) -> Result<Kernel> {
    let (kernel, _) = batch_matmul_kernel(compiler, [1, m, k], [1, k, n], false, false)?;
    Ok(kernel)
}
