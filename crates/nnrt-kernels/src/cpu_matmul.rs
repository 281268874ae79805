//! Tiled CPU matrix multiplication over flat row-major buffers.
//!
//! Row blocks are spread over the rayon pool. Inside a block the product is
//! accumulated panel by panel through an axpy strip kernel, AVX2/FMA when
//! the CPU has it.

use nnrt_core::{NnrtError, Result};
use rayon::prelude::*;

use crate::simd::{MatmulPath, SimdCapability};

/// Tile edges. One `TILE_K × TILE_N` panel of `b` is 16 KiB and stays in L1.
const TILE_M: usize = 64;
const TILE_N: usize = 64;
const TILE_K: usize = 64;

/// C = A @ B for `[m, k] @ [k, n] → [m, n]`. `c` is overwritten.
pub fn matmul_f32(a: &[f32], b: &[f32], c: &mut [f32], m: usize, k: usize, n: usize) -> Result<()> {
    check_len("matmul lhs", a, &[m, k])?;
    check_len("matmul rhs", b, &[k, n])?;
    check_len("matmul out", c, &[m, n])?;
    matmul_unchecked(a, b, c, m, k, n);
    Ok(())
}

/// `matmul_f32` for callers that have already validated buffer lengths.
pub(crate) fn matmul_unchecked(a: &[f32], b: &[f32], c: &mut [f32], m: usize, k: usize, n: usize) {
    c.fill(0.0);
    if m == 0 || n == 0 || k == 0 {
        return;
    }

    let path = SimdCapability::detect().matmul_path();
    c.par_chunks_mut(TILE_M * n)
        .enumerate()
        .for_each(|(block, c_rows)| {
            let rows = c_rows.len() / n;
            let a_rows = &a[block * TILE_M * k..(block * TILE_M + rows) * k];
            match path {
                MatmulPath::Avx2Fma => tiled(a_rows, b, c_rows, rows, n, k, axpy_avx2),
                MatmulPath::Scalar => tiled(a_rows, b, c_rows, rows, n, k, axpy_scalar),
            }
        });
}

/// Row-major transpose of a `[rows, cols]` buffer.
pub fn transpose_2d(src: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    let mut dst = vec![0.0f32; rows * cols];
    for i in 0..rows {
        for j in 0..cols {
            dst[j * rows + i] = src[i * cols + j];
        }
    }
    dst
}

fn check_len(what: &str, data: &[f32], dims: &[usize]) -> Result<()> {
    let expected: usize = dims.iter().product();
    if data.len() != expected {
        return Err(NnrtError::size_mismatch(what, dims, data.len()));
    }
    Ok(())
}

/// Cache-blocked `c += a @ b`, handing each `(row, k)` pair's column strip
/// to `axpy`.
fn tiled<F>(a: &[f32], b: &[f32], c: &mut [f32], m: usize, n: usize, k: usize, axpy: F)
where
    F: Fn(f32, &[f32], &mut [f32]),
{
    for j0 in (0..n).step_by(TILE_N) {
        let cols = j0..(j0 + TILE_N).min(n);
        for p0 in (0..k).step_by(TILE_K) {
            for i in 0..m {
                let c_strip = &mut c[i * n..(i + 1) * n][cols.clone()];
                for p in p0..(p0 + TILE_K).min(k) {
                    axpy(a[i * k + p], &b[p * n..(p + 1) * n][cols.clone()], c_strip);
                }
            }
        }
    }
}

/// `y += alpha · x`
fn axpy_scalar(alpha: f32, x: &[f32], y: &mut [f32]) {
    for (y, &x) in y.iter_mut().zip(x) {
        *y += alpha * x;
    }
}

#[cfg(target_arch = "x86_64")]
fn axpy_avx2(alpha: f32, x: &[f32], y: &mut [f32]) {
    // Safety: only selected through `MatmulPath::Avx2Fma`, which requires
    // both features at runtime.
    unsafe { axpy_avx2_fma(alpha, x, y) }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
unsafe fn axpy_avx2_fma(alpha: f32, x: &[f32], y: &mut [f32]) {
    use std::arch::x86_64::*;

    let len = x.len().min(y.len());
    let lanes = len - len % 8;
    let alpha8 = _mm256_set1_ps(alpha);
    for j in (0..lanes).step_by(8) {
        let yp = y.as_mut_ptr().add(j);
        let sum = _mm256_fmadd_ps(alpha8, _mm256_loadu_ps(x.as_ptr().add(j)), _mm256_loadu_ps(yp));
        _mm256_storeu_ps(yp, sum);
    }
    axpy_scalar(alpha, &x[lanes..len], &mut y[lanes..len]);
}

#[cfg(not(target_arch = "x86_64"))]
fn axpy_avx2(alpha: f32, x: &[f32], y: &mut [f32]) {
    axpy_scalar(alpha, x, y);
}
