//! Packed GEMM
//!
//! `C[m x n] = A[m x k] * B[k x n] (+ bias per row)`, row-major C. Both
//! operands are reordered before the multiply so the micro-kernel reads
//! them sequentially:
//!
//! * A ("n-block", the convolution kernel): rows are grouped in blocks of
//!   [`MR`], then 4, 2, 1 for the tail. Block `b` rows tall starting at row
//!   `r` sits at offset `r * k`; for each `kk` its `b` values are
//!   contiguous.
//! * B ("z-block", the im2col columns): columns are grouped in blocks of
//!   `nr`. For each `kk` the block's `nr` values are contiguous; tail
//!   columns are stored one at a time.
//!
//! The micro-kernel computes one `b x w` tile with accumulation in `f32`
//! (float types) or `i32` (int8, see [`int8`]).

pub mod int8;

use crate::kernels::FloatElement;
use crate::parallel::{parallel_chunks_mut, WorkerPool};

/// Row block height of the packed A operand
pub const MR: usize = 8;

/// Height of the row block starting at row `r` of `m`
#[inline]
pub fn row_block(m: usize, r: usize) -> usize {
    match m - r {
        rem if rem >= MR => MR,
        rem if rem >= 4 => 4,
        rem if rem >= 2 => 2,
        _ => 1,
    }
}

/// Width of the column block starting at column `c` of `n`
#[inline]
pub fn col_block(n: usize, c: usize, nr: usize) -> usize {
    if nr > 0 && c + nr <= n {
        nr
    } else {
        1
    }
}

/// Reorder row-major `src[m x k]` into the n-block layout
pub fn reorder_kernel<T: Copy>(src: &[T], dst: &mut [T], m: usize, k: usize) {
    let mut r = 0;
    while r < m {
        let b = row_block(m, r);
        let block = &mut dst[r * k..(r + b) * k];
        for kk in 0..k {
            for i in 0..b {
                block[kk * b + i] = src[(r + i) * k + kk];
            }
        }
        r += b;
    }
}

/// Reorder row-major `src[k x n]` into the z-block layout
pub fn reorder_input<T: Copy>(src: &[T], dst: &mut [T], k: usize, n: usize, nr: usize) {
    let mut c = 0;
    while c < n {
        let w = col_block(n, c, nr);
        let block = &mut dst[c * k..(c + w) * k];
        for kk in 0..k {
            block[kk * w..(kk + 1) * w].copy_from_slice(&src[kk * n + c..kk * n + c + w]);
        }
        c += w;
    }
}

/// One `b x w` tile of C at (row `r`, column `c`), `f32` accumulation
#[inline]
#[allow(clippy::too_many_arguments)]
fn tile_f32<T: FloatElement>(
    a: &[T],
    b_pack: &[T],
    bias: Option<&[f32]>,
    rows: &mut [T],
    (r, b): (usize, usize),
    (c, w): (usize, usize),
    k: usize,
    n: usize,
    acc: &mut [f32],
) {
    let acc = &mut acc[..b * w];
    acc.iter_mut().for_each(|v| *v = 0.0);
    let a_blk = &a[r * k..(r + b) * k];
    let b_blk = &b_pack[c * k..(c + w) * k];
    for kk in 0..k {
        let a_col = &a_blk[kk * b..(kk + 1) * b];
        let b_row = &b_blk[kk * w..(kk + 1) * w];
        for (i, av) in a_col.iter().enumerate() {
            let av = av.to_f32();
            let acc_row = &mut acc[i * w..(i + 1) * w];
            for (o, bv) in acc_row.iter_mut().zip(b_row) {
                *o += av * bv.to_f32();
            }
        }
    }
    for i in 0..b {
        let bias_v = bias.map_or(0.0, |bs| bs[r + i]);
        let dst = &mut rows[i * n + c..i * n + c + w];
        for (j, d) in dst.iter_mut().enumerate() {
            *d = T::from_f32(acc[i * w + j] + bias_v);
        }
    }
}

/// `dst[m x n] = A * B + bias` on packed operands.
///
/// `a` is n-block packed `m x k`, `b_pack` z-block packed `k x n` with
/// block width `nr`. Row blocks of [`MR`] are spread over `pool`.
#[allow(clippy::too_many_arguments)]
pub fn gemm_packed<T: FloatElement>(
    pool: &dyn WorkerPool,
    dst: &mut [T],
    a: &[T],
    b_pack: &[T],
    bias: Option<&[f32]>,
    m: usize,
    k: usize,
    n: usize,
    nr: usize,
) {
    if m == 0 || n == 0 {
        return;
    }
    let dst = &mut dst[..m * n];
    parallel_chunks_mut(pool, dst, MR * n, &|chunk_idx, rows| {
        let mut acc = vec![0.0f32; MR * nr.max(1)];
        let r0 = chunk_idx * MR;
        let r_end = r0 + rows.len() / n;
        let mut r = r0;
        while r < r_end {
            let b = row_block(m, r);
            let sub = &mut rows[(r - r0) * n..(r - r0 + b) * n];
            let mut c = 0;
            while c < n {
                let w = col_block(n, c, nr);
                tile_f32(a, b_pack, bias, sub, (r, b), (c, w), k, n, &mut acc);
                c += w;
            }
            r += b;
        }
    });
}

/// Unpacked row-major GEMM used to check the packed path
pub fn gemm_naive(a: &[f32], b: &[f32], bias: Option<&[f32]>, m: usize, k: usize, n: usize) -> Vec<f32> {
    let mut c = vec![0.0f32; m * n];
    for i in 0..m {
        for j in 0..n {
            let mut sum = bias.map_or(0.0, |bs| bs[i]);
            for l in 0..k {
                sum += a[i * k + l] * b[l * n + j];
            }
            c[i * n + j] = sum;
        }
    }
    c
}
