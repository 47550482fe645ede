//! int8 GEMM with per-row requantization
//!
//! Operands use the same packed layouts as the float path. Products
//! accumulate in `i32`; each output row `r` is rescaled with its own
//! `(multiplier, shift)` and shifted by the output zero point.
//!
//! The input zero point is not subtracted inside the loop. It is folded
//! into the bias once at init with [`fold_zero_point`], which is exact for
//! symmetric weights.

use super::{col_block, row_block, MR};
use crate::parallel::{parallel_chunks_mut, WorkerPool};
use crate::quant::requantize;

/// Per-row output rescaling of an int8 GEMM
#[derive(Debug, Clone, Copy)]
pub struct Requant<'a> {
    /// i32 bias per row, zero point already folded in
    pub bias: &'a [i32],
    /// `(multiplier, shift)` per row
    pub scales: &'a [(i32, i32)],
    pub out_zp: i32,
}

/// `bias[r] - in_zp * sum_k w[r][k]` for row-major `weights[m x k]`
pub fn fold_zero_point(weights: &[i8], bias: &[i32], m: usize, k: usize, in_zp: i32) -> Vec<i32> {
    (0..m)
        .map(|r| {
            let wsum: i32 = weights[r * k..(r + 1) * k].iter().map(|&w| w as i32).sum();
            bias.get(r).copied().unwrap_or(0).wrapping_sub(in_zp.wrapping_mul(wsum))
        })
        .collect()
}

#[inline]
#[allow(clippy::too_many_arguments)]
fn tile_i8(
    a: &[i8],
    b_pack: &[i8],
    rq: &Requant<'_>,
    rows: &mut [i8],
    (r, b): (usize, usize),
    (c, w): (usize, usize),
    k: usize,
    n: usize,
    acc: &mut [i32],
) {
    let acc = &mut acc[..b * w];
    for i in 0..b {
        acc[i * w..(i + 1) * w].fill(rq.bias[r + i]);
    }
    let a_blk = &a[r * k..(r + b) * k];
    let b_blk = &b_pack[c * k..(c + w) * k];
    for kk in 0..k {
        let a_col = &a_blk[kk * b..(kk + 1) * b];
        let b_row = &b_blk[kk * w..(kk + 1) * w];
        for (i, &av) in a_col.iter().enumerate() {
            let av = av as i32;
            for (o, &bv) in acc[i * w..(i + 1) * w].iter_mut().zip(b_row) {
                *o += av * bv as i32;
            }
        }
    }
    for i in 0..b {
        let (mult, shift) = rq.scales[r + i];
        let dst = &mut rows[i * n + c..i * n + c + w];
        for (j, d) in dst.iter_mut().enumerate() {
            *d = requantize::<i8>(acc[i * w + j], mult, shift, rq.out_zp);
        }
    }
}

/// `dst[m x n] = requant(A * B + bias)` on packed int8 operands
#[allow(clippy::too_many_arguments)]
pub fn gemm_packed_i8(
    pool: &dyn WorkerPool,
    dst: &mut [i8],
    a: &[i8],
    b_pack: &[i8],
    rq: &Requant<'_>,
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
        let mut acc = vec![0i32; MR * nr.max(1)];
        let r0 = chunk_idx * MR;
        let r_end = r0 + rows.len() / n;
        let mut r = r0;
        while r < r_end {
            let b = row_block(m, r);
            let sub = &mut rows[(r - r0) * n..(r - r0 + b) * n];
            let mut c = 0;
            while c < n {
                let w = col_block(n, c, nr);
                tile_i8(a, b_pack, rq, sub, (r, b), (c, w), k, n, &mut acc);
                c += w;
            }
            r += b;
        }
    });
}
