//! Winograd 3x3 stride-1 convolution
//!
//! `Y = Aᵀ [(G g Gᵀ) ⊙ (Bᵀ d B)] A` per output tile. The kernel transform
//! `U = G g Gᵀ` runs once at init and is stored channel-packed:
//! `[out_c / packn][t*t][in_c][packn]`, so the per-tile dot product over
//! input channels reads `packn` output channels at a time.
//!
//! Float kernels use F(6x6, 3x3) or F(4x4, 3x3). int8 uses an integer
//! scaled F(4x4, 3x3) (see [`int8`]).

pub mod float;
pub mod int8;

use crate::params::WinogradTile;
use std::ops::{Add, Mul};

/// Transform matrices of one F(m x m, 3 x 3) variant, row-major
#[derive(Debug)]
pub struct Transform {
    /// Output tile side
    pub m: usize,
    /// Input tile side, `m + 2`
    pub t: usize,
    /// Kernel transform, `t x 3`
    pub g: &'static [f32],
    /// Input transform, `t x t`
    pub bt: &'static [f32],
    /// Output transform, `m x t`
    pub at: &'static [f32],
}

#[rustfmt::skip]
const G63: [f32; 24] = [
    1.0,          0.0,          0.0,
    -2.0 / 9.0,   -2.0 / 9.0,   -2.0 / 9.0,
    -2.0 / 9.0,   2.0 / 9.0,    -2.0 / 9.0,
    1.0 / 90.0,   1.0 / 45.0,   2.0 / 45.0,
    1.0 / 90.0,   -1.0 / 45.0,  2.0 / 45.0,
    1.0 / 45.0,   1.0 / 90.0,   1.0 / 180.0,
    1.0 / 45.0,   -1.0 / 90.0,  1.0 / 180.0,
    0.0,          0.0,          1.0,
];

#[rustfmt::skip]
const BT63: [f32; 64] = [
    1.0,  0.0,  -5.25, 0.0,   5.25,  0.0,   -1.0, 0.0,
    0.0,  1.0,  1.0,   -4.25, -4.25, 1.0,   1.0,  0.0,
    0.0,  -1.0, 1.0,   4.25,  -4.25, -1.0,  1.0,  0.0,
    0.0,  0.5,  0.25,  -2.5,  -1.25, 2.0,   1.0,  0.0,
    0.0,  -0.5, 0.25,  2.5,   -1.25, -2.0,  1.0,  0.0,
    0.0,  2.0,  4.0,   -2.5,  -5.0,  0.5,   1.0,  0.0,
    0.0,  -2.0, 4.0,   2.5,   -5.0,  -0.5,  1.0,  0.0,
    0.0,  -1.0, 0.0,   5.25,  0.0,   -5.25, 0.0,  1.0,
];

#[rustfmt::skip]
const AT63: [f32; 48] = [
    1.0, 1.0,  1.0,  1.0,  1.0,   32.0, 32.0,  0.0,
    0.0, 1.0,  -1.0, 2.0,  -2.0,  16.0, -16.0, 0.0,
    0.0, 1.0,  1.0,  4.0,  4.0,   8.0,  8.0,   0.0,
    0.0, 1.0,  -1.0, 8.0,  -8.0,  4.0,  -4.0,  0.0,
    0.0, 1.0,  1.0,  16.0, 16.0,  2.0,  2.0,   0.0,
    0.0, 1.0,  -1.0, 32.0, -32.0, 1.0,  -1.0,  1.0,
];

#[rustfmt::skip]
const G43: [f32; 18] = [
    1.0 / 4.0,   0.0,         0.0,
    -1.0 / 6.0,  -1.0 / 6.0,  -1.0 / 6.0,
    -1.0 / 6.0,  1.0 / 6.0,   -1.0 / 6.0,
    1.0 / 24.0,  1.0 / 12.0,  1.0 / 6.0,
    1.0 / 24.0,  -1.0 / 12.0, 1.0 / 6.0,
    0.0,         0.0,         1.0,
];

#[rustfmt::skip]
const BT43: [f32; 36] = [
    4.0, 0.0,  -5.0, 0.0,  1.0, 0.0,
    0.0, -4.0, -4.0, 1.0,  1.0, 0.0,
    0.0, 4.0,  -4.0, -1.0, 1.0, 0.0,
    0.0, -2.0, -1.0, 2.0,  1.0, 0.0,
    0.0, 2.0,  -1.0, -2.0, 1.0, 0.0,
    0.0, 4.0,  0.0,  -5.0, 0.0, 1.0,
];

#[rustfmt::skip]
const AT43: [f32; 24] = [
    1.0, 1.0, 1.0,  1.0, 1.0,  0.0,
    0.0, 1.0, -1.0, 2.0, -2.0, 0.0,
    0.0, 1.0, 1.0,  4.0, 4.0,  0.0,
    0.0, 1.0, -1.0, 8.0, -8.0, 1.0,
];

pub const F63: Transform = Transform {
    m: 6,
    t: 8,
    g: &G63,
    bt: &BT63,
    at: &AT63,
};

pub const F43: Transform = Transform {
    m: 4,
    t: 6,
    g: &G43,
    bt: &BT43,
    at: &AT43,
};

impl Transform {
    pub fn for_tile(tile: WinogradTile) -> &'static Transform {
        match tile {
            WinogradTile::F63 => &F63,
            WinogradTile::F43 => &F43,
        }
    }

    /// Elements per transformed tile
    pub fn tt(&self) -> usize {
        self.t * self.t
    }
}

/// `out[rows x rows] = a[rows x n] * x[n x n] * aᵀ`, `n <= 8`
pub fn sandwich<T>(a: &[T], rows: usize, n: usize, x: &[T], out: &mut [T])
where
    T: Copy + Default + Add<Output = T> + Mul<Output = T>,
{
    let mut tmp = [T::default(); 64];
    for i in 0..rows {
        for j in 0..n {
            let mut s = T::default();
            for l in 0..n {
                s = s + a[i * n + l] * x[l * n + j];
            }
            tmp[i * n + j] = s;
        }
    }
    for i in 0..rows {
        for j in 0..rows {
            let mut s = T::default();
            for l in 0..n {
                s = s + tmp[i * n + l] * a[j * n + l];
            }
            out[i * rows + j] = s;
        }
    }
}

/// Tile grid of one convolution: `blocks_h x blocks_w` output tiles and
/// the zero-extended input plane that covers them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGrid {
    pub blocks_h: usize,
    pub blocks_w: usize,
    pub padded_h: usize,
    pub padded_w: usize,
}

impl TileGrid {
    pub fn new(out_h: usize, out_w: usize, m: usize) -> Self {
        let blocks_h = out_h.div_ceil(m);
        let blocks_w = out_w.div_ceil(m);
        TileGrid {
            blocks_h,
            blocks_w,
            padded_h: blocks_h * m + 2,
            padded_w: blocks_w * m + 2,
        }
    }

    pub fn tiles(&self) -> usize {
        self.blocks_h * self.blocks_w
    }

    /// Copy one `t x t` input tile of `plane` (`padded_h x padded_w`)
    pub fn gather<T: Copy>(&self, plane: &[T], tile: usize, m: usize, t: usize, dst: &mut [T]) {
        let y0 = (tile / self.blocks_w) * m;
        let x0 = (tile % self.blocks_w) * m;
        for r in 0..t {
            let row = (y0 + r) * self.padded_w + x0;
            dst[r * t..(r + 1) * t].copy_from_slice(&plane[row..row + t]);
        }
    }
}

/// Copy `[c, h, w]` planes into zero-extended `[c, ph, pw]` planes at
/// offset `(top, left)`, mapping every value through `f`
#[allow(clippy::too_many_arguments)]
pub fn pad_planes<S: Copy, D: Copy>(
    src: &[S],
    dst: &mut [D],
    c: usize,
    (h, w): (usize, usize),
    (ph, pw): (usize, usize),
    (top, left): (usize, usize),
    f: impl Fn(S) -> D,
) {
    for ch in 0..c {
        for y in 0..h.min(ph.saturating_sub(top)) {
            let s = &src[(ch * h + y) * w..(ch * h + y) * w + w.min(pw.saturating_sub(left))];
            let d0 = (ch * ph + top + y) * pw + left;
            for (d, &v) in dst[d0..d0 + s.len()].iter_mut().zip(s) {
                *d = f(v);
            }
        }
    }
}
