//! Float Winograd, F(6x6, 3x3) and F(4x4, 3x3)

use super::{pad_planes, sandwich, TileGrid, Transform};
use crate::error::{ShlError, ShlResult};
use crate::kernels::{arg, opt_arg, real_values, FloatElement};
use crate::ops::conv::ConvGeometry;
use crate::params::{OpParams, WinogradTile};
use crate::parallel::parallel_chunks_mut;
use crate::registry::{Kernel, KernelContext};
use crate::tensor::{DType, Layout, Tensor};
use half::f16;
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
pub struct WinogradFloat {
    pub tile: WinogradTile,
    pub packn: usize,
}

/// Transform `[out_c, in_c, 3, 3]` weights into the packed `U` layout
pub fn transform_kernel(weights: &[f32], out_c: usize, in_c: usize, tr: &Transform, packn: usize) -> Vec<f32> {
    let tt = tr.tt();
    let mut u = vec![0.0f32; out_c * in_c * tt];
    let mut ut = [0.0f32; 64];
    let mut g_sq = [0.0f32; 24];
    for oc in 0..out_c {
        let (ob, lane) = (oc / packn, oc % packn);
        for ic in 0..in_c {
            let w = &weights[(oc * in_c + ic) * 9..(oc * in_c + ic + 1) * 9];
            // U = G w Gᵀ, with G being t x 3
            for i in 0..tr.t {
                for j in 0..3 {
                    g_sq[i * 3 + j] = (0..3).map(|l| tr.g[i * 3 + l] * w[l * 3 + j]).sum();
                }
            }
            for i in 0..tr.t {
                for j in 0..tr.t {
                    ut[i * tr.t + j] = (0..3).map(|l| g_sq[i * 3 + l] * tr.g[j * 3 + l]).sum();
                }
            }
            for (e, &v) in ut[..tt].iter().enumerate() {
                u[((ob * tt + e) * in_c + ic) * packn + lane] = v;
            }
        }
    }
    u
}

/// Transform the kernel once and return the Winograd kernel.
///
/// `U` stays in f32 for every activation dtype; the F(6,3) output
/// transform amplifies any rounding in it.
pub fn prepare(
    kernel: &Tensor,
    params: &mut OpParams,
    tile: WinogradTile,
    packn: usize,
) -> ShlResult<Arc<dyn Kernel>> {
    let (out_c, in_c) = (kernel.dim(0), kernel.dim(1));
    if packn == 0 || out_c % packn != 0 {
        return Err(ShlError::InvalidParam(format!(
            "winograd needs out channels {} divisible by {}",
            out_c, packn
        )));
    }
    let tr = Transform::for_tile(tile);
    let u = transform_kernel(&real_values(kernel)?, out_c, in_c, tr, packn);
    let tm = Tensor::from_vec(&[out_c / packn, tr.tt(), in_c, packn], Layout::Null, u)?;
    params.as_conv2d_mut()?.conv_extra.kernel_tm = Some(tm);
    Ok(Arc::new(WinogradFloat { tile, packn }))
}

impl WinogradFloat {
    fn run<T: FloatElement>(
        &self,
        ctx: &mut KernelContext,
        inputs: &[&Tensor],
        output: &mut Tensor,
        params: &OpParams,
    ) -> ShlResult<()> {
        let input = arg(inputs, 0, "input")?;
        let kernel = arg(inputs, 1, "kernel")?;
        let p = params.as_conv2d()?;
        let g = ConvGeometry::from_tensors(input, kernel, output, Layout::NCHW)?;
        let u = p
            .conv_extra
            .kernel_tm
            .as_ref()
            .ok_or_else(|| ShlError::InternalError("winograd kernel was not transformed at init".to_string()))?
            .data::<f32>()?;
        let bias = match opt_arg(inputs, 2) {
            Some(b) => real_values(b)?.into_owned(),
            None => vec![0.0; g.out_c],
        };
        let x = input.data::<T>()?;
        output.alloc_data();
        let y = output.data_mut::<T>()?;

        let tr = Transform::for_tile(self.tile);
        let (m, t, tt, packn) = (tr.m, tr.t, tr.tt(), self.packn);
        let (in_c, out_c) = (g.in_c, g.out_c);
        let grid = TileGrid::new(g.out_h, g.out_w, m);
        let tiles = grid.tiles();
        let plane = grid.padded_h * grid.padded_w;

        let mut padded_buf = ctx.arena.alloc::<f32>(in_c * plane);
        let mut v_buf = ctx.arena.alloc::<f32>(tiles * tt * in_c);
        let mut y_buf = ctx.arena.alloc::<f32>(tiles * out_c * m * m);
        let pool = ctx.pool.as_ref();

        for b in 0..g.batch {
            let src = &x[b * in_c * g.in_h * g.in_w..(b + 1) * in_c * g.in_h * g.in_w];
            padded_buf.fill(0.0);
            pad_planes(
                src,
                &mut padded_buf[..],
                in_c,
                (g.in_h, g.in_w),
                (grid.padded_h, grid.padded_w),
                (p.pad_top, p.pad_left),
                |v: T| v.to_f32(),
            );
            let padded: &[f32] = &padded_buf;

            // V[tile][e][ic] = (Bᵀ d B)[e]
            parallel_chunks_mut(pool, &mut v_buf[..], tt * in_c, &|tile, v| {
                let mut d = [0.0f32; 64];
                let mut bd = [0.0f32; 64];
                for ic in 0..in_c {
                    grid.gather(&padded[ic * plane..(ic + 1) * plane], tile, m, t, &mut d);
                    sandwich(tr.bt, t, t, &d, &mut bd);
                    for e in 0..tt {
                        v[e * in_c + ic] = bd[e];
                    }
                }
            });
            let v_all: &[f32] = &v_buf;

            // Y[tile][oc] = Aᵀ (Σ_ic U ⊙ V) A + bias
            parallel_chunks_mut(pool, &mut y_buf[..], out_c * m * m, &|tile, ytile| {
                let v = &v_all[tile * tt * in_c..(tile + 1) * tt * in_c];
                let mut acc = vec![0.0f32; packn * tt];
                let mut mt = [0.0f32; 64];
                let mut yt = [0.0f32; 64];
                for ob in 0..out_c / packn {
                    acc.fill(0.0);
                    for e in 0..tt {
                        let ve = &v[e * in_c..(e + 1) * in_c];
                        let ue = &u[(ob * tt + e) * in_c * packn..(ob * tt + e + 1) * in_c * packn];
                        for (ic, &vv) in ve.iter().enumerate() {
                            for lane in 0..packn {
                                acc[lane * tt + e] += ue[ic * packn + lane] * vv;
                            }
                        }
                    }
                    for lane in 0..packn {
                        let oc = ob * packn + lane;
                        mt[..tt].copy_from_slice(&acc[lane * tt..(lane + 1) * tt]);
                        sandwich_out(tr, &mt, &mut yt);
                        for (o, &r) in ytile[oc * m * m..(oc + 1) * m * m].iter_mut().zip(&yt) {
                            *o = r + bias[oc];
                        }
                    }
                }
            });

            // crop the tiles into the output plane
            let dst = &mut y[b * out_c * g.out_h * g.out_w..(b + 1) * out_c * g.out_h * g.out_w];
            for oc in 0..out_c {
                for oy in 0..g.out_h {
                    for ox in 0..g.out_w {
                        let tile = (oy / m) * grid.blocks_w + ox / m;
                        let v = y_buf[(tile * out_c + oc) * m * m + (oy % m) * m + ox % m];
                        dst[(oc * g.out_h + oy) * g.out_w + ox] = T::from_f32(v);
                    }
                }
            }
        }
        Ok(())
    }
}

/// `Aᵀ M A` for the `m x t` output transform
fn sandwich_out(tr: &Transform, mt: &[f32], out: &mut [f32]) {
    let (m, t) = (tr.m, tr.t);
    let mut tmp = [0.0f32; 64];
    for i in 0..m {
        for j in 0..t {
            tmp[i * t + j] = (0..t).map(|l| tr.at[i * t + l] * mt[l * t + j]).sum();
        }
    }
    for i in 0..m {
        for j in 0..m {
            out[i * m + j] = (0..t).map(|l| tmp[i * t + l] * tr.at[j * t + l]).sum();
        }
    }
}

impl Kernel for WinogradFloat {
    fn name(&self) -> &str {
        match self.tile {
            WinogradTile::F63 => "conv3x3s1_winograd64",
            WinogradTile::F43 => "conv3x3s1_winograd43",
        }
    }

    fn execute(&self, ctx: &mut KernelContext, inputs: &[&Tensor], output: &mut Tensor, params: &OpParams) -> ShlResult<()> {
        match output.dtype {
            DType::Float32 => self.run::<f32>(ctx, inputs, output, params),
            DType::Float16 => self.run::<f16>(ctx, inputs, output, params),
            other => Err(ShlError::unsupported_dtype(self.name(), "rvv", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::reference::conv::conv2d_direct;
    use crate::params::Conv2dParams;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn random(len: usize, seed: u64) -> Vec<f32> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect()
    }

    fn check(tile: WinogradTile, dtype: DType, hw: (usize, usize), pad: usize, tol: f32) {
        let (in_c, out_c, packn) = (8, 8, 4);
        let (h, w) = hw;
        let (oh, ow) = (h + 2 * pad - 2, w + 2 * pad - 2);
        let to = |t: Tensor| -> Tensor {
            if dtype == DType::Float16 {
                let v: Vec<f16> = t.data::<f32>().unwrap().iter().map(|&v| f16::from_f32(v)).collect();
                Tensor::from_vec(t.dims(), t.layout, v).unwrap()
            } else {
                t
            }
        };
        let input = to(Tensor::from_f32(&[2, in_c, h, w], Layout::NCHW, random(2 * in_c * h * w, 1)).unwrap());
        let kernel = to(Tensor::from_f32(&[out_c, in_c, 3, 3], Layout::OIHW, random(out_c * in_c * 9, 2)).unwrap());
        let bias = to(Tensor::from_f32(&[out_c], Layout::O, random(out_c, 3)).unwrap());
        let mut params = OpParams::from(Conv2dParams::new().with_pad(pad, pad, pad, pad));
        let mut ctx = KernelContext::serial();

        let mut expected = Tensor::zeros(dtype, &[2, out_c, oh, ow], Layout::NCHW).unwrap();
        conv2d_direct(&mut ctx, &[&input, &kernel, &bias], &mut expected, &params).unwrap();

        let wino = prepare(&kernel, &mut params, tile, packn).unwrap();
        let mut out = Tensor::zeros(dtype, &[2, out_c, oh, ow], Layout::NCHW).unwrap();
        wino.execute(&mut ctx, &[&input, &kernel, &bias], &mut out, &params).unwrap();

        let got = real_values(&out).unwrap();
        let want = real_values(&expected).unwrap();
        for (i, (a, b)) in got.iter().zip(want.iter()).enumerate() {
            assert!((a - b).abs() < tol, "{:?} element {}: {} vs {}", tile, i, a, b);
        }
    }

    #[test]
    fn test_f63_matches_direct() {
        check(WinogradTile::F63, DType::Float32, (14, 14), 1, 1e-3);
        // output not a multiple of 6, no padding
        check(WinogradTile::F63, DType::Float32, (9, 11), 0, 1e-3);
    }

    #[test]
    fn test_f43_matches_direct() {
        check(WinogradTile::F43, DType::Float32, (10, 7), 1, 1e-4);
    }

    #[test]
    fn test_f16_activations() {
        check(WinogradTile::F43, DType::Float16, (8, 8), 1, 2e-2);
        check(WinogradTile::F63, DType::Float16, (8, 8), 1, 2e-2);
    }

    #[test]
    fn test_transformed_kernel_is_f32() {
        let kernel = Tensor::zeros(DType::Float16, &[4, 4, 3, 3], Layout::OIHW).unwrap();
        let mut params = OpParams::from(Conv2dParams::new());
        prepare(&kernel, &mut params, WinogradTile::F63, 4).unwrap();
        let tm = params.as_conv2d().unwrap().conv_extra.kernel_tm.as_ref().unwrap();
        assert_eq!(tm.dtype, DType::Float32);
    }

    #[test]
    fn test_kernel_layout() {
        // U for a single 1-hot weight at the centre tap equals G[:,1] G[:,1]ᵀ
        let mut w = vec![0.0f32; 4 * 9];
        w[2 * 9 + 4] = 1.0; // oc 2, ic 0
        let u = transform_kernel(&w, 4, 1, &super::super::F43, 4);
        let g1: Vec<f32> = (0..6).map(|i| super::super::F43.g[i * 3 + 1]).collect();
        for e in 0..36 {
            let want = g1[e / 6] * g1[e % 6];
            assert!((u[e * 4 + 2] - want).abs() < 1e-6);
            assert_eq!(u[e * 4], 0.0);
        }
    }

    #[test]
    fn test_rejects_unaligned_out_channels() {
        let kernel = Tensor::zeros(DType::Float32, &[6, 4, 3, 3], Layout::OIHW).unwrap();
        let mut params = OpParams::from(Conv2dParams::new());
        assert!(prepare(&kernel, &mut params, WinogradTile::F63, 4).is_err());
    }
}
