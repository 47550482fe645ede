//! int8 Winograd F(4x4, 3x3)
//!
//! The fractional kernel transform is scaled to integers: `Gi = 24 G` with
//! its last row divided by 4, so every `U` entry fits in `i16`. The output
//! transform multiplies the last column by 4 to undo that row scaling, and
//! the result is exactly `576` times the convolution sum, so it is divided
//! back out exactly before requantization.
//!
//! The input is stored with its zero point subtracted (`i16`), so padding is
//! plain 0 and the bias needs no folding. Dot products and the output
//! transform accumulate in `i64`; only the unscaled sum plus bias is
//! saturated to `i32`, as the direct convolution does.

use super::{pad_planes, sandwich, TileGrid};
use crate::error::{ShlError, ShlResult};
use crate::kernels::arg;
use crate::kernels::reference::conv::{channel_requant, quantized_bias};
use crate::ops::conv::ConvGeometry;
use crate::params::OpParams;
use crate::parallel::parallel_chunks_mut;
use crate::quant::requantize;
use crate::registry::{Kernel, KernelContext};
use crate::tensor::{Layout, Tensor};
use std::sync::Arc;

const M: usize = 4;
const T: usize = 6;
const TT: usize = 36;

/// Scale of the integer transform pair
pub const OUTPUT_SCALE: i64 = 576;

#[rustfmt::skip]
const GI: [i64; 18] = [
    6,  0,  0,
    -4, -4, -4,
    -4, 4,  -4,
    1,  2,  4,
    1,  -2, 4,
    0,  0,  6,
];

#[rustfmt::skip]
const BTI: [i64; 36] = [
    4, 0,  -5, 0,  1, 0,
    0, -4, -4, 1,  1, 0,
    0, 4,  -4, -1, 1, 0,
    0, -2, -1, 2,  1, 0,
    0, 2,  -1, -2, 1, 0,
    0, 4,  0,  -5, 0, 1,
];

#[rustfmt::skip]
const ATI: [i64; 24] = [
    1, 1, 1,  1, 1,  0,
    0, 1, -1, 2, -2, 0,
    0, 1, 1,  4, 4,  0,
    0, 1, -1, 8, -8, 4,
];

#[derive(Debug, Clone, Copy)]
pub struct WinogradInt8 {
    pub packn: usize,
}

/// `Gi w Giᵀ` for every channel pair, packed like the float `U`
pub fn transform_kernel(weights: &[i8], out_c: usize, in_c: usize, packn: usize) -> Vec<i16> {
    let mut u = vec![0i16; out_c * in_c * TT];
    for oc in 0..out_c {
        let (ob, lane) = (oc / packn, oc % packn);
        for ic in 0..in_c {
            let w = &weights[(oc * in_c + ic) * 9..(oc * in_c + ic + 1) * 9];
            let mut gw = [0i64; T * 3];
            for i in 0..T {
                for j in 0..3 {
                    gw[i * 3 + j] = (0..3).map(|l| GI[i * 3 + l] * w[l * 3 + j] as i64).sum();
                }
            }
            for i in 0..T {
                for j in 0..T {
                    let v: i64 = (0..3).map(|l| gw[i * 3 + l] * GI[j * 3 + l]).sum();
                    u[((ob * TT + i * T + j) * in_c + ic) * packn + lane] = v as i16;
                }
            }
        }
    }
    u
}

/// Transform the kernel and precompute per-channel requantization
pub fn prepare(
    input: &Tensor,
    kernel: &Tensor,
    bias: Option<&Tensor>,
    output: &Tensor,
    params: &mut OpParams,
    packn: usize,
) -> ShlResult<Arc<dyn Kernel>> {
    let (out_c, in_c) = (kernel.dim(0), kernel.dim(1));
    if packn == 0 || out_c % packn != 0 {
        return Err(ShlError::InvalidParam(format!(
            "int8 winograd needs out channels {} divisible by {}",
            out_c, packn
        )));
    }
    let u = transform_kernel(kernel.data::<i8>()?, out_c, in_c, packn);
    let bias_q = quantized_bias(bias, input, kernel, out_c)?;
    let requant = channel_requant(input, kernel, output, out_c, 1.0)?;

    let extra = &mut params.as_conv2d_mut()?.conv_extra;
    extra.kernel_tm = Some(Tensor::from_vec(&[out_c / packn, TT, in_c, packn], Layout::Null, u)?);
    extra.bias_tm = Some(bias_q);
    extra.fuse_zp2bias = false;
    extra.requant = requant;
    Ok(Arc::new(WinogradInt8 { packn }))
}

impl Kernel for WinogradInt8 {
    fn name(&self) -> &str {
        "conv3x3s1_winograd43_int8"
    }

    fn execute(&self, ctx: &mut KernelContext, inputs: &[&Tensor], output: &mut Tensor, params: &OpParams) -> ShlResult<()> {
        let input = arg(inputs, 0, "input")?;
        let kernel = arg(inputs, 1, "kernel")?;
        let p = params.as_conv2d()?;
        let extra = &p.conv_extra;
        let g = ConvGeometry::from_tensors(input, kernel, output, Layout::NCHW)?;
        let u = extra
            .kernel_tm
            .as_ref()
            .ok_or_else(|| ShlError::InternalError("winograd kernel was not transformed at init".to_string()))?
            .data::<i16>()?;
        let bias = extra
            .bias_tm
            .as_deref()
            .ok_or_else(|| ShlError::InternalError("int8 winograd bias missing".to_string()))?;
        let requant = &extra.requant;
        let in_zp = input.qinfo_for(0).zero_point as i16;
        let out_zp = output.qinfo_for(0).zero_point;
        let x = input.data::<i8>()?;
        output.alloc_data();
        let y = output.data_mut::<i8>()?;

        let packn = self.packn;
        let (in_c, out_c) = (g.in_c, g.out_c);
        let grid = TileGrid::new(g.out_h, g.out_w, M);
        let tiles = grid.tiles();
        let plane = grid.padded_h * grid.padded_w;

        let mut padded_buf = ctx.arena.alloc::<i16>(in_c * plane);
        let mut v_buf = ctx.arena.alloc::<i16>(tiles * TT * in_c);
        let mut y_buf = ctx.arena.alloc::<i8>(tiles * out_c * M * M);
        let pool = ctx.pool.as_ref();

        for b in 0..g.batch {
            let src = &x[b * in_c * g.in_h * g.in_w..(b + 1) * in_c * g.in_h * g.in_w];
            padded_buf.fill(0);
            pad_planes(
                src,
                &mut padded_buf[..],
                in_c,
                (g.in_h, g.in_w),
                (grid.padded_h, grid.padded_w),
                (p.pad_top, p.pad_left),
                |v: i8| v as i16 - in_zp,
            );
            let padded: &[i16] = &padded_buf;

            parallel_chunks_mut(pool, &mut v_buf[..], TT * in_c, &|tile, v| {
                let mut d = [0i16; TT];
                let mut di = [0i64; TT];
                let mut bd = [0i64; TT];
                for ic in 0..in_c {
                    grid.gather(&padded[ic * plane..(ic + 1) * plane], tile, M, T, &mut d);
                    for (o, &s) in di.iter_mut().zip(&d) {
                        *o = s as i64;
                    }
                    sandwich(&BTI, T, T, &di, &mut bd);
                    for e in 0..TT {
                        v[e * in_c + ic] = bd[e] as i16;
                    }
                }
            });
            let v_all: &[i16] = &v_buf;

            parallel_chunks_mut(pool, &mut y_buf[..], out_c * M * M, &|tile, ytile| {
                let v = &v_all[tile * TT * in_c..(tile + 1) * TT * in_c];
                let mut acc = vec![0i64; packn * TT];
                for ob in 0..out_c / packn {
                    acc.fill(0);
                    for e in 0..TT {
                        let ve = &v[e * in_c..(e + 1) * in_c];
                        let ue = &u[(ob * TT + e) * in_c * packn..(ob * TT + e + 1) * in_c * packn];
                        for (ic, &vv) in ve.iter().enumerate() {
                            let vv = vv as i64;
                            for lane in 0..packn {
                                acc[lane * TT + e] += ue[ic * packn + lane] as i64 * vv;
                            }
                        }
                    }
                    for lane in 0..packn {
                        let oc = ob * packn + lane;
                        let yt = output_transform(&acc[lane * TT..(lane + 1) * TT]);
                        let (mult, shift) = requant[oc];
                        for (o, &r) in ytile[oc * M * M..(oc + 1) * M * M].iter_mut().zip(&yt) {
                            debug_assert_eq!(r % OUTPUT_SCALE, 0);
                            let sum = r / OUTPUT_SCALE + bias[oc] as i64;
                            let acc32 = sum.clamp(i32::MIN as i64, i32::MAX as i64) as i32;
                            *o = requantize::<i8>(acc32, mult, shift, out_zp);
                        }
                    }
                }
            });

            let dst = &mut y[b * out_c * g.out_h * g.out_w..(b + 1) * out_c * g.out_h * g.out_w];
            for oc in 0..out_c {
                for oy in 0..g.out_h {
                    for ox in 0..g.out_w {
                        let tile = (oy / M) * grid.blocks_w + ox / M;
                        dst[(oc * g.out_h + oy) * g.out_w + ox] =
                            y_buf[(tile * out_c + oc) * M * M + (oy % M) * M + ox % M];
                    }
                }
            }
        }
        Ok(())
    }
}

/// `ATi M ATiᵀ` in `i64`
fn output_transform(mt: &[i64]) -> [i64; M * M] {
    let mut tmp = [0i64; M * T];
    for i in 0..M {
        for j in 0..T {
            tmp[i * T + j] = (0..T).map(|l| ATI[i * T + l] * mt[l * T + j]).sum();
        }
    }
    let mut out = [0i64; M * M];
    for i in 0..M {
        for j in 0..M {
            out[i * M + j] = (0..T).map(|l| tmp[i * T + l] * ATI[j * T + l]).sum();
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::reference::conv::conv2d_direct;
    use crate::params::Conv2dParams;
    use crate::quant::QuantInfo;
    use crate::tensor::DType;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_integer_transform_is_576x() {
        // single channel, single tile: Y must equal 576 * direct correlation
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let w: Vec<i8> = (0..9).map(|_| rng.gen_range(-127..=127)).collect();
        let d: Vec<i64> = (0..TT).map(|_| rng.gen_range(-255..=255)).collect();
        let u = transform_kernel(&w, 1, 1, 1);
        let mut v = [0i64; TT];
        sandwich(&BTI, T, T, &d, &mut v);
        let prod: Vec<i64> = (0..TT).map(|e| u[e] as i64 * v[e]).collect();
        let y = output_transform(&prod);
        for oy in 0..M {
            for ox in 0..M {
                let direct: i64 = (0..3)
                    .flat_map(|ky| (0..3).map(move |kx| (ky, kx)))
                    .map(|(ky, kx)| d[(oy + ky) * T + ox + kx] * w[ky * 3 + kx] as i64)
                    .sum();
                assert_eq!(y[oy * M + ox], OUTPUT_SCALE * direct);
            }
        }
    }

    #[test]
    fn test_transformed_kernel_fits_i16() {
        let w = vec![-128i8; 9];
        let u = transform_kernel(&w, 1, 1, 1);
        // U = -128 * r rᵀ with r the row sums of Gi, |r| <= 12
        assert!(u.iter().all(|&v| (v as i32).abs() < i16::MAX as i32));
        assert_eq!(u[0] as i32, 36 * -128);
    }

    #[test]
    fn test_matches_direct_within_one() {
        let (in_c, out_c, h, w) = (8, 8, 9, 10);
        let mut rng = ChaCha8Rng::seed_from_u64(21);
        let x: Vec<i8> = (0..in_c * h * w).map(|_| rng.gen_range(-100..100)).collect();
        let k: Vec<i8> = (0..out_c * in_c * 9).map(|_| rng.gen_range(-40..40)).collect();
        let input = Tensor::from_vec(&[1, in_c, h, w], Layout::NCHW, x)
            .unwrap()
            .with_qinfo(vec![QuantInfo::new(0.04, 3)]);
        let kernel = Tensor::from_vec(&[out_c, in_c, 3, 3], Layout::OIHW, k)
            .unwrap()
            .with_qinfo((0..out_c).map(|c| QuantInfo::new(0.005 + c as f32 * 0.001, 0)).collect());
        let bias = Tensor::from_vec::<i32>(&[out_c], Layout::O, (0..out_c as i32).map(|c| c * 37 - 120).collect())
            .unwrap();
        let out_q = vec![QuantInfo::new(0.1, 2)];
        let mut params = OpParams::from(Conv2dParams::new().with_pad(1, 1, 1, 1));
        let mut ctx = KernelContext::serial();

        let mut expected = Tensor::new(DType::Int8, &[1, out_c, h, w], Layout::NCHW)
            .unwrap()
            .with_qinfo(out_q.clone());
        conv2d_direct(&mut ctx, &[&input, &kernel, &bias], &mut expected, &params).unwrap();

        let mut out = Tensor::new(DType::Int8, &[1, out_c, h, w], Layout::NCHW)
            .unwrap()
            .with_qinfo(out_q);
        let wino = prepare(&input, &kernel, Some(&bias), &out, &mut params, 8).unwrap();
        wino.execute(&mut ctx, &[&input, &kernel, &bias], &mut out, &params).unwrap();

        let got = out.data::<i8>().unwrap();
        let want = expected.data::<i8>().unwrap();
        for (i, (a, b)) in got.iter().zip(want).enumerate() {
            assert!((*a as i32 - *b as i32).abs() <= 1, "element {}: {} vs {}", i, a, b);
        }
    }

    #[test]
    fn test_large_sums_do_not_saturate() {
        // every output sums 64 * 9 * 100 * 100 = 5_760_000, which overflows
        // i32 once scaled by 576
        let (in_c, out_c) = (64, 8);
        let input = Tensor::from_vec(&[1, in_c, 6, 6], Layout::NCHW, vec![100i8; in_c * 36])
            .unwrap()
            .with_qinfo(vec![QuantInfo::new(1.0, 0)]);
        let kernel = Tensor::from_vec(&[out_c, in_c, 3, 3], Layout::OIHW, vec![100i8; out_c * in_c * 9])
            .unwrap()
            .with_qinfo(vec![QuantInfo::new(1.0, 0)]);
        let mut out = Tensor::new(DType::Int8, &[1, out_c, 4, 4], Layout::NCHW)
            .unwrap()
            .with_qinfo(vec![QuantInfo::new(57_600.0, 0)]);
        let mut params = OpParams::from(Conv2dParams::new());
        let mut ctx = KernelContext::serial();

        let wino = prepare(&input, &kernel, None, &out, &mut params, 8).unwrap();
        wino.execute(&mut ctx, &[&input, &kernel], &mut out, &params).unwrap();
        assert!(out.data::<i8>().unwrap().iter().all(|&v| v == 100));
    }
}
