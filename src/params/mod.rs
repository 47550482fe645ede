//! Operator parameters
//!
//! Every per-category struct embeds a [`ParamsBase`] carrying the dispatch
//! selection (api, run mode, layout) and the kernel bound at init.
//! [`OpParams`] is the tagged union kernels receive.

pub mod basic;
pub mod conv;

pub use basic::{
    DisoParams, FcParams, PadMode, PadParams, PoolParams, ReduceParams, ReshapeParams,
    SegmentParams, SisoParams, SoftmaxParams, TransposeParams,
};
pub use conv::{conv_out_dim, Conv2dParams, ConvExtra, ConvMode, WinogradTile};

use crate::backend::{Api, RunMode};
use crate::error::{ShlError, ShlResult};
use crate::registry::BoundKernel;
use crate::session::SessionId;
use crate::tensor::{Layout, QuantType};
use serde::{Deserialize, Serialize};

/// Header shared by every parameter struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParamsBase {
    /// Kernel resolved by the last successful init
    #[serde(skip)]
    pub callback: Option<BoundKernel>,
    pub name: String,
    pub layout: Layout,
    pub api: Api,
    pub run_mode: RunMode,
    pub quant_type: QuantType,
    #[serde(skip)]
    pub session: Option<SessionId>,
}

impl ParamsBase {
    pub fn new(api: Api, layout: Layout) -> Self {
        ParamsBase {
            api,
            layout,
            ..ParamsBase::default()
        }
    }
}

/// Access to the shared header
pub trait Params {
    fn base(&self) -> &ParamsBase;
    fn base_mut(&mut self) -> &mut ParamsBase;
}

macro_rules! impl_params {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Params for $ty {
                fn base(&self) -> &ParamsBase {
                    &self.base
                }

                fn base_mut(&mut self) -> &mut ParamsBase {
                    &mut self.base
                }
            }
        )*
    };
}

impl_params!(
    Conv2dParams,
    PoolParams,
    ReduceParams,
    PadParams,
    ReshapeParams,
    TransposeParams,
    SisoParams,
    DisoParams,
    SoftmaxParams,
    FcParams,
    SegmentParams,
);

/// Parameters of any operator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OpParams {
    Conv2d(Conv2dParams),
    Pool(PoolParams),
    Reduce(ReduceParams),
    Pad(PadParams),
    Reshape(ReshapeParams),
    Transpose(TransposeParams),
    Siso(SisoParams),
    Diso(DisoParams),
    Softmax(SoftmaxParams),
    FullyConnected(FcParams),
    Segment(SegmentParams),
}

macro_rules! dispatch_base {
    ($self:expr, $p:ident => $body:expr) => {
        match $self {
            OpParams::Conv2d($p) => $body,
            OpParams::Pool($p) => $body,
            OpParams::Reduce($p) => $body,
            OpParams::Pad($p) => $body,
            OpParams::Reshape($p) => $body,
            OpParams::Transpose($p) => $body,
            OpParams::Siso($p) => $body,
            OpParams::Diso($p) => $body,
            OpParams::Softmax($p) => $body,
            OpParams::FullyConnected($p) => $body,
            OpParams::Segment($p) => $body,
        }
    };
}

impl Params for OpParams {
    fn base(&self) -> &ParamsBase {
        dispatch_base!(self, p => &p.base)
    }

    fn base_mut(&mut self) -> &mut ParamsBase {
        dispatch_base!(self, p => &mut p.base)
    }
}

macro_rules! accessors {
    ($($variant:ident, $ty:ty, $get:ident, $get_mut:ident);* $(;)?) => {
        impl OpParams {
            $(
                pub fn $get(&self) -> ShlResult<&$ty> {
                    match self {
                        OpParams::$variant(p) => Ok(p),
                        other => Err(ShlError::InvalidParam(format!(
                            "expected {} params, got {}",
                            stringify!($variant),
                            other.category()
                        ))),
                    }
                }

                pub fn $get_mut(&mut self) -> ShlResult<&mut $ty> {
                    match self {
                        OpParams::$variant(p) => Ok(p),
                        other => Err(ShlError::InvalidParam(format!(
                            "expected {} params, got {}",
                            stringify!($variant),
                            other.category()
                        ))),
                    }
                }
            )*
        }

        $(
            impl From<$ty> for OpParams {
                fn from(p: $ty) -> Self {
                    OpParams::$variant(p)
                }
            }
        )*
    };
}

accessors!(
    Conv2d, Conv2dParams, as_conv2d, as_conv2d_mut;
    Pool, PoolParams, as_pool, as_pool_mut;
    Reduce, ReduceParams, as_reduce, as_reduce_mut;
    Pad, PadParams, as_pad, as_pad_mut;
    Reshape, ReshapeParams, as_reshape, as_reshape_mut;
    Transpose, TransposeParams, as_transpose, as_transpose_mut;
    Siso, SisoParams, as_siso, as_siso_mut;
    Diso, DisoParams, as_diso, as_diso_mut;
    Softmax, SoftmaxParams, as_softmax, as_softmax_mut;
    FullyConnected, FcParams, as_fc, as_fc_mut;
    Segment, SegmentParams, as_segment, as_segment_mut;
);

impl OpParams {
    pub fn category(&self) -> &'static str {
        match self {
            OpParams::Conv2d(_) => "conv2d",
            OpParams::Pool(_) => "pool",
            OpParams::Reduce(_) => "reduce",
            OpParams::Pad(_) => "pad",
            OpParams::Reshape(_) => "reshape",
            OpParams::Transpose(_) => "transpose",
            OpParams::Siso(_) => "siso",
            OpParams::Diso(_) => "diso",
            OpParams::Softmax(_) => "softmax",
            OpParams::FullyConnected(_) => "fullyconnected",
            OpParams::Segment(_) => "segment",
        }
    }

    /// Set the dispatch selection on the header
    pub fn with_target(mut self, api: Api, layout: Layout) -> Self {
        let base = self.base_mut();
        base.api = api;
        base.layout = layout;
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.base_mut().name = name.to_string();
        self
    }

    /// Drop the bound kernel and any init-time state
    pub fn reset(&mut self) {
        self.base_mut().callback = None;
        match self {
            OpParams::Conv2d(p) => p.conv_extra = ConvExtra::default(),
            OpParams::FullyConnected(p) => p.weights_tm = None,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessors() {
        let mut p: OpParams = Conv2dParams::new().with_group(2).into();
        assert_eq!(p.as_conv2d().unwrap().group, 2);
        p.as_conv2d_mut().unwrap().group = 4;
        assert_eq!(p.as_conv2d().unwrap().group, 4);

        let err = p.as_pool().unwrap_err();
        assert_eq!(err.to_string(), "Invalid parameter: expected Pool params, got conv2d");
    }

    #[test]
    fn test_base_header() {
        let p = OpParams::from(SisoParams::default())
            .with_target(Api::C906, Layout::NCHW)
            .with_name("relu_0");
        assert_eq!(p.base().api, Api::C906);
        assert_eq!(p.base().layout, Layout::NCHW);
        assert_eq!(p.base().name, "relu_0");
        assert!(p.base().callback.is_none());
    }

    #[test]
    fn test_serde_skips_runtime_state() {
        let mut conv = Conv2dParams::new().with_pad(1, 1, 1, 1);
        conv.conv_extra.conv_mode = ConvMode::Winograd;
        conv.conv_extra.requant = vec![(1 << 30, -3)];
        let p = OpParams::from(conv);

        let json = serde_json::to_string(&p).unwrap();
        assert!(json.contains("\"kind\":\"conv2d\""));
        let back: OpParams = serde_json::from_str(&json).unwrap();
        let back = back.as_conv2d().unwrap();
        assert_eq!(back.pad_top, 1);
        assert_eq!(back.conv_extra.conv_mode, ConvMode::Winograd);
        assert!(back.conv_extra.requant.is_empty());
        assert!(back.conv_extra.kernel_tm.is_none());
    }
}
