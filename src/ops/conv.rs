//! Convolution entry points
//!
//! Shape and group checks happen here, once, at init. Kernels assume a
//! validated geometry.

use super::{op_init, op_invoke, OpKind};
use crate::error::{ensure_shape, ShlError, ShlResult, Status};
use crate::params::{ConvExtra, OpParams, Params};
use crate::registry::{KernelContext, Registry};
use crate::tensor::{Layout, Tensor};

/// Geometry of a validated convolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub batch: usize,
    pub in_c: usize,
    pub in_h: usize,
    pub in_w: usize,
    pub out_c: usize,
    pub out_h: usize,
    pub out_w: usize,
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub layout: Layout,
}

impl ConvGeometry {
    /// Read the geometry from tensor dims in `layout`
    pub fn from_tensors(input: &Tensor, kernel: &Tensor, output: &Tensor, layout: Layout) -> ShlResult<Self> {
        for (t, what) in [(input, "input"), (kernel, "kernel"), (output, "output")] {
            ensure_shape(t.dim_count() == 4, || {
                format!("conv2d {} must be 4-D, got {:?}", what, t.dims())
            })?;
        }
        let g = match layout {
            Layout::NCHW => ConvGeometry {
                batch: input.dim(0),
                in_c: input.dim(1),
                in_h: input.dim(2),
                in_w: input.dim(3),
                out_c: output.dim(1),
                out_h: output.dim(2),
                out_w: output.dim(3),
                kernel_h: kernel.dim(2),
                kernel_w: kernel.dim(3),
                layout,
            },
            Layout::NHWC => ConvGeometry {
                batch: input.dim(0),
                in_c: input.dim(3),
                in_h: input.dim(1),
                in_w: input.dim(2),
                out_c: output.dim(3),
                out_h: output.dim(1),
                out_w: output.dim(2),
                kernel_h: kernel.dim(1),
                kernel_w: kernel.dim(2),
                layout,
            },
            other => return Err(ShlError::unsupported_layout(OpKind::Conv2d, other)),
        };
        Ok(g)
    }

    /// Input channels seen by one output channel
    pub fn kernel_in_c(&self, kernel: &Tensor) -> usize {
        match self.layout {
            Layout::NHWC => kernel.dim(3),
            _ => kernel.dim(1),
        }
    }
}

/// Layout the convolution runs in: the params layout, or the input's when
/// the params leave it unset
pub fn conv_layout(input: &Tensor, params: &OpParams) -> Layout {
    match params.base().layout {
        Layout::Null => input.layout,
        l => l,
    }
}

/// Operator id for a convolution with `group` groups
pub fn conv_op_for(group: usize, in_c: usize, out_c: usize) -> OpKind {
    if group == 1 {
        OpKind::Conv2d
    } else if group == in_c && group == out_c {
        OpKind::DepthwiseConv2d
    } else {
        OpKind::GroupConv2d
    }
}

/// Check the convolution geometry and return it with the routed op
pub fn validate_conv(
    input: &Tensor,
    kernel: &Tensor,
    bias: Option<&Tensor>,
    output: &Tensor,
    params: &OpParams,
) -> ShlResult<(ConvGeometry, OpKind)> {
    let conv = params.as_conv2d()?;
    let layout = conv_layout(input, params);
    if !matches!(layout, Layout::NCHW | Layout::NHWC) {
        return Err(ShlError::unsupported_layout(OpKind::Conv2d, layout));
    }
    let g = ConvGeometry::from_tensors(input, kernel, output, layout)?;
    let group = conv.group;
    if group == 0 || g.in_c % group != 0 || g.out_c % group != 0 {
        return Err(ShlError::InvalidParam(format!(
            "group {} does not divide in_c {} and out_c {}",
            group, g.in_c, g.out_c
        )));
    }
    ensure_shape(kernel.dim(0) == g.out_c, || {
        format!("kernel has {} output channels, output has {}", kernel.dim(0), g.out_c)
    })?;
    ensure_shape(g.kernel_in_c(kernel) * group == g.in_c, || {
        format!(
            "kernel input channels {} x group {} != input channels {}",
            g.kernel_in_c(kernel),
            group,
            g.in_c
        )
    })?;
    ensure_shape(output.dim(0) == g.batch, || {
        format!("output batch {} != input batch {}", output.dim(0), g.batch)
    })?;
    let (out_h, out_w) = conv.output_hw(g.in_h, g.in_w, g.kernel_h, g.kernel_w)?;
    ensure_shape(out_h == g.out_h && out_w == g.out_w, || {
        format!(
            "output spatial size {}x{} does not match computed {}x{}",
            g.out_h, g.out_w, out_h, out_w
        )
    })?;
    if let Some(b) = bias {
        if b.size() != 0 {
            ensure_shape(b.size() == g.out_c, || {
                format!("bias has {} values for {} output channels", b.size(), g.out_c)
            })?;
        }
    }
    Ok((g, conv_op_for(group, g.in_c, g.out_c)))
}

fn conv_inputs<'a>(input: &'a Tensor, kernel: &'a Tensor, bias: Option<&'a Tensor>) -> Vec<&'a Tensor> {
    let mut inputs = vec![input, kernel];
    if let Some(b) = bias {
        inputs.push(b);
    }
    inputs
}

fn init_routed(
    registry: &Registry,
    op: OpKind,
    input: &Tensor,
    kernel: &Tensor,
    bias: Option<&Tensor>,
    output: &Tensor,
    params: &mut OpParams,
) -> ShlResult<Status> {
    params.as_conv2d_mut()?.conv_extra = ConvExtra::default();
    op_init(registry, op, &conv_inputs(input, kernel, bias), output, params)
}

/// Validate and bind a 2-D convolution. Depthwise and grouped shapes are
/// routed to their own operators.
pub fn conv2d_init(
    registry: &Registry,
    input: &Tensor,
    kernel: &Tensor,
    bias: Option<&Tensor>,
    output: &Tensor,
    params: &mut OpParams,
) -> ShlResult<Status> {
    conv_flavour_init(registry, OpKind::Conv2d, input, kernel, bias, output, params)?;
    Ok(Status::True)
}

pub fn depthwise_conv2d_init(
    registry: &Registry,
    input: &Tensor,
    kernel: &Tensor,
    bias: Option<&Tensor>,
    output: &Tensor,
    params: &mut OpParams,
) -> ShlResult<Status> {
    conv_flavour_init(registry, OpKind::DepthwiseConv2d, input, kernel, bias, output, params)?;
    Ok(Status::True)
}

pub fn group_conv2d_init(
    registry: &Registry,
    input: &Tensor,
    kernel: &Tensor,
    bias: Option<&Tensor>,
    output: &Tensor,
    params: &mut OpParams,
) -> ShlResult<Status> {
    conv_flavour_init(registry, OpKind::GroupConv2d, input, kernel, bias, output, params)?;
    Ok(Status::True)
}

/// The shape must be one `requested` accepts: depthwise needs
/// group == in_c == out_c, group conv needs group > 1.
fn check_flavour(requested: OpKind, routed: OpKind, g: &ConvGeometry) -> ShlResult<()> {
    match (requested, routed) {
        (OpKind::DepthwiseConv2d, r) if r != OpKind::DepthwiseConv2d => Err(ShlError::InvalidParam(format!(
            "depthwise convolution needs group == in_c == out_c, got in_c {} out_c {}",
            g.in_c, g.out_c
        ))),
        (OpKind::GroupConv2d, OpKind::Conv2d) => {
            Err(ShlError::InvalidParam("group convolution needs group > 1".to_string()))
        }
        _ => Ok(()),
    }
}

fn conv_flavour_init(
    registry: &Registry,
    requested: OpKind,
    input: &Tensor,
    kernel: &Tensor,
    bias: Option<&Tensor>,
    output: &Tensor,
    params: &mut OpParams,
) -> ShlResult<OpKind> {
    params.base_mut().callback = None;
    let (g, routed) = validate_conv(input, kernel, bias, output, params)?;
    check_flavour(requested, routed, &g)?;
    init_routed(registry, routed, input, kernel, bias, output, params)?;
    Ok(routed)
}

/// Validate and bind a recorded convolution node given as
/// `[input, kernel, bias?]`. Returns the operator the shape routes to.
pub fn conv_node_init(
    registry: &Registry,
    op: OpKind,
    inputs: &[&Tensor],
    output: &Tensor,
    params: &mut OpParams,
) -> ShlResult<OpKind> {
    match inputs {
        [input, kernel] => conv_flavour_init(registry, op, input, kernel, None, output, params),
        [input, kernel, bias] => conv_flavour_init(registry, op, input, kernel, Some(*bias), output, params),
        _ => Err(ShlError::InvalidParam(format!(
            "{} takes input, kernel and optional bias, got {} tensors",
            op,
            inputs.len()
        ))),
    }
}

/// Run a bound convolution of any flavour
pub fn conv2d(
    ctx: &mut KernelContext,
    input: &Tensor,
    kernel: &Tensor,
    bias: Option<&Tensor>,
    output: &mut Tensor,
    params: &OpParams,
) -> ShlResult<Status> {
    op_invoke(ctx, &conv_inputs(input, kernel, bias), output, params)
}
