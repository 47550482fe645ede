//! Operator identifiers

use serde::{Deserialize, Serialize};
use std::fmt;

/// Abstract operator, the `op` part of a registry key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    // convolution
    Conv2d,
    DepthwiseConv2d,
    GroupConv2d,
    // pooling
    MaxPool2d,
    AvgPool2d,
    GlobalAvgPool2d,
    GlobalMaxPool2d,
    // single input, single output
    Relu,
    Relu1,
    Relu6,
    ReluN,
    LeakyRelu,
    Sigmoid,
    Tanh,
    Abs,
    Neg,
    Exp,
    Sqrt,
    Clip,
    // two inputs, single output
    Add,
    Sub,
    Mul,
    Div,
    Maximum,
    Minimum,
    // reduction
    ReduceSum,
    ReduceMean,
    ReduceMax,
    ReduceMin,
    ReduceProd,
    // shape
    Reshape,
    Flatten,
    Transpose,
    Pad,
    // misc
    Softmax,
    FullyConnected,
    SegmentSum,
    SegmentMean,
}

impl OpKind {
    pub const SISO: [OpKind; 12] = [
        OpKind::Relu,
        OpKind::Relu1,
        OpKind::Relu6,
        OpKind::ReluN,
        OpKind::LeakyRelu,
        OpKind::Sigmoid,
        OpKind::Tanh,
        OpKind::Abs,
        OpKind::Neg,
        OpKind::Exp,
        OpKind::Sqrt,
        OpKind::Clip,
    ];

    pub const DISO: [OpKind; 6] = [
        OpKind::Add,
        OpKind::Sub,
        OpKind::Mul,
        OpKind::Div,
        OpKind::Maximum,
        OpKind::Minimum,
    ];

    pub const REDUCE: [OpKind; 5] = [
        OpKind::ReduceSum,
        OpKind::ReduceMean,
        OpKind::ReduceMax,
        OpKind::ReduceMin,
        OpKind::ReduceProd,
    ];

    pub const POOL: [OpKind; 4] = [
        OpKind::MaxPool2d,
        OpKind::AvgPool2d,
        OpKind::GlobalAvgPool2d,
        OpKind::GlobalMaxPool2d,
    ];

    pub const CONV: [OpKind; 3] = [
        OpKind::Conv2d,
        OpKind::DepthwiseConv2d,
        OpKind::GroupConv2d,
    ];

    pub fn is_conv(self) -> bool {
        Self::CONV.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OpKind::Conv2d => "conv2d",
            OpKind::DepthwiseConv2d => "depthwise_conv2d",
            OpKind::GroupConv2d => "group_conv2d",
            OpKind::MaxPool2d => "maxpool2d",
            OpKind::AvgPool2d => "avgpool2d",
            OpKind::GlobalAvgPool2d => "global_avgpool2d",
            OpKind::GlobalMaxPool2d => "global_maxpool2d",
            OpKind::Relu => "relu",
            OpKind::Relu1 => "relu1",
            OpKind::Relu6 => "relu6",
            OpKind::ReluN => "relun",
            OpKind::LeakyRelu => "leaky_relu",
            OpKind::Sigmoid => "sigmoid",
            OpKind::Tanh => "tanh",
            OpKind::Abs => "abs",
            OpKind::Neg => "neg",
            OpKind::Exp => "exp",
            OpKind::Sqrt => "sqrt",
            OpKind::Clip => "clip",
            OpKind::Add => "add",
            OpKind::Sub => "sub",
            OpKind::Mul => "mul",
            OpKind::Div => "div",
            OpKind::Maximum => "maximum",
            OpKind::Minimum => "minimum",
            OpKind::ReduceSum => "reduce_sum",
            OpKind::ReduceMean => "reduce_mean",
            OpKind::ReduceMax => "reduce_max",
            OpKind::ReduceMin => "reduce_min",
            OpKind::ReduceProd => "reduce_prod",
            OpKind::Reshape => "reshape",
            OpKind::Flatten => "flatten",
            OpKind::Transpose => "transpose",
            OpKind::Pad => "pad",
            OpKind::Softmax => "softmax",
            OpKind::FullyConnected => "fullyconnected",
            OpKind::SegmentSum => "segment_sum",
            OpKind::SegmentMean => "segment_mean",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
