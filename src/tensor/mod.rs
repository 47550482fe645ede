//! Tensor descriptors
//!
//! A [`Tensor`] pairs an optional data [`Buffer`] with everything a kernel
//! needs to interpret it: dtype, layout, shape and per-channel quantization
//! records. Constant tensors (weights, bias) carry `is_const`.

pub mod buffer;
pub mod dtype;
pub mod layout;
pub mod shape;
pub mod stats;

pub use buffer::{Buffer, Element};
pub use dtype::{DType, MemType, QuantType};
pub use layout::Layout;
pub use shape::{Shape, MAX_DIM};

use crate::error::{ShlError, ShlResult};
use crate::quant::QuantInfo;
use crate::session::SessionId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tensor {
    pub data: Option<Buffer>,
    pub dtype: DType,
    pub mtype: MemType,
    pub shape: Shape,
    pub is_const: bool,
    pub name: String,
    pub layout: Layout,
    /// One record per quantization channel; `quant_channel()` is its length
    pub qinfo: Vec<QuantInfo>,
    /// Session that allocated the tensor, if any
    #[serde(skip)]
    pub session: Option<SessionId>,
}

impl Default for Tensor {
    fn default() -> Self {
        Tensor {
            data: None,
            dtype: DType::Float32,
            mtype: MemType::CpuNotAligned,
            shape: Shape::default(),
            is_const: false,
            name: String::new(),
            layout: Layout::Null,
            qinfo: vec![QuantInfo::default()],
            session: None,
        }
    }
}

impl Tensor {
    /// Descriptor without data
    pub fn new(dtype: DType, dims: &[usize], layout: Layout) -> ShlResult<Tensor> {
        Ok(Tensor {
            dtype,
            shape: Shape::new(dims)?,
            layout,
            ..Tensor::default()
        })
    }

    /// Descriptor with zero-filled storage
    pub fn zeros(dtype: DType, dims: &[usize], layout: Layout) -> ShlResult<Tensor> {
        let mut t = Tensor::new(dtype, dims, layout)?;
        t.alloc_data();
        Ok(t)
    }

    /// Descriptor taking ownership of `values`
    pub fn from_vec<T: Element>(dims: &[usize], layout: Layout, values: Vec<T>) -> ShlResult<Tensor> {
        let mut t = Tensor::new(T::DTYPE, dims, layout)?;
        t.set_data(T::into_buffer(values))?;
        Ok(t)
    }

    pub fn from_f32(dims: &[usize], layout: Layout, values: Vec<f32>) -> ShlResult<Tensor> {
        Self::from_vec(dims, layout, values)
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_const(mut self, is_const: bool) -> Self {
        self.is_const = is_const;
        self
    }

    pub fn with_qinfo(mut self, qinfo: Vec<QuantInfo>) -> Self {
        self.qinfo = qinfo;
        self
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn dim(&self, i: usize) -> usize {
        self.shape.dim(i)
    }

    pub fn dim_count(&self) -> usize {
        self.shape.dim_count()
    }

    /// Element count, 0 for a tensor with no dims
    pub fn size(&self) -> usize {
        self.shape.numel()
    }

    pub fn byte_size(&self) -> usize {
        match self.dtype {
            DType::Int4 => self.size().div_ceil(2),
            d => self.size() * d.element_bytes(),
        }
    }

    pub fn quant_channel(&self) -> usize {
        self.qinfo.len()
    }

    /// Replace the quantization records with `n` defaults
    pub fn realloc_quant_info(&mut self, n: usize) {
        self.qinfo = vec![QuantInfo::default(); n.max(1)];
    }

    pub fn set_dims(&mut self, dims: &[usize]) -> ShlResult<()> {
        self.shape = Shape::new(dims)?;
        Ok(())
    }

    /// Attach `buffer`, checking storage type and element count
    pub fn set_data(&mut self, buffer: Buffer) -> ShlResult<()> {
        self.check_buffer(&buffer)?;
        self.data = Some(buffer);
        Ok(())
    }

    /// Allocate zeroed storage when none is attached or the attached one
    /// no longer fits the descriptor
    pub fn alloc_data(&mut self) {
        let fits = self
            .data
            .as_ref()
            .is_some_and(|b| self.check_buffer(b).is_ok());
        if !fits {
            self.data = Some(Buffer::zeros(self.dtype, self.size()));
        }
    }

    /// Detach the data buffer
    pub fn take_data(&mut self) -> Option<Buffer> {
        self.data.take()
    }

    fn check_buffer(&self, buffer: &Buffer) -> ShlResult<()> {
        if !buffer.matches(self.dtype) {
            return Err(ShlError::DtypeMismatch {
                op: format!("tensor '{}'", self.name),
                expected: self.dtype.to_string(),
                actual: buffer.dtype().to_string(),
            });
        }
        let expected = self.dtype.buffer_len(self.size());
        if buffer.len() != expected {
            return Err(ShlError::BufferSizeMismatch {
                expected,
                actual: buffer.len(),
            });
        }
        Ok(())
    }

    pub fn data<T: Element>(&self) -> ShlResult<&[T]> {
        let buf = self
            .data
            .as_ref()
            .ok_or_else(|| ShlError::MissingData(self.name.clone()))?;
        buf.as_slice::<T>().ok_or_else(|| ShlError::DtypeMismatch {
            op: format!("tensor '{}'", self.name),
            expected: T::DTYPE.to_string(),
            actual: buf.dtype().to_string(),
        })
    }

    pub fn data_mut<T: Element>(&mut self) -> ShlResult<&mut [T]> {
        let name = &self.name;
        let buf = self
            .data
            .as_mut()
            .ok_or_else(|| ShlError::MissingData(name.clone()))?;
        let actual = buf.dtype();
        buf.as_mut_slice::<T>().ok_or_else(|| ShlError::DtypeMismatch {
            op: format!("tensor '{}'", name),
            expected: T::DTYPE.to_string(),
            actual: actual.to_string(),
        })
    }

    /// Copy every descriptor field except the data buffer
    pub fn copy_descriptor_from(&mut self, src: &Tensor) {
        self.dtype = src.dtype;
        self.mtype = src.mtype;
        self.shape = src.shape;
        self.is_const = src.is_const;
        self.name = src.name.clone();
        self.layout = src.layout;
        self.qinfo = src.qinfo.clone();
    }

    /// Descriptor clone without data
    pub fn descriptor(&self) -> Tensor {
        let mut t = Tensor::default();
        t.copy_descriptor_from(self);
        t
    }

    /// Copy descriptor and data
    pub fn copy_from(&mut self, src: &Tensor) {
        self.copy_descriptor_from(src);
        self.data = src.data.clone();
    }

    /// Install per-channel quantization records
    pub fn channel_setup(&mut self, qinfo: &[QuantInfo]) {
        self.qinfo = qinfo.to_vec();
    }

    /// Per-tensor or channel `c` quantization record
    pub fn qinfo_for(&self, c: usize) -> QuantInfo {
        let idx = if self.qinfo.len() > 1 { c } else { 0 };
        self.qinfo.get(idx).copied().unwrap_or_default()
    }

    /// Check the descriptor invariants
    pub fn validate(&self) -> ShlResult<()> {
        if self.dim_count() > MAX_DIM {
            return Err(ShlError::TooManyDims {
                max: MAX_DIM,
                actual: self.dim_count(),
            });
        }
        if let Some(buf) = &self.data {
            self.check_buffer(buf)?;
        }
        if self.dtype.is_quantized() && self.qinfo.is_empty() {
            return Err(ShlError::MissingQuantInfo(self.name.clone()));
        }
        if self.qinfo.len() > 1 && self.qinfo.len() != self.dim(0) {
            return Err(ShlError::MissingQuantInfo(format!(
                "'{}' has {} quant channels for {} output channels",
                self.name,
                self.qinfo.len(),
                self.dim(0)
            )));
        }
        Ok(())
    }

    pub fn is_quantized(&self) -> bool {
        self.dtype.is_quantized()
    }
}
