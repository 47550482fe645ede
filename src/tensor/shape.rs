//! Fixed-capacity tensor shape

use crate::error::{ShlError, ShlResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum number of dimensions a tensor descriptor can hold
pub const MAX_DIM: usize = 8;

/// Dimension array with an explicit count, at most [`MAX_DIM`] entries
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Shape {
    dims: [usize; MAX_DIM],
    count: usize,
}

impl Shape {
    pub fn new(dims: &[usize]) -> ShlResult<Self> {
        if dims.len() > MAX_DIM {
            return Err(ShlError::TooManyDims {
                max: MAX_DIM,
                actual: dims.len(),
            });
        }
        let mut shape = Shape::default();
        shape.dims[..dims.len()].copy_from_slice(dims);
        shape.count = dims.len();
        Ok(shape)
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims[..self.count]
    }

    pub fn dim_count(&self) -> usize {
        self.count
    }

    /// Size of axis `i`, 0 when out of range
    pub fn dim(&self, i: usize) -> usize {
        if i < self.count {
            self.dims[i]
        } else {
            0
        }
    }

    /// Element count; an empty shape has no elements
    pub fn numel(&self) -> usize {
        if self.count == 0 {
            0
        } else {
            self.dims().iter().product()
        }
    }

    /// Row-major strides in elements
    pub fn strides(&self) -> Vec<usize> {
        let mut strides = vec![1usize; self.count];
        for i in (0..self.count.saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * self.dims[i + 1];
        }
        strides
    }

    /// Product of dims in `[start, end)`
    pub fn span(&self, start: usize, end: usize) -> usize {
        self.dims[start.min(self.count)..end.min(self.count)]
            .iter()
            .product()
    }
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.dims())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.dims().iter().map(|d| d.to_string()).collect();
        write!(f, "[{}]", parts.join(", "))
    }
}
