//! A minimal owned tensor.
//!
//! Data is a contiguous row-major `Vec<f32>` with an explicit shape. There is no
//! broadcasting and no autograd: modules cache what they need for backward themselves.

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    pub fn zeros(shape: &[usize]) -> Self {
        let len = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            data: vec![0.0; len],
        }
    }

    /// Build a tensor from a flat row-major buffer.
    pub fn from_vec(shape: &[usize], data: Vec<f32>) -> Result<Self> {
        if shape.is_empty() {
            return Err(Error::InvalidShape("tensor shape must not be empty".to_owned()));
        }
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(Error::InvalidShape(format!(
                "data length {} does not match shape {shape:?} ({expected} elements)",
                data.len()
            )));
        }
        Ok(Self {
            shape: shape.to_vec(),
            data,
        })
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Leading (batch) dimension.
    #[inline]
    pub fn batch(&self) -> usize {
        self.shape[0]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    /// Reinterpret the data with a new shape holding the same number of elements.
    pub fn reshape(mut self, shape: &[usize]) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != self.data.len() {
            return Err(Error::InvalidShape(format!(
                "cannot reshape {:?} into {shape:?}",
                self.shape
            )));
        }
        self.shape = shape.to_vec();
        Ok(self)
    }

    /// Errors unless the tensor has exactly `rank` dimensions.
    pub fn expect_rank(&self, rank: usize, what: &str) -> Result<()> {
        if self.shape.len() != rank {
            return Err(Error::InvalidShape(format!(
                "{what} must have rank {rank}, got shape {:?}",
                self.shape
            )));
        }
        Ok(())
    }
}
