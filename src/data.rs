//! Labelled dataset and mini-batching.
//!
//! Samples are stored contiguously in row-major order, each with the same
//! `sample_shape` (e.g. `[features]` or `[channels, height, width]`). Labels are class
//! indices.

use rand::Rng;
use rand::seq::SliceRandom;

use crate::{Error, Result, Tensor};

#[derive(Debug, Clone)]
pub struct Dataset {
    inputs: Vec<f32>,
    sample_shape: Vec<usize>,
    sample_len: usize,
    labels: Vec<usize>,
}

impl Dataset {
    /// Build a dataset from a flat buffer of `labels.len()` samples shaped `sample_shape`.
    pub fn from_flat(inputs: Vec<f32>, sample_shape: &[usize], labels: Vec<usize>) -> Result<Self> {
        let sample_len: usize = sample_shape.iter().product();
        if sample_shape.is_empty() || sample_len == 0 {
            return Err(Error::InvalidData(format!(
                "sample shape {sample_shape:?} must be non-empty with non-zero dims"
            )));
        }
        if !inputs.len().is_multiple_of(sample_len) {
            return Err(Error::InvalidData(format!(
                "inputs length {} is not divisible by sample length {sample_len}",
                inputs.len()
            )));
        }
        if inputs.len() / sample_len != labels.len() {
            return Err(Error::InvalidData(format!(
                "{} samples but {} labels",
                inputs.len() / sample_len,
                labels.len()
            )));
        }

        Ok(Self {
            inputs,
            sample_shape: sample_shape.to_vec(),
            sample_len,
            labels,
        })
    }

    /// Build a dataset of feature vectors from per-sample rows.
    ///
    /// This is a convenience constructor (it copies into contiguous storage).
    pub fn from_rows(rows: &[Vec<f32>], labels: &[usize]) -> Result<Self> {
        let Some(first) = rows.first() else {
            return Err(Error::InvalidData("rows must not be empty".to_owned()));
        };
        let dim = first.len();
        for (i, row) in rows.iter().enumerate() {
            if row.len() != dim {
                return Err(Error::InvalidData(format!(
                    "row {i} has len {}, expected {dim}",
                    row.len()
                )));
            }
        }
        Self::from_flat(rows.concat(), &[dim], labels.to_vec())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    #[inline]
    pub fn sample_shape(&self) -> &[usize] {
        &self.sample_shape
    }

    /// Number of classes implied by the labels (`max label + 1`).
    pub fn classes(&self) -> usize {
        self.labels.iter().max().map_or(0, |&m| m + 1)
    }

    /// Returns the `idx`-th sample, flattened.
    ///
    /// Panics if `idx >= len`.
    #[inline]
    pub fn sample(&self, idx: usize) -> &[f32] {
        let start = idx * self.sample_len;
        &self.inputs[start..start + self.sample_len]
    }

    /// Gather the given samples into a `(batch, sample_shape..)` tensor and their labels.
    pub fn batch(&self, indices: &[usize]) -> Result<(Tensor, Vec<usize>)> {
        if indices.is_empty() {
            return Err(Error::InvalidData("batch must not be empty".to_owned()));
        }
        if let Some(&bad) = indices.iter().find(|&&i| i >= self.len()) {
            return Err(Error::InvalidData(format!(
                "sample index {bad} out of range for {} samples",
                self.len()
            )));
        }

        let mut data = Vec::with_capacity(indices.len() * self.sample_len);
        for &i in indices {
            data.extend_from_slice(self.sample(i));
        }
        let mut shape = Vec::with_capacity(self.sample_shape.len() + 1);
        shape.push(indices.len());
        shape.extend_from_slice(&self.sample_shape);

        let labels = indices.iter().map(|&i| self.labels[i]).collect();
        Ok((Tensor::from_vec(&shape, data)?, labels))
    }

    /// All samples as one batch, in order.
    pub fn full_batch(&self) -> Result<(Tensor, Vec<usize>)> {
        let all: Vec<usize> = (0..self.len()).collect();
        self.batch(&all)
    }

    /// A shuffled partition of the sample indices into batches of `batch_size`.
    ///
    /// The last batch is smaller when `batch_size` does not divide `len`.
    pub fn shuffled_batches<R: Rng + ?Sized>(
        &self,
        batch_size: usize,
        rng: &mut R,
    ) -> Result<Vec<Vec<usize>>> {
        if batch_size == 0 {
            return Err(Error::InvalidConfig("batch_size must be > 0".to_owned()));
        }
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(rng);
        Ok(order.chunks(batch_size).map(<[usize]>::to_vec).collect())
    }
}
