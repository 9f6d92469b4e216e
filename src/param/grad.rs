use ndarray::{ArrayD, ArrayViewD, IxDyn};
use rayon::prelude::*;

use crate::error::{OptimErr, Result};

/// A gradient attached to a parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Grad {
    Dense(ArrayD<f32>),
    Sparse(SparseGrad),
}

impl Grad {
    /// Returns the logical shape of the gradient.
    pub fn shape(&self) -> &[usize] {
        match self {
            Grad::Dense(g) => g.shape(),
            Grad::Sparse(g) => g.shape(),
        }
    }

    /// Returns whether the gradient is sparse.
    pub fn is_sparse(&self) -> bool {
        matches!(self, Grad::Sparse(_))
    }

    /// Materializes the gradient as a dense tensor.
    ///
    /// Dense gradients are cloned; sparse gradients are scattered into a zero filled
    /// tensor, summing duplicated indices.
    pub fn to_dense(&self) -> ArrayD<f32> {
        match self {
            Grad::Dense(g) => g.clone(),
            Grad::Sparse(g) => g.to_dense(),
        }
    }
}

impl From<ArrayD<f32>> for Grad {
    fn from(value: ArrayD<f32>) -> Self {
        Self::Dense(value)
    }
}

impl From<SparseGrad> for Grad {
    fn from(value: SparseGrad) -> Self {
        Self::Sparse(value)
    }
}

/// A sparse gradient in coordinate format.
///
/// Every entry is a single element addressed by its row-major flat offset into a
/// dense tensor of `shape`. Entries may repeat the same offset until coalesced.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseGrad {
    shape: Vec<usize>,
    indices: Vec<usize>,
    values: Vec<f32>,
    coalesced: bool,
}

impl SparseGrad {
    /// Creates a new `SparseGrad` from multi-dimensional coordinates.
    ///
    /// # Arguments
    /// * `shape` - The shape of the dense tensor this gradient belongs to.
    /// * `coords` - One coordinate per entry, each with `shape.len()` components.
    /// * `values` - One value per entry.
    ///
    /// # Returns
    /// An error if the amount of coordinates and values differ, or if a coordinate
    /// doesn't fit inside `shape`.
    pub fn new(shape: &[usize], coords: &[Vec<usize>], values: Vec<f32>) -> Result<Self> {
        let indices = coords
            .iter()
            .map(|coord| ravel(shape, coord))
            .collect::<Result<Vec<_>>>()?;

        Self::from_flat(shape, indices, values)
    }

    /// Creates a new `SparseGrad` from row-major flat offsets.
    ///
    /// # Arguments
    /// * `shape` - The shape of the dense tensor this gradient belongs to.
    /// * `indices` - One flat offset per entry.
    /// * `values` - One value per entry.
    ///
    /// # Returns
    /// An error if the amount of indices and values differ, or if an index is out
    /// of bounds.
    pub fn from_flat(shape: &[usize], indices: Vec<usize>, values: Vec<f32>) -> Result<Self> {
        if indices.len() != values.len() {
            return Err(OptimErr::ShapeMismatch {
                what: "sparse values",
                got: vec![values.len()],
                expected: vec![indices.len()],
            });
        }

        let len: usize = shape.iter().product();
        if let Some(&index) = indices.iter().find(|&&i| i >= len) {
            return Err(OptimErr::SparseIndexOutOfBounds { index, len });
        }

        Ok(Self {
            shape: shape.to_vec(),
            indices,
            values,
            coalesced: false,
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Returns the number of stored entries.
    pub fn nnz(&self) -> usize {
        self.indices.len()
    }

    pub fn is_coalesced(&self) -> bool {
        self.coalesced
    }

    /// Merges duplicated indices by summing their values.
    ///
    /// The entries of the returned gradient are sorted by index and unique.
    pub fn coalesce(&self) -> SparseGrad {
        if self.coalesced {
            return self.clone();
        }

        let mut entries: Vec<_> = self
            .indices
            .iter()
            .copied()
            .zip(self.values.iter().copied())
            .collect();

        // Stable so duplicates are summed in their original order.
        entries.par_sort_by_key(|&(i, _)| i);

        let mut indices: Vec<usize> = Vec::with_capacity(entries.len());
        let mut values: Vec<f32> = Vec::with_capacity(entries.len());

        for (i, v) in entries {
            if indices.last() == Some(&i) {
                if let Some(acc) = values.last_mut() {
                    *acc += v;
                }
            } else {
                indices.push(i);
                values.push(v);
            }
        }

        SparseGrad {
            shape: self.shape.clone(),
            indices,
            values,
            coalesced: true,
        }
    }

    /// Scatters the entries into a zero filled dense tensor.
    pub fn to_dense(&self) -> ArrayD<f32> {
        let mut dense = ArrayD::zeros(IxDyn(&self.shape));
        self.scatter_add(&mut dense, &self.values);
        dense
    }

    /// Adds `values[k]` into `dense` at the k-th index of this gradient.
    ///
    /// # Panics
    /// If `dense` doesn't have the shape of this gradient.
    pub fn scatter_add(&self, dense: &mut ArrayD<f32>, values: &[f32]) {
        for (&i, &v) in self.indices.iter().zip(values) {
            dense[unravel(&self.shape, i).as_slice()] += v;
        }
    }

    /// Gathers the values of `dense` at the indices of this gradient.
    ///
    /// # Panics
    /// If `dense` doesn't have the shape of this gradient.
    pub fn mask(&self, dense: ArrayViewD<f32>) -> Vec<f32> {
        self.indices
            .iter()
            .map(|&i| dense[unravel(&self.shape, i).as_slice()])
            .collect()
    }
}

/// Converts a coordinate to its row-major flat offset.
fn ravel(shape: &[usize], coord: &[usize]) -> Result<usize> {
    if coord.len() != shape.len() {
        return Err(OptimErr::ShapeMismatch {
            what: "sparse coordinate",
            got: coord.to_vec(),
            expected: shape.to_vec(),
        });
    }

    let mut flat = 0;
    for (&c, &dim) in coord.iter().zip(shape) {
        if c >= dim {
            return Err(OptimErr::SparseIndexOutOfBounds {
                index: c,
                len: dim,
            });
        }

        flat = flat * dim + c;
    }

    Ok(flat)
}

/// Converts a row-major flat offset back to its coordinate.
pub(crate) fn unravel(shape: &[usize], mut flat: usize) -> Vec<usize> {
    let mut coord = vec![0; shape.len()];
    for (c, &dim) in coord.iter_mut().zip(shape).rev() {
        *c = flat % dim;
        flat /= dim;
    }

    coord
}
