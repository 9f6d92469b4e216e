use std::fmt;

use half::bf16;
use ndarray::{ArrayD, ArrayViewD};
use serde::{Deserialize, Serialize};

use super::grad::unravel;
use crate::{
    error::{OptimErr, Result},
    precision,
};

/// How a parameter keeps its values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    /// Plain f32.
    #[default]
    Full,
    /// bf16 plus a trail with the low mantissa bits.
    Split,
    /// f32 plus a bf16 copy kept in sync after every update.
    Shadowed,
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Precision::Full => f.write_str("f32"),
            Precision::Split => f.write_str("bf16+trail"),
            Precision::Shadowed => f.write_str("f32+bf16"),
        }
    }
}

/// The values of a single parameter.
///
/// A parameter carries at most one precision augmentation: either a trail that
/// completes its bf16 values, or a bf16 shadow of its f32 values.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamStorage {
    Full(ArrayD<f32>),
    Split {
        stored: ArrayD<bf16>,
        trail: ArrayD<u16>,
    },
    Shadowed {
        master: ArrayD<f32>,
        shadow: ArrayD<bf16>,
    },
}

impl ParamStorage {
    /// Keeps `values` as plain f32.
    pub fn full(values: ArrayD<f32>) -> Self {
        Self::Full(values)
    }

    /// Stores `values` as bf16 and keeps the lost bits in a trail.
    pub fn split(values: ArrayD<f32>) -> Self {
        let (stored, trail) = precision::split_array(values.view());
        Self::Split { stored, trail }
    }

    /// Keeps `values` as f32 and derives a bf16 shadow copy from them.
    pub fn shadowed(values: ArrayD<f32>) -> Self {
        let shadow = values.mapv(bf16::from_f32);
        Self::Shadowed {
            master: values,
            shadow,
        }
    }

    /// Builds a split parameter from already existing halves.
    ///
    /// # Returns
    /// A `PrecisionMismatch` error if the trail doesn't match the stored values.
    pub fn from_split_parts(stored: ArrayD<bf16>, trail: ArrayD<u16>) -> Result<Self> {
        if stored.shape() != trail.shape() {
            return Err(OptimErr::PrecisionMismatch {
                what: "trail",
                got: trail.shape().to_vec(),
                expected: stored.shape().to_vec(),
            });
        }

        Ok(Self::Split { stored, trail })
    }

    /// Builds a shadowed parameter from an existing f32 master and bf16 copy.
    ///
    /// # Returns
    /// A `PrecisionMismatch` error if the shadow doesn't match the master values.
    pub fn from_shadowed_parts(master: ArrayD<f32>, shadow: ArrayD<bf16>) -> Result<Self> {
        if master.shape() != shadow.shape() {
            return Err(OptimErr::PrecisionMismatch {
                what: "shadow",
                got: shadow.shape().to_vec(),
                expected: master.shape().to_vec(),
            });
        }

        Ok(Self::Shadowed { master, shadow })
    }

    pub fn precision(&self) -> Precision {
        match self {
            ParamStorage::Full(_) => Precision::Full,
            ParamStorage::Split { .. } => Precision::Split,
            ParamStorage::Shadowed { .. } => Precision::Shadowed,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            ParamStorage::Full(values) => values.shape(),
            ParamStorage::Split { stored, .. } => stored.shape(),
            ParamStorage::Shadowed { master, .. } => master.shape(),
        }
    }

    /// Returns the number of elements.
    pub fn len(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reconstructs the full precision values.
    pub fn to_f32(&self) -> ArrayD<f32> {
        match self {
            ParamStorage::Full(values) => values.clone(),
            ParamStorage::Split { stored, trail } => {
                precision::combine_array(stored.view(), trail.view())
            }
            ParamStorage::Shadowed { master, .. } => master.clone(),
        }
    }

    /// Drops any precision augmentation, returning the full precision values.
    pub fn into_full(self) -> ArrayD<f32> {
        match self {
            ParamStorage::Full(values) => values,
            ParamStorage::Split { stored, trail } => {
                precision::combine_array(stored.view(), trail.view())
            }
            ParamStorage::Shadowed { master, .. } => master,
        }
    }

    /// Returns the bf16 values the rest of the model reads, if any.
    pub fn bf16_view(&self) -> Option<ArrayViewD<'_, bf16>> {
        match self {
            ParamStorage::Full(_) => None,
            ParamStorage::Split { stored, .. } => Some(stored.view()),
            ParamStorage::Shadowed { shadow, .. } => Some(shadow.view()),
        }
    }

    /// Runs `f` over a read-only view of the full precision values.
    pub(crate) fn with_f32<F, R>(&self, f: F) -> R
    where
        F: FnOnce(ArrayViewD<f32>) -> R,
    {
        match self {
            ParamStorage::Full(values) => f(values.view()),
            ParamStorage::Split { stored, trail } => {
                f(precision::combine_array(stored.view(), trail.view()).view())
            }
            ParamStorage::Shadowed { master, .. } => f(master.view()),
        }
    }

    /// Runs `f` over the full precision values and writes the result back.
    ///
    /// Split parameters are reassembled before `f` and split again after it, shadowed
    /// parameters get their bf16 copy refreshed.
    pub(crate) fn update_f32<F, R>(&mut self, f: F) -> R
    where
        F: FnOnce(&mut ArrayD<f32>) -> R,
    {
        match self {
            ParamStorage::Full(values) => f(values),
            ParamStorage::Split { stored, trail } => {
                let mut full = precision::combine_array(stored.view(), trail.view());
                let res = f(&mut full);
                precision::split_into(full.view(), stored.view_mut(), trail.view_mut());
                res
            }
            ParamStorage::Shadowed { master, shadow } => {
                let res = f(master);
                precision::round_to_bf16(master.view(), shadow.view_mut());
                res
            }
        }
    }

    /// Adds `alpha * values[k]` to the element at the flat offset `indices[k]`.
    ///
    /// Offsets must be unique and in bounds.
    pub(crate) fn scatter_add(&mut self, indices: &[usize], values: &[f32], alpha: f32) {
        let shape = self.shape().to_vec();

        for (&i, &v) in indices.iter().zip(values) {
            let coord = unravel(&shape, i);
            let coord = coord.as_slice();

            match self {
                ParamStorage::Full(full) => full[coord] += alpha * v,
                ParamStorage::Split { stored, trail } => {
                    precision::packed_add(&mut stored[coord], &mut trail[coord], v, alpha);
                }
                ParamStorage::Shadowed { master, shadow } => {
                    master[coord] += alpha * v;
                    shadow[coord] = bf16::from_f32(master[coord]);
                }
            }
        }
    }

    /// Checks that the precision halves agree with each other.
    ///
    /// The variants can be built directly, skipping the checks done by
    /// `from_split_parts` and `from_shadowed_parts`.
    fn check_parts(&self) -> Result<()> {
        let (what, got, expected) = match self {
            ParamStorage::Full(_) => return Ok(()),
            ParamStorage::Split { stored, trail } => ("trail", trail.shape(), stored.shape()),
            ParamStorage::Shadowed { master, shadow } => ("shadow", shadow.shape(), master.shape()),
        };

        if got != expected {
            return Err(OptimErr::PrecisionMismatch {
                what,
                got: got.to_vec(),
                expected: expected.to_vec(),
            });
        }

        Ok(())
    }

    /// Checks that a tensor matches the shape of this parameter.
    ///
    /// # Returns
    /// A `PrecisionMismatch` error if the parameter's own halves disagree, or a
    /// `ShapeMismatch` error if `shape` differs from the parameter's.
    pub(crate) fn check_shape(&self, what: &'static str, shape: &[usize]) -> Result<()> {
        self.check_parts()?;

        if self.shape() != shape {
            return Err(OptimErr::ShapeMismatch {
                what,
                got: shape.to_vec(),
                expected: self.shape().to_vec(),
            });
        }

        Ok(())
    }
}
