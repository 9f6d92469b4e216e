use std::{error::Error, fmt};

use crate::param::ParamId;

/// The result type used in the entire crate.
pub type Result<T> = std::result::Result<T, OptimErr>;

/// Failures raised while building or stepping an optimizer.
#[derive(Debug, Clone, PartialEq)]
pub enum OptimErr {
    /// Weight decay was requested together with a sparse gradient.
    SparseWeightDecay,
    /// The optimizer has no sparse update rule.
    SparseUnsupported { optimizer: &'static str },
    /// Two tensors that must agree in shape don't.
    ShapeMismatch {
        what: &'static str,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
    /// The reduced precision halves of a parameter are inconsistent.
    PrecisionMismatch {
        what: &'static str,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
    /// The handle doesn't belong to the store.
    UnknownParam(ParamId),
    /// A parameter was added to more than one group.
    DuplicateParam(ParamId),
    /// A hyperparameter is outside of its valid range.
    InvalidHyperparameter { name: &'static str, value: f32 },
    /// A sparse index points past the end of the dense tensor.
    SparseIndexOutOfBounds { index: usize, len: usize },
}

impl fmt::Display for OptimErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimErr::SparseWeightDecay => {
                f.write_str("weight_decay option is not compatible with sparse gradients")
            }
            OptimErr::SparseUnsupported { optimizer } => {
                write!(f, "{optimizer} does not support sparse gradients")
            }
            OptimErr::ShapeMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "shape mismatch for {what}: got {got:?}, expected {expected:?}"
            ),
            OptimErr::PrecisionMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "reduced precision {what} doesn't match its parameter: got {got:?}, expected {expected:?}"
            ),
            OptimErr::UnknownParam(id) => write!(f, "unknown parameter {id}"),
            OptimErr::DuplicateParam(id) => {
                write!(f, "parameter {id} appears in more than one parameter group")
            }
            OptimErr::InvalidHyperparameter { name, value } => {
                write!(f, "invalid value for {name}: {value}")
            }
            OptimErr::SparseIndexOutOfBounds { index, len } => {
                write!(f, "sparse index {index} out of bounds for {len} elements")
            }
        }
    }
}

impl Error for OptimErr {}
