//! Functional optimizers for bf16 training.
//!
//! Adagrad, SGD (with momentum and Nesterov acceleration) and Lamb update the
//! parameters of a [`ParamStore`] in place. Parameters may keep their values as
//! plain f32, as bf16 plus a trail with the lost mantissa bits, or as f32 with a
//! bf16 shadow copy; the optimizers always compute in f32 and write every
//! representation back. Installing a [`FusedKernels`] set lets groups with
//! `fused` enabled run each update as a single kernel call.

pub mod error;
pub mod kernel;
pub mod optimization;
pub mod param;
pub mod precision;

pub use error::{OptimErr, Result};
pub use kernel::{CpuKernels, FusedKernels};
pub use optimization::{
    Adagrad, AdagradConfig, Lamb, LambConfig, Optimizer, OptimizerBuilder, OptimizerSpec,
    ParamGroup, Sgd, SgdConfig,
};
pub use param::{Grad, ParamId, ParamStorage, ParamStore, Precision, SparseGrad};
