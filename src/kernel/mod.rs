//! Fused optimizer kernels.
//!
//! A fused kernel performs a whole per-parameter update in a single call, reading
//! the gradient and the optimizer state once and writing the parameter (all of its
//! precision halves) and the state in place. The only contract is numeric: the
//! result must match the generic update path up to reduced precision rounding.

mod cpu;

use std::fmt;

use log::debug;
use ndarray::{ArrayD, ArrayViewD};

pub use cpu::CpuKernels;
pub(crate) use cpu::l2_norm;

use crate::{
    error::Result,
    optimization::{AdagradConfig, LambConfig, SgdConfig},
    param::{ParamStorage, Precision},
};

/// The update rule a kernel is asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelOp {
    Adagrad,
    Sgd,
    Lamb,
}

impl fmt::Display for KernelOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelOp::Adagrad => f.write_str("adagrad"),
            KernelOp::Sgd => f.write_str("sgd"),
            KernelOp::Lamb => f.write_str("lamb"),
        }
    }
}

/// The memory layout of the gradient handed to an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layout {
    Dense,
    Sparse,
}

/// A set of accelerated single-call optimizer updates.
pub trait FusedKernels: fmt::Debug + Send + Sync {
    /// Returns whether this set has a kernel for the given update.
    ///
    /// # Arguments
    /// * `op` - The update rule.
    /// * `precision` - How the parameter keeps its values.
    /// * `layout` - The layout of the gradient.
    fn available(&self, op: KernelOp, precision: Precision, layout: Layout) -> bool;

    /// Fused Adagrad update.
    ///
    /// ```text
    /// clr = lr / (1 + (step - 1) * lr_decay)
    /// g = grad + weight_decay * param
    /// state_sum += g * g
    /// param -= clr * g / (sqrt(state_sum) + eps)
    /// ```
    fn adagrad_step(
        &self,
        param: &mut ParamStorage,
        grad: ArrayViewD<f32>,
        state_sum: &mut ArrayD<f32>,
        step: u64,
        config: &AdagradConfig,
    ) -> Result<()>;

    /// Fused SGD update over an existing momentum buffer.
    ///
    /// ```text
    /// d_p = grad + weight_decay * param
    /// buf = momentum * buf + (1 - dampening) * d_p
    /// d_p = d_p + momentum * buf    (nesterov)
    /// d_p = buf                     (otherwise)
    /// param -= lr * d_p
    /// ```
    fn sgd_step(
        &self,
        param: &mut ParamStorage,
        grad: ArrayViewD<f32>,
        momentum_buffer: &mut ArrayD<f32>,
        config: &SgdConfig,
    ) -> Result<()>;

    /// Fused Lamb update.
    ///
    /// ```text
    /// exp_avg = beta1 * exp_avg + (1 - beta1) * grad
    /// exp_avg_sq = beta2 * exp_avg_sq + (1 - beta2) * grad^2
    /// u = (exp_avg / bc1) / (sqrt(exp_avg_sq / bc2) + eps) + weight_decay * param
    /// param -= lr * (||param|| / ||u||) * u
    /// ```
    fn lamb_step(
        &self,
        param: &mut ParamStorage,
        grad: ArrayViewD<f32>,
        exp_avg: &mut ArrayD<f32>,
        exp_avg_sq: &mut ArrayD<f32>,
        step: u64,
        config: &LambConfig,
    ) -> Result<()>;
}

/// Picks the kernel set for one update, if the fused path applies.
///
/// # Arguments
/// * `kernels` - The installed kernel set, if any.
/// * `fused` - Whether the fused path was requested.
/// * `op`, `precision`, `layout` - The update being performed.
///
/// # Returns
/// The kernel set when it was requested and it can handle the update.
pub(crate) fn select(
    kernels: Option<&dyn FusedKernels>,
    fused: bool,
    op: KernelOp,
    precision: Precision,
    layout: Layout,
) -> Option<&dyn FusedKernels> {
    if !fused {
        return None;
    }

    let kernels = kernels?;
    if kernels.available(op, precision, layout) {
        return Some(kernels);
    }

    debug!(op:% = op, precision:% = precision; "no fused kernel, using generic path");
    None
}
