use std::{collections::HashMap, sync::Arc};

use log::{debug, trace};
use ndarray::{ArrayD, ArrayViewD, IxDyn};
use serde::{Deserialize, Serialize};

use super::{
    Hyperparameters, Optimizer, ParamGroup, bias_correction, non_negative, push_group,
    warn_unfused,
};
use crate::{
    error::{OptimErr, Result},
    kernel::{self, FusedKernels, KernelOp, Layout, l2_norm},
    param::{Grad, ParamId, ParamStorage, ParamStore},
};

/// The hyperparameters of a Lamb parameter group.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LambConfig {
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    pub weight_decay: f32,
    pub fused: bool,
}

impl Default for LambConfig {
    fn default() -> Self {
        Self {
            lr: 0.001,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-6,
            weight_decay: 0.,
            fused: false,
        }
    }
}

impl Hyperparameters for LambConfig {
    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    fn validate(&self) -> Result<()> {
        non_negative("lr", self.lr)?;
        non_negative("eps", self.eps)?;
        non_negative("weight_decay", self.weight_decay)?;

        for (name, value) in [("beta1", self.beta1), ("beta2", self.beta2)] {
            if !(0. ..1.).contains(&value) {
                return Err(OptimErr::InvalidHyperparameter { name, value });
            }
        }

        Ok(())
    }
}

/// The per parameter state of Lamb.
#[derive(Debug, Clone, PartialEq)]
pub struct LambState {
    /// First moment estimate.
    pub exp_avg: ArrayD<f32>,
    /// Second moment estimate.
    pub exp_avg_sq: ArrayD<f32>,
    pub step: u64,
}

impl LambState {
    /// Creates a new zeroed `LambState` for a parameter of the given shape.
    pub fn new(shape: &[usize]) -> Self {
        Self {
            exp_avg: ArrayD::zeros(IxDyn(shape)),
            exp_avg_sq: ArrayD::zeros(IxDyn(shape)),
            step: 0,
        }
    }
}

/// Performs a single Lamb update on one parameter.
///
/// The Adam direction is rescaled by the trust ratio `||param|| / ||direction||`,
/// which isn't guarded. A zero direction, such as the one a zero gradient gives on
/// fresh state, makes the ratio infinite and the parameter becomes NaN. A zero
/// parameter gets a zero ratio and never moves.
///
/// # Arguments
/// * `param` - The parameter to update in place.
/// * `grad` - Its gradient, which must be dense.
/// * `exp_avg` - The first moment estimate of the parameter.
/// * `exp_avg_sq` - The second moment estimate of the parameter.
/// * `step` - The step counter, already incremented for this update.
/// * `config` - The hyperparameters of the parameter's group.
/// * `kernels` - The fused kernel set, used when `config.fused` is set.
///
/// # Returns
/// An error if the gradient is sparse or if a tensor doesn't match the
/// parameter's shape.
pub fn lamb_update(
    param: &mut ParamStorage,
    grad: &Grad,
    exp_avg: &mut ArrayD<f32>,
    exp_avg_sq: &mut ArrayD<f32>,
    step: u64,
    config: &LambConfig,
    kernels: Option<&dyn FusedKernels>,
) -> Result<()> {
    let Grad::Dense(grad) = grad else {
        return Err(OptimErr::SparseUnsupported { optimizer: "lamb" });
    };

    param.check_shape("grad", grad.shape())?;
    param.check_shape("exp_avg", exp_avg.shape())?;
    param.check_shape("exp_avg_sq", exp_avg_sq.shape())?;

    let precision = param.precision();
    if let Some(kernels) =
        kernel::select(kernels, config.fused, KernelOp::Lamb, precision, Layout::Dense)
    {
        return kernels.lamb_step(param, grad.view(), exp_avg, exp_avg_sq, step, config);
    }

    let LambConfig {
        lr,
        beta1: b1,
        beta2: b2,
        eps,
        weight_decay: wd,
        ..
    } = *config;

    *exp_avg *= b1;
    exp_avg.scaled_add(1. - b1, grad);
    *exp_avg_sq *= b2;
    exp_avg_sq.scaled_add(1. - b2, &(grad * grad));

    let bc1 = bias_correction(b1, step);
    let bc2 = bias_correction(b2, step);

    param.update_f32(|p| {
        let mut adam_step = adam_direction(exp_avg.view(), exp_avg_sq.view(), bc1, bc2, eps);
        if wd != 0. {
            adam_step.scaled_add(wd, &*p);
        }

        let true_ratio = l2_norm(p.view()) / l2_norm(adam_step.view());
        p.scaled_add(-lr * true_ratio, &adam_step);
    });

    Ok(())
}

/// Bias corrected Adam direction.
fn adam_direction(
    exp_avg: ArrayViewD<f32>,
    exp_avg_sq: ArrayViewD<f32>,
    bc1: f32,
    bc2: f32,
    eps: f32,
) -> ArrayD<f32> {
    let denom = (&exp_avg_sq / bc2).mapv(f32::sqrt) + eps;
    &exp_avg / bc1 / denom
}

/// Layer-wise adaptive moments optimizer.
#[derive(Debug, Default)]
pub struct Lamb {
    groups: Vec<ParamGroup<LambConfig>>,
    state: HashMap<ParamId, LambState>,
    kernels: Option<Arc<dyn FusedKernels>>,
}

impl Lamb {
    /// Creates a new `Lamb` optimizer.
    ///
    /// # Arguments
    /// * `groups` - The parameter groups to optimize.
    ///
    /// # Returns
    /// An error if a group has invalid hyperparameters or shares a parameter with
    /// another group.
    pub fn new(groups: Vec<ParamGroup<LambConfig>>) -> Result<Self> {
        let mut lamb = Self::default();
        for group in groups {
            lamb.add_param_group(group)?;
        }

        Ok(lamb)
    }

    /// Installs the fused kernels used by groups with `fused` set.
    pub fn with_kernels(mut self, kernels: Arc<dyn FusedKernels>) -> Self {
        self.kernels = Some(kernels);
        self
    }

    pub fn add_param_group(&mut self, group: ParamGroup<LambConfig>) -> Result<()> {
        push_group(&mut self.groups, group)
    }

    pub fn param_groups(&self) -> &[ParamGroup<LambConfig>] {
        &self.groups
    }

    pub fn param_groups_mut(&mut self) -> &mut [ParamGroup<LambConfig>] {
        &mut self.groups
    }

    pub fn state(&self, id: ParamId) -> Option<&LambState> {
        self.state.get(&id)
    }
}

impl Optimizer for Lamb {
    fn step(&mut self, store: &mut ParamStore) -> Result<()> {
        let kernels = self.kernels.as_deref();

        for (i, group) in self.groups.iter().enumerate() {
            let config = &group.config;
            warn_unfused(KernelOp::Lamb, config.fused, kernels);

            let mut updated = 0;
            for &id in &group.params {
                let param = store.get_mut(id)?;
                let Some(grad) = &param.grad else {
                    continue;
                };

                let state = self
                    .state
                    .entry(id)
                    .or_insert_with(|| LambState::new(param.storage.shape()));
                state.step += 1;

                trace!(param:% = id, step = state.step; "lamb update");
                lamb_update(
                    &mut param.storage,
                    grad,
                    &mut state.exp_avg,
                    &mut state.exp_avg_sq,
                    state.step,
                    config,
                    kernels,
                )?;
                updated += 1;
            }

            debug!(group = i, params = updated; "lamb group step");
        }

        Ok(())
    }

    fn lr(&self) -> Option<f32> {
        self.groups.first().map(|g| g.config.lr)
    }

    fn set_lr(&mut self, lr: f32) {
        self.groups.iter_mut().for_each(|g| g.config.set_lr(lr));
    }

    fn reset(&mut self) {
        self.state.clear();
    }
}
