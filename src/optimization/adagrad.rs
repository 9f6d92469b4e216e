use std::{collections::HashMap, sync::Arc};

use log::{debug, trace};
use ndarray::{ArrayD, ArrayViewD, IxDyn};
use serde::{Deserialize, Serialize};

use super::{Hyperparameters, Optimizer, ParamGroup, non_negative, push_group, warn_unfused};
use crate::{
    error::{OptimErr, Result},
    kernel::{self, FusedKernels, KernelOp, Layout},
    param::{Grad, ParamId, ParamStorage, ParamStore, SparseGrad},
};

/// The hyperparameters of an Adagrad parameter group.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdagradConfig {
    pub lr: f32,
    pub lr_decay: f32,
    pub weight_decay: f32,
    pub eps: f32,
    pub initial_accumulator_value: f32,
    pub fused: bool,
}

impl Default for AdagradConfig {
    fn default() -> Self {
        Self {
            lr: 0.01,
            lr_decay: 0.,
            weight_decay: 0.,
            eps: 1e-10,
            initial_accumulator_value: 0.,
            fused: false,
        }
    }
}

impl Hyperparameters for AdagradConfig {
    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    fn validate(&self) -> Result<()> {
        non_negative("lr", self.lr)?;
        non_negative("lr_decay", self.lr_decay)?;
        non_negative("weight_decay", self.weight_decay)?;
        non_negative("eps", self.eps)?;
        non_negative("initial_accumulator_value", self.initial_accumulator_value)
    }
}

/// The per parameter state of Adagrad.
#[derive(Debug, Clone, PartialEq)]
pub struct AdagradState {
    /// Running sum of squared gradients.
    pub sum: ArrayD<f32>,
    /// Amount of updates performed, counting the current one.
    pub step: u64,
}

impl AdagradState {
    /// Creates a new `AdagradState`.
    ///
    /// # Arguments
    /// * `shape` - The shape of the parameter.
    /// * `initial_accumulator_value` - The starting value of every accumulator.
    pub fn new(shape: &[usize], initial_accumulator_value: f32) -> Self {
        Self {
            sum: ArrayD::from_elem(IxDyn(shape), initial_accumulator_value),
            step: 0,
        }
    }
}

/// Performs a single Adagrad update on one parameter.
///
/// # Arguments
/// * `param` - The parameter to update in place.
/// * `grad` - Its gradient, dense or sparse.
/// * `state_sum` - The running sum of squared gradients of the parameter.
/// * `step` - The step counter, already incremented for this update.
/// * `config` - The hyperparameters of the parameter's group.
/// * `kernels` - The fused kernel set, used when `config.fused` is set.
///
/// # Returns
/// An error if weight decay is requested with a sparse gradient, or if the
/// gradient or the state don't match the parameter's shape.
pub fn adagrad_update(
    param: &mut ParamStorage,
    grad: &Grad,
    state_sum: &mut ArrayD<f32>,
    step: u64,
    config: &AdagradConfig,
    kernels: Option<&dyn FusedKernels>,
) -> Result<()> {
    param.check_shape("grad", grad.shape())?;
    param.check_shape("state_sum", state_sum.shape())?;

    if let Grad::Dense(g) = grad {
        let precision = param.precision();
        if let Some(kernels) =
            kernel::select(kernels, config.fused, KernelOp::Adagrad, precision, Layout::Dense)
        {
            return kernels.adagrad_step(param, g.view(), state_sum, step, config);
        }
    }

    if config.weight_decay != 0. && grad.is_sparse() {
        return Err(OptimErr::SparseWeightDecay);
    }

    let clr = config.lr / (1. + (step as f32 - 1.) * config.lr_decay);

    match grad {
        Grad::Dense(g) => {
            param.update_f32(|p| dense_update(p, g.view(), state_sum, clr, config));
        }
        Grad::Sparse(g) => sparse_update(param, g, state_sum, clr, config.eps),
    }

    Ok(())
}

fn dense_update(
    param: &mut ArrayD<f32>,
    grad: ArrayViewD<f32>,
    state_sum: &mut ArrayD<f32>,
    clr: f32,
    config: &AdagradConfig,
) {
    let grad = if config.weight_decay != 0. {
        &grad + &(&*param * config.weight_decay)
    } else {
        grad.to_owned()
    };

    *state_sum += &(&grad * &grad);
    let std = state_sum.mapv(f32::sqrt) + config.eps;
    param.scaled_add(-clr, &(&grad / &std));
}

/// Touches only the entries present in the gradient.
fn sparse_update(
    param: &mut ParamStorage,
    grad: &SparseGrad,
    state_sum: &mut ArrayD<f32>,
    clr: f32,
    eps: f32,
) {
    let grad = grad.coalesce();
    if grad.nnz() == 0 {
        return;
    }

    let squares: Vec<f32> = grad.values().iter().map(|v| v * v).collect();
    grad.scatter_add(state_sum, &squares);

    let update: Vec<f32> = grad
        .values()
        .iter()
        .zip(grad.mask(state_sum.view()))
        .map(|(v, sum)| v / (sum.sqrt() + eps))
        .collect();

    param.scatter_add(grad.indices(), &update, -clr);
}

/// Adagrad with per group hyperparameters.
#[derive(Debug, Default)]
pub struct Adagrad {
    groups: Vec<ParamGroup<AdagradConfig>>,
    state: HashMap<ParamId, AdagradState>,
    kernels: Option<Arc<dyn FusedKernels>>,
}

impl Adagrad {
    /// Creates a new `Adagrad` optimizer.
    ///
    /// # Arguments
    /// * `groups` - The parameter groups to optimize.
    ///
    /// # Returns
    /// An error if a group has invalid hyperparameters or shares a parameter with
    /// another group.
    pub fn new(groups: Vec<ParamGroup<AdagradConfig>>) -> Result<Self> {
        let mut adagrad = Self::default();
        for group in groups {
            adagrad.add_param_group(group)?;
        }

        Ok(adagrad)
    }

    /// Installs the fused kernels used by groups with `fused` set.
    pub fn with_kernels(mut self, kernels: Arc<dyn FusedKernels>) -> Self {
        self.kernels = Some(kernels);
        self
    }

    pub fn add_param_group(&mut self, group: ParamGroup<AdagradConfig>) -> Result<()> {
        push_group(&mut self.groups, group)
    }

    pub fn param_groups(&self) -> &[ParamGroup<AdagradConfig>] {
        &self.groups
    }

    pub fn param_groups_mut(&mut self) -> &mut [ParamGroup<AdagradConfig>] {
        &mut self.groups
    }

    /// Returns the state of a parameter, if it was ever updated.
    pub fn state(&self, id: ParamId) -> Option<&AdagradState> {
        self.state.get(&id)
    }
}

impl Optimizer for Adagrad {
    fn step(&mut self, store: &mut ParamStore) -> Result<()> {
        let kernels = self.kernels.as_deref();

        for (i, group) in self.groups.iter().enumerate() {
            let config = &group.config;
            warn_unfused(KernelOp::Adagrad, config.fused, kernels);

            let mut updated = 0;
            for &id in &group.params {
                let param = store.get_mut(id)?;
                let Some(grad) = &param.grad else {
                    continue;
                };

                let state = self.state.entry(id).or_insert_with(|| {
                    AdagradState::new(param.storage.shape(), config.initial_accumulator_value)
                });
                state.step += 1;

                trace!(param:% = id, step = state.step; "adagrad update");
                adagrad_update(
                    &mut param.storage,
                    grad,
                    &mut state.sum,
                    state.step,
                    config,
                    kernels,
                )?;
                updated += 1;
            }

            debug!(group = i, params = updated; "adagrad group step");
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
