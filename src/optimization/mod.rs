mod adagrad;
mod builder;
mod lamb;
mod sgd;

use std::collections::HashSet;

use log::warn;

pub use adagrad::{Adagrad, AdagradConfig, AdagradState, adagrad_update};
pub use builder::{OptimizerBuilder, OptimizerSpec};
pub use lamb::{Lamb, LambConfig, LambState, lamb_update};
pub use sgd::{Sgd, SgdConfig, SgdState, sgd_update};

use crate::{
    error::{OptimErr, Result},
    kernel::{FusedKernels, KernelOp},
    param::{ParamId, ParamStore},
};

/// Defines the strategy for updating model parameters based on their gradients.
pub trait Optimizer {
    /// Performs a single optimization step over every parameter group.
    ///
    /// Parameters without a gradient are skipped.
    ///
    /// # Arguments
    /// * `store` - The parameters to update.
    ///
    /// # Returns
    /// An error if a parameter can't be updated, parameters of the failing group
    /// that come after it are left untouched.
    fn step(&mut self, store: &mut ParamStore) -> Result<()>;

    /// Re-evaluates the loss with `closure` and then performs a step.
    ///
    /// # Arguments
    /// * `store` - The parameters to update.
    /// * `closure` - Called once before the update, it may recompute gradients.
    ///
    /// # Returns
    /// The value returned by `closure`.
    fn step_with_closure<L, F>(&mut self, store: &mut ParamStore, closure: F) -> Result<L>
    where
        Self: Sized,
        F: FnOnce(&mut ParamStore) -> L,
    {
        let loss = closure(store);
        self.step(store)?;
        Ok(loss)
    }

    /// Returns the learning rate of the first parameter group.
    fn lr(&self) -> Option<f32>;

    /// Sets the learning rate of every parameter group.
    fn set_lr(&mut self, lr: f32);

    /// Drops all optimizer state (accumulators, moments, buffers and step counters).
    fn reset(&mut self);
}

impl<T: Optimizer + ?Sized> Optimizer for Box<T> {
    fn step(&mut self, store: &mut ParamStore) -> Result<()> {
        (**self).step(store)
    }

    fn lr(&self) -> Option<f32> {
        (**self).lr()
    }

    fn set_lr(&mut self, lr: f32) {
        (**self).set_lr(lr)
    }

    fn reset(&mut self) {
        (**self).reset()
    }
}

/// Common behaviour of the hyperparameter sets.
pub trait Hyperparameters {
    fn lr(&self) -> f32;

    fn set_lr(&mut self, lr: f32);

    /// Checks every value against its valid range.
    fn validate(&self) -> Result<()>;
}

/// A set of parameters sharing the same hyperparameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamGroup<C> {
    pub params: Vec<ParamId>,
    pub config: C,
}

impl<C> ParamGroup<C> {
    /// Creates a new `ParamGroup`.
    ///
    /// # Arguments
    /// * `params` - The handles of the parameters in this group.
    /// * `config` - The hyperparameters of the group.
    pub fn new(params: impl IntoIterator<Item = ParamId>, config: C) -> Self {
        Self {
            params: params.into_iter().collect(),
            config,
        }
    }
}

/// Validates `group` and appends it to `groups`.
///
/// # Returns
/// An error if the group's hyperparameters are invalid or if it shares a
/// parameter with itself or with an existing group.
pub(crate) fn push_group<C: Hyperparameters>(
    groups: &mut Vec<ParamGroup<C>>,
    group: ParamGroup<C>,
) -> Result<()> {
    group.config.validate()?;

    let mut seen: HashSet<ParamId> = groups.iter().flat_map(|g| g.params.iter().copied()).collect();
    if let Some(&id) = group.params.iter().find(|&&id| !seen.insert(id)) {
        return Err(OptimErr::DuplicateParam(id));
    }

    groups.push(group);
    Ok(())
}

/// `1 - beta^step`, with the exponent saturating at `i32::MAX`.
pub(crate) fn bias_correction(beta: f32, step: u64) -> f32 {
    1. - beta.powi(i32::try_from(step).unwrap_or(i32::MAX))
}

/// Warns when a group asks for fused updates but no kernel set is installed.
pub(crate) fn warn_unfused(op: KernelOp, fused: bool, kernels: Option<&dyn FusedKernels>) {
    if fused && kernels.is_none() {
        warn!(op:% = op; "fused update requested without kernels, using generic path");
    }
}

/// Fails unless `value` is a non negative number.
pub(crate) fn non_negative(name: &'static str, value: f32) -> Result<()> {
    if value >= 0. {
        Ok(())
    } else {
        Err(OptimErr::InvalidHyperparameter { name, value })
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{ArrayD, IxDyn};

    use super::*;
    use crate::param::ParamStorage;

    fn create_test_store(n: usize) -> (ParamStore, Vec<ParamId>) {
        let mut store = ParamStore::new();
        let ids = (0..n)
            .map(|_| store.insert(ParamStorage::full(ArrayD::ones(IxDyn(&[2])))))
            .collect();

        (store, ids)
    }

    #[test]
    fn test_push_group_rejects_duplicates() {
        let (_, ids) = create_test_store(3);
        let mut groups = Vec::new();

        push_group(&mut groups, ParamGroup::new([ids[0], ids[1]], SgdConfig::default())).unwrap();

        let res = push_group(&mut groups, ParamGroup::new([ids[2], ids[1]], SgdConfig::default()));
        assert_eq!(res, Err(OptimErr::DuplicateParam(ids[1])));

        let res = push_group(&mut groups, ParamGroup::new([ids[2], ids[2]], SgdConfig::default()));
        assert_eq!(res, Err(OptimErr::DuplicateParam(ids[2])));

        assert_eq!(groups.len(), 1);
    }

    #[test]
    fn test_push_group_validates_config() {
        let (_, ids) = create_test_store(1);
        let mut groups = Vec::new();
        let config = SgdConfig {
            lr: -1.0,
            ..Default::default()
        };

        let res = push_group(&mut groups, ParamGroup::new(ids, config));
        assert!(matches!(
            res,
            Err(OptimErr::InvalidHyperparameter { name: "lr", .. })
        ));
    }

    #[test]
    fn test_non_negative_rejects_nan() {
        assert!(non_negative("eps", 0.0).is_ok());
        assert!(non_negative("eps", f32::NAN).is_err());
    }

    #[test]
    fn test_bias_correction_saturates_large_steps() {
        assert_eq!(bias_correction(0.5, 1), 0.5);
        assert_eq!(bias_correction(0.5, 2), 0.75);

        // Steps past i32::MAX mustn't wrap around to small or negative exponents.
        assert_eq!(bias_correction(0.999, (1 << 32) + 1), 1.0);
        assert_eq!(bias_correction(0.9, u64::MAX), 1.0);
    }

    #[test]
    fn test_step_with_closure_returns_loss() {
        let (mut store, ids) = create_test_store(1);
        let config = SgdConfig {
            lr: 0.5,
            ..Default::default()
        };
        let mut sgd = Sgd::new(vec![ParamGroup::new(ids.clone(), config)]).unwrap();

        let loss = sgd
            .step_with_closure(&mut store, |store| {
                store.set_grad(ids[0], ArrayD::ones(IxDyn(&[2]))).unwrap();
                42.0
            })
            .unwrap();

        assert_eq!(loss, 42.0);
        assert_eq!(store.storage(ids[0]).unwrap().to_f32()[[0]], 0.5);
    }

    #[test]
    fn test_boxed_optimizer() {
        let (mut store, ids) = create_test_store(1);
        let mut opt: Box<dyn Optimizer> =
            Box::new(Sgd::new(vec![ParamGroup::new(ids.clone(), SgdConfig::default())]).unwrap());

        opt.set_lr(0.25);
        assert_eq!(opt.lr(), Some(0.25));

        store.set_grad(ids[0], ArrayD::ones(IxDyn(&[2]))).unwrap();
        let loss = opt.step_with_closure(&mut store, |_| 1.0).unwrap();
        assert_eq!(loss, 1.0);
        assert_eq!(store.storage(ids[0]).unwrap().to_f32()[[1]], 0.75);
    }
}
