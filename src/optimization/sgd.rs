use std::{collections::HashMap, sync::Arc};

use log::{debug, trace};
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use super::{Hyperparameters, Optimizer, ParamGroup, non_negative, push_group, warn_unfused};
use crate::{
    error::{OptimErr, Result},
    kernel::{self, FusedKernels, KernelOp, Layout},
    param::{Grad, ParamId, ParamStorage, ParamStore},
    precision,
};

/// The hyperparameters of an SGD parameter group.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SgdConfig {
    pub lr: f32,
    pub momentum: f32,
    pub dampening: f32,
    pub weight_decay: f32,
    pub nesterov: bool,
    pub fused: bool,
}

impl Default for SgdConfig {
    fn default() -> Self {
        Self {
            lr: 0.001,
            momentum: 0.,
            dampening: 0.,
            weight_decay: 0.,
            nesterov: false,
            fused: false,
        }
    }
}

impl Hyperparameters for SgdConfig {
    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    fn validate(&self) -> Result<()> {
        non_negative("lr", self.lr)?;
        non_negative("momentum", self.momentum)?;
        non_negative("weight_decay", self.weight_decay)?;

        if self.nesterov {
            if self.momentum <= 0. {
                return Err(OptimErr::InvalidHyperparameter {
                    name: "momentum",
                    value: self.momentum,
                });
            }

            if self.dampening != 0. {
                return Err(OptimErr::InvalidHyperparameter {
                    name: "dampening",
                    value: self.dampening,
                });
            }
        }

        Ok(())
    }
}

/// The per parameter state of SGD.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SgdState {
    /// Only allocated once momentum is in use.
    pub momentum_buffer: Option<ArrayD<f32>>,
}

/// Performs a single SGD update on one parameter.
///
/// Without weight decay nor momentum the gradient is applied straight to the stored
/// values: split parameters use a packed add over both halves and sparse gradients
/// only touch their own entries. Otherwise the update runs in full precision.
///
/// Nesterov adds `momentum * buffer` to the weight decayed gradient, the same
/// `d_p` that feeds the buffer, rather than to the raw gradient.
///
/// # Arguments
/// * `param` - The parameter to update in place.
/// * `grad` - Its gradient, dense or sparse.
/// * `momentum_buffer` - The momentum buffer of the parameter, allocated on first use.
/// * `config` - The hyperparameters of the parameter's group.
/// * `kernels` - The fused kernel set, used when `config.fused` is set.
///
/// # Returns
/// An error if the gradient or the buffer don't match the parameter's shape.
pub fn sgd_update(
    param: &mut ParamStorage,
    grad: &Grad,
    momentum_buffer: &mut Option<ArrayD<f32>>,
    config: &SgdConfig,
    kernels: Option<&dyn FusedKernels>,
) -> Result<()> {
    param.check_shape("grad", grad.shape())?;
    if let Some(buf) = momentum_buffer {
        param.check_shape("momentum_buffer", buf.shape())?;
    }

    if let (Grad::Dense(g), Some(buf)) = (grad, momentum_buffer.as_mut()) {
        let precision = param.precision();
        if let Some(kernels) =
            kernel::select(kernels, config.fused, KernelOp::Sgd, precision, Layout::Dense)
        {
            return kernels.sgd_step(param, g.view(), buf, config);
        }
    }

    let SgdConfig {
        lr,
        momentum: mu,
        dampening,
        weight_decay: wd,
        nesterov,
        ..
    } = *config;

    if wd == 0. && mu == 0. {
        match (grad, &mut *param) {
            (Grad::Dense(g), ParamStorage::Split { stored, trail }) => {
                precision::packed_add_array(stored.view_mut(), trail.view_mut(), g.view(), -lr);
            }
            (Grad::Dense(g), param) => param.update_f32(|p| p.scaled_add(-lr, g)),
            (Grad::Sparse(g), param) => {
                let g = g.coalesce();
                param.scatter_add(g.indices(), g.values(), -lr);
            }
        }

        return Ok(());
    }

    let mut d_p = grad.to_dense();
    param.update_f32(|p| {
        if wd != 0. {
            d_p.scaled_add(wd, &*p);
        }

        if mu == 0. {
            p.scaled_add(-lr, &d_p);
            return;
        }

        let buf = match momentum_buffer.take() {
            Some(mut buf) => {
                buf *= mu;
                buf.scaled_add(1. - dampening, &d_p);
                buf
            }
            None => d_p.clone(),
        };

        if nesterov {
            d_p.scaled_add(mu, &buf);
        } else {
            d_p.assign(&buf);
        }

        p.scaled_add(-lr, &d_p);
        *momentum_buffer = Some(buf);
    });

    Ok(())
}

/// Stochastic gradient descent with optional momentum and Nesterov acceleration.
#[derive(Debug, Default)]
pub struct Sgd {
    groups: Vec<ParamGroup<SgdConfig>>,
    state: HashMap<ParamId, SgdState>,
    kernels: Option<Arc<dyn FusedKernels>>,
}

impl Sgd {
    /// Creates a new `Sgd` optimizer.
    ///
    /// # Arguments
    /// * `groups` - The parameter groups to optimize.
    ///
    /// # Returns
    /// An error if a group has invalid hyperparameters or shares a parameter with
    /// another group.
    pub fn new(groups: Vec<ParamGroup<SgdConfig>>) -> Result<Self> {
        let mut sgd = Self::default();
        for group in groups {
            sgd.add_param_group(group)?;
        }

        Ok(sgd)
    }

    /// Installs the fused kernels used by groups with `fused` set.
    pub fn with_kernels(mut self, kernels: Arc<dyn FusedKernels>) -> Self {
        self.kernels = Some(kernels);
        self
    }

    pub fn add_param_group(&mut self, group: ParamGroup<SgdConfig>) -> Result<()> {
        push_group(&mut self.groups, group)
    }

    pub fn param_groups(&self) -> &[ParamGroup<SgdConfig>] {
        &self.groups
    }

    pub fn param_groups_mut(&mut self) -> &mut [ParamGroup<SgdConfig>] {
        &mut self.groups
    }

    /// Returns the state of a parameter, if it was ever updated.
    pub fn state(&self, id: ParamId) -> Option<&SgdState> {
        self.state.get(&id)
    }
}

/// Updates every parameter of `group` that has a gradient.
///
/// The momentum buffers are moved out of `state` into `buffers`, which the caller
/// writes back once the group is done.
fn step_group(
    store: &mut ParamStore,
    group: &ParamGroup<SgdConfig>,
    state: &mut HashMap<ParamId, SgdState>,
    buffers: &mut Vec<(ParamId, Option<ArrayD<f32>>)>,
    kernels: Option<&dyn FusedKernels>,
) -> Result<usize> {
    let mut updated = 0;

    for &id in &group.params {
        let param = store.get_mut(id)?;
        let Some(grad) = &param.grad else {
            continue;
        };

        let mut buffer = state.remove(&id).and_then(|s| s.momentum_buffer);
        trace!(param:% = id, momentum = buffer.is_some(); "sgd update");

        let res = sgd_update(&mut param.storage, grad, &mut buffer, &group.config, kernels);
        buffers.push((id, buffer));
        res?;

        updated += 1;
    }

    Ok(updated)
}

impl Optimizer for Sgd {
    fn step(&mut self, store: &mut ParamStore) -> Result<()> {
        let kernels = self.kernels.as_deref();

        for (i, group) in self.groups.iter().enumerate() {
            warn_unfused(KernelOp::Sgd, group.config.fused, kernels);

            let mut buffers = Vec::with_capacity(group.params.len());
            let res = step_group(store, group, &mut self.state, &mut buffers, kernels);

            for (id, momentum_buffer) in buffers {
                self.state.insert(id, SgdState { momentum_buffer });
            }

            let updated = res?;
            debug!(group = i, params = updated; "sgd group step");
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

#[cfg(test)]
mod tests {
    use ndarray::IxDyn;

    use super::*;
    use crate::{kernel::CpuKernels, param::SparseGrad};

    fn arr(values: &[f32]) -> ArrayD<f32> {
        ArrayD::from_shape_vec(IxDyn(&[values.len()]), values.to_vec()).unwrap()
    }

    fn assert_close(a: &ArrayD<f32>, b: &ArrayD<f32>, tol: f32) {
        assert_eq!(a.shape(), b.shape());
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() <= tol, "{x} != {y}");
        }
    }

    #[test]
    fn test_plain_step_is_exact() {
        let start = [1.5, -0.25, 3.0];
        let grad = [0.1, 0.7, -2.0];
        let lr = 0.01;

        let mut param = ParamStorage::full(arr(&start));
        let config = SgdConfig {
            lr,
            ..Default::default()
        };
        sgd_update(&mut param, &Grad::Dense(arr(&grad)), &mut None, &config, None).unwrap();

        let expected: Vec<f32> = start.iter().zip(grad).map(|(p, g)| p - lr * g).collect();
        assert_eq!(param.into_full(), arr(&expected));
    }

    #[test]
    fn test_momentum_first_step_scenario() {
        let mut param = ParamStorage::full(arr(&[1.0]));
        let mut buffer = None;
        let config = SgdConfig {
            lr: 0.1,
            momentum: 0.9,
            ..Default::default()
        };

        sgd_update(&mut param, &Grad::Dense(arr(&[0.5])), &mut buffer, &config, None).unwrap();

        assert_eq!(buffer, Some(arr(&[0.5])));
        assert_close(&param.into_full(), &arr(&[0.95]), 1e-7);
    }

    #[test]
    fn test_momentum_accumulates_with_dampening() {
        let mut param = ParamStorage::full(arr(&[1.0]));
        let mut buffer = None;
        let config = SgdConfig {
            lr: 0.1,
            momentum: 0.9,
            dampening: 0.5,
            ..Default::default()
        };
        let grad = Grad::Dense(arr(&[0.5]));

        sgd_update(&mut param, &grad, &mut buffer, &config, None).unwrap();
        sgd_update(&mut param, &grad, &mut buffer, &config, None).unwrap();

        // 0.9 * 0.5 + 0.5 * 0.5
        let buffer = buffer.unwrap();
        assert_close(&buffer, &arr(&[0.7]), 1e-7);
        assert_close(&param.into_full(), &arr(&[0.88]), 1e-6);
    }

    #[test]
    fn test_nesterov() {
        let mut param = ParamStorage::full(arr(&[1.0]));
        let mut buffer = None;
        let config = SgdConfig {
            lr: 0.1,
            momentum: 0.9,
            nesterov: true,
            ..Default::default()
        };

        sgd_update(&mut param, &Grad::Dense(arr(&[0.5])), &mut buffer, &config, None).unwrap();

        assert_close(&param.into_full(), &arr(&[0.905]), 1e-7);
    }

    #[test]
    fn test_nesterov_uses_weight_decayed_grad() {
        let config = SgdConfig {
            lr: 0.1,
            momentum: 0.9,
            weight_decay: 0.5,
            nesterov: true,
            fused: true,
            ..Default::default()
        };
        let grad = Grad::Dense(arr(&[0.5]));

        // d_p = 0.5 + 0.5 * 1 = 1, buffer = 1, update = 1 + 0.9 * 1.
        let mut param = ParamStorage::full(arr(&[1.0]));
        let mut buffer = None;
        sgd_update(&mut param, &grad, &mut buffer, &config, None).unwrap();
        assert_close(&param.into_full(), &arr(&[0.81]), 1e-6);

        // With a buffer of 1: buffer = 0.9 + 1, update = 1 + 0.9 * 1.9.
        let kernel_sets: [Option<&dyn FusedKernels>; 2] = [None, Some(&CpuKernels)];
        for kernels in kernel_sets {
            let mut param = ParamStorage::full(arr(&[1.0]));
            let mut buffer = Some(arr(&[1.0]));
            sgd_update(&mut param, &grad, &mut buffer, &config, kernels).unwrap();

            assert_close(&buffer.unwrap(), &arr(&[1.9]), 1e-6);
            assert_close(&param.into_full(), &arr(&[0.729]), 1e-6);
        }
    }

    #[test]
    fn test_mismatched_split_halves_are_an_error() {
        let mut param = ParamStorage::Split {
            stored: ArrayD::from_elem(IxDyn(&[2]), half::bf16::ONE),
            trail: ArrayD::zeros(IxDyn(&[1])),
        };
        let mut buffer = None;

        let res = sgd_update(
            &mut param,
            &Grad::Dense(arr(&[1.0, 1.0])),
            &mut buffer,
            &SgdConfig::default(),
            None,
        );
        assert!(matches!(
            res,
            Err(OptimErr::PrecisionMismatch { what: "trail", .. })
        ));
    }

    #[test]
    fn test_weight_decay_without_momentum_keeps_no_buffer() {
        let mut param = ParamStorage::full(arr(&[2.0]));
        let mut buffer = None;
        let config = SgdConfig {
            lr: 0.1,
            weight_decay: 0.5,
            ..Default::default()
        };

        sgd_update(&mut param, &Grad::Dense(arr(&[1.0])), &mut buffer, &config, None).unwrap();

        assert!(buffer.is_none());
        assert_close(&param.into_full(), &arr(&[1.8]), 1e-7);
    }

    #[test]
    fn test_split_packed_path_matches_full() {
        let start = [1.0, -3.25, 0.001];
        let grad = Grad::Dense(arr(&[1e-4, 2e-3, -5e-5]));
        let config = SgdConfig {
            lr: 0.1,
            ..Default::default()
        };

        let mut full = ParamStorage::full(arr(&start));
        let mut split = ParamStorage::split(arr(&start));
        for _ in 0..10 {
            sgd_update(&mut full, &grad, &mut None, &config, None).unwrap();
            sgd_update(&mut split, &grad, &mut None, &config, None).unwrap();
        }

        assert_eq!(split.to_f32(), full.to_f32());
    }

    #[test]
    fn test_split_promoted_path_matches_full() {
        let grad = Grad::Dense(arr(&[1e-4, -2e-4]));
        let config = SgdConfig {
            lr: 0.1,
            momentum: 0.9,
            weight_decay: 0.01,
            ..Default::default()
        };

        let mut full = ParamStorage::full(arr(&[1.0, 2.0]));
        let mut split = ParamStorage::split(arr(&[1.0, 2.0]));
        let (mut full_buf, mut split_buf) = (None, None);
        for _ in 0..5 {
            sgd_update(&mut full, &grad, &mut full_buf, &config, None).unwrap();
            sgd_update(&mut split, &grad, &mut split_buf, &config, None).unwrap();
        }

        assert_eq!(split.to_f32(), full.to_f32());
        assert_eq!(split_buf, full_buf);
    }

    #[test]
    fn test_shadow_is_refreshed() {
        let mut param = ParamStorage::shadowed(arr(&[1.0]));
        let config = SgdConfig {
            lr: 1.0,
            ..Default::default()
        };

        sgd_update(&mut param, &Grad::Dense(arr(&[-1.5])), &mut None, &config, None).unwrap();

        assert_eq!(param.bf16_view().unwrap()[[0]].to_f32(), 2.5);
    }

    #[test]
    fn test_sparse_without_promotion() {
        let mut param = ParamStorage::split(arr(&[1.0, 2.0, 3.0]));
        let grad = SparseGrad::from_flat(&[3], vec![2, 0, 2], vec![1.0, 2.0, 1.0]).unwrap();
        let config = SgdConfig {
            lr: 0.5,
            ..Default::default()
        };

        sgd_update(&mut param, &Grad::Sparse(grad), &mut None, &config, None).unwrap();

        assert_eq!(param.to_f32(), arr(&[0.0, 2.0, 2.0]));
    }

    #[test]
    fn test_sparse_with_momentum_is_densified() {
        let mut param = ParamStorage::full(arr(&[1.0, 2.0]));
        let grad = SparseGrad::from_flat(&[2], vec![1], vec![1.0]).unwrap();
        let mut buffer = None;
        let config = SgdConfig {
            lr: 0.5,
            momentum: 0.9,
            ..Default::default()
        };

        sgd_update(&mut param, &Grad::Sparse(grad), &mut buffer, &config, None).unwrap();

        assert_eq!(buffer, Some(arr(&[0.0, 1.0])));
        assert_eq!(param.into_full(), arr(&[1.0, 1.5]));
    }

    #[test]
    fn test_fused_matches_generic_once_buffer_exists() {
        let grad = Grad::Dense(arr(&[0.1, -0.2, 0.3]));
        let config = SgdConfig {
            lr: 0.05,
            momentum: 0.9,
            weight_decay: 0.01,
            nesterov: true,
            fused: true,
            ..Default::default()
        };

        let mut generic = ParamStorage::shadowed(arr(&[1.0, -1.0, 0.5]));
        let mut fused = generic.clone();
        let (mut generic_buf, mut fused_buf) = (None, None);

        for _ in 0..3 {
            sgd_update(&mut generic, &grad, &mut generic_buf, &config, None).unwrap();
            sgd_update(&mut fused, &grad, &mut fused_buf, &config, Some(&CpuKernels)).unwrap();
        }

        assert_close(&generic_buf.unwrap(), &fused_buf.unwrap(), 1e-6);
        assert_close(&generic.to_f32(), &fused.to_f32(), 1e-6);
    }

    #[test]
    fn test_driver_writes_back_buffers() {
        let mut store = ParamStore::new();
        let a = store.insert(ParamStorage::full(arr(&[1.0])));
        let b = store.insert(ParamStorage::full(arr(&[1.0])));
        let config = SgdConfig {
            lr: 0.1,
            momentum: 0.9,
            ..Default::default()
        };
        let mut sgd = Sgd::new(vec![ParamGroup::new([a, b], config)]).unwrap();

        store.set_grad(a, arr(&[0.5])).unwrap();
        sgd.step(&mut store).unwrap();

        let buffer = sgd.state(a).unwrap().momentum_buffer.as_ref().unwrap();
        assert_eq!(buffer, &arr(&[0.5]));
        assert!(sgd.state(b).is_none());

        sgd.step(&mut store).unwrap();
        let buffer = sgd.state(a).unwrap().momentum_buffer.as_ref().unwrap();
        assert_close(buffer, &arr(&[0.95]), 1e-7);
    }

    #[test]
    fn test_driver_keeps_buffers_on_error() {
        let mut store = ParamStore::new();
        let a = store.insert(ParamStorage::full(arr(&[1.0])));
        let config = SgdConfig {
            lr: 0.1,
            momentum: 0.9,
            ..Default::default()
        };
        let mut sgd = Sgd::new(vec![ParamGroup::new([a], config)]).unwrap();

        store.set_grad(a, arr(&[0.5])).unwrap();
        sgd.step(&mut store).unwrap();

        let (_, foreign) = {
            let mut other = ParamStore::new();
            other.insert(ParamStorage::full(arr(&[1.0])));
            let id = other.insert(ParamStorage::full(arr(&[1.0])));
            (other, id)
        };
        sgd.param_groups_mut()[0].params.push(foreign);

        let res = sgd.step(&mut store);
        assert_eq!(res, Err(OptimErr::UnknownParam(foreign)));
        assert!(sgd.state(a).unwrap().momentum_buffer.is_some());
    }

    #[test]
    fn test_nesterov_requires_momentum() {
        let config = SgdConfig {
            nesterov: true,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(OptimErr::InvalidHyperparameter { name: "momentum", .. })
        ));

        let config = SgdConfig {
            nesterov: true,
            momentum: 0.9,
            dampening: 0.1,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(OptimErr::InvalidHyperparameter { name: "dampening", .. })
        ));
    }
}
