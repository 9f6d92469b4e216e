use std::sync::Arc;

use log::info;
use serde::{Deserialize, Serialize};

use super::{Adagrad, AdagradConfig, Lamb, LambConfig, Optimizer, ParamGroup, Sgd, SgdConfig};
use crate::{error::Result, kernel::FusedKernels, param::ParamId};

/// Which optimizer to build, together with its hyperparameters.
///
/// ```json
/// { "sgd": { "lr": 0.1, "momentum": 0.9 } }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerSpec {
    Adagrad(AdagradConfig),
    Sgd(SgdConfig),
    Lamb(LambConfig),
}

impl OptimizerSpec {
    /// Returns whether the spec asks for fused updates.
    pub fn fused(&self) -> bool {
        match self {
            OptimizerSpec::Adagrad(config) => config.fused,
            OptimizerSpec::Sgd(config) => config.fused,
            OptimizerSpec::Lamb(config) => config.fused,
        }
    }
}

/// Creates a single group optimizer and installs the kernels, if any.
macro_rules! with_single_group {
    ($optimizer:ident, $config:expr, $params:expr, $kernels:expr) => {{
        let mut optimizer = $optimizer::new(vec![ParamGroup::new($params, $config)])?;
        if let Some(kernels) = $kernels {
            optimizer = optimizer.with_kernels(kernels);
        }

        Box::new(optimizer) as Box<dyn Optimizer>
    }};
}

/// Builds optimizers from their specification.
#[derive(Debug, Default, Clone)]
pub struct OptimizerBuilder {
    kernels: Option<Arc<dyn FusedKernels>>,
}

impl OptimizerBuilder {
    /// Creates a new `OptimizerBuilder` without fused kernels.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every built optimizer use `kernels` for its fused groups.
    pub fn with_kernels(mut self, kernels: Arc<dyn FusedKernels>) -> Self {
        self.kernels = Some(kernels);
        self
    }

    /// Builds an optimizer following a spec.
    ///
    /// # Arguments
    /// * `spec` - The specification of the optimizer.
    /// * `params` - The parameters it will update, as a single group.
    ///
    /// # Returns
    /// A new optimizer or an error if the hyperparameters are invalid.
    pub fn build(
        &self,
        spec: OptimizerSpec,
        params: impl IntoIterator<Item = ParamId>,
    ) -> Result<Box<dyn Optimizer>> {
        let kernels = self.kernels.clone();
        info!(spec:? = spec, kernels = kernels.is_some(); "building optimizer");

        let optimizer: Box<dyn Optimizer> = match spec {
            OptimizerSpec::Adagrad(config) => with_single_group!(Adagrad, config, params, kernels),
            OptimizerSpec::Sgd(config) => with_single_group!(Sgd, config, params, kernels),
            OptimizerSpec::Lamb(config) => with_single_group!(Lamb, config, params, kernels),
        };

        Ok(optimizer)
    }
}
