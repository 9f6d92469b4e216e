use std::{env, fs, sync::Arc};

use anyhow::{Context, bail};
use log::{debug, info};
use ndarray::{Array1, Array2, Ix1};
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::Deserialize;

use mixed_optim::{
    CpuKernels, Optimizer, OptimizerBuilder, OptimizerSpec, ParamId, ParamStorage, ParamStore,
    Precision,
};

/// A least squares problem solved with one of the optimizers.
#[derive(Debug, Deserialize)]
struct TrainingConfig {
    optimizer: OptimizerSpec,
    #[serde(default = "default_steps")]
    steps: usize,
    #[serde(default = "default_features")]
    features: usize,
    #[serde(default = "default_samples")]
    samples: usize,
    seed: Option<u64>,
    #[serde(default)]
    precision: Precision,
    #[serde(default = "default_log_every")]
    log_every: usize,
}

fn default_steps() -> usize {
    100
}

fn default_features() -> usize {
    8
}

fn default_samples() -> usize {
    64
}

fn default_log_every() -> usize {
    10
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let Some(path) = env::args().nth(1) else {
        bail!("usage: mixed-optim <config.json>");
    };

    let raw = fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    let config: TrainingConfig =
        serde_json::from_str(&raw).with_context(|| format!("parsing {path}"))?;
    debug!(config:? = config; "loaded training config");

    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };

    let (x, y) = generate_problem(&mut rng, config.samples, config.features);
    let init: Array1<f32> =
        Array1::from_shape_fn(config.features, |_| rng.random_range(-0.5..0.5));

    let storage = match config.precision {
        Precision::Full => ParamStorage::full(init.into_dyn()),
        Precision::Split => ParamStorage::split(init.into_dyn()),
        Precision::Shadowed => ParamStorage::shadowed(init.into_dyn()),
    };

    let mut store = ParamStore::new();
    let id = store.insert(storage);

    let mut builder = OptimizerBuilder::new();
    if config.optimizer.fused() {
        builder = builder.with_kernels(Arc::new(CpuKernels::new()));
    }
    let mut optimizer = builder.build(config.optimizer, [id])?;

    info!(
        precision:% = config.precision,
        samples = config.samples,
        features = config.features;
        "training for {} steps",
        config.steps
    );

    let log_every = config.log_every.max(1);
    for step in 0..config.steps {
        let loss =
            optimizer.step_with_closure(&mut store, |store| evaluate(store, id, &x, &y))??;

        if step % log_every == 0 {
            info!(step = step, loss = loss; "step done");
        }
    }

    let loss = evaluate(&mut store, id, &x, &y)?;
    info!(loss = loss; "training finished");

    Ok(())
}

/// Generates `samples` rows of random features and their exact linear targets.
fn generate_problem(
    rng: &mut StdRng,
    samples: usize,
    features: usize,
) -> (Array2<f32>, Array1<f32>) {
    let x: Array2<f32> =
        Array2::from_shape_fn((samples, features), |_| rng.random_range(-1.0..1.0));
    let w: Array1<f32> = Array1::from_shape_fn(features, |_| rng.random_range(-2.0..2.0));
    let y = x.dot(&w);
    (x, y)
}

/// Computes the mean squared error of the current weights and attaches its gradient.
fn evaluate(
    store: &mut ParamStore,
    id: ParamId,
    x: &Array2<f32>,
    y: &Array1<f32>,
) -> anyhow::Result<f32> {
    let w = store.storage(id)?.to_f32().into_dimensionality::<Ix1>()?;
    let n = x.nrows() as f32;

    let residual = x.dot(&w) - y;
    let loss = residual.dot(&residual) / (2. * n);
    let grad = x.t().dot(&residual) / n;

    store.set_grad(id, grad.into_dyn())?;
    Ok(loss)
}
