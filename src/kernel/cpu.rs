use half::bf16;
use ndarray::{ArrayD, ArrayViewD, Zip};

use super::{FusedKernels, KernelOp, Layout};
use crate::{
    error::Result,
    optimization::{AdagradConfig, LambConfig, SgdConfig, bias_correction},
    param::{ParamStorage, Precision},
    precision::{combine, split},
};

/// Runs `$body` once per element with `$p` bound to the full precision value of
/// the parameter, writing it back to every precision half afterwards.
///
/// Each variant needs its own `Zip` since the halves are separate producers, this
/// macro keeps the element-wise body in a single place.
macro_rules! for_each_param {
    ($param:expr, ($($arr:expr),+), |$p:ident, $($x:pat_param),+| $body:block) => {
        match &mut *$param {
            ParamStorage::Full(values) => {
                Zip::from(values)
                    $(.and($arr))+
                    .par_for_each(|$p: &mut f32, $($x),+| $body);
            }
            ParamStorage::Split { stored, trail } => {
                Zip::from(stored)
                    .and(trail)
                    $(.and($arr))+
                    .par_for_each(|h: &mut bf16, l: &mut u16, $($x),+| {
                        let mut full = combine(*h, *l);
                        {
                            let $p = &mut full;
                            $body
                        }
                        (*h, *l) = split(full);
                    });
            }
            ParamStorage::Shadowed { master, shadow } => {
                Zip::from(master)
                    .and(shadow)
                    $(.and($arr))+
                    .par_for_each(|m: &mut f32, s: &mut bf16, $($x),+| {
                        {
                            let $p = &mut *m;
                            $body
                        }
                        *s = bf16::from_f32(*m);
                    });
            }
        }
    };
}

/// Portable fused kernels.
///
/// Every update walks the tensors once (twice for Lamb, which needs the norms of
/// the whole parameter before applying it), split over the rayon thread pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuKernels;

impl CpuKernels {
    /// Creates a new `CpuKernels`.
    pub fn new() -> Self {
        Self
    }
}

impl FusedKernels for CpuKernels {
    fn available(&self, _op: KernelOp, _precision: Precision, layout: Layout) -> bool {
        layout == Layout::Dense
    }

    fn adagrad_step(
        &self,
        param: &mut ParamStorage,
        grad: ArrayViewD<f32>,
        state_sum: &mut ArrayD<f32>,
        step: u64,
        config: &AdagradConfig,
    ) -> Result<()> {
        param.check_shape("grad", grad.shape())?;
        param.check_shape("state_sum", state_sum.shape())?;

        let AdagradConfig {
            lr,
            lr_decay,
            weight_decay: wd,
            eps,
            ..
        } = *config;
        let clr = lr / (1. + (step as f32 - 1.) * lr_decay);

        for_each_param!(param, (grad, &mut *state_sum), |p, &g, s| {
            let g = g + wd * *p;
            *s += g * g;
            *p -= clr * g / (s.sqrt() + eps);
        });

        Ok(())
    }

    fn sgd_step(
        &self,
        param: &mut ParamStorage,
        grad: ArrayViewD<f32>,
        momentum_buffer: &mut ArrayD<f32>,
        config: &SgdConfig,
    ) -> Result<()> {
        param.check_shape("grad", grad.shape())?;
        param.check_shape("momentum_buffer", momentum_buffer.shape())?;

        let SgdConfig {
            lr,
            momentum: mu,
            dampening,
            weight_decay: wd,
            nesterov,
            ..
        } = *config;

        for_each_param!(param, (grad, &mut *momentum_buffer), |p, &g, buf| {
            let d_p = g + wd * *p;
            *buf = mu * *buf + (1. - dampening) * d_p;
            let d_p = if nesterov { d_p + mu * *buf } else { *buf };
            *p -= lr * d_p;
        });

        Ok(())
    }

    fn lamb_step(
        &self,
        param: &mut ParamStorage,
        grad: ArrayViewD<f32>,
        exp_avg: &mut ArrayD<f32>,
        exp_avg_sq: &mut ArrayD<f32>,
        step: u64,
        config: &LambConfig,
    ) -> Result<()> {
        param.check_shape("grad", grad.shape())?;
        param.check_shape("exp_avg", exp_avg.shape())?;
        param.check_shape("exp_avg_sq", exp_avg_sq.shape())?;

        let LambConfig {
            lr,
            beta1: b1,
            beta2: b2,
            eps,
            weight_decay: wd,
            ..
        } = *config;
        let bc1 = bias_correction(b1, step);
        let bc2 = bias_correction(b2, step);

        let mut adam_step = ArrayD::<f32>::zeros(grad.raw_dim());
        for_each_param!(
            param,
            (grad, &mut *exp_avg, &mut *exp_avg_sq, &mut adam_step),
            |p, &g, m, v, u| {
                *m = b1 * *m + (1. - b1) * g;
                *v = b2 * *v + (1. - b2) * g * g;
                *u = (*m / bc1) / ((*v / bc2).sqrt() + eps) + wd * *p;
            }
        );

        let weight_norm = param.with_f32(l2_norm);
        let true_ratio = weight_norm / l2_norm(adam_step.view());
        let alpha = lr * true_ratio;

        for_each_param!(param, (&adam_step), |p, &u| {
            *p -= alpha * u;
        });

        Ok(())
    }
}

/// Euclidean norm, accumulated in f64.
pub(crate) fn l2_norm(values: ArrayViewD<f32>) -> f32 {
    values
        .iter()
        .map(|&x| f64::from(x) * f64::from(x))
        .sum::<f64>()
        .sqrt() as f32
}
