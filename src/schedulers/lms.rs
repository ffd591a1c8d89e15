//! Linear multistep sampler over the Karras sigma schedule.

use super::euler::SigmaSchedule;
use super::schedule::NoiseSchedule;
use super::Scheduler;
use crate::error::Result;
use crate::tensor::{weighted_sum, TensorOps};

/// Maximum order of the multistep combination.
const ORDER: usize = 4;

/// Subintervals of the composite Simpson rule; exact for the cubic
/// Lagrange basis polynomials used here.
const SIMPSON_INTERVALS: usize = 16;

/// Linear multistep discrete sampler.
#[derive(Debug, Clone)]
pub struct LmsScheduler<T> {
    inner: SigmaSchedule,
    derivatives: Vec<T>,
}

impl<T> LmsScheduler<T> {
    pub fn new(schedule: NoiseSchedule) -> Self {
        Self {
            inner: SigmaSchedule::new(schedule),
            derivatives: Vec::with_capacity(ORDER),
        }
    }
}

/// Integral over `[sigmas[t], sigmas[t + 1]]` of the Lagrange basis
/// polynomial for `current_order` built on the last `order` sigmas.
fn lms_coefficient(sigmas: &[f64], order: usize, t: usize, current_order: usize) -> f64 {
    let basis = |tau: f64| {
        let mut prod = 1.0;
        for k in 0..order {
            if k == current_order {
                continue;
            }
            prod *= (tau - sigmas[t - k]) / (sigmas[t - current_order] - sigmas[t - k]);
        }
        prod
    };
    simpson(basis, sigmas[t], sigmas[t + 1], SIMPSON_INTERVALS)
}

fn simpson<F: Fn(f64) -> f64>(f: F, a: f64, b: f64, intervals: usize) -> f64 {
    let n = intervals + intervals % 2;
    let h = (b - a) / n as f64;
    let mut sum = f(a) + f(b);
    for i in 1..n {
        let weight = if i % 2 == 1 { 4.0 } else { 2.0 };
        sum += weight * f(a + h * i as f64);
    }
    sum * h / 3.0
}

impl<T: Clone> Scheduler<T> for LmsScheduler<T> {
    fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
        self.derivatives.clear();
        self.inner.set_timesteps(num_inference_steps)
    }

    fn timesteps(&self) -> &[f32] {
        &self.inner.timesteps
    }

    fn init_noise_sigma(&self) -> f32 {
        self.inner.init_noise_sigma()
    }

    fn scale_model_input<B>(&mut self, ops: &mut B, sample: &T, timestep: f32) -> Result<T>
    where
        B: TensorOps<Tensor = T>,
    {
        self.inner.scale_input(ops, sample, timestep)
    }

    fn step<B>(&mut self, ops: &mut B, model_output: &T, timestep: f32, sample: &T) -> Result<T>
    where
        B: TensorOps<Tensor = T>,
    {
        let idx = self.inner.current_index(timestep)?;
        let sigma = self.inner.sigmas[idx];

        let derivative = self.inner.derivative(ops, sigma, model_output, sample)?;
        if self.derivatives.len() == ORDER {
            self.derivatives.remove(0);
        }
        self.derivatives.push(derivative);

        let order = (idx + 1).min(ORDER).min(self.derivatives.len());
        let coefficients: Vec<f32> = (0..order)
            .map(|k| lms_coefficient(&self.inner.sigmas, order, idx, k) as f32)
            .collect();

        let mut terms: Vec<(f32, &T)> = vec![(1.0, sample)];
        terms.extend(coefficients.iter().copied().zip(self.derivatives.iter().rev()));
        let prev = weighted_sum(ops, &terms)?;

        self.inner.advance();
        Ok(prev)
    }
}
