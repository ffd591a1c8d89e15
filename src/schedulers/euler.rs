//! Euler and Euler-ancestral samplers over the Karras sigma schedule.

use super::schedule::{index_for_timestep, NoiseSchedule, PredictionType};
use super::{step_seed, Scheduler};
use crate::error::Result;
use crate::tensor::{weighted_sum, TensorOps};

/// Sigma schedule and step tracking shared by the sigma-space samplers.
#[derive(Debug, Clone)]
pub(crate) struct SigmaSchedule {
    pub schedule: NoiseSchedule,
    pub timesteps: Vec<f32>,
    /// One sigma per timestep followed by a trailing 0.0.
    pub sigmas: Vec<f64>,
    pub step_index: Option<usize>,
}

impl SigmaSchedule {
    pub fn new(schedule: NoiseSchedule) -> Self {
        Self {
            schedule,
            timesteps: Vec::new(),
            sigmas: Vec::new(),
            step_index: None,
        }
    }

    pub fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
        self.timesteps = self.schedule.leading_timesteps(num_inference_steps)?;
        self.sigmas = self
            .timesteps
            .iter()
            .map(|&t| self.schedule.sigma_at(t as usize))
            .collect();
        self.sigmas.push(0.0);
        self.step_index = None;
        Ok(())
    }

    /// `sqrt(sigma_max^2 + 1)` for leading spacing.
    pub fn init_noise_sigma(&self) -> f32 {
        let max = self.sigmas.iter().copied().fold(0.0_f64, f64::max);
        (max * max + 1.0).sqrt() as f32
    }

    /// Current step index, resolved from the timestep on first use.
    pub fn current_index(&mut self, timestep: f32) -> Result<usize> {
        match self.step_index {
            Some(idx) => Ok(idx),
            None => {
                let idx = index_for_timestep(&self.timesteps, timestep)?;
                self.step_index = Some(idx);
                Ok(idx)
            }
        }
    }

    pub fn advance(&mut self) {
        self.step_index = self.step_index.map(|i| i + 1);
    }

    /// Divides the sample by `sqrt(sigma^2 + 1)`.
    pub fn scale_input<B: TensorOps>(
        &mut self,
        ops: &mut B,
        sample: &B::Tensor,
        timestep: f32,
    ) -> Result<B::Tensor> {
        let idx = self.current_index(timestep)?;
        let sigma = self.sigmas[idx];
        ops.scale(sample, (1.0 / (sigma * sigma + 1.0).sqrt()) as f32)
    }

    /// Derivative `(x - x0) / sigma` of the probability-flow ODE.
    pub fn derivative<B: TensorOps>(
        &self,
        ops: &mut B,
        sigma: f64,
        model_output: &B::Tensor,
        sample: &B::Tensor,
    ) -> Result<B::Tensor> {
        let x0 = match self.schedule.config.prediction_type {
            PredictionType::Epsilon => {
                weighted_sum(ops, &[(1.0, sample), (-sigma as f32, model_output)])?
            }
            PredictionType::VPrediction => {
                let denom = sigma * sigma + 1.0;
                weighted_sum(
                    ops,
                    &[
                        ((-sigma / denom.sqrt()) as f32, model_output),
                        ((1.0 / denom) as f32, sample),
                    ],
                )?
            }
        };
        let diff = ops.sub(sample, &x0)?;
        ops.scale(&diff, (1.0 / sigma) as f32)
    }
}

/// Euler discrete sampler.
#[derive(Debug, Clone)]
pub struct EulerScheduler {
    inner: SigmaSchedule,
}

impl EulerScheduler {
    pub fn new(schedule: NoiseSchedule) -> Self {
        Self {
            inner: SigmaSchedule::new(schedule),
        }
    }

    pub fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
        self.inner.set_timesteps(num_inference_steps)
    }

    pub fn timesteps(&self) -> &[f32] {
        &self.inner.timesteps
    }

    pub fn init_noise_sigma(&self) -> f32 {
        self.inner.init_noise_sigma()
    }

    /// Sigmas of the inference schedule, including the trailing zero.
    pub fn sigmas(&self) -> &[f64] {
        &self.inner.sigmas
    }
}

impl<T: Clone> Scheduler<T> for EulerScheduler {
    fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
        EulerScheduler::set_timesteps(self, num_inference_steps)
    }

    fn timesteps(&self) -> &[f32] {
        EulerScheduler::timesteps(self)
    }

    fn init_noise_sigma(&self) -> f32 {
        EulerScheduler::init_noise_sigma(self)
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
        let sigma_next = self.inner.sigmas[idx + 1];

        let derivative = self.inner.derivative(ops, sigma, model_output, sample)?;
        let prev = weighted_sum(
            ops,
            &[(1.0, sample), ((sigma_next - sigma) as f32, &derivative)],
        )?;

        self.inner.advance();
        Ok(prev)
    }
}

/// Euler ancestral sampler: Euler step to `sigma_down` plus fresh noise of
/// scale `sigma_up`.
#[derive(Debug, Clone)]
pub struct EulerAncestralScheduler {
    inner: SigmaSchedule,
    seed: u64,
}

impl EulerAncestralScheduler {
    pub fn new(schedule: NoiseSchedule, seed: u64) -> Self {
        Self {
            inner: SigmaSchedule::new(schedule),
            seed,
        }
    }

    pub fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
        self.inner.set_timesteps(num_inference_steps)
    }

    pub fn timesteps(&self) -> &[f32] {
        &self.inner.timesteps
    }

    pub fn init_noise_sigma(&self) -> f32 {
        self.inner.init_noise_sigma()
    }
}

/// Splits the transition `sigma_from -> sigma_to` into deterministic and
/// stochastic parts.
fn ancestral_sigmas(sigma_from: f64, sigma_to: f64) -> (f64, f64) {
    let up_sq = sigma_to * sigma_to * (sigma_from * sigma_from - sigma_to * sigma_to)
        / (sigma_from * sigma_from);
    let sigma_up = up_sq.max(0.0).sqrt();
    let sigma_down = (sigma_to * sigma_to - sigma_up * sigma_up).max(0.0).sqrt();
    (sigma_up, sigma_down)
}

impl<T: Clone> Scheduler<T> for EulerAncestralScheduler {
    fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
        EulerAncestralScheduler::set_timesteps(self, num_inference_steps)
    }

    fn timesteps(&self) -> &[f32] {
        EulerAncestralScheduler::timesteps(self)
    }

    fn init_noise_sigma(&self) -> f32 {
        EulerAncestralScheduler::init_noise_sigma(self)
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
        let sigma_next = self.inner.sigmas[idx + 1];
        let (sigma_up, sigma_down) = ancestral_sigmas(sigma, sigma_next);

        let derivative = self.inner.derivative(ops, sigma, model_output, sample)?;
        let mut prev = weighted_sum(
            ops,
            &[(1.0, sample), ((sigma_down - sigma) as f32, &derivative)],
        )?;

        if sigma_up > 0.0 {
            let noise = ops.noise_like(sample, step_seed(self.seed, idx))?;
            let scaled = ops.scale(&noise, sigma_up as f32)?;
            prev = ops.add(&prev, &scaled)?;
        }

        self.inner.advance();
        Ok(prev)
    }
}
