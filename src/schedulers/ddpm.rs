//! DDPM ancestral sampler with "fixed_small" variance.

use super::ddim::predict_original;
use super::schedule::NoiseSchedule;
use super::{step_seed, Scheduler};
use crate::error::Result;
use crate::tensor::{weighted_sum, TensorOps};

/// Denoising diffusion probabilistic models sampler.
#[derive(Debug, Clone)]
pub struct DdpmScheduler {
    schedule: NoiseSchedule,
    timesteps: Vec<f32>,
    step_ratio: usize,
    seed: u64,
    step_index: usize,
}

impl DdpmScheduler {
    pub fn new(schedule: NoiseSchedule, seed: u64) -> Self {
        Self {
            schedule,
            timesteps: Vec::new(),
            step_ratio: 0,
            seed,
            step_index: 0,
        }
    }

    pub fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
        self.timesteps = self.schedule.leading_timesteps(num_inference_steps)?;
        self.step_ratio = self.schedule.step_ratio(num_inference_steps);
        self.step_index = 0;
        Ok(())
    }

    pub fn timesteps(&self) -> &[f32] {
        &self.timesteps
    }

    pub fn init_noise_sigma(&self) -> f32 {
        1.0
    }

    /// Posterior variance between `t` and `prev_t`, clamped away from zero.
    fn variance(alpha_prod_t: f64, alpha_prod_prev: f64) -> f64 {
        let current_beta = 1.0 - alpha_prod_t / alpha_prod_prev;
        let variance = (1.0 - alpha_prod_prev) / (1.0 - alpha_prod_t) * current_beta;
        variance.max(1e-20)
    }
}

impl<T: Clone> Scheduler<T> for DdpmScheduler {
    fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
        DdpmScheduler::set_timesteps(self, num_inference_steps)
    }

    fn timesteps(&self) -> &[f32] {
        DdpmScheduler::timesteps(self)
    }

    fn init_noise_sigma(&self) -> f32 {
        DdpmScheduler::init_noise_sigma(self)
    }

    fn scale_model_input<B>(&mut self, _ops: &mut B, sample: &T, _timestep: f32) -> Result<T>
    where
        B: TensorOps<Tensor = T>,
    {
        Ok(sample.clone())
    }

    fn step<B>(&mut self, ops: &mut B, model_output: &T, timestep: f32, sample: &T) -> Result<T>
    where
        B: TensorOps<Tensor = T>,
    {
        let t = timestep as i64;
        let prev_t = t - self.step_ratio as i64;
        let alpha_prod_t = self.schedule.alpha_prod(t, 1.0);
        let alpha_prod_prev = self.schedule.alpha_prod(prev_t, 1.0);
        let beta_prod_t = 1.0 - alpha_prod_t;
        let beta_prod_prev = 1.0 - alpha_prod_prev;
        let current_alpha = alpha_prod_t / alpha_prod_prev;
        let current_beta = 1.0 - current_alpha;

        let (x0, _) = predict_original(
            ops,
            self.schedule.config.prediction_type,
            alpha_prod_t,
            model_output,
            sample,
        )?;

        let original_coeff = alpha_prod_prev.sqrt() * current_beta / beta_prod_t;
        let sample_coeff = current_alpha.sqrt() * beta_prod_prev / beta_prod_t;
        let mut prev = weighted_sum(
            ops,
            &[(original_coeff as f32, &x0), (sample_coeff as f32, sample)],
        )?;

        if t > 0 {
            let std_dev = Self::variance(alpha_prod_t, alpha_prod_prev).sqrt();
            let noise = ops.noise_like(sample, step_seed(self.seed, self.step_index))?;
            let scaled = ops.scale(&noise, std_dev as f32)?;
            prev = ops.add(&prev, &scaled)?;
        }

        self.step_index += 1;
        Ok(prev)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedulers::ScheduleConfig;
    use crate::tensor::EagerOps;
    use ndarray::{ArrayD, IxDyn};

    fn run(seed: u64) -> ArrayD<f32> {
        let mut scheduler = DdpmScheduler::new(NoiseSchedule::new(ScheduleConfig::default()), seed);
        scheduler.set_timesteps(4).unwrap();
        let mut ops = EagerOps::without_network();
        let mut x = ArrayD::from_elem(IxDyn(&[1, 4, 4, 4]), 0.2_f32);
        let eps = ArrayD::from_elem(IxDyn(&[1, 4, 4, 4]), 0.1_f32);
        for t in scheduler.timesteps().to_vec() {
            x = scheduler.step(&mut ops, &eps, t, &x).unwrap();
        }
        x
    }

    #[test]
    fn ddpm_same_seed_same_result() {
        assert_eq!(run(3), run(3));
    }

    #[test]
    fn ddpm_different_seed_different_result() {
        assert_ne!(run(3), run(4));
    }

    #[test]
    fn variance_positive() {
        let schedule = NoiseSchedule::new(ScheduleConfig::default());
        let v = DdpmScheduler::variance(schedule.alphas_cumprod[500], schedule.alphas_cumprod[250]);
        assert!(v > 0.0 && v < 1.0);
    }
}
