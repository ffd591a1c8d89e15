//! PNDM scheduler in its PLMS form (Runge-Kutta warm-up skipped).
//!
//! Keeps the last four noise predictions and combines them with
//! Adams-Bashforth coefficients. The first step is first order, so the
//! sampler consumes exactly one timestep per inference step.

use super::schedule::{NoiseSchedule, PredictionType};
use super::Scheduler;
use crate::error::Result;
use crate::tensor::{weighted_sum, TensorOps};

/// Number of past predictions kept for the multistep combination.
const HISTORY: usize = 4;

/// Pseudo numerical methods for diffusion models.
#[derive(Debug, Clone)]
pub struct PndmScheduler<T> {
    schedule: NoiseSchedule,
    timesteps: Vec<f32>,
    step_ratio: usize,
    ets: Vec<T>,
}

impl<T> PndmScheduler<T> {
    pub fn new(schedule: NoiseSchedule) -> Self {
        Self {
            schedule,
            timesteps: Vec::new(),
            step_ratio: 0,
            ets: Vec::with_capacity(HISTORY),
        }
    }

    /// Number of stored noise predictions.
    pub fn history_len(&self) -> usize {
        self.ets.len()
    }
}

/// Adams-Bashforth weights for `n` stored predictions, newest first.
fn multistep_coefficients(n: usize) -> &'static [f32] {
    match n {
        0 | 1 => &[1.0],
        2 => &[3.0 / 2.0, -1.0 / 2.0],
        3 => &[23.0 / 12.0, -16.0 / 12.0, 5.0 / 12.0],
        _ => &[55.0 / 24.0, -59.0 / 24.0, 37.0 / 24.0, -9.0 / 24.0],
    }
}

impl<T: Clone> Scheduler<T> for PndmScheduler<T> {
    fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
        self.timesteps = self.schedule.leading_timesteps(num_inference_steps)?;
        self.step_ratio = self.schedule.step_ratio(num_inference_steps);
        self.ets.clear();
        Ok(())
    }

    fn timesteps(&self) -> &[f32] {
        &self.timesteps
    }

    fn init_noise_sigma(&self) -> f32 {
        1.0
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

        if self.ets.len() == HISTORY {
            self.ets.remove(0);
        }
        self.ets.push(model_output.clone());

        let coefficients = multistep_coefficients(self.ets.len());
        let terms: Vec<(f32, &T)> = coefficients
            .iter()
            .copied()
            .zip(self.ets.iter().rev())
            .collect();
        let combined = if terms.len() == 1 {
            model_output.clone()
        } else {
            weighted_sum(ops, &terms)?
        };

        let final_alpha = self.schedule.final_alpha_cumprod();
        let alpha_prod_t = self.schedule.alpha_prod(t, final_alpha);
        let alpha_prod_prev = self.schedule.alpha_prod(prev_t, final_alpha);
        let beta_prod_t = 1.0 - alpha_prod_t;
        let beta_prod_prev = 1.0 - alpha_prod_prev;

        let eps = match self.schedule.config.prediction_type {
            PredictionType::Epsilon => combined,
            PredictionType::VPrediction => weighted_sum(
                ops,
                &[
                    (alpha_prod_t.sqrt() as f32, &combined),
                    (beta_prod_t.sqrt() as f32, sample),
                ],
            )?,
        };

        let sample_coeff = (alpha_prod_prev / alpha_prod_t).sqrt();
        let denom = alpha_prod_t * beta_prod_prev.sqrt()
            + (alpha_prod_t * beta_prod_t * alpha_prod_prev).sqrt();
        let eps_coeff = -(alpha_prod_prev - alpha_prod_t) / denom;

        weighted_sum(
            ops,
            &[(sample_coeff as f32, sample), (eps_coeff as f32, &eps)],
        )
    }
}
