//! DDIM scheduler (deterministic, eta = 0).

use super::schedule::{NoiseSchedule, PredictionType};
use super::Scheduler;
use crate::error::Result;
use crate::tensor::{weighted_sum, TensorOps};

/// Denoising diffusion implicit models sampler.
#[derive(Debug, Clone)]
pub struct DdimScheduler {
    schedule: NoiseSchedule,
    timesteps: Vec<f32>,
    step_ratio: usize,
}

impl DdimScheduler {
    pub fn new(schedule: NoiseSchedule) -> Self {
        Self {
            schedule,
            timesteps: Vec::new(),
            step_ratio: 0,
        }
    }

    pub fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
        self.timesteps = self.schedule.leading_timesteps(num_inference_steps)?;
        self.step_ratio = self.schedule.step_ratio(num_inference_steps);
        Ok(())
    }

    pub fn timesteps(&self) -> &[f32] {
        &self.timesteps
    }

    pub fn init_noise_sigma(&self) -> f32 {
        1.0
    }
}

/// Predicted clean sample and noise from a raw model output.
pub(crate) fn predict_original<B: TensorOps>(
    ops: &mut B,
    prediction_type: PredictionType,
    alpha_prod_t: f64,
    model_output: &B::Tensor,
    sample: &B::Tensor,
) -> Result<(B::Tensor, B::Tensor)> {
    let sqrt_alpha = alpha_prod_t.sqrt();
    let sqrt_beta = (1.0 - alpha_prod_t).sqrt();
    match prediction_type {
        PredictionType::Epsilon => {
            let x0 = weighted_sum(
                ops,
                &[
                    ((1.0 / sqrt_alpha) as f32, sample),
                    ((-sqrt_beta / sqrt_alpha) as f32, model_output),
                ],
            )?;
            Ok((x0, model_output.clone()))
        }
        PredictionType::VPrediction => {
            let x0 = weighted_sum(
                ops,
                &[
                    (sqrt_alpha as f32, sample),
                    (-sqrt_beta as f32, model_output),
                ],
            )?;
            let eps = weighted_sum(
                ops,
                &[
                    (sqrt_alpha as f32, model_output),
                    (sqrt_beta as f32, sample),
                ],
            )?;
            Ok((x0, eps))
        }
    }
}

impl<T: Clone> Scheduler<T> for DdimScheduler {
    fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
        DdimScheduler::set_timesteps(self, num_inference_steps)
    }

    fn timesteps(&self) -> &[f32] {
        DdimScheduler::timesteps(self)
    }

    fn init_noise_sigma(&self) -> f32 {
        DdimScheduler::init_noise_sigma(self)
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
        let final_alpha = self.schedule.final_alpha_cumprod();
        let alpha_prod_t = self.schedule.alpha_prod(t, final_alpha);
        let alpha_prod_prev = self.schedule.alpha_prod(prev_t, final_alpha);

        let (x0, eps) = predict_original(
            ops,
            self.schedule.config.prediction_type,
            alpha_prod_t,
            model_output,
            sample,
        )?;

        weighted_sum(
            ops,
            &[
                (alpha_prod_prev.sqrt() as f32, &x0),
                ((1.0 - alpha_prod_prev).sqrt() as f32, &eps),
            ],
        )
    }
}
