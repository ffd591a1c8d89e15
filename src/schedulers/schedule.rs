//! Noise schedule shared by all schedulers.
//!
//! Coefficients are computed in f64 and narrowed to f32 only where they
//! enter a tensor operation.

use serde::{Deserialize, Serialize};

use crate::error::{AotError, Result};

/// Quantity the network was trained to predict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PredictionType {
    /// Noise residual.
    #[default]
    Epsilon,
    /// Velocity `sqrt(a) * eps - sqrt(1 - a) * x0`.
    VPrediction,
}

/// Beta schedule over the training timesteps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    /// Evenly spaced betas.
    Linear,
    /// Evenly spaced square roots of betas, squared.
    ScaledLinear,
}

/// Training-time configuration common to every scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub num_train_timesteps: usize,
    pub beta_start: f64,
    pub beta_end: f64,
    pub beta_schedule: BetaSchedule,
    /// Added to every inference timestep.
    pub steps_offset: usize,
    /// Use 1.0 instead of `alphas_cumprod[0]` past the final step.
    pub set_alpha_to_one: bool,
    pub prediction_type: PredictionType,
}

impl ScheduleConfig {
    /// Stable Diffusion defaults.
    pub fn stable_diffusion(prediction_type: PredictionType) -> Self {
        Self {
            num_train_timesteps: 1000,
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: BetaSchedule::ScaledLinear,
            steps_offset: 1,
            set_alpha_to_one: false,
            prediction_type,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self::stable_diffusion(PredictionType::Epsilon)
    }
}

/// Precomputed training schedule.
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    pub config: ScheduleConfig,
    pub betas: Vec<f64>,
    pub alphas_cumprod: Vec<f64>,
}

impl NoiseSchedule {
    pub fn new(config: ScheduleConfig) -> Self {
        let n = config.num_train_timesteps;
        let betas: Vec<f64> = match config.beta_schedule {
            BetaSchedule::Linear => linspace(config.beta_start, config.beta_end, n),
            BetaSchedule::ScaledLinear => {
                linspace(config.beta_start.sqrt(), config.beta_end.sqrt(), n)
                    .into_iter()
                    .map(|b| b * b)
                    .collect()
            }
        };

        let mut alphas_cumprod = Vec::with_capacity(n);
        let mut acc = 1.0;
        for beta in &betas {
            acc *= 1.0 - beta;
            alphas_cumprod.push(acc);
        }

        Self {
            config,
            betas,
            alphas_cumprod,
        }
    }

    /// Cumulative alpha at a training timestep; negative timesteps map to the
    /// final alpha.
    pub fn alpha_prod(&self, timestep: i64, final_alpha: f64) -> f64 {
        if timestep < 0 {
            return final_alpha;
        }
        let idx = (timestep as usize).min(self.alphas_cumprod.len() - 1);
        self.alphas_cumprod[idx]
    }

    /// Alpha used past the last inference step.
    pub fn final_alpha_cumprod(&self) -> f64 {
        if self.config.set_alpha_to_one {
            1.0
        } else {
            self.alphas_cumprod[0]
        }
    }

    /// Distance between consecutive inference timesteps.
    pub fn step_ratio(&self, num_inference_steps: usize) -> usize {
        self.config.num_train_timesteps / num_inference_steps.max(1)
    }

    /// Leading-spaced inference timesteps, descending.
    ///
    /// For 1000 training steps, 50 inference steps and offset 1 this yields
    /// `981, 961, ..., 21, 1`.
    pub fn leading_timesteps(&self, num_inference_steps: usize) -> Result<Vec<f32>> {
        let train = self.config.num_train_timesteps;
        let offset = self.config.steps_offset;
        if num_inference_steps == 0 {
            return Err(AotError::new(
                crate::error::ErrorCode::SchedulerNotInitialized,
                "num_inference_steps must be at least 1",
            ));
        }
        let ratio = self.step_ratio(num_inference_steps);
        // The top timestep must stay inside the training range.
        if ratio == 0 || (num_inference_steps - 1) * ratio + offset >= train {
            return Err(AotError::new(
                crate::error::ErrorCode::SchedulerNotInitialized,
                format!(
                    "num_inference_steps must be at most {} for {} training steps, got {}",
                    train.saturating_sub(offset),
                    train,
                    num_inference_steps
                ),
            ));
        }
        Ok((0..num_inference_steps)
            .rev()
            .map(|i| (i * ratio + offset) as f32)
            .collect())
    }

    /// Karras-style sigma `sqrt((1 - a) / a)` at a training timestep.
    pub fn sigma_at(&self, timestep: usize) -> f64 {
        let a = self.alphas_cumprod[timestep.min(self.alphas_cumprod.len() - 1)];
        ((1.0 - a) / a).sqrt()
    }
}

fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![start];
    }
    let step = (end - start) / (n - 1) as f64;
    (0..n).map(|i| start + step * i as f64).collect()
}

/// Position of `timestep` in a schedule.
pub fn index_for_timestep(timesteps: &[f32], timestep: f32) -> Result<usize> {
    timesteps
        .iter()
        .position(|&t| t == timestep)
        .ok_or_else(|| {
            AotError::new(
                crate::error::ErrorCode::SchedulerNotInitialized,
                format!("timestep {} is not part of the schedule", timestep),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scaled_linear_endpoints() {
        let schedule = NoiseSchedule::new(ScheduleConfig::default());
        assert_eq!(schedule.betas.len(), 1000);
        assert!((schedule.betas[0] - 0.00085).abs() < 1e-12);
        assert!((schedule.betas[999] - 0.012).abs() < 1e-12);
    }

    #[test]
    fn alphas_cumprod_decreasing() {
        let schedule = NoiseSchedule::new(ScheduleConfig::default());
        for pair in schedule.alphas_cumprod.windows(2) {
            assert!(pair[1] < pair[0]);
        }
        assert!(schedule.alphas_cumprod[999] > 0.0);
    }

    #[test]
    fn leading_timesteps_sd_defaults() {
        let schedule = NoiseSchedule::new(ScheduleConfig::default());
        let timesteps = schedule.leading_timesteps(50).unwrap();
        assert_eq!(timesteps.len(), 50);
        assert_eq!(timesteps[0], 981.0);
        assert_eq!(timesteps[1], 961.0);
        assert_eq!(timesteps[49], 1.0);
    }

    #[test]
    fn leading_timesteps_rejects_bad_counts() {
        let schedule = NoiseSchedule::new(ScheduleConfig::default());
        assert!(schedule.leading_timesteps(0).is_err());
        assert!(schedule.leading_timesteps(1000).is_err());
        assert!(schedule.leading_timesteps(1001).is_err());
    }

    #[test]
    fn leading_timesteps_are_distinct_at_the_cap() {
        let schedule = NoiseSchedule::new(ScheduleConfig::default());
        let timesteps = schedule.leading_timesteps(999).unwrap();
        assert_eq!(timesteps.len(), 999);
        assert_eq!(timesteps[0], 999.0);
        assert_eq!(timesteps[998], 1.0);
        assert!(timesteps.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn final_alpha_follows_config() {
        let mut config = ScheduleConfig::default();
        let schedule = NoiseSchedule::new(config.clone());
        assert_eq!(schedule.final_alpha_cumprod(), schedule.alphas_cumprod[0]);

        config.set_alpha_to_one = true;
        let schedule = NoiseSchedule::new(config);
        assert_eq!(schedule.final_alpha_cumprod(), 1.0);
        assert_eq!(schedule.alpha_prod(-1, 1.0), 1.0);
    }

    #[test]
    fn timestep_lookup() {
        let timesteps = [21.0, 11.0, 1.0];
        assert_eq!(index_for_timestep(&timesteps, 11.0).unwrap(), 1);
        assert!(index_for_timestep(&timesteps, 5.0).is_err());
    }
}
