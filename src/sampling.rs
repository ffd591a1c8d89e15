//! Classifier-free guidance sampling loop.
//!
//! This is the single numeric routine shared by export (traced into a
//! program) and by the reference run (executed eagerly).

use tracing::debug;

use crate::error::{AotError, Result};
use crate::schedulers::Scheduler;
use crate::tensor::TensorOps;

/// Default classifier-free guidance scale.
pub const DEFAULT_GUIDANCE_SCALE: f32 = 7.5;

/// Latent channels of the Stable Diffusion VAE.
pub const LATENT_CHANNELS: usize = 4;

/// Downsampling factor between image pixels and latents.
pub const VAE_SCALE_FACTOR: usize = 8;

/// Text encoder sequence length.
pub const MAX_TEXT_LENGTH: usize = 77;

/// Shapes of the two loop inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputShapes {
    pub batch_size: usize,
    pub height: usize,
    pub width: usize,
    pub embedding_dim: usize,
}

impl InputShapes {
    /// Validates image dimensions and batch size.
    pub fn new(batch_size: usize, height: usize, width: usize, embedding_dim: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(AotError::invalid_shape("batch size must be at least 1"));
        }
        for (name, value) in [("height", height), ("width", width)] {
            if value == 0 || value % VAE_SCALE_FACTOR != 0 {
                return Err(AotError::invalid_shape(format!(
                    "{} must be a positive multiple of {}, got {}",
                    name, VAE_SCALE_FACTOR, value
                )));
            }
        }
        if embedding_dim == 0 {
            return Err(AotError::invalid_shape("embedding dimension must be positive"));
        }
        Ok(Self {
            batch_size,
            height,
            width,
            embedding_dim,
        })
    }

    /// `(B, 4, H/8, W/8)`.
    pub fn latent(&self) -> Vec<usize> {
        vec![
            self.batch_size,
            LATENT_CHANNELS,
            self.height / VAE_SCALE_FACTOR,
            self.width / VAE_SCALE_FACTOR,
        ]
    }

    /// `(2B, 77, E)`: unconditional rows first, conditional rows second.
    pub fn conditioning(&self) -> Vec<usize> {
        vec![2 * self.batch_size, MAX_TEXT_LENGTH, self.embedding_dim]
    }
}

/// Combines the two noise predictions as `u + g * (c - u)`.
///
/// Evaluated as subtract, scale, add in that order on every backend.
pub fn apply_guidance<B: TensorOps>(
    ops: &mut B,
    uncond: &B::Tensor,
    cond: &B::Tensor,
    guidance_scale: f32,
) -> Result<B::Tensor> {
    let delta = ops.sub(cond, uncond)?;
    let scaled = ops.scale(&delta, guidance_scale)?;
    ops.add(uncond, &scaled)
}

fn check_inputs<B: TensorOps>(ops: &B, latents: &B::Tensor, conditioning: &B::Tensor) -> Result<()> {
    let latent = ops.shape(latents);
    let cond = ops.shape(conditioning);
    if latent.len() != 4 || latent[1] != LATENT_CHANNELS {
        return Err(AotError::invalid_shape(format!(
            "latents must have shape (B, {}, H/8, W/8), got {:?}",
            LATENT_CHANNELS, latent
        )));
    }
    if cond.len() != 3 || cond[0] != 2 * latent[0] {
        return Err(AotError::invalid_shape(format!(
            "conditioning must have shape ({}, 77, E), got {:?}",
            2 * latent[0],
            cond
        )));
    }
    Ok(())
}

/// Runs the full denoising loop and returns the final latents.
///
/// The scheduler must already have its timesteps. Each timestep is consumed
/// exactly once and `on_progress` receives `(completed, total)` after every
/// step.
pub fn run_sampling_loop<B, S, F>(
    ops: &mut B,
    scheduler: &mut S,
    latents: &B::Tensor,
    conditioning: &B::Tensor,
    guidance_scale: f32,
    mut on_progress: F,
) -> Result<B::Tensor>
where
    B: TensorOps,
    S: Scheduler<B::Tensor>,
    F: FnMut(usize, usize),
{
    let timesteps = scheduler.timesteps().to_vec();
    if timesteps.is_empty() {
        return Err(AotError::scheduler_not_initialized("(no timesteps set)"));
    }
    check_inputs(ops, latents, conditioning)?;

    let total = timesteps.len();
    let mut latents = ops.scale(latents, scheduler.init_noise_sigma())?;

    for (k, &t) in timesteps.iter().enumerate() {
        let doubled = ops.concat_batch(&latents, &latents)?;
        let model_input = scheduler.scale_model_input(ops, &doubled, t)?;
        let noise_pred = ops.predict_noise(&model_input, t, conditioning)?;
        let (uncond, cond) = ops.split_batch(&noise_pred)?;
        let guided = apply_guidance(ops, &uncond, &cond, guidance_scale)?;
        latents = scheduler.step(ops, &guided, t, &latents)?;

        debug!(step = k + 1, total, timestep = t, "denoising step");
        on_progress(k + 1, total);
    }

    Ok(latents)
}
