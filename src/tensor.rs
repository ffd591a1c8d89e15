//! Tensor operation abstraction shared by eager execution and tracing.
//!
//! The sampling loop and every scheduler are written against [`TensorOps`],
//! so the same code path either computes values on host arrays
//! ([`EagerOps`]) or records a program ([`crate::trace::Tracer`]).

use ndarray::{concatenate, ArrayD, Axis, IxDyn};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::error::{AotError, Result};

/// Noise-predicting network invoked once per denoising step.
pub trait DenoisingNetwork {
    /// Predicts the noise residual for a (doubled) latent batch.
    ///
    /// `sample` has shape `(2B, 4, H/8, W/8)` and `encoder_hidden_states`
    /// `(2B, 77, E)`; the result has the shape of `sample`.
    fn predict_noise(
        &mut self,
        sample: &ArrayD<f32>,
        timestep: f32,
        encoder_hidden_states: &ArrayD<f32>,
    ) -> Result<ArrayD<f32>>;
}

/// Primitive tensor operations used by the sampling loop and schedulers.
///
/// All arithmetic is f32 and element-wise unless stated otherwise.
pub trait TensorOps {
    /// Tensor handle produced and consumed by the operations.
    type Tensor: Clone;

    /// Returns the shape of a tensor.
    fn shape(&self, x: &Self::Tensor) -> Vec<usize>;

    /// Multiplies every element by `factor`.
    fn scale(&mut self, x: &Self::Tensor, factor: f32) -> Result<Self::Tensor>;

    /// Element-wise `a + b`.
    fn add(&mut self, a: &Self::Tensor, b: &Self::Tensor) -> Result<Self::Tensor>;

    /// Element-wise `a - b`.
    fn sub(&mut self, a: &Self::Tensor, b: &Self::Tensor) -> Result<Self::Tensor>;

    /// Concatenates along the batch axis.
    fn concat_batch(&mut self, a: &Self::Tensor, b: &Self::Tensor) -> Result<Self::Tensor>;

    /// Splits an even batch into its first and second halves.
    fn split_batch(&mut self, x: &Self::Tensor) -> Result<(Self::Tensor, Self::Tensor)>;

    /// Standard normal noise with the shape of `x`, fully determined by `seed`.
    fn noise_like(&mut self, x: &Self::Tensor, seed: u64) -> Result<Self::Tensor>;

    /// Runs the denoising network.
    fn predict_noise(
        &mut self,
        sample: &Self::Tensor,
        timestep: f32,
        conditioning: &Self::Tensor,
    ) -> Result<Self::Tensor>;
}

/// Computes `sum(coefficient * tensor)` as a chain of scales and adds.
///
/// Terms are combined left to right, so the operation order is stable
/// across backends.
pub fn weighted_sum<B: TensorOps>(ops: &mut B, terms: &[(f32, &B::Tensor)]) -> Result<B::Tensor> {
    let ((first_coeff, first), rest) = terms
        .split_first()
        .ok_or_else(|| AotError::invalid_shape("weighted_sum needs at least one term"))?;

    let mut acc = ops.scale(first, *first_coeff)?;
    for (coeff, tensor) in rest {
        let scaled = ops.scale(tensor, *coeff)?;
        acc = ops.add(&acc, &scaled)?;
    }
    Ok(acc)
}

/// Generates standard normal noise of the given shape from a seed.
pub fn seeded_noise(shape: &[usize], seed: u64) -> ArrayD<f32> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let len: usize = shape.iter().product();
    let data: Vec<f32> = (0..len)
        .map(|_| -> f32 { StandardNormal.sample(&mut rng) })
        .collect();
    // Length matches the shape by construction.
    ArrayD::from_shape_vec(IxDyn(shape), data).unwrap_or_else(|_| ArrayD::zeros(IxDyn(shape)))
}

/// Eager execution on host ndarray tensors.
pub struct EagerOps<'a> {
    network: Option<&'a mut dyn DenoisingNetwork>,
}

impl<'a> EagerOps<'a> {
    /// Creates eager ops backed by a denoising network.
    pub fn new(network: &'a mut dyn DenoisingNetwork) -> Self {
        Self {
            network: Some(network),
        }
    }

    /// Creates eager ops without a network; `predict_noise` fails.
    pub fn without_network() -> Self {
        Self { network: None }
    }

    fn check_same_shape(op: &str, a: &ArrayD<f32>, b: &ArrayD<f32>) -> Result<()> {
        if a.shape() != b.shape() {
            return Err(AotError::shape_mismatch(op, a.shape(), b.shape()));
        }
        Ok(())
    }
}

impl TensorOps for EagerOps<'_> {
    type Tensor = ArrayD<f32>;

    fn shape(&self, x: &ArrayD<f32>) -> Vec<usize> {
        x.shape().to_vec()
    }

    fn scale(&mut self, x: &ArrayD<f32>, factor: f32) -> Result<ArrayD<f32>> {
        Ok(x.mapv(|v| v * factor))
    }

    fn add(&mut self, a: &ArrayD<f32>, b: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        Self::check_same_shape("add", a, b)?;
        Ok(a + b)
    }

    fn sub(&mut self, a: &ArrayD<f32>, b: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        Self::check_same_shape("sub", a, b)?;
        Ok(a - b)
    }

    fn concat_batch(&mut self, a: &ArrayD<f32>, b: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        if a.ndim() == 0 || a.ndim() != b.ndim() || a.shape()[1..] != b.shape()[1..] {
            return Err(AotError::shape_mismatch("concat", a.shape(), b.shape()));
        }
        concatenate(Axis(0), &[a.view(), b.view()])
            .map_err(|e| AotError::invalid_shape(format!("concat failed: {}", e)))
    }

    fn split_batch(&mut self, x: &ArrayD<f32>) -> Result<(ArrayD<f32>, ArrayD<f32>)> {
        let batch = x.shape().first().copied().unwrap_or(0);
        if batch == 0 || batch % 2 != 0 {
            return Err(AotError::invalid_shape(format!(
                "cannot split batch of shape {:?} into halves",
                x.shape()
            )));
        }
        let (first, second) = x.view().split_at(Axis(0), batch / 2);
        Ok((first.to_owned(), second.to_owned()))
    }

    fn noise_like(&mut self, x: &ArrayD<f32>, seed: u64) -> Result<ArrayD<f32>> {
        Ok(seeded_noise(x.shape(), seed))
    }

    fn predict_noise(
        &mut self,
        sample: &ArrayD<f32>,
        timestep: f32,
        conditioning: &ArrayD<f32>,
    ) -> Result<ArrayD<f32>> {
        let network = self
            .network
            .as_deref_mut()
            .ok_or_else(|| AotError::execution_failed("no denoising network bound"))?;

        if sample.shape().first() != conditioning.shape().first() {
            return Err(AotError::shape_mismatch(
                "unet",
                sample.shape(),
                conditioning.shape(),
            ));
        }

        let noise = network.predict_noise(sample, timestep, conditioning)?;
        if noise.shape() != sample.shape() {
            return Err(AotError::execution_failed(format!(
                "network returned shape {:?} for sample {:?}",
                noise.shape(),
                sample.shape()
            )));
        }
        Ok(noise)
    }
}
