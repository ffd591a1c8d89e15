//! Deterministic stand-in network for unit tests.

use ndarray::{ArrayD, Axis};

use crate::error::Result;
use crate::tensor::DenoisingNetwork;

/// Analytic noise predictor.
///
/// Mixes the sample, the timestep and the per-row mean of the conditioning so
/// that guidance, scheduler history and conditioning all influence the result.
#[derive(Debug, Default)]
pub(crate) struct ToyUnet {
    pub calls: usize,
}

impl DenoisingNetwork for ToyUnet {
    fn predict_noise(
        &mut self,
        sample: &ArrayD<f32>,
        timestep: f32,
        encoder_hidden_states: &ArrayD<f32>,
    ) -> Result<ArrayD<f32>> {
        self.calls += 1;
        let t = timestep / 1000.0;
        let mut out = sample.mapv(|v| 0.1 * v.sin() + 0.05 * t);

        for (b, mut row) in out.axis_iter_mut(Axis(0)).enumerate() {
            let bias = encoder_hidden_states
                .index_axis(Axis(0), b)
                .mean()
                .unwrap_or(0.0);
            row.mapv_inplace(|v| v + 0.2 * bias);
        }
        Ok(out)
    }
}
