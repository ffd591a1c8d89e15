//! UNet noise predictor backed by an ONNX Runtime session.
//!
//! Binds the diffusers ONNX export interface: inputs `sample`, `timestep`
//! and `encoder_hidden_states`, output `out_sample`.

use std::path::Path;

use half::f16;
use ndarray::{ArrayD, IxDyn};
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, CoreMLExecutionProvider,
    ExecutionProviderDispatch, ROCmExecutionProvider,
};
use ort::session::Session;
use ort::tensor::TensorElementType;
use ort::value::{DynValue, Tensor, ValueType};
use tempfile::TempDir;
use tracing::{debug, info};

use crate::config::Device;
use crate::error::{AotError, Result};
use crate::tensor::DenoisingNetwork;
use crate::weights::UNET_MODEL_KEY;

/// Returns the execution providers for a device, most preferred first.
pub fn execution_providers(device: Device) -> Vec<ExecutionProviderDispatch> {
    let mut providers = match device {
        Device::Cpu => Vec::new(),
        Device::Cuda => vec![CUDAExecutionProvider::default().build()],
        Device::Rocm => vec![ROCmExecutionProvider::default().build()],
        Device::Metal => vec![CoreMLExecutionProvider::default().build()],
    };
    providers.push(CPUExecutionProvider::default().build());
    providers
}

/// Element type of a named session input, if it is a tensor.
fn input_element_type(session: &Session, name: &str) -> Option<TensorElementType> {
    session
        .inputs
        .iter()
        .find(|input| input.name == name)
        .and_then(|input| match &input.input_type {
            ValueType::Tensor { ty, .. } => Some(*ty),
            _ => None,
        })
}

/// UNet ONNX session.
pub struct OnnxUnet {
    session: Session,
    device: Device,
    fp16: bool,
    int_timestep: bool,
    /// Keeps materialized model files alive for the session's lifetime.
    _scratch: Option<TempDir>,
}

impl std::fmt::Debug for OnnxUnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxUnet")
            .field("device", &self.device)
            .field("fp16", &self.fp16)
            .field("int_timestep", &self.int_timestep)
            .finish_non_exhaustive()
    }
}

impl OnnxUnet {
    /// Opens `unet/model.onnx` below `model_dir`.
    pub fn load(model_dir: &Path, device: Device, threads: Option<u32>) -> Result<Self> {
        let model_path = model_dir.join(UNET_MODEL_KEY);
        if !model_path.exists() {
            return Err(AotError::model_not_found(format!(
                "{} does not exist",
                model_path.display()
            )));
        }

        let mut builder = Session::builder()
            .map_err(|e| AotError::model_load_failed(format!("Failed to create session: {}", e)))?
            .with_execution_providers(execution_providers(device))
            .map_err(|e| {
                AotError::model_load_failed(format!("Failed to set execution providers: {}", e))
            })?;

        if let Some(threads) = threads {
            builder = builder.with_intra_threads(threads as usize).map_err(|e| {
                AotError::model_load_failed(format!("Failed to set intra-op threads: {}", e))
            })?;
        }

        let session = builder.commit_from_file(&model_path).map_err(|e| {
            AotError::model_load_failed(format!("Failed to load {}: {}", model_path.display(), e))
        })?;

        let fp16 = input_element_type(&session, "sample") == Some(TensorElementType::Float16);
        let int_timestep =
            input_element_type(&session, "timestep") == Some(TensorElementType::Int64);

        info!(device = %device, fp16, int_timestep, "Loaded UNet");
        Ok(Self {
            session,
            device,
            fp16,
            int_timestep,
            _scratch: None,
        })
    }

    /// Opens the UNet from a scratch directory that the session then owns.
    pub fn load_owned(scratch: TempDir, device: Device, threads: Option<u32>) -> Result<Self> {
        let mut unet = Self::load(scratch.path(), device, threads)?;
        unet._scratch = Some(scratch);
        Ok(unet)
    }

    fn float_input(&self, x: &ArrayD<f32>, what: &str) -> Result<DynValue> {
        let shape = x.shape().to_vec();
        let value = if self.fp16 {
            let data: Vec<f16> = x.iter().map(|&v| f16::from_f32(v)).collect();
            Tensor::from_array((shape, data)).map(|t| t.into_dyn())
        } else {
            let data: Vec<f32> = x.iter().copied().collect();
            Tensor::from_array((shape, data)).map(|t| t.into_dyn())
        };
        value.map_err(|e| {
            AotError::execution_failed(format!("Failed to create {} tensor: {}", what, e))
        })
    }

    fn timestep_input(&self, timestep: f32) -> Result<DynValue> {
        let value = if self.int_timestep {
            Tensor::from_array(([1usize], vec![timestep as i64])).map(|t| t.into_dyn())
        } else if self.fp16 {
            Tensor::from_array(([1usize], vec![f16::from_f32(timestep)])).map(|t| t.into_dyn())
        } else {
            Tensor::from_array(([1usize], vec![timestep])).map(|t| t.into_dyn())
        };
        value.map_err(|e| {
            AotError::execution_failed(format!("Failed to create timestep tensor: {}", e))
        })
    }
}

impl DenoisingNetwork for OnnxUnet {
    fn predict_noise(
        &mut self,
        sample: &ArrayD<f32>,
        timestep: f32,
        encoder_hidden_states: &ArrayD<f32>,
    ) -> Result<ArrayD<f32>> {
        let sample_value = self.float_input(sample, "sample")?;
        let timestep_value = self.timestep_input(timestep)?;
        let hidden_value = self.float_input(encoder_hidden_states, "encoder_hidden_states")?;

        let mut outputs = self
            .session
            .run(ort::inputs![
                "sample" => sample_value,
                "timestep" => timestep_value,
                "encoder_hidden_states" => hidden_value
            ])
            .map_err(|e| AotError::execution_failed(format!("UNet inference failed: {}", e)))?;

        let out = outputs
            .remove("out_sample")
            .ok_or_else(|| AotError::execution_failed("Missing out_sample output"))?;

        let (dims, data): (Vec<usize>, Vec<f32>) =
            if let Ok((shape, data)) = out.try_extract_tensor::<f32>() {
                (
                    shape.iter().map(|&d| d as usize).collect(),
                    data.to_vec(),
                )
            } else if let Ok((shape, data)) = out.try_extract_tensor::<f16>() {
                (
                    shape.iter().map(|&d| d as usize).collect(),
                    data.iter().map(|v| v.to_f32()).collect(),
                )
            } else {
                return Err(AotError::execution_failed(
                    "out_sample is neither f32 nor f16",
                ));
            };

        debug!(timestep, shape = ?dims, "UNet step");
        if dims != sample.shape() {
            return Err(AotError::shape_mismatch("out_sample", &dims, sample.shape()));
        }
        ArrayD::from_shape_vec(IxDyn(&dims), data)
            .map_err(|e| AotError::execution_failed(format!("Failed to reshape out_sample: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_fallback_always_last() {
        for device in [Device::Cpu, Device::Cuda, Device::Rocm, Device::Metal] {
            let providers = execution_providers(device);
            assert!(!providers.is_empty());
        }
        assert_eq!(execution_providers(Device::Cpu).len(), 1);
        assert_eq!(execution_providers(Device::Cuda).len(), 2);
    }

    #[test]
    fn missing_model_reported() {
        let dir = TempDir::new().unwrap();
        let err = OnnxUnet::load(dir.path(), Device::Cpu, None).unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::ModelNotFound);
    }
}
