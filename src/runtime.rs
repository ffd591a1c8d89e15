//! Loading and invoking compiled artifacts.

use std::path::Path;

use ndarray::ArrayD;
use tempfile::TempDir;
use tracing::{debug, info};

use crate::compiler::{Artifact, ArtifactManifest, WeightsMode};
use crate::config::Device;
use crate::error::{AotError, Result};
use crate::ir::{execute, Program};
use crate::models::OnnxUnet;
use crate::tensor::{DenoisingNetwork, EagerOps};
use crate::weights::{read_external, NetworkParameters};

/// An artifact bound to a device with its parameters resolved.
#[derive(Debug)]
pub struct LoadedArtifact {
    manifest: ArtifactManifest,
    parameters: NetworkParameters,
    device: Device,
}

impl LoadedArtifact {
    /// Reads an artifact for execution on `device`.
    ///
    /// Artifacts compiled with external weights need `external_weight_path`.
    pub fn load(path: &Path, device: Device, external_weight_path: Option<&Path>) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| {
            AotError::with_source(
                crate::error::ErrorCode::ArtifactInvalid,
                format!("Failed to read artifact {}: {}", path.display(), e),
                e,
            )
        })?;
        let (manifest, inline) = Artifact::parse(&bytes)?;

        if manifest.target.device != device {
            return Err(AotError::device_mismatch(
                manifest.target.device.as_str(),
                device.as_str(),
            ));
        }

        let parameters = match (manifest.weights_mode, inline) {
            (WeightsMode::Inline, Some(params)) => params,
            (WeightsMode::Inline, None) => {
                return Err(AotError::artifact_invalid("inline parameters are missing"))
            }
            (WeightsMode::External, _) => {
                let weights_path = external_weight_path.ok_or_else(|| {
                    AotError::artifact_invalid(
                        "artifact was compiled with external weights but no weight path was given",
                    )
                })?;
                read_external(weights_path, &manifest.weights)?
            }
        };

        info!(
            path = %path.display(),
            device = %device,
            weights = manifest.weights_mode.as_str(),
            unet_calls = manifest.program.unet_calls(),
            "Loaded artifact"
        );
        Ok(Self {
            manifest,
            parameters,
            device,
        })
    }

    pub fn program(&self) -> &Program {
        &self.manifest.program
    }

    pub fn parameters(&self) -> &NetworkParameters {
        &self.parameters
    }

    /// Opens the network embedded in the artifact.
    ///
    /// Parameter blobs are written to a scratch directory owned by the
    /// returned session.
    pub fn network(&self, threads: Option<u32>) -> Result<OnnxUnet> {
        let scratch = TempDir::new()
            .map_err(|e| AotError::io("Failed to create scratch directory", e))?;
        self.parameters.materialize(scratch.path())?;
        debug!(dir = %scratch.path().display(), "Materialized network parameters");
        OnnxUnet::load_owned(scratch, self.device, threads)
    }

    /// Runs the program on host inputs (`sample`, `encoder_hidden_states`).
    pub fn invoke(
        &self,
        inputs: Vec<ArrayD<f32>>,
        network: &mut dyn DenoisingNetwork,
    ) -> Result<ArrayD<f32>> {
        let mut ops = EagerOps::new(network);
        execute(&self.manifest.program, &mut ops, inputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use crate::compiler::{CompileRequest, Compiler, LocalCompiler, TargetSpec};
    use crate::error::ErrorCode;
    use crate::sampling::{run_sampling_loop, InputShapes};
    use crate::schedulers::{create_scheduler, DynScheduler, ScheduleConfig, Scheduler, SchedulerId};
    use crate::tensor::seeded_noise;
    use crate::testing::ToyUnet;
    use crate::trace::{trace_sampling_loop, Value};
    use crate::weights::{write_external, NameMapper, UNET_MODEL_KEY};

    fn params() -> NetworkParameters {
        let mut params = NetworkParameters::new();
        params.insert(UNET_MODEL_KEY, b"not a real graph".to_vec());
        params
    }

    fn compile(dir: &Path, program: &Program, device: Device, mode: WeightsMode) -> PathBuf {
        let params = params();
        let artifact = LocalCompiler
            .compile(&CompileRequest {
                program,
                target: TargetSpec {
                    device,
                    ..TargetSpec::default()
                },
                parameters: &params,
                weights_mode: mode,
                mapper: NameMapper::new(),
            })
            .unwrap();
        let path = dir.join("sched.artifact");
        artifact.write_to(&path).unwrap();
        path
    }

    fn traced(id: SchedulerId, shapes: &InputShapes) -> Program {
        let mut scheduler: DynScheduler<Value> = create_scheduler(id, ScheduleConfig::default(), 3);
        scheduler.set_timesteps(4).unwrap();
        trace_sampling_loop(&mut scheduler, shapes, 7.5).unwrap()
    }

    #[test]
    fn invoke_matches_eager_loop() {
        let dir = TempDir::new().unwrap();
        let shapes = InputShapes::new(1, 16, 16, 8).unwrap();
        let program = traced(SchedulerId::EulerAncestralDiscrete, &shapes);
        let path = compile(dir.path(), &program, Device::Cpu, WeightsMode::Inline);

        let loaded = LoadedArtifact::load(&path, Device::Cpu, None).unwrap();
        assert_eq!(loaded.parameters(), &params());

        let latents = seeded_noise(&shapes.latent(), 1);
        let cond = seeded_noise(&shapes.conditioning(), 2);
        let mut unet = ToyUnet::default();
        let compiled = loaded
            .invoke(vec![latents.clone(), cond.clone()], &mut unet)
            .unwrap();
        assert_eq!(unet.calls, 4);

        let mut scheduler: DynScheduler<ArrayD<f32>> =
            create_scheduler(SchedulerId::EulerAncestralDiscrete, ScheduleConfig::default(), 3);
        scheduler.set_timesteps(4).unwrap();
        let mut unet = ToyUnet::default();
        let mut ops = EagerOps::new(&mut unet);
        let eager = run_sampling_loop(&mut ops, &mut scheduler, &latents, &cond, 7.5, |_, _| {})
            .unwrap();

        let max_err = compiled
            .iter()
            .zip(eager.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max);
        assert!(max_err < 9e-3);
    }

    #[test]
    fn device_mismatch_rejected() {
        let dir = TempDir::new().unwrap();
        let shapes = InputShapes::new(1, 16, 16, 8).unwrap();
        let path = compile(
            dir.path(),
            &traced(SchedulerId::Ddim, &shapes),
            Device::Cuda,
            WeightsMode::Inline,
        );
        let err = LoadedArtifact::load(&path, Device::Cpu, None).unwrap_err();
        assert_eq!(err.code, ErrorCode::DeviceMismatch);
    }

    #[test]
    fn external_weights_required() {
        let dir = TempDir::new().unwrap();
        let shapes = InputShapes::new(1, 16, 16, 8).unwrap();
        let path = compile(
            dir.path(),
            &traced(SchedulerId::Pndm, &shapes),
            Device::Cpu,
            WeightsMode::External,
        );

        let err = LoadedArtifact::load(&path, Device::Cpu, None).unwrap_err();
        assert_eq!(err.code, ErrorCode::ArtifactInvalid);

        let weights = dir.path().join("sd.safetensors");
        write_external(&weights, &params(), &NameMapper::new()).unwrap();
        let loaded = LoadedArtifact::load(&path, Device::Cpu, Some(&weights)).unwrap();
        assert_eq!(loaded.parameters(), &params());
    }

    #[test]
    fn wrong_input_shape_rejected() {
        let dir = TempDir::new().unwrap();
        let shapes = InputShapes::new(1, 16, 16, 8).unwrap();
        let path = compile(
            dir.path(),
            &traced(SchedulerId::Ddim, &shapes),
            Device::Cpu,
            WeightsMode::Inline,
        );
        let loaded = LoadedArtifact::load(&path, Device::Cpu, None).unwrap();
        let mut unet = ToyUnet::default();
        let err = loaded
            .invoke(
                vec![seeded_noise(&[1, 4, 4, 4], 0), seeded_noise(&shapes.conditioning(), 0)],
                &mut unet,
            )
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidShape);
        assert_eq!(unet.calls, 0);
    }

    #[test]
    fn foreign_parameter_keys_rejected_on_load() {
        let dir = TempDir::new().unwrap();
        let escaped = dir.path().join("escaped.txt");
        let shapes = InputShapes::new(1, 16, 16, 8).unwrap();
        let program = traced(SchedulerId::Ddim, &shapes);

        let mut params = params();
        params.insert(escaped.to_string_lossy().to_string(), b"payload".to_vec());
        let artifact = LocalCompiler
            .compile(&CompileRequest {
                program: &program,
                target: TargetSpec::default(),
                parameters: &params,
                weights_mode: WeightsMode::Inline,
                mapper: NameMapper::new(),
            })
            .unwrap();
        let path = dir.path().join("crafted.artifact");
        artifact.write_to(&path).unwrap();

        let err = LoadedArtifact::load(&path, Device::Cpu, None).unwrap_err();
        assert_eq!(err.code, ErrorCode::ArtifactInvalid);
        assert!(!escaped.exists());
    }
}
