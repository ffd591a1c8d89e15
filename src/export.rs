//! Export pipeline: trace, lower, print, compile and write outputs.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::compiler::{CompileRequest, Compiler, LocalCompiler, TargetSpec, WeightsMode};
use crate::config::{CompileStage, ExportConfig, ToolConfig};
use crate::error::{AotError, Result};
use crate::ir::{lower_program, print_module, ParameterGlobal, ParameterStorage, Program};
use crate::models::{create_safe_name, ensure_unet, model_dir_for, ModelSpec};
use crate::sampling::InputShapes;
use crate::schedulers::{create_scheduler, DynScheduler, ScheduleConfig, Scheduler, SchedulerId};
use crate::trace::{trace_sampling_loop, Value};
use crate::upload::{blob_path, upload_to_blob_storage};
use crate::weights::{write_external, NameMapper, NetworkParameters};

/// Files produced by an export.
#[derive(Debug, Clone)]
pub struct ExportOutcome {
    /// Textual program (`<safe-name>.mlir`).
    pub ir_path: PathBuf,
    /// Compiled artifact, when compiling to a binary.
    pub artifact_path: Option<PathBuf>,
    /// External weights archive, when weights are stored externally.
    pub weights_path: Option<PathBuf>,
    /// Contents of the IR file.
    pub ir: String,
}

/// Exports the scheduler loop of `config`, downloading the UNet if needed.
pub fn export(config: &ExportConfig, tool: &ToolConfig) -> Result<ExportOutcome> {
    let sampling = &config.sampling;
    // Reject bad identifiers and shapes before touching the network.
    SchedulerId::lookup(&sampling.scheduler_id)?;
    let spec = ModelSpec::resolve(&sampling.model);
    InputShapes::new(
        sampling.batch_size,
        sampling.height,
        sampling.width,
        spec.embedding_dim,
    )?;

    let model_dir = sampling
        .model_dir
        .clone()
        .unwrap_or_else(|| model_dir_for(&tool.effective_model_path(), &spec));
    ensure_unet(&spec, sampling.auth_token.as_deref(), &model_dir)?;
    let params = NetworkParameters::load_unet(&model_dir)?;

    export_with_parameters(config, tool, &params)
}

/// Exports with already loaded network parameters.
pub fn export_with_parameters(
    config: &ExportConfig,
    tool: &ToolConfig,
    params: &NetworkParameters,
) -> Result<ExportOutcome> {
    let sampling = &config.sampling;
    let id = SchedulerId::lookup(&sampling.scheduler_id)?;
    let spec = ModelSpec::resolve(&sampling.model);
    let shapes = InputShapes::new(
        sampling.batch_size,
        sampling.height,
        sampling.width,
        spec.embedding_dim,
    )?;

    let program = build_program(config, id, &spec, &shapes)?;

    std::fs::create_dir_all(&config.output_dir).map_err(|e| {
        AotError::io(
            format!("Failed to create {}", config.output_dir.display()),
            e,
        )
    })?;

    let mapper = NameMapper::new();
    let (weights_mode, weights_path) = match config.external_weights {
        Some(format) => {
            let path = config.external_weight_path.clone().unwrap_or_else(|| {
                config.output_dir.join(format!(
                    "{}.{}",
                    create_safe_name(&spec.id, ""),
                    format.extension()
                ))
            });
            write_external(&path, params, &mapper)?;
            (WeightsMode::External, Some(path))
        }
        None => (WeightsMode::Inline, None),
    };

    let globals: Vec<ParameterGlobal> = params
        .entries(&mapper)
        .into_iter()
        .map(|entry| ParameterGlobal {
            storage_name: entry.storage_name,
            size: entry.size,
        })
        .collect();
    let storage = match weights_mode {
        WeightsMode::Inline => ParameterStorage::Inline,
        WeightsMode::External => ParameterStorage::External,
    };
    let ir = print_module(&program, config.compile_to.as_str(), &globals, storage);

    let safe_name = spec.safe_name("-scheduler");
    let ir_path = config.output_dir.join(format!("{}.mlir", safe_name));
    write_text(&ir_path, &ir)?;
    println!("Saved to {}", ir_path.display());

    if config.upload_ir {
        upload_ir(&ir_path, &spec, tool)?;
    }

    let artifact_path = if config.compile_to == CompileStage::Binary {
        let artifact = LocalCompiler.compile(&CompileRequest {
            program: &program,
            target: TargetSpec {
                device: config.device,
                target_triple: config.target_triple.clone(),
                max_allocation: config.max_allocation,
            },
            parameters: params,
            weights_mode,
            mapper,
        })?;
        let path = config.output_dir.join(format!("{}.artifact", safe_name));
        artifact.write_to(&path)?;
        Some(path)
    } else {
        None
    };

    Ok(ExportOutcome {
        ir_path,
        artifact_path,
        weights_path,
        ir,
    })
}

/// Traces the loop and runs the passes the requested stage calls for.
fn build_program(
    config: &ExportConfig,
    id: SchedulerId,
    spec: &ModelSpec,
    shapes: &InputShapes,
) -> Result<Program> {
    let sampling = &config.sampling;
    let mut scheduler: DynScheduler<Value> = create_scheduler(
        id,
        ScheduleConfig::stable_diffusion(spec.prediction_type),
        sampling.seed,
    );
    scheduler.set_timesteps(sampling.num_inference_steps)?;

    let traced = trace_sampling_loop(&mut scheduler, shapes, sampling.guidance_scale)?;
    let program = match config.compile_to {
        CompileStage::Trace => traced,
        CompileStage::Lowered | CompileStage::Binary => lower_program(&traced),
    };
    info!(
        scheduler = %id,
        stochastic = id.is_stochastic(),
        stage = config.compile_to.as_str(),
        instructions = program.instructions.len(),
        "Built program"
    );
    Ok(program)
}

fn upload_ir(ir_path: &Path, spec: &ModelSpec, tool: &ToolConfig) -> Result<()> {
    let Some(container) = tool.blob_url.as_deref() else {
        warn!("--upload-ir given but SD_AOT_BLOB_URL is not set");
        return Err(AotError::upload_failed("SD_AOT_BLOB_URL is not set"));
    };
    upload_to_blob_storage(ir_path, container, &blob_path(&spec.id))
}

fn write_text(path: &Path, text: &str) -> Result<()> {
    std::fs::write(path, text)
        .map_err(|e| AotError::io(format!("Failed to write {}", path.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SamplingConfig, WeightsFormat};
    use crate::error::ErrorCode;
    use crate::weights::UNET_MODEL_KEY;
    use tempfile::TempDir;

    fn params() -> NetworkParameters {
        let mut params = NetworkParameters::new();
        params.insert(UNET_MODEL_KEY, b"graph".to_vec());
        params
    }

    fn config(dir: &Path, stage: CompileStage) -> ExportConfig {
        ExportConfig {
            sampling: SamplingConfig {
                num_inference_steps: 3,
                height: 64,
                width: 64,
                ..SamplingConfig::default()
            },
            compile_to: stage,
            output_dir: dir.to_path_buf(),
            ..ExportConfig::default()
        }
    }

    #[test]
    fn trace_stage_writes_ir_only() {
        let dir = TempDir::new().unwrap();
        let outcome =
            export_with_parameters(&config(dir.path(), CompileStage::Trace), &ToolConfig::default(), &params())
                .unwrap();

        assert_eq!(
            outcome.ir_path,
            dir.path().join("stable_diffusion_v1_4_scheduler.mlir")
        );
        assert!(outcome.artifact_path.is_none());
        let text = std::fs::read_to_string(&outcome.ir_path).unwrap();
        assert_eq!(text, outcome.ir);
        assert!(text.contains("sched.stage = \"trace\""));
        assert!(text.contains("tensor<1x4x8x8xf32>, %arg1: tensor<2x77x768xf32>"));
        assert_eq!(text.matches("sched.unet").count(), 3);
    }

    #[test]
    fn binary_stage_writes_artifact() {
        let dir = TempDir::new().unwrap();
        let outcome = export_with_parameters(
            &config(dir.path(), CompileStage::Binary),
            &ToolConfig::default(),
            &params(),
        )
        .unwrap();
        let artifact = outcome.artifact_path.unwrap();
        assert_eq!(artifact, dir.path().join("stable_diffusion_v1_4_scheduler.artifact"));
        assert!(artifact.exists());
    }

    #[test]
    fn external_weights_written_next_to_ir() {
        let dir = TempDir::new().unwrap();
        let mut config = config(dir.path(), CompileStage::Lowered);
        config.external_weights = Some(WeightsFormat::Safetensors);
        let outcome = export_with_parameters(&config, &ToolConfig::default(), &params()).unwrap();

        assert_eq!(
            outcome.weights_path,
            Some(dir.path().join("stable_diffusion_v1_4.safetensors"))
        );
        assert!(outcome.ir.contains("#stream.parameter.named<\"model\"::\"unet.model_onnx\">"));
    }

    #[test]
    fn unknown_scheduler_fails_first() {
        let dir = TempDir::new().unwrap();
        let mut config = config(dir.path(), CompileStage::Trace);
        config.sampling.scheduler_id = "Heun".to_string();
        config.sampling.model_dir = Some(dir.path().join("missing"));

        let err = export(&config, &ToolConfig::default()).unwrap_err();
        assert_eq!(err.code, ErrorCode::UnknownScheduler);
        assert!(!dir.path().join("missing").exists());
    }

    #[test]
    fn allocation_ceiling_reported() {
        let dir = TempDir::new().unwrap();
        let mut config = config(dir.path(), CompileStage::Binary);
        config.max_allocation = 1024;
        let err = export_with_parameters(&config, &ToolConfig::default(), &params()).unwrap_err();
        assert_eq!(err.code, ErrorCode::AllocationLimitExceeded);
    }

    #[test]
    fn upload_without_url_fails() {
        let dir = TempDir::new().unwrap();
        let mut config = config(dir.path(), CompileStage::Trace);
        config.upload_ir = true;
        let err = export_with_parameters(&config, &ToolConfig::default(), &params()).unwrap_err();
        assert_eq!(err.code, ErrorCode::UploadFailed);
    }
}
