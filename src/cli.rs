//! Command-line interface.
//!
//! `export` traces a scheduler loop and writes its IR (and optionally a
//! compiled artifact); `run` executes an artifact and optionally compares it
//! against the eager loop.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::config::{
    CompileStage, Device, ExportConfig, RunConfig, SamplingConfig, ToolConfig, WeightsFormat,
    DEFAULT_MAX_ALLOCATION, DEFAULT_MODEL, DEFAULT_SCHEDULER,
};

/// Last stage of the export pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum CompileToArg {
    /// Traced program
    #[default]
    #[value(alias = "torch")]
    Trace,
    /// Program after identity folding and dead value removal
    #[value(alias = "linalg")]
    Lowered,
    /// Compiled artifact
    #[value(alias = "vmfb")]
    Binary,
}

impl From<CompileToArg> for CompileStage {
    fn from(arg: CompileToArg) -> Self {
        match arg {
            CompileToArg::Trace => CompileStage::Trace,
            CompileToArg::Lowered => CompileStage::Lowered,
            CompileToArg::Binary => CompileStage::Binary,
        }
    }
}

/// Format of externally stored weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum WeightsArg {
    Safetensors,
}

impl From<WeightsArg> for WeightsFormat {
    fn from(arg: WeightsArg) -> Self {
        match arg {
            WeightsArg::Safetensors => WeightsFormat::Safetensors,
        }
    }
}

/// sd-scheduler-aot: ahead-of-time Stable Diffusion scheduler loops
#[derive(Parser, Debug)]
#[command(name = "sd-scheduler-aot")]
#[command(about = "Export, run and verify compiled Stable Diffusion scheduler loops")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Trace the scheduler loop and write its IR, weights and artifact
    Export(ExportArgs),
    /// Execute a compiled artifact
    Run(RunArgs),
}

/// Model, scheduler and shape options shared by both subcommands.
#[derive(Args, Debug, Clone)]
pub struct SamplingArgs {
    /// Hugging Face model identifier
    #[arg(long, default_value = DEFAULT_MODEL)]
    pub hf_model_name: String,

    /// Hugging Face auth token for gated models
    #[arg(long)]
    pub hf_auth_token: Option<String>,

    /// Scheduler identifier (PNDM, DDIM, DDPM, EulerDiscrete, EulerAncestralDiscrete, LMSDiscrete)
    #[arg(long, default_value = DEFAULT_SCHEDULER)]
    pub scheduler_id: String,

    /// Number of denoising steps
    #[arg(long, default_value = "50", value_parser = clap::value_parser!(u32).range(1..=999))]
    pub num_inference_steps: u32,

    /// Latent batch size
    #[arg(long, default_value = "1", value_parser = clap::value_parser!(u32).range(1..))]
    pub batch_size: u32,

    /// Image height in pixels
    #[arg(long, default_value = "512")]
    pub height: u32,

    /// Image width in pixels
    #[arg(long, default_value = "512")]
    pub width: u32,

    /// Classifier-free guidance scale
    #[arg(long, default_value = "7.5")]
    pub guidance_scale: f32,

    /// Seed for random inputs and stochastic schedulers
    #[arg(long, default_value = "0")]
    pub seed: u64,

    /// Directory holding the UNet files (unet/model.onnx)
    #[arg(long)]
    pub model_dir: Option<PathBuf>,
}

impl SamplingArgs {
    pub fn to_config(&self) -> SamplingConfig {
        SamplingConfig {
            model: self.hf_model_name.clone(),
            auth_token: self.hf_auth_token.clone(),
            scheduler_id: self.scheduler_id.clone(),
            num_inference_steps: self.num_inference_steps as usize,
            batch_size: self.batch_size as usize,
            height: self.height as usize,
            width: self.width as usize,
            guidance_scale: self.guidance_scale,
            seed: self.seed,
            model_dir: self.model_dir.clone(),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ExportArgs {
    #[command(flatten)]
    pub sampling: SamplingArgs,

    /// Last pipeline stage (trace/torch, lowered/linalg, binary/vmfb)
    #[arg(long, value_enum, default_value_t = CompileToArg::Trace)]
    pub compile_to: CompileToArg,

    /// Store network weights in a separate file of this format
    #[arg(long, value_enum)]
    pub external_weights: Option<WeightsArg>,

    /// Path of the external weights file
    #[arg(long)]
    pub external_weight_path: Option<PathBuf>,

    /// Target device (cpu, cuda, rocm, metal)
    #[arg(long)]
    pub device: Option<Device>,

    /// Target architecture of the device, e.g. sm_80 or gfx1100
    #[arg(long, alias = "iree-target-triple")]
    pub target_triple: Option<String>,

    /// Device allocation ceiling in bytes
    #[arg(long, alias = "vulkan-max-allocation", default_value_t = DEFAULT_MAX_ALLOCATION)]
    pub max_allocation: u64,

    /// Upload the IR to blob storage (SD_AOT_BLOB_URL)
    #[arg(long)]
    pub upload_ir: bool,

    /// Directory receiving the outputs
    #[arg(long, default_value = ".")]
    pub output_dir: PathBuf,
}

impl ExportArgs {
    pub fn to_config(&self, tool: &ToolConfig) -> ExportConfig {
        ExportConfig {
            sampling: self.sampling.to_config(),
            compile_to: self.compile_to.into(),
            external_weights: self.external_weights.map(Into::into),
            external_weight_path: self.external_weight_path.clone(),
            device: effective_device(self.device, tool),
            target_triple: self.target_triple.clone(),
            max_allocation: self.max_allocation,
            upload_ir: self.upload_ir,
            output_dir: self.output_dir.clone(),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub sampling: SamplingArgs,

    /// Compiled artifact to execute
    #[arg(long, alias = "vmfb-path")]
    pub artifact_path: PathBuf,

    /// External weights file for artifacts compiled without inline weights
    #[arg(long)]
    pub external_weight_path: Option<PathBuf>,

    /// Device to run on (cpu, cuda, rocm, metal)
    #[arg(long)]
    pub device: Option<Device>,

    /// Also run the eager loop and compare outputs
    #[arg(long)]
    pub compare_reference: bool,
}

impl RunArgs {
    pub fn to_config(&self, tool: &ToolConfig) -> RunConfig {
        RunConfig {
            sampling: self.sampling.to_config(),
            artifact_path: self.artifact_path.clone(),
            external_weight_path: self.external_weight_path.clone(),
            device: effective_device(self.device, tool),
            compare_reference: self.compare_reference,
        }
    }
}

/// Command-line device, then `SD_AOT_DEVICE`, then CPU.
fn effective_device(arg: Option<Device>, tool: &ToolConfig) -> Device {
    arg.or(tool.device).unwrap_or_default()
}

impl Cli {
    /// Parses command-line arguments.
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("sd-scheduler-aot").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn export_defaults() {
        let Command::Export(args) = parse(&["export"]).command else {
            panic!("expected export");
        };
        let config = args.to_config(&ToolConfig::default());
        assert_eq!(config.sampling.model, "CompVis/stable-diffusion-v1-4");
        assert_eq!(config.sampling.scheduler_id, "PNDM");
        assert_eq!(config.sampling.num_inference_steps, 50);
        assert_eq!(config.compile_to, CompileStage::Trace);
        assert_eq!(config.device, Device::Cpu);
        assert_eq!(config.max_allocation, 4_294_967_296);
    }

    #[test]
    fn compile_to_aliases() {
        for (alias, stage) in [
            ("torch", CompileStage::Trace),
            ("linalg", CompileStage::Lowered),
            ("vmfb", CompileStage::Binary),
        ] {
            let Command::Export(args) = parse(&["export", "--compile-to", alias]).command else {
                panic!("expected export");
            };
            assert_eq!(CompileStage::from(args.compile_to), stage);
        }
    }

    #[test]
    fn run_flags() {
        let Command::Run(args) = parse(&[
            "run",
            "--artifact-path",
            "sched.artifact",
            "--device",
            "local-task",
            "--compare-reference",
            "--scheduler-id",
            "EulerDiscrete",
        ])
        .command
        else {
            panic!("expected run");
        };
        let config = args.to_config(&ToolConfig::default());
        assert_eq!(config.device, Device::Cpu);
        assert!(config.compare_reference);
        assert_eq!(config.sampling.scheduler_id, "EulerDiscrete");
    }

    #[test]
    fn env_device_used_when_flag_absent() {
        let tool = ToolConfig {
            device: Some(Device::Cuda),
            ..ToolConfig::default()
        };
        assert_eq!(effective_device(None, &tool), Device::Cuda);
        assert_eq!(effective_device(Some(Device::Rocm), &tool), Device::Rocm);
    }

    #[test]
    fn zero_steps_rejected() {
        assert!(Cli::try_parse_from(["sd-scheduler-aot", "export", "--num-inference-steps", "0"])
            .is_err());
        assert!(Cli::try_parse_from(["sd-scheduler-aot", "export", "--num-inference-steps", "1000"])
            .is_err());
    }
}
