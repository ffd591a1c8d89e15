//! Configuration for export and run invocations.
//!
//! Holds the execution device selection, the immutable per-invocation
//! configuration structs built once from command-line arguments, and the
//! environment-driven tool settings.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::sampling::DEFAULT_GUIDANCE_SCALE;

/// Default Hugging Face model identifier.
pub const DEFAULT_MODEL: &str = "CompVis/stable-diffusion-v1-4";

/// Default scheduler identifier.
pub const DEFAULT_SCHEDULER: &str = "PNDM";

/// Default device allocation ceiling in bytes (4 GiB).
pub const DEFAULT_MAX_ALLOCATION: u64 = 4_294_967_296;

/// Execution device for compiled artifacts and the UNet session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    /// Host CPU execution.
    #[default]
    Cpu,

    /// NVIDIA GPU through the CUDA execution provider.
    Cuda,

    /// AMD GPU through the ROCm execution provider.
    Rocm,

    /// Apple Silicon through CoreML.
    Metal,
}

impl Device {
    /// Returns the string representation of the device.
    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Cpu => "cpu",
            Device::Cuda => "cuda",
            Device::Rocm => "rocm",
            Device::Metal => "metal",
        }
    }

    /// Parses a device from a string.
    ///
    /// Accepts the runtime driver names `local-task`, `local-sync` and
    /// `llvm-cpu` as CPU aliases.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "cpu" | "local-task" | "local-sync" | "llvm-cpu" => Some(Device::Cpu),
            "cuda" => Some(Device::Cuda),
            "rocm" | "hip" => Some(Device::Rocm),
            "metal" | "coreml" => Some(Device::Metal),
            _ => None,
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Device::parse(s).ok_or_else(|| format!("unknown device '{}' (cpu, cuda, rocm, metal)", s))
    }
}

/// How far the export pipeline goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompileStage {
    /// Traced program only.
    #[default]
    Trace,
    /// Traced program after the lowering pass.
    Lowered,
    /// Lowered program compiled into a binary artifact.
    Binary,
}

impl CompileStage {
    /// Returns the string representation of the stage.
    pub fn as_str(&self) -> &'static str {
        match self {
            CompileStage::Trace => "trace",
            CompileStage::Lowered => "lowered",
            CompileStage::Binary => "binary",
        }
    }
}

/// On-disk format for externally stored network parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightsFormat {
    /// Hugging Face safetensors container.
    Safetensors,
}

impl WeightsFormat {
    /// File extension used for this format.
    pub fn extension(&self) -> &'static str {
        match self {
            WeightsFormat::Safetensors => "safetensors",
        }
    }
}

/// Shape and numeric parameters shared by export and run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Hugging Face model identifier of the UNet.
    pub model: String,

    /// Auth token for gated model downloads.
    #[serde(skip_serializing)]
    pub auth_token: Option<String>,

    /// Scheduler identifier, looked up in the scheduler registry.
    pub scheduler_id: String,

    /// Number of denoising steps.
    pub num_inference_steps: usize,

    /// Latent batch size.
    pub batch_size: usize,

    /// Image height in pixels (multiple of 8).
    pub height: usize,

    /// Image width in pixels (multiple of 8).
    pub width: usize,

    /// Classifier-free guidance scale.
    pub guidance_scale: f32,

    /// Seed for random inputs and stochastic schedulers.
    pub seed: u64,

    /// Directory holding (or receiving) downloaded UNet files.
    /// If None, uses the tool-level model path.
    pub model_dir: Option<PathBuf>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            auth_token: None,
            scheduler_id: DEFAULT_SCHEDULER.to_string(),
            num_inference_steps: 50,
            batch_size: 1,
            height: 512,
            width: 512,
            guidance_scale: DEFAULT_GUIDANCE_SCALE,
            seed: 0,
            model_dir: None,
        }
    }
}

/// Immutable configuration for one export invocation.
#[derive(Debug, Clone)]
pub struct ExportConfig {
    /// Model, scheduler and shape parameters.
    pub sampling: SamplingConfig,

    /// Last pipeline stage to run.
    pub compile_to: CompileStage,

    /// Store network parameters outside the artifact in this format.
    pub external_weights: Option<WeightsFormat>,

    /// Destination of external weights; defaults next to the IR.
    pub external_weight_path: Option<PathBuf>,

    /// Target device of the compiled artifact.
    pub device: Device,

    /// Target triple / architecture for the device (e.g. `sm_80`, `gfx1100`).
    pub target_triple: Option<String>,

    /// Device allocation ceiling in bytes.
    pub max_allocation: u64,

    /// Upload the IR file to blob storage after writing it.
    pub upload_ir: bool,

    /// Directory receiving the IR, artifact and weights.
    pub output_dir: PathBuf,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            sampling: SamplingConfig::default(),
            compile_to: CompileStage::Trace,
            external_weights: None,
            external_weight_path: None,
            device: Device::Cpu,
            target_triple: None,
            max_allocation: DEFAULT_MAX_ALLOCATION,
            upload_ir: false,
            output_dir: PathBuf::from("."),
        }
    }
}

/// Immutable configuration for one run invocation.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Model, scheduler and shape parameters (used for inputs and the reference run).
    pub sampling: SamplingConfig,

    /// Compiled artifact to execute.
    pub artifact_path: PathBuf,

    /// External weights file for artifacts compiled without inline parameters.
    pub external_weight_path: Option<PathBuf>,

    /// Device to execute on.
    pub device: Device,

    /// Also run the eager sampling loop and compare outputs.
    pub compare_reference: bool,
}

/// Tool-level settings read from the environment.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolConfig {
    /// Root directory for downloaded models.
    /// If None, uses the platform-specific default cache location.
    pub model_path: Option<PathBuf>,

    /// Number of threads for intra-op parallelism in ONNX Runtime.
    pub threads: Option<u32>,

    /// Blob container URL receiving uploaded IR files.
    pub blob_url: Option<String>,

    /// Device override applied when the command line leaves the default.
    pub device: Option<Device>,
}

impl ToolConfig {
    /// Creates a ToolConfig from environment variables.
    ///
    /// Reads the following environment variables:
    /// - `SD_AOT_MODEL_PATH` - Root directory for downloaded models
    /// - `SD_AOT_THREADS` - Number of ONNX Runtime intra-op threads
    /// - `SD_AOT_BLOB_URL` - Blob container URL for `--upload-ir`
    /// - `SD_AOT_DEVICE` - Device selection (cpu, cuda, rocm, metal)
    ///
    /// Falls back to defaults for unset or unparsable variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("SD_AOT_MODEL_PATH") {
            config.model_path = Some(PathBuf::from(path));
        }

        if let Ok(threads_str) = std::env::var("SD_AOT_THREADS") {
            if let Ok(threads) = threads_str.parse::<u32>() {
                if threads > 0 {
                    config.threads = Some(threads);
                }
            }
        }

        if let Ok(url) = std::env::var("SD_AOT_BLOB_URL") {
            if !url.trim().is_empty() {
                config.blob_url = Some(url.trim().to_string());
            }
        }

        if let Ok(device_str) = std::env::var("SD_AOT_DEVICE") {
            config.device = Device::parse(&device_str);
        }

        config
    }

    /// Returns the effective model root, using platform defaults if not specified.
    pub fn effective_model_path(&self) -> PathBuf {
        if let Some(ref path) = self.model_path {
            path.clone()
        } else {
            default_model_path()
        }
    }

    /// Validates the configuration.
    ///
    /// Returns an error message if validation fails, None otherwise.
    pub fn validate(&self) -> Option<String> {
        if let Some(threads) = self.threads {
            if threads == 0 {
                return Some("threads must be > 0".to_string());
            }
            if threads > 256 {
                return Some(format!("threads too high: {} (max 256)", threads));
            }
        }

        if let Some(ref url) = self.blob_url {
            if !url.starts_with("https://") && !url.starts_with("http://") {
                return Some(format!("blob url must be http(s): {}", url));
            }
        }

        None
    }
}

/// Returns the platform-specific default model storage path.
///
/// - macOS: ~/Library/Caches/sd-scheduler-aot/models
/// - Linux: ~/.cache/sd-scheduler-aot/models
/// - Windows: C:\Users\<user>\AppData\Local\sd-scheduler-aot\cache\models
fn default_model_path() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "sd-scheduler-aot") {
        proj_dirs.cache_dir().join("models")
    } else {
        PathBuf::from("./models")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_parsing() {
        assert_eq!(Device::parse("cpu"), Some(Device::Cpu));
        assert_eq!(Device::parse("local-task"), Some(Device::Cpu));
        assert_eq!(Device::parse("LOCAL-SYNC"), Some(Device::Cpu));
        assert_eq!(Device::parse("cuda"), Some(Device::Cuda));
        assert_eq!(Device::parse("rocm"), Some(Device::Rocm));
        assert_eq!(Device::parse("coreml"), Some(Device::Metal));
        assert_eq!(Device::parse("vulkan"), None);
        assert!("tpu".parse::<Device>().is_err());
    }

    #[test]
    fn device_display() {
        assert_eq!(Device::Cpu.to_string(), "cpu");
        assert_eq!(Device::Rocm.to_string(), "rocm");
    }

    #[test]
    fn sampling_defaults_match_reference_setup() {
        let config = SamplingConfig::default();
        assert_eq!(config.model, "CompVis/stable-diffusion-v1-4");
        assert_eq!(config.scheduler_id, "PNDM");
        assert_eq!(config.num_inference_steps, 50);
        assert_eq!(config.batch_size, 1);
        assert_eq!((config.height, config.width), (512, 512));
        assert_eq!(config.guidance_scale, 7.5);
    }

    #[test]
    fn export_defaults() {
        let config = ExportConfig::default();
        assert_eq!(config.compile_to, CompileStage::Trace);
        assert_eq!(config.max_allocation, 4_294_967_296);
        assert!(config.external_weights.is_none());
        assert!(!config.upload_ir);
    }

    #[test]
    fn tool_config_validation() {
        let mut config = ToolConfig::default();
        assert!(config.validate().is_none());

        config.threads = Some(0);
        assert!(config.validate().is_some());

        config.threads = Some(8);
        config.blob_url = Some("ftp://example".to_string());
        assert!(config.validate().is_some());

        config.blob_url = Some("https://account.blob.core.windows.net/tank".to_string());
        assert!(config.validate().is_none());
    }

    #[test]
    fn effective_model_path_is_valid() {
        let config = ToolConfig::default();
        assert!(!config.effective_model_path().as_os_str().is_empty());
    }
}
