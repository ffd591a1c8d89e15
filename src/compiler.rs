//! Compilation of programs into deployable artifacts.
//!
//! An artifact is a safetensors container. Its metadata carries the program,
//! the target it was compiled for, the peak live-buffer size and the
//! fingerprints of the network parameters; inline parameters are stored as
//! `U8` tensors.

use std::collections::HashMap;
use std::path::Path;

use safetensors::tensor::SafeTensors;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{Device, DEFAULT_MAX_ALLOCATION};
use crate::error::{AotError, Result};
use crate::ir::{last_uses, Program};
use crate::weights::{check_entries, NameMapper, NetworkParameters, ParameterEntry};

/// Format tag stored in every artifact.
pub const ARTIFACT_FORMAT: &str = "sd-scheduler-aot/artifact-v1";

/// Element size of every program value (f32).
const ELEMENT_BYTES: u64 = 4;

/// Device, architecture and memory ceiling an artifact is compiled for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSpec {
    pub device: Device,
    pub target_triple: Option<String>,
    pub max_allocation: u64,
}

impl Default for TargetSpec {
    fn default() -> Self {
        Self {
            device: Device::Cpu,
            target_triple: None,
            max_allocation: DEFAULT_MAX_ALLOCATION,
        }
    }
}

/// Where the network parameters of an artifact live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightsMode {
    Inline,
    External,
}

impl WeightsMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WeightsMode::Inline => "inline",
            WeightsMode::External => "external",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "inline" => Some(WeightsMode::Inline),
            "external" => Some(WeightsMode::External),
            _ => None,
        }
    }
}

/// Everything a compiler needs to produce an artifact.
pub struct CompileRequest<'a> {
    pub program: &'a Program,
    pub target: TargetSpec,
    pub parameters: &'a NetworkParameters,
    pub weights_mode: WeightsMode,
    pub mapper: NameMapper,
}

/// Artifact metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactManifest {
    pub program: Program,
    pub target: TargetSpec,
    pub peak_bytes: u64,
    pub weights: Vec<ParameterEntry>,
    pub weights_mode: WeightsMode,
    pub created_by: String,
}

impl ArtifactManifest {
    fn to_metadata(&self) -> Result<HashMap<String, String>> {
        let encode = |what: &str, e: serde_json::Error| {
            AotError::compile_failed(format!("failed to encode {}: {}", what, e))
        };
        let mut metadata = HashMap::new();
        metadata.insert("format".to_string(), ARTIFACT_FORMAT.to_string());
        metadata.insert("program".to_string(), self.program.to_json()?);
        metadata.insert(
            "target".to_string(),
            serde_json::to_string(&self.target).map_err(|e| encode("target", e))?,
        );
        metadata.insert("peak_bytes".to_string(), self.peak_bytes.to_string());
        metadata.insert(
            "weights".to_string(),
            serde_json::to_string(&self.weights).map_err(|e| encode("weights", e))?,
        );
        metadata.insert(
            "weights_mode".to_string(),
            self.weights_mode.as_str().to_string(),
        );
        metadata.insert("created_by".to_string(), self.created_by.clone());
        Ok(metadata)
    }

    fn from_metadata(metadata: &HashMap<String, String>) -> Result<Self> {
        let field = |key: &str| {
            metadata
                .get(key)
                .ok_or_else(|| AotError::artifact_invalid(format!("missing '{}' metadata", key)))
        };
        let decode = |what: &str, e: serde_json::Error| {
            AotError::artifact_invalid(format!("malformed {}: {}", what, e))
        };

        let format = field("format")?;
        if format != ARTIFACT_FORMAT {
            return Err(AotError::artifact_invalid(format!(
                "unsupported format '{}' (expected '{}')",
                format, ARTIFACT_FORMAT
            )));
        }

        let program = Program::from_json(field("program")?)?;
        program.validate().map_err(|e| AotError::artifact_invalid(e.message))?;

        let weights: Vec<ParameterEntry> =
            serde_json::from_str(field("weights")?).map_err(|e| decode("weights", e))?;
        check_entries(&weights)?;

        Ok(Self {
            program,
            target: serde_json::from_str(field("target")?).map_err(|e| decode("target", e))?,
            peak_bytes: field("peak_bytes")?
                .parse()
                .map_err(|_| AotError::artifact_invalid("malformed peak_bytes"))?,
            weights,
            weights_mode: WeightsMode::parse(field("weights_mode")?)
                .ok_or_else(|| AotError::artifact_invalid("unknown weights mode"))?,
            created_by: metadata.get("created_by").cloned().unwrap_or_default(),
        })
    }
}

/// A compiled artifact held in memory.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub manifest: ArtifactManifest,
    bytes: Vec<u8>,
}

impl Artifact {
    /// Serialized artifact bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        std::fs::write(path, &self.bytes)
            .map_err(|e| AotError::io(format!("Failed to write {}", path.display()), e))?;
        info!(path = %path.display(), bytes = self.bytes.len(), "Wrote artifact");
        Ok(())
    }

    /// Parses artifact bytes, returning the manifest and any inline parameters.
    pub fn parse(bytes: &[u8]) -> Result<(ArtifactManifest, Option<NetworkParameters>)> {
        let (_, header) = SafeTensors::read_metadata(bytes)
            .map_err(|e| AotError::artifact_invalid(format!("not an artifact: {}", e)))?;
        let metadata = header
            .metadata()
            .as_ref()
            .ok_or_else(|| AotError::artifact_invalid("artifact has no metadata"))?;
        let manifest = ArtifactManifest::from_metadata(metadata)?;

        let inline = match manifest.weights_mode {
            WeightsMode::Inline => {
                let container = SafeTensors::deserialize(bytes)
                    .map_err(|e| AotError::artifact_invalid(format!("corrupt tensors: {}", e)))?;
                Some(NetworkParameters::from_container(&container, &manifest.weights)?)
            }
            WeightsMode::External => None,
        };
        Ok((manifest, inline))
    }
}

/// Turns a program into an artifact for a target.
pub trait Compiler {
    fn compile(&self, request: &CompileRequest<'_>) -> Result<Artifact>;
}

/// In-process compiler.
///
/// Checks the program, enforces the allocation ceiling and packages the
/// program with its parameters.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalCompiler;

impl Compiler for LocalCompiler {
    fn compile(&self, request: &CompileRequest<'_>) -> Result<Artifact> {
        let program = request.program;
        program.validate()?;
        if program.output_shape().is_none() {
            return Err(AotError::compile_failed("program has no output"));
        }

        let peak_bytes = peak_live_bytes(program);
        debug!(
            peak_bytes,
            limit = request.target.max_allocation,
            "Computed peak live-buffer size"
        );
        if peak_bytes > request.target.max_allocation {
            return Err(AotError::allocation_limit_exceeded(
                peak_bytes,
                request.target.max_allocation,
            ));
        }

        let weights = request.parameters.entries(&request.mapper);
        let manifest = ArtifactManifest {
            program: program.clone(),
            target: request.target.clone(),
            peak_bytes,
            weights: weights.clone(),
            weights_mode: request.weights_mode,
            created_by: format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
        };
        let metadata = manifest.to_metadata()?;

        let views = match request.weights_mode {
            WeightsMode::Inline => request.parameters.views(&weights)?,
            WeightsMode::External => Vec::new(),
        };
        let bytes = safetensors::tensor::serialize(views, &Some(metadata))
            .map_err(|e| AotError::compile_failed(format!("failed to serialize artifact: {}", e)))?;

        info!(
            device = %request.target.device,
            instructions = program.instructions.len(),
            unet_calls = program.unet_calls(),
            weights = request.weights_mode.as_str(),
            "Compiled artifact"
        );
        Ok(Artifact { manifest, bytes })
    }
}

fn value_bytes(shape: &[usize]) -> u64 {
    shape.iter().map(|&d| d as u64).product::<u64>() * ELEMENT_BYTES
}

/// Largest total size of simultaneously live values during execution.
///
/// Mirrors the release order of [`crate::ir::execute`]: a value is freed
/// right after its last reader, except the program output.
pub fn peak_live_bytes(program: &Program) -> u64 {
    let last_use = last_uses(program);
    let mut live: u64 = program
        .inputs
        .iter()
        .map(|input| value_bytes(&input.shape))
        .sum();
    let mut peak = live;

    for (index, inst) in program.instructions.iter().enumerate() {
        live += value_bytes(&inst.shape);
        peak = peak.max(live);

        let mut operands = inst.op.operands();
        operands.sort_unstable();
        operands.dedup();
        for operand in operands {
            if last_use[operand] == Some(index) && operand != program.output {
                if let Some(shape) = program.value_shape(operand) {
                    live -= value_bytes(shape);
                }
            }
        }
    }
    peak
}
