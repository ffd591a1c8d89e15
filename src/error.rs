//! Error types for sd-scheduler-aot.
//!
//! Every failure is fatal to the current invocation: errors carry a code,
//! a message with context and an optional underlying cause, and are printed
//! once by the binary before it exits.

use std::fmt;

/// Error codes identifying the failing stage of an export or run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Scheduler identifier is not in the registry.
    /// Trigger: `--scheduler-id` typo or an algorithm that is not implemented.
    UnknownScheduler,

    /// Sampling loop started before the scheduler produced its timesteps.
    SchedulerNotInitialized,

    /// UNet files not found at the expected location.
    ModelNotFound,

    /// Failed to open the UNet with ONNX Runtime.
    ModelLoadFailed,

    /// Failed to download the UNet from the model hub.
    ModelDownloadFailed,

    /// A tensor does not have the shape the loop or program expects.
    InvalidShape,

    /// Tracing the sampling loop into a program failed.
    TraceFailed,

    /// The program could not be compiled into an artifact.
    CompileFailed,

    /// Peak buffer usage of the program exceeds the allocation ceiling.
    AllocationLimitExceeded,

    /// Artifact file is corrupt, from another tool, or references missing weights.
    ArtifactInvalid,

    /// Artifact was compiled for another device.
    DeviceMismatch,

    /// Executing the network or program failed.
    ExecutionFailed,

    /// Compiled and reference outputs diverge beyond tolerance.
    NumericMismatch,

    /// Uploading the program representation failed.
    UploadFailed,

    /// Reading or writing a local file failed.
    IoFailed,
}

impl ErrorCode {
    /// Returns the string representation of the error code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::UnknownScheduler => "UNKNOWN_SCHEDULER",
            ErrorCode::SchedulerNotInitialized => "SCHEDULER_NOT_INITIALIZED",
            ErrorCode::ModelNotFound => "MODEL_NOT_FOUND",
            ErrorCode::ModelLoadFailed => "MODEL_LOAD_FAILED",
            ErrorCode::ModelDownloadFailed => "MODEL_DOWNLOAD_FAILED",
            ErrorCode::InvalidShape => "INVALID_SHAPE",
            ErrorCode::TraceFailed => "TRACE_FAILED",
            ErrorCode::CompileFailed => "COMPILE_FAILED",
            ErrorCode::AllocationLimitExceeded => "ALLOCATION_LIMIT_EXCEEDED",
            ErrorCode::ArtifactInvalid => "ARTIFACT_INVALID",
            ErrorCode::DeviceMismatch => "DEVICE_MISMATCH",
            ErrorCode::ExecutionFailed => "EXECUTION_FAILED",
            ErrorCode::NumericMismatch => "NUMERIC_MISMATCH",
            ErrorCode::UploadFailed => "UPLOAD_FAILED",
            ErrorCode::IoFailed => "IO_FAILED",
        }
    }

    /// Returns a recovery hint suggesting how to resolve this error.
    pub fn recovery_hint(&self) -> &'static str {
        match self {
            ErrorCode::UnknownScheduler => {
                "Use one of PNDM, DDIM, DDPM, EulerDiscrete, EulerAncestralDiscrete, LMSDiscrete"
            }
            ErrorCode::SchedulerNotInitialized => {
                "Call set_timesteps with a positive step count before sampling"
            }
            ErrorCode::ModelNotFound => {
                "Run export once with network access (and --hf-auth-token for gated models), \
                 or place unet/model.onnx under --model-dir"
            }
            ErrorCode::ModelLoadFailed => {
                "Verify the ONNX files are complete, or delete the model cache and re-download"
            }
            ErrorCode::ModelDownloadFailed => {
                "Check the network connection, the model identifier and the auth token"
            }
            ErrorCode::InvalidShape => {
                "Height and width must be positive multiples of 8 and batch size at least 1"
            }
            ErrorCode::TraceFailed => "Re-run with RUST_LOG=debug to see the failing operation",
            ErrorCode::CompileFailed => "Re-export the program; it may have been hand-edited",
            ErrorCode::AllocationLimitExceeded => {
                "Raise --max-allocation or reduce batch size / resolution"
            }
            ErrorCode::ArtifactInvalid => {
                "Re-export the artifact, and pass --external-weight-path if it was compiled \
                 with external weights"
            }
            ErrorCode::DeviceMismatch => "Run with the --device the artifact was compiled for",
            ErrorCode::ExecutionFailed => "Check available memory, or run on --device cpu",
            ErrorCode::NumericMismatch => {
                "Make sure the artifact was exported with the same model, scheduler and step count"
            }
            ErrorCode::UploadFailed => "Check SD_AOT_BLOB_URL and its write permissions",
            ErrorCode::IoFailed => "Check the path exists and is writable",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Main error type for export and run operations.
#[derive(Debug)]
pub struct AotError {
    /// The error code identifying the type of error.
    pub code: ErrorCode,
    /// Human-readable error message with context.
    pub message: String,
    /// Optional underlying cause of the error.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl AotError {
    /// Creates a new AotError with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new AotError with an underlying cause.
    pub fn with_source(
        code: ErrorCode,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates an UNKNOWN_SCHEDULER error.
    pub fn unknown_scheduler(id: &str, known: &[&str]) -> Self {
        Self::new(
            ErrorCode::UnknownScheduler,
            format!("Unknown scheduler '{}' (known: {})", id, known.join(", ")),
        )
    }

    /// Creates a SCHEDULER_NOT_INITIALIZED error.
    pub fn scheduler_not_initialized(name: &str) -> Self {
        Self::new(
            ErrorCode::SchedulerNotInitialized,
            format!("Scheduler {} has no timesteps", name),
        )
    }

    /// Creates a MODEL_NOT_FOUND error.
    pub fn model_not_found(reason: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::ModelNotFound,
            format!("Model files not found: {}", reason.into()),
        )
    }

    /// Creates a MODEL_LOAD_FAILED error.
    pub fn model_load_failed(reason: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::ModelLoadFailed,
            format!("Failed to load model: {}", reason.into()),
        )
    }

    /// Creates a MODEL_DOWNLOAD_FAILED error.
    pub fn model_download_failed(reason: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::ModelDownloadFailed,
            format!("Failed to download model: {}", reason.into()),
        )
    }

    /// Creates an INVALID_SHAPE error.
    pub fn invalid_shape(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidShape, reason)
    }

    /// Creates an INVALID_SHAPE error for two tensors that should agree.
    pub fn shape_mismatch(op: &str, lhs: &[usize], rhs: &[usize]) -> Self {
        Self::new(
            ErrorCode::InvalidShape,
            format!("{}: shape {:?} does not match {:?}", op, lhs, rhs),
        )
    }

    /// Creates a TRACE_FAILED error.
    pub fn trace_failed(reason: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::TraceFailed,
            format!("Tracing failed: {}", reason.into()),
        )
    }

    /// Creates a COMPILE_FAILED error.
    pub fn compile_failed(reason: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::CompileFailed,
            format!("Compilation failed: {}", reason.into()),
        )
    }

    /// Creates an ALLOCATION_LIMIT_EXCEEDED error.
    pub fn allocation_limit_exceeded(peak: u64, limit: u64) -> Self {
        Self::new(
            ErrorCode::AllocationLimitExceeded,
            format!(
                "Program needs {} bytes of live buffers, ceiling is {} bytes",
                peak, limit
            ),
        )
    }

    /// Creates an ARTIFACT_INVALID error.
    pub fn artifact_invalid(reason: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::ArtifactInvalid,
            format!("Invalid artifact: {}", reason.into()),
        )
    }

    /// Creates a DEVICE_MISMATCH error.
    pub fn device_mismatch(compiled_for: &str, requested: &str) -> Self {
        Self::new(
            ErrorCode::DeviceMismatch,
            format!(
                "Artifact compiled for '{}' cannot run on '{}'",
                compiled_for, requested
            ),
        )
    }

    /// Creates an EXECUTION_FAILED error.
    pub fn execution_failed(reason: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::ExecutionFailed,
            format!("Execution failed: {}", reason.into()),
        )
    }

    /// Creates a NUMERIC_MISMATCH error.
    pub fn numeric_mismatch(error: f32, tolerance: f32) -> Self {
        Self::new(
            ErrorCode::NumericMismatch,
            format!(
                "Largest absolute error {:e} is not below tolerance {:e}",
                error, tolerance
            ),
        )
    }

    /// Creates an UPLOAD_FAILED error.
    pub fn upload_failed(reason: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::UploadFailed,
            format!("Upload failed: {}", reason.into()),
        )
    }

    /// Creates an IO_FAILED error wrapping an `std::io::Error`.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        let context = context.into();
        Self::with_source(
            ErrorCode::IoFailed,
            format!("{}: {}", context, source),
            source,
        )
    }
}

impl fmt::Display for AotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}. Recovery: {}",
            self.code,
            self.message,
            self.code.recovery_hint()
        )
    }
}

impl std::error::Error for AotError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Result type alias using AotError.
pub type Result<T> = std::result::Result<T, AotError>;
