//! Pretrained UNet handling.
//!
//! - [`registry`]: model identifiers, embedding widths and safe names
//! - [`loader`]: on-disk layout checks
//! - [`downloader`]: fetching the ONNX export from the hub
//! - [`unet`]: the ONNX Runtime noise predictor

pub mod downloader;
pub mod loader;
pub mod registry;
pub mod unet;

pub use downloader::ensure_unet;
pub use loader::{check_unet, model_dir_for, OPTIONAL_UNET_FILES, REQUIRED_UNET_FILES};
pub use registry::{create_safe_name, ModelSpec};
pub use unet::{execution_providers, OnnxUnet};
