//! sd-scheduler-aot: ahead-of-time compiled Stable Diffusion scheduler loops.
//!
//! The classifier-free-guidance denoising loop (UNet plus noise scheduler)
//! is written once against [`tensor::TensorOps`]. Running it with
//! [`tensor::EagerOps`] computes latents directly; running it with
//! [`trace::Tracer`] records a [`ir::Program`] that is lowered, printed as
//! text and compiled into an artifact that can be executed later and
//! compared against the eager result.
//!
//! # Modules
//!
//! - [`schedulers`]: PNDM, DDIM, DDPM, Euler, Euler ancestral and LMS
//! - [`sampling`]: the guided denoising loop
//! - [`trace`], [`ir`]: program capture, lowering and textual form
//! - [`compiler`], [`runtime`]: artifacts and their execution
//! - [`weights`]: network parameter blobs, inline or external
//! - [`models`]: UNet download and the ONNX Runtime session
//! - [`export`], [`runner`]: the two command pipelines
//!
//! # Example
//!
//! ```rust,ignore
//! use sd_scheduler_aot::config::{ExportConfig, ToolConfig};
//! use sd_scheduler_aot::export::export;
//!
//! let outcome = export(&ExportConfig::default(), &ToolConfig::from_env())?;
//! println!("{}", outcome.ir_path.display());
//! ```

pub mod cli;
pub mod compare;
pub mod compiler;
pub mod config;
pub mod error;
pub mod export;
pub mod ir;
pub mod models;
pub mod runner;
pub mod runtime;
pub mod sampling;
pub mod schedulers;
pub mod tensor;
pub mod trace;
pub mod upload;
pub mod weights;

#[cfg(test)]
mod testing;

pub use config::{Device, ExportConfig, RunConfig, ToolConfig};
pub use error::{AotError, ErrorCode, Result};
