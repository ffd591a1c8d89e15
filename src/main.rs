//! sd-scheduler-aot: export and run compiled Stable Diffusion scheduler loops.
//!
//! - `export`: trace the loop, write its IR and optionally an artifact
//! - `run`: execute an artifact, optionally checking it against eager execution

use std::time::Instant;

use tracing::info;
use tracing_subscriber::EnvFilter;

use sd_scheduler_aot::cli::{Cli, Command};
use sd_scheduler_aot::config::ToolConfig;
use sd_scheduler_aot::error::{AotError, ErrorCode, Result};
use sd_scheduler_aot::export::export;
use sd_scheduler_aot::runner::run as run_artifact;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse_args();

    let tool = ToolConfig::from_env();
    if let Some(problem) = tool.validate() {
        return Err(AotError::new(
            ErrorCode::IoFailed,
            format!("Invalid environment configuration: {}", problem),
        ));
    }

    let start_time = Instant::now();
    match &cli.command {
        Command::Export(args) => {
            let config = args.to_config(&tool);
            let outcome = export(&config, &tool)?;
            if let Some(path) = &outcome.artifact_path {
                println!("Compiled to {}", path.display());
            }
            if let Some(path) = &outcome.weights_path {
                println!("Weights saved to {}", path.display());
            }
        }
        Command::Run(args) => {
            let config = args.to_config(&tool);
            run_artifact(&config, &tool)?;
        }
    }
    info!("Finished in {:.2}s", start_time.elapsed().as_secs_f64());
    Ok(())
}
