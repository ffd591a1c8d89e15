//! Runs a compiled artifact and optionally checks it against eager execution.

use ndarray::{ArrayD, IxDyn};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::info;

use crate::compare::{check_parity, max_abs_error, PARITY_TOLERANCE};
use crate::config::{RunConfig, ToolConfig};
use crate::error::{AotError, Result};
use crate::ir::Program;
use crate::models::ModelSpec;
use crate::runtime::LoadedArtifact;
use crate::sampling::run_sampling_loop;
use crate::schedulers::{create_scheduler, DynScheduler, ScheduleConfig, Scheduler, SchedulerId};
use crate::tensor::{DenoisingNetwork, EagerOps};

/// Results of a run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub output: ArrayD<f32>,
    pub reference: Option<ArrayD<f32>>,
    pub max_error: Option<f32>,
}

/// Uniform `[0, 1)` inputs for every program input, in declaration order.
pub fn random_inputs(program: &Program, seed: u64) -> Result<Vec<ArrayD<f32>>> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    program
        .inputs
        .iter()
        .map(|input| {
            let len: usize = input.shape.iter().product();
            let data: Vec<f32> = (0..len).map(|_| rng.gen::<f32>()).collect();
            ArrayD::from_shape_vec(IxDyn(&input.shape), data).map_err(|e| {
                AotError::invalid_shape(format!("input '{}': {}", input.name, e))
            })
        })
        .collect()
}

/// Loads the artifact of `config`, opens its network and runs it.
pub fn run(config: &RunConfig, tool: &ToolConfig) -> Result<RunOutcome> {
    if config.compare_reference {
        SchedulerId::lookup(&config.sampling.scheduler_id)?;
    }

    let loaded = LoadedArtifact::load(
        &config.artifact_path,
        config.device,
        config.external_weight_path.as_deref(),
    )?;
    let mut network = loaded.network(tool.threads)?;
    run_with_network(config, &loaded, &mut network)
}

/// Runs a loaded artifact on `network` and prints the results.
pub fn run_with_network(
    config: &RunConfig,
    loaded: &LoadedArtifact,
    network: &mut dyn DenoisingNetwork,
) -> Result<RunOutcome> {
    let reference_id = if config.compare_reference {
        Some(SchedulerId::lookup(&config.sampling.scheduler_id)?)
    } else {
        None
    };

    let inputs = random_inputs(loaded.program(), config.sampling.seed)?;
    let output = loaded.invoke(inputs.clone(), network)?;
    println!("OUTPUT: {}", output);
    println!("shape: {:?}, dtype: float32", output.shape());

    let Some(id) = reference_id else {
        return Ok(RunOutcome {
            output,
            reference: None,
            max_error: None,
        });
    };

    let reference = run_reference(config, id, &inputs, network)?;
    println!("REFERENCE OUTPUT: {}", reference);
    let error = max_abs_error(&output, &reference)?;
    println!("Largest error: {:e}", error);
    info!(error, tolerance = PARITY_TOLERANCE, "Compared against eager execution");
    check_parity(error, PARITY_TOLERANCE)?;

    Ok(RunOutcome {
        output,
        reference: Some(reference),
        max_error: Some(error),
    })
}

/// Runs the eager sampling loop on the same inputs and network.
fn run_reference(
    config: &RunConfig,
    id: SchedulerId,
    inputs: &[ArrayD<f32>],
    network: &mut dyn DenoisingNetwork,
) -> Result<ArrayD<f32>> {
    let [latents, conditioning] = inputs else {
        return Err(AotError::invalid_shape(format!(
            "reference run needs 2 inputs, program has {}",
            inputs.len()
        )));
    };

    let sampling = &config.sampling;
    let spec = ModelSpec::resolve(&sampling.model);
    let mut scheduler: DynScheduler<ArrayD<f32>> = create_scheduler(
        id,
        ScheduleConfig::stable_diffusion(spec.prediction_type),
        sampling.seed,
    );
    scheduler.set_timesteps(sampling.num_inference_steps)?;

    let mut ops = EagerOps::new(network);
    run_sampling_loop(
        &mut ops,
        &mut scheduler,
        latents,
        conditioning,
        sampling.guidance_scale,
        |k, n| tracing::debug!("reference step {}/{}", k, n),
    )
}
