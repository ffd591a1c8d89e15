//! Records the sampling loop into a [`Program`].

use tracing::{debug, info};

use crate::error::{AotError, Result};
use crate::ir::{Instruction, Op, Program, ProgramInput, ValueId};
use crate::sampling::{run_sampling_loop, InputShapes};
use crate::schedulers::{DynScheduler, Scheduler};
use crate::tensor::TensorOps;

/// Symbolic tensor: an SSA value id and its static shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value {
    pub id: ValueId,
    pub shape: Vec<usize>,
}

/// Tensor backend that records operations instead of computing them.
#[derive(Debug, Default)]
pub struct Tracer {
    inputs: Vec<ProgramInput>,
    instructions: Vec<Instruction>,
}

impl Tracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a program input. Inputs must be declared before any operation.
    pub fn input(&mut self, name: &str, shape: Vec<usize>) -> Result<Value> {
        if !self.instructions.is_empty() {
            return Err(AotError::trace_failed(format!(
                "input '{}' declared after the first operation",
                name
            )));
        }
        self.inputs.push(ProgramInput {
            name: name.to_string(),
            shape: shape.clone(),
        });
        Ok(Value {
            id: self.inputs.len() - 1,
            shape,
        })
    }

    /// Finishes the trace with `output` as the program result.
    pub fn finish(self, output: &Value) -> Result<Program> {
        let program = Program {
            inputs: self.inputs,
            instructions: self.instructions,
            output: output.id,
        };
        program
            .validate()
            .map_err(|e| AotError::trace_failed(e.message))?;
        Ok(program)
    }

    fn record(&mut self, op: Op, shape: Vec<usize>) -> Value {
        let id = self.inputs.len() + self.instructions.len();
        self.instructions.push(Instruction {
            op,
            shape: shape.clone(),
        });
        Value { id, shape }
    }
}

impl TensorOps for Tracer {
    type Tensor = Value;

    fn shape(&self, x: &Value) -> Vec<usize> {
        x.shape.clone()
    }

    fn scale(&mut self, x: &Value, factor: f32) -> Result<Value> {
        Ok(self.record(
            Op::Scale {
                input: x.id,
                factor: factor as f64,
            },
            x.shape.clone(),
        ))
    }

    fn add(&mut self, a: &Value, b: &Value) -> Result<Value> {
        if a.shape != b.shape {
            return Err(AotError::shape_mismatch("add", &a.shape, &b.shape));
        }
        Ok(self.record(Op::Add { lhs: a.id, rhs: b.id }, a.shape.clone()))
    }

    fn sub(&mut self, a: &Value, b: &Value) -> Result<Value> {
        if a.shape != b.shape {
            return Err(AotError::shape_mismatch("sub", &a.shape, &b.shape));
        }
        Ok(self.record(Op::Sub { lhs: a.id, rhs: b.id }, a.shape.clone()))
    }

    fn concat_batch(&mut self, a: &Value, b: &Value) -> Result<Value> {
        if a.shape.is_empty() || a.shape.len() != b.shape.len() || a.shape[1..] != b.shape[1..] {
            return Err(AotError::shape_mismatch("concat", &a.shape, &b.shape));
        }
        let mut shape = a.shape.clone();
        shape[0] += b.shape[0];
        Ok(self.record(Op::Concat { lhs: a.id, rhs: b.id }, shape))
    }

    fn split_batch(&mut self, x: &Value) -> Result<(Value, Value)> {
        let batch = x.shape.first().copied().unwrap_or(0);
        if batch == 0 || batch % 2 != 0 {
            return Err(AotError::invalid_shape(format!(
                "cannot split batch of shape {:?} into halves",
                x.shape
            )));
        }
        let mut shape = x.shape.clone();
        shape[0] = batch / 2;
        let first = self.record(
            Op::Slice {
                input: x.id,
                half: crate::ir::BatchHalf::First,
            },
            shape.clone(),
        );
        let second = self.record(
            Op::Slice {
                input: x.id,
                half: crate::ir::BatchHalf::Second,
            },
            shape,
        );
        Ok((first, second))
    }

    fn noise_like(&mut self, x: &Value, seed: u64) -> Result<Value> {
        Ok(self.record(Op::Noise { like: x.id, seed }, x.shape.clone()))
    }

    fn predict_noise(&mut self, sample: &Value, timestep: f32, conditioning: &Value) -> Result<Value> {
        if sample.shape.first() != conditioning.shape.first() {
            return Err(AotError::shape_mismatch(
                "unet",
                &sample.shape,
                &conditioning.shape,
            ));
        }
        Ok(self.record(
            Op::Unet {
                sample: sample.id,
                conditioning: conditioning.id,
                timestep,
            },
            sample.shape.clone(),
        ))
    }
}

/// Traces the full sampling loop for fixed shapes.
///
/// The scheduler must have its timesteps set; the resulting program takes
/// `sample` and `encoder_hidden_states` and returns the final latents.
pub fn trace_sampling_loop(
    scheduler: &mut DynScheduler<Value>,
    shapes: &InputShapes,
    guidance_scale: f32,
) -> Result<Program> {
    let mut tracer = Tracer::new();
    let sample = tracer.input("sample", shapes.latent())?;
    let conditioning = tracer.input("encoder_hidden_states", shapes.conditioning())?;

    info!(
        scheduler = %scheduler.id(),
        steps = scheduler.timesteps().len(),
        latent = ?shapes.latent(),
        "Tracing sampling loop"
    );

    let output = run_sampling_loop(
        &mut tracer,
        scheduler,
        &sample,
        &conditioning,
        guidance_scale,
        |k, n| debug!("traced step {}/{}", k, n),
    )?;

    let program = tracer.finish(&output)?;
    debug!(
        instructions = program.instructions.len(),
        unet_calls = program.unet_calls(),
        "Trace complete"
    );
    Ok(program)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::execute;
    use crate::schedulers::{create_scheduler, ScheduleConfig, SchedulerId};
    use crate::tensor::{seeded_noise, EagerOps};
    use crate::testing::ToyUnet;
    use ndarray::ArrayD;

    fn traced(id: SchedulerId, steps: usize, shapes: &InputShapes) -> Program {
        let mut scheduler: DynScheduler<Value> = create_scheduler(id, ScheduleConfig::default(), 5);
        scheduler.set_timesteps(steps).unwrap();
        trace_sampling_loop(&mut scheduler, shapes, 7.5).unwrap()
    }

    #[test]
    fn traced_program_has_one_unet_call_per_step() {
        let shapes = InputShapes::new(1, 16, 16, 8).unwrap();
        for id in SchedulerId::ALL {
            let program = traced(id, 6, &shapes);
            assert_eq!(program.unet_calls(), 6, "{}", id);
            assert_eq!(program.inputs.len(), 2);
            assert_eq!(program.inputs[0].name, "sample");
            assert_eq!(program.inputs[1].name, "encoder_hidden_states");
            assert_eq!(program.output_shape(), Some(&[1, 4, 2, 2][..]));
        }
    }

    #[test]
    fn replay_matches_eager_bit_for_bit() {
        let shapes = InputShapes::new(1, 16, 24, 8).unwrap();
        let latents = seeded_noise(&shapes.latent(), 21);
        let cond = seeded_noise(&shapes.conditioning(), 22);

        for id in SchedulerId::ALL {
            let program = traced(id, 5, &shapes);

            let mut unet = ToyUnet::default();
            let replayed = {
                let mut ops = EagerOps::new(&mut unet);
                execute(&program, &mut ops, vec![latents.clone(), cond.clone()]).unwrap()
            };

            let mut eager_scheduler: DynScheduler<ArrayD<f32>> =
                create_scheduler(id, ScheduleConfig::default(), 5);
            eager_scheduler.set_timesteps(5).unwrap();
            let mut unet = ToyUnet::default();
            let eager = {
                let mut ops = EagerOps::new(&mut unet);
                run_sampling_loop(&mut ops, &mut eager_scheduler, &latents, &cond, 7.5, |_, _| {})
                    .unwrap()
            };

            assert_eq!(replayed, eager, "{}", id);
        }
    }

    #[test]
    fn inputs_after_ops_rejected() {
        let mut tracer = Tracer::new();
        let x = tracer.input("sample", vec![1, 4, 2, 2]).unwrap();
        tracer.scale(&x, 2.0).unwrap();
        assert!(tracer.input("late", vec![1]).is_err());
    }

    #[test]
    fn tracer_checks_shapes() {
        let mut tracer = Tracer::new();
        let a = tracer.input("a", vec![1, 4, 2, 2]).unwrap();
        let b = tracer.input("b", vec![1, 4, 2, 3]).unwrap();
        assert!(tracer.add(&a, &b).is_err());
        assert!(tracer.split_batch(&a).is_err());
    }
}
