//! Program representation of a traced sampling loop.
//!
//! A program is a flat SSA sequence: inputs take value ids `0..inputs.len()`,
//! and each instruction defines the next id. Programs serialize to JSON for
//! storage inside compiled artifacts.

use serde::{Deserialize, Serialize};

use crate::error::{AotError, Result};
use crate::tensor::TensorOps;

/// Index of an SSA value.
pub type ValueId = usize;

/// Which half of the batch a slice keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchHalf {
    First,
    Second,
}

/// A single operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Op {
    /// Multiply by a constant. The factor is an f32 widened to f64 so it
    /// survives JSON without rounding.
    Scale { input: ValueId, factor: f64 },
    Add { lhs: ValueId, rhs: ValueId },
    Sub { lhs: ValueId, rhs: ValueId },
    /// Concatenate along the batch axis.
    Concat { lhs: ValueId, rhs: ValueId },
    Slice { input: ValueId, half: BatchHalf },
    /// Seeded standard normal noise shaped like `like`.
    Noise { like: ValueId, seed: u64 },
    /// Denoising network call.
    Unet {
        sample: ValueId,
        conditioning: ValueId,
        timestep: f32,
    },
}

impl Op {
    /// Values read by the operation.
    pub fn operands(&self) -> Vec<ValueId> {
        match self {
            Op::Scale { input, .. } | Op::Slice { input, .. } => vec![*input],
            Op::Noise { like, .. } => vec![*like],
            Op::Add { lhs, rhs } | Op::Sub { lhs, rhs } | Op::Concat { lhs, rhs } => {
                vec![*lhs, *rhs]
            }
            Op::Unet {
                sample,
                conditioning,
                ..
            } => vec![*sample, *conditioning],
        }
    }

    /// Rewrites every operand through `f`.
    pub fn map_operands<F: Fn(ValueId) -> ValueId>(&self, f: F) -> Op {
        match *self {
            Op::Scale { input, factor } => Op::Scale {
                input: f(input),
                factor,
            },
            Op::Add { lhs, rhs } => Op::Add {
                lhs: f(lhs),
                rhs: f(rhs),
            },
            Op::Sub { lhs, rhs } => Op::Sub {
                lhs: f(lhs),
                rhs: f(rhs),
            },
            Op::Concat { lhs, rhs } => Op::Concat {
                lhs: f(lhs),
                rhs: f(rhs),
            },
            Op::Slice { input, half } => Op::Slice {
                input: f(input),
                half,
            },
            Op::Noise { like, seed } => Op::Noise {
                like: f(like),
                seed,
            },
            Op::Unet {
                sample,
                conditioning,
                timestep,
            } => Op::Unet {
                sample: f(sample),
                conditioning: f(conditioning),
                timestep,
            },
        }
    }

    /// Short mnemonic used in the textual form.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Op::Scale { .. } => "scale",
            Op::Add { .. } => "add",
            Op::Sub { .. } => "sub",
            Op::Concat { .. } => "concat",
            Op::Slice { .. } => "slice",
            Op::Noise { .. } => "noise",
            Op::Unet { .. } => "unet",
        }
    }
}

/// An operation together with the shape of the value it defines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub op: Op,
    pub shape: Vec<usize>,
}

/// A named program input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramInput {
    pub name: String,
    pub shape: Vec<usize>,
}

/// A traced sampling loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub inputs: Vec<ProgramInput>,
    pub instructions: Vec<Instruction>,
    pub output: ValueId,
}

impl Program {
    /// Total number of SSA values.
    pub fn num_values(&self) -> usize {
        self.inputs.len() + self.instructions.len()
    }

    /// Value id defined by instruction `index`.
    pub fn instruction_value(&self, index: usize) -> ValueId {
        self.inputs.len() + index
    }

    /// Shape of a value, if it exists.
    pub fn value_shape(&self, id: ValueId) -> Option<&[usize]> {
        if id < self.inputs.len() {
            Some(&self.inputs[id].shape)
        } else {
            self.instructions
                .get(id - self.inputs.len())
                .map(|inst| inst.shape.as_slice())
        }
    }

    /// Shape of the program output.
    pub fn output_shape(&self) -> Option<&[usize]> {
        self.value_shape(self.output)
    }

    /// Number of network invocations.
    pub fn unet_calls(&self) -> usize {
        self.instructions
            .iter()
            .filter(|inst| matches!(inst.op, Op::Unet { .. }))
            .count()
    }

    /// Serializes to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| AotError::compile_failed(format!("failed to serialize program: {}", e)))
    }

    /// Parses from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| AotError::artifact_invalid(format!("failed to parse program: {}", e)))
    }

    /// Checks SSA ordering and shape consistency of every instruction.
    pub fn validate(&self) -> Result<()> {
        for (index, inst) in self.instructions.iter().enumerate() {
            let id = self.instruction_value(index);
            for operand in inst.op.operands() {
                if operand >= id {
                    return Err(AotError::compile_failed(format!(
                        "%{} uses %{} before it is defined",
                        id, operand
                    )));
                }
            }
            let expected = self.infer_shape(&inst.op)?;
            if expected != inst.shape {
                return Err(AotError::compile_failed(format!(
                    "%{} ({}) declares shape {:?}, operands imply {:?}",
                    id,
                    inst.op.mnemonic(),
                    inst.shape,
                    expected
                )));
            }
        }
        if self.output >= self.num_values() {
            return Err(AotError::compile_failed(format!(
                "output %{} is not defined",
                self.output
            )));
        }
        Ok(())
    }

    fn operand_shape(&self, id: ValueId) -> Result<&[usize]> {
        self.value_shape(id)
            .ok_or_else(|| AotError::compile_failed(format!("%{} is not defined", id)))
    }

    fn infer_shape(&self, op: &Op) -> Result<Vec<usize>> {
        match op {
            Op::Scale { input, .. } | Op::Noise { like: input, .. } => {
                Ok(self.operand_shape(*input)?.to_vec())
            }
            Op::Add { lhs, rhs } | Op::Sub { lhs, rhs } => {
                let (l, r) = (self.operand_shape(*lhs)?, self.operand_shape(*rhs)?);
                if l != r {
                    return Err(AotError::shape_mismatch(op.mnemonic(), l, r));
                }
                Ok(l.to_vec())
            }
            Op::Concat { lhs, rhs } => {
                let (l, r) = (self.operand_shape(*lhs)?, self.operand_shape(*rhs)?);
                if l.is_empty() || l.len() != r.len() || l[1..] != r[1..] {
                    return Err(AotError::shape_mismatch("concat", l, r));
                }
                let mut shape = l.to_vec();
                shape[0] += r[0];
                Ok(shape)
            }
            Op::Slice { input, .. } => {
                let s = self.operand_shape(*input)?;
                if s.is_empty() || s[0] % 2 != 0 {
                    return Err(AotError::invalid_shape(format!(
                        "cannot slice batch of shape {:?}",
                        s
                    )));
                }
                let mut shape = s.to_vec();
                shape[0] /= 2;
                Ok(shape)
            }
            Op::Unet {
                sample,
                conditioning,
                ..
            } => {
                let (s, c) = (
                    self.operand_shape(*sample)?,
                    self.operand_shape(*conditioning)?,
                );
                if s.first() != c.first() {
                    return Err(AotError::shape_mismatch("unet", s, c));
                }
                Ok(s.to_vec())
            }
        }
    }
}

/// Replays a program on any tensor backend.
///
/// `inputs` must match the program inputs in order and shape.
pub fn execute<B: TensorOps>(program: &Program, ops: &mut B, inputs: Vec<B::Tensor>) -> Result<B::Tensor> {
    if inputs.len() != program.inputs.len() {
        return Err(AotError::invalid_shape(format!(
            "program takes {} inputs, got {}",
            program.inputs.len(),
            inputs.len()
        )));
    }
    for (input, decl) in inputs.iter().zip(&program.inputs) {
        let shape = ops.shape(input);
        if shape != decl.shape {
            return Err(AotError::invalid_shape(format!(
                "input '{}' expects shape {:?}, got {:?}",
                decl.name, decl.shape, shape
            )));
        }
    }

    let mut values: Vec<Option<B::Tensor>> = inputs.into_iter().map(Some).collect();
    values.reserve(program.instructions.len());
    let last_use = last_uses(program);

    for (index, inst) in program.instructions.iter().enumerate() {
        let result = match &inst.op {
            Op::Scale { input, factor } => ops.scale(lookup(&values, *input)?, *factor as f32)?,
            Op::Add { lhs, rhs } => ops.add(lookup(&values, *lhs)?, lookup(&values, *rhs)?)?,
            Op::Sub { lhs, rhs } => ops.sub(lookup(&values, *lhs)?, lookup(&values, *rhs)?)?,
            Op::Concat { lhs, rhs } => {
                ops.concat_batch(lookup(&values, *lhs)?, lookup(&values, *rhs)?)?
            }
            Op::Slice { input, half } => {
                let (first, second) = ops.split_batch(lookup(&values, *input)?)?;
                match half {
                    BatchHalf::First => first,
                    BatchHalf::Second => second,
                }
            }
            Op::Noise { like, seed } => ops.noise_like(lookup(&values, *like)?, *seed)?,
            Op::Unet {
                sample,
                conditioning,
                timestep,
            } => ops.predict_noise(
                lookup(&values, *sample)?,
                *timestep,
                lookup(&values, *conditioning)?,
            )?,
        };

        let produced = ops.shape(&result);
        if produced != inst.shape {
            return Err(AotError::execution_failed(format!(
                "%{} produced shape {:?}, expected {:?}",
                program.instruction_value(index),
                produced,
                inst.shape
            )));
        }
        values.push(Some(result));

        // Release values that are no longer needed.
        for operand in inst.op.operands() {
            if last_use[operand] == Some(index) && operand != program.output {
                values[operand] = None;
            }
        }
    }

    values
        .get_mut(program.output)
        .and_then(Option::take)
        .ok_or_else(|| AotError::execution_failed("program output was not computed"))
}

fn lookup<T>(values: &[Option<T>], id: ValueId) -> Result<&T> {
    values
        .get(id)
        .and_then(Option::as_ref)
        .ok_or_else(|| AotError::execution_failed(format!("%{} has no value", id)))
}

/// Index of the last instruction reading each value.
pub fn last_uses(program: &Program) -> Vec<Option<usize>> {
    let mut last = vec![None; program.num_values()];
    for (index, inst) in program.instructions.iter().enumerate() {
        for operand in inst.op.operands() {
            if operand < last.len() {
                last[operand] = Some(index);
            }
        }
    }
    last
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_program() -> Program {
        Program {
            inputs: vec![
                ProgramInput {
                    name: "sample".to_string(),
                    shape: vec![1, 4, 2, 2],
                },
                ProgramInput {
                    name: "encoder_hidden_states".to_string(),
                    shape: vec![2, 77, 8],
                },
            ],
            instructions: vec![
                Instruction {
                    op: Op::Scale {
                        input: 0,
                        factor: 1.0,
                    },
                    shape: vec![1, 4, 2, 2],
                },
                Instruction {
                    op: Op::Concat { lhs: 2, rhs: 2 },
                    shape: vec![2, 4, 2, 2],
                },
                Instruction {
                    op: Op::Unet {
                        sample: 3,
                        conditioning: 1,
                        timestep: 981.0,
                    },
                    shape: vec![2, 4, 2, 2],
                },
                Instruction {
                    op: Op::Slice {
                        input: 4,
                        half: BatchHalf::First,
                    },
                    shape: vec![1, 4, 2, 2],
                },
            ],
            output: 5,
        }
    }

    #[test]
    fn valid_program_passes() {
        tiny_program().validate().unwrap();
    }

    #[test]
    fn use_before_def_rejected() {
        let mut program = tiny_program();
        program.instructions[1].op = Op::Concat { lhs: 4, rhs: 2 };
        let err = program.validate().unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::CompileFailed);
    }

    #[test]
    fn wrong_shape_rejected() {
        let mut program = tiny_program();
        program.instructions[1].shape = vec![1, 4, 2, 2];
        assert!(program.validate().is_err());
    }

    #[test]
    fn json_round_trip_keeps_factors_exact() {
        let mut program = tiny_program();
        let factor = 0.1_f32 / 3.0;
        program.instructions[0].op = Op::Scale {
            input: 0,
            factor: factor as f64,
        };
        let json = program.to_json().unwrap();
        let back = Program::from_json(&json).unwrap();
        assert_eq!(back, program);
        match back.instructions[0].op {
            Op::Scale { factor: f, .. } => assert_eq!(f as f32, factor),
            _ => panic!("expected scale"),
        }
    }

    #[test]
    fn last_uses_tracks_final_reader() {
        let program = tiny_program();
        let last = last_uses(&program);
        assert_eq!(last[0], Some(0));
        assert_eq!(last[1], Some(2));
        assert_eq!(last[2], Some(1));
        assert_eq!(last[5], None);
    }

    #[test]
    fn unet_call_count() {
        assert_eq!(tiny_program().unet_calls(), 1);
    }
}
