//! MLIR-style textual form of a program.

use std::fmt::Write;

use super::program::{BatchHalf, Op, Program, ValueId};

/// Where a network parameter global lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterStorage {
    /// Embedded in the compiled artifact.
    Inline,
    /// Resolved at load time from a named parameter archive.
    External,
}

/// A network parameter blob declared as a module global.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterGlobal {
    pub storage_name: String,
    pub size: usize,
}

fn tensor_type(shape: &[usize]) -> String {
    let mut s = String::from("tensor<");
    for dim in shape {
        let _ = write!(s, "{}x", dim);
    }
    s.push_str("f32>");
    s
}

fn value_name(program: &Program, id: ValueId) -> String {
    if id < program.inputs.len() {
        format!("%arg{}", id)
    } else {
        format!("%{}", id - program.inputs.len())
    }
}

/// Renders `program` as a module.
///
/// `stage` is recorded as a module attribute. Parameter globals are declared
/// either as inline resources or as named external parameters.
pub fn print_module(
    program: &Program,
    stage: &str,
    parameters: &[ParameterGlobal],
    storage: ParameterStorage,
) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "module @compiled_scheduler attributes {{sched.stage = \"{}\"}} {{",
        stage
    );

    for param in parameters {
        let init = match storage {
            ParameterStorage::Inline => format!("dense_resource<{}>", param.storage_name),
            ParameterStorage::External => format!(
                "#stream.parameter.named<\"model\"::\"{}\">",
                param.storage_name
            ),
        };
        let _ = writeln!(
            out,
            "  util.global private @{} = {} : tensor<{}xi8>",
            param.storage_name, init, param.size
        );
    }
    if !parameters.is_empty() {
        out.push('\n');
    }

    let args: Vec<String> = program
        .inputs
        .iter()
        .enumerate()
        .map(|(i, input)| format!("%arg{}: {}", i, tensor_type(&input.shape)))
        .collect();
    let result_type = program
        .output_shape()
        .map(tensor_type)
        .unwrap_or_else(|| "none".to_string());
    let _ = writeln!(
        out,
        "  func.func @main({}) -> {} {{",
        args.join(", "),
        result_type
    );

    for (index, inst) in program.instructions.iter().enumerate() {
        let name = value_name(program, program.instruction_value(index));
        let ty = tensor_type(&inst.shape);
        let v = |id: ValueId| value_name(program, id);
        let body = match &inst.op {
            Op::Scale { input, factor } => format!("sched.scale {}, {:e}", v(*input), factor),
            Op::Add { lhs, rhs } => format!("sched.add {}, {}", v(*lhs), v(*rhs)),
            Op::Sub { lhs, rhs } => format!("sched.sub {}, {}", v(*lhs), v(*rhs)),
            Op::Concat { lhs, rhs } => format!("sched.concat {}, {} dim = 0", v(*lhs), v(*rhs)),
            Op::Slice { input, half } => {
                let half = match half {
                    BatchHalf::First => "first",
                    BatchHalf::Second => "second",
                };
                format!("sched.slice {} {} dim = 0", v(*input), half)
            }
            Op::Noise { like, seed } => format!("sched.noise like {} seed = {}", v(*like), seed),
            Op::Unet {
                sample,
                conditioning,
                timestep,
            } => {
                let weights: Vec<String> = parameters
                    .iter()
                    .map(|p| format!("@{}", p.storage_name))
                    .collect();
                format!(
                    "sched.unet({}, {}) {{timestep = {:e}}} weights [{}]",
                    v(*sample),
                    v(*conditioning),
                    timestep,
                    weights.join(", ")
                )
            }
        };
        let _ = writeln!(out, "    {} = {} : {}", name, body, ty);
    }

    let _ = writeln!(
        out,
        "    return {} : {}",
        value_name(program, program.output),
        result_type
    );
    out.push_str("  }\n}\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Instruction, ProgramInput};

    fn program() -> Program {
        Program {
            inputs: vec![
                ProgramInput {
                    name: "sample".to_string(),
                    shape: vec![1, 4, 64, 64],
                },
                ProgramInput {
                    name: "encoder_hidden_states".to_string(),
                    shape: vec![2, 77, 768],
                },
            ],
            instructions: vec![
                Instruction {
                    op: Op::Concat { lhs: 0, rhs: 0 },
                    shape: vec![2, 4, 64, 64],
                },
                Instruction {
                    op: Op::Unet {
                        sample: 2,
                        conditioning: 1,
                        timestep: 981.0,
                    },
                    shape: vec![2, 4, 64, 64],
                },
                Instruction {
                    op: Op::Slice {
                        input: 3,
                        half: BatchHalf::Second,
                    },
                    shape: vec![1, 4, 64, 64],
                },
            ],
            output: 4,
        }
    }

    #[test]
    fn main_signature() {
        let text = print_module(&program(), "trace", &[], ParameterStorage::Inline);
        assert!(text.starts_with("module @compiled_scheduler"));
        assert!(text.contains(
            "func.func @main(%arg0: tensor<1x4x64x64xf32>, %arg1: tensor<2x77x768xf32>) -> tensor<1x4x64x64xf32>"
        ));
        assert!(text.contains("return %2 : tensor<1x4x64x64xf32>"));
    }

    #[test]
    fn external_parameters_are_named() {
        let params = vec![ParameterGlobal {
            storage_name: "unet.model_onnx".to_string(),
            size: 16,
        }];
        let text = print_module(&program(), "lowered", &params, ParameterStorage::External);
        assert!(text.contains(
            "util.global private @unet.model_onnx = #stream.parameter.named<\"model\"::\"unet.model_onnx\"> : tensor<16xi8>"
        ));
        assert!(text.contains("weights [@unet.model_onnx]"));
        assert!(text.contains("sched.stage = \"lowered\""));
    }

    #[test]
    fn inline_parameters_use_resources() {
        let params = vec![ParameterGlobal {
            storage_name: "unet.model_onnx".to_string(),
            size: 16,
        }];
        let text = print_module(&program(), "trace", &params, ParameterStorage::Inline);
        assert!(text.contains("dense_resource<unet.model_onnx>"));
    }
}
