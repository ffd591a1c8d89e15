//! Lowering pass: identity-scale folding and dead value elimination.
//!
//! Both rewrites leave every computed element bit-identical.

use tracing::debug;

use super::program::{Instruction, Op, Program, ValueId};

/// Returns a simplified copy of `program`.
pub fn lower_program(program: &Program) -> Program {
    let num_inputs = program.inputs.len();

    // Forward every use of `x * 1.0` to `x`.
    let mut forward: Vec<ValueId> = (0..program.num_values()).collect();
    for (index, inst) in program.instructions.iter().enumerate() {
        let id = program.instruction_value(index);
        if let Op::Scale { input, factor } = inst.op {
            if factor == 1.0 {
                forward[id] = forward[input];
            }
        }
    }
    let resolve = |id: ValueId| forward[id];

    let rewritten: Vec<Instruction> = program
        .instructions
        .iter()
        .map(|inst| Instruction {
            op: inst.op.map_operands(resolve),
            shape: inst.shape.clone(),
        })
        .collect();
    let output = resolve(program.output);

    // Mark values reachable from the output.
    let mut live = vec![false; program.num_values()];
    live[output] = true;
    for index in (0..rewritten.len()).rev() {
        if !live[num_inputs + index] {
            continue;
        }
        for operand in rewritten[index].op.operands() {
            live[operand] = true;
        }
    }

    // Renumber surviving instructions densely.
    let mut renumber: Vec<Option<ValueId>> = vec![None; program.num_values()];
    for (id, slot) in renumber.iter_mut().enumerate().take(num_inputs) {
        *slot = Some(id);
    }
    let mut instructions = Vec::new();
    for (index, inst) in rewritten.into_iter().enumerate() {
        let id = num_inputs + index;
        if !live[id] {
            continue;
        }
        renumber[id] = Some(num_inputs + instructions.len());
        instructions.push(Instruction {
            op: inst.op.map_operands(|v| renumber[v].unwrap_or(v)),
            shape: inst.shape,
        });
    }

    let lowered = Program {
        inputs: program.inputs.clone(),
        instructions,
        output: renumber[output].unwrap_or(output),
    };
    debug!(
        before = program.instructions.len(),
        after = lowered.instructions.len(),
        "Lowered program"
    );
    lowered
}
