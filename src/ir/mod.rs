//! Program representation, its textual form and the lowering pass.

pub mod lower;
pub mod printer;
pub mod program;

pub use lower::lower_program;
pub use printer::{print_module, ParameterGlobal, ParameterStorage};
pub use program::{execute, last_uses, BatchHalf, Instruction, Op, Program, ProgramInput, ValueId};
