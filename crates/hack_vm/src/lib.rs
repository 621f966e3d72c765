//! Hack VM: runs the stack-based intermediate language of the Hack platform.
//!
//! ```text
//! source text --parse--> ParsedFile --link--> Program --> Vm (Memory + pc)
//! ```
//!
//! Parse and link errors are reported before a [`Vm`] exists; runtime faults
//! leave the machine in [`Status::Error`] until it is reset.

pub mod error;
pub mod exec;
pub mod instruction;
pub mod keyboard;
pub mod memory;
pub mod parser;
pub mod program;

pub use error::{BuildError, Fault, LinkError, ParseError, RuntimeError};
pub use exec::{RunReport, Status, Vm, VmConfig};
pub use instruction::{ArithmeticOp, Instruction, Segment};
pub use keyboard::key_code;
pub use memory::{Memory, Word, KEYBOARD_OFFSET, SCREEN_OFFSET, SCREEN_SIZE};
pub use parser::{parse, ParsedFile};
pub use program::{FileSymbol, FunctionSymbol, Program};
