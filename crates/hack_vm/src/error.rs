use crate::instruction::Instruction;
use serde::Serialize;
use std::fmt::Write;
use thiserror::Error;

/// A malformed line in one VM source file. Parsing stops at the first one.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("{file}:{line}: {message}")]
pub struct ParseError {
    pub file: String,
    /// 1-based source line.
    pub line: usize,
    pub message: String,
}

impl ParseError {
    pub fn new(file: impl Into<String>, line: usize, message: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            line,
            message: message.into(),
        }
    }

    /// Compiler-style rendering with the offending source line and a caret under it.
    pub fn render(&self, source: &str) -> String {
        let mut diag = String::new();
        let _ = writeln!(diag, "error: {}", self.message);
        let _ = writeln!(diag, " --> {}:{}", self.file, self.line);

        if let Some(raw_line) = source.lines().nth(self.line.saturating_sub(1)) {
            let line_text = raw_line.trim_end_matches('\r');
            let indent = line_text.len() - line_text.trim_start().len();
            let _ = writeln!(diag, "  |");
            let _ = writeln!(diag, "{:>4} | {}", self.line, line_text);
            let _ = writeln!(diag, "  | {}^", " ".repeat(indent));
        }

        diag
    }
}

/// Structural faults found while merging parsed files into one program.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum LinkError {
    #[error("function {0} is declared more than once")]
    DuplicateFunction(String),
    #[error("call to undefined function {name} in {file}")]
    UnresolvedCall { name: String, file: String },
    #[error("label {label} is not declared in function {function}")]
    UnresolvedLabel { label: String, function: String },
    #[error("label {label} is declared more than once in function {function}")]
    DuplicateLabel { label: String, function: String },
    #[error("file {0} is linked more than once")]
    DuplicateFile(String),
    #[error("static segment overflow: {file} needs {required} words in total")]
    StaticOverflow { file: String, required: usize },
    #[error("program has no instructions")]
    EmptyProgram,
    #[error("program has {len} instructions; at most {max} can be linked")]
    ProgramTooLarge { len: usize, max: usize },
    #[error("cannot use both Sys.init and top-level instructions as entry point")]
    ConflictingEntry,
    #[error("entry function {0} is not declared")]
    UnknownEntry(String),
}

/// Faults that can only be discovered while stepping.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum RuntimeError {
    #[error("stack underflow")]
    StackUnderflow,
    #[error("stack overflow at address {address}")]
    StackOverflow { address: i32 },
    #[error("address {0} is out of bounds")]
    OutOfBounds(i32),
    #[error("return without an active frame")]
    NoActiveFrame,
    #[error("function {function} ended without return")]
    MissingReturn { function: String },
    #[error("return address {0} is outside the program")]
    BadReturnAddress(i32),
}

/// A runtime error together with where it happened.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("{error} at pc {pc} in {function}{}", instruction_suffix(.instruction))]
pub struct Fault {
    pub pc: usize,
    pub function: String,
    pub instruction: Option<Instruction>,
    pub error: RuntimeError,
}

fn instruction_suffix(instruction: &Option<Instruction>) -> String {
    instruction
        .as_ref()
        .map(|i| format!(" ({i})"))
        .unwrap_or_default()
}

/// Either stage of building a VM from source text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("parse: {0}")]
    Parse(#[from] ParseError),
    #[error("link: {0}")]
    Link(#[from] LinkError),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
