//! Line-oriented parser for `.vm` source text.
//!
//! Blank lines and `//` comments are skipped; every other line must be exactly
//! one instruction. The first malformed line aborts the parse.

use crate::error::ParseError;
use crate::instruction::Instruction;
use serde::{Deserialize, Serialize};

const COMMENT: &str = "//";

/// The instructions of one source file, in source order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedFile {
    pub name: String,
    pub instructions: Vec<Instruction>,
}

impl ParsedFile {
    /// Canonical source text: one instruction per line, bodies indented under
    /// their `function` and `label` lines flush left.
    pub fn to_source(&self) -> String {
        let mut out = String::new();
        for ins in &self.instructions {
            match ins {
                Instruction::FunctionDecl { .. } | Instruction::Label(_) => {}
                _ => out.push_str("    "),
            }
            out.push_str(&ins.to_string());
            out.push('\n');
        }
        out
    }

    /// File name without directories or extension, e.g. `Main` for `src/Main.vm`.
    pub fn class_name(&self) -> &str {
        let base = self.name.rsplit(['/', '\\']).next().unwrap_or(&self.name);
        base.split('.').next().unwrap_or(base)
    }
}

/// Parses one file. Pure: the same text always yields the same result.
pub fn parse(text: &str, file_name: &str) -> Result<ParsedFile, ParseError> {
    let mut instructions = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = match raw.find(COMMENT) {
            Some(pos) => &raw[..pos],
            None => raw,
        }
        .trim();
        if line.is_empty() {
            continue;
        }
        let ins: Instruction = line
            .parse()
            .map_err(|message: String| ParseError::new(file_name, idx + 1, message))?;
        instructions.push(ins);
    }
    Ok(ParsedFile {
        name: file_name.to_string(),
        instructions,
    })
}
