//! Linker: merges parsed files into one addressable program.
//!
//! All symbols are resolved here, once. The interpreter only follows the
//! precomputed `targets` table and never looks a name up while stepping.

use crate::error::LinkError;
use crate::instruction::{Instruction, Segment};
use crate::memory::{Word, STATIC_BASE, STATIC_SIZE};
use crate::parser::ParsedFile;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Write;
use tracing::debug;

/// Function that owns instructions appearing before any `function` line.
pub const IMPLICIT_FUNCTION: &str = "__implicit";
/// Conventional entry point; preferred over declaration order when present.
pub const BOOTSTRAP_FUNCTION: &str = "Sys.init";
/// Longest linkable program: every return address `pc + 1` must fit in a positive word.
pub const MAX_PROGRAM_LEN: usize = Word::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FunctionSymbol {
    pub name: String,
    /// Index into [`Program::files`].
    pub file: usize,
    /// Global index of the `function` instruction (first body instruction for `__implicit`).
    pub start: usize,
    /// One past the last instruction of the body.
    pub end: usize,
    pub locals: u16,
    labels: BTreeMap<String, usize>,
}

impl FunctionSymbol {
    /// Global index of a label declared in this function.
    pub fn label(&self, name: &str) -> Option<usize> {
        self.labels.get(name).copied()
    }

    pub fn labels(&self) -> impl Iterator<Item = (&str, usize)> {
        self.labels.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn contains(&self, pc: usize) -> bool {
        (self.start..self.end).contains(&pc)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileSymbol {
    pub name: String,
    pub start: usize,
    pub end: usize,
    /// First RAM address of this file's `static` block.
    pub static_base: usize,
    pub static_count: usize,
}

#[derive(Debug, Clone)]
pub struct Program {
    instructions: Vec<Instruction>,
    /// Function index owning each instruction.
    owners: Vec<usize>,
    /// Resolved destination of each `goto`, `if-goto` and `call`.
    targets: Vec<Option<usize>>,
    functions: Vec<FunctionSymbol>,
    by_name: HashMap<String, usize>,
    files: Vec<FileSymbol>,
    entry: usize,
}

struct Builder {
    instructions: Vec<Instruction>,
    owners: Vec<usize>,
    functions: Vec<FunctionSymbol>,
    by_name: HashMap<String, usize>,
}

impl Builder {
    fn open(&mut self, name: &str, file: usize, locals: u16) -> Result<usize, LinkError> {
        if self.by_name.contains_key(name) {
            return Err(LinkError::DuplicateFunction(name.to_string()));
        }
        let idx = self.functions.len();
        let start = self.instructions.len();
        self.functions.push(FunctionSymbol {
            name: name.to_string(),
            file,
            start,
            end: start,
            locals,
            labels: BTreeMap::new(),
        });
        self.by_name.insert(name.to_string(), idx);
        Ok(idx)
    }

    fn close(&mut self, current: Option<usize>) {
        if let Some(f) = current {
            self.functions[f].end = self.instructions.len();
        }
    }
}

impl Program {
    /// Concatenates `files` in the given order and resolves every symbol.
    pub fn link(files: &[ParsedFile]) -> Result<Program, LinkError> {
        let mut seen = HashSet::new();
        for f in files {
            if !seen.insert(f.name.as_str()) {
                return Err(LinkError::DuplicateFile(f.name.clone()));
            }
        }

        let mut b = Builder {
            instructions: Vec::new(),
            owners: Vec::new(),
            functions: Vec::new(),
            by_name: HashMap::new(),
        };
        let mut file_symbols = Vec::with_capacity(files.len());
        let mut static_total = 0usize;

        for (file_idx, file) in files.iter().enumerate() {
            let start = b.instructions.len();
            let mut current: Option<usize> = None;
            let mut static_count = 0usize;

            for ins in &file.instructions {
                match ins {
                    Instruction::FunctionDecl { name, locals } => {
                        b.close(current);
                        current = Some(b.open(name, file_idx, *locals)?);
                    }
                    _ if current.is_none() => {
                        current = Some(b.open(IMPLICIT_FUNCTION, file_idx, 0)?);
                    }
                    _ => {}
                }
                // `current` is always set past the match above.
                let owner = current.unwrap_or_default();

                match ins {
                    Instruction::Label(label) => {
                        let at = b.instructions.len();
                        let f = &mut b.functions[owner];
                        if f.labels.insert(label.clone(), at).is_some() {
                            return Err(LinkError::DuplicateLabel {
                                label: label.clone(),
                                function: f.name.clone(),
                            });
                        }
                    }
                    Instruction::Push(Segment::Static, i) | Instruction::Pop(Segment::Static, i) => {
                        static_count = static_count.max(*i as usize + 1);
                    }
                    _ => {}
                }

                b.instructions.push(ins.clone());
                b.owners.push(owner);
            }
            b.close(current);

            static_total += static_count;
            if static_total > STATIC_SIZE {
                return Err(LinkError::StaticOverflow {
                    file: file.name.clone(),
                    required: static_total,
                });
            }
            file_symbols.push(FileSymbol {
                name: file.name.clone(),
                start,
                end: b.instructions.len(),
                static_base: STATIC_BASE + static_total - static_count,
                static_count,
            });
        }

        if b.instructions.is_empty() {
            return Err(LinkError::EmptyProgram);
        }
        if b.instructions.len() > MAX_PROGRAM_LEN {
            return Err(LinkError::ProgramTooLarge {
                len: b.instructions.len(),
                max: MAX_PROGRAM_LEN,
            });
        }

        let mut targets = Vec::with_capacity(b.instructions.len());
        for (pc, ins) in b.instructions.iter().enumerate() {
            let f = &b.functions[b.owners[pc]];
            let target = match ins {
                Instruction::CallOp { name, .. } => match b.by_name.get(name) {
                    Some(&callee) => Some(b.functions[callee].start),
                    None => {
                        return Err(LinkError::UnresolvedCall {
                            name: name.clone(),
                            file: file_symbols[f.file].name.clone(),
                        })
                    }
                },
                Instruction::Goto(label) | Instruction::IfGoto(label) => match f.label(label) {
                    Some(at) => Some(at),
                    None => {
                        return Err(LinkError::UnresolvedLabel {
                            label: label.clone(),
                            function: f.name.clone(),
                        })
                    }
                },
                _ => None,
            };
            targets.push(target);
        }

        let entry = match b.by_name.get(BOOTSTRAP_FUNCTION) {
            Some(_) if b.by_name.contains_key(IMPLICIT_FUNCTION) => {
                return Err(LinkError::ConflictingEntry)
            }
            Some(&idx) => idx,
            None => 0,
        };

        let program = Program {
            instructions: b.instructions,
            owners: b.owners,
            targets,
            functions: b.functions,
            by_name: b.by_name,
            files: file_symbols,
            entry,
        };
        debug!(
            files = program.files.len(),
            functions = program.functions.len(),
            instructions = program.instructions.len(),
            entry = %program.entry().name,
            "linked program"
        );
        Ok(program)
    }

    /// Starts execution at `name` instead of the default entry.
    pub fn with_entry(mut self, name: &str) -> Result<Program, LinkError> {
        self.entry = *self
            .by_name
            .get(name)
            .ok_or_else(|| LinkError::UnknownEntry(name.to_string()))?;
        Ok(self)
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn get(&self, pc: usize) -> Option<&Instruction> {
        self.instructions.get(pc)
    }

    pub fn functions(&self) -> &[FunctionSymbol] {
        &self.functions
    }

    pub fn function(&self, name: &str) -> Option<&FunctionSymbol> {
        self.by_name.get(name).map(|&i| &self.functions[i])
    }

    pub(crate) fn function_index(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// Index of the function whose body contains `pc`.
    pub fn owner(&self, pc: usize) -> Option<usize> {
        self.owners.get(pc).copied()
    }

    pub fn function_at(&self, pc: usize) -> Option<&FunctionSymbol> {
        self.owner(pc).map(|i| &self.functions[i])
    }

    /// Resolved jump or call destination of the instruction at `pc`.
    pub fn target(&self, pc: usize) -> Option<usize> {
        self.targets.get(pc).copied().flatten()
    }

    pub fn files(&self) -> &[FileSymbol] {
        &self.files
    }

    pub fn entry(&self) -> &FunctionSymbol {
        &self.functions[self.entry]
    }

    pub(crate) fn entry_index(&self) -> usize {
        self.entry
    }

    /// Base address of the static block of the file that owns `function`.
    pub fn static_base(&self, function: usize) -> usize {
        self.files[self.functions[function].file].static_base
    }

    /// Numbered listing with one header per function.
    pub fn listing(&self) -> String {
        let mut out = String::new();
        for f in &self.functions {
            let file = &self.files[f.file].name;
            let _ = writeln!(out, "// {} ({}, {} locals)", f.name, file, f.locals);
            for pc in f.start..f.end {
                let ins = &self.instructions[pc];
                match (ins, self.targets[pc]) {
                    (Instruction::Goto(_) | Instruction::IfGoto(_) | Instruction::CallOp { .. }, Some(t)) => {
                        let text = ins.to_string();
                        let _ = writeln!(out, "{pc:04}: {text:<32} -> {t:04}");
                    }
                    _ => {
                        let _ = writeln!(out, "{pc:04}: {ins}");
                    }
                }
            }
        }
        out
    }
}
