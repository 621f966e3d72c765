//! The interpreter: one owned machine advancing a program counter through a linked program.
//!
//! Frames live in memory with the classic layout, pushed at the call site:
//!
//! ```text
//!   ARG -> argument 0 .. argument n-1
//!          return address
//!          saved LCL, ARG, THIS, THAT
//!   LCL -> local 0 .. local k-1
//!          working stack ..  <- SP
//! ```
//!
//! `reset` writes a sentinel frame at the stack base whose return address is
//! [`BOOTSTRAP_RETURN`]; returning through it halts the machine.

use crate::error::{BuildError, Fault, LinkError, RuntimeError};
use crate::instruction::{ArithmeticOp, Instruction, Segment};
use crate::memory::{
    Memory, Word, ARG, LCL, MEMORY_SIZE, SCREEN_OFFSET, SP, STACK_BASE, TEMP_BASE, THAT, THIS,
};
use crate::parser::{parse, ParsedFile};
use crate::program::Program;
use serde::Serialize;
use std::fmt;
use tracing::{debug, warn};

/// Words pushed by `call` below the callee's locals.
pub const FRAME_SIZE: i32 = 5;
/// Return address stored in the bootstrap frame.
pub const BOOTSTRAP_RETURN: Word = -1;

const FRAME_FLOOR: i32 = STACK_BASE as i32 + FRAME_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VmConfig {
    /// First address a push may not write; the stack grows up to here.
    pub stack_limit: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            stack_limit: SCREEN_OFFSET,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum Status {
    Ready,
    Running,
    Paused,
    Halted(Word),
    Error(Fault),
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ready => "ready",
            Status::Running => "running",
            Status::Paused => "paused",
            Status::Halted(_) => "halted",
            Status::Error(_) => "error",
        }
    }

    /// Halted or faulted: only `reset` leaves these states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Halted(_) | Status::Error(_))
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Halted(code) => write!(f, "halted ({code})"),
            Status::Error(fault) => write!(f, "error: {fault}"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Outcome of one host tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub steps: u64,
    pub status: Status,
}

pub struct Vm {
    cfg: VmConfig,
    program: Program,
    memory: Memory,
    pc: usize,
    /// Index of the function whose body is executing.
    function: usize,
    status: Status,
    steps: u64,
}

impl Vm {
    pub fn new(program: Program) -> Self {
        Self::with_config(program, VmConfig::default())
    }

    pub fn with_config(program: Program, cfg: VmConfig) -> Self {
        let mut vm = Self {
            cfg,
            program,
            memory: Memory::new(),
            pc: 0,
            function: 0,
            status: Status::Ready,
            steps: 0,
        };
        vm.reset();
        vm
    }

    pub fn build_from_files(files: &[ParsedFile]) -> Result<Self, LinkError> {
        Program::link(files).map(Self::new)
    }

    /// Parses and links `(file name, text)` pairs in order.
    pub fn from_sources<N: AsRef<str>, T: AsRef<str>>(
        sources: &[(N, T)],
    ) -> Result<Self, BuildError> {
        let files = sources
            .iter()
            .map(|(name, text)| parse(text.as_ref(), name.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::build_from_files(&files)?)
    }

    /// Clears memory and rewinds to the entry function. Valid in any state.
    pub fn reset(&mut self) {
        self.memory.clear();
        self.steps = 0;
        self.function = self.program.entry_index();
        let entry = self.program.entry();
        self.pc = entry.start;

        let base = STACK_BASE as i32;
        let lcl = base + FRAME_SIZE;
        let sp = lcl + entry.locals as i32;
        self.status = Status::Ready;
        if sp > self.cfg.stack_limit as i32 || sp > MEMORY_SIZE as i32 {
            let fault = self.fault(RuntimeError::StackOverflow { address: sp });
            warn!(%fault, "entry locals do not fit on the stack");
            self.status = Status::Error(fault);
            return;
        }

        // Sentinel frame: return address -1, saved pointers all 0.
        self.memory.set_pointer(STACK_BASE, BOOTSTRAP_RETURN as i32);
        self.memory.set_pointer(ARG, base);
        self.memory.set_pointer(LCL, lcl);
        self.memory.set_pointer(SP, sp);
        debug!(entry = %entry.name, pc = self.pc, sp, "vm reset");
    }

    /// Executes one instruction.
    ///
    /// Returns `Ok(Some(code))` once the program has halted (and on every later
    /// call until `reset`), `Ok(None)` to continue, or the fault that stopped it.
    pub fn step(&mut self) -> Result<Option<Word>, Fault> {
        match &self.status {
            Status::Halted(code) => return Ok(Some(*code)),
            Status::Error(fault) => return Err(fault.clone()),
            _ => {}
        }
        if self.status == Status::Ready {
            self.status = Status::Running;
        }

        match self.execute() {
            Ok(None) => {
                self.steps += 1;
                Ok(None)
            }
            Ok(Some(code)) => {
                self.steps += 1;
                debug!(code, steps = self.steps, "vm halted");
                self.status = Status::Halted(code);
                Ok(Some(code))
            }
            Err(error) => {
                let fault = self.fault(error);
                warn!(%fault, steps = self.steps, "vm fault");
                self.status = Status::Error(fault.clone());
                Err(fault)
            }
        }
    }

    fn fault(&self, error: RuntimeError) -> Fault {
        let current = &self.program.functions()[self.function];
        Fault {
            pc: self.pc,
            function: current.name.clone(),
            instruction: self
                .program
                .get(self.pc)
                .filter(|_| current.contains(self.pc))
                .cloned(),
            error,
        }
    }

    fn execute(&mut self) -> Result<Option<Word>, RuntimeError> {
        let pc = self.pc;
        let current = &self.program.functions()[self.function];
        if !current.contains(pc) {
            return if self.call_depth() == 0 {
                Ok(Some(0))
            } else {
                Err(RuntimeError::MissingReturn {
                    function: current.name.clone(),
                })
            };
        }

        let base = self.memory.pointer(LCL) + current.locals as i32;
        let static_base = self.program.static_base(self.function) as i32;
        let limit = self.cfg.stack_limit as i32;
        let program = &self.program;
        let mem = &mut self.memory;
        let mut next = pc + 1;
        // Linked programs resolve every jump and call.
        let target = program.target(pc).unwrap_or(next);

        match &program.instructions()[pc] {
            Instruction::Push(Segment::Constant, k) => push(mem, limit, *k as Word)?,
            Instruction::Push(seg, i) => {
                let value = match address(mem, *seg, *i, static_base)? {
                    Some(a) => mem.read(a)?,
                    None => *i as Word,
                };
                push(mem, limit, value)?;
            }
            Instruction::Pop(seg, i) => match address(mem, *seg, *i, static_base)? {
                Some(a) => {
                    mem.check(a)?;
                    let value = pop(mem, base)?;
                    mem.write(a, value)?;
                }
                None => {
                    pop(mem, base)?;
                }
            },
            Instruction::Arithmetic(op) => arithmetic(mem, base, *op)?,
            Instruction::Label(_) | Instruction::FunctionDecl { .. } => {}
            Instruction::Goto(_) => next = target,
            Instruction::IfGoto(_) => {
                if pop(mem, base)? != 0 {
                    next = target;
                }
            }
            Instruction::CallOp { args, .. } => {
                let callee = program.owner(target).unwrap_or(self.function);
                let locals = program.functions()[callee].locals as i32;
                let sp = mem.pointer(SP);
                let args = *args as i32;
                if sp - base < args {
                    return Err(RuntimeError::StackUnderflow);
                }
                let top = sp + FRAME_SIZE + locals;
                if top > limit {
                    return Err(RuntimeError::StackOverflow {
                        address: sp.max(limit),
                    });
                }
                mem.check(sp)?;
                mem.check(top - 1)?;

                let saved = [
                    pc as i32 + 1,
                    mem.pointer(LCL),
                    mem.pointer(ARG),
                    mem.pointer(THIS),
                    mem.pointer(THAT),
                ];
                for (offset, value) in saved.into_iter().enumerate() {
                    mem.write(sp + offset as i32, value as Word)?;
                }
                let lcl = sp + FRAME_SIZE;
                for a in lcl..top {
                    mem.write(a, 0)?;
                }
                mem.set_pointer(ARG, sp - args);
                mem.set_pointer(LCL, lcl);
                mem.set_pointer(SP, top);
                self.function = callee;
                next = target;
            }
            Instruction::Return => {
                let frame = mem.pointer(LCL);
                if frame < FRAME_FLOOR {
                    return Err(RuntimeError::NoActiveFrame);
                }
                let sp = mem.pointer(SP);
                if sp <= base {
                    return Err(RuntimeError::StackUnderflow);
                }
                let value = mem.read(sp - 1)?;
                let ret = mem.read(frame - FRAME_SIZE)?;
                let arg = mem.pointer(ARG);
                mem.check(arg)?;
                if ret != BOOTSTRAP_RETURN && (ret < 1 || ret as usize > program.len()) {
                    return Err(RuntimeError::BadReturnAddress(ret as i32));
                }
                let saved = mem.range(frame - 4, 4)?;
                let (lcl, saved_arg, this, that) = (saved[0], saved[1], saved[2], saved[3]);

                mem.write(arg, value)?;
                mem.set_pointer(SP, arg + 1);
                mem.set_pointer(THAT, that as i32);
                mem.set_pointer(THIS, this as i32);
                mem.set_pointer(ARG, saved_arg as i32);
                mem.set_pointer(LCL, lcl as i32);

                if ret == BOOTSTRAP_RETURN {
                    return Ok(Some(value));
                }
                next = ret as usize;
                // The caller is whoever owns the call site, even when the call was its last instruction.
                self.function = program.owner(next - 1).unwrap_or(self.function);
            }
        }

        self.pc = next;
        Ok(None)
    }

    // ── host loop ──────────────────────────────────────────────────────

    /// Ready or Paused becomes Running; other states are left alone.
    pub fn run(&mut self) {
        if matches!(self.status, Status::Ready | Status::Paused) {
            self.status = Status::Running;
        }
    }

    pub fn pause(&mut self) {
        if self.status == Status::Running {
            self.status = Status::Paused;
        }
    }

    /// Executes up to `budget` instructions while Running.
    pub fn run_for(&mut self, budget: u64) -> RunReport {
        let start = self.steps;
        let mut attempts = 0;
        while attempts < budget && self.status == Status::Running {
            attempts += 1;
            if self.step().is_err() {
                break;
            }
        }
        RunReport {
            steps: self.steps - start,
            status: self.status.clone(),
        }
    }

    /// Runs until halt, fault or `max_steps`; an unfinished run is left Paused.
    pub fn run_to_end(&mut self, max_steps: u64) -> RunReport {
        self.run();
        let report = self.run_for(max_steps);
        self.pause();
        RunReport {
            status: self.status.clone(),
            ..report
        }
    }

    // ── inspection ─────────────────────────────────────────────────────

    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn config(&self) -> &VmConfig {
        &self.cfg
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn current_function(&self) -> &str {
        &self.program.functions()[self.function].name
    }

    pub fn current_instruction(&self) -> Option<&Instruction> {
        let current = &self.program.functions()[self.function];
        self.program.get(self.pc).filter(|_| current.contains(self.pc))
    }

    pub fn stack_pointer(&self) -> i32 {
        self.memory.pointer(SP)
    }

    /// Frames above the bootstrap frame.
    pub fn call_depth(&self) -> usize {
        self.frames().count()
    }

    /// Function names, innermost first.
    pub fn backtrace(&self) -> Vec<&str> {
        let mut names = vec![self.current_function()];
        for frame in self.frames() {
            let caller = self
                .memory
                .read(frame - FRAME_SIZE)
                .ok()
                .filter(|&ret| ret > 0)
                .and_then(|ret| self.program.function_at(ret as usize - 1));
            if let Some(f) = caller {
                names.push(&f.name);
            }
        }
        names
    }

    /// `LCL` of every active frame, innermost first, excluding the bootstrap frame.
    fn frames(&self) -> impl Iterator<Item = i32> + '_ {
        let mut lcl = self.memory.pointer(LCL);
        std::iter::from_fn(move || {
            if lcl <= FRAME_FLOOR {
                return None;
            }
            let current = lcl;
            let saved = self.memory.read(current - 4).ok()? as i32;
            // Frames are strictly nested; anything else is a corrupted chain.
            lcl = if saved < current { saved } else { 0 };
            Some(current)
        })
    }

    /// The current function's operand stack, bottom first.
    pub fn working_stack(&self) -> &[Word] {
        let base = self.memory.pointer(LCL) + self.program.functions()[self.function].locals as i32;
        let len = self.memory.pointer(SP) - base;
        if len <= 0 {
            return &[];
        }
        self.memory.range(base, len as usize).unwrap_or(&[])
    }

    pub fn read(&self, address: i32) -> Result<Word, RuntimeError> {
        self.memory.read(address)
    }

    /// Host write; the engine sees the new value on its next step.
    pub fn write(&mut self, address: i32, value: Word) -> Result<(), RuntimeError> {
        self.memory.write(address, value)
    }

    pub fn read_range(&self, start: i32, len: usize) -> Result<&[Word], RuntimeError> {
        self.memory.range(start, len)
    }

    pub fn screen(&self) -> &[Word] {
        self.memory.screen()
    }

    pub fn pixel(&self, x: usize, y: usize) -> Option<bool> {
        self.memory.pixel(x, y)
    }

    pub fn keyboard(&self) -> Word {
        self.memory.keyboard()
    }

    pub fn set_keyboard(&mut self, key: Word) {
        self.memory.set_keyboard(key)
    }

    pub fn digest(&self) -> String {
        self.memory.digest()
    }
}

/// Absolute address of a segment cell, or `None` for `constant`.
fn address(
    mem: &Memory,
    seg: Segment,
    index: u16,
    static_base: i32,
) -> Result<Option<i32>, RuntimeError> {
    let i = index as i32;
    let a = match seg {
        Segment::Constant => return Ok(None),
        Segment::Local => mem.pointer(LCL) + i,
        Segment::Argument => mem.pointer(ARG) + i,
        Segment::This => mem.pointer(THIS) + i,
        Segment::That => mem.pointer(THAT) + i,
        Segment::Pointer => THIS as i32 + i,
        Segment::Temp => TEMP_BASE as i32 + i,
        Segment::Static => static_base + i,
    };
    if index > seg.max_index() {
        return Err(RuntimeError::OutOfBounds(a));
    }
    Ok(Some(a))
}

fn push(mem: &mut Memory, limit: i32, value: Word) -> Result<(), RuntimeError> {
    let sp = mem.pointer(SP);
    if sp >= limit {
        return Err(RuntimeError::StackOverflow { address: sp });
    }
    mem.write(sp, value)?;
    mem.set_pointer(SP, sp + 1);
    Ok(())
}

fn pop(mem: &mut Memory, base: i32) -> Result<Word, RuntimeError> {
    let sp = mem.pointer(SP);
    if sp <= base {
        return Err(RuntimeError::StackUnderflow);
    }
    let value = mem.read(sp - 1)?;
    mem.set_pointer(SP, sp - 1);
    Ok(value)
}

fn truth(b: bool) -> Word {
    if b {
        -1
    } else {
        0
    }
}

fn arithmetic(mem: &mut Memory, base: i32, op: ArithmeticOp) -> Result<(), RuntimeError> {
    let sp = mem.pointer(SP);
    let arity = if op.is_unary() { 1 } else { 2 };
    if sp - base < arity {
        return Err(RuntimeError::StackUnderflow);
    }
    let y = mem.read(sp - 1)?;
    let x = if op.is_unary() { 0 } else { mem.read(sp - 2)? };
    let r = match op {
        ArithmeticOp::Neg => return mem.write(sp - 1, y.wrapping_neg()),
        ArithmeticOp::Not => return mem.write(sp - 1, !y),
        ArithmeticOp::Add => x.wrapping_add(y),
        ArithmeticOp::Sub => x.wrapping_sub(y),
        ArithmeticOp::And => x & y,
        ArithmeticOp::Or => x | y,
        ArithmeticOp::Eq => truth(x == y),
        ArithmeticOp::Gt => truth(x > y),
        ArithmeticOp::Lt => truth(x < y),
    };
    mem.write(sp - 2, r)?;
    mem.set_pointer(SP, sp - 1);
    Ok(())
}
