//! The closed set of VM instructions and their canonical text form.
//!
//! `Display` writes exactly the text `FromStr` accepts, so formatting a
//! parsed file and parsing it again yields the same instruction sequence.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Largest literal a `push constant` may carry (15-bit, as in the A-instruction).
pub const MAX_CONSTANT: u16 = 32767;

/// Named address spaces used by `push` and `pop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Segment {
    Constant,
    Local,
    Argument,
    This,
    That,
    Static,
    Pointer,
    Temp,
}

impl Segment {
    pub const ALL: [Segment; 8] = [
        Segment::Constant,
        Segment::Local,
        Segment::Argument,
        Segment::This,
        Segment::That,
        Segment::Static,
        Segment::Pointer,
        Segment::Temp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Segment::Constant => "constant",
            Segment::Local => "local",
            Segment::Argument => "argument",
            Segment::This => "this",
            Segment::That => "that",
            Segment::Static => "static",
            Segment::Pointer => "pointer",
            Segment::Temp => "temp",
        }
    }

    /// Highest index the segment accepts.
    pub fn max_index(&self) -> u16 {
        match self {
            Segment::Pointer => 1,
            Segment::Temp => 7,
            Segment::Static => 239,
            _ => MAX_CONSTANT,
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Segment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Segment::ALL
            .iter()
            .copied()
            .find(|seg| seg.as_str() == s)
            .ok_or_else(|| format!("unknown segment '{s}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArithmeticOp {
    Add,
    Sub,
    Neg,
    Eq,
    Gt,
    Lt,
    And,
    Or,
    Not,
}

impl ArithmeticOp {
    pub const ALL: [ArithmeticOp; 9] = [
        ArithmeticOp::Add,
        ArithmeticOp::Sub,
        ArithmeticOp::Neg,
        ArithmeticOp::Eq,
        ArithmeticOp::Gt,
        ArithmeticOp::Lt,
        ArithmeticOp::And,
        ArithmeticOp::Or,
        ArithmeticOp::Not,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ArithmeticOp::Add => "add",
            ArithmeticOp::Sub => "sub",
            ArithmeticOp::Neg => "neg",
            ArithmeticOp::Eq => "eq",
            ArithmeticOp::Gt => "gt",
            ArithmeticOp::Lt => "lt",
            ArithmeticOp::And => "and",
            ArithmeticOp::Or => "or",
            ArithmeticOp::Not => "not",
        }
    }

    pub fn is_unary(&self) -> bool {
        matches!(self, ArithmeticOp::Neg | ArithmeticOp::Not)
    }
}

impl fmt::Display for ArithmeticOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArithmeticOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ArithmeticOp::ALL
            .iter()
            .copied()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| format!("unknown command '{s}'"))
    }
}

/// One VM instruction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "op", content = "args", rename_all = "snake_case")]
pub enum Instruction {
    Push(Segment, u16),
    Pop(Segment, u16),
    Arithmetic(ArithmeticOp),
    Label(String),
    Goto(String),
    IfGoto(String),
    FunctionDecl { name: String, locals: u16 },
    CallOp { name: String, args: u16 },
    Return,
}

impl Instruction {
    /// The mnemonic this instruction is written with.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Instruction::Push(..) => "push",
            Instruction::Pop(..) => "pop",
            Instruction::Arithmetic(op) => op.as_str(),
            Instruction::Label(_) => "label",
            Instruction::Goto(_) => "goto",
            Instruction::IfGoto(_) => "if-goto",
            Instruction::FunctionDecl { .. } => "function",
            Instruction::CallOp { .. } => "call",
            Instruction::Return => "return",
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Push(seg, i) => write!(f, "push {seg} {i}"),
            Instruction::Pop(seg, i) => write!(f, "pop {seg} {i}"),
            Instruction::Arithmetic(op) => write!(f, "{op}"),
            Instruction::Label(l) => write!(f, "label {l}"),
            Instruction::Goto(l) => write!(f, "goto {l}"),
            Instruction::IfGoto(l) => write!(f, "if-goto {l}"),
            Instruction::FunctionDecl { name, locals } => write!(f, "function {name} {locals}"),
            Instruction::CallOp { name, args } => write!(f, "call {name} {args}"),
            Instruction::Return => f.write_str("return"),
        }
    }
}

/// A label, goto or function symbol: letters, digits, `_ . : $`, not led by a digit.
pub fn is_symbol(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || "_.:$".contains(c) => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || "_.:$".contains(c))
}

/// `Class.method` with both halves being symbols.
pub fn is_function_name(s: &str) -> bool {
    match s.split_once('.') {
        Some((class, method)) => {
            !class.is_empty()
                && !method.is_empty()
                && !method.contains('.')
                && is_symbol(class)
                && is_symbol(method)
        }
        None => false,
    }
}

fn parse_number(token: &str, what: &str, max: u16) -> Result<u16, String> {
    let n: u32 = token
        .parse()
        .map_err(|_| format!("{what} must be a non-negative integer, got '{token}'"))?;
    if n > max as u32 {
        return Err(format!("{what} {n} out of range (0-{max})"));
    }
    Ok(n as u16)
}

fn expect_arity(tokens: &[&str], n: usize) -> Result<(), String> {
    if tokens.len() < n + 1 {
        return Err(format!("'{}' expects {} operand(s)", tokens[0], n));
    }
    if tokens.len() > n + 1 {
        return Err(format!("unexpected token '{}'", tokens[n + 1]));
    }
    Ok(())
}

fn symbol(token: &str) -> Result<String, String> {
    if is_symbol(token) {
        Ok(token.to_string())
    } else {
        Err(format!("illegal label name '{token}'"))
    }
}

fn function_name(token: &str) -> Result<String, String> {
    if is_function_name(token) {
        Ok(token.to_string())
    } else {
        Err(format!(
            "illegal subroutine name '{token}' (expected <className>.<subroutineName>)"
        ))
    }
}

impl FromStr for Instruction {
    type Err = String;

    /// Parses one line that has already been stripped of comments.
    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(&command) = tokens.first() else {
            return Err("empty instruction".into());
        };
        match command {
            "push" | "pop" => {
                expect_arity(&tokens, 2)?;
                let seg: Segment = tokens[1].parse()?;
                let index = parse_number(tokens[2], "index", seg.max_index())?;
                if command == "push" {
                    Ok(Instruction::Push(seg, index))
                } else if seg == Segment::Constant {
                    Err("cannot pop to the constant segment".into())
                } else {
                    Ok(Instruction::Pop(seg, index))
                }
            }
            "label" => {
                expect_arity(&tokens, 1)?;
                Ok(Instruction::Label(symbol(tokens[1])?))
            }
            "goto" => {
                expect_arity(&tokens, 1)?;
                Ok(Instruction::Goto(symbol(tokens[1])?))
            }
            "if-goto" => {
                expect_arity(&tokens, 1)?;
                Ok(Instruction::IfGoto(symbol(tokens[1])?))
            }
            "function" => {
                expect_arity(&tokens, 2)?;
                Ok(Instruction::FunctionDecl {
                    name: function_name(tokens[1])?,
                    locals: parse_number(tokens[2], "local count", MAX_CONSTANT)?,
                })
            }
            "call" => {
                expect_arity(&tokens, 2)?;
                Ok(Instruction::CallOp {
                    name: function_name(tokens[1])?,
                    args: parse_number(tokens[2], "argument count", MAX_CONSTANT)?,
                })
            }
            "return" => {
                expect_arity(&tokens, 0)?;
                Ok(Instruction::Return)
            }
            other => {
                let op: ArithmeticOp = other.parse()?;
                expect_arity(&tokens, 0)?;
                Ok(Instruction::Arithmetic(op))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_command_shape() {
        let cases = [
            ("push constant 7", Instruction::Push(Segment::Constant, 7)),
            ("pop that 3", Instruction::Pop(Segment::That, 3)),
            ("add", Instruction::Arithmetic(ArithmeticOp::Add)),
            ("not", Instruction::Arithmetic(ArithmeticOp::Not)),
            ("label LOOP_START", Instruction::Label("LOOP_START".into())),
            ("goto END", Instruction::Goto("END".into())),
            ("if-goto Main$if.1", Instruction::IfGoto("Main$if.1".into())),
            (
                "function Main.main 2",
                Instruction::FunctionDecl { name: "Main.main".into(), locals: 2 },
            ),
            (
                "call Math.multiply 2",
                Instruction::CallOp { name: "Math.multiply".into(), args: 2 },
            ),
            ("return", Instruction::Return),
        ];
        for (text, expected) in cases {
            assert_eq!(text.parse::<Instruction>().unwrap(), expected, "{text}");
            assert_eq!(expected.to_string(), text);
        }
    }

    #[test]
    fn tolerates_extra_whitespace() {
        let i: Instruction = "  push\tlocal    2 ".parse().unwrap();
        assert_eq!(i, Instruction::Push(Segment::Local, 2));
    }

    #[test]
    fn rejects_bad_segments_and_indices() {
        assert!("push heap 1".parse::<Instruction>().unwrap_err().contains("unknown segment"));
        assert!("push constant -1".parse::<Instruction>().is_err());
        assert!("push constant 32768".parse::<Instruction>().unwrap_err().contains("out of range"));
        assert!("pop pointer 2".parse::<Instruction>().is_err());
        assert!("pop temp 8".parse::<Instruction>().is_err());
        assert!("push static 240".parse::<Instruction>().is_err());
        assert!("pop constant 1".parse::<Instruction>().unwrap_err().contains("constant"));
    }

    #[test]
    fn rejects_wrong_arity() {
        assert!("push constant".parse::<Instruction>().unwrap_err().contains("expects 2"));
        assert!("add 1".parse::<Instruction>().unwrap_err().contains("unexpected token"));
        assert!("return now".parse::<Instruction>().is_err());
        assert!("label".parse::<Instruction>().is_err());
    }

    #[test]
    fn validates_symbols() {
        assert!(is_symbol("WHILE_EXP0"));
        assert!(is_symbol("Main.main$ret.3"));
        assert!(!is_symbol("1abc"));
        assert!(!is_symbol("a-b"));
        assert!(is_function_name("Sys.init"));
        assert!(!is_function_name("main"));
        assert!(!is_function_name("A.b.c"));
        assert!(!is_function_name(".init"));
        assert!("function main 0".parse::<Instruction>().unwrap_err().contains("illegal subroutine"));
    }

    #[test]
    fn unknown_command() {
        let err = "jump 4".parse::<Instruction>().unwrap_err();
        assert_eq!(err, "unknown command 'jump'");
    }
}
