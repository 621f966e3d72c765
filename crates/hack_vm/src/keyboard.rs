//! Key codes the host writes into the keyboard register.
//!
//! Printable characters use their ASCII value; special keys use the
//! platform's extended codes starting at 128. `0` means no key is pressed.

use crate::memory::Word;

pub const NO_KEY: Word = 0;
pub const NEWLINE: Word = 128;
pub const BACKSPACE: Word = 129;
pub const LEFT_ARROW: Word = 130;
pub const UP_ARROW: Word = 131;
pub const RIGHT_ARROW: Word = 132;
pub const DOWN_ARROW: Word = 133;
pub const HOME: Word = 134;
pub const END: Word = 135;
pub const PAGE_UP: Word = 136;
pub const PAGE_DOWN: Word = 137;
pub const INSERT: Word = 138;
pub const DELETE: Word = 139;
pub const ESCAPE: Word = 140;
pub const F1: Word = 141;

const NAMED: &[(&str, Word)] = &[
    ("Enter", NEWLINE),
    ("Backspace", BACKSPACE),
    ("ArrowLeft", LEFT_ARROW),
    ("Left", LEFT_ARROW),
    ("ArrowUp", UP_ARROW),
    ("Up", UP_ARROW),
    ("ArrowRight", RIGHT_ARROW),
    ("Right", RIGHT_ARROW),
    ("ArrowDown", DOWN_ARROW),
    ("Down", DOWN_ARROW),
    ("Home", HOME),
    ("End", END),
    ("PageUp", PAGE_UP),
    ("PageDown", PAGE_DOWN),
    ("Insert", INSERT),
    ("Delete", DELETE),
    ("Escape", ESCAPE),
];

/// Maps a key name (`"Enter"`, `"F5"`) or a single printable character to its code.
pub fn key_code(name: &str) -> Option<Word> {
    let mut chars = name.chars();
    if let (Some(c), None) = (chars.next(), chars.next()) {
        return (c.is_ascii() && !c.is_ascii_control()).then_some(c as Word);
    }
    if let Some(&(_, code)) = NAMED.iter().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
        return Some(code);
    }
    let n: Word = name.strip_prefix(['F', 'f'])?.parse().ok()?;
    (1..=12).contains(&n).then(|| F1 + n - 1)
}
