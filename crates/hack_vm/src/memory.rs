//! Word-addressed RAM of the Hack platform with its fixed memory map.
//!
//! ```text
//!     0..=4      SP, LCL, ARG, THIS, THAT
//!     5..=12     temp segment
//!    13..=15     general purpose registers
//!    16..=255    static variables
//!   256..=2047   stack
//!  2048..=16383  heap
//! 16384..=24575  screen (512 x 256, one bit per pixel)
//!        24576   keyboard
//! ```

use crate::error::{Result, RuntimeError};

/// A register/memory-cell value: 16-bit two's complement.
pub type Word = i16;

pub const SP: usize = 0;
pub const LCL: usize = 1;
pub const ARG: usize = 2;
pub const THIS: usize = 3;
pub const THAT: usize = 4;

pub const TEMP_BASE: usize = 5;
pub const TEMP_SIZE: usize = 8;
pub const STATIC_BASE: usize = 16;
pub const STATIC_SIZE: usize = 240;
pub const STACK_BASE: usize = 256;
pub const HEAP_BASE: usize = 2048;

pub const BITS_PER_WORD: usize = 16;
pub const SCREEN_WIDTH: usize = 512;
pub const SCREEN_HEIGHT: usize = 256;
pub const SCREEN_WORDS_PER_ROW: usize = SCREEN_WIDTH / BITS_PER_WORD;
pub const SCREEN_OFFSET: usize = 16384;
pub const SCREEN_SIZE: usize = SCREEN_WORDS_PER_ROW * SCREEN_HEIGHT;
pub const KEYBOARD_OFFSET: usize = SCREEN_OFFSET + SCREEN_SIZE;
pub const MEMORY_SIZE: usize = KEYBOARD_OFFSET + 1;

pub struct Memory {
    words: Vec<Word>,
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

impl Memory {
    pub fn new() -> Self {
        Self {
            words: vec![0; MEMORY_SIZE],
        }
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Zeroes every cell, including screen and keyboard.
    pub fn clear(&mut self) {
        self.words.fill(0);
    }

    fn index(&self, address: i32) -> Result<usize> {
        usize::try_from(address)
            .ok()
            .filter(|&a| a < self.words.len())
            .ok_or(RuntimeError::OutOfBounds(address))
    }

    pub fn read(&self, address: i32) -> Result<Word> {
        let a = self.index(address)?;
        Ok(self.words[a])
    }

    pub fn write(&mut self, address: i32, value: Word) -> Result<()> {
        let a = self.index(address)?;
        self.words[a] = value;
        Ok(())
    }

    /// Fails unless `address` can be written; nothing is modified.
    pub fn check(&self, address: i32) -> Result<()> {
        self.index(address).map(|_| ())
    }

    pub fn range(&self, start: i32, len: usize) -> Result<&[Word]> {
        let from = self.index(start)?;
        let end = from
            .checked_add(len)
            .filter(|&e| e <= self.words.len())
            .ok_or(RuntimeError::OutOfBounds(self.words.len() as i32))?;
        Ok(&self.words[from..end])
    }

    /// Value of one of the pointer registers (`SP`, `LCL`, ...), widened for address math.
    pub fn pointer(&self, register: usize) -> i32 {
        self.words[register] as i32
    }

    pub fn set_pointer(&mut self, register: usize, value: i32) {
        self.words[register] = value as Word;
    }

    pub fn screen(&self) -> &[Word] {
        &self.words[SCREEN_OFFSET..SCREEN_OFFSET + SCREEN_SIZE]
    }

    /// Whether pixel `(x, y)` is set; the least significant bit of a word is its leftmost pixel.
    pub fn pixel(&self, x: usize, y: usize) -> Option<bool> {
        if x >= SCREEN_WIDTH || y >= SCREEN_HEIGHT {
            return None;
        }
        let word = self.words[SCREEN_OFFSET + y * SCREEN_WORDS_PER_ROW + x / BITS_PER_WORD];
        Some((word as u16 >> (x % BITS_PER_WORD)) & 1 == 1)
    }

    pub fn keyboard(&self) -> Word {
        self.words[KEYBOARD_OFFSET]
    }

    pub fn set_keyboard(&mut self, key: Word) {
        self.words[KEYBOARD_OFFSET] = key;
    }

    /// BLAKE3 of all cells (big-endian words), hex encoded.
    pub fn digest(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for w in &self.words {
            hasher.update(&w.to_be_bytes());
        }
        hex::encode(hasher.finalize().as_bytes())
    }
}
