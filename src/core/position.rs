// Log position packed as `term << 32 | offset`; ordering follows `(term, offset)`.
use std::fmt;

#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Position(u64);

impl Position {
    pub const ZERO: Position = Position(0);

    pub fn new(term: u32, offset: u32) -> Self {
        Self(((term as u64) << 32) | offset as u64)
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }

    pub fn term(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Byte offset within the partition holding this position's term.
    pub fn offset(self) -> usize {
        (self.0 & 0xFFFF_FFFF) as usize
    }

    pub fn partition_index(self, partition_count: usize) -> usize {
        self.term() as usize % partition_count
    }

    pub fn generation(self, partition_count: usize) -> u32 {
        self.term() / partition_count as u32
    }

    /// First position of the following term.
    pub fn next_term(self) -> Self {
        Self::new(self.term().wrapping_add(1), 0)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.term(), self.offset())
    }
}
