// This module pins down the contract between generated code and the C runtime: the heap
// object layout, the encoding of tagged scalars and the names of the runtime entry points.
// Every heap block is a sequence of 8-byte words: word 0 holds the refcount (an odd tagged
// integer 2n+1, or 0 for static objects that are never released), word 1 holds tag_size_d
// = (tag << 32) | (size << 1) | d where d marks a trailing destructor closure word, and the
// payload follows. Static objects are accumulated here as StaticObject values and rendered
// into the data section by the module driver.

//! Heap object layout and runtime entry points.

use std::fmt;

/// `malloc(size_in_bytes) -> pointer`
pub const MALLOC: &str = "malloc";
/// `increment_value(tagged_value) -> tagged_value`
pub const INCREMENT_VALUE: &str = "increment_value";
/// `decrement_value(tagged_value)`
pub const DECREMENT_VALUE: &str = "decrement_value";
/// `apply_fn(f, x) -> tagged_value`
pub const APPLY_FN: &str = "apply_fn";

/// Runtime symbols every module declares as external.
pub const RUNTIME_SYMBOLS: [&str; 4] = [MALLOC, INCREMENT_VALUE, DECREMENT_VALUE, APPLY_FN];

pub const WORD_SIZE: u32 = 8;
pub const REFCOUNT_WORD: u32 = 0;
pub const TAG_SIZE_WORD: u32 = 1;
pub const PAYLOAD_WORD: u32 = 2;

/// Refcount word of a freshly allocated block holding one reference.
pub const INITIAL_REFCOUNT: i64 = tag_scalar(1);
/// Refcount word of a static block.
pub const STATIC_REFCOUNT: i64 = 0;

/// Kind of a heap block, stored in the upper half of the `tag_size_d` word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockTag {
    Tuple,
    Closure,
    PartialApplication,
    String,
    /// User variant constructor; the raw tag is odd and at least 51.
    Constructor(u32),
}

impl BlockTag {
    pub const FIRST_CONSTRUCTOR: u32 = 51;

    pub fn raw(self) -> u32 {
        match self {
            BlockTag::Tuple => 0,
            BlockTag::Closure => 1,
            BlockTag::PartialApplication => 2,
            BlockTag::String => 3,
            BlockTag::Constructor(tag) => tag,
        }
    }

    /// Tag of the `index`-th user constructor.
    pub fn constructor(index: u32) -> Self {
        BlockTag::Constructor(Self::FIRST_CONSTRUCTOR + 2 * index)
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(BlockTag::Tuple),
            1 => Some(BlockTag::Closure),
            2 => Some(BlockTag::PartialApplication),
            3 => Some(BlockTag::String),
            t if t >= Self::FIRST_CONSTRUCTOR && t % 2 == 1 => Some(BlockTag::Constructor(t)),
            _ => None,
        }
    }
}

/// Encodes the second header word.
///
/// `size` counts payload words, excluding both header words and the
/// destructor word.
pub const fn tag_size_d(tag: u32, size: u32, has_destructor: bool) -> i64 {
    ((tag as i64) << 32) | ((size as i64) << 1) | (has_destructor as i64)
}

/// Splits a `tag_size_d` word back into `(tag, size, has_destructor)`.
pub const fn decode_tag_size_d(word: i64) -> (u32, u32, bool) {
    let tag = (word >> 32) as u32;
    let size = ((word & 0xffff_ffff) >> 1) as u32;
    (tag, size, word & 1 == 1)
}

/// Tagged representation of a scalar.
pub const fn tag_scalar(n: i64) -> i64 {
    (n << 1) | 1
}

pub const fn untag_scalar(value: i64) -> i64 {
    value >> 1
}

pub const fn is_scalar(value: i64) -> bool {
    value & 1 == 1
}

/// Number of words a block with `size` payload words occupies.
pub const fn block_words(size: u32, has_destructor: bool) -> u32 {
    PAYLOAD_WORD + size + has_destructor as u32
}

/// One word of a static object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaticWord {
    Scalar(i64),
    Symbol(String),
}

/// Immutable block emitted into the data section with a zero refcount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticObject {
    pub name: String,
    pub tag: BlockTag,
    pub fields: Vec<StaticWord>,
}

impl StaticObject {
    /// Header plus payload, in memory order.
    pub fn words(&self) -> Vec<StaticWord> {
        let mut words = Vec::with_capacity(self.fields.len() + 2);
        words.push(StaticWord::Scalar(STATIC_REFCOUNT));
        words.push(StaticWord::Scalar(tag_size_d(
            self.tag.raw(),
            self.fields.len() as u32,
            false,
        )));
        words.extend(self.fields.iter().cloned());
        words
    }
}

impl fmt::Display for StaticObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "    align 8")?;
        writeln!(f, "{}:", self.name)?;
        for word in self.words() {
            match word {
                StaticWord::Scalar(value) => writeln!(f, "    dq {value}")?,
                StaticWord::Symbol(symbol) => writeln!(f, "    dq {symbol}")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_size_d_round_trip() {
        let word = tag_size_d(BlockTag::Closure.raw(), 3, true);
        assert_eq!(word, (1 << 32) | (3 << 1) | 1);
        assert_eq!(decode_tag_size_d(word), (1, 3, true));
    }

    #[test]
    fn test_scalar_tagging() {
        assert_eq!(tag_scalar(0), 1);
        assert_eq!(tag_scalar(21), 43);
        assert_eq!(untag_scalar(tag_scalar(-7)), -7);
        assert!(is_scalar(INITIAL_REFCOUNT));
        assert!(!is_scalar(0x1000));
    }

    #[test]
    fn test_constructor_tags_are_odd() {
        assert_eq!(BlockTag::constructor(0).raw(), 51);
        assert_eq!(BlockTag::constructor(2).raw(), 55);
        assert_eq!(BlockTag::from_raw(53), Some(BlockTag::Constructor(53)));
        assert_eq!(BlockTag::from_raw(52), None);
    }

    #[test]
    fn test_static_object_layout() {
        let object = StaticObject {
            name: "hello".to_string(),
            tag: BlockTag::String,
            fields: vec![StaticWord::Scalar(0x6f6c6c6568)],
        };
        let text = object.to_string();
        assert!(text.contains("hello:"));
        assert!(text.contains("    dq 0\n"));
        assert!(text.contains(&format!("    dq {}", tag_size_d(3, 1, false))));
    }
}
