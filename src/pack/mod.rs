//! Compact binary encoding for revision bodies.
//!
//! A revision body is a single encoded dictionary. The encoding is a
//! tag/length/value layout designed for lazy access: dictionary entries and
//! array elements carry a byte-length prefix, so a reader can skip to the
//! value it wants without decoding anything else. Dictionary keys are either
//! inline strings or small-integer references into the per-database shared
//! key table, which compresses the keys that repeat across every document.
//!
//! Readers hold an `Arc` of the body bytes; views stay valid for as long as
//! any of them is alive, independent of the revision that produced them.

mod encoder;
mod reader;
mod shared_keys;

pub use encoder::{
    write_array, write_bool, write_dict, write_double, write_float, write_int, write_null,
    write_string,
};
pub use reader::{PackedArray, PackedBody, PackedDict, PackedValue};
pub use shared_keys::SharedKeys;

use thiserror::Error;

/// value tags used by the encoding
pub(crate) mod tag {
    pub const NULL: u8 = 0x00;
    pub const FALSE: u8 = 0x01;
    pub const TRUE: u8 = 0x02;
    pub const INT: u8 = 0x03;
    pub const FLOAT: u8 = 0x04;
    pub const DOUBLE: u8 = 0x05;
    pub const STRING: u8 = 0x06;
    pub const ARRAY: u8 = 0x07;
    pub const DICT: u8 = 0x08;
    /// shared-key reference, valid only in dictionary key position
    pub const KEY_REF: u8 = 0x09;
}

/// errors raised while decoding a body
#[derive(Debug, Error)]
pub enum PackError {
    #[error("unexpected end of encoded data at offset {0}")]
    Truncated(usize),

    #[error("unknown value tag {tag:#04x} at offset {offset}")]
    UnknownTag { tag: u8, offset: usize },

    #[error("varint too long at offset {0}")]
    VarintOverflow(usize),

    #[error("invalid utf-8 in encoded string: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("unresolvable shared key id {0}")]
    UnknownSharedKey(u64),

    #[error("encoded root is not a dictionary")]
    RootNotDict,

    #[error("shared key table mismatch: id {id} is '{existing}' here but '{stored}' in storage")]
    KeyTableMismatch {
        id: usize,
        existing: String,
        stored: String,
    },
}

pub type PackResult<T> = Result<T, PackError>;
