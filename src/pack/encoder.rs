//! Body encoder primitives.
//!
//! Values are encoded bottom-up: containers take their children as already
//! encoded byte strings and prefix each with its length, which is what makes
//! the reader's skip-scanning work. The caller drives the recursion (the
//! document layer knows how to flatten its value tree); this module only
//! knows the wire layout.

use crate::pack::shared_keys::SharedKeys;
use crate::pack::tag;

/// LEB128 unsigned varint
pub(crate) fn write_varint(out: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

pub(crate) fn zigzag_encode(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

pub(crate) fn zigzag_decode(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

pub fn write_null(out: &mut Vec<u8>) {
    out.push(tag::NULL);
}

pub fn write_bool(out: &mut Vec<u8>, b: bool) {
    out.push(if b { tag::TRUE } else { tag::FALSE });
}

pub fn write_int(out: &mut Vec<u8>, i: i64) {
    out.push(tag::INT);
    write_varint(out, zigzag_encode(i));
}

pub fn write_float(out: &mut Vec<u8>, f: f32) {
    out.push(tag::FLOAT);
    out.extend_from_slice(&f.to_le_bytes());
}

pub fn write_double(out: &mut Vec<u8>, f: f64) {
    out.push(tag::DOUBLE);
    out.extend_from_slice(&f.to_le_bytes());
}

pub fn write_string(out: &mut Vec<u8>, s: &str) {
    out.push(tag::STRING);
    write_varint(out, s.len() as u64);
    out.extend_from_slice(s.as_bytes());
}

/// write an array from pre-encoded elements
pub fn write_array(out: &mut Vec<u8>, items: &[Vec<u8>]) {
    out.push(tag::ARRAY);
    write_varint(out, items.len() as u64);
    for item in items {
        write_varint(out, item.len() as u64);
        out.extend_from_slice(item);
    }
}

/// Write a dictionary from pre-encoded values.
///
/// Keys are interned into the shared table when eligible and written as
/// integer references; everything else goes inline.
pub fn write_dict(out: &mut Vec<u8>, entries: &[(String, Vec<u8>)], keys: &SharedKeys) {
    out.push(tag::DICT);
    write_varint(out, entries.len() as u64);
    for (key, value) in entries {
        match keys.intern(key) {
            Some(id) => {
                out.push(tag::KEY_REF);
                write_varint(out, u64::from(id));
            }
            None => write_string(out, key),
        }
        write_varint(out, value.len() as u64);
        out.extend_from_slice(value);
    }
}
