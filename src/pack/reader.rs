//! Lazy readers over an encoded body.
//!
//! `PackedBody` owns the bytes of one revision body; `PackedDict` and
//! `PackedArray` are cheap views into it. Looking up a dictionary key scans
//! the entry list and skips values by their length prefix, decoding only the
//! one that matches. Scalars decode into owned values; containers come back
//! as further views sharing the same body.

use std::sync::Arc;

use crate::pack::encoder::zigzag_decode;
use crate::pack::shared_keys::SharedKeys;
use crate::pack::{tag, PackError, PackResult};

/// One revision body plus the key table needed to decode it.
#[derive(Clone)]
pub struct PackedBody {
    bytes: Arc<Vec<u8>>,
    keys: SharedKeys,
}

impl PackedBody {
    pub fn new(bytes: Vec<u8>, keys: SharedKeys) -> Self {
        Self {
            bytes: Arc::new(bytes),
            keys,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// the root dictionary of the body
    pub fn root(&self) -> PackResult<PackedDict> {
        match self.bytes.first() {
            Some(&t) if t == tag::DICT => Ok(PackedDict {
                body: self.clone(),
                offset: 0,
            }),
            _ => Err(PackError::RootNotDict),
        }
    }
}

/// A decoded leaf or a view of a nested container.
#[derive(Clone)]
pub enum PackedValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f32),
    Double(f64),
    String(String),
    Array(PackedArray),
    Dict(PackedDict),
}

/// View of an encoded dictionary.
#[derive(Clone)]
pub struct PackedDict {
    body: PackedBody,
    offset: usize,
}

impl PackedDict {
    /// number of entries
    pub fn len(&self) -> PackResult<usize> {
        Ok(self.entries_cursor()?.count)
    }

    pub fn is_empty(&self) -> PackResult<bool> {
        Ok(self.len()? == 0)
    }

    /// look up one key, decoding only the matching value
    pub fn get(&self, key: &str) -> PackResult<Option<PackedValue>> {
        let shared_id = self.body.keys.id_of(key).map(u64::from);
        let mut entries = self.entries_cursor()?;
        while let Some((matched, value_offset)) = entries.next_match(key, shared_id)? {
            if matched {
                return value_at(&self.body, value_offset).map(Some);
            }
        }
        Ok(None)
    }

    /// decode every entry; used when iterating the whole dictionary
    pub fn entries(&self) -> PackResult<Vec<(String, PackedValue)>> {
        let mut entries = self.entries_cursor()?;
        let mut out = Vec::with_capacity(entries.count);
        while let Some((key, value_offset)) = entries.next_entry()? {
            out.push((key, value_at(&self.body, value_offset)?));
        }
        Ok(out)
    }

    fn entries_cursor(&self) -> PackResult<DictEntries<'_>> {
        let mut cur = Cursor::new(&self.body.bytes, self.offset);
        let t = cur.u8()?;
        debug_assert_eq!(t, tag::DICT);
        let count = cur.varint()? as usize;
        Ok(DictEntries {
            keys: &self.body.keys,
            cur,
            count,
            seen: 0,
        })
    }
}

struct DictEntries<'a> {
    keys: &'a SharedKeys,
    cur: Cursor<'a>,
    count: usize,
    seen: usize,
}

impl<'a> DictEntries<'a> {
    /// advance one entry, reporting whether its key matches the target
    fn next_match(&mut self, key: &str, shared_id: Option<u64>) -> PackResult<Option<(bool, usize)>> {
        if self.seen == self.count {
            return Ok(None);
        }
        self.seen += 1;
        let ktag = self.cur.u8()?;
        let matched = match ktag {
            tag::KEY_REF => {
                let id = self.cur.varint()?;
                shared_id == Some(id)
            }
            tag::STRING => {
                let len = self.cur.varint()? as usize;
                let bytes = self.cur.take(len)?;
                bytes == key.as_bytes()
            }
            other => {
                return Err(PackError::UnknownTag {
                    tag: other,
                    offset: self.cur.pos - 1,
                })
            }
        };
        let vlen = self.cur.varint()? as usize;
        let value_offset = self.cur.pos;
        self.cur.skip(vlen)?;
        Ok(Some((matched, value_offset)))
    }

    /// advance one entry, decoding its key
    fn next_entry(&mut self) -> PackResult<Option<(String, usize)>> {
        if self.seen == self.count {
            return Ok(None);
        }
        self.seen += 1;
        let ktag = self.cur.u8()?;
        let key = match ktag {
            tag::KEY_REF => {
                let id = self.cur.varint()?;
                let id32 = u32::try_from(id).map_err(|_| PackError::UnknownSharedKey(id))?;
                self.keys
                    .resolve(id32)
                    .ok_or(PackError::UnknownSharedKey(id))?
            }
            tag::STRING => {
                let len = self.cur.varint()? as usize;
                std::str::from_utf8(self.cur.take(len)?)?.to_string()
            }
            other => {
                return Err(PackError::UnknownTag {
                    tag: other,
                    offset: self.cur.pos - 1,
                })
            }
        };
        let vlen = self.cur.varint()? as usize;
        let value_offset = self.cur.pos;
        self.cur.skip(vlen)?;
        Ok(Some((key, value_offset)))
    }
}

/// View of an encoded array.
#[derive(Clone)]
pub struct PackedArray {
    body: PackedBody,
    offset: usize,
}

impl PackedArray {
    pub fn len(&self) -> PackResult<usize> {
        let mut cur = Cursor::new(&self.body.bytes, self.offset);
        cur.u8()?;
        Ok(cur.varint()? as usize)
    }

    pub fn is_empty(&self) -> PackResult<bool> {
        Ok(self.len()? == 0)
    }

    /// element at an index, skipping everything before it
    pub fn get(&self, index: usize) -> PackResult<Option<PackedValue>> {
        let mut cur = Cursor::new(&self.body.bytes, self.offset);
        cur.u8()?;
        let count = cur.varint()? as usize;
        if index >= count {
            return Ok(None);
        }
        for _ in 0..index {
            let len = cur.varint()? as usize;
            cur.skip(len)?;
        }
        cur.varint()?;
        value_at(&self.body, cur.pos).map(Some)
    }

    /// decode all elements
    pub fn items(&self) -> PackResult<Vec<PackedValue>> {
        let mut cur = Cursor::new(&self.body.bytes, self.offset);
        cur.u8()?;
        let count = cur.varint()? as usize;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let len = cur.varint()? as usize;
            out.push(value_at(&self.body, cur.pos)?);
            cur.skip(len)?;
        }
        Ok(out)
    }
}

/// decode the value whose tag byte sits at `offset`
fn value_at(body: &PackedBody, offset: usize) -> PackResult<PackedValue> {
    let mut cur = Cursor::new(&body.bytes, offset);
    let t = cur.u8()?;
    match t {
        tag::NULL => Ok(PackedValue::Null),
        tag::FALSE => Ok(PackedValue::Bool(false)),
        tag::TRUE => Ok(PackedValue::Bool(true)),
        tag::INT => Ok(PackedValue::Int(zigzag_decode(cur.varint()?))),
        tag::FLOAT => {
            let raw: [u8; 4] = cur.take(4)?.try_into().expect("sized take");
            Ok(PackedValue::Float(f32::from_le_bytes(raw)))
        }
        tag::DOUBLE => {
            let raw: [u8; 8] = cur.take(8)?.try_into().expect("sized take");
            Ok(PackedValue::Double(f64::from_le_bytes(raw)))
        }
        tag::STRING => {
            let len = cur.varint()? as usize;
            Ok(PackedValue::String(
                std::str::from_utf8(cur.take(len)?)?.to_string(),
            ))
        }
        tag::ARRAY => Ok(PackedValue::Array(PackedArray {
            body: body.clone(),
            offset,
        })),
        tag::DICT => Ok(PackedValue::Dict(PackedDict {
            body: body.clone(),
            offset,
        })),
        other => Err(PackError::UnknownTag { tag: other, offset }),
    }
}

pub(crate) struct Cursor<'a> {
    buf: &'a [u8],
    pub(crate) pos: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    pub(crate) fn u8(&mut self) -> PackResult<u8> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or(PackError::Truncated(self.pos))?;
        self.pos += 1;
        Ok(b)
    }

    pub(crate) fn take(&mut self, n: usize) -> PackResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .ok_or(PackError::Truncated(self.pos))?;
        if end > self.buf.len() {
            return Err(PackError::Truncated(self.pos));
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn skip(&mut self, n: usize) -> PackResult<()> {
        self.take(n)?;
        Ok(())
    }

    pub(crate) fn varint(&mut self) -> PackResult<u64> {
        let mut result: u64 = 0;
        for shift in 0..10 {
            let byte = self.u8()?;
            result |= u64::from(byte & 0x7f) << (shift * 7);
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
        Err(PackError::VarintOverflow(self.pos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::encoder::*;

    fn encode_person(keys: &SharedKeys) -> Vec<u8> {
        let mut name = Vec::new();
        write_string(&mut name, "Alice");
        let mut age = Vec::new();
        write_int(&mut age, 30);
        let mut score = Vec::new();
        write_double(&mut score, 1.5);
        let mut active = Vec::new();
        write_bool(&mut active, true);

        let mut tag1 = Vec::new();
        write_string(&mut tag1, "a");
        let mut tag2 = Vec::new();
        write_string(&mut tag2, "b");
        let mut tags = Vec::new();
        write_array(&mut tags, &[tag1, tag2]);

        let mut city = Vec::new();
        write_string(&mut city, "Berlin");
        let mut address = Vec::new();
        write_dict(&mut address, &[("city".to_string(), city)], keys);

        let mut out = Vec::new();
        write_dict(
            &mut out,
            &[
                ("active".to_string(), active),
                ("address".to_string(), address),
                ("age".to_string(), age),
                ("name".to_string(), name),
                ("score".to_string(), score),
                ("tags".to_string(), tags),
            ],
            keys,
        );
        out
    }

    #[test]
    fn test_dict_lookup() {
        let keys = SharedKeys::new();
        let body = PackedBody::new(encode_person(&keys), keys);
        let root = body.root().unwrap();

        assert_eq!(root.len().unwrap(), 6);
        assert!(matches!(
            root.get("name").unwrap(),
            Some(PackedValue::String(s)) if s == "Alice"
        ));
        assert!(matches!(root.get("age").unwrap(), Some(PackedValue::Int(30))));
        assert!(matches!(
            root.get("active").unwrap(),
            Some(PackedValue::Bool(true))
        ));
        assert!(root.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_nested_views() {
        let keys = SharedKeys::new();
        let body = PackedBody::new(encode_person(&keys), keys);
        let root = body.root().unwrap();

        let address = match root.get("address").unwrap() {
            Some(PackedValue::Dict(d)) => d,
            _ => panic!("expected dict"),
        };
        assert!(matches!(
            address.get("city").unwrap(),
            Some(PackedValue::String(s)) if s == "Berlin"
        ));

        let tags = match root.get("tags").unwrap() {
            Some(PackedValue::Array(a)) => a,
            _ => panic!("expected array"),
        };
        assert_eq!(tags.len().unwrap(), 2);
        assert!(matches!(
            tags.get(1).unwrap(),
            Some(PackedValue::String(s)) if s == "b"
        ));
        assert!(tags.get(2).unwrap().is_none());
    }

    #[test]
    fn test_entries_resolve_shared_keys() {
        let keys = SharedKeys::new();
        let bytes = encode_person(&keys);

        // decode with a table rebuilt from the persisted snapshot
        let reopened = SharedKeys::new();
        reopened.merge_from(&keys.snapshot()).unwrap();
        let body = PackedBody::new(bytes, reopened);
        let entries = body.root().unwrap().entries().unwrap();
        let names: Vec<&str> = entries.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            names,
            vec!["active", "address", "age", "name", "score", "tags"]
        );
    }

    #[test]
    fn test_empty_body_has_no_root() {
        let body = PackedBody::new(Vec::new(), SharedKeys::new());
        assert!(matches!(body.root(), Err(PackError::RootNotDict)));
    }

    #[test]
    fn test_truncated_body() {
        let keys = SharedKeys::new();
        let mut bytes = encode_person(&keys);
        bytes.truncate(bytes.len() / 2);
        let body = PackedBody::new(bytes, keys);
        // scanning past the cut must error, not panic
        assert!(body.root().unwrap().entries().is_err());
    }
}
