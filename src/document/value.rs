//! Property values.
//!
//! `Value` is the dynamic type a document property can hold. Dates have no
//! encoded type of their own: they are stored as RFC-3339 strings and
//! re-parsed on demand by the typed accessor. Plain maps (`Dict`) exist as
//! an input and interchange form; when one is stored into a container it is
//! converted into a live `Subdocument`.

use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset, SecondsFormat};

use crate::db::Database;
use crate::document::blob::Blob;
use crate::document::errors::{DocumentError, DocumentResult};
use crate::document::subdocument::Subdocument;
use crate::pack::{self, PackedDict, PackedValue, SharedKeys};

/// marker key identifying special encoded dictionaries
pub(crate) const TYPE_KEY: &str = "_cbltype";
/// type marker for blob dictionaries
pub(crate) const BLOB_TYPE: &str = "blob";

/// a keyed map of property values
pub type PropertyMap = BTreeMap<String, Value>;

/// A property value.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f32),
    Double(f64),
    String(String),
    Date(DateTime<FixedOffset>),
    Blob(Blob),
    Array(Vec<Value>),
    Dict(PropertyMap),
    Subdoc(Subdocument),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Double(f) => *f != 0.0,
            _ => false,
        }
    }

    pub fn as_long(&self) -> i64 {
        match self {
            Value::Bool(b) => i64::from(*b),
            Value::Int(i) => *i,
            Value::Float(f) => *f as i64,
            Value::Double(f) => *f as i64,
            _ => 0,
        }
    }

    pub fn as_double(&self) -> f64 {
        match self {
            Value::Bool(b) => f64::from(u8::from(*b)),
            Value::Int(i) => *i as f64,
            Value::Float(f) => f64::from(*f),
            Value::Double(f) => *f,
            _ => 0.0,
        }
    }

    pub fn as_float(&self) -> f32 {
        match self {
            Value::Bool(b) => f32::from(u8::from(*b)),
            Value::Int(i) => *i as f32,
            Value::Float(f) => *f,
            Value::Double(f) => *f as f32,
            _ => 0.0,
        }
    }

    pub fn as_string(&self) -> Option<String> {
        match self {
            Value::String(s) => Some(s.clone()),
            Value::Date(d) => Some(format_date(d)),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<DateTime<FixedOffset>> {
        match self {
            Value::Date(d) => Some(*d),
            Value::String(s) => parse_date(s),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<Blob> {
        match self {
            Value::Blob(b) => Some(b.clone()),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<Vec<Value>> {
        match self {
            Value::Array(items) => Some(items.clone()),
            _ => None,
        }
    }

    pub fn as_subdocument(&self) -> Option<Subdocument> {
        match self {
            Value::Subdoc(sd) => Some(sd.clone()),
            _ => None,
        }
    }
}

/// Equality used by the set() no-op check.
///
/// Scalars compare by value; live containers (subdocuments) compare by
/// identity, so assigning a different instance with equal content is still
/// a mutation. For structural comparison use `content_eq`.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::Blob(a), Value::Blob(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Dict(a), Value::Dict(b)) => a == b,
            (Value::Subdoc(a), Value::Subdoc(b)) => Subdocument::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<DateTime<FixedOffset>> for Value {
    fn from(v: DateTime<FixedOffset>) -> Self {
        Value::Date(v)
    }
}

impl From<Blob> for Value {
    fn from(v: Blob) -> Self {
        Value::Blob(v)
    }
}

impl From<Subdocument> for Value {
    fn from(v: Subdocument) -> Self {
        Value::Subdoc(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

impl From<PropertyMap> for Value {
    fn from(v: PropertyMap) -> Self {
        Value::Dict(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

/// round-trippable date formatting used at the storage boundary
pub(crate) fn format_date(date: &DateTime<FixedOffset>) -> String {
    date.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// parse an RFC-3339 date; None for a non-parseable string
pub(crate) fn parse_date(s: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(s).ok()
}

/// Validate a value before it may be staged.
///
/// The type system already restricts values to the supported set, so this
/// only rejects the structurally unusable ones: empty property keys, and
/// typed dictionaries claiming an unknown type marker.
pub(crate) fn validate_value(value: &Value) -> DocumentResult<()> {
    match value {
        Value::Array(items) => {
            for item in items {
                validate_value(item)?;
            }
            Ok(())
        }
        Value::Dict(map) => {
            if let Some(Value::String(kind)) = map.get(TYPE_KEY) {
                if kind != BLOB_TYPE {
                    return Err(DocumentError::InvalidValue(format!(
                        "unsupported {} '{}'",
                        TYPE_KEY, kind
                    )));
                }
            }
            for (key, item) in map {
                if key.is_empty() {
                    return Err(DocumentError::InvalidValue(
                        "property keys may not be empty".to_string(),
                    ));
                }
                validate_value(item)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// deep copy into a plain tree: live subdocuments become plain maps
pub(crate) fn value_to_plain(value: &Value) -> Value {
    match value {
        Value::Subdoc(sd) => Value::Dict(map_to_plain(&sd.properties())),
        Value::Dict(map) => Value::Dict(map_to_plain(map)),
        Value::Array(items) => Value::Array(items.iter().map(value_to_plain).collect()),
        other => other.clone(),
    }
}

/// deep copy of a map into a plain tree
pub(crate) fn map_to_plain(map: &PropertyMap) -> PropertyMap {
    map.iter()
        .map(|(key, value)| (key.clone(), value_to_plain(value)))
        .collect()
}

/// view a container-like value as a plain map
fn value_as_map(value: &Value) -> Option<PropertyMap> {
    match value {
        Value::Dict(map) => Some(map.clone()),
        Value::Subdoc(sd) => Some(sd.properties()),
        _ => None,
    }
}

/// Structural equality across the value tree.
///
/// Used by merge to decide whether the resolved properties equal the
/// persisted ones. Subdocuments compare as their property maps, dates
/// compare against their string form, blobs compare by digest.
pub(crate) fn content_eq(a: &Value, b: &Value) -> bool {
    if let (Some(ma), Some(mb)) = (value_as_map(a), value_as_map(b)) {
        return map_content_eq(&ma, &mb);
    }
    match (a, b) {
        (Value::Date(d), Value::String(s)) | (Value::String(s), Value::Date(d)) => {
            format_date(d) == *s
        }
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| content_eq(a, b))
        }
        (Value::Blob(x), Value::Blob(y)) => match (x.digest(), y.digest()) {
            (Some(a), Some(b)) => a == b,
            _ => x == y,
        },
        _ => a == b,
    }
}

/// structural equality of two maps; a null value equals an absent key
pub(crate) fn map_content_eq(a: &PropertyMap, b: &PropertyMap) -> bool {
    let keys: std::collections::BTreeSet<&String> = a.keys().chain(b.keys()).collect();
    keys.into_iter().all(|key| {
        let va = a.get(key).unwrap_or(&Value::Null);
        let vb = b.get(key).unwrap_or(&Value::Null);
        content_eq(va, vb)
    })
}

// ==================== Body encoding ====================

/// encode an effective property map as a revision body
pub(crate) fn encode_map(
    map: &PropertyMap,
    keys: &SharedKeys,
    out: &mut Vec<u8>,
) -> DocumentResult<()> {
    let mut entries: Vec<(String, Vec<u8>)> = Vec::with_capacity(map.len());
    for (key, value) in map {
        if value.is_null() {
            continue; // null means removed
        }
        let mut buf = Vec::new();
        encode_value(value, keys, &mut buf)?;
        entries.push((key.clone(), buf));
    }
    pack::write_dict(out, &entries, keys);
    Ok(())
}

fn encode_value(value: &Value, keys: &SharedKeys, out: &mut Vec<u8>) -> DocumentResult<()> {
    match value {
        Value::Null => pack::write_null(out),
        Value::Bool(b) => pack::write_bool(out, *b),
        Value::Int(i) => pack::write_int(out, *i),
        Value::Float(f) => pack::write_float(out, *f),
        Value::Double(f) => pack::write_double(out, *f),
        Value::String(s) => pack::write_string(out, s),
        Value::Date(d) => pack::write_string(out, &format_date(d)),
        Value::Blob(blob) => encode_map(&blob.to_properties()?, keys, out)?,
        Value::Subdoc(sd) => encode_map(&sd.properties(), keys, out)?,
        Value::Dict(map) => encode_map(map, keys, out)?,
        Value::Array(items) => {
            let mut encoded = Vec::with_capacity(items.len());
            for item in items {
                let mut buf = Vec::new();
                encode_value(item, keys, &mut buf)?;
                encoded.push(buf);
            }
            pack::write_array(out, &encoded);
        }
    }
    Ok(())
}

// ==================== Plain decoding ====================

/// whether an encoded dictionary is a persisted blob reference
pub(crate) fn packed_dict_is_blob(dict: &PackedDict) -> bool {
    matches!(dict.get(TYPE_KEY), Ok(Some(PackedValue::String(s))) if s == BLOB_TYPE)
}

/// decode an encoded value into a plain tree (no live containers)
pub(crate) fn decode_packed_plain(
    packed: &PackedValue,
    database: &Option<Database>,
) -> DocumentResult<Value> {
    Ok(match packed {
        PackedValue::Null => Value::Null,
        PackedValue::Bool(b) => Value::Bool(*b),
        PackedValue::Int(i) => Value::Int(*i),
        PackedValue::Float(f) => Value::Float(*f),
        PackedValue::Double(f) => Value::Double(*f),
        PackedValue::String(s) => Value::String(s.clone()),
        PackedValue::Array(arr) => {
            let mut items = Vec::new();
            for item in arr.items()? {
                items.push(decode_packed_plain(&item, database)?);
            }
            Value::Array(items)
        }
        PackedValue::Dict(dict) => {
            if packed_dict_is_blob(dict) {
                Value::Blob(Blob::from_packed(dict, database.clone())?)
            } else {
                let mut map = PropertyMap::new();
                for (key, item) in dict.entries()? {
                    map.insert(key, decode_packed_plain(&item, database)?);
                }
                Value::Dict(map)
            }
        }
    })
}

/// decode a whole encoded dictionary into a plain map
pub(crate) fn decode_dict_plain(
    dict: &PackedDict,
    database: &Option<Database>,
) -> DocumentResult<PropertyMap> {
    let mut map = PropertyMap::new();
    for (key, item) in dict.entries()? {
        map.insert(key, decode_packed_plain(&item, database)?);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_coercions() {
        assert!(Value::Bool(true).as_bool());
        assert!(Value::Int(2).as_bool());
        assert!(!Value::String("true".into()).as_bool());
        assert_eq!(Value::Double(1.9).as_long(), 1);
        assert_eq!(Value::Int(2).as_double(), 2.0);
        assert_eq!(Value::Null.as_long(), 0);
        assert!(Value::Null.as_string().is_none());
    }

    #[test]
    fn test_date_roundtrip() {
        let date = parse_date("2024-03-01T12:30:45.5+02:00").unwrap();
        let formatted = format_date(&date);
        assert_eq!(parse_date(&formatted), Some(date));
        assert_eq!(Value::Date(date).as_string(), Some(formatted));
        assert!(parse_date("not a date").is_none());
    }

    #[test]
    fn test_validate_rejects_bad_shapes() {
        let mut map = PropertyMap::new();
        map.insert(TYPE_KEY.to_string(), Value::String("widget".into()));
        assert!(matches!(
            validate_value(&Value::Dict(map)),
            Err(DocumentError::InvalidValue(_))
        ));

        let mut map = PropertyMap::new();
        map.insert(String::new(), Value::Int(1));
        assert!(validate_value(&Value::Dict(map)).is_err());

        assert!(validate_value(&Value::Array(vec![Value::Int(1), Value::Null])).is_ok());
    }

    #[test]
    fn test_content_eq_null_equals_absent() {
        let mut a = PropertyMap::new();
        a.insert("x".into(), Value::Int(1));
        a.insert("gone".into(), Value::Null);
        let mut b = PropertyMap::new();
        b.insert("x".into(), Value::Int(1));
        assert!(map_content_eq(&a, &b));

        b.insert("x".into(), Value::Int(2));
        assert!(!map_content_eq(&a, &b));
    }
}
