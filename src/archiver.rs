//! The archiver codec boundary: encodes call arguments and decodes replies
//! without the instruments RPC layer ever interpreting their contents.

use indexmap::IndexMap;

use crate::error::Result;

/// A value crossing the archiver boundary. Covers everything the instruments
/// services pass: signed integers, floats, byte strings, text, booleans,
/// arrays, string-keyed dictionaries, and an opaque null.
#[derive(Debug, Clone, PartialEq)]
pub enum ArchivedValue {
    Int(i64),
    Float(f64),
    Bytes(Vec<u8>),
    Str(String),
    Bool(bool),
    Array(Vec<ArchivedValue>),
    Dict(IndexMap<String, ArchivedValue>),
    Null,
}

/// Encodes/decodes [`ArchivedValue`]s to and from the wire format a service
/// expects. The instruments RPC layer only routes these bytes; it never
/// inspects them.
pub trait Archiver {
    fn encode(&self, value: &ArchivedValue) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<ArchivedValue>;
}

/// The default codec: NSKeyedArchive, the format every instruments service in
/// the wild actually speaks.
#[derive(Debug, Default, Clone, Copy)]
pub struct NsKeyedArchiver;

impl Archiver for NsKeyedArchiver {
    fn encode(&self, value: &ArchivedValue) -> Result<Vec<u8>> {
        Ok(ns_keyed_archive::encode::encode_to_bytes(to_plist(value))?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<ArchivedValue> {
        Ok(from_plist(ns_keyed_archive::decode::from_bytes(bytes)?))
    }
}

fn to_plist(value: &ArchivedValue) -> plist::Value {
    match value {
        ArchivedValue::Int(i) => plist::Value::Integer((*i).into()),
        ArchivedValue::Float(f) => plist::Value::Real(*f),
        ArchivedValue::Bytes(b) => plist::Value::Data(b.clone()),
        ArchivedValue::Str(s) => plist::Value::String(s.clone()),
        ArchivedValue::Bool(b) => plist::Value::Boolean(*b),
        ArchivedValue::Array(values) => plist::Value::Array(values.iter().map(to_plist).collect()),
        ArchivedValue::Dict(map) => {
            let mut dict = plist::Dictionary::new();
            for (k, v) in map {
                dict.insert(k.clone(), to_plist(v));
            }
            plist::Value::Dictionary(dict)
        }
        ArchivedValue::Null => plist::Value::String(String::new()),
    }
}

fn from_plist(value: plist::Value) -> ArchivedValue {
    match value {
        plist::Value::Integer(i) => ArchivedValue::Int(i.as_signed().unwrap_or_default()),
        plist::Value::Real(f) => ArchivedValue::Float(f),
        plist::Value::Data(b) => ArchivedValue::Bytes(b),
        plist::Value::String(s) => ArchivedValue::Str(s),
        plist::Value::Boolean(b) => ArchivedValue::Bool(b),
        plist::Value::Array(values) => ArchivedValue::Array(values.into_iter().map(from_plist).collect()),
        plist::Value::Dictionary(dict) => {
            let mut map = IndexMap::new();
            for (k, v) in dict {
                map.insert(k, from_plist(v));
            }
            ArchivedValue::Dict(map)
        }
        _ => ArchivedValue::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_mixed_dictionary() {
        let mut dict = IndexMap::new();
        dict.insert("count".to_string(), ArchivedValue::Int(7));
        dict.insert("name".to_string(), ArchivedValue::Str("cpu".to_string()));
        dict.insert(
            "samples".to_string(),
            ArchivedValue::Array(vec![ArchivedValue::Float(1.5), ArchivedValue::Float(2.5)]),
        );
        let value = ArchivedValue::Dict(dict);

        let codec = NsKeyedArchiver;
        let encoded = codec.encode(&value).expect("encode");
        let decoded = codec.decode(&encoded).expect("decode");
        assert_eq!(decoded, value);
    }
}
