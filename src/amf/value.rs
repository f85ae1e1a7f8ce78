//! AMF value types

use std::fmt;

/// An anonymous ActionScript object: an ordered mapping from UTF-8 keys
/// to values.
///
/// Insertion order is preserved and is the order keys serialize in,
/// which matters for interoperability with reference servers (FMS
/// compares some command objects structurally). Lookups are linear;
/// command objects carry a handful of keys at most.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AmfObject {
    entries: Vec<(String, AmfValue)>,
}

impl AmfObject {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Insert a key/value pair. An existing key keeps its position and
    /// has its value replaced.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<AmfValue>) {
        let key = key.into();
        let value = value.into();
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    /// Builder-style insert for literal object construction.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<AmfValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&AmfValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &AmfValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl<K: Into<String>, V: Into<AmfValue>> FromIterator<(K, V)> for AmfObject {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut obj = AmfObject::new();
        for (k, v) in iter {
            obj.insert(k, v);
        }
        obj
    }
}

/// An AMF0 value from the supported subset.
///
/// Short and long strings share the `String` variant; the encoder picks
/// the marker from the UTF-8 byte length. An `EcmaArray` is an object
/// plus an advertised associative count that is carried verbatim and
/// never validated against the entry count (servers routinely lie).
#[derive(Debug, Clone, PartialEq)]
pub enum AmfValue {
    /// IEEE 754 double (AMF0 marker 0x00)
    Number(f64),
    /// Boolean (0x01)
    Boolean(bool),
    /// UTF-8 string, short (0x02) or long (0x0C) on the wire
    String(String),
    /// Anonymous object (0x03)
    Object(AmfObject),
    /// ECMA array (0x08)
    EcmaArray {
        associative_count: u32,
        entries: AmfObject,
    },
    /// Null (0x05)
    Null,
    /// Undefined (0x06)
    Undefined,
}

impl AmfValue {
    /// View this value as a string regardless of which wire form it
    /// came from.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AmfValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            AmfValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AmfValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// View the property map of an object or ECMA array.
    pub fn as_object(&self) -> Option<&AmfObject> {
        match self {
            AmfValue::Object(o) => Some(o),
            AmfValue::EcmaArray { entries, .. } => Some(entries),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, AmfValue::Null)
    }

    /// Get a property from an object value.
    pub fn get(&self, key: &str) -> Option<&AmfValue> {
        self.as_object()?.get(key)
    }
}

impl fmt::Display for AmfValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AmfValue::Number(n) => write!(f, "{}", n),
            AmfValue::Boolean(b) => write!(f, "{}", b),
            AmfValue::String(s) => write!(f, "\"{}\"", s),
            AmfValue::Object(o) => {
                write!(f, "{{")?;
                for (i, (k, v)) in o.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            AmfValue::EcmaArray { associative_count, entries } => {
                write!(f, "EcmaArray({}) {}", associative_count, AmfValue::Object(entries.clone()))
            }
            AmfValue::Null => write!(f, "null"),
            AmfValue::Undefined => write!(f, "undefined"),
        }
    }
}

impl From<f64> for AmfValue {
    fn from(v: f64) -> Self {
        AmfValue::Number(v)
    }
}

impl From<u32> for AmfValue {
    fn from(v: u32) -> Self {
        AmfValue::Number(v as f64)
    }
}

impl From<bool> for AmfValue {
    fn from(v: bool) -> Self {
        AmfValue::Boolean(v)
    }
}

impl From<&str> for AmfValue {
    fn from(v: &str) -> Self {
        AmfValue::String(v.to_string())
    }
}

impl From<String> for AmfValue {
    fn from(v: String) -> Self {
        AmfValue::String(v)
    }
}

impl From<AmfObject> for AmfValue {
    fn from(v: AmfObject) -> Self {
        AmfValue::Object(v)
    }
}
