//! AMF0 value types
//!
//! A tagged union over the AMF0 markers RTMP commands use, plus
//! [`Amf0Object`], the insertion-ordered property map backing objects and
//! ECMA arrays. AMF object fields are order-significant on the wire, so a
//! hash map would scramble re-encoded commands; properties live in a Vec
//! and duplicate keys overwrite in place (last write wins).

/// Unified AMF0 value representation
#[derive(Debug, Clone, PartialEq)]
pub enum AmfValue {
    /// IEEE 754 double-precision floating point (marker 0x00)
    Number(f64),

    /// Boolean value (marker 0x01)
    Boolean(bool),

    /// UTF-8 string, short (0x02) or long (0x0C) form chosen by length
    String(String),

    /// Key-value object (marker 0x03)
    Object(Amf0Object),

    /// Null value (marker 0x05)
    Null,

    /// Undefined value (marker 0x06)
    Undefined,

    /// ECMA array: associative array with a count hint (marker 0x08)
    EcmaArray(Amf0Object),

    /// Strict (dense) array (marker 0x0A)
    StrictArray(Vec<AmfValue>),

    /// Date as milliseconds since Unix epoch + timezone offset (marker 0x0B)
    Date { timestamp: f64, timezone: i16 },
}

impl AmfValue {
    /// Try to get this value as a string reference
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AmfValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get this value as a number
    pub fn as_number(&self) -> Option<f64> {
        match self {
            AmfValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Try to get this value as a boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AmfValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Try to get this value as an object reference (objects and ECMA arrays)
    pub fn as_object(&self) -> Option<&Amf0Object> {
        match self {
            AmfValue::Object(o) | AmfValue::EcmaArray(o) => Some(o),
            _ => None,
        }
    }

    /// Check if this value is null or undefined
    pub fn is_null_or_undefined(&self) -> bool {
        matches!(self, AmfValue::Null | AmfValue::Undefined)
    }

    /// Get a property from an object value
    pub fn get(&self, key: &str) -> Option<&AmfValue> {
        self.as_object()?.get(key)
    }

    /// Get a string property from an object value
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key)?.as_str()
    }

    /// Get a number property from an object value
    pub fn get_number(&self, key: &str) -> Option<f64> {
        self.get(key)?.as_number()
    }
}

impl Default for AmfValue {
    fn default() -> Self {
        AmfValue::Null
    }
}

impl From<bool> for AmfValue {
    fn from(v: bool) -> Self {
        AmfValue::Boolean(v)
    }
}

impl From<f64> for AmfValue {
    fn from(v: f64) -> Self {
        AmfValue::Number(v)
    }
}

impl From<i32> for AmfValue {
    fn from(v: i32) -> Self {
        AmfValue::Number(v as f64)
    }
}

impl From<u32> for AmfValue {
    fn from(v: u32) -> Self {
        AmfValue::Number(v as f64)
    }
}

impl From<String> for AmfValue {
    fn from(v: String) -> Self {
        AmfValue::String(v)
    }
}

impl From<&str> for AmfValue {
    fn from(v: &str) -> Self {
        AmfValue::String(v.to_string())
    }
}

impl From<Amf0Object> for AmfValue {
    fn from(v: Amf0Object) -> Self {
        AmfValue::Object(v)
    }
}

/// Insertion-ordered AMF0 property map
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Amf0Object {
    properties: Vec<(String, AmfValue)>,
}

impl Amf0Object {
    /// Create an empty object
    pub fn new() -> Self {
        Self { properties: Vec::new() }
    }

    /// Number of properties
    pub fn len(&self) -> usize {
        self.properties.len()
    }

    /// True when the object has no properties
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// Set a property; an existing key is overwritten in place
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<AmfValue>) {
        let key = key.into();
        let value = value.into();
        if let Some(slot) = self.properties.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.properties.push((key, value));
        }
    }

    /// Get a property by name
    pub fn get(&self, key: &str) -> Option<&AmfValue> {
        self.properties.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Get a string property by name
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key)?.as_str()
    }

    /// Get a number property by name
    pub fn get_number(&self, key: &str) -> Option<f64> {
        self.get(key)?.as_number()
    }

    /// Iterate properties in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &AmfValue)> {
        self.properties.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl FromIterator<(String, AmfValue)> for Amf0Object {
    fn from_iter<T: IntoIterator<Item = (String, AmfValue)>>(iter: T) -> Self {
        let mut obj = Amf0Object::new();
        for (k, v) in iter {
            obj.set(k, v);
        }
        obj
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_accessors() {
        let s = AmfValue::String("test".into());
        assert_eq!(s.as_str(), Some("test"));
        assert_eq!(s.as_number(), None);

        let n = AmfValue::Number(42.0);
        assert_eq!(n.as_number(), Some(42.0));
        assert_eq!(n.as_str(), None);

        let mut obj = Amf0Object::new();
        obj.set("key", "value");
        let o = AmfValue::Object(obj);
        assert_eq!(o.get_str("key"), Some("value"));
        assert_eq!(o.get_number("missing"), None);
    }

    #[test]
    fn test_object_preserves_insertion_order() {
        let mut obj = Amf0Object::new();
        obj.set("zulu", 1.0);
        obj.set("alpha", 2.0);
        obj.set("mike", 3.0);

        let keys: Vec<&str> = obj.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["zulu", "alpha", "mike"]);
    }

    #[test]
    fn test_object_duplicate_key_last_wins() {
        let mut obj = Amf0Object::new();
        obj.set("app", "live");
        obj.set("tcUrl", "rtmp://host/live");
        obj.set("app", "vod");

        assert_eq!(obj.len(), 2);
        assert_eq!(obj.get_str("app"), Some("vod"));
        // overwrite must not move the key to the back
        let keys: Vec<&str> = obj.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["app", "tcUrl"]);
    }

    #[test]
    fn test_from_conversions() {
        let v: AmfValue = "test".into();
        assert!(matches!(v, AmfValue::String(_)));

        let v: AmfValue = 42.0.into();
        assert!(matches!(v, AmfValue::Number(_)));

        let v: AmfValue = true.into();
        assert!(matches!(v, AmfValue::Boolean(true)));
    }
}
