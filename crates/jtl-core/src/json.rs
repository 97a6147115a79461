use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use std::rc::Rc;

/// Engine value type. Copy-on-write: `Str`, `Array` and `Object` share their
/// payload behind `Rc` and clone cheaply; mutation goes through `Rc::make_mut`.
///
/// `Int` and `Float` are distinct variants but compare equal when numerically
/// equal, so `3` and `3.0` are the same value to the language.
#[derive(Debug, Clone)]
pub enum JsonValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    Array(Rc<Vec<JsonValue>>),
    Object(Rc<BTreeMap<String, JsonValue>>),
}

/// The six JSON types, as seen by `is`/`isnt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonType {
    Null,
    Boolean,
    Number,
    String,
    Array,
    Object,
}

impl JsonType {
    pub fn by_name(name: &str) -> Option<JsonType> {
        match name {
            "null" => Some(JsonType::Null),
            "boolean" | "bool" => Some(JsonType::Boolean),
            "number" => Some(JsonType::Number),
            "string" => Some(JsonType::String),
            "array" => Some(JsonType::Array),
            "object" => Some(JsonType::Object),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            JsonType::Null => "null",
            JsonType::Boolean => "boolean",
            JsonType::Number => "number",
            JsonType::String => "string",
            JsonType::Array => "array",
            JsonType::Object => "object",
        }
    }
}

impl std::fmt::Display for JsonType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl JsonValue {
    pub fn string(s: impl AsRef<str>) -> JsonValue {
        JsonValue::Str(Rc::from(s.as_ref()))
    }

    pub fn array() -> JsonValue {
        JsonValue::Array(Rc::new(Vec::new()))
    }

    pub fn object() -> JsonValue {
        JsonValue::Object(Rc::new(BTreeMap::new()))
    }

    pub fn json_type(&self) -> JsonType {
        match self {
            JsonValue::Null => JsonType::Null,
            JsonValue::Bool(_) => JsonType::Boolean,
            JsonValue::Int(_) | JsonValue::Float(_) => JsonType::Number,
            JsonValue::Str(_) => JsonType::String,
            JsonValue::Array(_) => JsonType::Array,
            JsonValue::Object(_) => JsonType::Object,
        }
    }

    #[inline]
    pub fn is_number(&self) -> bool {
        matches!(self, JsonValue::Int(_) | JsonValue::Float(_))
    }

    #[inline]
    pub fn is_string(&self) -> bool {
        matches!(self, JsonValue::Str(_))
    }

    #[inline]
    pub fn is_array(&self) -> bool {
        matches!(self, JsonValue::Array(_))
    }

    #[inline]
    pub fn is_object(&self) -> bool {
        matches!(self, JsonValue::Object(_))
    }

    /// Truthiness: `false`, `null`, `0`, and empty strings/arrays/objects are
    /// falsy, everything else is truthy.
    #[inline]
    pub fn is_truthy(&self) -> bool {
        match self {
            JsonValue::Null => false,
            JsonValue::Bool(b) => *b,
            JsonValue::Int(n) => *n != 0,
            JsonValue::Float(f) => *f != 0.0,
            JsonValue::Str(s) => !s.is_empty(),
            JsonValue::Array(a) => !a.is_empty(),
            JsonValue::Object(o) => !o.is_empty(),
        }
    }

    #[inline]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            JsonValue::Int(n) => Some(*n),
            JsonValue::Float(f) => Some(*f as i64),
            _ => None,
        }
    }

    #[inline]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            JsonValue::Int(n) => Some(*n as f64),
            JsonValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            JsonValue::Str(s) => Some(s.as_ref()),
            _ => None,
        }
    }

    /// Element/member count of strings and constructs; `None` for primitives.
    pub fn length(&self) -> Option<usize> {
        match self {
            JsonValue::Str(s) => Some(s.chars().count()),
            JsonValue::Array(a) => Some(a.len()),
            JsonValue::Object(o) => Some(o.len()),
            _ => None,
        }
    }

    /// Plain-text rendering used by stringification and string concatenation.
    /// Primitives render bare (no quotes); constructs render as JSON.
    pub fn display_string(&self) -> String {
        match self {
            JsonValue::Null => "null".to_string(),
            JsonValue::Bool(b) => b.to_string(),
            JsonValue::Int(n) => n.to_string(),
            JsonValue::Float(f) => format_f64(*f),
            JsonValue::Str(s) => s.to_string(),
            JsonValue::Array(_) | JsonValue::Object(_) => Value::from(self.clone()).to_string(),
        }
    }

    /// Structural copy that detaches all shared `Rc`s.
    pub fn deep_copy(&self) -> JsonValue {
        match self {
            JsonValue::Str(s) => JsonValue::Str(Rc::from(s.as_ref())),
            JsonValue::Array(a) => {
                JsonValue::Array(Rc::new(a.iter().map(JsonValue::deep_copy).collect()))
            }
            JsonValue::Object(o) => JsonValue::Object(Rc::new(
                o.iter().map(|(k, v)| (k.clone(), v.deep_copy())).collect(),
            )),
            other => other.clone(),
        }
    }
}

impl PartialEq for JsonValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (JsonValue::Null, JsonValue::Null) => true,
            (JsonValue::Bool(a), JsonValue::Bool(b)) => a == b,
            (JsonValue::Int(a), JsonValue::Int(b)) => a == b,
            (JsonValue::Float(a), JsonValue::Float(b)) => a == b,
            (JsonValue::Int(a), JsonValue::Float(b)) => (*a as f64) == *b,
            (JsonValue::Float(a), JsonValue::Int(b)) => *a == (*b as f64),
            (JsonValue::Str(a), JsonValue::Str(b)) => a == b,
            (JsonValue::Array(a), JsonValue::Array(b)) => a == b,
            (JsonValue::Object(a), JsonValue::Object(b)) => a == b,
            _ => false,
        }
    }
}

pub(crate) fn format_f64(f: f64) -> String {
    if f.fract() == 0.0 && f.is_finite() {
        format!("{:.0}", f)
    } else {
        f.to_string()
    }
}

impl From<Value> for JsonValue {
    fn from(v: Value) -> Self {
        match v {
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    JsonValue::Int(i)
                } else {
                    JsonValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => JsonValue::Str(Rc::from(s.as_str())),
            Value::Array(a) => {
                JsonValue::Array(Rc::new(a.into_iter().map(JsonValue::from).collect()))
            }
            Value::Object(o) => JsonValue::Object(Rc::new(
                o.into_iter().map(|(k, v)| (k, JsonValue::from(v))).collect(),
            )),
        }
    }
}

impl From<&Value> for JsonValue {
    fn from(v: &Value) -> Self {
        JsonValue::from(v.clone())
    }
}

impl From<JsonValue> for Value {
    fn from(v: JsonValue) -> Self {
        match v {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(b),
            JsonValue::Int(n) => Value::Number(Number::from(n)),
            JsonValue::Float(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
            JsonValue::Str(s) => Value::String(s.to_string()),
            JsonValue::Array(a) => Value::Array(
                a.iter().map(|v| Value::from(v.clone())).collect(),
            ),
            JsonValue::Object(o) => {
                let mut map = Map::new();
                for (k, v) in o.iter() {
                    map.insert(k.clone(), Value::from(v.clone()));
                }
                Value::Object(map)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_numeric_equality_across_split() {
        assert_eq!(JsonValue::Int(3), JsonValue::Float(3.0));
        assert_ne!(JsonValue::Int(3), JsonValue::Float(3.5));
    }

    #[test]
    fn test_truthiness() {
        assert!(!JsonValue::Null.is_truthy());
        assert!(!JsonValue::Int(0).is_truthy());
        assert!(!JsonValue::string("").is_truthy());
        assert!(JsonValue::string("x").is_truthy());
        assert!(JsonValue::Float(0.5).is_truthy());
        assert!(!JsonValue::array().is_truthy());
    }

    #[test]
    fn test_serde_round_trip() {
        let v = json!({"a": 1, "b": [true, null, "s"], "c": 2.5});
        let j = JsonValue::from(v.clone());
        assert_eq!(Value::from(j), v);
    }

    #[test]
    fn test_display_string() {
        assert_eq!(JsonValue::Float(2.0).display_string(), "2");
        assert_eq!(JsonValue::string("hi").display_string(), "hi");
        assert_eq!(
            JsonValue::from(json!([1, 2])).display_string(),
            "[1,2]"
        );
    }

    #[test]
    fn test_deep_copy_detaches() {
        let a = JsonValue::from(json!([1, [2]]));
        let b = a.deep_copy();
        assert_eq!(a, b);
        if let (JsonValue::Array(x), JsonValue::Array(y)) = (&a, &b) {
            assert!(!Rc::ptr_eq(x, y));
        } else {
            panic!("expected arrays");
        }
    }
}
