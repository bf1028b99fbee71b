//! Script value model.
//!
//! [`ScriptValue`] is the bridge's view of an engine value. Objects keep
//! property insertion order the way script objects do, which makes dictionary
//! marshaling deterministic.

use crate::natives::NativeFn;
use std::fmt;

/// Identifier of a script-defined function held by the engine
pub type ScriptFnId = u32;

/// Something script code can invoke
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Callable {
    /// Function defined in script, resolved by the engine
    Script(ScriptFnId),
    /// Native function implemented by the bridge
    Native(NativeFn),
}

/// Kind of a script value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// `undefined`
    Undefined,
    /// `null`
    Null,
    /// Boolean
    Bool,
    /// Number
    Number,
    /// String
    String,
    /// Raw byte buffer
    Buffer,
    /// Array
    Array,
    /// Plain object
    Object,
    /// Function
    Function,
}

/// Script value
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ScriptValue {
    /// Undefined value
    #[default]
    Undefined,
    /// Null value
    Null,
    /// Boolean value
    Bool(bool),
    /// Numeric value (f64 for JS compatibility)
    Number(f64),
    /// String value
    String(String),
    /// Raw byte buffer
    Buffer(Vec<u8>),
    /// Array of values
    Array(Vec<ScriptValue>),
    /// Object with ordered properties
    Object(ObjectMap),
    /// Function value
    Function(Callable),
}

impl ScriptValue {
    /// Get the value kind
    pub fn kind(&self) -> ValueKind {
        match self {
            ScriptValue::Undefined => ValueKind::Undefined,
            ScriptValue::Null => ValueKind::Null,
            ScriptValue::Bool(_) => ValueKind::Bool,
            ScriptValue::Number(_) => ValueKind::Number,
            ScriptValue::String(_) => ValueKind::String,
            ScriptValue::Buffer(_) => ValueKind::Buffer,
            ScriptValue::Array(_) => ValueKind::Array,
            ScriptValue::Object(_) => ValueKind::Object,
            ScriptValue::Function(_) => ValueKind::Function,
        }
    }

    /// Check if value is undefined
    pub fn is_undefined(&self) -> bool {
        matches!(self, ScriptValue::Undefined)
    }

    /// Check if value is an object (arrays, buffers and functions included)
    pub fn is_object(&self) -> bool {
        matches!(
            self,
            ScriptValue::Object(_)
                | ScriptValue::Array(_)
                | ScriptValue::Buffer(_)
                | ScriptValue::Function(_)
        )
    }

    /// Get as boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ScriptValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get as number
    pub fn as_number(&self) -> Option<f64> {
        match self {
            ScriptValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Get as string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScriptValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get as byte buffer
    pub fn as_buffer(&self) -> Option<&[u8]> {
        match self {
            ScriptValue::Buffer(b) => Some(b),
            _ => None,
        }
    }

    /// Get as array
    pub fn as_array(&self) -> Option<&[ScriptValue]> {
        match self {
            ScriptValue::Array(arr) => Some(arr),
            _ => None,
        }
    }

    /// Get as object
    pub fn as_object(&self) -> Option<&ObjectMap> {
        match self {
            ScriptValue::Object(obj) => Some(obj),
            _ => None,
        }
    }

    /// Get as callable
    pub fn as_callable(&self) -> Option<Callable> {
        match self {
            ScriptValue::Function(f) => Some(*f),
            _ => None,
        }
    }

    /// Read a named property; undefined for non-objects and missing keys
    pub fn get(&self, key: &str) -> &ScriptValue {
        match self {
            ScriptValue::Object(obj) => obj.get(key).unwrap_or(&UNDEFINED),
            _ => &UNDEFINED,
        }
    }

    /// Read an indexed element; undefined past the end
    pub fn index(&self, idx: usize) -> &ScriptValue {
        match self {
            ScriptValue::Array(arr) => arr.get(idx).unwrap_or(&UNDEFINED),
            _ => &UNDEFINED,
        }
    }

    /// Numeric coercion following script `ToNumber` rules
    pub fn to_number(&self) -> f64 {
        match self {
            ScriptValue::Undefined => f64::NAN,
            ScriptValue::Null => 0.0,
            ScriptValue::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            ScriptValue::Number(n) => *n,
            ScriptValue::String(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    0.0
                } else if let Some(hex) = trimmed
                    .strip_prefix("0x")
                    .or_else(|| trimmed.strip_prefix("0X"))
                {
                    u64::from_str_radix(hex, 16)
                        .map(|v| v as f64)
                        .unwrap_or(f64::NAN)
                } else {
                    trimmed.parse::<f64>().unwrap_or(f64::NAN)
                }
            }
            ScriptValue::Array(arr) if arr.is_empty() => 0.0,
            ScriptValue::Array(arr) if arr.len() == 1 => arr[0].to_number(),
            _ => f64::NAN,
        }
    }

    /// Boolean coercion following script `ToBoolean` rules
    pub fn truthy(&self) -> bool {
        match self {
            ScriptValue::Undefined | ScriptValue::Null => false,
            ScriptValue::Bool(b) => *b,
            ScriptValue::Number(n) => *n != 0.0 && !n.is_nan(),
            ScriptValue::String(s) => !s.is_empty(),
            _ => true,
        }
    }

    /// String form used when a value becomes a property key
    pub fn to_key_string(&self) -> String {
        match self {
            ScriptValue::String(s) => s.clone(),
            ScriptValue::Number(n) => number_to_string(*n),
            ScriptValue::Bool(b) => b.to_string(),
            ScriptValue::Undefined => "undefined".to_string(),
            ScriptValue::Null => "null".to_string(),
            other => other.to_string(),
        }
    }

    /// Convert to JSON; functions and undefined have no JSON form
    pub fn to_json(&self) -> Option<serde_json::Value> {
        Some(match self {
            ScriptValue::Undefined | ScriptValue::Function(_) => return None,
            ScriptValue::Null => serde_json::Value::Null,
            ScriptValue::Bool(b) => serde_json::Value::Bool(*b),
            ScriptValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            ScriptValue::String(s) => serde_json::Value::String(s.clone()),
            ScriptValue::Buffer(b) => serde_json::Value::Array(
                b.iter().map(|v| serde_json::Value::from(*v)).collect(),
            ),
            ScriptValue::Array(arr) => serde_json::Value::Array(
                arr.iter()
                    .map(|v| v.to_json().unwrap_or(serde_json::Value::Null))
                    .collect(),
            ),
            ScriptValue::Object(obj) => {
                let mut map = serde_json::Map::new();
                for (k, v) in obj.iter() {
                    if let Some(json) = v.to_json() {
                        map.insert(k.clone(), json);
                    }
                }
                serde_json::Value::Object(map)
            }
        })
    }

    /// Build a value from JSON
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => ScriptValue::Null,
            serde_json::Value::Bool(b) => ScriptValue::Bool(*b),
            serde_json::Value::Number(n) => ScriptValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => ScriptValue::String(s.clone()),
            serde_json::Value::Array(arr) => {
                ScriptValue::Array(arr.iter().map(ScriptValue::from_json).collect())
            }
            serde_json::Value::Object(map) => ScriptValue::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), ScriptValue::from_json(v)))
                    .collect(),
            ),
        }
    }
}

static UNDEFINED: ScriptValue = ScriptValue::Undefined;

/// Script `ToString` for numbers: integral values print without a fraction
pub fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 {
            "Infinity".to_string()
        } else {
            "-Infinity".to_string()
        }
    } else if n.fract() == 0.0 && n.abs() < 1e21 {
        format!("{}", n as i128)
    } else {
        format!("{}", n)
    }
}

impl fmt::Display for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptValue::Undefined => write!(f, "undefined"),
            ScriptValue::Null => write!(f, "null"),
            ScriptValue::Bool(b) => write!(f, "{}", b),
            ScriptValue::Number(n) => write!(f, "{}", number_to_string(*n)),
            ScriptValue::String(s) => write!(f, "{}", s),
            ScriptValue::Buffer(b) => write!(f, "[buffer {}]", b.len()),
            ScriptValue::Array(arr) => {
                let parts: Vec<String> = arr.iter().map(|v| v.to_string()).collect();
                write!(f, "{}", parts.join(","))
            }
            ScriptValue::Object(_) => write!(f, "[object Object]"),
            ScriptValue::Function(_) => write!(f, "[function]"),
        }
    }
}

impl From<bool> for ScriptValue {
    fn from(b: bool) -> Self {
        ScriptValue::Bool(b)
    }
}

impl From<f64> for ScriptValue {
    fn from(n: f64) -> Self {
        ScriptValue::Number(n)
    }
}

impl From<i32> for ScriptValue {
    fn from(n: i32) -> Self {
        ScriptValue::Number(n as f64)
    }
}

impl From<u32> for ScriptValue {
    fn from(n: u32) -> Self {
        ScriptValue::Number(n as f64)
    }
}

impl From<String> for ScriptValue {
    fn from(s: String) -> Self {
        ScriptValue::String(s)
    }
}

impl From<&str> for ScriptValue {
    fn from(s: &str) -> Self {
        ScriptValue::String(s.to_string())
    }
}

impl From<Callable> for ScriptValue {
    fn from(c: Callable) -> Self {
        ScriptValue::Function(c)
    }
}

impl From<ObjectMap> for ScriptValue {
    fn from(obj: ObjectMap) -> Self {
        ScriptValue::Object(obj)
    }
}

impl<T: Into<ScriptValue>> From<Vec<T>> for ScriptValue {
    fn from(v: Vec<T>) -> Self {
        ScriptValue::Array(v.into_iter().map(Into::into).collect())
    }
}

/// Insertion-ordered property map
///
/// Assigning an existing key replaces the value in place, so the key keeps
/// its original position and the last write wins.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ObjectMap {
    entries: Vec<(String, ScriptValue)>,
}

impl ObjectMap {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a property
    pub fn insert(&mut self, key: impl Into<String>, value: ScriptValue) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Builder form of [`ObjectMap::insert`]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<ScriptValue>) -> Self {
        self.insert(key, value.into());
        self
    }

    /// Get a property
    pub fn get(&self, key: &str) -> Option<&ScriptValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Remove a property
    pub fn remove(&mut self, key: &str) -> Option<ScriptValue> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(pos).1)
    }

    /// Check for a property
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Number of properties
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no properties
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate properties in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ScriptValue)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    /// Iterate keys in insertion order
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.iter().map(|(k, _)| k)
    }
}

impl FromIterator<(String, ScriptValue)> for ObjectMap {
    fn from_iter<I: IntoIterator<Item = (String, ScriptValue)>>(iter: I) -> Self {
        let mut map = ObjectMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}
