use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer};
use serde::ser::{SerializeStruct, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The scalar kinds a port value can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    String,
    Number,
    Boolean,
    Object,
    ChatMessage,
    Image,
    Audio,
    Binary,
    Date,
    Any,
}

impl ScalarType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::ChatMessage => "chat-message",
            Self::Image => "image",
            Self::Audio => "audio",
            Self::Binary => "binary",
            Self::Date => "date",
            Self::Any => "any",
        }
    }
}

impl FromStr for ScalarType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "string" => Self::String,
            "number" => Self::Number,
            "boolean" => Self::Boolean,
            "object" => Self::Object,
            "chat-message" => Self::ChatMessage,
            "image" => Self::Image,
            "audio" => Self::Audio,
            "binary" => Self::Binary,
            "date" => Self::Date,
            "any" => Self::Any,
            other => return Err(format!("unknown data type: {other}")),
        })
    }
}

/// A port or value type: a scalar kind, an array of one, or the
/// control-flow-excluded sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Scalar(ScalarType),
    Array(ScalarType),
    ControlFlowExcluded,
}

impl DataType {
    pub const STRING: DataType = DataType::Scalar(ScalarType::String);
    pub const NUMBER: DataType = DataType::Scalar(ScalarType::Number);
    pub const BOOLEAN: DataType = DataType::Scalar(ScalarType::Boolean);
    pub const OBJECT: DataType = DataType::Scalar(ScalarType::Object);
    pub const CHAT_MESSAGE: DataType = DataType::Scalar(ScalarType::ChatMessage);
    pub const BINARY: DataType = DataType::Scalar(ScalarType::Binary);
    pub const DATE: DataType = DataType::Scalar(ScalarType::Date);
    pub const ANY: DataType = DataType::Scalar(ScalarType::Any);

    pub fn is_array(&self) -> bool {
        matches!(self, Self::Array(_))
    }

    /// The scalar kind, or the element kind for arrays.
    pub fn scalar(&self) -> Option<ScalarType> {
        match self {
            Self::Scalar(t) | Self::Array(t) => Some(*t),
            Self::ControlFlowExcluded => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(t) => f.write_str(t.as_str()),
            Self::Array(t) => write!(f, "{}[]", t.as_str()),
            Self::ControlFlowExcluded => f.write_str("control-flow-excluded"),
        }
    }
}

impl FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "control-flow-excluded" {
            return Ok(Self::ControlFlowExcluded);
        }
        match s.strip_suffix("[]") {
            Some(item) => Ok(Self::Array(item.parse()?)),
            None => Ok(Self::Scalar(s.parse()?)),
        }
    }
}

impl Serialize for DataType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DataType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Function,
}

/// A chat message value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(rename = "type")]
    pub role: ChatRole,
    #[serde(rename = "message")]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: text.into(),
            name: None,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: text.into(),
            name: None,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: text.into(),
            name: None,
        }
    }
}

/// Image or audio payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Media {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub data: Vec<u8>,
}

/// A single value of one scalar kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    String(String),
    Number(f64),
    Boolean(bool),
    Object(Value),
    ChatMessage(ChatMessage),
    Image(Media),
    Audio(Media),
    Binary(Vec<u8>),
    Date(DateTime<Utc>),
    Any(Value),
}

impl Scalar {
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            Self::String(_) => ScalarType::String,
            Self::Number(_) => ScalarType::Number,
            Self::Boolean(_) => ScalarType::Boolean,
            Self::Object(_) => ScalarType::Object,
            Self::ChatMessage(_) => ScalarType::ChatMessage,
            Self::Image(_) => ScalarType::Image,
            Self::Audio(_) => ScalarType::Audio,
            Self::Binary(_) => ScalarType::Binary,
            Self::Date(_) => ScalarType::Date,
            Self::Any(_) => ScalarType::Any,
        }
    }

    /// The JSON payload of this scalar, without its type tag.
    pub fn to_json(&self) -> Value {
        match self {
            Self::String(s) => Value::String(s.clone()),
            Self::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::Boolean(b) => Value::Bool(*b),
            Self::Object(v) | Self::Any(v) => v.clone(),
            Self::ChatMessage(m) => serde_json::to_value(m).unwrap_or(Value::Null),
            Self::Image(m) | Self::Audio(m) => serde_json::to_value(m).unwrap_or(Value::Null),
            Self::Binary(b) => Value::Array(b.iter().map(|byte| Value::from(*byte)).collect()),
            Self::Date(d) => Value::String(d.to_rfc3339()),
        }
    }

    /// Decode a JSON payload as the given kind.
    pub fn from_json(kind: ScalarType, value: Value) -> Result<Self, String> {
        let mismatch = |v: &Value| format!("expected {} payload, got {v}", kind.as_str());
        Ok(match kind {
            ScalarType::String => match value {
                Value::String(s) => Self::String(s),
                other => return Err(mismatch(&other)),
            },
            ScalarType::Number => match value.as_f64() {
                Some(n) => Self::Number(n),
                None => return Err(mismatch(&value)),
            },
            ScalarType::Boolean => match value.as_bool() {
                Some(b) => Self::Boolean(b),
                None => return Err(mismatch(&value)),
            },
            ScalarType::Object => Self::Object(value),
            ScalarType::Any => Self::Any(value),
            ScalarType::ChatMessage => {
                Self::ChatMessage(serde_json::from_value(value).map_err(|e| e.to_string())?)
            }
            ScalarType::Image => Self::Image(serde_json::from_value(value).map_err(|e| e.to_string())?),
            ScalarType::Audio => Self::Audio(serde_json::from_value(value).map_err(|e| e.to_string())?),
            ScalarType::Binary => {
                Self::Binary(serde_json::from_value(value).map_err(|e| e.to_string())?)
            }
            ScalarType::Date => {
                let text = value.as_str().ok_or_else(|| mismatch(&value))?;
                let parsed = DateTime::parse_from_rfc3339(text).map_err(|e| e.to_string())?;
                Self::Date(parsed.with_timezone(&Utc))
            }
        })
    }
}

/// A typed value flowing along a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum DataValue {
    Scalar(Scalar),
    Array { item: ScalarType, values: Vec<Scalar> },
    /// The port produced nothing because its branch was not taken.
    ControlFlowExcluded,
}

impl DataValue {
    pub fn string(s: impl Into<String>) -> Self {
        Self::Scalar(Scalar::String(s.into()))
    }

    pub fn number(n: f64) -> Self {
        Self::Scalar(Scalar::Number(n))
    }

    pub fn boolean(b: bool) -> Self {
        Self::Scalar(Scalar::Boolean(b))
    }

    pub fn object(v: Value) -> Self {
        Self::Scalar(Scalar::Object(v))
    }

    pub fn any(v: Value) -> Self {
        Self::Scalar(Scalar::Any(v))
    }

    pub fn chat_message(m: ChatMessage) -> Self {
        Self::Scalar(Scalar::ChatMessage(m))
    }

    pub fn excluded() -> Self {
        Self::ControlFlowExcluded
    }

    pub fn string_array<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Array {
            item: ScalarType::String,
            values: items.into_iter().map(|s| Scalar::String(s.into())).collect(),
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            Self::Scalar(s) => DataType::Scalar(s.scalar_type()),
            Self::Array { item, .. } => DataType::Array(*item),
            Self::ControlFlowExcluded => DataType::ControlFlowExcluded,
        }
    }

    pub fn is_excluded(&self) -> bool {
        matches!(self, Self::ControlFlowExcluded)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Scalar(Scalar::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Scalar(Scalar::Number(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Scalar(Scalar::Boolean(b)) => Some(*b),
            _ => None,
        }
    }

    /// The JSON payload, without the type tag. Excluded values are `null`.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Scalar(s) => s.to_json(),
            Self::Array { values, .. } => Value::Array(values.iter().map(Scalar::to_json).collect()),
            Self::ControlFlowExcluded => Value::Null,
        }
    }

    /// Collapse into a single scalar, wrapping arrays as `any`.
    pub fn to_scalar(&self) -> Scalar {
        match self {
            Self::Scalar(s) => s.clone(),
            other => Scalar::Any(other.to_json()),
        }
    }

    /// Decode a tagged payload.
    pub fn from_json(data_type: DataType, value: Value) -> Result<Self, String> {
        match data_type {
            DataType::ControlFlowExcluded => Ok(Self::ControlFlowExcluded),
            DataType::Scalar(kind) => Scalar::from_json(kind, value).map(Self::Scalar),
            DataType::Array(item) => {
                let items = match value {
                    Value::Array(items) => items,
                    Value::Null => Vec::new(),
                    other => return Err(format!("expected array payload, got {other}")),
                };
                let values = items
                    .into_iter()
                    .map(|v| Scalar::from_json(item, v))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Self::Array { item, values })
            }
        }
    }

    /// Infer the natural kind of an untyped JSON value.
    pub fn infer(value: Value) -> Self {
        match value {
            Value::String(s) => Self::string(s),
            Value::Bool(b) => Self::boolean(b),
            Value::Number(n) => match n.as_f64() {
                Some(f) => Self::number(f),
                None => Self::any(Value::Number(n)),
            },
            Value::Array(items) => {
                let values: Vec<Scalar> = items
                    .into_iter()
                    .map(|v| match Self::infer(v) {
                        Self::Scalar(s) => s,
                        other => Scalar::Any(other.to_json()),
                    })
                    .collect();
                let item = match values.first().map(Scalar::scalar_type) {
                    Some(first) if values.iter().all(|v| v.scalar_type() == first) => first,
                    _ => ScalarType::Any,
                };
                let values = if item == ScalarType::Any {
                    values
                        .into_iter()
                        .map(|v| match v {
                            Scalar::Any(_) => v,
                            other => Scalar::Any(other.to_json()),
                        })
                        .collect()
                } else {
                    values
                };
                Self::Array { item, values }
            }
            Value::Object(_) => Self::object(value),
            Value::Null => Self::any(Value::Null),
        }
    }
}

impl From<String> for DataValue {
    fn from(s: String) -> Self {
        Self::string(s)
    }
}

impl From<&str> for DataValue {
    fn from(s: &str) -> Self {
        Self::string(s)
    }
}

impl From<f64> for DataValue {
    fn from(n: f64) -> Self {
        Self::number(n)
    }
}

impl From<bool> for DataValue {
    fn from(b: bool) -> Self {
        Self::boolean(b)
    }
}

impl Serialize for DataValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("DataValue", 2)?;
        state.serialize_field("type", &self.data_type())?;
        state.serialize_field("value", &self.to_json())?;
        state.end()
    }
}

#[derive(Deserialize)]
struct RawDataValue {
    #[serde(rename = "type")]
    data_type: DataType,
    #[serde(default)]
    value: Value,
}

impl<'de> Deserialize<'de> for DataValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawDataValue::deserialize(deserializer)?;
        DataValue::from_json(raw.data_type, raw.value).map_err(de::Error::custom)
    }
}
