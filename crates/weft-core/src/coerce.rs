//! Conversion of values between port types.
//!
//! Both entry points are pure. `coerce_type_optional` reports "no rule" as
//! `None`; `coerce_type` turns that into a [`WeftError::Coercion`].

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::{Result, WeftError};
use crate::node::PortType;
use crate::value::{ChatMessage, DataType, DataValue, Media, Scalar, ScalarType};

pub fn coerce_type(value: &DataValue, target: DataType) -> Result<DataValue> {
    coerce_type_optional(value, target).ok_or(WeftError::Coercion {
        from: value.data_type(),
        to: target,
    })
}

pub fn coerce_type_optional(value: &DataValue, target: DataType) -> Option<DataValue> {
    if value.data_type() == target {
        return Some(value.clone());
    }

    match (value, target) {
        (DataValue::ControlFlowExcluded, _) | (_, DataType::ControlFlowExcluded) => None,
        (_, DataType::Scalar(ScalarType::Any)) => Some(value.clone()),
        (DataValue::Scalar(scalar), DataType::Scalar(kind)) => {
            coerce_scalar(scalar, kind).map(DataValue::Scalar)
        }
        (DataValue::Scalar(scalar), DataType::Array(kind)) => scalar_to_array(scalar, kind),
        (DataValue::Array { values, .. }, DataType::Scalar(kind)) => array_to_scalar(values, kind),
        (DataValue::Array { values, .. }, DataType::Array(kind)) => values
            .iter()
            .map(|v| coerce_scalar(v, kind))
            .collect::<Option<Vec<_>>>()
            .map(|values| DataValue::Array { item: kind, values }),
    }
}

/// Coerce to a port's declared type. Values already matching any member of
/// a union pass through unchanged.
pub fn coerce_to_port(value: &DataValue, port: &PortType) -> Result<DataValue> {
    if value.is_excluded() || port.accepts(value.data_type()) {
        return Ok(value.clone());
    }
    coerce_type(value, port.primary())
}

fn coerce_scalar(value: &Scalar, kind: ScalarType) -> Option<Scalar> {
    if value.scalar_type() == kind || kind == ScalarType::Any {
        return Some(value.clone());
    }

    if let Scalar::Any(json) = value {
        return coerce_untyped(json, kind);
    }

    match kind {
        ScalarType::String => to_string(value).map(Scalar::String),
        ScalarType::Number => to_number(value).map(Scalar::Number),
        ScalarType::Boolean => to_boolean(value).map(Scalar::Boolean),
        ScalarType::Object => Some(Scalar::Object(value.to_json())),
        ScalarType::ChatMessage => to_chat_message(value).map(Scalar::ChatMessage),
        ScalarType::Date => to_date(value).map(Scalar::Date),
        ScalarType::Binary => match value {
            Scalar::String(s) => Some(Scalar::Binary(s.as_bytes().to_vec())),
            Scalar::Image(m) | Scalar::Audio(m) => Some(Scalar::Binary(m.data.clone())),
            _ => None,
        },
        ScalarType::Image => match value {
            Scalar::Binary(b) => Some(Scalar::Image(Media {
                media_type: None,
                data: b.clone(),
            })),
            _ => None,
        },
        ScalarType::Audio => match value {
            Scalar::Binary(b) => Some(Scalar::Audio(Media {
                media_type: None,
                data: b.clone(),
            })),
            _ => None,
        },
        ScalarType::Any => Some(value.clone()),
    }
}

/// `any` payloads are coerced from their inferred kind.
fn coerce_untyped(json: &Value, kind: ScalarType) -> Option<Scalar> {
    match kind {
        ScalarType::Object => return Some(Scalar::Object(json.clone())),
        ScalarType::Boolean => return Some(Scalar::Boolean(json_truthy(json))),
        _ => {}
    }
    match DataValue::infer(json.clone()) {
        DataValue::Scalar(Scalar::Any(Value::Null)) => match kind {
            ScalarType::String => Some(Scalar::String(String::new())),
            _ => None,
        },
        DataValue::Scalar(Scalar::Any(_)) => None,
        DataValue::Scalar(inner) => coerce_scalar(&inner, kind),
        array @ DataValue::Array { .. } => {
            match coerce_type_optional(&array, DataType::Scalar(kind)) {
                Some(DataValue::Scalar(s)) => Some(s),
                _ => None,
            }
        }
        DataValue::ControlFlowExcluded => None,
    }
}

fn scalar_to_array(value: &Scalar, kind: ScalarType) -> Option<DataValue> {
    match value {
        Scalar::Any(Value::Array(items)) | Scalar::Object(Value::Array(items)) => items
            .iter()
            .map(|item| {
                let scalar = match DataValue::infer(item.clone()) {
                    DataValue::Scalar(s) => s,
                    _ => Scalar::Any(item.clone()),
                };
                coerce_scalar(&scalar, kind)
            })
            .collect::<Option<Vec<_>>>()
            .map(|values| DataValue::Array { item: kind, values }),
        _ => coerce_scalar(value, kind).map(|v| DataValue::Array {
            item: kind,
            values: vec![v],
        }),
    }
}

fn array_to_scalar(values: &[Scalar], kind: ScalarType) -> Option<DataValue> {
    let scalar = match kind {
        ScalarType::String => {
            let parts = values
                .iter()
                .map(|v| match coerce_scalar(v, ScalarType::String) {
                    Some(Scalar::String(s)) => Some(s),
                    _ => None,
                })
                .collect::<Option<Vec<_>>>()?;
            Scalar::String(parts.join("\n"))
        }
        ScalarType::Boolean => Scalar::Boolean(!values.is_empty()),
        ScalarType::Object => Scalar::Object(Value::Array(values.iter().map(Scalar::to_json).collect())),
        _ => return None,
    };
    Some(DataValue::Scalar(scalar))
}

fn to_string(value: &Scalar) -> Option<String> {
    match value {
        Scalar::String(s) => Some(s.clone()),
        Scalar::Number(n) => Some(n.to_string()),
        Scalar::Boolean(b) => Some(b.to_string()),
        Scalar::Object(v) | Scalar::Any(v) => Some(json_text(v)),
        Scalar::ChatMessage(m) => Some(m.content.clone()),
        Scalar::Date(d) => Some(d.to_rfc3339()),
        Scalar::Image(_) | Scalar::Audio(_) | Scalar::Binary(_) => None,
    }
}

fn to_number(value: &Scalar) -> Option<f64> {
    match value {
        Scalar::String(s) => parse_number(s),
        Scalar::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
        Scalar::Date(d) => Some(d.timestamp_millis() as f64),
        Scalar::Object(v) | Scalar::Any(v) => match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => parse_number(s),
            _ => None,
        },
        _ => None,
    }
}

fn parse_number(s: &str) -> Option<f64> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok()
}

fn to_boolean(value: &Scalar) -> Option<bool> {
    Some(match value {
        Scalar::String(s) => !matches!(s.trim().to_lowercase().as_str(), "" | "false" | "0"),
        Scalar::Number(n) => *n != 0.0 && !n.is_nan(),
        Scalar::Boolean(b) => *b,
        Scalar::ChatMessage(m) => !m.content.is_empty(),
        Scalar::Object(v) | Scalar::Any(v) => json_truthy(v),
        Scalar::Date(_) => true,
        Scalar::Image(m) | Scalar::Audio(m) => !m.data.is_empty(),
        Scalar::Binary(b) => !b.is_empty(),
    })
}

fn to_chat_message(value: &Scalar) -> Option<ChatMessage> {
    match value {
        Scalar::Object(v) => serde_json::from_value::<ChatMessage>(v.clone())
            .ok()
            .or_else(|| Some(ChatMessage::user(json_text(v)))),
        other => to_string(other).map(ChatMessage::user),
    }
}

fn to_date(value: &Scalar) -> Option<DateTime<Utc>> {
    match value {
        Scalar::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|d| d.with_timezone(&Utc)),
        Scalar::Number(n) => DateTime::<Utc>::from_timestamp_millis(*n as i64),
        _ => None,
    }
}

fn json_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn json_truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn coerce(value: DataValue, target: DataType) -> DataValue {
        coerce_type(&value, target).unwrap()
    }

    #[test]
    fn test_identity_and_any() {
        let v = DataValue::number(3.0);
        assert_eq!(coerce(v.clone(), DataType::NUMBER), v);
        assert_eq!(coerce(v.clone(), DataType::ANY), v);
    }

    #[test]
    fn test_string_array_joins_with_newline() {
        let v = DataValue::string_array(["a", "b"]);
        assert_eq!(coerce(v, DataType::STRING), DataValue::string("a\nb"));
    }

    #[test]
    fn test_numbers_to_string() {
        assert_eq!(coerce(DataValue::number(3.0), DataType::STRING), DataValue::string("3"));
        assert_eq!(coerce(DataValue::number(2.5), DataType::STRING), DataValue::string("2.5"));
    }

    #[test]
    fn test_string_to_number() {
        assert_eq!(coerce(DataValue::string(" 42 "), DataType::NUMBER), DataValue::number(42.0));
        assert!(coerce_type_optional(&DataValue::string("abc"), DataType::NUMBER).is_none());
        assert!(coerce_type_optional(&DataValue::string(""), DataType::NUMBER).is_none());
    }

    #[test]
    fn test_string_truthiness() {
        for (input, expected) in [("", false), ("false", false), ("0", false), (" FALSE ", false), ("yes", true)] {
            assert_eq!(
                coerce(DataValue::string(input), DataType::BOOLEAN),
                DataValue::boolean(expected),
                "input {input:?}"
            );
        }
    }

    #[test]
    fn test_array_truthiness() {
        let empty = DataValue::Array {
            item: ScalarType::String,
            values: vec![],
        };
        assert_eq!(coerce(empty, DataType::BOOLEAN), DataValue::boolean(false));
        assert_eq!(
            coerce(DataValue::string_array(["x"]), DataType::BOOLEAN),
            DataValue::boolean(true)
        );
    }

    #[test]
    fn test_string_to_chat_message() {
        assert_eq!(
            coerce(DataValue::string("hello"), DataType::CHAT_MESSAGE),
            DataValue::chat_message(ChatMessage::user("hello"))
        );
    }

    #[test]
    fn test_scalar_wraps_into_array() {
        assert_eq!(
            coerce(DataValue::string("x"), DataType::Array(ScalarType::String)),
            DataValue::string_array(["x"])
        );
    }

    #[test]
    fn test_any_payload_is_inferred() {
        let v = DataValue::any(json!("7"));
        assert_eq!(coerce(v, DataType::NUMBER), DataValue::number(7.0));

        let v = DataValue::any(json!(["a", "b"]));
        assert_eq!(coerce(v.clone(), DataType::STRING), DataValue::string("a\nb"));
        assert_eq!(
            coerce(v, DataType::Array(ScalarType::String)),
            DataValue::string_array(["a", "b"])
        );
    }

    #[test]
    fn test_object_to_string_is_json_text() {
        let v = DataValue::object(json!({"a": 1}));
        assert_eq!(coerce(v, DataType::STRING), DataValue::string(r#"{"a":1}"#));
    }

    #[test]
    fn test_excluded_never_converts() {
        let err = coerce_type(&DataValue::excluded(), DataType::STRING).unwrap_err();
        assert!(matches!(err, WeftError::Coercion { .. }));
        assert_eq!(coerce(DataValue::excluded(), DataType::ControlFlowExcluded), DataValue::excluded());
    }

    #[test]
    fn test_binary_to_string_has_no_rule() {
        let v = DataValue::Scalar(Scalar::Binary(vec![1, 2]));
        let err = coerce_type(&v, DataType::STRING).unwrap_err();
        assert_eq!(err.to_string(), "Cannot coerce binary to string");
    }

    #[test]
    fn test_dates_round_through_epoch_millis() {
        let v = coerce(DataValue::number(0.0), DataType::DATE);
        assert_eq!(coerce(v, DataType::NUMBER), DataValue::number(0.0));
    }

    #[test]
    fn test_union_port_accepts_member_types() {
        let port = PortType::Union(vec![DataType::STRING, DataType::BINARY]);
        let v = DataValue::Scalar(Scalar::Binary(vec![1]));
        assert_eq!(coerce_to_port(&v, &port).unwrap(), v);
        assert_eq!(
            coerce_to_port(&DataValue::number(1.0), &port).unwrap(),
            DataValue::string("1")
        );
    }
}
