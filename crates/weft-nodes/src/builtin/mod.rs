//! Built-in node types.

pub mod chat;
pub mod conditional;
pub mod delay;
pub mod file;
pub mod graph_io;
pub mod interaction;
pub mod loops;
pub mod passthrough;
pub mod subgraph;
pub mod text;

use weft_core::coerce::coerce_type_optional;
use weft_core::types::{Inputs, Outputs, PortId};
use weft_core::value::{DataType, DataValue};

/// Build an output map from port/value pairs.
pub(crate) fn outputs<const N: usize>(pairs: [(&str, DataValue); N]) -> Outputs {
    pairs
        .into_iter()
        .map(|(id, value)| (PortId::from(id), value))
        .collect()
}

pub(crate) fn input<'a>(inputs: &'a Inputs, id: &str) -> Option<&'a DataValue> {
    inputs.get(&PortId::from(id)).filter(|v| !v.is_excluded())
}

pub(crate) fn input_string(inputs: &Inputs, id: &str) -> Option<String> {
    input(inputs, id)
        .and_then(|v| coerce_type_optional(v, DataType::STRING))
        .and_then(|v| v.as_str().map(str::to_string))
}

pub(crate) fn input_bool(inputs: &Inputs, id: &str) -> Option<bool> {
    input(inputs, id)
        .and_then(|v| coerce_type_optional(v, DataType::BOOLEAN))
        .and_then(|v| v.as_bool())
}

pub(crate) fn input_number(inputs: &Inputs, id: &str) -> Option<f64> {
    input(inputs, id)
        .and_then(|v| coerce_type_optional(v, DataType::NUMBER))
        .and_then(|v| v.as_number())
}
