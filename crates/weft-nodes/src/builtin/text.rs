use std::collections::HashMap;
use std::sync::OnceLock;

use futures::future::BoxFuture;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;

use weft_core::context::ProcessContext;
use weft_core::error::Result;
use weft_core::graph::Project;
use weft_core::node::{Node, PortDefinition};
use weft_core::traits::NodeType;
use weft_core::types::{Inputs, Outputs};
use weft_core::value::{DataType, DataValue};

use super::{input_string, outputs};

/// Renders a template. Every `{{name}}` in the text becomes an input port.
pub struct TextNode;

#[derive(Debug, Default, Deserialize)]
struct TextData {
    #[serde(default)]
    text: String,
}

fn variable_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("valid pattern"))
}

/// Variable names referenced by a template, in first-use order.
pub fn interpolation_variables(text: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for caps in variable_pattern().captures_iter(text) {
        let name = caps[1].to_string();
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

/// Substitute `{{name}}` references. Unknown names render as empty text.
pub fn interpolate(text: &str, values: &HashMap<String, String>) -> String {
    variable_pattern()
        .replace_all(text, |caps: &regex::Captures| {
            values.get(&caps[1]).cloned().unwrap_or_default()
        })
        .into_owned()
}

impl NodeType for TextNode {
    fn type_name(&self) -> &str {
        "text"
    }

    fn display_name(&self) -> &str {
        "Text"
    }

    fn create(&self) -> Node {
        Node::new("text", "Text", json!({ "text": "{{input}}" }))
    }

    fn input_definitions(&self, node: &Node, _project: &Project) -> Vec<PortDefinition> {
        let data: TextData = node.data_or_default();
        interpolation_variables(&data.text)
            .into_iter()
            .map(|name| PortDefinition::new(name.clone(), name, DataType::STRING))
            .collect()
    }

    fn output_definitions(&self, _node: &Node, _project: &Project) -> Vec<PortDefinition> {
        vec![PortDefinition::new("output", "Output", DataType::STRING).required()]
    }

    fn process<'a>(
        &'a self,
        node: &'a Node,
        inputs: Inputs,
        _ctx: ProcessContext,
    ) -> BoxFuture<'a, Result<Outputs>> {
        Box::pin(async move {
            let data: TextData = node.data_as()?;
            let values: HashMap<String, String> = interpolation_variables(&data.text)
                .into_iter()
                .filter_map(|name| input_string(&inputs, &name).map(|v| (name, v)))
                .collect();

            Ok(outputs([(
                "output",
                DataValue::string(interpolate(&data.text, &values)),
            )]))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use weft_core::types::PortId;

    #[test]
    fn test_interpolation_variables_dedup() {
        let vars = interpolation_variables("{{a}} and {{ b }} and {{a}}");
        assert_eq!(vars, vec!["a", "b"]);
    }

    #[test]
    fn test_interpolate_missing_is_empty() {
        let mut values = HashMap::new();
        values.insert("name".to_string(), "World".to_string());
        assert_eq!(interpolate("Hello {{name}}{{missing}}!", &values), "Hello World!");
    }

    #[test]
    fn test_ports_follow_template() {
        let node = Node::new("text", "T", json!({"text": "{{x}} + {{y}}"}));
        let ports = TextNode.input_definitions(&node, &Project::new("p"));
        let ids: Vec<_> = ports.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["x", "y"]);
    }

    #[tokio::test]
    async fn test_process_coerces_inputs_to_text() {
        let node = Node::new("text", "T", json!({"text": "{{n}} items"}));
        let ctx = ProcessContext::detached(node.clone(), Arc::new(Project::new("p")));
        let mut inputs = Inputs::new();
        inputs.insert(PortId::from("n"), DataValue::number(3.0));

        let out = TextNode.process(&node, inputs, ctx).await.unwrap();
        assert_eq!(out[&PortId::from("output")], DataValue::string("3 items"));
    }
}
