use std::path::Path;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use weft_core::context::ProcessContext;
use weft_core::error::{Result, WeftError};
use weft_core::graph::Project;
use weft_core::node::{Node, PortDefinition, PortType};
use weft_core::types::{Inputs, Outputs, PortId};
use weft_core::traits::NodeType;
use weft_core::value::{DataType, DataValue, Scalar};

use super::{input, input_string, outputs};

#[derive(Debug, Deserialize)]
struct ReadFileData {
    #[serde(default)]
    path: String,
    #[serde(default = "default_true")]
    use_path_input: bool,
    #[serde(default)]
    as_binary: bool,
    #[serde(default = "default_true")]
    error_on_missing: bool,
}

impl Default for ReadFileData {
    fn default() -> Self {
        Self {
            path: String::new(),
            use_path_input: true,
            as_binary: false,
            error_on_missing: true,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct WriteFileData {
    #[serde(default)]
    path: String,
    #[serde(default)]
    use_path_input: bool,
    #[serde(default)]
    as_binary: bool,
    #[serde(default)]
    overwrite_existing_file: bool,
}

fn default_true() -> bool { true }

fn resolve_path(node: &Node, inputs: &Inputs, use_input: bool, configured: String) -> Result<String> {
    let path = if use_input {
        input_string(inputs, "path")
    } else {
        Some(configured)
    };
    path.filter(|p| !p.is_empty()).ok_or_else(|| WeftError::MissingInput {
        node_id: node.id.clone(),
        port: PortId::from("path"),
    })
}

/// Reads a file through the native API.
pub struct ReadFileNode;

impl NodeType for ReadFileNode {
    fn type_name(&self) -> &str {
        "read-file"
    }

    fn display_name(&self) -> &str {
        "Read File"
    }

    fn create(&self) -> Node {
        Node::new("read-file", "Read File", json!({ "use_path_input": true }))
    }

    fn input_definitions(&self, node: &Node, _project: &Project) -> Vec<PortDefinition> {
        let data: ReadFileData = node.data_or_default();
        if data.use_path_input {
            vec![PortDefinition::new("path", "Path", DataType::STRING).required()]
        } else {
            Vec::new()
        }
    }

    fn output_definitions(&self, node: &Node, _project: &Project) -> Vec<PortDefinition> {
        let data: ReadFileData = node.data_or_default();
        let data_type = if data.as_binary { DataType::BINARY } else { DataType::STRING };
        vec![PortDefinition::new("content", "Content", data_type)]
    }

    fn process<'a>(
        &'a self,
        node: &'a Node,
        inputs: Inputs,
        ctx: ProcessContext,
    ) -> BoxFuture<'a, Result<Outputs>> {
        Box::pin(async move {
            let data: ReadFileData = node.data_as()?;
            let api = ctx.native_api()?;
            let path = resolve_path(node, &inputs, data.use_path_input, data.path)?;

            if !data.error_on_missing && !api.exists(path.clone()).await? {
                debug!(node_id = %node.id, path = %path, "File missing, excluding output");
                return Ok(outputs([("content", DataValue::excluded())]));
            }

            let content = if data.as_binary {
                DataValue::Scalar(Scalar::Binary(api.read_binary_file(path).await?))
            } else {
                DataValue::string(api.read_text_file(path).await?)
            };
            Ok(outputs([("content", content)]))
        })
    }
}

/// Writes content into the project's file folder.
///
/// Files land in `<project stem>.weft-files` next to the project file. Unless
/// `overwrite_existing_file` is set, an existing name gets a numeric suffix.
pub struct WriteFileNode;

impl NodeType for WriteFileNode {
    fn type_name(&self) -> &str {
        "write-file"
    }

    fn display_name(&self) -> &str {
        "Write File"
    }

    fn create(&self) -> Node {
        Node::new("write-file", "Write File", json!({ "path": "output.txt" }))
    }

    fn input_definitions(&self, node: &Node, _project: &Project) -> Vec<PortDefinition> {
        let data: WriteFileData = node.data_or_default();
        let mut ports = vec![PortDefinition::new(
            "content",
            "Content",
            PortType::Union(vec![DataType::STRING, DataType::BINARY]),
        )
        .required()
        .uncoerced()];
        if data.use_path_input {
            ports.push(PortDefinition::new("path", "Path", DataType::STRING).required());
        }
        ports
    }

    fn output_definitions(&self, _node: &Node, _project: &Project) -> Vec<PortDefinition> {
        vec![PortDefinition::new("outputContent", "Content", DataType::ANY)]
    }

    fn process<'a>(
        &'a self,
        node: &'a Node,
        inputs: Inputs,
        ctx: ProcessContext,
    ) -> BoxFuture<'a, Result<Outputs>> {
        Box::pin(async move {
            let data: WriteFileData = node.data_as()?;
            let api = ctx.native_api()?;
            let name = resolve_path(node, &inputs, data.use_path_input, data.path)?;
            let content = input(&inputs, "content").cloned().ok_or_else(|| WeftError::MissingInput {
                node_id: node.id.clone(),
                port: PortId::from("content"),
            })?;

            let folder = files_folder(&ctx.project).ok_or_else(|| WeftError::NodeExecution {
                node_id: node.id.clone(),
                title: node.title.clone(),
                message: "project has not been saved, so it has no file folder".to_string(),
            })?;
            api.create_dir(folder.clone(), true).await?;

            let mut target = api.join(&[&folder, &name]);
            if !data.overwrite_existing_file {
                target = api.unique_filename(target).await?;
            }

            match &content {
                DataValue::Scalar(Scalar::Binary(bytes)) => {
                    api.write_binary_file(target.clone(), bytes.clone()).await?
                }
                _ if data.as_binary => {
                    let text = content.as_str().map(str::to_string).unwrap_or_else(|| content.to_json().to_string());
                    api.write_binary_file(target.clone(), text.into_bytes()).await?
                }
                DataValue::Scalar(Scalar::String(text)) => {
                    api.write_text_file(target.clone(), text.clone()).await?
                }
                other => api.write_text_file(target.clone(), other.to_json().to_string()).await?,
            }

            debug!(node_id = %node.id, path = %target, "Wrote file");
            Ok(outputs([("outputContent", content)]))
        })
    }
}

fn files_folder(project: &Project) -> Option<String> {
    let path = project.metadata.path.as_deref()?;
    let stem = path.file_stem()?.to_string_lossy();
    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    Some(parent.join(format!("{stem}.weft-files")).to_string_lossy().into_owned())
}
