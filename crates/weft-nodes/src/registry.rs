use std::collections::HashMap;
use std::sync::Arc;

use weft_core::error::{Result, WeftError};
use weft_core::graph::Project;
use weft_core::node::{Node, PortDefinition};
use weft_core::traits::NodeType;

use crate::builtin;

/// Registry of node types known to a processor.
///
/// There is no global registry: hosts build one, pass it to the processor,
/// and add their own types next to the built-ins.
pub struct NodeRegistry {
    types: HashMap<String, Arc<dyn NodeType>>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            types: HashMap::new(),
        }
    }

    /// Register a node type, replacing any type with the same name.
    pub fn register(&mut self, node_type: impl NodeType) {
        let name = node_type.type_name().to_string();
        self.types.insert(name, Arc::new(node_type));
    }

    /// Unregister a node type by name.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.types.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn NodeType>> {
        self.types.get(name).cloned()
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn NodeType>> {
        self.get(name)
            .ok_or_else(|| WeftError::UnknownNodeType(name.to_string()))
    }

    /// Registered type names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.types.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// A fresh node of the given type.
    pub fn create(&self, name: &str) -> Result<Node> {
        Ok(self.resolve(name)?.create())
    }

    pub fn input_definitions(&self, node: &Node, project: &Project) -> Result<Vec<PortDefinition>> {
        Ok(self.resolve(&node.node_type)?.input_definitions(node, project))
    }

    pub fn output_definitions(&self, node: &Node, project: &Project) -> Result<Vec<PortDefinition>> {
        Ok(self.resolve(&node.node_type)?.output_definitions(node, project))
    }

    /// Drop every registered type and restore the built-in set.
    pub fn reset_to_defaults(&mut self) {
        self.types.clear();
        self.register_builtins();
    }

    /// Create a registry with all built-in node types registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_builtins();
        registry
    }

    fn register_builtins(&mut self) {
        // ── Data ────────────────────────────────────────────────
        self.register(builtin::text::TextNode);
        self.register(builtin::passthrough::PassthroughNode);
        self.register(builtin::chat::TrimChatMessagesNode);

        // ── Control flow ────────────────────────────────────────
        self.register(builtin::conditional::IfNode);
        self.register(builtin::conditional::CoalesceNode);
        self.register(builtin::loops::LoopControllerNode);
        self.register(builtin::loops::LoopUntilNode);
        self.register(builtin::delay::DelayNode);
        self.register(builtin::interaction::AbortGraphNode);

        // ── Graphs ──────────────────────────────────────────────
        self.register(builtin::graph_io::GraphInputNode);
        self.register(builtin::graph_io::GraphOutputNode);
        self.register(builtin::subgraph::SubGraphNode);
        self.register(builtin::subgraph::CallGraphNode);

        // ── Interaction ─────────────────────────────────────────
        self.register(builtin::interaction::UserInputNode);
        self.register(builtin::interaction::RaiseEventNode);
        self.register(builtin::interaction::WaitForEventNode);

        // ── Files ───────────────────────────────────────────────
        self.register(builtin::file::ReadFileNode);
        self.register(builtin::file::WriteFileNode);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_builtins_lists_every_type() {
        let registry = NodeRegistry::with_builtins();
        let names = registry.list();
        for expected in [
            "abort-graph",
            "call-graph",
            "coalesce",
            "delay",
            "graph-input",
            "graph-output",
            "if",
            "loop-controller",
            "loop-until",
            "passthrough",
            "raise-event",
            "read-file",
            "subgraph",
            "text",
            "trim-chat-messages",
            "user-input",
            "wait-for-event",
            "write-file",
        ] {
            assert!(names.contains(&expected), "missing {expected}");
        }
        assert_eq!(names.len(), 18);
    }

    #[test]
    fn test_unknown_type_errors() {
        let registry = NodeRegistry::new();
        let err = registry.create("text").unwrap_err();
        assert!(matches!(err, WeftError::UnknownNodeType(name) if name == "text"));
    }

    #[test]
    fn test_reset_to_defaults_drops_custom_types() {
        let mut registry = NodeRegistry::with_builtins();
        assert!(registry.unregister("text"));
        assert!(registry.get("text").is_none());

        registry.reset_to_defaults();
        assert!(registry.get("text").is_some());
    }

    #[test]
    fn test_create_uses_type_defaults() {
        let registry = NodeRegistry::with_builtins();
        let node = registry.create("text").unwrap();
        assert_eq!(node.node_type, "text");
        let project = Project::new("p");
        let inputs = registry.input_definitions(&node, &project).unwrap();
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].id.as_str(), "input");
    }
}
