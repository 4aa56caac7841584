use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use weft_core::types::{GraphId, Inputs, NodeId, Outputs, ProcessId};

/// Where a node is in the current arm of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Running,
    Complete,
    Excluded,
    Errored,
    Skipped,
}

impl NodeStatus {
    /// Downstream nodes may read this node.
    pub fn is_resolved(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Errored and skipped sources skip their dependents.
    pub fn is_failed(self) -> bool {
        matches!(self, Self::Errored | Self::Skipped)
    }
}

/// Loop progress of a controller node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoopPhase {
    #[default]
    Idle,
    Iterating,
    Broken,
}

/// One node's entry in a run's state table.
#[derive(Debug, Clone)]
pub struct NodeState {
    pub status: NodeStatus,
    pub outputs: Option<Outputs>,
    /// Execution index of this node within the run. Only grows.
    pub iteration: usize,
    /// Continuing completions of a loop controller in the current loop.
    pub loop_iteration: usize,
    pub loop_phase: LoopPhase,
}

impl Default for NodeState {
    fn default() -> Self {
        Self {
            status: NodeStatus::Pending,
            outputs: None,
            iteration: 0,
            loop_iteration: 0,
            loop_phase: LoopPhase::Idle,
        }
    }
}

impl NodeState {
    /// A node whose outputs were supplied up front.
    pub fn preloaded(outputs: Outputs) -> Self {
        Self {
            status: NodeStatus::Complete,
            outputs: Some(outputs),
            ..Self::default()
        }
    }

    /// Back to pending for another execution. Returns the discarded
    /// iteration if the node had outputs.
    pub fn rearm(&mut self) -> Option<usize> {
        let cleared = self.outputs.take().map(|_| self.iteration);
        if self.status != NodeStatus::Pending {
            self.iteration += 1;
        }
        self.status = NodeStatus::Pending;
        self.loop_iteration = 0;
        self.loop_phase = LoopPhase::Idle;
        cleared
    }
}

/// What happened in one execution of one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRunRecord {
    pub node_id: NodeId,
    pub graph_id: GraphId,
    pub iteration: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_id: Option<ProcessId>,
    pub status: NodeStatus,
    #[serde(default)]
    pub inputs: Inputs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Outputs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Every (node, iteration) record of the most recent run, nested graphs
/// included. Survives failed and aborted runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LastRunData {
    records: Vec<NodeRunRecord>,
}

impl LastRunData {
    pub fn record(&mut self, record: NodeRunRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[NodeRunRecord] {
        &self.records
    }

    pub fn for_node<'a>(&'a self, id: &'a NodeId) -> impl Iterator<Item = &'a NodeRunRecord> + 'a {
        self.records.iter().filter(move |r| &r.node_id == id)
    }

    /// Outputs of the node's most recent completed execution.
    pub fn latest_outputs(&self, id: &NodeId) -> Option<&Outputs> {
        self.records
            .iter()
            .rev()
            .filter(|r| &r.node_id == id && r.status == NodeStatus::Complete)
            .find_map(|r| r.outputs.as_ref())
    }

    /// Latest outputs of every completed node, for preloading a partial run.
    pub fn preload_data(&self) -> HashMap<NodeId, Outputs> {
        let mut data = HashMap::new();
        for record in &self.records {
            if record.status == NodeStatus::Complete {
                if let Some(outputs) = &record.outputs {
                    data.insert(record.node_id.clone(), outputs.clone());
                }
            }
        }
        data
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}
