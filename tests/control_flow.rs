use serde_json::json;

use weft_core::event::ProcessEvent;
use weft_core::node::{ErrorPolicy, Node};
use weft_core::types::{NodeId, PortId};
use weft_core::value::DataValue;
use weft_core::WeftError;
use weft_engine::{GraphProcessor, NodeStatus, RunOptions};
use weft_test_utils::{collect_events, event_names, events_for, test_registry, GraphBuilder};

/// Cond -> If, with each branch rendered through a text node into its own
/// graph output.
fn branching_graph(condition: bool) -> (GraphBuilder, NodeId, NodeId) {
    let mut builder = GraphBuilder::new("branch");
    let cond = builder.node("test-value", "Cond", json!({ "value": condition }));
    let payload = builder.node("test-value", "Payload", json!({ "value": "p" }));
    let branch = builder.node("if", "If", json!({}));
    let yes = builder.node("text", "Yes", json!({ "text": "yes:{{v}}" }));
    let no = builder.node("text", "No", json!({ "text": "no:{{v}}" }));
    let yes_out = builder.node("graph-output", "YesOut", json!({ "id": "yes" }));
    let no_out = builder.node("graph-output", "NoOut", json!({ "id": "no" }));
    builder
        .connect(&cond, "value", &branch, "if")
        .connect(&payload, "value", &branch, "value")
        .connect(&branch, "output", &yes, "v")
        .connect(&branch, "falseOutput", &no, "v")
        .connect(&yes, "output", &yes_out, "value")
        .connect(&no, "output", &no_out, "value");
    (builder, yes, no)
}

#[tokio::test]
async fn test_branch_not_taken_is_excluded() {
    let (builder, _, _) = branching_graph(true);
    let (project, graph_id) = builder.into_project();
    let processor = GraphProcessor::new(project, graph_id, test_registry());
    let events = processor.events();
    let outputs = processor.run().await.unwrap();
    let events = collect_events(events).await;

    assert_eq!(outputs["yes"], DataValue::string("yes:p"));
    assert!(outputs["no"].is_excluded());
    assert_eq!(events_for(&events, "nodeExcluded", "No").len(), 1);
    assert_eq!(events_for(&events, "nodeExcluded", "NoOut").len(), 1);
    assert!(events_for(&events, "nodeStart", "No").is_empty());
}

#[tokio::test]
async fn test_false_condition_takes_other_branch() {
    let (builder, _, _) = branching_graph(false);
    let (project, graph_id) = builder.into_project();
    let processor = GraphProcessor::new(project, graph_id, test_registry());
    let outputs = processor.run().await.unwrap();

    assert!(outputs["yes"].is_excluded());
    assert_eq!(outputs["no"], DataValue::string("no:p"));
}

#[tokio::test]
async fn test_coalesce_merges_branches() {
    let (mut builder, yes, no) = branching_graph(false);
    let merge = builder.node("coalesce", "Merge", json!({ "count": 2 }));
    let merged = builder.node("graph-output", "Merged", json!({ "id": "merged" }));
    builder
        .connect(&yes, "output", &merge, "input1")
        .connect(&no, "output", &merge, "input2")
        .connect(&merge, "output", &merged, "value");
    let (project, graph_id) = builder.into_project();

    let processor = GraphProcessor::new(project, graph_id, test_registry());
    let outputs = processor.run().await.unwrap();
    assert_eq!(outputs["merged"], DataValue::string("no:p"));
}

/// Fail -> Text -> Out, next to an unrelated Value -> Other.
fn failing_graph(fail: Node) -> GraphBuilder {
    let mut builder = GraphBuilder::new("failing");
    let fail = builder.add(fail);
    let text = builder.node("text", "Text", json!({ "text": "{{x}}" }));
    let out = builder.node("graph-output", "Out", json!({ "id": "r" }));
    let value = builder.node("test-value", "Value", json!({ "value": "fine" }));
    let other = builder.node("graph-output", "Other", json!({ "id": "other" }));
    builder
        .connect(&fail, "output", &text, "x")
        .connect(&text, "output", &out, "value")
        .connect(&value, "value", &other, "value");
    builder
}

#[tokio::test]
async fn test_fail_run_policy_ends_run_with_error() {
    let fail = Node::new("test-fail", "Fail", json!({ "message": "kaput" }));
    let (project, graph_id) = failing_graph(fail).into_project();

    let processor = GraphProcessor::new(project, graph_id, test_registry());
    let events = processor.events();
    let err = processor.run().await.unwrap_err();
    let events = collect_events(events).await;

    assert!(matches!(err, WeftError::NodeExecution { ref message, .. } if message == "kaput"));
    assert_eq!(events_for(&events, "nodeError", "Fail").len(), 1);
    assert_eq!(event_names(&events).last(), Some(&"error"));
    assert!(!processor.is_running());

    let data = processor.last_run_data();
    let record = data
        .records()
        .iter()
        .find(|r| r.status == NodeStatus::Errored)
        .unwrap();
    assert!(record.error.as_deref().unwrap().contains("kaput"));
}

#[tokio::test]
async fn test_panicking_node_is_isolated_like_a_failure() {
    let fail = Node::new("test-fail", "Fail", json!({ "message": "went sideways", "panic": true }));
    let (project, graph_id) = failing_graph(fail).into_project();

    let processor = GraphProcessor::new(project, graph_id, test_registry()).with_options(RunOptions {
        error_policy: ErrorPolicy::SkipDependents,
        ..RunOptions::default()
    });
    let events = processor.events();
    let outputs = processor.run().await.unwrap();
    let events = collect_events(events).await;

    assert_eq!(outputs["other"], DataValue::string("fine"));
    let errors = events_for(&events, "nodeError", "Fail");
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], ProcessEvent::NodeError { error, .. } if error.contains("went sideways")));
    assert_eq!(event_names(&events).last(), Some(&"done"));
    assert!(!processor.is_running());
}

#[tokio::test]
async fn test_skip_dependents_policy_keeps_run_going() {
    let fail = Node::new("test-fail", "Fail", json!({}));
    let (project, graph_id) = failing_graph(fail).into_project();

    let processor = GraphProcessor::new(project, graph_id, test_registry()).with_options(RunOptions {
        error_policy: ErrorPolicy::SkipDependents,
        ..RunOptions::default()
    });
    let events = processor.events();
    let outputs = processor.run().await.unwrap();
    let events = collect_events(events).await;

    assert_eq!(outputs["other"], DataValue::string("fine"));
    assert!(!outputs.contains_key("r"));
    assert_eq!(event_names(&events).last(), Some(&"done"));
    assert!(events_for(&events, "nodeStart", "Text").is_empty());

    let data = processor.last_run_data();
    let skipped = data.records().iter().filter(|r| r.status == NodeStatus::Skipped).count();
    assert_eq!(skipped, 2);
}

#[tokio::test]
async fn test_node_error_policy_overrides_run_policy() {
    let fail = Node::new("test-fail", "Fail", json!({})).with_error_policy(ErrorPolicy::SkipDependents);
    let (project, graph_id) = failing_graph(fail).into_project();

    let processor = GraphProcessor::new(project, graph_id, test_registry());
    let outputs = processor.run().await.unwrap();
    assert_eq!(outputs["other"], DataValue::string("fine"));
}

#[tokio::test]
async fn test_unconnected_required_input_fails_node() {
    let mut builder = GraphBuilder::new("g");
    builder.node("if", "If", json!({}));
    let (project, graph_id) = builder.into_project();

    let processor = GraphProcessor::new(project, graph_id, test_registry());
    let err = processor.run().await.unwrap_err();
    assert!(matches!(err, WeftError::MissingInput { ref port, .. } if *port == PortId::from("if")));
}
