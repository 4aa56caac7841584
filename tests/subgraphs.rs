use serde_json::json;

use weft_core::event::ProcessEvent;
use weft_core::graph::Graph;
use weft_core::types::GraphId;
use weft_core::value::DataValue;
use weft_core::WeftError;
use weft_engine::GraphProcessor;
use weft_test_utils::{collect_events, events_for, project_of, test_registry, GraphBuilder};

/// `sub`: graph-input `q` -> "{{x}}?" -> graph-output `a`.
fn question_graph() -> Graph {
    let mut builder = GraphBuilder::new("sub");
    let input = builder.node("graph-input", "In", json!({ "id": "q" }));
    let text = builder.node("text", "Ask", json!({ "text": "{{x}}?" }));
    let out = builder.node("graph-output", "Out", json!({ "id": "a" }));
    builder
        .connect(&input, "data", &text, "x")
        .connect(&text, "output", &out, "value");
    builder.build()
}

fn calling_graph(name: &str, target: &str) -> Graph {
    let mut builder = GraphBuilder::new(name);
    builder.node("subgraph", &format!("Call {target}"), json!({ "graph_id": target }));
    builder.build()
}

/// `(graph, depth)` of every `graphStart`, in order.
fn graph_starts(events: &[ProcessEvent]) -> Vec<(String, usize)> {
    events
        .iter()
        .filter_map(|e| match e {
            ProcessEvent::GraphStart { graph_id, depth, .. } => Some((graph_id.to_string(), *depth)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_subgraph_node_runs_referenced_graph() {
    let mut builder = GraphBuilder::new("main");
    let value = builder.node("test-value", "Value", json!({ "value": "hi" }));
    let call = builder.node("subgraph", "Call", json!({ "graph_id": "sub" }));
    let out = builder.node("graph-output", "Answer", json!({ "id": "answer" }));
    builder
        .connect(&value, "value", &call, "q")
        .connect(&call, "a", &out, "value");
    let project = project_of([builder.build(), question_graph()]);

    let processor = GraphProcessor::new(project, GraphId::from("main"), test_registry());
    let events = processor.events();
    let outputs = processor.run().await.unwrap();
    let events = collect_events(events).await;

    assert_eq!(outputs["answer"], DataValue::string("hi?"));
    assert_eq!(graph_starts(&events), vec![("main".to_string(), 0), ("sub".to_string(), 1)]);

    let finishes = events.iter().filter(|e| e.name() == "graphFinish").count();
    assert_eq!(finishes, 2);
}

#[tokio::test]
async fn test_graph_calling_itself_is_rejected() {
    let project = project_of([calling_graph("loop", "loop")]);
    let processor = GraphProcessor::new(project, GraphId::from("loop"), test_registry());

    let events = processor.events();
    let err = processor.run().await.unwrap_err();
    let events = collect_events(events).await;

    assert!(matches!(err, WeftError::CyclicGraphReference { ref graph_id, .. } if graph_id.as_str() == "loop"));
    assert_eq!(graph_starts(&events), vec![("loop".to_string(), 0)]);
    assert_eq!(events_for(&events, "nodeStart", "Call loop").len(), 1);
}

#[tokio::test]
async fn test_indirect_graph_cycle_is_rejected() {
    let project = project_of([calling_graph("a", "b"), calling_graph("b", "a")]);
    let processor = GraphProcessor::new(project, GraphId::from("a"), test_registry());

    let events = processor.events();
    let err = processor.run().await.unwrap_err();
    let events = collect_events(events).await;

    assert_eq!(graph_starts(&events), vec![("a".to_string(), 0), ("b".to_string(), 1)]);
    assert_eq!(events_for(&events, "nodeStart", "Call b").len(), 1);
    assert_eq!(events_for(&events, "nodeStart", "Call a").len(), 1);
    match err {
        WeftError::CyclicGraphReference { graph_id, stack } => {
            assert_eq!(graph_id, GraphId::from("a"));
            assert_eq!(stack, vec![GraphId::from("a"), GraphId::from("b")]);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_call_graph_by_name_with_object_inputs() {
    let mut builder = GraphBuilder::new("main");
    let name = builder.node("test-value", "Name", json!({ "value": "sub" }));
    let inputs = builder.node("test-value", "Inputs", json!({ "value": { "q": "yo" } }));
    let call = builder.node("call-graph", "Call", json!({}));
    let out = builder.node("graph-output", "Result", json!({ "id": "res", "data_type": "object" }));
    builder
        .connect(&name, "value", &call, "graph")
        .connect(&inputs, "value", &call, "inputs")
        .connect(&call, "outputs", &out, "value");
    let project = project_of([builder.build(), question_graph()]);

    let processor = GraphProcessor::new(project, GraphId::from("main"), test_registry());
    let outputs = processor.run().await.unwrap();
    assert_eq!(outputs["res"].to_json()["a"], json!({ "type": "string", "value": "yo?" }));
}

#[tokio::test]
async fn test_call_graph_unknown_target_fails() {
    let mut builder = GraphBuilder::new("main");
    let name = builder.node("test-value", "Name", json!({ "value": "nowhere" }));
    let call = builder.node("call-graph", "Call", json!({}));
    builder.connect(&name, "value", &call, "graph");
    let (project, graph_id) = builder.into_project();

    let processor = GraphProcessor::new(project, graph_id, test_registry());
    let err = processor.run().await.unwrap_err();
    assert!(matches!(err, WeftError::GraphNotFound(ref name) if name == "nowhere"));
}
