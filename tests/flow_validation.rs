// tests/flow_validation.rs

mod common;
use crate::common::*;

use remoteflow::errors::RemoteflowError;
use remoteflow::flow::{Argument, Flow, JobNode, OutputReference};

#[test]
fn valid_chain_validates() {
    let flow = add_chain("chain");
    assert!(flow.validate().is_ok());
    assert_eq!(flow.job_ids(), vec!["a".to_string(), "b".to_string()]);
}

#[test]
fn add_job_rejects_duplicate_id() {
    let mut flow = Flow::new("dup");
    flow.add_job(add_job("a", vec![lit(1)])).unwrap();

    let err = flow.add_job(add_job("a", vec![lit(2)])).unwrap_err();
    assert!(matches!(err, RemoteflowError::DuplicateId(ref id) if id == "a"));
    assert!(err.is_validation());
}

#[test]
fn duplicate_across_nested_flow_is_rejected() {
    let mut outer = Flow::new("outer");
    outer.add_job(add_job("a", vec![lit(1)])).unwrap();

    let mut inner = Flow::new("inner");
    inner.add_job(add_job("a", vec![lit(2)])).unwrap();

    assert!(matches!(
        outer.add_flow(inner),
        Err(RemoteflowError::DuplicateId(_))
    ));
}

#[test]
fn reference_to_missing_job_is_dangling() {
    let flow = flow_of("dangling", vec![add_job("b", vec![out("ghost")])]);

    match flow.validate() {
        Err(RemoteflowError::DanglingReference {
            consumer, producer, ..
        }) => {
            assert_eq!(consumer, "b");
            assert_eq!(producer, "ghost");
        }
        other => panic!("expected DanglingReference, got {other:?}"),
    }
}

#[test]
fn reference_to_undeclared_slot_is_dangling() {
    let producer = add_job("a", vec![lit(1)]);
    let consumer = add_job(
        "b",
        vec![Argument::Pending(OutputReference::new("a", "energy"))],
    );
    let flow = flow_of("slots", vec![producer, consumer]);

    assert!(matches!(
        flow.validate(),
        Err(RemoteflowError::DanglingReference { ref slot, .. }) if slot == "energy"
    ));
}

#[test]
fn cycle_is_reported_with_its_members() {
    let flow = flow_of(
        "cycle",
        vec![
            add_job("a", vec![out("c")]),
            add_job("b", vec![out("a")]),
            add_job("c", vec![out("b")]),
            add_job("free", vec![lit(1)]),
        ],
    );

    match flow.validate() {
        Err(RemoteflowError::Cycle { cycle }) => {
            assert_eq!(cycle.first(), cycle.last());
            for id in ["a", "b", "c"] {
                assert!(cycle.iter().any(|j| j == id), "{id} missing from {cycle:?}");
            }
            assert!(!cycle.iter().any(|j| j == "free"));
        }
        other => panic!("expected Cycle, got {other:?}"),
    }
}

#[test]
fn self_reference_is_a_cycle() {
    let flow = flow_of("self", vec![add_job("a", vec![out("a")])]);
    assert!(matches!(flow.validate(), Err(RemoteflowError::Cycle { .. })));
}

#[test]
fn nested_flows_flatten_in_declaration_order() {
    let mut inner = Flow::new("inner");
    inner.add_job(add_job("b", vec![out("a")])).unwrap();
    inner.add_job(add_job("c", vec![out("b")])).unwrap();

    let mut outer = Flow::new("outer");
    outer.add_job(add_job("a", vec![lit(1)])).unwrap();
    outer.add_flow(inner).unwrap();
    outer.add_job(add_job("d", vec![out("c")])).unwrap();

    assert_eq!(outer.len(), 4);
    assert_eq!(outer.job_ids(), vec!["a", "b", "c", "d"]);
    assert!(outer.validate().is_ok());
}

#[test]
fn update_metadata_reaches_every_job() {
    let mut inner = Flow::new("inner");
    inner
        .add_job(add_job("b", vec![lit(1)]).with_metadata("owner", "alice"))
        .unwrap();

    let mut flow = Flow::new("outer");
    flow.add_job(add_job("a", vec![lit(1)])).unwrap();
    flow.add_flow(inner).unwrap();

    flow.update_metadata([("test", "add")]);

    assert_eq!(flow.metadata.get("test").map(String::as_str), Some("add"));
    for job in flow.jobs() {
        assert_eq!(job.metadata.get("test").map(String::as_str), Some("add"));
    }
    let b = flow.job("b").unwrap();
    assert_eq!(b.metadata.get("owner").map(String::as_str), Some("alice"));
}

#[test]
fn new_job_gets_default_output_and_short_name() {
    let job = JobNode::new("examples.maths.add");
    assert_eq!(job.name, "add");
    assert_eq!(job.outputs, vec!["output"]);
    assert_eq!(job.output(), OutputReference::new(job.id.clone(), "output"));
    assert!(!job.id.is_empty());
}

#[test]
fn producers_are_distinct_and_ordered() {
    let job = add_job("c", vec![out("b"), out("a"), out("b")]).kwarg("x", out("a"));
    assert_eq!(job.producers(), vec!["b", "a"]);
}

#[test]
fn flow_survives_json_round_trip() {
    let mut flow = diamond("json");
    flow.update_metadata([("project", "demo")]);

    let text = serde_json::to_string(&flow).unwrap();
    let back: Flow = serde_json::from_str(&text).unwrap();
    assert_eq!(back, flow);
}
