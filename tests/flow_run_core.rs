// tests/flow_run_core.rs
//
// Steps the pure per-flow state machine by hand: no transports, no tasks.

mod common;
use crate::common::*;

use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::json;

use remoteflow::engine::{CoreStep, EngineCommand, EngineEvent, FlowRun, plan_flow};
use remoteflow::flow::{Flow, OutputMap};
use remoteflow::resources::ResourceSpec;
use remoteflow::store::LogEntry;
use remoteflow::transport::{RemoteHandle, RemoteState};
use remoteflow::types::JobStatus;

fn run_for(flow: &Flow) -> FlowRun {
    let workers = BTreeMap::from([
        ("local_shell".to_string(), shell_worker("local_shell")),
        ("cluster".to_string(), batch_worker("cluster")),
    ]);
    let plans = plan_flow(
        flow,
        "local_shell",
        &ResourceSpec::new(),
        None,
        &workers,
        &BTreeMap::new(),
    )
    .unwrap();
    FlowRun::new(flow, plans).unwrap()
}

fn dispatched(event: &str, handle: &str) -> EngineEvent {
    EngineEvent::Dispatched {
        job: event.to_string(),
        handle: RemoteHandle::new(handle),
    }
}

fn completed(job: &str, value: serde_json::Value) -> EngineEvent {
    EngineEvent::Polled {
        job: job.to_string(),
        state: RemoteState::Completed {
            outputs: OutputMap::from([("output".to_string(), value)]),
        },
    }
}

fn transitions(step: &CoreStep) -> Vec<(String, JobStatus)> {
    step.log
        .iter()
        .filter_map(|e| match e {
            LogEntry::Transition(t) => Some((t.job_id.clone(), t.to)),
            _ => None,
        })
        .collect()
}

#[test]
fn start_dispatches_roots_by_priority() {
    let flow = flow_of(
        "start",
        vec![
            add_job("low", vec![lit(1)]),
            add_job("high", vec![lit(2)]).with_priority(9),
            add_job("child", vec![out("low")]),
        ],
    );
    let mut run = run_for(&flow);

    let step = run.start(Utc::now());
    assert_eq!(step.dispatched_jobs(), vec!["high", "low"]);
    assert!(!step.finished);
    assert_eq!(
        transitions(&step),
        vec![
            ("high".to_string(), JobStatus::Ready),
            ("low".to_string(), JobStatus::Ready),
        ]
    );
}

#[test]
fn dispatch_order_carries_rendered_script() {
    let mut run = run_for(&add_chain("script"));
    let step = run.start(Utc::now());

    let EngineCommand::Dispatch(orders) = &step.commands[0] else {
        panic!("expected a dispatch command, got {:?}", step.commands);
    };
    let order = &orders[0];
    assert_eq!(order.worker, "local_shell");
    assert_eq!(order.request.payload.args, vec![json!(1), json!(2)]);
    assert!(order.request.script.starts_with("#!/bin/bash\n"));
    assert!(order.request.script.contains("remoteflow-exec examples.add <<'REMOTEFLOW_INPUT'"));
}

#[test]
fn submitted_transition_records_worker_and_handle() {
    let mut run = run_for(&add_chain("record"));
    run.start(Utc::now());

    let step = run.step(dispatched("a", "h-1"), Utc::now());
    let Some(LogEntry::Transition(record)) = step.log.first() else {
        panic!("expected a transition, got {:?}", step.log);
    };
    assert_eq!(record.to, JobStatus::Submitted);
    assert_eq!(record.worker.as_deref(), Some("local_shell"));
    assert_eq!(record.remote_handle, Some(RemoteHandle::new("h-1")));

    let sub = run.records().get("a").unwrap();
    assert_eq!(sub.status, JobStatus::Submitted);
    assert_eq!(run.active_jobs()[0].handle.id, "h-1");
}

#[test]
fn completion_logs_outputs_and_dispatches_dependent() {
    let mut run = run_for(&add_chain("complete"));
    run.start(Utc::now());
    run.step(dispatched("a", "h-1"), Utc::now());

    let step = run.step(completed("a", json!(3)), Utc::now());
    assert_eq!(step.dispatched_jobs(), vec!["b"]);

    let outputs = step.log.iter().find_map(|e| match e {
        LogEntry::Transition(t) if t.to == JobStatus::Completed => t.outputs.clone(),
        _ => None,
    });
    assert_eq!(outputs.unwrap().get("output"), Some(&json!(3)));

    let history: Vec<JobStatus> = run.records()["a"].history.iter().map(|c| c.to).collect();
    assert_eq!(history, vec![JobStatus::Submitted, JobStatus::Completed]);
}

#[test]
fn repeated_poll_results_never_dispatch_twice() {
    let mut run = run_for(&add_chain("twice"));
    run.start(Utc::now());
    run.step(dispatched("a", "h-1"), Utc::now());

    let first = run.step(completed("a", json!(3)), Utc::now());
    assert_eq!(first.dispatched_jobs(), vec!["b"]);

    // A late duplicate of the same poll result.
    let second = run.step(completed("a", json!(3)), Utc::now());
    assert!(second.dispatched_jobs().is_empty());
    assert!(second.log.is_empty());

    // A second acknowledgement for the same job changes nothing either.
    let again = run.step(dispatched("a", "h-2"), Utc::now());
    assert!(again.log.is_empty());
    assert_eq!(run.records()["a"].remote_handle.id, "h-1");
}

#[test]
fn running_is_recorded_once() {
    let mut run = run_for(&add_chain("running"));
    run.start(Utc::now());
    run.step(dispatched("a", "h-1"), Utc::now());

    let running = EngineEvent::Polled {
        job: "a".to_string(),
        state: RemoteState::Running,
    };
    let step = run.step(running.clone(), Utc::now());
    assert_eq!(transitions(&step), vec![("a".to_string(), JobStatus::Running)]);

    let step = run.step(running, Utc::now());
    assert!(step.log.is_empty());
}

#[test]
fn cancel_during_dispatch_cancels_remotely_on_acknowledgement() {
    let mut run = run_for(&add_chain("race"));
    run.start(Utc::now());

    let step = run.cancel(Utc::now());
    assert_eq!(
        transitions(&step),
        vec![
            ("b".to_string(), JobStatus::Cancelled),
            ("a".to_string(), JobStatus::Cancelled),
        ]
    );
    // a's dispatch is still in flight.
    assert!(!step.finished);
    assert!(!run.is_finished());

    let step = run.step(dispatched("a", "late"), Utc::now());
    match step.commands.as_slice() {
        [EngineCommand::CancelRemote(targets)] => {
            assert_eq!(targets[0].job, "a");
            assert_eq!(targets[0].handle.id, "late");
        }
        other => panic!("expected remote cancel, got {other:?}"),
    }
    assert!(step.finished);
}

#[test]
fn cancel_requests_remote_cancel_for_active_jobs_once() {
    let mut run = run_for(&diamond("cancel"));
    run.start(Utc::now());
    run.step(dispatched("a", "h-a"), Utc::now());

    let step = run.cancel(Utc::now());
    let remote: Vec<&str> = step
        .commands
        .iter()
        .filter_map(|c| match c {
            EngineCommand::CancelRemote(t) => Some(t),
            _ => None,
        })
        .flatten()
        .map(|t| t.job.as_str())
        .collect();
    assert_eq!(remote, vec!["a"]);
    assert_eq!(run.snapshot().count(JobStatus::Cancelled), 3);

    let again = run.cancel(Utc::now());
    assert!(again.commands.is_empty());

    let ack = run.step(
        EngineEvent::CancelAcknowledged {
            job: "a".to_string(),
            confirmed: true,
        },
        Utc::now(),
    );
    assert!(ack.finished);
    assert_eq!(run.snapshot().reason_of("a"), Some("cancelled by operator"));
}

#[test]
fn failed_dispatch_fails_job_and_cancels_dependents() {
    let mut run = run_for(&add_chain("nodispatch"));
    run.start(Utc::now());

    let step = run.step(
        EngineEvent::DispatchFailed {
            job: "a".to_string(),
            error: "sbatch: error: invalid partition".to_string(),
        },
        Utc::now(),
    );
    assert_eq!(
        transitions(&step),
        vec![
            ("a".to_string(), JobStatus::Failed),
            ("b".to_string(), JobStatus::Cancelled),
        ]
    );
    assert!(step.finished);
    assert!(run.records().is_empty());
}

#[test]
fn poll_step_targets_active_jobs_only() {
    let mut run = run_for(&diamond("poll"));
    assert!(run.poll_step().commands.is_empty());

    run.start(Utc::now());
    run.step(dispatched("a", "h-a"), Utc::now());

    match run.poll_step().commands.as_slice() {
        [EngineCommand::Poll(targets)] => {
            assert_eq!(targets.len(), 1);
            assert_eq!(targets[0].job, "a");
            assert_eq!(targets[0].worker, "local_shell");
        }
        other => panic!("expected one poll command, got {other:?}"),
    }
}

#[test]
fn plans_route_jobs_to_their_worker() {
    let flow = flow_of(
        "route",
        vec![
            add_job("a", vec![lit(1)]),
            add_job("b", vec![out("a")]).on_worker("cluster"),
        ],
    );
    let run = run_for(&flow);
    assert_eq!(run.plan("a").unwrap().worker, "local_shell");
    assert_eq!(run.plan("b").unwrap().worker, "cluster");
    assert!(!run.plan("b").unwrap().directive.lines.is_empty());
}

#[test]
fn runner_command_quotes_the_callable() {
    let mut job = add_job("a", vec![lit(1)]);
    job.callable = "pkg.f; touch pwned".to_string();
    let flow = flow_of("quoted", vec![job]);
    let run = run_for(&flow);

    let plan = run.plan("a").unwrap();
    let runner = plan.runner_for(&flow.job("a").unwrap().callable);
    assert!(runner.ends_with(" 'pkg.f; touch pwned'"), "{runner}");
    assert_eq!(
        plan.runner_for("examples.add"),
        shell_worker("x").runner_command("examples.add")
    );
}
