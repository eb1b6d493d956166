// tests/dag_properties.rs

mod common;
use crate::common::*;

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::Utc;
use proptest::prelude::*;
use serde_json::json;

use remoteflow::dag::{DagGraph, DependencyResolver};
use remoteflow::engine::{EngineCommand, EngineEvent, FlowRun, plan_flow};
use remoteflow::flow::{Flow, OutputMap};
use remoteflow::resources::ResourceSpec;
use remoteflow::transport::{RemoteHandle, RemoteState};
use remoteflow::types::JobStatus;

fn job_name(i: usize) -> String {
    format!("job_{i}")
}

// Strategy to generate a valid flow.
// Acyclic by construction: job N only references jobs 0..N-1.
fn flow_strategy(max_jobs: usize) -> impl Strategy<Value = Flow> {
    (1..=max_jobs).prop_flat_map(|num_jobs| {
        let deps = proptest::collection::vec(
            proptest::collection::vec(any::<usize>(), 0..3),
            num_jobs,
        );
        let priorities = proptest::collection::vec(-2i32..3, num_jobs);

        (deps, priorities).prop_map(move |(raw_deps, priorities)| {
            let jobs = raw_deps
                .into_iter()
                .zip(priorities)
                .enumerate()
                .map(|(i, (potential, priority))| {
                    let producers: BTreeSet<usize> = if i == 0 {
                        BTreeSet::new()
                    } else {
                        potential.into_iter().map(|d| d % i).collect()
                    };
                    let mut args = vec![lit(i as i64)];
                    args.extend(producers.into_iter().map(|p| out(&job_name(p))));
                    add_job(&job_name(i), args).with_priority(priority)
                })
                .collect();
            flow_of("random", jobs)
        })
    })
}

proptest! {
    #[test]
    fn generated_flows_validate(flow in flow_strategy(12)) {
        prop_assert!(flow.validate().is_ok());
    }

    #[test]
    fn submission_order_is_topological(flow in flow_strategy(12)) {
        let graph = DagGraph::from_flow(&flow);
        let order = graph.submission_order();
        prop_assert_eq!(order.len(), flow.len());

        let position: BTreeMap<&str, usize> =
            order.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        for job in flow.jobs() {
            for producer in job.producers() {
                prop_assert!(position[producer.as_str()] < position[job.id.as_str()]);
            }
        }
    }

    #[test]
    fn resolver_always_finishes(
        flow in flow_strategy(12),
        failing in proptest::collection::hash_set(0..12usize, 0..4),
    ) {
        let failing: HashSet<String> = failing.into_iter().map(job_name).collect();
        let mut resolver = DependencyResolver::new(&flow).unwrap();
        let mut executing: Vec<String> = resolver
            .collect_ready()
            .ready_ids()
            .into_iter()
            .map(str::to_string)
            .collect();
        let mut dispatched = HashSet::new();

        let mut steps = 0;
        while let Some(job) = executing.pop() {
            steps += 1;
            prop_assert!(steps <= 100, "resolver did not converge");
            prop_assert!(dispatched.insert(job.clone()), "{} became ready twice", job);

            resolver.mark_submitted(&job).unwrap();
            let step = if failing.contains(&job) {
                resolver.handle_failure(&job, "exit code 1").unwrap()
            } else {
                let outputs = OutputMap::from([("output".to_string(), json!(1))]);
                resolver.handle_completion(&job, outputs).unwrap()
            };
            executing.extend(step.ready_ids().into_iter().map(str::to_string));
        }

        prop_assert!(resolver.is_finished());
        for job in flow.jobs() {
            let status = resolver.status_of(&job.id).unwrap();
            match status {
                JobStatus::Completed => {
                    for p in job.producers() {
                        prop_assert_eq!(resolver.status_of(&p), Some(JobStatus::Completed));
                    }
                }
                JobStatus::Failed => prop_assert!(failing.contains(&job.id)),
                JobStatus::Cancelled => {
                    let blocked = job.producers().iter().any(|p| {
                        resolver.status_of(p) != Some(JobStatus::Completed)
                    });
                    prop_assert!(blocked);
                }
                other => prop_assert!(false, "{} left in {}", job.id, other),
            }
        }
    }

    #[test]
    fn flow_run_dispatches_each_job_once(
        flow in flow_strategy(10),
        duplicate_every in 1..4usize,
    ) {
        let workers = BTreeMap::from([("local_shell".to_string(), shell_worker("local_shell"))]);
        let plans = plan_flow(
            &flow,
            "local_shell",
            &ResourceSpec::new(),
            None,
            &workers,
            &BTreeMap::new(),
        )
        .unwrap();
        let mut run = FlowRun::new(&flow, plans).unwrap();

        let mut pending: Vec<String> = run
            .start(Utc::now())
            .dispatched_jobs()
            .into_iter()
            .map(str::to_string)
            .collect();
        let mut dispatch_counts: BTreeMap<String, usize> = BTreeMap::new();
        let mut n = 0;

        while let Some(job) = pending.pop() {
            n += 1;
            prop_assert!(n <= 200, "run did not converge");
            *dispatch_counts.entry(job.clone()).or_default() += 1;

            let handle = RemoteHandle::new(format!("h-{job}"));
            run.step(EngineEvent::Dispatched { job: job.clone(), handle }, Utc::now());

            let done = EngineEvent::Polled {
                job: job.clone(),
                state: RemoteState::Completed {
                    outputs: OutputMap::from([("output".to_string(), json!(1))]),
                },
            };
            let mut steps = vec![run.step(done.clone(), Utc::now())];
            if n % duplicate_every == 0 {
                // Replayed poll result.
                steps.push(run.step(done, Utc::now()));
            }

            for step in steps {
                for command in step.commands {
                    if let EngineCommand::Dispatch(orders) = command {
                        pending.extend(orders.into_iter().map(|o| o.job));
                    }
                }
            }
        }

        prop_assert!(run.is_finished());
        prop_assert!(run.snapshot().all_completed());
        prop_assert_eq!(dispatch_counts.len(), flow.len());
        prop_assert!(dispatch_counts.values().all(|&c| c == 1));
    }
}
