// src/flow/validate.rs

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::errors::{RemoteflowError, Result};
use crate::flow::flow::Flow;
use crate::flow::job::JobNode;
use crate::types::JobId;

/// Validate a flow before it is resolved or submitted.
///
/// Checks, in order:
/// - job ids are unique (flows can also arrive deserialized, bypassing
///   `add_job`),
/// - every reference names a job in the flow and a slot that job declares,
/// - the induced graph is acyclic.
pub fn validate_flow(flow: &Flow) -> Result<()> {
    let jobs = flow.jobs();
    ensure_unique_ids(&jobs)?;
    ensure_references_resolve(&jobs)?;

    if let Some(cycle) = find_cycle(&jobs) {
        return Err(RemoteflowError::Cycle { cycle });
    }

    debug!(flow = %flow.name, jobs = jobs.len(), "flow validated");
    Ok(())
}

fn ensure_unique_ids(jobs: &[&JobNode]) -> Result<()> {
    let mut seen = HashSet::new();
    for job in jobs {
        if !seen.insert(job.id.as_str()) {
            return Err(RemoteflowError::DuplicateId(job.id.clone()));
        }
    }
    Ok(())
}

fn ensure_references_resolve(jobs: &[&JobNode]) -> Result<()> {
    let by_id: HashMap<&str, &JobNode> = jobs.iter().map(|j| (j.id.as_str(), *j)).collect();

    for job in jobs {
        for r in job.references() {
            let declared = by_id
                .get(r.producer.as_str())
                .is_some_and(|producer| producer.declares_output(&r.slot));
            if !declared {
                return Err(RemoteflowError::DanglingReference {
                    consumer: job.id.clone(),
                    producer: r.producer.clone(),
                    slot: r.slot.clone(),
                });
            }
        }
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

/// Depth-first search with a recursion stack, following edges from producer
/// to consumer.
///
/// Returns the full cycle with its first job repeated at the end
/// (`[a, b, c, a]`), or `None` for a DAG. References to jobs outside `jobs`
/// are ignored.
pub fn find_cycle(jobs: &[&JobNode]) -> Option<Vec<JobId>> {
    let index: HashMap<&str, usize> = jobs
        .iter()
        .enumerate()
        .map(|(i, j)| (j.id.as_str(), i))
        .collect();

    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); jobs.len()];
    for (consumer, job) in jobs.iter().enumerate() {
        for producer in job.producers() {
            if let Some(&p) = index.get(producer.as_str()) {
                dependents[p].push(consumer);
            }
        }
    }

    let mut marks = vec![Mark::Unvisited; jobs.len()];

    for start in 0..jobs.len() {
        if marks[start] != Mark::Unvisited {
            continue;
        }

        // (node, index of the next dependent to visit)
        let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
        marks[start] = Mark::OnStack;

        while let Some(top) = stack.last_mut() {
            let node = top.0;
            if top.1 < dependents[node].len() {
                let next = dependents[node][top.1];
                top.1 += 1;

                match marks[next] {
                    Mark::Unvisited => {
                        marks[next] = Mark::OnStack;
                        stack.push((next, 0));
                    }
                    Mark::OnStack => {
                        let from = stack.iter().position(|(n, _)| *n == next).unwrap_or(0);
                        let mut cycle: Vec<JobId> = stack[from..]
                            .iter()
                            .map(|(n, _)| jobs[*n].id.clone())
                            .collect();
                        cycle.push(jobs[next].id.clone());
                        return Some(cycle);
                    }
                    Mark::Done => {}
                }
            } else {
                marks[node] = Mark::Done;
                stack.pop();
            }
        }
    }

    None
}
