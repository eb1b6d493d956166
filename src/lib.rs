// src/lib.rs

pub mod cli;
pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod flow;
pub mod fs;
pub mod logging;
pub mod resources;
pub mod store;
pub mod translate;
pub mod transport;
pub mod types;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, info, warn};

use crate::cli::CliArgs;
use crate::config::{ConfigFile, LoadedFlow, load_and_validate, load_flow_file};
use crate::dag::DagGraph;
use crate::engine::{EngineOptions, FlowStatus, SubmissionEngine, SubmissionHandle};
use crate::resources::ResourceSpec;
use crate::store::FileStore;
use crate::transport::JobPayload;
use crate::types::JobStatus;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config and flow file loading
/// - engine construction (workers, environments, transition log)
/// - submission or resumption of one flow
/// - Ctrl-C handling (cancels the flow)
///
/// Fails when the flow ends with any job not `COMPLETED`.
pub async fn run(args: CliArgs) -> Result<()> {
    let cfg = load_and_validate(&args.config)
        .with_context(|| format!("loading config {}", args.config))?;

    let state_file = args
        .state
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| cfg.engine.state_file.clone());
    let engine = build_engine(&cfg, state_file);

    let handle = match &args.resume {
        Some(flow_id) => engine.resume(flow_id).await?,
        None => {
            let path = args
                .flow
                .as_ref()
                .ok_or_else(|| anyhow!("--flow is required unless --resume is given"))?;
            let loaded = load_flow_file(path).with_context(|| format!("loading flow {path}"))?;
            let submission = Submission::resolve(&args, &cfg, loaded)?;

            if args.dry_run {
                print_dry_run(&engine, &submission)?;
                return Ok(());
            }

            engine
                .submit(
                    submission.flow,
                    &submission.worker,
                    Some(submission.resources),
                    submission.exec_config.as_deref(),
                )
                .await?
        }
    };

    // Ctrl-C → cancel the flow; `wait` returns once cancellation settles.
    {
        let engine = engine.clone();
        let handle = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("failed to listen for Ctrl+C: {e}");
                return;
            }
            warn!(flow = %handle, "interrupted; cancelling flow");
            if let Err(e) = engine.cancel(&handle).await {
                eprintln!("failed to cancel flow {handle}: {e}");
            }
        });
    }

    info!(flow = %handle, "waiting for flow to finish");
    let status = engine.wait(&handle).await?;
    print_status(&status);

    if !status.all_completed() {
        bail!(
            "flow {} finished with {} failed and {} cancelled job(s)",
            status.flow_id,
            status.count(JobStatus::Failed),
            status.count(JobStatus::Cancelled)
        );
    }
    Ok(())
}

/// Engine with every configured worker and environment, logging to
/// `state_file`.
pub fn build_engine(cfg: &ConfigFile, state_file: PathBuf) -> SubmissionEngine {
    let mut builder = SubmissionEngine::builder(EngineOptions::from(&cfg.engine))
        .store(Arc::new(FileStore::new(state_file)));
    for profile in cfg.workers.values() {
        builder = builder.worker(profile.clone());
    }
    for exec_config in cfg.exec_configs.values() {
        builder = builder.exec_config(exec_config.clone());
    }
    builder.build()
}

/// Submission parameters after applying CLI overrides to the flow file.
#[derive(Debug)]
struct Submission {
    flow: crate::flow::Flow,
    worker: String,
    resources: ResourceSpec,
    exec_config: Option<String>,
}

impl Submission {
    fn resolve(args: &CliArgs, cfg: &ConfigFile, loaded: LoadedFlow) -> Result<Self> {
        let worker = match args.worker.clone().or(loaded.worker) {
            Some(worker) => worker,
            None => cfg
                .sole_worker()
                .map(|w| w.name.clone())
                .ok_or_else(|| anyhow!("several workers configured; pick one with --worker"))?,
        };

        let resources = match &args.resources {
            Some(text) => ResourceSpec::from_str(text)?.merged_over(&loaded.resources),
            None => loaded.resources,
        };

        Ok(Self {
            flow: loaded.flow,
            worker,
            resources,
            exec_config: args.exec_config.clone().or(loaded.exec_config),
        })
    }
}

/// Print the script of every job in submission order. Inputs that come from
/// other jobs are shown as references.
fn print_dry_run(engine: &SubmissionEngine, submission: &Submission) -> Result<()> {
    let flow = &submission.flow;
    let plans = engine.plan(
        flow,
        &submission.worker,
        &submission.resources,
        submission.exec_config.as_deref(),
    )?;
    let graph = DagGraph::from_flow(flow);

    println!("remoteflow dry-run");
    println!("  flow = {} ({})", flow.name, flow.id);
    println!("  worker = {}", submission.worker);
    if let Some(env) = &submission.exec_config {
        println!("  exec_config = {env}");
    }
    println!();

    for id in graph.submission_order() {
        let (Some(job), Some(plan)) = (flow.job(id), plans.get(id)) else {
            continue;
        };
        let deps = graph.dependencies_of(id);
        println!("# ---- job {id} on {} ----", plan.worker);
        if !deps.is_empty() {
            println!("# after: {}", deps.join(", "));
        }
        let script = plan.render(&JobPayload::preview(&flow.id, job))?;
        println!("{script}");
    }

    debug!("dry-run complete (nothing dispatched)");
    Ok(())
}

fn print_status(status: &FlowStatus) {
    println!("flow {} ({})", status.name, SubmissionHandle::new(status.flow_id.clone()));
    for job in &status.jobs {
        match &job.reason {
            Some(reason) => println!("  {:<24} {:<10} {reason}", job.id, job.status.to_string()),
            None => println!("  {:<24} {}", job.id, job.status),
        }
    }
}
