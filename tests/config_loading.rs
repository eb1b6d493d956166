// tests/config_loading.rs

mod common;
use crate::common::*;

use std::io::Write;
use std::time::Duration;

use serde_json::json;
use tempfile::NamedTempFile;

use remoteflow::config::{load_and_validate, load_flow_file, parse_flow};
use remoteflow::engine::EngineOptions;
use remoteflow::errors::RemoteflowError;
use remoteflow::flow::{Argument, OutputReference};
use remoteflow::resources::WallTime;
use remoteflow::types::SchedulerFamily;

fn config_file(text: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{text}").unwrap();
    file
}

fn expect_config_error(text: &str, needle: &str) {
    match load_and_validate(config_file(text).path()) {
        Err(RemoteflowError::ConfigError(msg)) => {
            assert!(msg.contains(needle), "{msg:?} should mention {needle:?}");
        }
        Err(e) => panic!("Expected ConfigError, got: {:?}", e),
        Ok(_) => panic!("Expected error, got Ok"),
    }
}

#[test]
fn full_config_is_validated() {
    init_tracing();
    let file = config_file(
        r#"
[engine]
poll_interval = "250ms"
state_file = "/tmp/flows.jsonl"

[engine.retry]
max_attempts = 5
initial_backoff = "100ms"
max_backoff = "2s"
call_timeout = "10s"

[worker.cluster]
scheduler = "slurm"
host = "login.hpc.example.org"
user = "alice"
work_dir = "/scratch/alice/flows"
default_exec_config = "qe"

[worker.cluster.resources]
nodes = 1
time = "00:20:00"
partition = "debug"
exclusive = true

[worker.box]
scheduler = "shell"
runner = "python -m runner {callable}"

[exec_config.qe]
modules = ["qe/7.2"]
export = { OMP_PROC_BIND = "close" }
pre_run = ["ulimit -s unlimited"]
"#,
    );

    let cfg = load_and_validate(file.path()).unwrap();

    assert_eq!(cfg.engine.poll_interval, Duration::from_millis(250));
    assert_eq!(cfg.engine.retry.max_attempts, 5);
    assert_eq!(cfg.engine.retry.call_timeout, Duration::from_secs(10));

    let options = EngineOptions::from(&cfg.engine);
    assert_eq!(options.poll_interval, Duration::from_millis(250));
    assert_eq!(options.retry.max_backoff, Duration::from_secs(2));

    let cluster = cfg.worker("cluster").unwrap();
    assert_eq!(cluster.family, SchedulerFamily::BatchQueue);
    assert_eq!(cluster.ssh_target().as_deref(), Some("alice@login.hpc.example.org"));
    assert_eq!(cluster.default_resources.nodes, Some(1));
    assert_eq!(cluster.default_resources.time, Some(WallTime::from_minutes(20)));
    assert_eq!(
        cluster.default_resources.extensions.get("exclusive").map(String::as_str),
        Some("true")
    );
    assert_eq!(cluster.default_exec_config.as_deref(), Some("qe"));

    let shell = cfg.worker("box").unwrap();
    assert_eq!(shell.family, SchedulerFamily::InteractiveShell);
    assert_eq!(shell.runner_command("pkg.f"), "python -m runner pkg.f");
    assert!(cfg.sole_worker().is_none());

    let qe = &cfg.exec_configs["qe"];
    assert_eq!(
        qe.setup_lines(),
        vec![
            "module purge",
            "module load qe/7.2",
            "export OMP_PROC_BIND=close",
            "ulimit -s unlimited",
        ]
    );
}

#[test]
fn minimal_config_uses_defaults() {
    let cfg = load_and_validate(config_file("[worker.laptop]\n").path()).unwrap();

    assert_eq!(cfg.engine.poll_interval, Duration::from_secs(5));
    assert_eq!(cfg.engine.retry.max_attempts, 3);
    let laptop = cfg.sole_worker().unwrap();
    assert_eq!(laptop.family, SchedulerFamily::Local);
    assert!(laptop.ssh_target().is_none());
}

#[test]
fn config_without_workers_is_rejected() {
    expect_config_error("[engine]\npoll_interval = \"1s\"\n", "at least one [worker.<name>]");
}

#[test]
fn bad_durations_are_rejected() {
    expect_config_error(
        "[engine]\npoll_interval = \"5 parsecs\"\n[worker.a]\n",
        "[engine].poll_interval",
    );
    expect_config_error("[engine]\npoll_interval = \"0s\"\n[worker.a]\n", "greater than zero");
    expect_config_error(
        "[engine.retry]\ninitial_backoff = \"1m\"\nmax_backoff = \"1s\"\n[worker.a]\n",
        "must not exceed max_backoff",
    );
    expect_config_error("[engine.retry]\nmax_attempts = 0\n[worker.a]\n", "max_attempts");
    expect_config_error(
        "[engine]\npoll_interval = \"9999999999999999999h\"\n[worker.a]\n",
        "out of range",
    );
}

#[test]
fn unknown_default_exec_config_is_rejected() {
    expect_config_error(
        "[worker.a]\ndefault_exec_config = \"missing\"\n",
        "unknown default_exec_config 'missing'",
    );
}

#[test]
fn user_without_host_is_rejected() {
    expect_config_error("[worker.a]\nuser = \"bob\"\n", "sets user but no host");
}

#[test]
fn invalid_worker_resources_are_rejected() {
    expect_config_error("[worker.a.resources]\nnodes = 0\n", "[worker.a.resources]");
    expect_config_error("[worker.a.resources]\ntime = \"soon\"\n", "[worker.a.resources]");
}

#[test]
fn unknown_scheduler_family_fails_to_parse() {
    let result = load_and_validate(config_file("[worker.a]\nscheduler = \"pbs\"\n").path());
    assert!(matches!(result, Err(RemoteflowError::TomlError(_))));
}

#[test]
fn flow_file_builds_references_and_overrides() {
    let loaded = parse_flow(
        r#"
[flow]
name = "relax-then-scf"
id = "flow-42"
worker = "cluster"
exec_config = "qe"
metadata = { project = "silicon" }

[flow.resources]
time = "01:00:00"

[[job]]
id = "relax"
callable = "qe.relax"
args = ["Si", 5.43]
outputs = ["structure", "energy"]
priority = 5

[[job]]
id = "scf"
callable = "qe.scf"
args = [{ ref = "relax", slot = "structure" }]
kwargs = { ecut = 40, previous = { ref = "relax", slot = "energy" } }
worker = "box"

[job.resources]
cpus_per_task = 4
"#,
    )
    .unwrap();

    assert_eq!(loaded.worker.as_deref(), Some("cluster"));
    assert_eq!(loaded.exec_config.as_deref(), Some("qe"));
    assert_eq!(loaded.resources.time, Some(WallTime::from_secs(3_600)));

    let flow = &loaded.flow;
    assert_eq!(flow.id, "flow-42");
    assert_eq!(flow.metadata.get("project").map(String::as_str), Some("silicon"));

    let relax = flow.job("relax").unwrap();
    assert_eq!(relax.name, "relax");
    assert_eq!(relax.priority, 5);
    assert_eq!(
        relax.args,
        vec![
            Argument::Concrete(json!("Si")),
            Argument::Concrete(json!(5.43)),
        ]
    );
    assert_eq!(relax.metadata.get("project").map(String::as_str), Some("silicon"));

    let scf = flow.job("scf").unwrap();
    assert_eq!(
        scf.args,
        vec![Argument::Pending(OutputReference::new("relax", "structure"))]
    );
    assert_eq!(scf.kwargs.get("ecut"), Some(&Argument::Concrete(json!(40))));
    assert_eq!(
        scf.kwargs.get("previous"),
        Some(&Argument::Pending(OutputReference::new("relax", "energy")))
    );
    assert_eq!(scf.worker.as_deref(), Some("box"));
    assert_eq!(scf.resources.as_ref().and_then(|r| r.cpus_per_task), Some(4));
    assert_eq!(scf.producers(), vec!["relax"]);
}

#[test]
fn flow_file_with_cycle_is_rejected() {
    let result = parse_flow(
        r#"
[flow]
name = "loop"

[[job]]
id = "a"
callable = "f"
args = [{ ref = "b" }]

[[job]]
id = "b"
callable = "f"
args = [{ ref = "a" }]
"#,
    );
    assert!(matches!(result, Err(RemoteflowError::Cycle { .. })));
}

#[test]
fn flow_file_with_dangling_slot_is_rejected() {
    let result = parse_flow(
        r#"
[flow]
name = "dangling"

[[job]]
id = "a"
callable = "f"

[[job]]
id = "b"
callable = "f"
args = [{ ref = "a", slot = "missing" }]
"#,
    );
    match result {
        Err(RemoteflowError::DanglingReference { consumer, slot, .. }) => {
            assert_eq!(consumer, "b");
            assert_eq!(slot, "missing");
        }
        other => panic!("Expected DanglingReference, got: {:?}", other.map(|l| l.flow.id)),
    }
}

#[test]
fn flow_file_with_duplicate_ids_is_rejected() {
    let result = parse_flow(
        "[flow]\nname = \"dup\"\n[[job]]\nid = \"a\"\ncallable = \"f\"\n[[job]]\nid = \"a\"\ncallable = \"g\"\n",
    );
    assert!(matches!(result, Err(RemoteflowError::DuplicateId(id)) if id == "a"));
}

#[test]
fn flow_file_loads_from_disk() {
    let file = config_file(
        "[flow]\nname = \"disk\"\n[[job]]\nid = \"a\"\ncallable = \"examples.add\"\nargs = [1, 2]\n",
    );
    let loaded = load_flow_file(file.path()).unwrap();
    assert_eq!(loaded.flow.name, "disk");
    assert_eq!(loaded.flow.len(), 1);
    assert!(loaded.worker.is_none());
}
