//! End-to-end tests driving `WorkflowEngine` against a scripted stand-in for
//! the external LLM CLI (`fake_worker`, a sibling binary under `src/bin/`).
//! Each test points `ORCHESTRATOR_WORKER_BINARY`/`FAKE_WORKER_SCRIPT` at a
//! private queue file keyed by model name, so the worker/planner/supervisor
//! clients (each configured with a distinct model) each get their own
//! scripted reply sequence from one process-wide env var pair.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::{json, Value};

use coordination::config::ModelsConfig;
use coordination::data_model::Goal;
use coordination::worker_client::{WorkerClient, WorkerClientConfig};
use coordination::{OrchestratorConfig, WorkflowEngine, WorkflowStatus};

/// `std::env::set_var` is process-global; serialize every test that touches
/// `ORCHESTRATOR_WORKER_BINARY`/`FAKE_WORKER_SCRIPT` against the others.
static ENV_LOCK: Mutex<()> = Mutex::new(());

fn fake_worker_path() -> String {
    env!("CARGO_BIN_EXE_fake_worker").to_string()
}

/// Writes `queues` (model name -> ordered reply list) to a fresh script file
/// and points the fake worker's env vars at it and the fake binary. Caller
/// must hold `ENV_LOCK` for the duration of the test.
fn install_script(dir: &std::path::Path, queues: HashMap<&str, Vec<Value>>) {
    let script_path = dir.join("script.json");
    std::fs::write(&script_path, serde_json::to_string(&queues).unwrap()).unwrap();
    std::env::set_var("ORCHESTRATOR_WORKER_BINARY", fake_worker_path());
    std::env::set_var("FAKE_WORKER_SCRIPT", &script_path);
}

fn models(worker: &str, planner: &str, supervisor: &str) -> ModelsConfig {
    ModelsConfig {
        worker: worker.to_string(),
        worker_fallback: None,
        supervisor: supervisor.to_string(),
        supervisor_fallback: None,
        planner: planner.to_string(),
        planner_fallback: None,
    }
}

/// A config tuned so the whole run finishes in well under a second: no
/// adaptive backoff between iterations, and verification limited to the
/// worker self-report gate (no real build/test commands in a scratch dir).
fn fast_config(models: ModelsConfig) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.models = models;
    config.iteration_delay.adaptive = false;
    config.iteration_delay.default_ms = 1;
    config.iteration_delay.minimum_ms = 1;
    config.verification.require_artifacts = false;
    config.verification.run_tests = false;
    config
}

fn reply(text: &str) -> Value {
    json!({"result": text})
}

fn supervisor_reply(action: &str, progressing: bool) -> Value {
    reply(&format!(
        "RELEVANT: yes\nPRODUCTIVE: yes\nPROGRESSING: {}\nSCORE: 80\nACTION: {}\nREASON: scripted assessment",
        if progressing { "yes" } else { "no" },
        action
    ))
}

/// A scripted reply to `Supervisor::verify_step_completion`.
fn step_verified_reply(verified: bool) -> Value {
    reply(&format!(
        "VERIFIED: {}\nREASON: scripted step verification",
        if verified { "yes" } else { "no" }
    ))
}

/// A scripted reply to `Supervisor::verify_goal_achieved`.
fn goal_verdict_reply(achieved: bool) -> Value {
    reply(&format!(
        "ACHIEVED: {a}\nCONFIDENCE: 90\nFUNCTIONAL: {a}\nRECOMMENDATION: scripted verdict\nGAPS: none",
        a = if achieved { "yes" } else { "no" }
    ))
}

fn plan_json(steps: &[(&str, &[u32])]) -> Value {
    let steps: Vec<Value> = steps
        .iter()
        .map(|(description, deps)| {
            json!({
                "description": description,
                "complexity": "simple",
                "dependencies": deps,
                "verification_criteria": [],
            })
        })
        .collect();
    reply(&json!({"steps": steps}).to_string())
}

#[tokio::test]
async fn happy_path_completes_a_single_step_goal() {
    let _guard = ENV_LOCK.lock().unwrap();
    let script_dir = tempfile::tempdir().unwrap();
    let work_dir = tempfile::tempdir().unwrap();

    let queues = HashMap::from([
        ("planner-1", vec![plan_json(&[("print hello to stdout", &[])])]),
        (
            "supervisor-1",
            vec![supervisor_reply("continue", true), step_verified_reply(true), goal_verdict_reply(true)],
        ),
        (
            "worker-1",
            vec![
                reply("Task complete. Printed hello to stdout. STEP COMPLETE."),
                reply(
                    "Ran the program and it printed hello. Files changed: main.rs. \
                     Command run: cargo run. Output confirms the goal is met.",
                ),
            ],
        ),
    ]);
    install_script(script_dir.path(), queues);

    let config = fast_config(models("worker-1", "planner-1", "supervisor-1"));
    let goal = Goal::new("print hello to stdout");
    let mut engine = WorkflowEngine::new(goal, work_dir.path().to_path_buf(), Duration::from_secs(30), config);

    let report = engine.run().await.unwrap();
    assert_eq!(report.status, WorkflowStatus::Completed);
}

#[tokio::test]
async fn repeated_non_progress_escalates_to_abort() {
    let _guard = ENV_LOCK.lock().unwrap();
    let script_dir = tempfile::tempdir().unwrap();
    let work_dir = tempfile::tempdir().unwrap();

    let steps = [("grind on the step", &[] as &[u32]); 6];
    let queues = HashMap::from([
        ("planner-2", vec![plan_json(&steps)]),
        ("supervisor-2", vec![supervisor_reply("continue", false)]),
        ("worker-2", vec![reply("Making slow progress on this step, still working.")]),
    ]);
    install_script(script_dir.path(), queues);

    let config = fast_config(models("worker-2", "planner-2", "supervisor-2"));
    let goal = Goal::new("grind through six identical steps");
    let mut engine = WorkflowEngine::new(goal, work_dir.path().to_path_buf(), Duration::from_secs(30), config);

    let report = engine.run().await.unwrap();
    assert_eq!(report.status, WorkflowStatus::Aborted);
}

#[tokio::test]
async fn blocked_step_is_recovered_via_a_sub_plan() {
    let _guard = ENV_LOCK.lock().unwrap();
    let script_dir = tempfile::tempdir().unwrap();
    let work_dir = tempfile::tempdir().unwrap();

    let main_plan = plan_json(&[("implement feature a", &[]), ("implement feature b", &[1])]);
    let sub_plan = reply(
        &json!({"steps": [{
            "description": "implement feature a without the missing dependency",
            "complexity": "simple",
            "dependencies": [],
            "verification_criteria": [],
        }]})
        .to_string(),
    );

    let queues = HashMap::from([
        ("planner-3", vec![main_plan, sub_plan]),
        (
            "supervisor-3",
            vec![
                supervisor_reply("continue", true), // assess: step 1 (blocked)
                supervisor_reply("continue", true), // assess: workaround step
                step_verified_reply(true),           // verify_step_completion: workaround step
                supervisor_reply("continue", true), // assess: feature b step
                step_verified_reply(true),           // verify_step_completion: feature b step
                goal_verdict_reply(true),            // verify_goal_achieved
            ],
        ),
        (
            "worker-3",
            vec![
                reply("STEP BLOCKED: missing dependency foo, unable to proceed with feature a."),
                reply("Implemented a workaround avoiding the missing dependency. STEP COMPLETE."),
                reply("Feature b is done. STEP COMPLETE."),
                reply(
                    "Ran the build for both features and it succeeded. Files changed: a.rs, b.rs. \
                     Output confirms both are working.",
                ),
            ],
        ),
    ]);
    install_script(script_dir.path(), queues);

    let config = fast_config(models("worker-3", "planner-3", "supervisor-3"));
    let goal = Goal::new("ship feature a and feature b");
    let mut engine = WorkflowEngine::new(goal, work_dir.path().to_path_buf(), Duration::from_secs(30), config);

    let report = engine.run().await.unwrap();
    assert_eq!(report.status, WorkflowStatus::Completed);
}

#[tokio::test]
async fn verification_rejects_a_hedge_then_accepts_a_clean_report() {
    let _guard = ENV_LOCK.lock().unwrap();
    let script_dir = tempfile::tempdir().unwrap();
    let work_dir = tempfile::tempdir().unwrap();

    let queues = HashMap::from([
        ("planner-4", vec![plan_json(&[("write the changelog entry", &[])])]),
        (
            "supervisor-4",
            vec![
                supervisor_reply("continue", true), // assess: the step response
                step_verified_reply(true),           // verify_step_completion
                goal_verdict_reply(false),           // verify_goal_achieved: first (hedged) attempt
                goal_verdict_reply(true),            // verify_goal_achieved: second (clean) attempt
            ],
        ),
        (
            "worker-4",
            vec![
                reply("Task complete. Changelog entry written. STEP COMPLETE."),
                reply("Honestly this is not actually complete, I never wrote the file."),
                reply("Understood, addressing the gap now."),
                reply(
                    "Ran `cat CHANGELOG.md` and confirmed the new entry is present. \
                     Files changed: CHANGELOG.md.",
                ),
            ],
        ),
    ]);
    install_script(script_dir.path(), queues);

    let mut config = fast_config(models("worker-4", "planner-4", "supervisor-4"));
    config.verification.max_attempts = 3;
    let goal = Goal::new("write the changelog entry");
    let mut engine = WorkflowEngine::new(goal, work_dir.path().to_path_buf(), Duration::from_secs(30), config);

    let report = engine.run().await.unwrap();
    assert_eq!(report.status, WorkflowStatus::Completed);
}

#[tokio::test]
async fn time_budget_expiry_is_reported_even_before_any_iteration_runs() {
    let _guard = ENV_LOCK.lock().unwrap();
    let script_dir = tempfile::tempdir().unwrap();
    let work_dir = tempfile::tempdir().unwrap();

    // No queue entries needed: a 1ms budget is almost certainly already
    // spent by the time `run()`'s loop reaches its first expiry check.
    let queues: HashMap<&str, Vec<Value>> = HashMap::new();
    install_script(script_dir.path(), queues);

    let config = fast_config(models("worker-5", "planner-5", "supervisor-5"));
    let goal = Goal::new("a goal that never gets the chance to start");
    let mut engine = WorkflowEngine::new(goal, work_dir.path().to_path_buf(), Duration::from_millis(1), config);

    let report = engine.run().await.unwrap();
    assert_eq!(report.status, WorkflowStatus::TimeExpired);
}

#[tokio::test]
async fn transient_failure_retries_then_falls_back_to_the_secondary_model() {
    let _guard = ENV_LOCK.lock().unwrap();
    let script_dir = tempfile::tempdir().unwrap();
    let work_dir = tempfile::tempdir().unwrap();

    let queues = HashMap::from([
        ("good-model", vec![json!({"__fail_stderr": "transient network error"})]),
        ("fallback-model", vec![reply("recovered via the fallback model")]),
    ]);
    install_script(script_dir.path(), queues);

    let mut config = WorkerClientConfig::worker("good-model".to_string(), Some("fallback-model".to_string()));
    config.base_delay_ms = 1;
    let mut client = WorkerClient::new(config, work_dir.path().to_path_buf());

    let reply = client.start_session("system context", "do the thing").await.unwrap();
    assert_eq!(reply.text, "recovered via the fallback model");

    let metrics = client.metrics();
    assert_eq!(metrics.total_retries, 2);
    assert_eq!(metrics.total_fallbacks, 1);
}
