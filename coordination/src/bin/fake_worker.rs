//! Scripted stand-in for the external LLM CLI, used only by the integration
//! tests under `tests/`. Reads a JSON queue file (`{model: [replyJson, ...]}`)
//! named by the `FAKE_WORKER_SCRIPT` env var, pops the next reply queued for
//! the `--model` it was invoked with, and prints it as a single JSON object
//! on stdout, matching the real CLI's `--output-format json` contract.
//!
//! A queue entry of the form `{"__fail_stderr": "..."}` is a scripted
//! failure: it writes the given text to stderr and exits 1, standing in for
//! a transient child-process error so retry/fallback behavior can be tested
//! without a real network call.
//!
//! Once a model's queue is exhausted, the last entry repeats so a test that
//! undercounts iterations doesn't see a hard failure, just a stalled
//! conversation that its own assertions will catch.

use std::env;
use std::fs;

fn main() {
    let args: Vec<String> = env::args().collect();
    let model = args
        .iter()
        .position(|a| a == "--model")
        .and_then(|i| args.get(i + 1))
        .cloned()
        .unwrap_or_default();

    let script_path = env::var("FAKE_WORKER_SCRIPT").expect("FAKE_WORKER_SCRIPT must be set");
    let raw = fs::read_to_string(&script_path).expect("reading fake worker script");
    let mut script: serde_json::Value = serde_json::from_str(&raw).expect("parsing fake worker script");

    let queue = script
        .get_mut(&model)
        .and_then(|v| v.as_array_mut())
        .cloned()
        .unwrap_or_default();

    let reply = if queue.is_empty() {
        serde_json::json!({"result": "", "session_id": format!("fake-{model}")})
    } else {
        let mut remaining = queue.clone();
        let reply = remaining.remove(0);
        if let Some(arr) = script.get_mut(&model).and_then(|v| v.as_array_mut()) {
            if remaining.is_empty() {
                // keep the last entry so the next call repeats it instead of
                // falling back to an empty reply
                *arr = vec![reply.clone()];
            } else {
                *arr = remaining;
            }
        }
        reply
    };

    fs::write(&script_path, serde_json::to_string(&script).unwrap()).expect("writing fake worker script");

    if let Some(message) = reply.get("__fail_stderr").and_then(|v| v.as_str()) {
        eprintln!("{message}");
        std::process::exit(1);
    }

    let mut reply = reply;
    if reply.get("session_id").is_none() {
        reply["session_id"] = serde_json::json!(format!("fake-{model}"));
    }
    println!("{reply}");
}
