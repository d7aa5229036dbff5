//! Integration tests for the stale sweep.
//!
//! Sessions registered with an unused pid are probed dead; sessions
//! registered without `--pid` belong to this (live) test process.

mod common;

use common::TestEnv;
use std::thread;
use std::time::Duration;

/// Larger than any Linux pid_max, still a valid i32.
const DEAD_PID: &str = "2147483646";

fn register_dead(env: &TestEnv, name: &str) -> String {
    let agent = env.json(&["agent", "register", name, "--pid", DEAD_PID]);
    agent["session_id"].as_str().unwrap().to_string()
}

fn wait_past_threshold() {
    thread::sleep(Duration::from_millis(1500));
}

#[test]
fn test_sweep_reclaims_dead_session() {
    let env = TestEnv::new();
    let dead = register_dead(&env, "crashed");
    env.json(&["work", "create", "w1", "Abandoned", "--claim-as", &dead]);
    wait_past_threshold();

    let report = env.json(&["sweep", "--stale-threshold-secs", "1"]);
    assert_eq!(report["dry_run"], false);
    assert_eq!(report["stale"].as_array().unwrap().len(), 1);
    assert_eq!(report["stale"][0]["session_id"], dead.as_str());
    assert_eq!(report["stale"][0]["released_items"][0], "w1");

    let item = env.json(&["work", "show", "w1"])["item"].clone();
    assert_eq!(item["status"], "available");
    assert!(item["claimed_by"].is_null());

    let agent = env.json(&["agent", "show", &dead])["agent"].clone();
    assert_eq!(agent["status"], "stale");

    let events = env.json(&["events", "--target", &dead, "--type", "agent_stale"]);
    assert_eq!(events["events"].as_array().unwrap().len(), 1);
}

#[test]
fn test_sweep_spares_live_process() {
    let env = TestEnv::new();
    let alive = env.register("busy-thinking");
    wait_past_threshold();

    let report = env.json(&["sweep", "--stale-threshold-secs", "1"]);
    assert!(report["stale"].as_array().unwrap().is_empty());
    assert_eq!(report["verified_alive"][0], alive.as_str());

    let agent = env.json(&["agent", "show", &alive])["agent"].clone();
    assert_eq!(agent["status"], "active");
}

#[test]
fn test_dry_run_changes_nothing() {
    let env = TestEnv::new();
    let dead = register_dead(&env, "crashed");
    wait_past_threshold();

    let report = env.json(&["sweep", "--dry-run", "--stale-threshold-secs", "1"]);
    assert_eq!(report["dry_run"], true);
    assert_eq!(report["candidates"][0]["session_id"], dead.as_str());
    assert_eq!(report["candidates"][0]["liveness"], "dead");
    assert!(report["stale"].as_array().unwrap().is_empty());

    let agent = env.json(&["agent", "show", &dead, "--no-auto-sweep"])["agent"].clone();
    assert_eq!(agent["status"], "active");
}

#[test]
fn test_auto_sweep_runs_before_commands() {
    let env = TestEnv::new();
    let dead = register_dead(&env, "crashed");
    env.json(&["work", "create", "w1", "Abandoned", "--claim-as", &dead]);
    wait_past_threshold();

    // Disabled: the claim survives.
    let held = env.json(&[
        "work",
        "list",
        "--status",
        "claimed",
        "--no-auto-sweep",
        "--stale-threshold-secs",
        "1",
    ]);
    assert_eq!(held["count"], 1);

    // Enabled: any state-changing entry point reclaims first.
    let taker = env.json(&["agent", "register", "taker", "--stale-threshold-secs", "1"]);
    let session = taker["session_id"].as_str().unwrap();
    let claim = env.json(&["work", "claim", "w1", "--session", session]);
    assert_eq!(claim["claimed"], true);
}

#[test]
fn test_auto_sweep_disabled_by_env() {
    let env = TestEnv::new();
    let dead = register_dead(&env, "crashed");
    wait_past_threshold();

    env.muster()
        .env("MUSTER_AUTO_SWEEP", "false")
        .env("MUSTER_STALE_THRESHOLD_SECS", "1")
        .args(["agent", "list"])
        .assert()
        .success();

    let agent = env.json(&["agent", "show", &dead, "--no-auto-sweep"])["agent"].clone();
    assert_eq!(agent["status"], "active");
}

#[test]
fn test_sweep_human_output() {
    let env = TestEnv::new();
    register_dead(&env, "crashed");
    wait_past_threshold();

    env.muster()
        .args(["sweep", "-H", "--stale-threshold-secs", "1"])
        .assert()
        .success()
        .stdout(predicates::str::contains("Marked 1 session(s) stale"));
}
