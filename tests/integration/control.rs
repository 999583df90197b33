#[path = "common/mod.rs"]
mod common;

use std::{thread, time::Duration};

use common::{
    RunningSupervisor, add_service, fast_policy, init_root, request, wait_for_status,
};
use rootd::service::RetryPolicy;
use tempfile::tempdir;

const SLEEPER_BODY: &str =
    r#"{"executable":"/bin/sleep","parameters":["sleep","3600"],"actuation":"enabled"}"#;

#[test]
fn create_start_stop_cycle() {
    let _guard = rootd::test_utils::env_lock();
    let temp = tempdir().unwrap();
    init_root(temp.path());
    let running = RunningSupervisor::start(temp.path(), fast_policy());

    // Creation dispatches the machine; enabled services start right away.
    let response = request(&running.socket, "POST", "/svc?enable", Some(SLEEPER_BODY));
    assert_eq!(response.code, 201);
    assert_eq!(response.json(), serde_json::json!("service created"));

    let service_dir = temp.path().join("daemons").join("svc");
    assert!(service_dir.join("actuation.txt").is_file());
    assert!(service_dir.join("if").join("invocation.txt").is_file());
    assert!(service_dir.join("critical.log").is_file());

    wait_for_status(&running.socket, "svc", "executed", Duration::from_secs(5));

    let response = request(&running.socket, "POST", "/svc?stop", None);
    assert_eq!(response.code, 200);
    assert_eq!(
        response.json()["svc"],
        serde_json::json!("daemon signalled to terminate")
    );

    wait_for_status(&running.socket, "svc", "terminated", Duration::from_secs(5));

    // Still enabled on disk, but stop inhibits recovery: no auto-restart.
    thread::sleep(fast_policy().retry_wait * 4);
    let response = request(&running.socket, "GET", "/svc", None);
    assert_eq!(response.json()["svc"]["status"], "terminated");
    assert_eq!(response.json()["svc"]["actuation"], "enabled");
    assert_eq!(response.json()["svc"]["pid"], serde_json::Value::Null);

    running.stop();
}

#[test]
fn index_lists_service_statuses() {
    let _guard = rootd::test_utils::env_lock();
    let temp = tempdir().unwrap();
    let root = init_root(temp.path());
    add_service(&root, "up", "/bin/sleep", &["sleep", "3600"], true);
    add_service(&root, "down", "/bin/sleep", &["sleep", "3600"], false);

    let running = RunningSupervisor::start(temp.path(), fast_policy());
    wait_for_status(&running.socket, "up", "executed", Duration::from_secs(5));

    let response = request(&running.socket, "GET", "/", None);
    assert_eq!(response.code, 200);
    assert_eq!(response.header("content-type"), Some("application/json"));
    let index = response.json();
    assert_eq!(index["up"], "executed");
    assert_eq!(index["down"], "terminated");

    running.stop();
}

#[test]
fn snapshot_carries_configuration_and_pid() {
    let _guard = rootd::test_utils::env_lock();
    let temp = tempdir().unwrap();
    let root = init_root(temp.path());
    add_service(&root, "snap", "/bin/sleep", &["sleep", "3600"], true);

    let running = RunningSupervisor::start(temp.path(), fast_policy());
    wait_for_status(&running.socket, "snap", "executed", Duration::from_secs(5));

    let body = request(&running.socket, "GET", "/snap", None).json();
    let entry = &body["snap"];
    assert_eq!(entry["executable"], "/bin/sleep");
    assert_eq!(entry["parameters"][0], "sleep");
    assert_eq!(entry["actuation"], "enabled");
    assert_eq!(entry["status"], "executed");
    assert!(entry["pid"].as_i64().unwrap() > 0);

    running.stop();
}

#[test]
fn delete_conflicts_while_running() {
    let _guard = rootd::test_utils::env_lock();
    let temp = tempdir().unwrap();
    let root = init_root(temp.path());
    add_service(&root, "busy", "/bin/sleep", &["sleep", "3600"], true);

    let running = RunningSupervisor::start(temp.path(), fast_policy());
    wait_for_status(&running.socket, "busy", "executed", Duration::from_secs(5));

    let response = request(&running.socket, "DELETE", "/busy", None);
    assert_eq!(response.code, 409);
    assert_eq!(
        response.json(),
        serde_json::json!("running services may not be removed")
    );
    assert!(temp.path().join("daemons").join("busy").is_dir());

    // Stop first, then deletion goes through and the directory is gone.
    request(&running.socket, "POST", "/busy?stop", None);
    wait_for_status(&running.socket, "busy", "terminated", Duration::from_secs(5));

    let response = request(&running.socket, "DELETE", "/busy", None);
    assert_eq!(response.code, 200);
    assert_eq!(
        response.json(),
        serde_json::json!("service daemon directories have been removed")
    );
    assert!(!temp.path().join("daemons").join("busy").exists());

    let response = request(&running.socket, "GET", "/busy", None);
    assert_eq!(response.code, 404);

    running.stop();
}

#[test]
fn wildcard_reload_maps_every_service() {
    let _guard = rootd::test_utils::env_lock();
    let temp = tempdir().unwrap();
    let root = init_root(temp.path());
    add_service(&root, "one", "/bin/sleep", &["sleep", "3600"], true);
    add_service(&root, "two", "/bin/sleep", &["sleep", "3600"], true);

    let running = RunningSupervisor::start(temp.path(), fast_policy());
    wait_for_status(&running.socket, "one", "executed", Duration::from_secs(5));
    wait_for_status(&running.socket, "two", "executed", Duration::from_secs(5));

    let response = request(&running.socket, "POST", "/*?reload", None);
    assert_eq!(response.code, 200);
    let body = response.json();
    assert_eq!(body["one"], "daemon signalled to reload using SIGHUP");
    assert_eq!(body["two"], "daemon signalled to reload using SIGHUP");

    running.stop();
}

#[test]
fn unknown_command_is_a_protocol_error() {
    let _guard = rootd::test_utils::env_lock();
    let temp = tempdir().unwrap();
    let root = init_root(temp.path());
    add_service(&root, "plain", "/bin/sleep", &["sleep", "3600"], false);

    let running = RunningSupervisor::start(temp.path(), fast_policy());

    let response = request(&running.socket, "POST", "/plain?detonate", None);
    assert_eq!(response.code, 400);
    assert_eq!(response.reason, "UNKNOWN SERVICE OPERATION");
    assert_eq!(response.json(), serde_json::json!("command is not recognized"));

    running.stop();
}

#[test]
fn malformed_json_body_is_rejected() {
    let _guard = rootd::test_utils::env_lock();
    let temp = tempdir().unwrap();
    init_root(temp.path());
    let running = RunningSupervisor::start(temp.path(), fast_policy());

    let response = request(&running.socket, "POST", "/svc", Some("{not json"));
    assert_eq!(response.code, 400);
    assert_eq!(
        response.json(),
        serde_json::json!("could not load json entity body")
    );
    assert!(!temp.path().join("daemons").join("svc").exists());

    running.stop();
}

#[test]
fn update_without_command_rewrites_configuration() {
    let _guard = rootd::test_utils::env_lock();
    let temp = tempdir().unwrap();
    let root = init_root(temp.path());
    add_service(&root, "mutable", "/bin/sleep", &["sleep", "3600"], false);

    let running = RunningSupervisor::start(temp.path(), fast_policy());

    let response = request(
        &running.socket,
        "POST",
        "/mutable",
        Some(r#"{"abstract":"updated description"}"#),
    );
    assert_eq!(response.code, 200);
    assert_eq!(response.json(), serde_json::json!("service update"));

    let body = request(&running.socket, "GET", "/mutable", None).json();
    assert_eq!(body["mutable"]["abstract"], "updated description");
    assert_eq!(body["mutable"]["executable"], "/bin/sleep");

    running.stop();
}

#[test]
fn unknown_service_is_not_found() {
    let _guard = rootd::test_utils::env_lock();
    let temp = tempdir().unwrap();
    init_root(temp.path());
    let running = RunningSupervisor::start(temp.path(), fast_policy());

    let response = request(&running.socket, "GET", "/ghost", None);
    assert_eq!(response.code, 404);
    assert_eq!(response.json(), serde_json::json!("no such service"));

    // POST without a body cannot create either.
    let response = request(&running.socket, "POST", "/ghost?start", None);
    assert_eq!(response.code, 404);

    running.stop();
}

#[test]
fn nested_paths_are_not_services() {
    let _guard = rootd::test_utils::env_lock();
    let temp = tempdir().unwrap();
    init_root(temp.path());
    let running = RunningSupervisor::start(temp.path(), fast_policy());

    let response = request(&running.socket, "GET", "/svc/sub", None);
    assert_eq!(response.code, 404);
    assert_eq!(
        response.json(),
        serde_json::json!("services do not have subdirectories")
    );

    running.stop();
}

#[test]
fn options_and_unsupported_methods() {
    let _guard = rootd::test_utils::env_lock();
    let temp = tempdir().unwrap();
    init_root(temp.path());
    let running = RunningSupervisor::start(temp.path(), fast_policy());

    let response = request(&running.socket, "OPTIONS", "*", None);
    assert_eq!(response.code, 204);
    assert_eq!(response.header("allow"), Some("GET,HEAD,POST,DELETE"));
    assert!(response.body.is_empty());

    let response = request(&running.socket, "PUT", "/svc", None);
    assert_eq!(response.code, 405);
    assert_eq!(
        response.json(),
        serde_json::json!("unsupported http method provided by client")
    );

    running.stop();
}

#[test]
fn head_matches_get_without_a_body() {
    let _guard = rootd::test_utils::env_lock();
    let temp = tempdir().unwrap();
    let root = init_root(temp.path());
    add_service(&root, "mirror", "/bin/sleep", &["sleep", "3600"], false);

    let running = RunningSupervisor::start(temp.path(), fast_policy());

    let get = request(&running.socket, "GET", "/", None);
    let head = request(&running.socket, "HEAD", "/", None);
    assert_eq!(head.code, 200);
    assert_eq!(
        head.header("content-length"),
        get.header("content-length")
    );
    assert!(head.body.is_empty());
    assert!(!get.body.is_empty());

    running.stop();
}

#[test]
fn restart_brings_a_service_back_with_a_new_pid() {
    let _guard = rootd::test_utils::env_lock();
    let temp = tempdir().unwrap();
    let root = init_root(temp.path());
    add_service(&root, "phoenix", "/bin/sleep", &["sleep", "3600"], true);

    // Restarted children must count as good runs even when short-lived.
    let policy = RetryPolicy {
        minimum_runtime: Duration::from_millis(1),
        retry_wait: Duration::from_millis(25),
        maximum_attempts: 3,
    };
    let running = RunningSupervisor::start(temp.path(), policy);
    wait_for_status(&running.socket, "phoenix", "executed", Duration::from_secs(5));

    let before = request(&running.socket, "GET", "/phoenix", None).json()["phoenix"]["pid"]
        .as_i64()
        .unwrap();

    let response = request(&running.socket, "POST", "/phoenix?restart", None);
    assert_eq!(
        response.json()["phoenix"],
        serde_json::json!("daemon signalled to restart")
    );

    common::wait_for(
        || {
            let body = request(&running.socket, "GET", "/phoenix", None).json();
            body["phoenix"]["status"] == "executed"
                && body["phoenix"]["pid"].as_i64().unwrap_or(before) != before
        },
        Duration::from_secs(5),
        "phoenix to restart with a fresh pid",
    );

    running.stop();
}

#[test]
fn disable_and_normalize_stop_a_runner() {
    let _guard = rootd::test_utils::env_lock();
    let temp = tempdir().unwrap();
    let root = init_root(temp.path());
    add_service(&root, "nomad", "/bin/sleep", &["sleep", "3600"], true);

    let running = RunningSupervisor::start(temp.path(), fast_policy());
    wait_for_status(&running.socket, "nomad", "executed", Duration::from_secs(5));

    let response = request(&running.socket, "POST", "/nomad?disable", None);
    assert_eq!(response.json()["nomad"], "disabled");

    // Disabling alone leaves the child running; normalize reconciles.
    let body = request(&running.socket, "GET", "/nomad", None).json();
    assert_eq!(body["nomad"]["status"], "executed");

    let response = request(&running.socket, "POST", "/nomad?normalize", None);
    assert_eq!(
        response.json()["nomad"],
        serde_json::json!("daemon signalled to terminate")
    );
    wait_for_status(&running.socket, "nomad", "terminated", Duration::from_secs(5));

    // Normalizing an agreeing service changes nothing.
    let response = request(&running.socket, "POST", "/nomad?normalize", None);
    assert_eq!(response.json()["nomad"], "ineffective");

    running.stop();
}

#[test]
fn start_ignores_disabled_actuation() {
    let _guard = rootd::test_utils::env_lock();
    let temp = tempdir().unwrap();
    let root = init_root(temp.path());
    add_service(&root, "manual", "/bin/sleep", &["sleep", "3600"], false);

    let running = RunningSupervisor::start(temp.path(), fast_policy());

    let response = request(&running.socket, "POST", "/manual?start", None);
    assert_eq!(response.json()["manual"], "invoked");
    wait_for_status(&running.socket, "manual", "executed", Duration::from_secs(5));

    let response = request(&running.socket, "POST", "/manual?start", None);
    assert_eq!(response.json()["manual"], "already running");

    running.stop();
}
