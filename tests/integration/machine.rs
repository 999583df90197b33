#[path = "common/mod.rs"]
mod common;

use std::{thread, time::Duration, time::Instant};

use common::{add_service, fast_policy, init_root};
use rootd::{
    service::{RetryPolicy, Status},
    supervisor::Supervisor,
};
use tempfile::tempdir;

fn wait_for_machine_status(
    supervisor: &Supervisor,
    id: &str,
    status: Status,
    limit: Duration,
) {
    let deadline = Instant::now() + limit;
    loop {
        let current = supervisor.machine(id).unwrap().status();
        if current == status {
            return;
        }
        if Instant::now() >= deadline {
            panic!("'{id}' stuck at {current:?}, wanted {status:?}");
        }
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn failing_service_exhausts_its_attempt_budget() {
    let _guard = rootd::test_utils::env_lock();
    let temp = tempdir().unwrap();
    let root = init_root(temp.path());
    add_service(&root, "flapper", "/bin/false", &["false"], true);

    let policy = fast_policy();
    let mut supervisor = Supervisor::with_policy(temp.path().to_path_buf(), policy);
    supervisor.boot().unwrap();

    wait_for_machine_status(&supervisor, "flapper", Status::Exits, Duration::from_secs(10));

    let machine = std::sync::Arc::clone(supervisor.machine("flapper").unwrap());
    assert_eq!(machine.exit_event_count(), policy.maximum_attempts);

    // Exhausted means exhausted: the buffer stays put.
    thread::sleep(Duration::from_millis(200));
    assert_eq!(machine.exit_event_count(), policy.maximum_attempts);
    assert_eq!(machine.status(), Status::Exits);

    supervisor.terminate();
}

#[test]
fn good_run_resets_and_reinvokes_immediately() {
    let _guard = rootd::test_utils::env_lock();
    let temp = tempdir().unwrap();
    let root = init_root(temp.path());
    add_service(&root, "steady", "/bin/sleep", &["sleep", "0.2"], true);

    // Anything past 50ms counts as a good run, and retries would otherwise
    // wait far longer than the test.
    let policy = RetryPolicy {
        minimum_runtime: Duration::from_millis(50),
        retry_wait: Duration::from_secs(600),
        maximum_attempts: 2,
    };
    let mut supervisor = Supervisor::with_policy(temp.path().to_path_buf(), policy);
    supervisor.boot().unwrap();

    let machine = std::sync::Arc::clone(supervisor.machine("steady").unwrap());
    let first_pid = {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(pid) = machine.pid() {
                break pid;
            }
            assert!(Instant::now() < deadline, "steady never started");
            thread::sleep(Duration::from_millis(10));
        }
    };

    // After the child's clean exit the machine reinvokes without a retry
    // wait and with an empty attempt buffer.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(pid) = machine.pid()
            && pid != first_pid
        {
            break;
        }
        assert!(Instant::now() < deadline, "steady never reinvoked");
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(machine.exit_event_count(), 0);
    assert_eq!(machine.status(), Status::Executed);

    supervisor.terminate();
}

#[test]
fn disabled_service_stays_terminated_after_boot() {
    let _guard = rootd::test_utils::env_lock();
    let temp = tempdir().unwrap();
    let root = init_root(temp.path());
    add_service(&root, "parked", "/bin/sleep", &["sleep", "30"], false);

    let mut supervisor = Supervisor::with_policy(temp.path().to_path_buf(), fast_policy());
    supervisor.boot().unwrap();

    thread::sleep(Duration::from_millis(100));
    let machine = std::sync::Arc::clone(supervisor.machine("parked").unwrap());
    assert_eq!(machine.status(), Status::Terminated);
    assert_eq!(machine.pid(), None);

    supervisor.terminate();
}

#[test]
fn critical_log_records_the_lifecycle() {
    let _guard = rootd::test_utils::env_lock();
    let temp = tempdir().unwrap();
    let root = init_root(temp.path());
    let config = add_service(&root, "noted", "/bin/true", &["true"], false);

    let mut supervisor = Supervisor::with_policy(temp.path().to_path_buf(), fast_policy());
    supervisor.boot().unwrap();

    let machine = std::sync::Arc::clone(supervisor.machine("noted").unwrap());
    machine.invoke().unwrap();
    machine.wait_child_exit();

    common::wait_for(
        || {
            std::fs::read_to_string(config.critical_log_path())
                .map(|log| log.contains("daemon invoked") && log.contains("exited with code 0"))
                .unwrap_or(false)
        },
        Duration::from_secs(5),
        "critical log lines",
    );

    supervisor.terminate();
}
