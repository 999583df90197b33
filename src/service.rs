//! # Service State Machine
//!
//! One `ServiceMachine` supervises one service's child process. The machine
//! owns the child exclusively: it forks it, a waiter thread reaps it, and
//! the restart policy decides what happens next.
//!
//! Machines do not exit when a service is disabled; they only leave the set
//! when the service is removed by an administrative instruction.

use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::{
    fs,
    process::{Child, Command, Stdio},
    sync::{Arc, Condvar, Mutex},
    thread,
    time::{Duration, Instant},
};

use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{config::ServiceConfig, error::ServiceError, plan::InvocationPlan};

/// Environment variable exporting the service identifier to the child.
pub const SERVICE_NAME_VAR: &str = "SERVICE_NAME";

/// Restart policy knobs.
///
/// A run shorter than `minimum_runtime` counts against the attempt budget;
/// a run at least that long clears it.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Minimum runtime identifying a successful start.
    pub minimum_runtime: Duration,
    /// Wait between a failed exit and the next automatic attempt.
    pub retry_wait: Duration,
    /// Attempts to make before giving up and awaiting administration.
    pub maximum_attempts: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            minimum_runtime: Duration::from_secs(16),
            retry_wait: Duration::from_secs(2),
            maximum_attempts: 8,
        }
    }
}

/// Run state of a supervised service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// No child process; nothing pending.
    Terminated,
    /// A child process is running.
    Executed,
    /// A retry timer is pending.
    Waiting,
    /// The attempt budget is exhausted; administration required.
    Exits,
    /// An internal fault occurred during invocation.
    Exception,
}

impl Status {
    /// The lowercase wire token.
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Terminated => "terminated",
            Status::Executed => "executed",
            Status::Waiting => "waiting",
            Status::Exits => "exits",
            Status::Exception => "exception",
        }
    }
}

/// Tri-state auto-restart control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Restart iff the service's actuation is enabled.
    Normal,
    /// One restart attempt regardless of actuation, then back to `Normal`.
    InhibitOnce,
    /// Never restart, regardless of actuation.
    Permanent,
}

/// How a child left: a normal exit code or the terminating signal.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ExitDisposition {
    /// Exit code when the child terminated normally.
    pub code: Option<i32>,
    /// Signal number when the child was killed.
    pub signal: Option<i32>,
}

impl From<std::process::ExitStatus> for ExitDisposition {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

/// A recorded child termination.
#[derive(Debug, Clone, Serialize)]
pub struct ExitEvent {
    /// Wall-clock timestamp for operators.
    pub at: chrono::DateTime<chrono::Local>,
    /// Exit code or signal.
    #[serde(flatten)]
    pub disposition: ExitDisposition,
}

struct MachineState {
    status: Status,
    recovery: Recovery,
    exit_events: Vec<ExitEvent>,
    pid: Option<i32>,
    last_invoke: Option<Instant>,
    last_exit: Option<Instant>,
    terminating: bool,
    // Distinguishes the current child/timer generation from stale callbacks.
    run_serial: u64,
}

/// Supervises one service's child process and its restart policy.
pub struct ServiceMachine {
    id: String,
    config: Mutex<ServiceConfig>,
    state: Mutex<MachineState>,
    child_gone: Condvar,
    policy: RetryPolicy,
}

impl ServiceMachine {
    /// Creates a machine over a loaded configuration.
    pub fn new(config: ServiceConfig, policy: RetryPolicy) -> Arc<Self> {
        let id = config.id().to_string();
        Arc::new(Self {
            id,
            config: Mutex::new(config),
            state: Mutex::new(MachineState {
                status: Status::Terminated,
                recovery: Recovery::Normal,
                exit_events: Vec::new(),
                pid: None,
                last_invoke: None,
                last_exit: None,
                terminating: false,
                run_serial: 0,
            }),
            child_gone: Condvar::new(),
            policy,
        })
    }

    /// The service identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current run state.
    pub fn status(&self) -> Status {
        self.lock_state().status
    }

    /// PID of the live child, if any.
    pub fn pid(&self) -> Option<i32> {
        self.lock_state().pid
    }

    /// Number of recorded exits since the buffer was last cleared.
    pub fn exit_event_count(&self) -> usize {
        self.lock_state().exit_events.len()
    }

    /// Copy of the exit-event buffer.
    pub fn exit_events(&self) -> Vec<ExitEvent> {
        self.lock_state().exit_events.clone()
    }

    /// Current restart inhibition.
    pub fn recovery(&self) -> Recovery {
        self.lock_state().recovery
    }

    /// Adjusts restart inhibition.
    pub fn set_recovery(&self, recovery: Recovery) {
        self.lock_state().recovery = recovery;
    }

    /// Runs a closure against the machine's configuration.
    pub fn with_config<R>(&self, f: impl FnOnce(&mut ServiceConfig) -> R) -> R {
        let mut config = self.config.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut config)
    }

    /// Boolean actuation of the underlying configuration.
    pub fn actuates(&self) -> bool {
        self.with_config(|config| config.actuates())
    }

    /// Dispatch hook: start the child when the service actuates.
    pub fn activate(self: &Arc<Self>) {
        if self.actuates()
            && let Err(err) = self.invoke()
        {
            warn!("service '{}' failed to start on dispatch: {err}", self.id);
        }
    }

    /// Invokes the service. Does nothing when a child is already running or
    /// the machine is terminating. Returns whether a child was spawned.
    pub fn invoke(self: &Arc<Self>) -> Result<bool, ServiceError> {
        {
            let state = self.lock_state();
            if state.status == Status::Executed || state.terminating {
                return Ok(false);
            }
        }

        let (plan, route, log_path) = self.with_config(|config| {
            (
                config.plan(),
                config.route().to_path_buf(),
                config.critical_log_path(),
            )
        });

        let spawned = spawn_child(&self.id, &plan, &route, &log_path);

        let mut state = self.lock_state();
        match spawned {
            Ok(child) => {
                let pid = child.id() as i32;
                state.status = Status::Executed;
                state.pid = Some(pid);
                state.last_invoke = Some(Instant::now());
                state.run_serial += 1;
                let serial = state.run_serial;
                // Termination may have begun while the spawn was in flight.
                let terminating = state.terminating;
                drop(state);

                if terminating {
                    let _ = tolerate_gone(signal::killpg(
                        Pid::from_raw(pid),
                        Signal::SIGTERM,
                    ));
                }

                info!("service '{}' invoked (pid {pid})", self.id);
                self.log_critical(&format!("daemon invoked (pid {pid})"));

                let machine = Arc::clone(self);
                thread::spawn(move || machine.reap(child, serial));
                Ok(true)
            }
            Err(source) => {
                state.status = Status::Exception;
                drop(state);

                warn!("service '{}' failed to spawn: {source}", self.id);
                self.log_critical(&format!("daemon invocation failed: {source}"));
                Err(ServiceError::Spawn {
                    service: self.id.clone(),
                    source,
                })
            }
        }
    }

    /// Waiter body: owns the child, records its exit, applies the policy.
    fn reap(self: Arc<Self>, mut child: Child, serial: u64) {
        match child.wait() {
            Ok(status) => self.child_exited(serial, status.into()),
            Err(err) => {
                warn!("failed to wait for service '{}': {err}", self.id);
                self.child_exited(
                    serial,
                    ExitDisposition {
                        code: None,
                        signal: None,
                    },
                );
            }
        }
    }

    fn child_exited(self: &Arc<Self>, serial: u64, disposition: ExitDisposition) {
        let proceed = {
            let mut state = self.lock_state();
            if state.run_serial != serial {
                return;
            }

            state.pid = None;
            if state.status != Status::Exception {
                state.status = Status::Terminated;
            }
            state.last_exit = Some(Instant::now());
            state.exit_events.push(ExitEvent {
                at: chrono::Local::now(),
                disposition,
            });
            self.child_gone.notify_all();

            !state.terminating && state.recovery != Recovery::Permanent
        };

        let detail = match (disposition.code, disposition.signal) {
            (Some(code), _) => format!("exited with code {code}"),
            (None, Some(sig)) => format!("terminated by signal {sig}"),
            (None, None) => "exit status unavailable".to_string(),
        };
        debug!("service '{}' {detail}", self.id);
        self.log_critical(&format!("daemon {detail}"));

        if !proceed {
            return;
        }

        let restart = {
            let mut state = self.lock_state();
            match state.recovery {
                Recovery::InhibitOnce => {
                    state.recovery = Recovery::Normal;
                    true
                }
                Recovery::Normal => self.actuates(),
                Recovery::Permanent => false,
            }
        };

        if restart {
            self.again();
        }
    }

    /// Applies the backoff policy after an exit: immediate reinvoke after a
    /// good run, a deferred retry while the budget lasts, `exits` after.
    fn again(self: &Arc<Self>) {
        enum Plan {
            Immediate,
            Defer(u64),
            GiveUp,
        }

        let plan = {
            let mut state = self.lock_state();
            if state.status == Status::Executed || state.terminating {
                return;
            }

            if was_running(&state, self.policy.minimum_runtime) {
                state.exit_events.clear();
                Plan::Immediate
            } else if state.exit_events.len() >= self.policy.maximum_attempts {
                state.recovery = Recovery::Permanent;
                state.status = Status::Exits;
                Plan::GiveUp
            } else {
                state.status = Status::Waiting;
                Plan::Defer(state.run_serial)
            }
        };

        match plan {
            Plan::Immediate => {
                if let Err(err) = self.invoke() {
                    warn!("service '{}' restart failed: {err}", self.id);
                }
            }
            Plan::Defer(serial) => {
                self.log_critical("restart attempt scheduled");
                let machine = Arc::clone(self);
                let wait = self.policy.retry_wait;
                thread::spawn(move || {
                    thread::sleep(wait);
                    let stale = {
                        let state = machine.lock_state();
                        state.status != Status::Waiting
                            || state.run_serial != serial
                            || state.terminating
                    };
                    if stale {
                        return;
                    }
                    if let Err(err) = machine.invoke() {
                        warn!("service '{}' retry failed: {err}", machine.id);
                    }
                });
            }
            Plan::GiveUp => {
                info!(
                    "service '{}' gave up after {} attempts",
                    self.id, self.policy.maximum_attempts
                );
                self.log_critical("restart attempts exhausted; administration required");
            }
        }
    }

    /// SIGTERM to the process group; clears the exit-event buffer.
    pub fn signal_terminate(&self) -> Result<(), ServiceError> {
        self.signal_group_clearing(Signal::SIGTERM)
    }

    /// SIGINT to the process group; clears the exit-event buffer.
    pub fn signal_interrupt(&self) -> Result<(), ServiceError> {
        self.signal_group_clearing(Signal::SIGINT)
    }

    /// SIGKILL to the process group; clears the exit-event buffer.
    pub fn signal_kill(&self) -> Result<(), ServiceError> {
        self.signal_group_clearing(Signal::SIGKILL)
    }

    /// SIGSTOP to the process group.
    pub fn signal_suspend(&self) -> Result<(), ServiceError> {
        self.signal_group(Signal::SIGSTOP)
    }

    /// SIGCONT to the process group.
    pub fn signal_resume(&self) -> Result<(), ServiceError> {
        self.signal_group(Signal::SIGCONT)
    }

    /// SIGHUP to the child process itself.
    pub fn signal_reload(&self) -> Result<(), ServiceError> {
        if let Some(pid) = self.pid() {
            tolerate_gone(signal::kill(Pid::from_raw(pid), Signal::SIGHUP))?;
        }
        Ok(())
    }

    fn signal_group_clearing(&self, sig: Signal) -> Result<(), ServiceError> {
        let pid = {
            let mut state = self.lock_state();
            state.exit_events.clear();
            state.pid
        };
        if let Some(pid) = pid {
            tolerate_gone(signal::killpg(Pid::from_raw(pid), sig))?;
        }
        Ok(())
    }

    fn signal_group(&self, sig: Signal) -> Result<(), ServiceError> {
        if let Some(pid) = self.pid() {
            tolerate_gone(signal::killpg(Pid::from_raw(pid), sig))?;
        }
        Ok(())
    }

    /// Begins machine termination: the child group receives SIGTERM; absent
    /// a child the machine finishes immediately. No further restarts occur.
    pub fn shutdown(&self) -> Result<(), ServiceError> {
        let pid = {
            let mut state = self.lock_state();
            state.terminating = true;
            state.exit_events.clear();
            match state.pid {
                Some(pid) => Some(pid),
                None => {
                    state.status = Status::Terminated;
                    self.child_gone.notify_all();
                    None
                }
            }
        };
        if let Some(pid) = pid {
            tolerate_gone(signal::killpg(Pid::from_raw(pid), Signal::SIGTERM))?;
        }
        Ok(())
    }

    /// Blocks until no child process is alive.
    pub fn wait_child_exit(&self) {
        let mut state = self.lock_state();
        while state.pid.is_some() {
            state = self
                .child_gone
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, MachineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn log_critical(&self, message: &str) {
        if let Err(err) = self.with_config(|config| config.critical(message)) {
            warn!("service '{}' critical log write failed: {err}", self.id);
        }
    }
}

// A target that exited between the status check and delivery is not an
// error; its exit event is already on the way.
fn tolerate_gone(result: nix::Result<()>) -> Result<(), ServiceError> {
    match result {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn was_running(state: &MachineState, minimum_runtime: Duration) -> bool {
    match (state.last_invoke, state.last_exit) {
        (Some(invoked), Some(exited)) => {
            exited.saturating_duration_since(invoked) >= minimum_runtime
        }
        _ => false,
    }
}

/// Forks the service child: working directory at the service route, stderr
/// appended to the critical log, stdout inherited, the supervisor's
/// environment overlaid with the plan's entries plus `SERVICE_NAME`, and a
/// fresh process group.
fn spawn_child(
    id: &str,
    plan: &InvocationPlan,
    route: &std::path::Path,
    log_path: &std::path::Path,
) -> std::io::Result<Child> {
    let Some(executable) = plan.executable.as_deref() else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no executable configured",
        ));
    };

    let log = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;

    let mut command = Command::new(executable);
    if let Some((argv0, rest)) = plan.parameters.split_first() {
        command.arg0(argv0);
        command.args(rest);
    }

    for (name, value) in &plan.environment {
        match value {
            Some(value) => command.env(name, value),
            None => command.env_remove(name),
        };
    }
    command.env(SERVICE_NAME_VAR, id);

    command
        .current_dir(route)
        .stdout(Stdio::inherit())
        .stderr(Stdio::from(log))
        .process_group(0);

    command.spawn()
}
