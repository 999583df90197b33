//! # Supervisor Set
//!
//! Owns the mapping from service id to `ServiceMachine`, boots the set from
//! the daemon directory, accepts control connections, and drives the
//! process-wide termination protocol.

use std::{
    collections::BTreeMap,
    env, fs, io,
    os::unix::net::UnixListener,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tracing::{debug, error, info, warn};

use crate::{
    config::{self, ServiceConfig},
    control,
    error::ServiceError,
    service::{RetryPolicy, ServiceMachine},
};

/// Environment variable the supervisor exports so children can locate the
/// daemon set.
pub const DAEMONS_ENV: &str = "DAEMONS";

/// Identifier of the root service directory itself.
pub const ROOT_SERVICE: &str = "rootd";

const ACCEPT_IDLE_WAIT: Duration = Duration::from_millis(50);
const CLIENT_IO_TIMEOUT: Duration = Duration::from_secs(5);

/// The root daemon: a set of service machines plus the control listener.
pub struct Supervisor {
    root: ServiceConfig,
    machines: BTreeMap<String, Arc<ServiceMachine>>,
    policy: RetryPolicy,
}

impl Supervisor {
    /// Creates a supervisor over a daemon set root directory.
    pub fn new(route: PathBuf) -> Self {
        Self::with_policy(route, RetryPolicy::default())
    }

    /// Creates a supervisor with an explicit restart policy.
    pub fn with_policy(route: PathBuf, policy: RetryPolicy) -> Self {
        Self {
            root: ServiceConfig::new(route, ROOT_SERVICE),
            machines: BTreeMap::new(),
            policy,
        }
    }

    /// The root service configuration.
    pub fn root(&self) -> &ServiceConfig {
        &self.root
    }

    /// The restart policy applied to dispatched machines.
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// The directory holding one subdirectory per managed service.
    pub fn daemons_route(&self) -> PathBuf {
        self.root.daemons_route()
    }

    /// Looks up a machine by service id.
    pub fn machine(&self, id: &str) -> Option<&Arc<ServiceMachine>> {
        self.machines.get(id)
    }

    /// All machines, ordered by id.
    pub fn machines(&self) -> impl Iterator<Item = (&str, &Arc<ServiceMachine>)> {
        self.machines.iter().map(|(id, m)| (id.as_str(), m))
    }

    /// Registers and starts a machine for the given configuration.
    /// Idempotent on id: an existing machine is returned untouched.
    pub fn dispatch(&mut self, config: ServiceConfig) -> Arc<ServiceMachine> {
        let id = config.id().to_string();
        if let Some(existing) = self.machines.get(&id) {
            return Arc::clone(existing);
        }

        let machine = ServiceMachine::new(config, self.policy);
        self.machines.insert(id.clone(), Arc::clone(&machine));
        debug!("dispatched service '{id}'");
        machine.activate();
        machine
    }

    /// Drops a fully terminated machine from the set. Used when a service
    /// is destroyed; disabling a service does not remove it.
    pub fn remove(&mut self, id: &str) -> Option<Arc<ServiceMachine>> {
        self.machines.remove(id)
    }

    /// Scans the daemon directory and constructs the service set. Also
    /// records the supervisor PID, moves into the root directory, exports
    /// `DAEMONS`, and notes the start in the root critical log.
    pub fn boot(&mut self) -> Result<(), ServiceError> {
        self.root.prepare()?;
        self.root.load()?;

        if env::var_os(DAEMONS_ENV).is_none() {
            unsafe {
                env::set_var(DAEMONS_ENV, self.root.route());
            }
        }

        self.root.store_pid(std::process::id() as i32)?;
        env::set_current_dir(self.root.route())?;
        self.root.critical("started root daemon")?;

        let daemons = self.daemons_route();
        fs::create_dir_all(&daemons)?;

        let mut boot_set = Vec::new();
        for (id, route) in config::service_routes(&daemons)? {
            let mut service = ServiceConfig::new(route, &id);
            if !service.is_consistent() {
                warn!("ignoring inconsistent service directory '{id}'");
                continue;
            }
            match service.load() {
                Ok(()) => boot_set.push(service),
                Err(err) => warn!("failed to load service '{id}': {err}"),
            }
        }

        for service in boot_set {
            self.dispatch(service);
        }

        info!(
            "booted {} service(s) from {:?}",
            self.machines.len(),
            daemons
        );
        Ok(())
    }

    /// Boots the set and serves control connections until `shutdown` is
    /// raised or the listener fails, then runs the termination protocol.
    pub fn run(&mut self, shutdown: Arc<AtomicBool>) -> Result<(), ServiceError> {
        self.boot()?;

        let socket_path = self.root.control_socket_path();
        if socket_path.exists() {
            fs::remove_file(&socket_path)?;
        }
        let listener = UnixListener::bind(&socket_path)?;
        listener.set_nonblocking(true)?;
        info!("rootd supervisor listening on {:?}", socket_path);

        while !shutdown.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((mut stream, _addr)) => {
                    let _ = stream.set_read_timeout(Some(CLIENT_IO_TIMEOUT));
                    let _ = stream.set_write_timeout(Some(CLIENT_IO_TIMEOUT));
                    control::handle_connection(self, &mut stream);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_IDLE_WAIT);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!("control listener failed: {err}");
                    break;
                }
            }
        }

        info!("rootd supervisor shutting down");
        self.terminate();
        let _ = fs::remove_file(&socket_path);
        self.root.critical("root daemon terminated")?;
        Ok(())
    }

    /// Orderly shutdown: terminate every machine, then wait for every child
    /// to exit. A running child keeps the supervisor alive; there is no
    /// forced timeout.
    pub fn terminate(&self) {
        for (id, machine) in &self.machines {
            if let Err(err) = machine.shutdown() {
                warn!("failed to terminate service '{id}': {err}");
            }
        }

        for (id, machine) in &self.machines {
            machine.wait_child_exit();
            debug!("service '{id}' finished termination");
        }
    }
}
