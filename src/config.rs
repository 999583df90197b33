//! # Service Configuration Store
//!
//! Manages the per-service state stored on disk. Each service is one
//! directory under the daemon set's `daemons/` directory:
//!
//! ```text
//! daemons/<id>/
//!   actuation.txt            # "enabled" | "disabled"
//!   abstract.txt             # optional human description
//!   if/invocation.txt        # invocation plan
//!   critical.log             # append-only line log
//! ```
//!
//! The service id is never stored inside the directory; it is the directory
//! basename. Writes go through a temp-file-and-rename in the same directory
//! so a crash cannot leave a half-written file behind.

use std::{
    env, fmt, fs,
    io::{self, Write},
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::{ActuationParseError, ServiceError},
    plan::{EnvEntry, InvocationPlan},
};

/// Environment variable selecting the daemon set root directory.
pub const ENVIRONMENT: &str = "FAULT_DAEMON_DIRECTORY";

const ACTUATION_FILE: &str = "actuation.txt";
const ABSTRACT_FILE: &str = "abstract.txt";
const INVOCATION_FILE: &str = "invocation.txt";
const INTERFACE_DIR: &str = "if";
const CRITICAL_LOG: &str = "critical.log";
const PID_FILE: &str = "pid";

/// Subdirectory of the root holding one directory per managed service.
pub const DAEMONS_DIR: &str = "daemons";

/// Returns the default daemon set root, `~/.fault/rootd`.
pub fn default_route() -> PathBuf {
    let home = env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/"));
    home.join(".fault").join("rootd")
}

/// Resolves the daemon set root: explicit override, then the
/// `FAULT_DAEMON_DIRECTORY` environment variable, then the default.
pub fn identify_route(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }

    match env::var_os(ENVIRONMENT) {
        Some(value) => PathBuf::from(value),
        None => default_route(),
    }
}

/// Enumerates the service directories under `root`. Regular files are
/// ignored; the returned pairs are (basename, path).
pub fn service_routes(root: &Path) -> io::Result<Vec<(String, PathBuf)>> {
    let mut routes = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        routes.push((name.to_string(), entry.path()));
    }
    routes.sort();
    Ok(routes)
}

/// A service's enabled/disabled policy flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Actuation {
    /// Invoked on supervisor start and auto-restarted on exit.
    Enabled,
    /// Left alone until an explicit start.
    Disabled,
}

impl Actuation {
    /// The on-disk token.
    pub fn as_str(&self) -> &'static str {
        match self {
            Actuation::Enabled => "enabled",
            Actuation::Disabled => "disabled",
        }
    }

    /// Boolean projection used by the restart policy.
    pub fn actuates(&self) -> bool {
        matches!(self, Actuation::Enabled)
    }

    /// Inverse of `actuates`.
    pub fn from_bool(enabled: bool) -> Self {
        if enabled {
            Actuation::Enabled
        } else {
            Actuation::Disabled
        }
    }
}

impl fmt::Display for Actuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Actuation {
    type Err = ActuationParseError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        match text.trim().to_ascii_lowercase().as_str() {
            "enabled" => Ok(Actuation::Enabled),
            "disabled" => Ok(Actuation::Disabled),
            other => Err(ActuationParseError(other.to_string())),
        }
    }
}

/// JSON-ready view of a service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    /// Absolute path of the service directory.
    pub path: String,
    /// Program to execute, if configured.
    pub executable: Option<String>,
    /// Full argv including the leading program name.
    pub parameters: Vec<String>,
    /// Ordered environment overlay.
    pub environment: Vec<EnvEntry>,
    /// Optional human description.
    #[serde(rename = "abstract")]
    pub abstract_text: Option<String>,
    /// Enabled/disabled policy flag.
    pub actuation: Actuation,
}

/// Service configuration storage interface.
///
/// The route may not exist at construction; callers check `exists` or
/// `is_consistent` before deciding to `create` or `load`.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    route: PathBuf,
    id: String,
    /// Program to execute; non-empty when set.
    pub executable: Option<String>,
    /// Full argv including the leading program name.
    pub parameters: Vec<String>,
    /// Ordered environment overlay; a `None` value unsets.
    pub environment: Vec<EnvEntry>,
    /// Optional human description.
    pub abstract_text: Option<String>,
    /// Enabled/disabled policy flag.
    pub actuation: Actuation,
}

impl ServiceConfig {
    /// Binds a configuration to its storage location.
    pub fn new(route: PathBuf, id: impl Into<String>) -> Self {
        Self {
            route,
            id: id.into(),
            executable: None,
            parameters: Vec::new(),
            environment: Vec::new(),
            abstract_text: None,
            actuation: Actuation::Disabled,
        }
    }

    /// The service identifier (directory basename).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The service directory.
    pub fn route(&self) -> &Path {
        &self.route
    }

    /// Whether anything exists at the route.
    pub fn exists(&self) -> bool {
        self.route.symlink_metadata().is_ok()
    }

    /// Whether the on-disk layout supports a supervised service: the route
    /// is a directory holding `actuation.txt`, `critical.log`, and an `if/`
    /// directory with `invocation.txt`, all regular files.
    pub fn is_consistent(&self) -> bool {
        if !is_dir(&self.route) || !is_dir(&self.route.join(INTERFACE_DIR)) {
            return false;
        }

        is_file(&self.route.join(ACTUATION_FILE))
            && is_file(&self.route.join(CRITICAL_LOG))
            && is_file(&self.route.join(INTERFACE_DIR).join(INVOCATION_FILE))
    }

    /// Idempotently creates the directory skeleton.
    pub fn prepare(&self) -> Result<(), ServiceError> {
        fs::create_dir_all(&self.route)?;
        fs::create_dir_all(self.route.join(INTERFACE_DIR))?;
        Ok(())
    }

    /// Creates the service directory and initializes its configuration
    /// files: disabled actuation, an empty invocation plan, and a fresh
    /// critical log.
    pub fn create(&mut self) -> Result<(), ServiceError> {
        self.actuation = Actuation::Disabled;
        self.prepare()?;
        self.store()?;
        self.critical("service created")?;
        Ok(())
    }

    /// Recursively removes the service directory.
    pub fn void(&self) -> Result<(), ServiceError> {
        fs::remove_dir_all(&self.route)?;
        debug!("voided service directory {:?}", self.route);
        Ok(())
    }

    /// Loads actuation, invocation, and abstract from disk. A missing
    /// `abstract.txt` is tolerated; other missing files are corrupt state.
    pub fn load(&mut self) -> Result<(), ServiceError> {
        self.load_actuation()?;
        self.load_invocation()?;
        self.load_abstract()?;
        Ok(())
    }

    /// Stores invocation and actuation; the abstract is written only when
    /// present.
    pub fn store(&self) -> Result<(), ServiceError> {
        self.store_invocation()?;
        self.store_actuation()?;
        if self.abstract_text.is_some() {
            self.store_abstract()?;
        }
        Ok(())
    }

    /// Reads `actuation.txt`.
    pub fn load_actuation(&mut self) -> Result<(), ServiceError> {
        let path = self.route.join(ACTUATION_FILE);
        let text = read_required(&self.route, &path)?;
        self.actuation = text.parse().map_err(|err: ActuationParseError| {
            ServiceError::CorruptState {
                path: self.route.clone(),
                detail: err.to_string(),
            }
        })?;
        Ok(())
    }

    /// Writes `actuation.txt`: lowercase token plus a trailing newline.
    pub fn store_actuation(&self) -> Result<(), ServiceError> {
        let data = format!("{}\n", self.actuation.as_str());
        write_atomic(&self.route.join(ACTUATION_FILE), data.as_bytes())?;
        Ok(())
    }

    /// Reads `if/invocation.txt`.
    pub fn load_invocation(&mut self) -> Result<(), ServiceError> {
        let path = self.route.join(INTERFACE_DIR).join(INVOCATION_FILE);
        let text = read_required(&self.route, &path)?;
        let plan = InvocationPlan::parse(&text)?;
        self.executable = plan.executable.filter(|exe| !exe.is_empty());
        self.parameters = plan.parameters;
        self.environment = plan.environment;
        Ok(())
    }

    /// Writes `if/invocation.txt`.
    pub fn store_invocation(&self) -> Result<(), ServiceError> {
        let plan = self.plan();
        let data = plan.serialize()?;
        let path = self.route.join(INTERFACE_DIR).join(INVOCATION_FILE);
        write_atomic(&path, data.as_bytes())?;
        Ok(())
    }

    /// Reads `abstract.txt`; absence clears the field.
    pub fn load_abstract(&mut self) -> Result<(), ServiceError> {
        match fs::read_to_string(self.route.join(ABSTRACT_FILE)) {
            Ok(text) => {
                let trimmed = text.trim();
                self.abstract_text =
                    (!trimmed.is_empty()).then(|| trimmed.to_string());
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                self.abstract_text = None;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Writes `abstract.txt`.
    pub fn store_abstract(&self) -> Result<(), ServiceError> {
        let text = self.abstract_text.as_deref().unwrap_or("");
        write_atomic(&self.route.join(ABSTRACT_FILE), text.as_bytes())?;
        Ok(())
    }

    /// Reads the recorded PID, if any. Used for the daemon set root.
    pub fn load_pid(&self) -> Result<Option<i32>, ServiceError> {
        match fs::read_to_string(self.route.join(PID_FILE)) {
            Ok(text) => Ok(text.trim().parse().ok()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Records a PID with a trailing newline.
    pub fn store_pid(&self, pid: i32) -> Result<(), ServiceError> {
        write_atomic(&self.route.join(PID_FILE), format!("{pid}\n").as_bytes())?;
        Ok(())
    }

    /// Boolean view of the actuation flag.
    pub fn actuates(&self) -> bool {
        self.actuation.actuates()
    }

    /// Updates the actuation flag, persisting only on change.
    pub fn set_actuates(&mut self, enabled: bool) -> Result<(), ServiceError> {
        let next = Actuation::from_bool(enabled);
        if next != self.actuation {
            self.actuation = next;
            self.store_actuation()?;
        }
        Ok(())
    }

    /// The current invocation plan triple.
    pub fn plan(&self) -> InvocationPlan {
        InvocationPlan {
            environment: self.environment.clone(),
            executable: self.executable.clone(),
            parameters: self.parameters.clone(),
        }
    }

    /// JSON-ready view of the configuration.
    pub fn snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot {
            path: self.route.to_string_lossy().into_owned(),
            executable: self.executable.clone(),
            parameters: self.parameters.clone(),
            environment: self.environment.clone(),
            abstract_text: self.abstract_text.clone(),
            actuation: self.actuation,
        }
    }

    /// Replaces the fields present in `delta`, leaving the rest untouched.
    /// Recognized keys: `executable`, `parameters`, `environment`,
    /// `abstract`, `actuation`. Unrecognized keys are ignored.
    pub fn update(
        &mut self,
        delta: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), ServiceError> {
        use serde_json::Value;

        if let Some(value) = delta.get("executable") {
            self.executable = match value {
                Value::Null => None,
                Value::String(text) if !text.is_empty() => Some(text.clone()),
                _ => return Err(delta_error("executable", "a non-empty string or null")),
            };
        }

        if let Some(value) = delta.get("parameters") {
            self.parameters = serde_json::from_value(value.clone())
                .map_err(|_| delta_error("parameters", "an array of strings"))?;
        }

        if let Some(value) = delta.get("environment") {
            self.environment = serde_json::from_value(value.clone())
                .map_err(|_| delta_error("environment", "an array of [name, value] pairs"))?;
            if self.environment.iter().any(|(name, _)| name.is_empty()) {
                return Err(delta_error("environment", "non-empty variable names"));
            }
        }

        if let Some(value) = delta.get("abstract") {
            self.abstract_text = match value {
                Value::Null => None,
                Value::String(text) => Some(text.clone()),
                _ => return Err(delta_error("abstract", "a string or null")),
            };
        }

        if let Some(value) = delta.get("actuation") {
            let Value::String(token) = value else {
                return Err(delta_error("actuation", "\"enabled\" or \"disabled\""));
            };
            self.actuation = token.parse().map_err(|_| {
                delta_error("actuation", "\"enabled\" or \"disabled\"")
            })?;
        }

        Ok(())
    }

    /// Appends a timestamped line to the service's critical log.
    pub fn critical(&self, message: &str) -> Result<(), ServiceError> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.route.join(CRITICAL_LOG))?;
        let timestamp = chrono::Local::now().to_rfc3339();
        writeln!(file, "{timestamp}: {message}")?;
        Ok(())
    }

    /// Path of the service's critical log.
    pub fn critical_log_path(&self) -> PathBuf {
        self.route.join(CRITICAL_LOG)
    }

    /// Path of the control socket inside the interface directory. Only
    /// meaningful for the daemon set root.
    pub fn control_socket_path(&self) -> PathBuf {
        self.route.join(INTERFACE_DIR).join("http")
    }

    /// The `daemons/` directory for a root configuration.
    pub fn daemons_route(&self) -> PathBuf {
        self.route.join(DAEMONS_DIR)
    }
}

fn delta_error(field: &str, expected: &str) -> ServiceError {
    ServiceError::Delta(format!("field '{field}' expects {expected}"))
}

fn is_dir(path: &Path) -> bool {
    fs::symlink_metadata(path).map(|m| m.is_dir()).unwrap_or(false)
}

fn is_file(path: &Path) -> bool {
    fs::symlink_metadata(path).map(|m| m.is_file()).unwrap_or(false)
}

fn read_required(route: &Path, path: &Path) -> Result<String, ServiceError> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(text),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            Err(ServiceError::CorruptState {
                path: route.to_path_buf(),
                detail: format!("missing {:?}", path.file_name().unwrap_or_default()),
            })
        }
        Err(err) => Err(err.into()),
    }
}

/// Durable single-file write: temp file in the target's directory followed
/// by rename.
pub fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let directory = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = tempfile::NamedTempFile::new_in(directory)?;
    temp.write_all(data)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|err| err.error)?;
    Ok(())
}
