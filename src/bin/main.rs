use std::os::unix::io::AsRawFd;
use std::os::unix::process::CommandExt;
use std::{
    env, fs, io,
    path::{Path, PathBuf},
    process::{Command, ExitCode},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use tracing::error;
use tracing_subscriber::EnvFilter;

use rootd::{
    cli::{Cli, Commands, ConfigureAction, parse_args},
    config::{self, Actuation, ServiceConfig},
    error::ServiceError,
    service::SERVICE_NAME_VAR,
    supervisor::{DAEMONS_ENV, ROOT_SERVICE, Supervisor},
};

const EX_USAGE: u8 = 64;
const EX_CONFIG: u8 = 78;
const EX_NOT_HERE: u8 = 128;

fn main() -> ExitCode {
    let args = parse_args();
    init_logging(&args);

    let route = config::identify_route(args.directory.as_deref());
    let code = match args.command {
        Commands::Setup => setup(route),
        Commands::Boot => boot(route),
        Commands::Run => run(route),
        Commands::Halt => halt(route),
        Commands::Configure { service, action } => configure(route, &service, action),
    };

    ExitCode::from(code)
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    // Logs go to stderr; `boot` points the supervisor's stderr at the root
    // critical log before exec.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(false)
        .try_init();
}

/// Initializes a daemon set root: the root service directory plus the
/// supervisor's own invocation plan, so `boot` knows what to exec.
fn setup(route: PathBuf) -> u8 {
    let mut root = ServiceConfig::new(route.clone(), ROOT_SERVICE);
    let result = (|| -> Result<(), ServiceError> {
        root.create()?;
        root.executable = env::current_exe()
            .ok()
            .map(|path| path.to_string_lossy().into_owned());
        root.parameters = vec![ROOT_SERVICE.to_string(), "run".to_string()];
        root.actuation = Actuation::Enabled;
        root.store()?;
        fs::create_dir_all(root.daemons_route())?;
        Ok(())
    })();

    match result {
        Ok(()) => {
            println!("initialized daemon set at {}", route.display());
            0
        }
        Err(err) => {
            eprintln!("error: failed to initialize daemon set: {err}");
            EX_CONFIG
        }
    }
}

/// Starts the supervisor detached from the terminal: verify the set, check
/// the PID file, fork, become session leader, point stderr at the critical
/// log, and exec the stored supervisor invocation.
fn boot(route: PathBuf) -> u8 {
    let mut root = ServiceConfig::new(route.clone(), ROOT_SERVICE);
    if !root.is_consistent() {
        eprintln!("error: daemon set {} is not initialized", route.display());
        return EX_CONFIG;
    }
    if let Err(err) = root.load() {
        eprintln!("error: unreadable daemon set configuration: {err}");
        return EX_CONFIG;
    }

    match root.load_pid() {
        Ok(Some(pid)) if pid != 0 && process_alive(pid) => {
            eprintln!("error: root daemon is already running (pid {pid})");
            return EX_NOT_HERE;
        }
        Ok(_) => {}
        Err(err) => {
            eprintln!("error: unreadable pid file: {err}");
            return EX_CONFIG;
        }
    }

    match unsafe { libc::fork() } {
        -1 => {
            eprintln!("error: fork failed: {}", io::Error::last_os_error());
            return 1;
        }
        0 => {}
        _ => return 0,
    }

    // Child from here on.
    unsafe {
        libc::setsid();
    }

    if let Err(err) = redirect_stderr(&root.critical_log_path()) {
        error!("failed to redirect stderr to critical log: {err}");
    }

    unsafe {
        env::set_var(SERVICE_NAME_VAR, ROOT_SERVICE);
        env::set_var(config::ENVIRONMENT, &route);
        env::set_var(DAEMONS_ENV, &route);
    }

    if let Some(executable) = root.executable.clone() {
        let mut command = Command::new(&executable);
        if let Some((argv0, rest)) = root.parameters.split_first() {
            command.arg0(argv0);
            command.args(rest);
        }
        for (name, value) in &root.environment {
            match value {
                Some(value) => command.env(name, value),
                None => command.env_remove(name),
            };
        }

        let err = command.exec();
        error!("failed to exec supervisor {executable}: {err}");
    }

    // No usable invocation plan; supervise in-process instead.
    run(route)
}

/// Runs the supervisor in the foreground until a termination signal.
fn run(route: PathBuf) -> u8 {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    if let Err(err) = ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    }) {
        error!("failed to register termination handler: {err}");
        return 1;
    }

    let mut supervisor = Supervisor::new(route);
    match supervisor.run(shutdown) {
        Ok(()) => 0,
        Err(err @ (ServiceError::CorruptState { .. } | ServiceError::Plan(_))) => {
            error!("supervisor configuration error: {err}");
            EX_CONFIG
        }
        Err(err) => {
            error!("supervisor failed: {err}");
            1
        }
    }
}

/// Sends SIGTERM to the PID recorded in the daemon set's PID file.
fn halt(route: PathBuf) -> u8 {
    let root = ServiceConfig::new(route.clone(), ROOT_SERVICE);
    if !root.exists() {
        eprintln!("error: daemon set {} is not initialized", route.display());
        return EX_CONFIG;
    }

    let mut running = false;
    match root.load_pid() {
        Ok(Some(pid)) if pid != 0 => {
            match signal::kill(Pid::from_raw(pid), Signal::SIGTERM) {
                Ok(()) => running = true,
                Err(nix::errno::Errno::ESRCH) => {
                    let _ = root.store_pid(0);
                }
                Err(err) => {
                    eprintln!("error: failed to signal pid {pid}: {err}");
                    return 1;
                }
            }
        }
        Ok(_) => {
            let _ = root.store_pid(0);
        }
        Err(err) => {
            eprintln!("error: unreadable pid file: {err}");
            return EX_CONFIG;
        }
    }

    if !running {
        eprintln!("error: root daemon ({}) is not running", route.display());
        return EX_NOT_HERE;
    }

    0
}

/// Offline mutation of a service directory. A running supervisor is not
/// notified of the changes.
fn configure(route: PathBuf, service: &str, action: ConfigureAction) -> u8 {
    if service.is_empty() || service == "." || service == ".." || service.contains('/') {
        eprintln!("error: invalid service name '{service}'");
        return EX_USAGE;
    }

    let service_route = route.join(config::DAEMONS_DIR).join(service);
    let mut config = ServiceConfig::new(service_route, service);

    let result: Result<(), ServiceError> = match action {
        ConfigureAction::Create {
            executable,
            parameters,
        } => {
            if config.exists() {
                eprintln!("error: service directory already exists");
                return EX_CONFIG;
            }
            (|| {
                config.create()?;
                if let Some(executable) = executable {
                    config.executable = Some(executable);
                    config.parameters = parameters;
                    config.store()?;
                }
                Ok(())
            })()
        }
        ConfigureAction::Void => {
            if !config.exists() {
                eprintln!("error: service directory does not exist");
                return EX_CONFIG;
            }
            config.void()
        }
        ConfigureAction::Command {
            executable,
            parameters,
        } => (|| {
            config.load()?;
            config.executable = Some(executable);
            config.parameters = parameters;
            config.store()
        })(),
        ConfigureAction::Enable => (|| {
            config.load_actuation()?;
            config.set_actuates(true)
        })(),
        ConfigureAction::Disable => (|| {
            config.load_actuation()?;
            config.set_actuates(false)
        })(),
        ConfigureAction::EnvAdd { pairs } => {
            if pairs.is_empty() || pairs.len() % 2 != 0 {
                eprintln!("error: env-add expects NAME VALUE pairs");
                return EX_USAGE;
            }
            (|| {
                config.load()?;
                for pair in pairs.chunks(2) {
                    config
                        .environment
                        .push((pair[0].clone(), Some(pair[1].clone())));
                }
                config.store_invocation()
            })()
        }
        ConfigureAction::EnvDel { names } => (|| {
            config.load()?;
            config.environment.retain(|(name, _)| !names.contains(name));
            config.store_invocation()
        })(),
        ConfigureAction::Report => (|| {
            config.load()?;
            report(&config);
            Ok(())
        })(),
    };

    match result {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("error: {err}");
            EX_CONFIG
        }
    }
}

fn report(config: &ServiceConfig) {
    let mut command: Vec<&str> = Vec::new();
    if let Some(executable) = config.executable.as_deref() {
        command.push(executable);
    }
    command.extend(config.parameters.iter().map(String::as_str));

    eprintln!("Service: {}", config.id());
    eprintln!("Actuation: {}", config.actuation);
    eprintln!("Directory: {}", config.route().display());
    eprintln!("Command: {}", command.join(" "));
    for (name, value) in &config.environment {
        match value {
            Some(value) => eprintln!("Environment: {name}={value}"),
            None => eprintln!("Environment: {name} (unset)"),
        }
    }
    if let Some(text) = config.abstract_text.as_deref() {
        eprintln!("Documentation:\n{text}");
    }
}

fn redirect_stderr(path: &Path) -> io::Result<()> {
    let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    let fd = file.as_raw_fd();
    if fd == libc::STDERR_FILENO {
        std::mem::forget(file);
        return Ok(());
    }

    let rc = unsafe { libc::dup2(fd, libc::STDERR_FILENO) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn process_alive(pid: i32) -> bool {
    signal::kill(Pid::from_raw(pid), None).is_ok()
}
