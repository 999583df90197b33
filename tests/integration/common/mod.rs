#![allow(dead_code)]

use std::{
    fs,
    io::{Read, Write},
    os::unix::net::UnixStream,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use rootd::{
    config::ServiceConfig,
    service::RetryPolicy,
    supervisor::{ROOT_SERVICE, Supervisor},
};

/// Initializes a daemon set root the way `rootd setup` would, minus the
/// supervisor invocation plan.
pub fn init_root(route: &Path) -> ServiceConfig {
    let mut root = ServiceConfig::new(route.to_path_buf(), ROOT_SERVICE);
    root.create().expect("failed to initialize root");
    fs::create_dir_all(root.daemons_route()).expect("failed to create daemons dir");
    root
}

/// Writes a service directory under the root's `daemons/`.
pub fn add_service(
    root: &ServiceConfig,
    id: &str,
    executable: &str,
    parameters: &[&str],
    enabled: bool,
) -> ServiceConfig {
    let mut config = ServiceConfig::new(root.daemons_route().join(id), id);
    config.create().expect("failed to create service");
    config.executable = Some(executable.to_string());
    config.parameters = parameters.iter().map(|s| s.to_string()).collect();
    if enabled {
        config.set_actuates(true).expect("failed to enable service");
    }
    config.store().expect("failed to store service");
    config
}

/// A retry policy short enough for tests to observe full cycles.
pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        minimum_runtime: Duration::from_secs(10),
        retry_wait: Duration::from_millis(25),
        maximum_attempts: 3,
    }
}

/// A supervisor running its accept loop on a background thread.
pub struct RunningSupervisor {
    pub socket: PathBuf,
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl RunningSupervisor {
    pub fn start(route: &Path, policy: RetryPolicy) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let socket = route.join("if").join("http");
        let route = route.to_path_buf();

        let handle = thread::spawn(move || {
            let mut supervisor = Supervisor::with_policy(route, policy);
            if let Err(err) = supervisor.run(flag) {
                eprintln!("test supervisor failed: {err}");
            }
        });

        wait_for(|| socket.exists(), Duration::from_secs(5), "control socket");

        Self {
            socket,
            shutdown,
            handle: Some(handle),
        }
    }

    pub fn stop(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RunningSupervisor {
    fn drop(&mut self) {
        self.finish();
    }
}

/// A decoded control-plane response.
#[derive(Debug)]
pub struct Response {
    pub code: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).expect("response body is not JSON")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Issues one HTTP request over the control socket and reads the response
/// to EOF (the server closes after each exchange).
pub fn request(socket: &Path, method: &str, target: &str, body: Option<&str>) -> Response {
    let mut stream = UnixStream::connect(socket).expect("failed to connect control socket");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let body = body.unwrap_or("");
    let raw = format!(
        "{method} {target} HTTP/1.1\r\nHost: rootd\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(raw.as_bytes()).expect("request write failed");

    let mut buffer = Vec::new();
    stream
        .read_to_end(&mut buffer)
        .expect("response read failed");

    parse_response(&buffer)
}

fn parse_response(raw: &[u8]) -> Response {
    let split = raw
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .expect("response head incomplete");
    let head = String::from_utf8_lossy(&raw[..split]).into_owned();
    let body = raw[split + 4..].to_vec();

    let mut lines = head.lines();
    let status_line = lines.next().expect("missing status line");
    let mut parts = status_line.splitn(3, ' ');
    let _version = parts.next().unwrap_or_default();
    let code = parts
        .next()
        .and_then(|code| code.parse().ok())
        .expect("unparsable status code");
    let reason = parts.next().unwrap_or_default().to_string();

    let headers = lines
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect();

    Response {
        code,
        reason,
        headers,
        body,
    }
}

/// Polls until the service's reported status matches.
pub fn wait_for_status(socket: &Path, id: &str, status: &str, limit: Duration) {
    let deadline = Instant::now() + limit;
    loop {
        let response = request(socket, "GET", &format!("/{id}"), None);
        if response.code == 200 && response.json()[id]["status"] == status {
            return;
        }
        if Instant::now() >= deadline {
            panic!(
                "timed out waiting for '{id}' to reach '{status}', last response: {:?}",
                String::from_utf8_lossy(&response.body)
            );
        }
        thread::sleep(Duration::from_millis(25));
    }
}

pub fn wait_for(check: impl Fn() -> bool, limit: Duration, what: &str) {
    let deadline = Instant::now() + limit;
    while !check() {
        if Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        thread::sleep(Duration::from_millis(25));
    }
}
