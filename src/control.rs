//! # Control HTTP Interface
//!
//! A small HTTP/1.x server over the daemon set's local stream socket
//! (`<root>/if/http`). Requests are parsed directly off the connection;
//! service manipulations are rare and administrative, so the handler favors
//! clarity over throughput and serves one request per connection.
//!
//! Every response body is JSON and every response closes the connection.

use std::{
    io::{self, BufRead, BufReader, Read, Write},
    os::unix::net::UnixStream,
    sync::Arc,
};

use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::{
    config::ServiceConfig,
    error::ServiceError,
    service::{Recovery, ServiceMachine, Status},
    supervisor::Supervisor,
};

const MAX_ENTITY_BODY: u64 = 1 << 20;

/// A parsed control request.
#[derive(Debug)]
struct Request {
    method: String,
    path: Vec<String>,
    command: Option<String>,
    body: Vec<u8>,
    raw_target: String,
}

/// The closed set of service operations reachable over POST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Status,
    Reload,
    Normalize,
    Disable,
    Enable,
    Restart,
    Stop,
    Start,
    Interrupt,
    Kill,
    Sleep,
    Hold,
    Release,
}

impl Command {
    fn from_token(token: &str) -> Option<Self> {
        match token {
            "status" => Some(Self::Status),
            "reload" => Some(Self::Reload),
            "normalize" => Some(Self::Normalize),
            "disable" => Some(Self::Disable),
            "enable" => Some(Self::Enable),
            "restart" => Some(Self::Restart),
            "stop" => Some(Self::Stop),
            "start" => Some(Self::Start),
            "interrupt" => Some(Self::Interrupt),
            "kill" => Some(Self::Kill),
            "sleep" => Some(Self::Sleep),
            "hold" => Some(Self::Hold),
            "release" => Some(Self::Release),
            _ => None,
        }
    }
}

/// Reads one request from the connection, applies it against the
/// supervisor, and writes the response. Protocol violations are answered
/// with an error status; transport failures are logged and dropped.
pub fn handle_connection(supervisor: &mut Supervisor, stream: &mut UnixStream) {
    let request = match read_request(stream) {
        Ok(Some(request)) => request,
        Ok(None) => return,
        Err(err) => {
            debug!("unreadable control request: {err}");
            let _ = respond(stream, 400, "BAD REQUEST", &json!("malformed request"), false);
            return;
        }
    };

    debug!("control request {} {}", request.method, request.raw_target);
    if let Err(err) = dispatch(supervisor, stream, &request) {
        warn!("control response failed: {err}");
    }
}

fn dispatch(
    supervisor: &mut Supervisor,
    stream: &mut UnixStream,
    request: &Request,
) -> io::Result<()> {
    if request.method == "OPTIONS" {
        return respond_options(stream);
    }

    if request.path.len() > 1 {
        let body = json!("services do not have subdirectories");
        return respond(stream, 404, "NOT FOUND", &body, request.method == "HEAD");
    }

    let selector = request.path.first().map(String::as_str);
    if let Some(id) = selector
        && id != "*"
        && !valid_service_id(id)
    {
        let body = json!("invalid service identifier");
        return respond(stream, 400, "BAD REQUEST", &body, request.method == "HEAD");
    }

    match request.method.as_str() {
        "GET" | "HEAD" => handle_select(supervisor, stream, request, selector),
        "POST" => handle_post(supervisor, stream, request, selector),
        "DELETE" => handle_delete(supervisor, stream, selector),
        _ => {
            let body = json!("unsupported http method provided by client");
            respond(stream, 405, "METHOD NOT ALLOWED", &body, false)
        }
    }
}

/// GET `/` is the status index; GET `/<id>` is the full snapshot.
fn handle_select(
    supervisor: &Supervisor,
    stream: &mut UnixStream,
    request: &Request,
    selector: Option<&str>,
) -> io::Result<()> {
    let head_only = request.method == "HEAD";

    if request.command.is_some() {
        let body = json!("commands are issued with POST");
        return respond(stream, 400, "BAD REQUEST", &body, head_only);
    }

    let body = match selector {
        None => {
            let mut index = Map::new();
            for (id, machine) in supervisor.machines() {
                index.insert(id.to_string(), json!(machine.status().as_str()));
            }
            Value::Object(index)
        }
        Some(selector) => {
            let targets = match select_targets(supervisor, selector) {
                Ok(targets) => targets,
                Err(response) => {
                    return respond(stream, 404, "NOT FOUND", &response, head_only);
                }
            };

            let mut output = Map::new();
            for (id, machine) in targets {
                let mut entry = machine
                    .with_config(|config| serde_json::to_value(config.snapshot()))
                    .unwrap_or(Value::Null);
                if let Value::Object(fields) = &mut entry {
                    fields.insert("status".into(), json!(machine.status().as_str()));
                    fields.insert("pid".into(), json!(machine.pid()));
                }
                output.insert(id, entry);
            }
            Value::Object(output)
        }
    };

    respond(stream, 200, "OK", &body, head_only)
}

fn handle_post(
    supervisor: &mut Supervisor,
    stream: &mut UnixStream,
    request: &Request,
    selector: Option<&str>,
) -> io::Result<()> {
    // Validate the command before mutating anything.
    let command = match request.command.as_deref() {
        None => None,
        Some(token) => match Command::from_token(token) {
            Some(command) => Some(command),
            None => {
                let body = json!("command is not recognized");
                return respond(stream, 400, "UNKNOWN SERVICE OPERATION", &body, false);
            }
        },
    };

    let delta = match parse_delta(&request.body) {
        Ok(delta) => delta,
        Err(message) => {
            return respond(stream, 400, "BAD REQUEST", &json!(message), false);
        }
    };

    let Some(selector) = selector else {
        let body = json!("command is not recognized");
        return respond(stream, 400, "UNKNOWN SERVICE OPERATION", &body, false);
    };

    // Creation: POST to an unknown id carrying an entity body.
    if selector != "*" && supervisor.machine(selector).is_none() {
        let Some(delta) = delta else {
            return respond(stream, 404, "NOT FOUND", &json!("no such service"), false);
        };

        return match create_service(supervisor, selector, &delta) {
            Ok(machine) => {
                if let Some(command) = command {
                    let result = apply_command(command, &machine);
                    debug!("post-create command result: {result:?}");
                }
                respond(stream, 201, "CREATED", &json!("service created"), false)
            }
            Err(err) => {
                warn!("service creation failed for '{selector}': {err}");
                respond_service_error(stream, &err)
            }
        };
    }

    // Update path for an existing service.
    if selector != "*"
        && let Some(delta) = &delta
    {
        let machine = Arc::clone(supervisor.machine(selector).expect("selected above"));
        let updated = machine.with_config(|config| {
            config.update(delta)?;
            config.store()
        });
        if let Err(err) = updated {
            warn!("service update failed for '{selector}': {err}");
            return respond_service_error(stream, &err);
        }
        if command.is_none() {
            return respond(stream, 200, "OK", &json!("service update"), false);
        }
    }

    let Some(command) = command else {
        let body = json!("command is not recognized");
        return respond(stream, 400, "UNKNOWN SERVICE OPERATION", &body, false);
    };

    let targets = match select_targets(supervisor, selector) {
        Ok(targets) => targets,
        Err(response) => return respond(stream, 404, "NOT FOUND", &response, false),
    };

    let mut output = Map::new();
    for (id, machine) in targets {
        output.insert(id, apply_command(command, &machine));
    }
    respond(stream, 200, "OK", &Value::Object(output), false)
}

fn handle_delete(
    supervisor: &mut Supervisor,
    stream: &mut UnixStream,
    selector: Option<&str>,
) -> io::Result<()> {
    // An absent id behaves like the wildcard, per the command set's
    // broadcast convention.
    let selector = selector.unwrap_or("*");
    let targets = match select_targets(supervisor, selector) {
        Ok(targets) => targets,
        Err(response) => return respond(stream, 404, "NOT FOUND", &response, false),
    };

    if targets
        .iter()
        .any(|(_, machine)| machine.status() == Status::Executed)
    {
        let body = json!("running services may not be removed");
        return respond(stream, 409, "CONFLICT", &body, false);
    }

    for (id, machine) in targets {
        machine.set_recovery(Recovery::Permanent);
        if let Err(err) = machine.shutdown() {
            warn!("failed to finish service '{id}' before removal: {err}");
        }
        machine.wait_child_exit();
        supervisor.remove(&id);
        if let Err(err) = machine.with_config(|config| config.void()) {
            warn!("failed to void service directory '{id}': {err}");
            return respond_service_error(stream, &err);
        }
    }

    let body = json!("service daemon directories have been removed");
    respond(stream, 200, "OK", &body, false)
}

/// Resolves a selector to its target machines; `*` selects every service.
fn select_targets(
    supervisor: &Supervisor,
    selector: &str,
) -> Result<Vec<(String, Arc<ServiceMachine>)>, Value> {
    if selector == "*" {
        return Ok(supervisor
            .machines()
            .map(|(id, machine)| (id.to_string(), Arc::clone(machine)))
            .collect());
    }

    match supervisor.machine(selector) {
        Some(machine) => Ok(vec![(selector.to_string(), Arc::clone(machine))]),
        None => Err(json!("no such service")),
    }
}

fn create_service(
    supervisor: &mut Supervisor,
    id: &str,
    delta: &Map<String, Value>,
) -> Result<Arc<ServiceMachine>, ServiceError> {
    let route = supervisor.daemons_route().join(id);
    let mut config = ServiceConfig::new(route, id);
    let fresh = !config.exists();

    config.prepare()?;
    config.update(delta)?;
    config.store()?;
    if fresh {
        config.critical("service created")?;
    }

    Ok(supervisor.dispatch(config))
}

/// Applies one command to one machine, producing the per-service result.
fn apply_command(command: Command, machine: &Arc<ServiceMachine>) -> Value {
    let result = match command {
        Command::Status => Ok(machine.status().as_str().to_string()),
        Command::Enable => machine
            .with_config(|config| config.set_actuates(true))
            .map(|()| "enabled".to_string()),
        Command::Disable => machine
            .with_config(|config| config.set_actuates(false))
            .map(|()| "disabled".to_string()),
        Command::Stop => stop_like(machine, |m| m.signal_terminate(), StopVerb::Stop),
        Command::Interrupt => {
            stop_like(machine, |m| m.signal_interrupt(), StopVerb::Interrupt)
        }
        Command::Kill => stop_like(machine, |m| m.signal_kill(), StopVerb::Kill),
        Command::Restart => restart(machine),
        Command::Reload => reload(machine),
        Command::Start => start(machine),
        Command::Normalize => normalize(machine),
        Command::Sleep | Command::Hold => signal_running(
            machine,
            |m| m.signal_suspend(),
            "service signalled to pause",
        ),
        Command::Release => signal_running(
            machine,
            |m| m.signal_resume(),
            "service signalled to continue",
        ),
    };

    match result {
        Ok(message) => json!(message),
        Err(err) => json!(err.to_string()),
    }
}

#[derive(Clone, Copy)]
enum StopVerb {
    Stop,
    Interrupt,
    Kill,
}

impl StopVerb {
    fn ineffective(&self) -> &'static str {
        match self {
            StopVerb::Stop => "stop ineffective when not running",
            StopVerb::Interrupt => "interrupt ineffective when not running",
            StopVerb::Kill => "kill ineffective when not running",
        }
    }

    fn effective(&self) -> &'static str {
        match self {
            StopVerb::Stop => "daemon signalled to terminate",
            StopVerb::Interrupt => "daemon signalled to interrupt",
            StopVerb::Kill => "kill issued to service process",
        }
    }
}

/// Stop-family commands inhibit recovery (when the service would otherwise
/// actuate) before signalling.
fn stop_like(
    machine: &Arc<ServiceMachine>,
    deliver: impl Fn(&ServiceMachine) -> Result<(), ServiceError>,
    verb: StopVerb,
) -> Result<String, ServiceError> {
    if machine.actuates() {
        machine.set_recovery(Recovery::Permanent);
    } else {
        machine.set_recovery(Recovery::Normal);
    }

    if machine.status() != Status::Executed {
        return Ok(verb.ineffective().to_string());
    }

    deliver(machine)?;
    Ok(verb.effective().to_string())
}

fn restart(machine: &Arc<ServiceMachine>) -> Result<String, ServiceError> {
    if machine.status() != Status::Executed {
        return Ok("restart ineffective when not running".to_string());
    }

    machine.set_recovery(Recovery::InhibitOnce);
    machine.signal_terminate()?;
    Ok("daemon signalled to restart".to_string())
}

fn reload(machine: &Arc<ServiceMachine>) -> Result<String, ServiceError> {
    if machine.status() != Status::Executed {
        return Ok("reload ineffective when service is not running".to_string());
    }

    machine.signal_reload()?;
    Ok("daemon signalled to reload using SIGHUP".to_string())
}

fn start(machine: &Arc<ServiceMachine>) -> Result<String, ServiceError> {
    if machine.status() == Status::Executed {
        return Ok("already running".to_string());
    }

    machine.invoke()?;
    Ok("invoked".to_string())
}

/// Brings the machine into agreement with its stored actuation.
fn normalize(machine: &Arc<ServiceMachine>) -> Result<String, ServiceError> {
    let enabled = machine.actuates();
    let running = machine.status() == Status::Executed;

    if enabled && !running {
        machine.set_recovery(Recovery::InhibitOnce);
        machine.invoke()?;
        Ok("invoked".to_string())
    } else if !enabled && running {
        stop_like(machine, |m| m.signal_terminate(), StopVerb::Stop)
    } else {
        Ok("ineffective".to_string())
    }
}

fn signal_running(
    machine: &Arc<ServiceMachine>,
    deliver: impl Fn(&ServiceMachine) -> Result<(), ServiceError>,
    message: &str,
) -> Result<String, ServiceError> {
    if machine.status() != Status::Executed {
        return Ok("cannot signal service when not running".to_string());
    }

    deliver(machine)?;
    Ok(message.to_string())
}

fn parse_delta(body: &[u8]) -> Result<Option<Map<String, Value>>, &'static str> {
    if body.iter().all(|byte| byte.is_ascii_whitespace()) {
        return Ok(None);
    }

    let value: Value = serde_json::from_slice(body)
        .map_err(|_| "could not load json entity body")?;
    match value {
        Value::Object(map) => Ok(Some(map)),
        _ => Err("entity body must be a json object"),
    }
}

fn valid_service_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && !id.contains(['/', '\0'])
}

fn read_request(stream: &mut UnixStream) -> io::Result<Option<Request>> {
    let mut reader = BufReader::new(&*stream);

    let mut request_line = String::new();
    if reader.read_line(&mut request_line)? == 0 {
        return Ok(None);
    }

    let mut parts = request_line.split_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(target), Some(version)) => (method, target, version),
        _ => return Err(protocol_error("malformed request line")),
    };
    if !version.starts_with("HTTP/1.") {
        return Err(protocol_error("unsupported protocol version"));
    }

    let method = method.to_ascii_uppercase();
    let mut content_length: u64 = 0;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Err(protocol_error("connection closed inside headers"));
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }

        let Some((name, value)) = line.split_once(':') else {
            return Err(protocol_error("malformed header line"));
        };
        if name.eq_ignore_ascii_case("content-length") {
            content_length = value
                .trim()
                .parse()
                .map_err(|_| protocol_error("unparsable content-length"))?;
            if content_length > MAX_ENTITY_BODY {
                return Err(protocol_error("entity body too large"));
            }
        }
    }

    let mut body = vec![0u8; content_length as usize];
    reader.read_exact(&mut body)?;

    let raw_target = target.to_string();
    let (path, command) = parse_target(target);
    Ok(Some(Request {
        method,
        path,
        command,
        body,
        raw_target,
    }))
}

/// Splits a request target into path segments and the query-string command:
/// the first bare query key names the operation, later keys are parameters.
fn parse_target(target: &str) -> (Vec<String>, Option<String>) {
    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (target, None),
    };

    let segments = path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| segment.to_string())
        .collect();

    let command = query.and_then(|query| {
        let first = query.split('&').next()?;
        if first.is_empty() || first.contains('=') {
            return None;
        }
        Some(first.to_string())
    });

    (segments, command)
}

fn protocol_error(detail: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, detail)
}

fn respond_options(stream: &mut UnixStream) -> io::Result<()> {
    let head = "HTTP/1.1 204 NO CONTENT\r\n\
                Allow: GET,HEAD,POST,DELETE\r\n\
                Connection: close\r\n\
                \r\n";
    stream.write_all(head.as_bytes())?;
    stream.flush()
}

fn respond_service_error(stream: &mut UnixStream, err: &ServiceError) -> io::Result<()> {
    match err {
        ServiceError::Delta(_) | ServiceError::Plan(_) => {
            respond(stream, 400, "BAD REQUEST", &json!(err.to_string()), false)
        }
        _ => respond(
            stream,
            500,
            "INTERNAL SERVER ERROR",
            &json!("exception raised during operation"),
            false,
        ),
    }
}

fn respond(
    stream: &mut UnixStream,
    code: u16,
    reason: &str,
    body: &Value,
    head_only: bool,
) -> io::Result<()> {
    let payload = serde_json::to_vec(body).unwrap_or_else(|_| b"null".to_vec());
    let head = format!(
        "HTTP/1.1 {code} {reason}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n",
        payload.len()
    );

    stream.write_all(head.as_bytes())?;
    if !head_only {
        stream.write_all(&payload)?;
    }
    stream.flush()
}
