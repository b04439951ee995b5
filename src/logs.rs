//! Live log streaming for process-backed sites.
//!
//! A session spawns one follower process (journalctl by default), turns its
//! stdout into classified chunks in arrival order, and tears the process down
//! when the follower exits, the session is cancelled, or the consumer goes
//! away, whichever comes first.

use std::io;
use std::process::Stdio;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LogConfig;
use crate::error::{PanelError, PanelResult};
use crate::registry::{Principal, SiteRegistry, TenantAuthz};

static SERVICE_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9.\-]+$").expect("valid service pattern"));

const CHANNEL_CAPACITY: usize = 64;
const MAX_SERVICE_LEN: usize = 255;

/// Builds the process that follows a service's log.
pub trait FollowerCommand: Send + Sync {
    fn command(&self, service: &str, backlog_lines: u32) -> Command;

    /// Program name for diagnostics.
    fn program(&self) -> &str;
}

/// Follows a systemd unit through journalctl.
#[derive(Debug, Clone)]
pub struct Journalctl {
    binary: String,
    use_sudo: bool,
}

impl Journalctl {
    pub fn new(binary: impl Into<String>, use_sudo: bool) -> Self {
        Self {
            binary: binary.into(),
            use_sudo,
        }
    }

    pub fn from_config(config: &LogConfig) -> Self {
        Self::new(config.follower_binary.clone(), config.use_sudo)
    }
}

impl FollowerCommand for Journalctl {
    fn command(&self, service: &str, backlog_lines: u32) -> Command {
        let mut cmd = if self.use_sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg("-n").arg(&self.binary);
            cmd
        } else {
            Command::new(&self.binary)
        };

        cmd.arg("-u")
            .arg(service)
            .arg("-n")
            .arg(backlog_lines.to_string())
            .arg("-f")
            .arg("--no-pager")
            .arg("-o")
            .arg("short-iso");
        cmd
    }

    fn program(&self) -> &str {
        &self.binary
    }
}

/// Presentation class of a log line.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LineClass {
    Error,
    Warning,
    Info,
    Notice,
    Default,
}

impl LineClass {
    pub fn as_str(self) -> &'static str {
        match self {
            LineClass::Error => "error",
            LineClass::Warning => "warning",
            LineClass::Info => "info",
            LineClass::Notice => "notice",
            LineClass::Default => "default",
        }
    }
}

/// Tag a line by keyword. Tagging is cosmetic; lines pass through unchanged.
pub fn classify_line(line: &str) -> LineClass {
    let lower = line.to_ascii_lowercase();
    if lower.contains("error") || lower.contains("failed") {
        LineClass::Error
    } else if lower.contains("warning") {
        LineClass::Warning
    } else if lower.contains("info") {
        LineClass::Info
    } else if lower.contains("notice") {
        LineClass::Notice
    } else {
        LineClass::Default
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CloseReason {
    /// The follower exited on its own.
    Exited,
    /// The session was cancelled or its consumer went away.
    Cancelled,
    /// The follower could not be started.
    Failed,
}

/// One unit of streamed output.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LogChunk {
    Line { class: LineClass, text: String },
    Stderr { text: String },
    Diagnostic { text: String },
    Closed {
        reason: CloseReason,
        exit_code: Option<i32>,
    },
}

impl LogChunk {
    pub fn event_name(&self) -> &'static str {
        match self {
            LogChunk::Line { class, .. } => class.as_str(),
            LogChunk::Stderr { .. } => "stderr",
            LogChunk::Diagnostic { .. } => "diagnostic",
            LogChunk::Closed { .. } => "closed",
        }
    }

    pub fn text(&self) -> String {
        match self {
            LogChunk::Line { text, .. }
            | LogChunk::Stderr { text }
            | LogChunk::Diagnostic { text } => text.clone(),
            LogChunk::Closed {
                reason,
                exit_code: Some(code),
            } => format!("[stream closed: {reason:?}, exit code {code}]").to_lowercase(),
            LogChunk::Closed { reason, .. } => {
                format!("[stream closed: {reason:?}]").to_lowercase()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Streaming,
    Draining,
    Closed,
}

/// Validates and authorizes log requests and hands out sessions.
#[derive(Clone)]
pub struct LogStreamer {
    registry: Arc<dyn SiteRegistry>,
    authz: Arc<dyn TenantAuthz>,
    follower: Arc<dyn FollowerCommand>,
    settings: LogConfig,
}

impl LogStreamer {
    pub fn new(
        registry: Arc<dyn SiteRegistry>,
        authz: Arc<dyn TenantAuthz>,
        follower: Arc<dyn FollowerCommand>,
        settings: LogConfig,
    ) -> Self {
        Self {
            registry,
            authz,
            follower,
            settings,
        }
    }

    pub fn validate_service(&self, service: &str) -> PanelResult<()> {
        let suffix = self.settings.service_suffix.as_str();
        let valid = service.len() <= MAX_SERVICE_LEN
            && service.len() > suffix.len()
            && service.ends_with(suffix)
            && SERVICE_CHARS.is_match(service);

        if valid {
            Ok(())
        } else {
            Err(PanelError::InvalidArgument(format!(
                "invalid service identifier: {service:?}"
            )))
        }
    }

    /// Run the upfront checks for a log view. Nothing is spawned until the
    /// returned session is started.
    pub fn open(&self, service: &str, principal: &Principal) -> PanelResult<LogStreamSession> {
        self.validate_service(service)?;
        let tenant = self.registry.lookup_service_owner(service)?;

        if !self.authz.authorize(&tenant, principal) {
            warn!(
                service,
                tenant = %tenant,
                principal = principal.as_str(),
                "Log access denied"
            );
            return Err(PanelError::PermissionDenied(format!(
                "{} may not view logs of {}",
                principal.as_str(),
                service
            )));
        }

        debug!(service, tenant = %tenant, "Log session authorized");
        Ok(LogStreamSession {
            service: service.to_string(),
            follower: self.follower.clone(),
            settings: self.settings.clone(),
            cancel: CancellationToken::new(),
        })
    }
}

/// One viewer's log stream and the follower process behind it.
pub struct LogStreamSession {
    service: String,
    follower: Arc<dyn FollowerCommand>,
    settings: LogConfig,
    cancel: CancellationToken,
}

impl LogStreamSession {
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Token that ends the session when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawn the follower on a dedicated task and return its output.
    ///
    /// Dropping the returned stream counts as a disconnect.
    pub fn start(self) -> ReceiverStream<LogChunk> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(self.run(tx));
        ReceiverStream::new(rx)
    }

    async fn run(self, tx: mpsc::Sender<LogChunk>) {
        let mut state = SessionState::Starting;
        debug!(service = %self.service, ?state, "Log session");

        let mut command = self
            .follower
            .command(&self.service, self.settings.backlog_lines);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(service = %self.service, "Failed to start log follower: {}", err);
                let text = spawn_failure_message(self.follower.program(), &self.service, &err);
                let _ = tx.send(LogChunk::Diagnostic { text }).await;
                let _ = tx
                    .send(LogChunk::Closed {
                        reason: CloseReason::Failed,
                        exit_code: None,
                    })
                    .await;
                return;
            }
        };
        info!(service = %self.service, pid = ?child.id(), "Log follower started");

        let stdout = child.stdout.take();
        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(collect_stderr(stderr, self.settings.stderr_limit_bytes))
        });

        state = SessionState::Streaming;
        debug!(service = %self.service, ?state, "Log session");

        let mut reason = CloseReason::Exited;
        let mut diagnostics = Vec::new();

        if let Some(stdout) = stdout {
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        reason = CloseReason::Cancelled;
                        break;
                    }
                    _ = tx.closed() => {
                        reason = CloseReason::Cancelled;
                        break;
                    }
                    read = reader.read_until(b'\n', &mut buf) => {
                        match read {
                            Ok(0) => break,
                            Ok(_) => {
                                let line = decode_line(&buf);
                                buf.clear();
                                let chunk = LogChunk::Line {
                                    class: classify_line(&line),
                                    text: line,
                                };
                                tokio::select! {
                                    sent = tx.send(chunk) => {
                                        if sent.is_err() {
                                            reason = CloseReason::Cancelled;
                                            break;
                                        }
                                    }
                                    _ = self.cancel.cancelled() => {
                                        reason = CloseReason::Cancelled;
                                        break;
                                    }
                                }
                            }
                            Err(err) => {
                                warn!(service = %self.service, "Log follower output unreadable: {}", err);
                                diagnostics.push(format!("log output could not be read: {err}"));
                                break;
                            }
                        }
                    }
                }
            }
        }

        state = SessionState::Draining;
        debug!(service = %self.service, ?state, ?reason, "Log session");

        let grace = self.settings.kill_grace();
        let exit_code = terminate(&mut child, reason == CloseReason::Cancelled, grace).await;

        let stderr = match stderr_task {
            Some(task) => match tokio::time::timeout(grace, task).await {
                Ok(Ok(text)) => text,
                _ => String::new(),
            },
            None => String::new(),
        };

        if stderr.to_ascii_lowercase().contains("permission")
            || stderr.contains("not seeing messages")
        {
            diagnostics.push(format!(
                "insufficient permission to read logs for {}",
                self.service
            ));
        }

        for line in stderr.lines().filter(|line| !line.trim().is_empty()) {
            let _ = tx
                .send(LogChunk::Stderr {
                    text: line.to_string(),
                })
                .await;
        }
        for text in diagnostics {
            let _ = tx.send(LogChunk::Diagnostic { text }).await;
        }
        let _ = tx.send(LogChunk::Closed { reason, exit_code }).await;

        state = SessionState::Closed;
        info!(service = %self.service, ?state, ?reason, ?exit_code, "Log session ended");
    }
}

/// Turn one raw output line into text. Invalid UTF-8 is replaced, never
/// dropped.
fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

fn spawn_failure_message(program: &str, service: &str, err: &io::Error) -> String {
    match err.kind() {
        io::ErrorKind::NotFound => format!("log follower `{program}` was not found"),
        io::ErrorKind::PermissionDenied => {
            format!("permission denied starting `{program}` for {service}")
        }
        _ => format!("could not start `{program}` for {service}: {err}"),
    }
}

async fn collect_stderr(mut stderr: ChildStderr, limit: usize) -> String {
    let mut buf = Vec::new();
    if let Err(err) = (&mut stderr).take(limit as u64).read_to_end(&mut buf).await {
        debug!("Log follower stderr read failed: {}", err);
    }
    // Keep the pipe drained so the follower never blocks on it.
    let _ = tokio::io::copy(&mut stderr, &mut tokio::io::sink()).await;
    String::from_utf8_lossy(&buf).into_owned()
}

/// Stop the follower and reap it. Never waits longer than `grace` before
/// escalating to SIGKILL.
async fn terminate(child: &mut Child, request_stop: bool, grace: Duration) -> Option<i32> {
    if let Ok(Some(status)) = child.try_wait() {
        return status.code();
    }

    if request_stop {
        if let Some(pid) = child.id() {
            debug!(pid, "Sending SIGTERM to log follower");
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => status.code(),
        Ok(Err(err)) => {
            warn!("Error waiting for log follower: {:?}", err);
            None
        }
        Err(_) => {
            warn!("Log follower did not exit within {:?}, killing", grace);
            if let Err(err) = child.kill().await {
                warn!("Failed to kill log follower: {:?}", err);
            }
            None
        }
    }
}
