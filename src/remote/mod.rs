//! # Remote Process Handles
//!
//! A [`RemoteProcessHandle`] wraps one benchmark process (server or client)
//! launched on a cluster node through a [`RemoteExecutor`]. It exposes the
//! three waits the pair runner needs and a termination primitive:
//!
//! - `start`: launch without waiting for the process, state `Starting`
//! - `await_ready`: bounded wait for an externally observable readiness signal
//! - `await_completion`: bounded wait for exit, draining all output
//! - `terminate`: SIGTERM, grace window, SIGKILL; idempotent
//!
//! Timeouts are reported as values (`Readiness::Timeout`, `Completion::Timeout`)
//! rather than errors so callers can tell "never became ready" apart from
//! "crashed" (a non-zero exit is captured inside `Completion::Completed`).
//!
//! ## Lifecycle
//!
//! ```text
//! Pending → Starting → Ready → Running → Completed | Failed | Cancelled
//! ```
//!
//! A handle that is dropped before reaching a terminal state is force-killed,
//! so a panic or an early return in the owner never leaks a remote process.

use crate::error::{OrchestratorError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, warn};

pub mod launcher;

#[cfg(test)]
pub(crate) mod testing;

pub use launcher::{CommandExecutor, Launcher};

/// Interval between polls for port probes and readiness predicates.
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Once a process has exited, how long to keep collecting output that is
/// still in flight (e.g. forwarded by `srun` or `ssh`).
pub const OUTPUT_DRAIN_WINDOW: Duration = Duration::from_secs(1);

/// Whether a process plays the server or the client side of a pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessRole {
    Server,
    Client,
}

impl std::fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessRole::Server => write!(f, "server"),
            ProcessRole::Client => write!(f, "client"),
        }
    }
}

/// Lifecycle state of a remote process handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Pending,
    Starting,
    Ready,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ProcessState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessState::Completed | ProcessState::Failed | ProcessState::Cancelled
        )
    }
}

/// Exit status of a remote process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitStatus {
    pub fn from_code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn from_signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// Signals the orchestrator sends to remote processes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminationSignal {
    /// Graceful termination (SIGTERM).
    Terminate,
    /// Forceful kill (SIGKILL).
    Kill,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of output produced by a remote process.
#[derive(Clone, Debug)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

/// Control side of a launched process (the "process token").
#[async_trait]
pub trait ProcessControl: Send {
    /// Deliver a signal to the process.
    async fn signal(&mut self, signal: TerminationSignal) -> std::io::Result<()>;

    /// Wait for the process to exit. Must be cancel-safe.
    async fn wait(&mut self) -> std::io::Result<ExitStatus>;

    /// Non-blocking exit check.
    fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>>;

    /// Best-effort synchronous kill, used when a handle is dropped early.
    fn kill_now(&mut self);
}

/// A freshly launched process: its control token and its output stream.
pub struct RemoteProcess {
    pub control: Box<dyn ProcessControl>,
    pub output: mpsc::UnboundedReceiver<OutputLine>,
}

/// Remote execution capability provided by the cluster scheduler.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Launch `command args...` on `host`. Rejections are `OrchestratorError::Launch`.
    async fn launch(&self, host: &str, command: &str, args: &[String]) -> Result<RemoteProcess>;

    /// Name for logs.
    fn name(&self) -> &'static str;
}

/// Identity of a process to launch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub host: String,
    pub command: String,
    pub args: Vec<String>,
    pub role: ProcessRole,
}

impl ProcessSpec {
    pub fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// What a readiness predicate can observe.
pub struct ReadinessProbe<'a> {
    pub stdout: &'a [String],
    pub stderr: &'a [String],
    pub elapsed: Duration,
}

pub type ReadinessPredicate = Arc<dyn Fn(&ReadinessProbe<'_>) -> bool + Send + Sync>;

/// How to decide that a server is ready to accept the benchmark connection.
#[derive(Clone)]
pub enum ReadinessCheck {
    /// A stdout/stderr line contains the given text.
    LogPattern(String),
    /// A TCP connection to `address:port` succeeds.
    PortProbe {
        address: String,
        port: u16,
        interval: Duration,
    },
    /// Assume readiness after a fixed delay. Race-prone; fallback only.
    FixedDelay(Duration),
    /// Caller-supplied predicate, evaluated on every output line and poll tick.
    Predicate(ReadinessPredicate),
}

impl std::fmt::Debug for ReadinessCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadinessCheck::LogPattern(p) => f.debug_tuple("LogPattern").field(p).finish(),
            ReadinessCheck::PortProbe {
                address,
                port,
                interval,
            } => f
                .debug_struct("PortProbe")
                .field("address", address)
                .field("port", port)
                .field("interval", interval)
                .finish(),
            ReadinessCheck::FixedDelay(d) => f.debug_tuple("FixedDelay").field(d).finish(),
            ReadinessCheck::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// Result of [`RemoteProcessHandle::await_ready`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Timeout,
    /// The process exited before it ever became ready.
    Exited(ExitStatus),
}

/// Result of [`RemoteProcessHandle::await_completion`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Completion {
    Completed {
        status: ExitStatus,
        stdout: String,
        stderr: String,
    },
    Timeout,
}

enum WaitEvent {
    Line(Option<OutputLine>),
    Exited(std::io::Result<ExitStatus>),
    Poll,
    Deadline,
}

async fn next_line(output: &mut Option<mpsc::UnboundedReceiver<OutputLine>>) -> Option<OutputLine> {
    match output {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Handle to one launched benchmark process.
pub struct RemoteProcessHandle {
    spec: ProcessSpec,
    state: ProcessState,
    control: Box<dyn ProcessControl>,
    output: Option<mpsc::UnboundedReceiver<OutputLine>>,
    stdout: Vec<String>,
    stderr: Vec<String>,
    exit_status: Option<ExitStatus>,
    diagnostics: Vec<String>,
    grace: Duration,
    started_at: Instant,
}

impl RemoteProcessHandle {
    /// Launch the process described by `spec` and return immediately.
    ///
    /// `grace` is the window given to the process to exit after SIGTERM (and
    /// again after SIGKILL) when it is terminated.
    pub async fn start(
        executor: &dyn RemoteExecutor,
        spec: ProcessSpec,
        grace: Duration,
    ) -> Result<Self> {
        debug!(
            "Launching {} on {} via {}: {}",
            spec.role,
            spec.host,
            executor.name(),
            spec.command_line()
        );
        let process = executor.launch(&spec.host, &spec.command, &spec.args).await?;
        Ok(Self {
            spec,
            state: ProcessState::Starting,
            control: process.control,
            output: Some(process.output),
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_status: None,
            diagnostics: Vec::new(),
            grace,
            started_at: Instant::now(),
        })
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    pub fn stdout_lines(&self) -> &[String] {
        &self.stdout
    }

    pub fn stderr_lines(&self) -> &[String] {
        &self.stderr
    }

    pub fn stdout_text(&self) -> String {
        self.stdout.join("\n")
    }

    pub fn stderr_text(&self) -> String {
        self.stderr.join("\n")
    }

    /// Cleanup problems observed while terminating this process.
    pub fn diagnostics(&self) -> &[String] {
        &self.diagnostics
    }

    /// Record that the process is now doing its real work.
    pub fn mark_running(&mut self) {
        if matches!(self.state, ProcessState::Starting | ProcessState::Ready) {
            self.state = ProcessState::Running;
        }
    }

    fn record_line(&mut self, line: OutputLine) {
        match line.stream {
            OutputStream::Stdout => self.stdout.push(line.text),
            OutputStream::Stderr => self.stderr.push(line.text),
        }
    }

    /// Pull whatever output is already buffered without waiting.
    fn drain_buffered(&mut self) {
        let mut lines = Vec::new();
        if let Some(rx) = self.output.as_mut() {
            loop {
                match rx.try_recv() {
                    Ok(line) => lines.push(line),
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        self.output = None;
                        break;
                    }
                }
            }
        }
        for line in lines {
            self.record_line(line);
        }
    }

    fn record_exit(&mut self, status: std::io::Result<ExitStatus>) -> ExitStatus {
        let status = match status {
            Ok(status) => status,
            Err(e) => {
                self.diagnostics
                    .push(format!("failed to wait for {}: {}", self.spec.role, e));
                ExitStatus {
                    code: None,
                    signal: None,
                }
            }
        };
        self.exit_status = Some(status);
        self.drain_buffered();
        status
    }

    fn line_satisfies(check: &ReadinessCheck, line: &str) -> bool {
        match check {
            ReadinessCheck::LogPattern(pattern) => line.contains(pattern.as_str()),
            _ => false,
        }
    }

    fn predicate_satisfied(&self, check: &ReadinessCheck) -> bool {
        match check {
            ReadinessCheck::Predicate(predicate) => predicate(&ReadinessProbe {
                stdout: &self.stdout,
                stderr: &self.stderr,
                elapsed: self.started_at.elapsed(),
            }),
            _ => false,
        }
    }

    async fn probe_port(address: &str, port: u16, interval: Duration) -> bool {
        let attempt = tokio::net::TcpStream::connect((address, port));
        matches!(timeout(interval, attempt).await, Ok(Ok(_)))
    }

    /// Wait until `check` reports readiness, the process exits, or `limit` elapses.
    pub async fn await_ready(&mut self, limit: Duration, check: &ReadinessCheck) -> Readiness {
        if let Some(status) = self.exit_status {
            return Readiness::Exited(status);
        }
        if self.state == ProcessState::Ready {
            return Readiness::Ready;
        }

        let begin = Instant::now();
        let deadline = begin + limit;
        let mut next_poll = match check {
            ReadinessCheck::LogPattern(_) => None,
            ReadinessCheck::FixedDelay(delay) => Some(begin + *delay),
            ReadinessCheck::PortProbe { .. } => Some(begin),
            ReadinessCheck::Predicate(_) => Some(begin),
        };

        // Output that arrived before this call counts too.
        self.drain_buffered();
        let seen_ready = self
            .stdout
            .iter()
            .chain(self.stderr.iter())
            .any(|l| Self::line_satisfies(check, l))
            || self.predicate_satisfied(check);
        if seen_ready {
            self.state = ProcessState::Ready;
            return Readiness::Ready;
        }

        loop {
            let poll_at = next_poll.filter(|p| *p <= deadline);
            let event = {
                let output = &mut self.output;
                let control = &mut self.control;
                tokio::select! {
                    biased;
                    line = next_line(output) => WaitEvent::Line(line),
                    status = control.wait() => WaitEvent::Exited(status),
                    _ = sleep_until(poll_at.unwrap_or(deadline)), if poll_at.is_some() => WaitEvent::Poll,
                    _ = sleep_until(deadline) => WaitEvent::Deadline,
                }
            };

            match event {
                WaitEvent::Line(Some(line)) => {
                    let ready = Self::line_satisfies(check, &line.text);
                    self.record_line(line);
                    if ready || self.predicate_satisfied(check) {
                        self.state = ProcessState::Ready;
                        return Readiness::Ready;
                    }
                }
                WaitEvent::Line(None) => self.output = None,
                WaitEvent::Exited(status) => {
                    let status = self.record_exit(status);
                    self.state = ProcessState::Failed;
                    debug!(
                        "{} on {} exited before ready ({})",
                        self.spec.role, self.spec.host, status
                    );
                    return Readiness::Exited(status);
                }
                WaitEvent::Poll => {
                    let ready = match check {
                        ReadinessCheck::FixedDelay(_) => {
                            next_poll = None;
                            true
                        }
                        ReadinessCheck::PortProbe {
                            address,
                            port,
                            interval,
                        } => {
                            next_poll = Some(Instant::now() + *interval);
                            Self::probe_port(address, *port, *interval).await
                        }
                        ReadinessCheck::Predicate(_) => {
                            next_poll = Some(Instant::now() + POLL_INTERVAL);
                            self.predicate_satisfied(check)
                        }
                        ReadinessCheck::LogPattern(_) => false,
                    };
                    if ready {
                        self.state = ProcessState::Ready;
                        return Readiness::Ready;
                    }
                }
                WaitEvent::Deadline => return Readiness::Timeout,
            }
        }
    }

    /// Wait for the process to exit within `limit`, collecting all of its output.
    pub async fn await_completion(&mut self, limit: Duration) -> Completion {
        let mut deadline = Instant::now() + limit;

        loop {
            if self.exit_status.is_some() && self.output.is_none() {
                break;
            }

            let waiting_exit = self.exit_status.is_none();
            let event = {
                let output = &mut self.output;
                let control = &mut self.control;
                tokio::select! {
                    biased;
                    line = next_line(output) => WaitEvent::Line(line),
                    status = control.wait(), if waiting_exit => WaitEvent::Exited(status),
                    _ = sleep_until(deadline) => WaitEvent::Deadline,
                }
            };

            match event {
                WaitEvent::Line(Some(line)) => self.record_line(line),
                WaitEvent::Line(None) => self.output = None,
                WaitEvent::Exited(status) => {
                    self.record_exit(status);
                    deadline = deadline.min(Instant::now() + OUTPUT_DRAIN_WINDOW);
                }
                WaitEvent::Poll => {}
                WaitEvent::Deadline => {
                    if self.exit_status.is_none() {
                        return Completion::Timeout;
                    }
                    // Exited, but something still holds the output pipe open.
                    self.diagnostics.push(format!(
                        "{} output still open {:?} after exit",
                        self.spec.role, OUTPUT_DRAIN_WINDOW
                    ));
                    self.output = None;
                }
            }
        }

        let status = self.exit_status.unwrap_or(ExitStatus {
            code: None,
            signal: None,
        });
        self.state = if status.success() {
            ProcessState::Completed
        } else {
            ProcessState::Failed
        };
        Completion::Completed {
            status,
            stdout: self.stdout_text(),
            stderr: self.stderr_text(),
        }
    }

    /// Terminate the process: SIGTERM, then SIGKILL once the grace window passes.
    ///
    /// Terminating a handle that is already terminal is a no-op. Problems are
    /// recorded in [`diagnostics`](Self::diagnostics) and returned; the handle
    /// is terminal afterwards in every case.
    pub async fn terminate(&mut self) -> Result<()> {
        if self.state.is_terminal() {
            return Ok(());
        }

        match self.control.try_wait() {
            Ok(Some(status)) => {
                self.record_exit(Ok(status));
                self.state = if status.success() {
                    ProcessState::Completed
                } else {
                    ProcessState::Failed
                };
                return Ok(());
            }
            Ok(None) => {}
            Err(e) => self
                .diagnostics
                .push(format!("failed to poll {}: {}", self.spec.role, e)),
        }

        debug!("Terminating {} on {}", self.spec.role, self.spec.host);
        for signal in [TerminationSignal::Terminate, TerminationSignal::Kill] {
            if let Err(e) = self.control.signal(signal).await {
                self.diagnostics.push(format!(
                    "failed to send {:?} to {} on {}: {}",
                    signal, self.spec.role, self.spec.host, e
                ));
            }
            match timeout(self.grace, self.control.wait()).await {
                Ok(status) => {
                    self.record_exit(status);
                    self.state = ProcessState::Cancelled;
                    return Ok(());
                }
                Err(_) if signal == TerminationSignal::Terminate => {
                    warn!(
                        "{} on {} ignored SIGTERM for {:?}, escalating to SIGKILL",
                        self.spec.role, self.spec.host, self.grace
                    );
                }
                Err(_) => {}
            }
        }

        let message = format!(
            "{} on {} did not exit after SIGKILL",
            self.spec.role, self.spec.host
        );
        self.diagnostics.push(message.clone());
        self.state = ProcessState::Failed;
        Err(OrchestratorError::Timeout {
            phase: format!("{} termination", self.spec.role),
            elapsed: self.grace * 2,
        })
    }
}

impl Drop for RemoteProcessHandle {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            warn!(
                "{} on {} dropped while {:?}; killing",
                self.spec.role, self.spec.host, self.state
            );
            self.control.kill_now();
        }
    }
}
