//! # Pair Test Runner
//!
//! Drives one ordered (server, client) pair through a fixed state machine:
//!
//! ```text
//! Init → ServerStarting → ServerReady → ClientRunning → Collecting → Done
//!            │                 │              │
//!            └── failure / timeout / cancellation ──→ Done
//! ```
//!
//! The body ([`PairTestRunner::drive`]) returns a [`PairOutcome`] from
//! whichever state it stops in; a single exit block then terminates every
//! process handle the runner owns and releases its server port before the
//! [`PairResult`] is built. The server is therefore always reaped before the
//! result is reported, whatever the client did.
//!
//! Cancellation of the run is observed at both suspension points (server
//! readiness and client completion).

use crate::context::RunContext;
use crate::error::OrchestratorError;
use crate::logging::PAIR_SPAN;
use crate::remote::{
    Completion, ProcessRole, ProcessSpec, ReadinessCheck, Readiness, RemoteExecutor,
    RemoteProcessHandle,
};
use crate::results::{FailureKind, PairOutcome, PairResult, TimeoutPhase};
use crate::scheduler::TestSpec;
use crate::tool::{self, parse_measurement};
use crate::topology::{Endpoint, EndpointResolver};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info_span, warn, Instrument};

/// Runner lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    Init,
    ServerStarting,
    ServerReady,
    ClientRunning,
    Collecting,
    Done,
}

/// How the runner decides that a server accepts connections.
#[derive(Clone, Debug)]
pub enum ReadinessStrategy {
    /// Wait for a line containing this text in the server output.
    LogLine(String),
    /// Probe the server's TCP port at the given interval.
    PortProbe(Duration),
    /// Assume readiness after a fixed delay.
    FixedDelay(Duration),
    /// Use a caller-built check as is.
    Custom(ReadinessCheck),
}

impl ReadinessStrategy {
    fn check_for(&self, server: &Endpoint, port: u16) -> ReadinessCheck {
        match self {
            ReadinessStrategy::LogLine(text) => ReadinessCheck::LogPattern(text.clone()),
            ReadinessStrategy::PortProbe(interval) => ReadinessCheck::PortProbe {
                address: server.address.clone(),
                port,
                interval: *interval,
            },
            ReadinessStrategy::FixedDelay(delay) => ReadinessCheck::FixedDelay(*delay),
            ReadinessStrategy::Custom(check) => check.clone(),
        }
    }

    /// True when the check itself connects to the server port.
    pub fn connects_to_server(&self) -> bool {
        matches!(
            self,
            ReadinessStrategy::PortProbe(_)
                | ReadinessStrategy::Custom(ReadinessCheck::PortProbe { .. })
        )
    }
}

impl Default for ReadinessStrategy {
    fn default() -> Self {
        ReadinessStrategy::LogLine(crate::defaults::READY_PATTERN.to_string())
    }
}

/// Timeouts and readiness policy applied to every pair.
#[derive(Clone, Debug)]
pub struct RunnerConfig {
    pub server_start_timeout: Duration,
    /// Added to duration + omit to bound the client run
    pub completion_slack: Duration,
    /// Window between SIGTERM and SIGKILL (and after SIGKILL)
    pub grace: Duration,
    pub readiness: ReadinessStrategy,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            server_start_timeout: crate::defaults::SERVER_START_TIMEOUT,
            completion_slack: crate::defaults::COMPLETION_SLACK,
            grace: crate::defaults::TERMINATION_GRACE,
            readiness: ReadinessStrategy::default(),
        }
    }
}

/// Runs one pair test to completion.
pub struct PairTestRunner {
    spec: TestSpec,
    context: Arc<RunContext>,
    resolver: Arc<dyn EndpointResolver>,
    executor: Arc<dyn RemoteExecutor>,
    config: RunnerConfig,
    states: Vec<RunnerState>,
    server: Option<RemoteProcessHandle>,
    client: Option<RemoteProcessHandle>,
    diagnostics: Vec<String>,
}

impl PairTestRunner {
    pub fn new(
        spec: TestSpec,
        context: Arc<RunContext>,
        resolver: Arc<dyn EndpointResolver>,
        executor: Arc<dyn RemoteExecutor>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            spec,
            context,
            resolver,
            executor,
            config,
            states: vec![RunnerState::Init],
            server: None,
            client: None,
            diagnostics: Vec::new(),
        }
    }

    /// Run the pair and return its result. Never fails: every problem becomes
    /// the pair's outcome.
    pub async fn run(mut self) -> PairResult {
        let key = self.spec.key();
        let span = info_span!(PAIR_SPAN, pair = %key);
        async move {
            let started_at = Utc::now();
            let clock = tokio::time::Instant::now();
            let active = self.context.enter_active();

            let server_port = self.context.ports().acquire(&self.spec.server.name);
            let outcome = match &server_port {
                Some(lease) => self.drive(lease.port()).await,
                None => PairOutcome::failure(
                    FailureKind::Internal,
                    format!("no free server port on {}", self.spec.server.name),
                ),
            };

            self.teardown().await;
            drop(server_port);
            drop(active);
            self.transition(RunnerState::Done);

            debug!("finished: {}", outcome.label());
            self.into_result(outcome, started_at, clock.elapsed())
        }
        .instrument(span)
        .await
    }

    fn transition(&mut self, next: RunnerState) {
        if let Some(current) = self.states.last() {
            debug!("{:?} -> {:?}", current, next);
        }
        self.states.push(next);
    }

    fn cancelled() -> PairOutcome {
        PairOutcome::failure(FailureKind::Cancelled, "run cancelled by operator")
    }

    async fn drive(&mut self, port: u16) -> PairOutcome {
        let settings = self.spec.settings.clone();
        let cancel = self.context.cancel_token();
        if cancel.is_cancelled() {
            return Self::cancelled();
        }

        // Init → ServerStarting
        self.transition(RunnerState::ServerStarting);
        let server_endpoint = match self.resolver.resolve(&self.spec.server, settings.addressing) {
            Ok(endpoint) => endpoint,
            Err(e) => return PairOutcome::failure(FailureKind::Resolution, e.to_string()),
        };
        // A probing connection would use up a one-off server.
        let one_off = !self.config.readiness.connects_to_server();
        let invocation = tool::server_invocation(&settings, &server_endpoint, port, one_off);
        let spec = ProcessSpec {
            host: self.spec.server.name.clone(),
            command: invocation.command,
            args: invocation.args,
            role: ProcessRole::Server,
        };
        match RemoteProcessHandle::start(self.executor.as_ref(), spec, self.config.grace).await {
            Ok(handle) => self.server = Some(handle),
            Err(e) => return PairOutcome::failure(FailureKind::Launch, e.to_string()),
        }

        // ServerStarting → ServerReady
        let check = self.config.readiness.check_for(&server_endpoint, port);
        let limit = self.config.server_start_timeout;
        let readiness = match self.server.as_mut() {
            Some(server) => tokio::select! {
                biased;
                _ = cancel.cancelled() => return Self::cancelled(),
                readiness = server.await_ready(limit, &check) => readiness,
            },
            None => return PairOutcome::failure(FailureKind::Internal, "server handle missing"),
        };
        match readiness {
            Readiness::Ready => self.transition(RunnerState::ServerReady),
            Readiness::Timeout => {
                return PairOutcome::Timeout {
                    phase: TimeoutPhase::ServerStart,
                    limit,
                }
            }
            Readiness::Exited(status) => {
                let stderr = self
                    .server
                    .as_ref()
                    .map(|s| tail(&s.stderr_text()))
                    .unwrap_or_default();
                return PairOutcome::failure(
                    FailureKind::ServerExited,
                    format!("server exited with {} before becoming ready{}", status, stderr),
                );
            }
        }

        // ServerReady → ClientRunning
        let client_endpoint = match self.resolver.resolve(&self.spec.client, settings.addressing) {
            Ok(endpoint) => endpoint,
            Err(e) => return PairOutcome::failure(FailureKind::Resolution, e.to_string()),
        };
        let invocation = tool::client_invocation(&settings, &server_endpoint, &client_endpoint, port);
        let spec = ProcessSpec {
            host: self.spec.client.name.clone(),
            command: invocation.command,
            args: invocation.args,
            role: ProcessRole::Client,
        };
        match RemoteProcessHandle::start(self.executor.as_ref(), spec, self.config.grace).await {
            Ok(mut handle) => {
                handle.mark_running();
                self.client = Some(handle);
            }
            Err(e) => return PairOutcome::failure(FailureKind::Launch, e.to_string()),
        }
        self.transition(RunnerState::ClientRunning);

        // ClientRunning → Collecting
        let limit = settings.expected_runtime() + self.config.completion_slack;
        let completion = match self.client.as_mut() {
            Some(client) => tokio::select! {
                biased;
                _ = cancel.cancelled() => return Self::cancelled(),
                completion = client.await_completion(limit) => completion,
            },
            None => return PairOutcome::failure(FailureKind::Internal, "client handle missing"),
        };
        let (status, stdout, stderr) = match completion {
            Completion::Completed {
                status,
                stdout,
                stderr,
            } => (status, stdout, stderr),
            Completion::Timeout => {
                return PairOutcome::Timeout {
                    phase: TimeoutPhase::ClientCompletion,
                    limit,
                }
            }
        };
        self.transition(RunnerState::Collecting);

        // Collecting → Done: the server goes first, whatever the client did.
        if let Some(server) = self.server.as_mut() {
            if let Err(e) = server.terminate().await {
                warn!("server cleanup: {}", e);
            }
        }

        let parsed = parse_measurement(&stdout, &self.spec.settings);
        match (status.success(), parsed) {
            (true, Ok(measurement)) => PairOutcome::Success(measurement),
            (_, Err(OrchestratorError::ToolReported(message))) => {
                PairOutcome::failure(FailureKind::ToolError, message)
            }
            (false, _) => PairOutcome::failure(
                FailureKind::ClientExit,
                format!("client exited with {}{}", status, tail(&stderr)),
            ),
            (true, Err(e)) => PairOutcome::failure(FailureKind::MeasurementParse, e.to_string()),
        }
    }

    /// Terminate every handle still alive. Runs on every exit path.
    async fn teardown(&mut self) {
        for handle in [self.client.as_mut(), self.server.as_mut()].into_iter().flatten() {
            if let Err(e) = handle.terminate().await {
                warn!("{} cleanup: {}", handle.spec().role, e);
            }
        }
        for handle in [self.server.as_ref(), self.client.as_ref()].into_iter().flatten() {
            self.diagnostics.extend(handle.diagnostics().iter().cloned());
        }
    }

    fn into_result(
        self,
        outcome: PairOutcome,
        started_at: chrono::DateTime<Utc>,
        wall_clock: Duration,
    ) -> PairResult {
        let server = self.server.as_ref();
        let client = self.client.as_ref();
        PairResult {
            outcome,
            started_at,
            finished_at: Utc::now(),
            wall_clock,
            server_command: server.map(|s| s.spec().command_line()),
            client_command: client.map(|c| c.spec().command_line()),
            client_stdout: client.map(|c| c.stdout_text()),
            client_stderr: client.map(|c| c.stderr_text()),
            server_output: server.map(|s| {
                s.stdout_lines()
                    .iter()
                    .chain(s.stderr_lines())
                    .cloned()
                    .collect::<Vec<_>>()
                    .join("\n")
            }),
            server_state: server.map(|s| s.state()),
            client_state: client.map(|c| c.state()),
            states: self.states.clone(),
            diagnostics: self.diagnostics.clone(),
            spec: self.spec.clone(),
        }
    }
}

/// Last stderr line, formatted as a suffix for failure reasons.
fn tail(stderr: &str) -> String {
    stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .map(|l| format!(": {}", l.trim()))
        .unwrap_or_default()
}
