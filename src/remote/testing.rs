//! In-memory executor for unit tests. Processes are tokio tasks driven by a
//! [`MockBehavior`]; every launch, signal and kill is recorded as a
//! [`MockEvent`] so tests can assert on cleanup.

use super::{
    ExitStatus, OutputLine, OutputStream, ProcessControl, RemoteExecutor, RemoteProcess,
    TerminationSignal,
};
use crate::error::{OrchestratorError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

#[derive(Clone, Debug)]
pub(crate) struct MockBehavior {
    lines: Vec<String>,
    exit: Option<(Duration, i32)>,
    ignore_sigterm: bool,
    launch_error: Option<String>,
}

impl MockBehavior {
    /// Prints `lines`, then runs until signalled.
    pub(crate) fn long_running(lines: Vec<&str>) -> Self {
        Self {
            lines: lines.into_iter().map(String::from).collect(),
            exit: None,
            ignore_sigterm: false,
            launch_error: None,
        }
    }

    /// Prints `lines`, then exits with `code` after `delay`.
    pub(crate) fn exits_after(delay: Duration, code: i32, lines: Vec<&str>) -> Self {
        Self {
            exit: Some((delay, code)),
            ..Self::long_running(lines)
        }
    }

    pub(crate) fn with_output(delay: Duration, code: i32, output: String) -> Self {
        Self {
            lines: output.lines().map(String::from).collect(),
            exit: Some((delay, code)),
            ignore_sigterm: false,
            launch_error: None,
        }
    }

    pub(crate) fn refused(reason: &str) -> Self {
        Self {
            launch_error: Some(reason.to_string()),
            ..Self::long_running(vec![])
        }
    }

    pub(crate) fn ignoring_sigterm(mut self) -> Self {
        self.ignore_sigterm = true;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum MockEvent {
    Launched { id: usize, host: String, args: Vec<String> },
    Signalled { id: usize, signal: TerminationSignal },
    Killed { id: usize },
    Exited { id: usize, status: ExitStatus },
}

type BehaviorFn = dyn Fn(&str, &str, &[String]) -> MockBehavior + Send + Sync;

#[derive(Default)]
struct Counters {
    live: AtomicUsize,
    peak_live: AtomicUsize,
}

pub(crate) struct MockExecutor {
    behavior: Box<BehaviorFn>,
    events: Arc<Mutex<Vec<MockEvent>>>,
    counters: Arc<Counters>,
    next_id: AtomicUsize,
}

impl MockExecutor {
    pub(crate) fn new(
        behavior: impl Fn(&str, &str, &[String]) -> MockBehavior + Send + Sync + 'static,
    ) -> Self {
        Self {
            behavior: Box::new(behavior),
            events: Arc::new(Mutex::new(Vec::new())),
            counters: Arc::new(Counters::default()),
            next_id: AtomicUsize::new(0),
        }
    }

    /// Server prints the iperf3 banner and waits; client reports `bps` after `duration`.
    pub(crate) fn iperf_like(bps: f64, duration: Duration) -> Self {
        Self::new(move |_, _, args| {
            if args.iter().any(|a| a == "--server") {
                MockBehavior::long_running(vec!["Server listening on 5201 (test #1)"])
            } else {
                MockBehavior::with_output(duration, 0, iperf_json(bps))
            }
        })
    }

    pub(crate) fn events(&self) -> Vec<MockEvent> {
        self.events.lock().clone()
    }

    pub(crate) fn live(&self) -> usize {
        self.counters.live.load(Ordering::SeqCst)
    }

    pub(crate) fn peak_live(&self) -> usize {
        self.counters.peak_live.load(Ordering::SeqCst)
    }

    pub(crate) fn launches(&self) -> Vec<(String, Vec<String>)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                MockEvent::Launched { host, args, .. } => Some((host, args)),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl RemoteExecutor for MockExecutor {
    async fn launch(&self, host: &str, command: &str, args: &[String]) -> Result<RemoteProcess> {
        let behavior = (self.behavior)(host, command, args);
        if let Some(reason) = behavior.launch_error {
            return Err(OrchestratorError::Launch {
                host: host.to_string(),
                command: command.to_string(),
                reason,
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.events.lock().push(MockEvent::Launched {
            id,
            host: host.to_string(),
            args: args.to_vec(),
        });
        let live = self.counters.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak_live.fetch_max(live, Ordering::SeqCst);

        let (line_tx, line_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let exit_tx = Arc::new(exit_tx);

        for text in behavior.lines {
            let _ = line_tx.send(OutputLine {
                stream: OutputStream::Stdout,
                text,
            });
        }

        let process = MockProcess {
            id,
            exit_tx: exit_tx.clone(),
            exit_rx: exit_rx.clone(),
            ignore_sigterm: behavior.ignore_sigterm,
            events: self.events.clone(),
            counters: self.counters.clone(),
        };

        let mut watcher = exit_rx;
        let scheduled = behavior.exit;
        let events = self.events.clone();
        let counters = self.counters.clone();
        tokio::spawn(async move {
            if let Some((delay, code)) = scheduled {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        finish(&exit_tx, &events, &counters, id, ExitStatus::from_code(code));
                    }
                    _ = watcher.wait_for(|s| s.is_some()) => {}
                }
            } else {
                let _ = watcher.wait_for(|s| s.is_some()).await;
            }
            drop(line_tx);
        });

        Ok(RemoteProcess {
            control: Box::new(process),
            output: line_rx,
        })
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

fn finish(
    exit_tx: &watch::Sender<Option<ExitStatus>>,
    events: &Mutex<Vec<MockEvent>>,
    counters: &Counters,
    id: usize,
    status: ExitStatus,
) {
    let changed = exit_tx.send_if_modified(|current| {
        if current.is_none() {
            *current = Some(status);
            true
        } else {
            false
        }
    });
    if changed {
        counters.live.fetch_sub(1, Ordering::SeqCst);
        events.lock().push(MockEvent::Exited { id, status });
    }
}

struct MockProcess {
    id: usize,
    exit_tx: Arc<watch::Sender<Option<ExitStatus>>>,
    exit_rx: watch::Receiver<Option<ExitStatus>>,
    ignore_sigterm: bool,
    events: Arc<Mutex<Vec<MockEvent>>>,
    counters: Arc<Counters>,
}

#[async_trait]
impl ProcessControl for MockProcess {
    async fn signal(&mut self, signal: TerminationSignal) -> std::io::Result<()> {
        self.events.lock().push(MockEvent::Signalled {
            id: self.id,
            signal,
        });
        match signal {
            TerminationSignal::Terminate if self.ignore_sigterm => {}
            TerminationSignal::Terminate => finish(
                &self.exit_tx,
                &self.events,
                &self.counters,
                self.id,
                ExitStatus::from_signal(15),
            ),
            TerminationSignal::Kill => finish(
                &self.exit_tx,
                &self.events,
                &self.counters,
                self.id,
                ExitStatus::from_signal(9),
            ),
        }
        Ok(())
    }

    async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        let mut rx = self.exit_rx.clone();
        let status = rx
            .wait_for(|s| s.is_some())
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::BrokenPipe, e))?;
        (*status).ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "no status"))
    }

    fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        Ok(*self.exit_rx.borrow())
    }

    fn kill_now(&mut self) {
        self.events.lock().push(MockEvent::Killed { id: self.id });
        finish(
            &self.exit_tx,
            &self.events,
            &self.counters,
            self.id,
            ExitStatus::from_signal(9),
        );
    }
}

/// Minimal iperf3 TCP client document reporting `bps` on both sides.
pub(crate) fn iperf_json(bps: f64) -> String {
    let bytes = (bps * 10.0 / 8.0) as u64;
    format!(
        r#"{{
  "start": {{ "test_start": {{ "protocol": "TCP", "num_streams": 1, "duration": 10, "omit": 0 }} }},
  "intervals": [ {{ "sum": {{ "seconds": 10.0, "bytes": {bytes}, "bits_per_second": {bps} }} }} ],
  "end": {{
    "sum_sent": {{ "seconds": 10.0, "bytes": {bytes}, "bits_per_second": {bps}, "retransmits": 0 }},
    "sum_received": {{ "seconds": 10.0, "bytes": {bytes}, "bits_per_second": {bps} }}
  }}
}}"#,
        bytes = bytes,
        bps = bps
    )
}
