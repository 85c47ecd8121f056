//! # Matrix Scheduler
//!
//! Enumerates every ordered pair of distinct nodes and dispatches one
//! [`PairTestRunner`] per pair, in a deterministic row-major order (server
//! outer loop, client inner loop).
//!
//! ## Admission
//!
//! A pair is only dispatched after it acquires a permit from the run's
//! admission gate (`tokio::sync::Semaphore`). The permit is held until the
//! runner has torn down both processes and its result is recorded, so no more
//! than `max_concurrent` pairs ever have processes alive. The default limit of
//! one runs the matrix strictly sequentially, which keeps measurements free
//! of cross-traffic.
//!
//! ## Failure Policy
//!
//! A failing pair never stops the run unless `abort_on_first_failure` is set.
//! When the run is aborted or cancelled, pairs that were not yet dispatched
//! are recorded as `Skipped` failures so the matrix is still complete.

use crate::context::RunContext;
use crate::error::{OrchestratorError, Result};
use crate::remote::{Completion, ProcessRole, ProcessSpec, RemoteExecutor, RemoteProcessHandle};
use crate::results::{MatrixReport, PairKey, PairResult, RunMetadata, SystemInfo};
use crate::runner::{PairTestRunner, RunnerConfig};
use crate::tool::{self, BenchmarkSettings};
use crate::topology::{EndpointResolver, Node};
use crate::utils::create_progress_indicator;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// One ordered pair test, as dispatched by the scheduler.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSpec {
    /// Position in dispatch order
    pub index: usize,
    pub server: Node,
    pub client: Node,
    pub settings: BenchmarkSettings,
}

impl TestSpec {
    pub fn key(&self) -> PairKey {
        PairKey::new(self.server.name.clone(), self.client.name.clone())
    }
}

/// Drop repeated node names, keeping the first occurrence.
pub fn dedup_nodes(nodes: &[Node]) -> Vec<Node> {
    let mut seen = HashSet::new();
    nodes
        .iter()
        .filter(|node| seen.insert(node.name.clone()))
        .cloned()
        .collect()
}

/// All N×(N−1) ordered pairs of distinct nodes, row-major.
pub fn enumerate_pairs(nodes: &[Node], settings: &BenchmarkSettings) -> Result<Vec<TestSpec>> {
    let nodes = dedup_nodes(nodes);
    if nodes.len() < 2 {
        return Err(OrchestratorError::Configuration(format!(
            "at least 2 distinct nodes are required, got {}",
            nodes.len()
        )));
    }

    let mut specs = Vec::with_capacity(nodes.len() * (nodes.len() - 1));
    for server in &nodes {
        for client in &nodes {
            if server.name == client.name {
                continue;
            }
            specs.push(TestSpec {
                index: specs.len(),
                server: server.clone(),
                client: client.clone(),
                settings: settings.clone(),
            });
        }
    }
    Ok(specs)
}

/// Dispatches pair runners under the admission gate of a [`RunContext`].
pub struct MatrixScheduler {
    context: Arc<RunContext>,
    resolver: Arc<dyn EndpointResolver>,
    executor: Arc<dyn RemoteExecutor>,
    runner_config: RunnerConfig,
    abort_on_first_failure: bool,
    record_tool_version: bool,
}

impl MatrixScheduler {
    pub fn new(
        context: Arc<RunContext>,
        resolver: Arc<dyn EndpointResolver>,
        executor: Arc<dyn RemoteExecutor>,
        runner_config: RunnerConfig,
    ) -> Self {
        Self {
            context,
            resolver,
            executor,
            runner_config,
            abort_on_first_failure: false,
            record_tool_version: false,
        }
    }

    /// Query the benchmark tool's version on the first node before the run
    /// and record it in the run metadata.
    pub fn record_tool_version(mut self, record: bool) -> Self {
        self.record_tool_version = record;
        self
    }

    pub fn abort_on_first_failure(mut self, abort: bool) -> Self {
        self.abort_on_first_failure = abort;
        self
    }

    pub fn context(&self) -> &Arc<RunContext> {
        &self.context
    }

    /// Run the full matrix over `nodes` and return the validated report.
    pub async fn execute(&self, nodes: &[Node], settings: &BenchmarkSettings) -> Result<MatrixReport> {
        let started_at = Utc::now();
        let specs = enumerate_pairs(nodes, settings)?;
        let expected: Vec<PairKey> = specs.iter().map(TestSpec::key).collect();
        let node_names: Vec<String> = dedup_nodes(nodes).into_iter().map(|n| n.name).collect();

        info!(
            "Running {} pairs across {} nodes via {} (at most {} at a time)",
            specs.len(),
            node_names.len(),
            self.executor.name(),
            self.context.admission_limit()
        );
        let tool_version = match (self.record_tool_version, specs.first()) {
            (true, Some(first)) => self.tool_version(&first.server, settings).await,
            _ => None,
        };
        self.run(specs).await?;

        let metadata = RunMetadata {
            version: crate::VERSION.to_string(),
            run_id: self.context.run_id().to_string(),
            started_at,
            finished_at: Utc::now(),
            nodes: node_names,
            settings: settings.clone(),
            max_concurrent: self.context.admission_limit(),
            launcher: self.executor.name().to_string(),
            tool_version,
            cancelled: self.context.is_cancelled(),
            system_info: SystemInfo::collect(),
        };
        self.context.aggregator().finalize(&expected, metadata)
    }

    async fn tool_version(&self, node: &Node, settings: &BenchmarkSettings) -> Option<String> {
        let invocation = tool::version_invocation(settings);
        let spec = ProcessSpec {
            host: node.name.clone(),
            command: invocation.command,
            args: invocation.args,
            role: ProcessRole::Client,
        };
        let mut handle =
            match RemoteProcessHandle::start(self.executor.as_ref(), spec, self.runner_config.grace)
                .await
            {
                Ok(handle) => handle,
                Err(e) => {
                    warn!("Could not query the tool version on {}: {}", node.name, e);
                    return None;
                }
            };
        let version = match handle
            .await_completion(self.runner_config.server_start_timeout)
            .await
        {
            Completion::Completed { status, stdout, .. } if status.success() => {
                tool::parse_version(&stdout)
            }
            Completion::Completed { status, .. } => {
                debug!("Tool version query on {} exited with {}", node.name, status);
                None
            }
            Completion::Timeout => None,
        };
        let _ = handle.terminate().await;
        if let Some(version) = &version {
            info!("{} on {}: {}", settings.tool_path, node.name, version);
        }
        version
    }

    /// Dispatch `specs` in order and wait for every dispatched runner.
    ///
    /// Returns the first fatal error (result persistence, duplicate pair)
    /// only after all runners have finished.
    pub async fn run(&self, specs: Vec<TestSpec>) -> Result<()> {
        let total = specs.len();
        let cancel = self.context.cancel_token();
        let aborted = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicUsize::new(0));
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();
        let mut fatal: Option<OrchestratorError> = None;

        for spec in specs {
            let permit = if cancel.is_cancelled() || aborted.load(Ordering::SeqCst) {
                None
            } else {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = self.context.admission().acquire_owned() => permit.ok(),
                }
            };

            // The abort flag may have been raised while waiting for the permit.
            let permit = match permit {
                Some(permit) if !aborted.load(Ordering::SeqCst) && !cancel.is_cancelled() => permit,
                _ => {
                    let reason = if cancel.is_cancelled() {
                        "run cancelled before dispatch"
                    } else {
                        "run aborted after an earlier failure"
                    };
                    if let Err(e) = self
                        .context
                        .aggregator()
                        .record(PairResult::skipped(spec, reason))
                    {
                        fatal.get_or_insert(e);
                    }
                    continue;
                }
            };

            info!("Dispatching pair {}/{}: {}", spec.index + 1, total, spec.key());
            let runner = PairTestRunner::new(
                spec,
                self.context.clone(),
                self.resolver.clone(),
                self.executor.clone(),
                self.runner_config.clone(),
            );
            let context = self.context.clone();
            let aborted = aborted.clone();
            let finished = finished.clone();
            let abort_on_failure = self.abort_on_first_failure;

            tasks.spawn(async move {
                let result = runner.run().await;
                if abort_on_failure
                    && !result.outcome.is_success()
                    && !aborted.swap(true, Ordering::SeqCst)
                {
                    warn!("Aborting remaining pairs after failure of {}", result.key());
                }
                let recorded = context.aggregator().record(result);
                let done = finished.fetch_add(1, Ordering::SeqCst) + 1;
                info!(
                    "Progress [{}] {}/{}",
                    create_progress_indicator(done, total, 20),
                    done,
                    total
                );
                drop(permit);
                recorded
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("Failed to record pair result: {}", e);
                    fatal.get_or_insert(e);
                }
                // The pair stays missing and validation reports it.
                Err(e) => error!("Pair runner task failed: {}", e),
            }
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::testing::{MockBehavior, MockExecutor};
    use crate::results::{FailureKind, PairOutcome, ResultAggregator};
    use crate::topology::StaticResolver;
    use std::time::Duration;

    fn nodes(names: &[&str]) -> Vec<Node> {
        names.iter().map(|n| Node::named(*n)).collect()
    }

    fn scheduler(executor: Arc<MockExecutor>, max_concurrent: usize) -> MatrixScheduler {
        let context = Arc::new(RunContext::new(
            "test",
            max_concurrent,
            5201,
            ResultAggregator::new(None),
        ));
        MatrixScheduler::new(
            context,
            Arc::new(StaticResolver::default()),
            executor,
            RunnerConfig::default(),
        )
    }

    fn settings() -> BenchmarkSettings {
        BenchmarkSettings {
            duration: Duration::from_secs(10),
            ..Default::default()
        }
    }

    #[test]
    fn test_enumerate_pairs_counts_and_order() {
        let specs = enumerate_pairs(&nodes(&["a", "b", "c", "a"]), &settings()).unwrap();
        assert_eq!(specs.len(), 6);
        assert!(specs.iter().all(|s| s.server.name != s.client.name));

        let order: Vec<String> = specs.iter().map(|s| s.key().to_string()).collect();
        assert_eq!(order, vec!["a->b", "a->c", "b->a", "b->c", "c->a", "c->b"]);
        assert!(specs.iter().enumerate().all(|(i, s)| s.index == i));

        let unique: HashSet<PairKey> = specs.iter().map(TestSpec::key).collect();
        assert_eq!(unique.len(), 6);

        for n in 2..7 {
            let names: Vec<String> = (0..n).map(|i| format!("n{}", i)).collect();
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            assert_eq!(
                enumerate_pairs(&nodes(&refs), &settings()).unwrap().len(),
                n * (n - 1)
            );
        }
    }

    #[test]
    fn test_enumerate_pairs_needs_two_nodes() {
        for names in [vec![], vec!["a"], vec!["a", "a"]] {
            let err = enumerate_pairs(&nodes(&names), &settings()).unwrap_err();
            assert!(matches!(err, OrchestratorError::Configuration(_)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_nodes_all_succeed() {
        let executor = Arc::new(MockExecutor::iperf_like(9.4e9, Duration::from_secs(10)));
        let scheduler = scheduler(executor.clone(), 1);
        let report = scheduler
            .execute(&nodes(&["a", "b", "c"]), &settings())
            .await
            .unwrap();

        assert_eq!(report.results.len(), 6);
        assert_eq!(report.summary.count, 6);
        assert_eq!(report.summary.failed, 0);
        assert_eq!(report.summary.throughput.unwrap().mean_bps, 9.4e9);
        assert_eq!(report.exit_code(), crate::exit_codes::SUCCESS);
        assert_eq!(scheduler.context().peak_in_flight(), 1);
        assert_eq!(executor.peak_live(), 2);
        assert_eq!(executor.live(), 0);
        assert_eq!(report.metadata.nodes, vec!["a", "b", "c"]);
        assert_eq!(report.metadata.tool_version, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tool_version_is_recorded() {
        let executor = Arc::new(MockExecutor::new(|_, _, args| {
            if args.iter().any(|a| a == "--version") {
                MockBehavior::exits_after(
                    Duration::from_millis(10),
                    0,
                    vec!["iperf 3.16 (cJSON 1.7.15)"],
                )
            } else if args.iter().any(|a| a == "--server") {
                MockBehavior::long_running(vec!["Server listening on 5201"])
            } else {
                MockBehavior::with_output(
                    Duration::from_secs(10),
                    0,
                    crate::remote::testing::iperf_json(1e9),
                )
            }
        }));
        let scheduler = scheduler(executor.clone(), 1).record_tool_version(true);
        let report = scheduler
            .execute(&nodes(&["a", "b"]), &settings())
            .await
            .unwrap();

        assert_eq!(
            report.metadata.tool_version.as_deref(),
            Some("iperf 3.16 (cJSON 1.7.15)")
        );
        assert_eq!(report.summary.succeeded, 2);
        assert_eq!(executor.launches()[0].0, "a");
        assert_eq!(executor.live(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_failing_pair_is_recorded() {
        let executor = Arc::new(MockExecutor::new(|host, _, args| {
            if args.iter().any(|a| a == "--server") {
                MockBehavior::long_running(vec!["Server listening on 5201"])
            } else if host == "c" && args.iter().any(|a| a == "b->c") {
                MockBehavior::exits_after(Duration::from_secs(1), 1, vec!["iperf3: error"])
            } else {
                MockBehavior::with_output(
                    Duration::from_secs(10),
                    0,
                    crate::remote::testing::iperf_json(1e9),
                )
            }
        }));
        let scheduler = scheduler(executor.clone(), 1);
        let report = scheduler
            .execute(&nodes(&["a", "b", "c"]), &settings())
            .await
            .unwrap();

        assert_eq!(report.summary.count, 6);
        assert_eq!(report.summary.succeeded, 5);
        assert_eq!(report.summary.failed, 1);
        let failed = scheduler
            .context()
            .aggregator()
            .matrix()
            .get(&PairKey::new("b", "c"))
            .unwrap();
        assert!(matches!(
            failed.outcome,
            PairOutcome::Failure {
                kind: FailureKind::ClientExit,
                ..
            }
        ));
        assert_eq!(report.exit_code(), crate::exit_codes::PARTIAL_FAILURE);
        assert_eq!(executor.live(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_bounds_concurrency() {
        let executor = Arc::new(MockExecutor::iperf_like(1e9, Duration::from_secs(1)));
        let scheduler = scheduler(executor.clone(), 2);
        let report = scheduler
            .execute(&nodes(&["a", "b", "c", "d"]), &settings())
            .await
            .unwrap();

        assert_eq!(report.summary.count, 12);
        assert_eq!(report.summary.succeeded, 12);
        assert_eq!(scheduler.context().peak_in_flight(), 2);
        assert!(executor.peak_live() <= 4);
        assert_eq!(scheduler.context().in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_on_first_failure_skips_rest() {
        let executor = Arc::new(MockExecutor::new(|_, _, args| {
            if args.iter().any(|a| a == "--server") {
                MockBehavior::long_running(vec!["Server listening on 5201"])
            } else {
                MockBehavior::exits_after(Duration::from_secs(1), 2, vec![])
            }
        }));
        let scheduler = scheduler(executor.clone(), 1).abort_on_first_failure(true);
        let report = scheduler
            .execute(&nodes(&["a", "b", "c"]), &settings())
            .await
            .unwrap();

        assert_eq!(report.summary.count, 6);
        assert_eq!(report.summary.skipped, 5);
        assert_eq!(report.summary.failed, 6);
        assert_eq!(executor.launches().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_completes_matrix_with_skips() {
        let executor = Arc::new(MockExecutor::iperf_like(1e9, Duration::from_secs(10)));
        let scheduler = Arc::new(scheduler(executor.clone(), 1));
        let context = scheduler.context().clone();

        let run = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                scheduler
                    .execute(&nodes(&["a", "b", "c"]), &settings())
                    .await
            })
        };
        // First pair finishes at ~10s; cancel in the middle of the second.
        tokio::time::sleep(Duration::from_secs(15)).await;
        context.cancel();
        let report = run.await.unwrap().unwrap();

        assert_eq!(report.summary.count, 6);
        assert_eq!(report.summary.succeeded, 1);
        assert_eq!(report.summary.skipped, 4);
        assert!(report.metadata.cancelled);
        assert_eq!(report.exit_code(), crate::exit_codes::CANCELLED);
        assert_eq!(executor.live(), 0);

        let second = &report.results[1];
        assert!(matches!(
            second.outcome,
            PairOutcome::Failure {
                kind: FailureKind::Cancelled,
                ..
            }
        ));
    }
}
