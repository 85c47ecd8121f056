//! # Cluster Network Throughput Matrix
//!
//! Measures point-to-point network throughput between every ordered pair of
//! nodes in a cluster. For each pair a benchmark server (iperf3) is started on
//! one node, a client is run against it from another node, the client's JSON
//! report is parsed and the result is stored in a matrix keyed by
//! `(server, client)`.
//!
//! ## Architecture Overview
//!
//! - `topology`: maps a node and an addressing mode to a concrete endpoint
//! - `remote`: launches processes on cluster nodes and controls their lifecycle
//! - `tool`: builds iperf3 command lines and parses its JSON output
//! - `runner`: drives one pair test through its state machine
//! - `scheduler`: enumerates pairs and dispatches runners under an admission gate
//! - `results`: the matrix, its validation and summary, and persistence
//! - `context`: state shared by every runner of a run
//! - `cli`: argument parsing into a validated [`cli::MatrixConfig`]
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use net_matrix::{
//!     CommandExecutor, Launcher, MatrixScheduler, Node, ResultAggregator, RunContext,
//!     RunnerConfig, StaticResolver,
//! };
//! use net_matrix::tool::BenchmarkSettings;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let context = Arc::new(RunContext::new("example", 1, 5201, ResultAggregator::new(None)));
//!     let scheduler = MatrixScheduler::new(
//!         context,
//!         Arc::new(StaticResolver::default()),
//!         Arc::new(CommandExecutor::new(Launcher::Srun)),
//!         RunnerConfig::default(),
//!     );
//!
//!     let nodes: Vec<Node> = ["node001", "node002", "node003"]
//!         .into_iter()
//!         .map(Node::named)
//!         .collect();
//!     let report = scheduler.execute(&nodes, &BenchmarkSettings::default()).await?;
//!     println!("{}", report.render());
//!     Ok(())
//! }
//! ```

/// Command-line interface and configuration
///
/// Converts parsed arguments into a validated `MatrixConfig`: node list
/// (positional, file or Slurm hostlist), benchmark settings, timeouts and
/// launcher selection.
pub mod cli;

pub mod context;

/// Error taxonomy shared by the library
pub mod error;

pub mod logging;

/// Remote process launching and lifecycle control
pub mod remote;

/// Result collection, validation, summaries and on-disk output
pub mod results;

pub mod runner;

pub mod scheduler;

/// iperf3 invocation building and JSON report parsing
pub mod tool;

pub mod topology;

pub mod utils;

pub use cli::{Args, MatrixConfig};
pub use context::RunContext;
pub use error::{OrchestratorError, Result};
pub use remote::{CommandExecutor, Launcher, RemoteExecutor};
pub use results::{MatrixReport, PairKey, PairOutcome, PairResult, ResultAggregator, ResultsWriter};
pub use runner::{PairTestRunner, RunnerConfig};
pub use scheduler::{enumerate_pairs, MatrixScheduler, TestSpec};
pub use topology::{AddressingMode, EndpointResolver, Node, StaticResolver};

/// The current version of the orchestrator
///
/// Recorded in run metadata so persisted results can be traced back to the
/// build that produced them.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Default measurement duration per pair
    ///
    /// Ten seconds is long enough for TCP windows to open on high bandwidth
    /// fabrics while keeping an N×(N−1) matrix tractable.
    pub const DURATION: Duration = Duration::from_secs(10);

    /// Parallel client streams
    pub const PARALLEL: u32 = 1;

    /// Pairs allowed to run at the same time
    ///
    /// Sequential by default. Concurrent pairs share links and switches, which
    /// skews the numbers unless the topology is known to be non-blocking.
    pub const MAX_CONCURRENT: usize = 1;

    /// First server port; concurrent servers on one host use the following ports
    pub const BASE_PORT: u16 = 5201;

    /// Time allowed for a server to become ready
    pub const SERVER_START_TIMEOUT: Duration = Duration::from_secs(10);

    /// Added to the measurement duration to bound client completion
    pub const COMPLETION_SLACK: Duration = Duration::from_secs(15);

    /// Wait after each termination signal before escalating
    pub const TERMINATION_GRACE: Duration = Duration::from_secs(2);

    /// Line printed by an iperf3 server once it is accepting connections
    pub const READY_PATTERN: &str = "Server listening";

    /// Delay used by the fixed-delay readiness fallback
    pub const READY_DELAY: Duration = Duration::from_secs(2);

    pub const PORT_PROBE_INTERVAL: Duration = Duration::from_millis(200);

    /// Client connect timeout passed to iperf3
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    pub const OUTPUT_DIR: &str = "results";

    pub const TOOL_PATH: &str = "iperf3";
}

/// Process exit codes of the binary
pub mod exit_codes {
    /// Every pair succeeded
    pub const SUCCESS: u8 = 0;
    /// The matrix is complete but at least one pair failed or timed out
    pub const PARTIAL_FAILURE: u8 = 1;
    pub const CONFIGURATION_ERROR: u8 = 2;
    /// Incomplete matrix, output I/O failure or another internal fault
    pub const INTERNAL_ERROR: u8 = 3;
    /// Interrupted by the operator
    pub const CANCELLED: u8 = 130;
}
