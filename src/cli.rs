use crate::error::{OrchestratorError, Result};
use crate::remote::{CommandExecutor, Launcher};
use crate::runner::{ReadinessStrategy, RunnerConfig};
use crate::scheduler::dedup_nodes;
use crate::tool::{BenchmarkSettings, Protocol};
use crate::topology::{AddressingKind, ClusterTopology, Node, StaticResolver};
use crate::utils::{
    expand_hostlist, validate_concurrency, validate_duration, validate_parallel, validate_port,
};
use clap::{Parser, ValueEnum};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// net-matrix - measure network throughput between every pair of cluster nodes
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Nodes to test; each argument may be a Slurm host list (node[01-04],login)
    #[clap(help_heading = "Nodes")]
    pub nodes: Vec<String>,

    /// File with one node or host list per line ('#' starts a comment)
    #[clap(long, help_heading = "Nodes")]
    pub nodes_file: Option<PathBuf>,

    /// Host list used when no nodes are given otherwise
    #[clap(long, env = "SLURM_JOB_NODELIST", help_heading = "Nodes")]
    pub slurm_nodes: Option<String>,

    /// JSON topology file with addresses, lanes and NUMA locality per node
    #[clap(long, help_heading = "Nodes")]
    pub topology: Option<PathBuf>,

    /// Suffix appended to node names to form fabric host names (e.g. "-ib")
    #[clap(long, help_heading = "Nodes")]
    pub fabric_suffix: Option<String>,

    /// Network used for the benchmark traffic
    #[clap(long, value_enum, default_value_t = AddressingKind::Management, help_heading = "Nodes")]
    pub addressing: AddressingKind,

    /// Lane index when --addressing=lane
    #[clap(long, default_value_t = 0, help_heading = "Nodes")]
    pub lane: u8,

    /// Measured duration of each pair test (e.g. "10s", "1m")
    #[clap(short = 't', long, default_value_t = DurationArg(crate::defaults::DURATION), help_heading = "Benchmark")]
    pub duration: DurationArg,

    /// Parallel client streams
    #[clap(short = 'P', long, default_value_t = crate::defaults::PARALLEL, help_heading = "Benchmark")]
    pub parallel: u32,

    /// Target bitrate in iperf3 notation (e.g. "10G"); unlimited for TCP when unset
    #[clap(short = 'b', long, help_heading = "Benchmark")]
    pub bitrate: Option<String>,

    #[clap(long, value_enum, default_value_t = Protocol::Tcp, help_heading = "Benchmark")]
    pub protocol: Protocol,

    /// Warm-up seconds excluded from the results
    #[clap(long, default_value_t = 0, help_heading = "Benchmark")]
    pub omit: u32,

    /// Let the server send and the client receive
    #[clap(short = 'R', long, help_heading = "Benchmark")]
    pub reverse: bool,

    /// Socket buffer size (iperf3 --window)
    #[clap(short = 'w', long, help_heading = "Benchmark")]
    pub window: Option<String>,

    /// Read/write buffer length (iperf3 --length)
    #[clap(short = 'l', long, help_heading = "Benchmark")]
    pub length: Option<String>,

    /// TCP congestion control algorithm
    #[clap(short = 'C', long, help_heading = "Benchmark")]
    pub congestion: Option<String>,

    /// Use zero-copy sends
    #[clap(short = 'Z', long, help_heading = "Benchmark")]
    pub zerocopy: bool,

    /// Bind benchmark processes to the endpoint's NUMA domain with numactl
    #[clap(long, help_heading = "Benchmark")]
    pub numa_bind: bool,

    /// Client connect timeout
    #[clap(long, default_value_t = DurationArg(crate::defaults::CONNECT_TIMEOUT), help_heading = "Benchmark")]
    pub connect_timeout: DurationArg,

    /// Path of the iperf3 binary on the nodes
    #[clap(long, default_value = crate::defaults::TOOL_PATH, help_heading = "Benchmark")]
    pub tool_path: String,

    /// Base server port; concurrent servers on one node use the following ports
    #[clap(short = 'p', long, default_value_t = crate::defaults::BASE_PORT, help_heading = "Benchmark")]
    pub port: u16,

    /// Extra argument passed to every client (repeatable)
    #[clap(long = "client-arg", allow_hyphen_values = true, help_heading = "Benchmark")]
    pub client_args: Vec<String>,

    /// Pairs allowed to run at the same time
    #[clap(short = 'j', long, default_value_t = crate::defaults::MAX_CONCURRENT, help_heading = "Scheduling")]
    pub max_concurrent: usize,

    /// Skip every remaining pair after the first failure
    #[clap(long, help_heading = "Scheduling")]
    pub abort_on_first_failure: bool,

    /// How processes are started on the nodes
    #[clap(long, value_enum, default_value_t = Launcher::Srun, help_heading = "Scheduling")]
    pub launcher: Launcher,

    /// Extra argument for the launcher command (repeatable)
    #[clap(long = "launcher-arg", allow_hyphen_values = true, help_heading = "Scheduling")]
    pub launcher_args: Vec<String>,

    /// Time allowed for a server to become ready
    #[clap(long, default_value_t = DurationArg(crate::defaults::SERVER_START_TIMEOUT), help_heading = "Timeouts")]
    pub server_start_timeout: DurationArg,

    /// Added to duration + omit to bound the client run
    #[clap(long, default_value_t = DurationArg(crate::defaults::COMPLETION_SLACK), help_heading = "Timeouts")]
    pub completion_slack: DurationArg,

    /// Wait after SIGTERM before SIGKILL
    #[clap(long, default_value_t = DurationArg(crate::defaults::TERMINATION_GRACE), help_heading = "Timeouts")]
    pub grace: DurationArg,

    /// How server readiness is detected
    #[clap(long, value_enum, default_value_t = ReadinessKind::LogLine, help_heading = "Timeouts")]
    pub readiness: ReadinessKind,

    /// Server output text that signals readiness (log-line)
    #[clap(long, default_value = crate::defaults::READY_PATTERN, help_heading = "Timeouts")]
    pub ready_pattern: String,

    /// Delay assumed sufficient for the server to start (fixed-delay)
    #[clap(long, default_value_t = DurationArg(crate::defaults::READY_DELAY), help_heading = "Timeouts")]
    pub ready_delay: DurationArg,

    /// Directory receiving one sub-directory per run
    #[clap(short = 'o', long, default_value = crate::defaults::OUTPUT_DIR, help_heading = "Output")]
    pub output_dir: PathBuf,

    /// Label used as the run id prefix
    #[clap(long, default_value = "matrix", help_heading = "Output")]
    pub label: String,

    /// Also write logs to this file
    #[clap(long, help_heading = "Output")]
    pub log_file: Option<PathBuf>,

    /// Verbose output
    #[clap(short = 'v', long, default_value_t = false, help_heading = "Output")]
    pub verbose: bool,
}

/// Server readiness detection as selected on the command line
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ReadinessKind {
    /// Wait for the readiness text in the server output
    #[clap(name = "log-line")]
    LogLine,
    /// Poll the server port until it accepts a TCP connection
    #[clap(name = "port-probe")]
    PortProbe,
    /// Wait a fixed delay
    #[clap(name = "fixed-delay")]
    FixedDelay,
}

/// Validated configuration of one matrix run
#[derive(Clone, Debug)]
pub struct MatrixConfig {
    pub nodes: Vec<Node>,
    pub topology: ClusterTopology,
    pub settings: BenchmarkSettings,
    pub runner: RunnerConfig,
    pub max_concurrent: usize,
    pub abort_on_first_failure: bool,
    pub launcher: Launcher,
    pub launcher_args: Vec<String>,
    pub output_dir: PathBuf,
    pub label: String,
}

impl MatrixConfig {
    pub fn from_args(args: &Args) -> Result<Self> {
        validate_duration(args.duration.0).map_err(configuration)?;
        validate_parallel(args.parallel).map_err(configuration)?;
        validate_concurrency(args.max_concurrent).map_err(configuration)?;
        validate_port(args.port, args.max_concurrent).map_err(configuration)?;

        let mut topology = match &args.topology {
            Some(path) => ClusterTopology::from_json_file(path)?,
            None => ClusterTopology::new(),
        };
        if let Some(suffix) = &args.fabric_suffix {
            topology = topology.with_fabric_suffix(suffix.clone());
        }

        let names = collect_nodes(args)?;
        let nodes = dedup_nodes(
            &names
                .iter()
                .map(|name| topology.node(name))
                .collect::<Vec<_>>(),
        );
        if nodes.len() < 2 {
            return Err(OrchestratorError::Configuration(format!(
                "at least 2 distinct nodes are required, got {}",
                nodes.len()
            )));
        }

        let settings = BenchmarkSettings {
            tool_path: args.tool_path.clone(),
            duration: args.duration.0,
            parallel: args.parallel,
            bitrate: args.bitrate.clone(),
            protocol: args.protocol,
            addressing: args.addressing.with_lane(args.lane),
            base_port: args.port,
            omit: args.omit,
            connect_timeout: args.connect_timeout.0,
            numa_bind: args.numa_bind,
            reverse: args.reverse,
            window: args.window.clone(),
            length: args.length.clone(),
            congestion: args.congestion.clone(),
            zerocopy: args.zerocopy,
            extra_client_args: args.client_args.clone(),
        };

        let readiness = match args.readiness {
            ReadinessKind::LogLine => ReadinessStrategy::LogLine(args.ready_pattern.clone()),
            ReadinessKind::PortProbe => {
                ReadinessStrategy::PortProbe(crate::defaults::PORT_PROBE_INTERVAL)
            }
            ReadinessKind::FixedDelay => ReadinessStrategy::FixedDelay(args.ready_delay.0),
        };

        Ok(Self {
            nodes,
            topology,
            settings,
            runner: RunnerConfig {
                server_start_timeout: args.server_start_timeout.0,
                completion_slack: args.completion_slack.0,
                grace: args.grace.0,
                readiness,
            },
            max_concurrent: args.max_concurrent,
            abort_on_first_failure: args.abort_on_first_failure,
            launcher: args.launcher,
            launcher_args: args.launcher_args.clone(),
            output_dir: args.output_dir.clone(),
            label: args.label.clone(),
        })
    }

    pub fn resolver(&self) -> StaticResolver {
        StaticResolver::new(self.topology.clone())
    }

    pub fn executor(&self) -> CommandExecutor {
        CommandExecutor::new(self.launcher).with_extra_args(self.launcher_args.clone())
    }
}

fn configuration(e: anyhow::Error) -> OrchestratorError {
    OrchestratorError::Configuration(e.to_string())
}

/// Node names from the positional arguments and the nodes file, falling back
/// to the Slurm host list when neither gives any.
pub fn collect_nodes(args: &Args) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for list in &args.nodes {
        names.extend(expand_hostlist(list).map_err(configuration)?);
    }
    if let Some(path) = &args.nodes_file {
        names.extend(read_nodes_file(path)?);
    }
    if names.is_empty() {
        if let Some(list) = &args.slurm_nodes {
            names.extend(expand_hostlist(list).map_err(configuration)?);
        }
    }
    if names.is_empty() {
        return Err(OrchestratorError::Configuration(
            "no nodes given; pass node names, --nodes-file or --slurm-nodes".to_string(),
        ));
    }
    Ok(names)
}

fn read_nodes_file(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        OrchestratorError::Configuration(format!(
            "cannot read nodes file {}: {}",
            path.display(),
            e
        ))
    })?;
    let mut names = Vec::new();
    for line in content.lines() {
        let line = line.split('#').next().unwrap_or_default().trim();
        if !line.is_empty() {
            names.extend(expand_hostlist(line).map_err(configuration)?);
        }
    }
    Ok(names)
}

/// A duration option, shown in `--help` in the form [`parse_duration`] reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DurationArg(pub Duration);

impl fmt::Display for DurationArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.subsec_nanos() == 0 {
            write!(f, "{}s", self.0.as_secs())
        } else {
            write!(f, "{}ms", self.0.as_millis())
        }
    }
}

impl FromStr for DurationArg {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        parse_duration(s).map(DurationArg)
    }
}

/// Parse duration from string (e.g., "10s", "500ms", "1.5m", "1h")
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, scale) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, 0.001)
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, 1.0)
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, 60.0)
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, 3600.0)
    } else {
        (s, 1.0) // Default to seconds
    };

    let num: f64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;
    if !num.is_finite() || num < 0.0 {
        return Err(format!("Duration must be a non-negative number: {}", s));
    }

    Ok(Duration::from_secs_f64(num * scale))
}
