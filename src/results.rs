//! # Result Aggregation and Reporting
//!
//! Terminal sink of a matrix run. Every pair runner hands its [`PairResult`]
//! to the [`ResultAggregator`], which
//!
//! 1. inserts it into the shared [`Matrix`] (exactly once per ordered pair),
//! 2. persists it immediately through the optional [`ResultsWriter`], so a
//!    crash mid-run still leaves every finished pair on disk.
//!
//! Once the scheduler is done, [`Matrix::validate`] checks completeness and
//! derives the [`MatrixSummary`]; the writer then produces the final
//! `matrix.json` and `summary.txt`.
//!
//! ## Output Layout
//!
//! ```text
//! <output_dir>/<run_id>/
//!   results.jsonl                one line per pair, in completion order
//!   pairs/<server>__<client>/
//!     result.json
//!     client_stdout.txt
//!     server_stdout.txt
//!     command.txt
//!   matrix.json                  metadata + summary + every pair
//!   summary.txt                  human-readable report
//! ```

use crate::error::{OrchestratorError, Result};
use crate::remote::ProcessState;
use crate::runner::RunnerState;
use crate::scheduler::TestSpec;
use crate::tool::{BenchmarkSettings, Measurement};
use crate::utils::{
    calculate_stats, format_bitrate, format_bytes, format_duration, format_table_row, format_table_separator,
    sanitize_path_component,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Ordered (server, client) pair identifying one matrix entry.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PairKey {
    pub server: String,
    pub client: String,
}

impl PairKey {
    pub fn new(server: impl Into<String>, client: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            client: client.into(),
        }
    }

    /// Directory name for this pair; distinct keys never share a directory.
    pub fn dir_name(&self) -> String {
        format!(
            "{}__{}",
            sanitize_path_component(&self.server),
            sanitize_path_component(&self.client)
        )
    }
}

impl std::fmt::Display for PairKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}->{}", self.server, self.client)
    }
}

/// Why a pair did not produce a measurement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Resolution,
    Launch,
    ServerExited,
    ClientExit,
    ToolError,
    MeasurementParse,
    Cancelled,
    Skipped,
    Internal,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureKind::Resolution => "resolution",
            FailureKind::Launch => "launch",
            FailureKind::ServerExited => "server exited",
            FailureKind::ClientExit => "client exit",
            FailureKind::ToolError => "tool error",
            FailureKind::MeasurementParse => "unparsable output",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Skipped => "skipped",
            FailureKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Which deadline expired.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPhase {
    ServerStart,
    ClientCompletion,
}

impl std::fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutPhase::ServerStart => f.write_str("server start"),
            TimeoutPhase::ClientCompletion => f.write_str("client completion"),
        }
    }
}

/// Terminal outcome of one pair test.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PairOutcome {
    Success(Measurement),
    Failure { kind: FailureKind, reason: String },
    Timeout { phase: TimeoutPhase, limit: Duration },
}

impl PairOutcome {
    pub fn failure(kind: FailureKind, reason: impl Into<String>) -> Self {
        PairOutcome::Failure {
            kind,
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, PairOutcome::Success(_))
    }

    pub fn measurement(&self) -> Option<&Measurement> {
        match self {
            PairOutcome::Success(m) => Some(m),
            _ => None,
        }
    }

    /// Short status label for tables and logs.
    pub fn label(&self) -> String {
        match self {
            PairOutcome::Success(_) => "ok".to_string(),
            PairOutcome::Failure { kind, .. } => format!("failed ({})", kind),
            PairOutcome::Timeout { phase, .. } => format!("timeout ({})", phase),
        }
    }

    /// Human-readable explanation for non-successful outcomes.
    pub fn reason(&self) -> Option<String> {
        match self {
            PairOutcome::Success(_) => None,
            PairOutcome::Failure { kind, reason } => Some(format!("{}: {}", kind, reason)),
            PairOutcome::Timeout { phase, limit } => {
                Some(format!("{} exceeded {}", phase, format_duration(*limit)))
            }
        }
    }
}

/// Everything recorded about one pair test.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PairResult {
    pub spec: TestSpec,
    pub outcome: PairOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub wall_clock: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_output: Option<String>,
    pub server_state: Option<ProcessState>,
    pub client_state: Option<ProcessState>,
    /// Runner states in the order they were entered
    pub states: Vec<RunnerState>,
    /// Cleanup problems; they never change the outcome
    pub diagnostics: Vec<String>,
}

impl PairResult {
    pub fn key(&self) -> PairKey {
        self.spec.key()
    }

    /// Result for a pair that was never dispatched.
    pub fn skipped(spec: TestSpec, reason: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            spec,
            outcome: PairOutcome::failure(FailureKind::Skipped, reason),
            started_at: now,
            finished_at: now,
            wall_clock: Duration::ZERO,
            server_command: None,
            client_command: None,
            client_stdout: None,
            client_stderr: None,
            server_output: None,
            server_state: None,
            client_state: None,
            states: Vec::new(),
            diagnostics: Vec::new(),
        }
    }
}

/// Throughput statistics over successful pairs, in bits per second.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThroughputStats {
    pub mean_bps: f64,
    pub min_bps: f64,
    pub max_bps: f64,
    pub std_dev_bps: f64,
}

/// Directional asymmetry of one unordered node pair.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SymmetryEntry {
    pub a: String,
    pub b: String,
    /// Throughput with `a` as server and `b` as client
    pub forward_bps: f64,
    pub reverse_bps: f64,
    /// `|forward - reverse| / mean(forward, reverse)`
    pub deviation: f64,
}

/// Aggregate view of a complete matrix.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatrixSummary {
    pub expected: usize,
    pub count: usize,
    pub succeeded: usize,
    /// All `Failure` outcomes, skipped pairs included
    pub failed: usize,
    pub timed_out: usize,
    pub skipped: usize,
    pub throughput: Option<ThroughputStats>,
    pub symmetry: Vec<SymmetryEntry>,
    pub mean_symmetry_deviation: Option<f64>,
    pub worst_symmetry: Option<SymmetryEntry>,
}

impl MatrixSummary {
    pub fn all_succeeded(&self) -> bool {
        self.count == self.expected && self.succeeded == self.count
    }

    fn from_results(expected: usize, results: &BTreeMap<PairKey, PairResult>) -> Self {
        let mut succeeded = 0;
        let mut failed = 0;
        let mut timed_out = 0;
        let mut skipped = 0;
        let mut rates = Vec::new();
        for result in results.values() {
            match &result.outcome {
                PairOutcome::Success(m) => {
                    succeeded += 1;
                    rates.push(m.throughput_bps());
                }
                PairOutcome::Failure { kind, .. } => {
                    failed += 1;
                    if *kind == FailureKind::Skipped {
                        skipped += 1;
                    }
                }
                PairOutcome::Timeout { .. } => timed_out += 1,
            }
        }

        let throughput = (!rates.is_empty()).then(|| {
            let (mean_bps, min_bps, max_bps, std_dev_bps) = calculate_stats(&rates);
            ThroughputStats {
                mean_bps,
                min_bps,
                max_bps,
                std_dev_bps,
            }
        });

        let mut symmetry = Vec::new();
        for (key, result) in results.iter() {
            if key.server >= key.client {
                continue;
            }
            let reverse = results.get(&PairKey::new(key.client.clone(), key.server.clone()));
            if let (Some(forward), Some(reverse)) = (
                result.outcome.measurement(),
                reverse.and_then(|r| r.outcome.measurement()),
            ) {
                let (ab, ba) = (forward.throughput_bps(), reverse.throughput_bps());
                let mean = (ab + ba) / 2.0;
                let deviation = if mean > 0.0 { (ab - ba).abs() / mean } else { 0.0 };
                symmetry.push(SymmetryEntry {
                    a: key.server.clone(),
                    b: key.client.clone(),
                    forward_bps: ab,
                    reverse_bps: ba,
                    deviation,
                });
            }
        }

        let deviations: Vec<f64> = symmetry.iter().map(|s| s.deviation).collect();
        let mean_symmetry_deviation =
            (!deviations.is_empty()).then(|| calculate_stats(&deviations).0);
        let worst_symmetry = symmetry
            .iter()
            .max_by(|x, y| x.deviation.total_cmp(&y.deviation))
            .cloned();

        Self {
            expected,
            count: results.len(),
            succeeded,
            failed,
            timed_out,
            skipped,
            throughput,
            symmetry,
            mean_symmetry_deviation,
            worst_symmetry,
        }
    }
}

/// Concurrent map of ordered pairs to their results.
#[derive(Debug, Default)]
pub struct Matrix {
    entries: Mutex<BTreeMap<PairKey, PairResult>>,
}

impl Matrix {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a result. A pair can be recorded once; later results are rejected.
    pub fn insert(&self, result: PairResult) -> Result<()> {
        let key = result.key();
        let mut entries = self.entries.lock();
        if entries.contains_key(&key) {
            return Err(OrchestratorError::DuplicatePair(key.to_string()));
        }
        entries.insert(key, result);
        Ok(())
    }

    pub fn contains(&self, key: &PairKey) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn get(&self, key: &PairKey) -> Option<PairResult> {
        self.entries.lock().get(key).cloned()
    }

    /// All results in dispatch order.
    pub fn results(&self) -> Vec<PairResult> {
        let mut results: Vec<PairResult> = self.entries.lock().values().cloned().collect();
        results.sort_by_key(|r| r.spec.index);
        results
    }

    /// Check that every expected pair is present and summarize the matrix.
    ///
    /// Pure with respect to the matrix: calling it twice on the same contents
    /// gives the same summary.
    pub fn validate(&self, expected: &[PairKey]) -> Result<MatrixSummary> {
        let entries = self.entries.lock();
        let missing: Vec<String> = expected
            .iter()
            .filter(|key| !entries.contains_key(key))
            .map(|key| key.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(OrchestratorError::IncompleteMatrix {
                expected: expected.len(),
                missing,
            });
        }
        Ok(MatrixSummary::from_results(expected.len(), &entries))
    }
}

/// Host and scheduler context of the orchestrating machine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SystemInfo {
    pub hostname: Option<String>,
    pub os: String,
    pub architecture: String,
    pub cpu_cores: usize,
    pub orchestrator_version: String,
    /// `SLURM_*` environment of the allocation, when running under Slurm
    pub slurm: BTreeMap<String, String>,
}

impl SystemInfo {
    const SLURM_VARIABLES: [&'static str; 6] = [
        "SLURM_JOB_ID",
        "SLURM_JOB_NAME",
        "SLURM_JOB_NODELIST",
        "SLURM_JOB_NUM_NODES",
        "SLURM_CLUSTER_NAME",
        "SLURM_JOB_PARTITION",
    ];

    pub fn collect() -> Self {
        let slurm = Self::SLURM_VARIABLES
            .iter()
            .filter_map(|name| std::env::var(name).ok().map(|v| (name.to_string(), v)))
            .collect();
        Self {
            hostname: std::env::var("HOSTNAME").ok(),
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            cpu_cores: crate::utils::get_cpu_cores(),
            orchestrator_version: crate::VERSION.to_string(),
            slurm,
        }
    }
}

/// Run-level metadata written alongside the matrix.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunMetadata {
    pub version: String,
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub nodes: Vec<String>,
    pub settings: BenchmarkSettings,
    pub max_concurrent: usize,
    pub launcher: String,
    /// First line of `<tool> --version` on the first node, when recorded
    #[serde(default)]
    pub tool_version: Option<String>,
    pub cancelled: bool,
    pub system_info: SystemInfo,
}

/// Final report of a matrix run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MatrixReport {
    pub metadata: RunMetadata,
    pub summary: MatrixSummary,
    pub results: Vec<PairResult>,
}

impl MatrixReport {
    /// Process exit code for this report.
    pub fn exit_code(&self) -> u8 {
        if self.metadata.cancelled {
            crate::exit_codes::CANCELLED
        } else if self.summary.all_succeeded() {
            crate::exit_codes::SUCCESS
        } else {
            crate::exit_codes::PARTIAL_FAILURE
        }
    }

    /// Render the human-readable report.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let s = &self.summary;
        let line = |out: &mut String, text: String| {
            out.push_str(&text);
            out.push('\n');
        };

        line(&mut out, format!("Network throughput matrix, run {}", self.metadata.run_id));
        line(
            &mut out,
            format!(
                "Nodes: {}  Pairs: {}  Succeeded: {}  Failed: {}  Timed out: {}  Skipped: {}",
                self.metadata.nodes.len(),
                s.count,
                s.succeeded,
                s.failed,
                s.timed_out,
                s.skipped
            ),
        );
        line(
            &mut out,
            format!(
                "Settings: {} {} x{} for {}, {} addressing",
                self.metadata.settings.tool_path,
                self.metadata.settings.protocol,
                self.metadata.settings.parallel,
                format_duration(self.metadata.settings.duration),
                self.metadata.settings.addressing
            ),
        );
        if let Some(version) = &self.metadata.tool_version {
            line(&mut out, format!("Tool: {}", version));
        }
        if self.metadata.cancelled {
            line(&mut out, "Run was cancelled before completion".to_string());
        }
        if let Some(t) = &s.throughput {
            line(
                &mut out,
                format!(
                    "Throughput: mean {}  min {}  max {}  stddev {}",
                    format_bitrate(t.mean_bps),
                    format_bitrate(t.min_bps),
                    format_bitrate(t.max_bps),
                    format_bitrate(t.std_dev_bps)
                ),
            );
        }
        if let (Some(mean), Some(worst)) = (s.mean_symmetry_deviation, &s.worst_symmetry) {
            line(
                &mut out,
                format!(
                    "Symmetry: mean deviation {:.1}%, worst {}<->{} {:.1}%",
                    mean * 100.0,
                    worst.a,
                    worst.b,
                    worst.deviation * 100.0
                ),
            );
        }
        out.push('\n');

        let widths = [16, 16, 24, 16, 10];
        line(&mut out, format_table_separator(&widths));
        line(
            &mut out,
            format_table_row(&["Server", "Client", "Status", "Throughput", "Elapsed"], &widths),
        );
        line(&mut out, format_table_separator(&widths));
        for result in &self.results {
            let throughput = result
                .outcome
                .measurement()
                .map(|m| format_bitrate(m.throughput_bps()))
                .unwrap_or_else(|| "-".to_string());
            let status = result.outcome.label();
            let elapsed = format_duration(result.wall_clock);
            line(
                &mut out,
                format_table_row(
                    &[
                        result.spec.server.name.as_str(),
                        result.spec.client.name.as_str(),
                        status.as_str(),
                        throughput.as_str(),
                        elapsed.as_str(),
                    ],
                    &widths,
                ),
            );
        }
        line(&mut out, format_table_separator(&widths));
        out.push('\n');

        out.push_str(&self.render_grid());

        let failures: Vec<String> = self
            .results
            .iter()
            .filter_map(|r| r.outcome.reason().map(|reason| format!("  {}: {}", r.key(), reason)))
            .collect();
        if !failures.is_empty() {
            out.push('\n');
            line(&mut out, "Failures:".to_string());
            for failure in failures {
                line(&mut out, failure);
            }
        }
        out
    }

    /// N×N grid in Gbit/s, servers as rows and clients as columns.
    fn render_grid(&self) -> String {
        let nodes = &self.metadata.nodes;
        let by_key: BTreeMap<PairKey, &PairResult> =
            self.results.iter().map(|r| (r.key(), r)).collect();
        let name_width = nodes.iter().map(String::len).max().unwrap_or(4).max(14);
        let mut widths = vec![name_width];
        widths.extend(nodes.iter().map(|n| n.len().max(8)));

        let mut header: Vec<&str> = vec!["server\\client"];
        header.extend(nodes.iter().map(String::as_str));

        let mut out = String::from("Throughput grid (Gbit/s)\n");
        out.push_str(&format_table_separator(&widths));
        out.push('\n');
        out.push_str(&format_table_row(&header, &widths));
        out.push('\n');
        out.push_str(&format_table_separator(&widths));
        out.push('\n');
        for server in nodes {
            let cells: Vec<String> = nodes
                .iter()
                .map(|client| {
                    if client == server {
                        return "-".to_string();
                    }
                    match by_key.get(&PairKey::new(server.clone(), client.clone())) {
                        None => "?".to_string(),
                        Some(r) => match &r.outcome {
                            PairOutcome::Success(m) => format!("{:.2}", m.throughput_bps() / 1e9),
                            PairOutcome::Failure {
                                kind: FailureKind::Skipped,
                                ..
                            } => "SKIP".to_string(),
                            PairOutcome::Failure { .. } => "FAIL".to_string(),
                            PairOutcome::Timeout { .. } => "TIMEOUT".to_string(),
                        },
                    }
                })
                .collect();
            let mut row: Vec<&str> = vec![server.as_str()];
            row.extend(cells.iter().map(String::as_str));
            out.push_str(&format_table_row(&row, &widths));
            out.push('\n');
        }
        out.push_str(&format_table_separator(&widths));
        out.push('\n');
        out
    }
}

/// Persists pair results and the final report under `<output_dir>/<run_id>`.
pub struct ResultsWriter {
    run_dir: PathBuf,
    stream: Mutex<File>,
}

impl ResultsWriter {
    pub fn new(output_dir: &Path, run_id: &str) -> Result<Self> {
        let run_dir = output_dir.join(sanitize_path_component(run_id));
        std::fs::create_dir_all(run_dir.join("pairs"))?;
        let stream = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(run_dir.join("results.jsonl"))?;
        debug!("Writing results to {:?}", run_dir);
        Ok(Self {
            run_dir,
            stream: Mutex::new(stream),
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn pair_dir(&self, key: &PairKey) -> PathBuf {
        self.run_dir.join("pairs").join(key.dir_name())
    }

    /// Write one pair's files and append it to the JSON-lines stream.
    pub fn write_pair(&self, result: &PairResult) -> Result<PathBuf> {
        let dir = self.pair_dir(&result.key());
        std::fs::create_dir_all(&dir)?;

        std::fs::write(dir.join("result.json"), serde_json::to_string_pretty(result)?)?;
        if let Some(stdout) = &result.client_stdout {
            std::fs::write(dir.join("client_stdout.txt"), stdout)?;
        }
        if let Some(output) = &result.server_output {
            std::fs::write(dir.join("server_stdout.txt"), output)?;
        }
        let commands: Vec<&str> = [&result.server_command, &result.client_command]
            .into_iter()
            .flatten()
            .map(String::as_str)
            .collect();
        if !commands.is_empty() {
            std::fs::write(dir.join("command.txt"), commands.join("\n") + "\n")?;
        }

        let mut stream = self.stream.lock();
        writeln!(stream, "{}", serde_json::to_string(result)?)?;
        stream.flush()?;
        Ok(dir)
    }

    /// Write `matrix.json` and `summary.txt`.
    pub fn finalize(&self, report: &MatrixReport) -> Result<()> {
        std::fs::write(
            self.run_dir.join("matrix.json"),
            serde_json::to_string_pretty(report)?,
        )?;
        std::fs::write(self.run_dir.join("summary.txt"), report.render())?;
        info!("Results written to: {:?}", self.run_dir);
        Ok(())
    }
}

/// Single entry point for finished pairs: matrix insertion plus persistence.
pub struct ResultAggregator {
    matrix: Matrix,
    writer: Option<ResultsWriter>,
}

impl ResultAggregator {
    pub fn new(writer: Option<ResultsWriter>) -> Self {
        Self {
            matrix: Matrix::new(),
            writer,
        }
    }

    pub fn matrix(&self) -> &Matrix {
        &self.matrix
    }

    pub fn record(&self, result: PairResult) -> Result<()> {
        let key = result.key();
        if self.matrix.contains(&key) {
            return Err(OrchestratorError::DuplicatePair(key.to_string()));
        }
        match &result.outcome {
            PairOutcome::Success(m) => {
                info!(
                    "{}: {} ({} received)",
                    key,
                    format_bitrate(m.throughput_bps()),
                    format_bytes(m.bytes_received)
                )
            }
            other => warn!(
                "{}: {}",
                key,
                other.reason().unwrap_or_else(|| other.label())
            ),
        }
        if let Some(writer) = &self.writer {
            writer.write_pair(&result)?;
        }
        self.matrix.insert(result)
    }

    /// Validate the matrix, build the report and persist it.
    pub fn finalize(&self, expected: &[PairKey], metadata: RunMetadata) -> Result<MatrixReport> {
        let summary = self.matrix.validate(expected)?;
        let report = MatrixReport {
            metadata,
            summary,
            results: self.matrix.results(),
        };
        if let Some(writer) = &self.writer {
            writer.finalize(&report)?;
        }
        Ok(report)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::Node;
    use tempfile::TempDir;

    fn measurement(bps: f64) -> Measurement {
        Measurement {
            protocol: "TCP".into(),
            duration_secs: 10.0,
            streams: 1,
            sent_bps: bps,
            received_bps: bps,
            bytes_sent: 0,
            bytes_received: 0,
            retransmits: Some(0),
            jitter_ms: None,
            lost_percent: None,
            cpu_local_percent: None,
            cpu_remote_percent: None,
            intervals_bps: vec![],
        }
    }

    fn result(index: usize, server: &str, client: &str, outcome: PairOutcome) -> PairResult {
        let spec = TestSpec {
            index,
            server: Node::named(server),
            client: Node::named(client),
            settings: BenchmarkSettings::default(),
        };
        PairResult {
            outcome,
            client_stdout: Some("{}".into()),
            client_command: Some(format!("iperf3 --client {}", server)),
            ..PairResult::skipped(spec, "")
        }
    }

    fn keys(nodes: &[&str]) -> Vec<PairKey> {
        let mut keys = Vec::new();
        for s in nodes {
            for c in nodes {
                if s != c {
                    keys.push(PairKey::new(*s, *c));
                }
            }
        }
        keys
    }

    fn full_matrix() -> Matrix {
        let matrix = Matrix::new();
        let rates = [("a", "b", 10e9), ("b", "a", 8e9), ("a", "c", 9e9), ("c", "a", 9e9)];
        for (i, (s, c, bps)) in rates.iter().enumerate() {
            matrix
                .insert(result(i, s, c, PairOutcome::Success(measurement(*bps))))
                .unwrap();
        }
        matrix
            .insert(result(
                4,
                "b",
                "c",
                PairOutcome::failure(FailureKind::ClientExit, "exit code 1"),
            ))
            .unwrap();
        matrix
            .insert(result(
                5,
                "c",
                "b",
                PairOutcome::Timeout {
                    phase: TimeoutPhase::ServerStart,
                    limit: Duration::from_secs(10),
                },
            ))
            .unwrap();
        matrix
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let matrix = Matrix::new();
        let ok = PairOutcome::Success(measurement(1e9));
        matrix.insert(result(0, "a", "b", ok.clone())).unwrap();
        let err = matrix.insert(result(1, "a", "b", ok)).unwrap_err();
        assert!(matches!(err, OrchestratorError::DuplicatePair(_)));
        assert_eq!(matrix.results().len(), 1);
    }

    #[test]
    fn test_validate_summary() {
        let matrix = full_matrix();
        let summary = matrix.validate(&keys(&["a", "b", "c"])).unwrap();
        assert_eq!(summary.count, 6);
        assert_eq!(summary.succeeded, 4);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.timed_out, 1);
        assert!(!summary.all_succeeded());

        let t = summary.throughput.unwrap();
        assert_eq!(t.mean_bps, 9e9);
        assert_eq!(t.min_bps, 8e9);
        assert_eq!(t.max_bps, 10e9);

        // a<->b deviates by 2/9, a<->c is symmetric, b<->c has no successes.
        assert_eq!(summary.symmetry.len(), 2);
        let worst = summary.worst_symmetry.unwrap();
        assert_eq!((worst.a.as_str(), worst.b.as_str()), ("a", "b"));
        assert!((worst.deviation - 2.0 / 9.0).abs() < 1e-12);
        assert!((summary.mean_symmetry_deviation.unwrap() - 1.0 / 9.0).abs() < 1e-12);
    }

    #[test]
    fn test_validate_is_idempotent() {
        let matrix = full_matrix();
        let expected = keys(&["a", "b", "c"]);
        let first = matrix.validate(&expected).unwrap();
        let second = matrix.validate(&expected).unwrap();
        assert_eq!(first, second);
        assert_eq!(matrix.results().len(), 6);
    }

    #[test]
    fn test_incomplete_matrix() {
        let matrix = full_matrix();
        let err = matrix.validate(&keys(&["a", "b", "c", "d"])).unwrap_err();
        match err {
            OrchestratorError::IncompleteMatrix { expected, missing } => {
                assert_eq!(expected, 12);
                assert_eq!(missing.len(), 6);
                assert!(missing.contains(&"d->a".to_string()));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_results_in_dispatch_order() {
        let matrix = full_matrix();
        let order: Vec<usize> = matrix.results().iter().map(|r| r.spec.index).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4, 5]);
    }

    fn report(matrix: &Matrix, nodes: &[&str]) -> MatrixReport {
        let expected = keys(nodes);
        MatrixReport {
            metadata: RunMetadata {
                version: crate::VERSION.to_string(),
                run_id: "test-run".into(),
                started_at: Utc::now(),
                finished_at: Utc::now(),
                nodes: nodes.iter().map(|n| n.to_string()).collect(),
                settings: BenchmarkSettings::default(),
                max_concurrent: 1,
                launcher: "mock".into(),
                tool_version: Some("iperf 3.16".into()),
                cancelled: false,
                system_info: SystemInfo::collect(),
            },
            summary: matrix.validate(&expected).unwrap(),
            results: matrix.results(),
        }
    }

    #[test]
    fn test_render_report() {
        let matrix = full_matrix();
        let text = report(&matrix, &["a", "b", "c"]).render();
        assert!(text.contains("Pairs: 6  Succeeded: 4  Failed: 1  Timed out: 1"));
        assert!(text.contains("10.00"));
        assert!(text.contains("FAIL"));
        assert!(text.contains("TIMEOUT"));
        assert!(text.contains("b->c: client exit: exit code 1"));
        assert!(text.contains("worst a<->b 22.2%"));
        assert!(text.contains("Tool: iperf 3.16"));
    }

    #[test]
    fn test_exit_codes() {
        let matrix = full_matrix();
        let mut r = report(&matrix, &["a", "b", "c"]);
        assert_eq!(r.exit_code(), crate::exit_codes::PARTIAL_FAILURE);
        r.metadata.cancelled = true;
        assert_eq!(r.exit_code(), crate::exit_codes::CANCELLED);

        let ok = Matrix::new();
        ok.insert(result(0, "a", "b", PairOutcome::Success(measurement(1e9))))
            .unwrap();
        ok.insert(result(1, "b", "a", PairOutcome::Success(measurement(1e9))))
            .unwrap();
        assert_eq!(report(&ok, &["a", "b"]).exit_code(), crate::exit_codes::SUCCESS);
    }

    #[test]
    fn test_writer_layout() {
        let dir = TempDir::new().unwrap();
        let writer = ResultsWriter::new(dir.path(), "run-1").unwrap();
        let aggregator = ResultAggregator::new(Some(writer));

        let mut r = result(0, "node/1", "node_2", PairOutcome::Success(measurement(5e9)));
        r.server_output = Some("Server listening on 5201".into());
        aggregator.record(r).unwrap();
        aggregator
            .record(result(1, "node_2", "node/1", PairOutcome::Success(measurement(5e9))))
            .unwrap();

        let pair_dir = dir.path().join("run-1/pairs/node%2F1__node%5F2");
        assert!(pair_dir.join("result.json").exists());
        assert_eq!(
            std::fs::read_to_string(pair_dir.join("server_stdout.txt")).unwrap(),
            "Server listening on 5201"
        );
        assert!(std::fs::read_to_string(pair_dir.join("command.txt"))
            .unwrap()
            .contains("iperf3 --client"));

        let parsed: PairResult =
            serde_json::from_str(&std::fs::read_to_string(pair_dir.join("result.json")).unwrap())
                .unwrap();
        assert_eq!(parsed.key(), PairKey::new("node/1", "node_2"));

        let expected = vec![
            PairKey::new("node/1", "node_2"),
            PairKey::new("node_2", "node/1"),
        ];
        let metadata = report(aggregator.matrix(), &["node/1", "node_2"]).metadata;
        let final_report = aggregator.finalize(&expected, metadata).unwrap();
        assert!(final_report.summary.all_succeeded());

        let run_dir = dir.path().join("run-1");
        assert!(run_dir.join("matrix.json").exists());
        assert!(run_dir.join("summary.txt").exists());
        let lines = std::fs::read_to_string(run_dir.join("results.jsonl")).unwrap();
        assert_eq!(lines.lines().count(), 2);
    }

    #[test]
    fn test_aggregator_rejects_duplicates_before_writing() {
        let aggregator = ResultAggregator::new(None);
        let ok = PairOutcome::Success(measurement(1e9));
        aggregator.record(result(0, "a", "b", ok.clone())).unwrap();
        assert!(aggregator.record(result(0, "a", "b", ok)).is_err());
    }
}
