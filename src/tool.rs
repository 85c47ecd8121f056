//! # Benchmark Tool Contract
//!
//! Everything the orchestrator knows about iperf3 lives here: how to build the
//! server and client command lines from [`BenchmarkSettings`] and resolved
//! [`Endpoint`]s, and how to turn the client's `--json` document into a
//! [`Measurement`].
//!
//! ## Command Lines
//!
//! ```text
//! server: iperf3 --server --port P --bind ADDR [--bind-dev IF] [--one-off]
//! client: iperf3 --client ADDR --port P --time D --parallel N [--bitrate B]
//!                [--udp|--sctp] [--omit S] [--reverse] [--window W] [--length L]
//!                [--congestion ALG] [--zerocopy] [--bind CADDR] [--bind-dev IF]
//!                --connect-timeout MS --title SERVER->CLIENT --json
//! ```
//!
//! `--one-off` is left out when readiness is detected by connecting to the
//! server port: iperf3 counts that bare connection as its one client and
//! exits before the real client arrives.
//!
//! With NUMA binding enabled and a known NUMA domain, either side is prefixed
//! with `numactl --cpunodebind=N --membind=N`.
//!
//! ## Result Document
//!
//! Only the parts of the iperf3 JSON schema the orchestrator reports on are
//! modelled: `start.test_start`, `intervals[].sum`, `end.sum_sent`,
//! `end.sum_received`, `end.sum` (UDP), `end.cpu_utilization_percent` and the
//! top-level `error` string iperf3 emits when a test fails.

use crate::error::{OrchestratorError, Result};
use crate::topology::{AddressingMode, Endpoint};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Transport protocol exercised by the benchmark.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[clap(name = "tcp")]
    Tcp,
    #[clap(name = "udp")]
    Udp,
    #[clap(name = "sctp")]
    Sctp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
            Protocol::Sctp => write!(f, "SCTP"),
        }
    }
}

/// Per-test benchmark parameters, shared by every pair of a run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenchmarkSettings {
    /// Path of the benchmark binary on the remote nodes
    pub tool_path: String,
    /// Measured test duration (excluding omitted warm-up seconds)
    pub duration: Duration,
    pub parallel: u32,
    /// Target bitrate in iperf3 notation (`10G`, `500M`)
    pub bitrate: Option<String>,
    pub protocol: Protocol,
    pub addressing: AddressingMode,
    /// First port handed out by the port allocator
    pub base_port: u16,
    /// Warm-up seconds excluded from the summary
    pub omit: u32,
    pub connect_timeout: Duration,
    pub numa_bind: bool,
    pub reverse: bool,
    pub window: Option<String>,
    pub length: Option<String>,
    pub congestion: Option<String>,
    pub zerocopy: bool,
    /// Passed verbatim to the client after the generated options
    pub extra_client_args: Vec<String>,
}

impl Default for BenchmarkSettings {
    fn default() -> Self {
        Self {
            tool_path: crate::defaults::TOOL_PATH.to_string(),
            duration: crate::defaults::DURATION,
            parallel: crate::defaults::PARALLEL,
            bitrate: None,
            protocol: Protocol::Tcp,
            addressing: AddressingMode::Management,
            base_port: crate::defaults::BASE_PORT,
            omit: 0,
            connect_timeout: crate::defaults::CONNECT_TIMEOUT,
            numa_bind: false,
            reverse: false,
            window: None,
            length: None,
            congestion: None,
            zerocopy: false,
            extra_client_args: Vec::new(),
        }
    }
}

impl BenchmarkSettings {
    /// Wall-clock time the client is expected to run, before slack.
    pub fn expected_runtime(&self) -> Duration {
        self.duration + Duration::from_secs(u64::from(self.omit))
    }
}

/// A command and its arguments, ready for a [`RemoteExecutor`](crate::remote::RemoteExecutor).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invocation {
    pub command: String,
    pub args: Vec<String>,
}

impl Invocation {
    fn numa_wrapped(settings: &BenchmarkSettings, endpoint: &Endpoint, tool_args: Vec<String>) -> Self {
        match endpoint.numa_domain.filter(|_| settings.numa_bind) {
            Some(domain) => {
                let mut args = vec![
                    format!("--cpunodebind={}", domain),
                    format!("--membind={}", domain),
                    settings.tool_path.clone(),
                ];
                args.extend(tool_args);
                Self {
                    command: "numactl".to_string(),
                    args,
                }
            }
            None => Self {
                command: settings.tool_path.clone(),
                args: tool_args,
            },
        }
    }
}

/// Server command line listening on `server` at `port`. With `one_off` the
/// server exits after serving a single client.
pub fn server_invocation(
    settings: &BenchmarkSettings,
    server: &Endpoint,
    port: u16,
    one_off: bool,
) -> Invocation {
    let mut args = vec![
        "--server".to_string(),
        "--port".to_string(),
        port.to_string(),
        "--bind".to_string(),
        server.address.clone(),
    ];
    if let Some(interface) = &server.interface {
        args.push("--bind-dev".to_string());
        args.push(interface.clone());
    }
    if one_off {
        args.push("--one-off".to_string());
    }
    Invocation::numa_wrapped(settings, server, args)
}

/// Command line printing the tool's version.
pub fn version_invocation(settings: &BenchmarkSettings) -> Invocation {
    Invocation {
        command: settings.tool_path.clone(),
        args: vec!["--version".to_string()],
    }
}

/// First non-empty line of `--version` output, e.g. `iperf 3.16 (cJSON 1.7.15)`.
pub fn parse_version(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

/// Client command line targeting `server:port` from `client`.
pub fn client_invocation(
    settings: &BenchmarkSettings,
    server: &Endpoint,
    client: &Endpoint,
    port: u16,
) -> Invocation {
    let mut args = vec![
        "--client".to_string(),
        server.address.clone(),
        "--port".to_string(),
        port.to_string(),
        "--time".to_string(),
        settings.duration.as_secs().max(1).to_string(),
        "--parallel".to_string(),
        settings.parallel.to_string(),
    ];

    let mut option = |flag: &str, value: &Option<String>| {
        if let Some(value) = value {
            args.push(flag.to_string());
            args.push(value.clone());
        }
    };
    option("--bitrate", &settings.bitrate);
    option("--window", &settings.window);
    option("--length", &settings.length);
    option("--congestion", &settings.congestion);

    match settings.protocol {
        Protocol::Tcp => {}
        Protocol::Udp => args.push("--udp".to_string()),
        Protocol::Sctp => args.push("--sctp".to_string()),
    }
    if settings.omit > 0 {
        args.push("--omit".to_string());
        args.push(settings.omit.to_string());
    }
    if settings.reverse {
        args.push("--reverse".to_string());
    }
    if settings.zerocopy {
        args.push("--zerocopy".to_string());
    }

    // Management traffic follows the default route; anything else is pinned.
    if settings.addressing != AddressingMode::Management {
        args.push("--bind".to_string());
        args.push(client.address.clone());
    }
    if let Some(interface) = &client.interface {
        args.push("--bind-dev".to_string());
        args.push(interface.clone());
    }

    args.push("--connect-timeout".to_string());
    args.push(settings.connect_timeout.as_millis().to_string());
    args.push("--title".to_string());
    args.push(format!("{}->{}", server.node, client.node));
    args.push("--json".to_string());
    args.extend(settings.extra_client_args.iter().cloned());

    Invocation::numa_wrapped(settings, client, args)
}

/// Throughput and quality figures extracted from one client run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub protocol: String,
    pub duration_secs: f64,
    pub streams: u32,
    pub sent_bps: f64,
    pub received_bps: f64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub retransmits: Option<u64>,
    pub jitter_ms: Option<f64>,
    pub lost_percent: Option<f64>,
    pub cpu_local_percent: Option<f64>,
    pub cpu_remote_percent: Option<f64>,
    /// Throughput of each reporting interval, omitted intervals excluded
    pub intervals_bps: Vec<f64>,
}

impl Measurement {
    /// Receiver-side throughput in bits per second.
    pub fn throughput_bps(&self) -> f64 {
        self.received_bps
    }
}

#[derive(Debug, Default, Deserialize)]
struct Document {
    #[serde(default)]
    start: Option<Start>,
    #[serde(default)]
    intervals: Vec<Interval>,
    #[serde(default)]
    end: Option<End>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Start {
    #[serde(default)]
    test_start: Option<TestStart>,
}

#[derive(Debug, Default, Deserialize)]
struct TestStart {
    #[serde(default)]
    protocol: Option<String>,
    #[serde(default)]
    num_streams: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct Interval {
    sum: Sum,
}

#[derive(Debug, Default, Deserialize)]
struct End {
    #[serde(default)]
    sum_sent: Option<Sum>,
    #[serde(default)]
    sum_received: Option<Sum>,
    #[serde(default)]
    sum: Option<Sum>,
    #[serde(default)]
    cpu_utilization_percent: Option<CpuUtilization>,
}

#[derive(Clone, Debug, Default, Deserialize)]
struct Sum {
    #[serde(default)]
    seconds: f64,
    #[serde(default)]
    bytes: u64,
    bits_per_second: f64,
    #[serde(default)]
    retransmits: Option<u64>,
    #[serde(default)]
    jitter_ms: Option<f64>,
    #[serde(default)]
    lost_percent: Option<f64>,
    #[serde(default)]
    omitted: bool,
}

#[derive(Debug, Deserialize)]
struct CpuUtilization {
    host_total: f64,
    remote_total: f64,
}

/// Slice out the JSON object from output that may carry launcher noise.
fn extract_json(output: &str) -> Option<&str> {
    let start = output.find('{')?;
    let end = output.rfind('}')?;
    (end > start).then(|| &output[start..=end])
}

/// Parse the client's `--json` output.
///
/// Returns `ToolReported` when the document carries iperf3's own `error`
/// field and `MeasurementParse` when the output is not a usable result.
pub fn parse_measurement(output: &str, settings: &BenchmarkSettings) -> Result<Measurement> {
    let json = extract_json(output)
        .ok_or_else(|| OrchestratorError::MeasurementParse("no JSON document in output".into()))?;
    let doc: Document = serde_json::from_str(json)
        .map_err(|e| OrchestratorError::MeasurementParse(e.to_string()))?;

    if let Some(error) = doc.error {
        return Err(OrchestratorError::ToolReported(error));
    }

    let end = doc
        .end
        .ok_or_else(|| OrchestratorError::MeasurementParse("missing 'end' section".into()))?;
    let received = end.sum_received.as_ref().or(end.sum.as_ref()).cloned();
    let sent = end.sum_sent.as_ref().or(end.sum.as_ref()).cloned();
    let (sent, received) = match (sent, received) {
        (Some(sent), Some(received)) => (sent, received),
        _ => {
            return Err(OrchestratorError::MeasurementParse(
                "no throughput summary in 'end' section".into(),
            ))
        }
    };

    let test_start = doc.start.and_then(|s| s.test_start).unwrap_or_default();
    let udp = end.sum.as_ref();

    Ok(Measurement {
        protocol: test_start
            .protocol
            .unwrap_or_else(|| settings.protocol.to_string()),
        duration_secs: received.seconds,
        streams: test_start.num_streams.unwrap_or(settings.parallel),
        sent_bps: sent.bits_per_second,
        received_bps: received.bits_per_second,
        bytes_sent: sent.bytes,
        bytes_received: received.bytes,
        retransmits: sent.retransmits,
        jitter_ms: udp.and_then(|s| s.jitter_ms),
        lost_percent: udp.and_then(|s| s.lost_percent),
        cpu_local_percent: end.cpu_utilization_percent.as_ref().map(|c| c.host_total),
        cpu_remote_percent: end.cpu_utilization_percent.as_ref().map(|c| c.remote_total),
        intervals_bps: doc
            .intervals
            .iter()
            .filter(|i| !i.sum.omitted)
            .map(|i| i.sum.bits_per_second)
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(node: &str, address: &str) -> Endpoint {
        Endpoint {
            node: node.to_string(),
            address: address.to_string(),
            interface: None,
            numa_domain: None,
        }
    }

    const TCP_OUTPUT: &str = r#"{
        "start": { "test_start": { "protocol": "TCP", "num_streams": 4, "duration": 10, "omit": 2 } },
        "intervals": [
            { "sum": { "seconds": 1.0, "bytes": 100, "bits_per_second": 8.0e9, "omitted": true } },
            { "sum": { "seconds": 1.0, "bytes": 100, "bits_per_second": 9.4e9, "omitted": false } },
            { "sum": { "seconds": 1.0, "bytes": 100, "bits_per_second": 9.5e9, "omitted": false } }
        ],
        "end": {
            "sum_sent": { "seconds": 10.0, "bytes": 11750000000, "bits_per_second": 9.41e9, "retransmits": 12 },
            "sum_received": { "seconds": 10.0, "bytes": 11740000000, "bits_per_second": 9.39e9 },
            "cpu_utilization_percent": { "host_total": 35.5, "remote_total": 20.25 }
        }
    }"#;

    #[test]
    fn test_server_invocation() {
        let mut server = endpoint("node001", "10.0.0.1");
        server.interface = Some("ib0".to_string());
        let inv = server_invocation(&BenchmarkSettings::default(), &server, 5202, true);
        assert_eq!(inv.command, "iperf3");
        assert_eq!(
            inv.args,
            vec!["--server", "--port", "5202", "--bind", "10.0.0.1", "--bind-dev", "ib0", "--one-off"]
        );

        let persistent = server_invocation(&BenchmarkSettings::default(), &server, 5202, false);
        assert!(!persistent.args.contains(&"--one-off".to_string()));
    }

    #[test]
    fn test_version_query() {
        let inv = version_invocation(&BenchmarkSettings::default());
        assert_eq!(inv.command, "iperf3");
        assert_eq!(inv.args, vec!["--version"]);

        let stdout = "\niperf 3.16 (cJSON 1.7.15)\nLinux node001 6.8.0 #1 SMP x86_64\n";
        assert_eq!(parse_version(stdout).as_deref(), Some("iperf 3.16 (cJSON 1.7.15)"));
        assert_eq!(parse_version("  \n"), None);
    }

    #[test]
    fn test_client_invocation_management() {
        let settings = BenchmarkSettings {
            duration: Duration::from_secs(30),
            parallel: 4,
            bitrate: Some("10G".to_string()),
            protocol: Protocol::Udp,
            omit: 2,
            ..Default::default()
        };
        let inv = client_invocation(
            &settings,
            &endpoint("node001", "node001"),
            &endpoint("node002", "node002"),
            5201,
        );
        let args = inv.args.join(" ");
        assert!(args.starts_with("--client node001 --port 5201 --time 30 --parallel 4"));
        assert!(args.contains("--bitrate 10G"));
        assert!(args.contains("--udp"));
        assert!(args.contains("--omit 2"));
        assert!(args.contains("--connect-timeout 5000"));
        assert!(args.contains("--title node001->node002"));
        assert!(!args.contains("--bind "));
        assert_eq!(inv.args.last().map(String::as_str), Some("--json"));
    }

    #[test]
    fn test_client_invocation_fabric_binds_source() {
        let settings = BenchmarkSettings {
            addressing: AddressingMode::Fabric,
            ..Default::default()
        };
        let inv = client_invocation(
            &settings,
            &endpoint("a", "a-ib"),
            &endpoint("b", "b-ib"),
            5201,
        );
        let args = inv.args.join(" ");
        assert!(args.contains("--bind b-ib"));
    }

    #[test]
    fn test_numa_prefix() {
        let settings = BenchmarkSettings {
            numa_bind: true,
            ..Default::default()
        };
        let mut server = endpoint("a", "10.0.0.1");
        let plain = server_invocation(&settings, &server, 5201, true);
        assert_eq!(plain.command, "iperf3");

        server.numa_domain = Some(1);
        let bound = server_invocation(&settings, &server, 5201, true);
        assert_eq!(bound.command, "numactl");
        assert_eq!(bound.args[..3], ["--cpunodebind=1", "--membind=1", "iperf3"]);
    }

    #[test]
    fn test_parse_tcp_measurement() {
        let m = parse_measurement(TCP_OUTPUT, &BenchmarkSettings::default()).unwrap();
        assert_eq!(m.protocol, "TCP");
        assert_eq!(m.streams, 4);
        assert_eq!(m.throughput_bps(), 9.39e9);
        assert_eq!(m.sent_bps, 9.41e9);
        assert_eq!(m.retransmits, Some(12));
        assert_eq!(m.intervals_bps, vec![9.4e9, 9.5e9]);
        assert_eq!(m.cpu_local_percent, Some(35.5));
    }

    #[test]
    fn test_parse_udp_measurement() {
        let output = r#"{
            "start": { "test_start": { "protocol": "UDP", "num_streams": 1 } },
            "intervals": [],
            "end": { "sum": { "seconds": 10.0, "bytes": 1250000, "bits_per_second": 1.0e6,
                              "jitter_ms": 0.012, "lost_percent": 0.5 } }
        }"#;
        let m = parse_measurement(output, &BenchmarkSettings::default()).unwrap();
        assert_eq!(m.throughput_bps(), 1.0e6);
        assert_eq!(m.jitter_ms, Some(0.012));
        assert_eq!(m.lost_percent, Some(0.5));
        assert_eq!(m.retransmits, None);
    }

    #[test]
    fn test_parse_with_launcher_noise() {
        let noisy = format!("srun: job step started\n{}\nsrun: done", TCP_OUTPUT);
        assert!(parse_measurement(&noisy, &BenchmarkSettings::default()).is_ok());
    }

    #[test]
    fn test_tool_reported_error() {
        let output = r#"{ "start": {}, "intervals": [], "end": {},
            "error": "unable to connect to server: Connection refused" }"#;
        let err = parse_measurement(output, &BenchmarkSettings::default()).unwrap_err();
        match err {
            OrchestratorError::ToolReported(msg) => assert!(msg.contains("Connection refused")),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_malformed_output() {
        let settings = BenchmarkSettings::default();
        for output in ["", "iperf3: error", "{ not json }", r#"{ "end": {} }"#] {
            let err = parse_measurement(output, &settings).unwrap_err();
            assert!(
                matches!(err, OrchestratorError::MeasurementParse(_)),
                "{:?} gave {}",
                output,
                err
            );
        }
    }

    #[test]
    fn test_expected_runtime_includes_omit() {
        let settings = BenchmarkSettings {
            duration: Duration::from_secs(10),
            omit: 3,
            ..Default::default()
        };
        assert_eq!(settings.expected_runtime(), Duration::from_secs(13));
    }
}
