//! # Orchestrator Error Taxonomy
//!
//! Every failure the orchestrator can observe falls into one of the variants
//! below. Only a handful are fatal for a run:
//!
//! - `Configuration`: the node set or settings are unusable, nothing is launched
//! - `IncompleteMatrix` / `DuplicatePair`: the scheduler and aggregator disagree,
//!   which indicates an internal defect
//! - `Io`: results could not be persisted
//!
//! The per-pair variants (`Resolution`, `Launch`, `Timeout`, `MeasurementParse`)
//! are caught by the pair runner and turned into a `Failure` or `Timeout`
//! outcome for that pair only.

use crate::topology::AddressingMode;
use std::time::Duration;
use thiserror::Error;

/// Result alias used by the library modules.
pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;

/// Errors raised by the matrix orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Invalid node set or benchmark settings.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A node could not be addressed in the requested mode.
    #[error("cannot resolve node '{node}' in {mode} mode: {reason}")]
    Resolution {
        node: String,
        mode: AddressingMode,
        reason: String,
    },

    /// The remote execution capability refused or failed to start a process.
    #[error("failed to launch '{command}' on {host}: {reason}")]
    Launch {
        host: String,
        command: String,
        reason: String,
    },

    /// A readiness or completion deadline elapsed.
    #[error("{phase} timed out after {elapsed:?}")]
    Timeout { phase: String, elapsed: Duration },

    /// The benchmark tool produced output that is not a valid result document.
    #[error("malformed benchmark output: {0}")]
    MeasurementParse(String),

    /// The benchmark tool produced a result document carrying its own error.
    #[error("benchmark tool reported: {0}")]
    ToolReported(String),

    /// Validation found expected pairs with no recorded result.
    #[error("matrix incomplete: {} of {expected} pairs missing ({})", .missing.len(), .missing.join(", "))]
    IncompleteMatrix {
        expected: usize,
        missing: Vec<String>,
    },

    /// A second result arrived for a pair that is already recorded.
    #[error("duplicate result for pair {0}")]
    DuplicatePair(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
