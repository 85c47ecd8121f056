//! # Run Context
//!
//! State shared by every pair runner of one matrix run, passed around as an
//! `Arc<RunContext>`:
//!
//! - the admission gate bounding concurrently active pairs
//! - the run-wide cancellation token
//! - the per-host server port allocator
//! - the result aggregator (matrix under construction)
//! - in-flight accounting with peak tracking

use crate::results::ResultAggregator;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Shared state of a matrix run.
pub struct RunContext {
    run_id: String,
    cancel: CancellationToken,
    admission: Arc<Semaphore>,
    admission_limit: usize,
    ports: PortAllocator,
    aggregator: ResultAggregator,
    in_flight: Arc<InFlight>,
}

impl RunContext {
    pub fn new(
        run_id: impl Into<String>,
        admission_limit: usize,
        base_port: u16,
        aggregator: ResultAggregator,
    ) -> Self {
        let admission_limit = admission_limit.max(1);
        Self {
            run_id: run_id.into(),
            cancel: CancellationToken::new(),
            admission: Arc::new(Semaphore::new(admission_limit)),
            admission_limit,
            ports: PortAllocator::new(base_port, admission_limit),
            aggregator,
            in_flight: Arc::new(InFlight::default()),
        }
    }

    /// Use an externally owned token, e.g. one wired to Ctrl-C.
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn admission(&self) -> Arc<Semaphore> {
        self.admission.clone()
    }

    pub fn admission_limit(&self) -> usize {
        self.admission_limit
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    pub fn aggregator(&self) -> &ResultAggregator {
        &self.aggregator
    }

    /// Mark a pair as active until the returned guard is dropped.
    pub fn enter_active(&self) -> ActiveGuard {
        let now = self.in_flight.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.in_flight.peak.fetch_max(now, Ordering::SeqCst);
        trace!("{} pair(s) active", now);
        ActiveGuard {
            in_flight: self.in_flight.clone(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.current.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously active pairs seen so far.
    pub fn peak_in_flight(&self) -> usize {
        self.in_flight.peak.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
}

pub struct ActiveGuard {
    in_flight: Arc<InFlight>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.in_flight.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Hands out server ports per host so concurrent servers never collide.
///
/// With at most `span` pairs active, a host never runs more than `span`
/// servers, so `base..base + span` is always enough.
#[derive(Clone)]
pub struct PortAllocator {
    base: u16,
    span: usize,
    in_use: Arc<Mutex<HashMap<String, BTreeSet<u16>>>>,
}

impl PortAllocator {
    pub fn new(base: u16, span: usize) -> Self {
        Self {
            base,
            span: span.max(1),
            in_use: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Lowest free port on `host`, held until the lease is dropped.
    pub fn acquire(&self, host: &str) -> Option<PortLease> {
        let mut in_use = self.in_use.lock();
        let taken = in_use.entry(host.to_string()).or_default();
        let port = (0..self.span)
            .filter_map(|offset| u16::try_from(usize::from(self.base) + offset).ok())
            .find(|port| !taken.contains(port))?;
        taken.insert(port);
        Some(PortLease {
            allocator: self.clone(),
            host: host.to_string(),
            port,
        })
    }

    fn release(&self, host: &str, port: u16) {
        let mut in_use = self.in_use.lock();
        if let Some(taken) = in_use.get_mut(host) {
            taken.remove(&port);
            if taken.is_empty() {
                in_use.remove(host);
            }
        }
    }

    /// Number of ports currently leased on `host`.
    pub fn leased(&self, host: &str) -> usize {
        self.in_use.lock().get(host).map_or(0, BTreeSet::len)
    }
}

/// A port reserved on one host.
pub struct PortLease {
    allocator: PortAllocator,
    host: String,
    port: u16,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.allocator.release(&self.host, self.port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ports_are_per_host_and_reused() {
        let ports = PortAllocator::new(5201, 2);
        let a1 = ports.acquire("a").unwrap();
        let a2 = ports.acquire("a").unwrap();
        let b1 = ports.acquire("b").unwrap();
        assert_eq!((a1.port(), a2.port(), b1.port()), (5201, 5202, 5201));
        assert!(ports.acquire("a").is_none());

        drop(a1);
        assert_eq!(ports.leased("a"), 1);
        assert_eq!(ports.acquire("a").unwrap().port(), 5201);
    }

    #[test]
    fn test_ports_stop_at_u16_max() {
        let ports = PortAllocator::new(65535, 4);
        let _first = ports.acquire("a").unwrap();
        assert!(ports.acquire("a").is_none());
    }

    #[test]
    fn test_peak_in_flight_tracking() {
        let ctx = RunContext::new("run", 3, 5201, ResultAggregator::new(None));
        let g1 = ctx.enter_active();
        let g2 = ctx.enter_active();
        assert_eq!(ctx.in_flight(), 2);
        drop(g1);
        let _g3 = ctx.enter_active();
        drop(g2);
        assert_eq!(ctx.in_flight(), 1);
        assert_eq!(ctx.peak_in_flight(), 2);
        assert_eq!(ctx.admission().available_permits(), 3);
    }

    #[test]
    fn test_cancellation_token_is_shared() {
        let token = CancellationToken::new();
        let ctx = RunContext::new("run", 1, 5201, ResultAggregator::new(None))
            .with_cancel_token(token.clone());
        assert!(!ctx.is_cancelled());
        token.cancel();
        assert!(ctx.is_cancelled());
        assert!(ctx.cancel_token().is_cancelled());
    }
}
