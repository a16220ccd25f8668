use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use cutover_types::{ExecError, Payload};

use crate::{ExecContext, ExecRequest, Executor};

type Respond = dyn Fn(&ExecRequest) -> Result<Payload, ExecError> + Send + Sync;

#[derive(Default)]
struct StubCounters {
    calls: AtomicU64,
    completed: AtomicU64,
    cancelled: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Tracks one in-flight call. A call dropped before `finish` counts as cancelled.
struct InFlight<'a> {
    counters: &'a StubCounters,
    finished: bool,
}

impl<'a> InFlight<'a> {
    fn enter(counters: &'a StubCounters) -> Self {
        let now = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight { counters, finished: false }
    }

    fn finish(mut self) {
        self.finished = true;
        self.counters.completed.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
        if !self.finished {
            self.counters.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }
}

// ---------------------------------------------------------------------------
// StubExecutor: in-memory adapter with scripted latency and outcome
// ---------------------------------------------------------------------------

/// Scripted adapter used by tests and by the node's traffic simulation.
///
/// Clones share counters, so a test can keep one handle and pass another to
/// the router.
#[derive(Clone)]
pub struct StubExecutor {
    respond: Arc<Respond>,
    latency: Duration,
    counters: Arc<StubCounters>,
}

impl StubExecutor {
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&ExecRequest) -> Result<Payload, ExecError> + Send + Sync + 'static,
    {
        StubExecutor {
            respond: Arc::new(f),
            latency: Duration::ZERO,
            counters: Arc::new(StubCounters::default()),
        }
    }

    /// Always answers with `payload`.
    pub fn responding(payload: Payload) -> Self {
        Self::from_fn(move |_| Ok(payload.clone()))
    }

    /// Answers `{"endpoint": <endpoint_id>, "body": <request body>}`.
    pub fn echo() -> Self {
        Self::from_fn(|req| Ok(json!({ "endpoint": req.endpoint_id, "body": req.body })))
    }

    pub fn failing(err: ExecError) -> Self {
        Self::from_fn(move |_| Err(err.clone()))
    }

    pub fn panicking(message: &'static str) -> Self {
        Self::from_fn(move |_| panic!("{message}"))
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> u64 {
        self.counters.calls.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> u64 {
        self.counters.completed.load(Ordering::SeqCst)
    }

    /// Calls whose future was dropped before an outcome was produced.
    pub fn cancelled(&self) -> u64 {
        self.counters.cancelled.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.counters.in_flight.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.counters.peak_in_flight.load(Ordering::SeqCst)
    }
}

impl Executor for StubExecutor {
    async fn execute(
        &self,
        ctx: &ExecContext,
        request: &ExecRequest,
    ) -> Result<Payload, ExecError> {
        self.counters.calls.fetch_add(1, Ordering::SeqCst);
        let guard = InFlight::enter(&self.counters);
        tracing::trace!(
            correlation_id = %ctx.correlation_id,
            implementation = %ctx.implementation,
            shadow = ctx.shadow,
            "stub executing"
        );
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let out = (self.respond)(request);
        guard.finish();
        out
    }
}
