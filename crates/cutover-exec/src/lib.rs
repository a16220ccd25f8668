mod stub;

use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use cutover_types::{CorrelationId, EndpointId, ExecError, Implementation, Payload};

pub use stub::StubExecutor;

// ---------------------------------------------------------------------------
// Executor trait
// Both the legacy and the new implementation sit behind this one contract.
// RPITIT with an explicit `+ Send` bound so the router can hold either side
// generically and `.await` it from spawned tasks.
//
// Cancellation is future drop: the router abandons a call by dropping the
// returned future (timeout or caller abort). Implementations must not retry
// internally; the router owns the single fallback retry.
// ---------------------------------------------------------------------------

pub trait Executor: Send + Sync + 'static {
    fn execute(
        &self,
        ctx: &ExecContext,
        request: &ExecRequest,
    ) -> impl std::future::Future<Output = Result<Payload, ExecError>> + Send;
}

/// Inbound request handed unchanged to whichever implementation is chosen.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ExecRequest {
    pub endpoint_id: EndpointId,
    pub body: Value,
}

impl ExecRequest {
    pub fn new(endpoint_id: impl Into<EndpointId>, body: Value) -> Self {
        ExecRequest { endpoint_id: endpoint_id.into(), body }
    }
}

/// Per-call context passed to an adapter.
#[derive(Debug, Clone)]
pub struct ExecContext {
    pub correlation_id: CorrelationId,
    pub implementation: Implementation,
    /// `true` for detached shadow runs whose output never reaches a caller.
    pub shadow: bool,
    /// Point after which the router will have abandoned the call.
    pub deadline: Option<Instant>,
}

impl ExecContext {
    pub fn new(correlation_id: impl Into<CorrelationId>, implementation: Implementation) -> Self {
        ExecContext {
            correlation_id: correlation_id.into(),
            implementation,
            shadow: false,
            deadline: None,
        }
    }

    pub fn for_shadow(mut self) -> Self {
        self.shadow = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Time left before the deadline; `None` when the call is unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn context_deadline() {
        let ctx = ExecContext::new("req-1", Implementation::New);
        assert!(ctx.remaining().is_none());
        assert!(!ctx.shadow);

        let ctx = ctx.with_timeout(Duration::from_secs(5)).for_shadow();
        let left = ctx.remaining().unwrap();
        assert!(left <= Duration::from_secs(5));
        assert!(left > Duration::from_secs(4));
        assert!(ctx.shadow);
    }
}
