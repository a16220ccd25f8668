use std::sync::Arc;

use tokio::time::Instant;

use cutover_exec::{ExecContext, ExecRequest, Executor};
use cutover_types::{
    ExecutionResult, Implementation, MigrationError, Payload, RoutingConfig, RoutingDecision,
};

/// What the caller-facing path produced.
#[derive(Debug, Clone)]
pub struct SupervisedOutcome {
    pub payload: Payload,
    pub implementation_used: Implementation,
    pub fallback_triggered: bool,
    /// The New failure that caused the fallback, kept for telemetry.
    pub primary_failure: Option<MigrationError>,
}

/// Runs the routed implementation and, for New, reverts to Legacy once on
/// failure or timeout.
///
/// Per request: primary attempt, then at most one fallback attempt, then a
/// terminal outcome. Never loops.
pub struct FallbackSupervisor<L, N> {
    legacy: Arc<L>,
    new: Arc<N>,
}

impl<L: Executor, N: Executor> FallbackSupervisor<L, N> {
    pub fn new(legacy: Arc<L>, new: Arc<N>) -> Self {
        FallbackSupervisor { legacy, new }
    }

    pub async fn run_with_fallback(
        &self,
        decision: &RoutingDecision,
        request: &ExecRequest,
        config: &RoutingConfig,
    ) -> Result<SupervisedOutcome, MigrationError> {
        let correlation_id = decision.correlation_id.as_str();

        if decision.implementation == Implementation::Legacy {
            let ctx = ExecContext::new(correlation_id, Implementation::Legacy);
            let payload = call(self.legacy.as_ref(), &ctx, request).await.into_payload()?;
            return Ok(SupervisedOutcome {
                payload,
                implementation_used: Implementation::Legacy,
                fallback_triggered: false,
                primary_failure: None,
            });
        }

        if !config.fallback_enabled {
            let ctx = ExecContext::new(correlation_id, Implementation::New);
            let payload = call(self.new.as_ref(), &ctx, request).await.into_payload()?;
            return Ok(SupervisedOutcome {
                payload,
                implementation_used: Implementation::New,
                fallback_triggered: false,
                primary_failure: None,
            });
        }

        let timeout = config.fallback_timeout;
        let ctx = ExecContext::new(correlation_id, Implementation::New).with_timeout(timeout);
        // Elapsing drops the adapter future, which is how the New call is abandoned.
        let attempt = tokio::time::timeout(timeout, call(self.new.as_ref(), &ctx, request)).await;
        let primary = match attempt {
            Ok(result) => match result.into_payload() {
                Ok(payload) => {
                    return Ok(SupervisedOutcome {
                        payload,
                        implementation_used: Implementation::New,
                        fallback_triggered: false,
                        primary_failure: None,
                    })
                }
                Err(e) => e,
            },
            Err(_) => MigrationError::ExecutionTimeout {
                implementation: Implementation::New,
                timeout,
            },
        };

        tracing::warn!(
            correlation_id,
            error = %primary,
            "new implementation failed; falling back to legacy"
        );

        let ctx = ExecContext::new(correlation_id, Implementation::Legacy);
        match call(self.legacy.as_ref(), &ctx, request).await.outcome {
            Ok(payload) => Ok(SupervisedOutcome {
                payload,
                implementation_used: Implementation::Legacy,
                fallback_triggered: true,
                primary_failure: Some(primary),
            }),
            Err(fallback) => {
                tracing::error!(
                    correlation_id,
                    new_error = %primary,
                    legacy_error = %fallback,
                    "fallback to legacy failed"
                );
                Err(MigrationError::BothImplementationsFailed {
                    primary: Box::new(primary),
                    fallback,
                })
            }
        }
    }
}

/// One timed adapter call.
pub(crate) async fn call<E: Executor>(
    executor: &E,
    ctx: &ExecContext,
    request: &ExecRequest,
) -> ExecutionResult {
    let started = Instant::now();
    let outcome = executor.execute(ctx, request).await;
    let result = ExecutionResult {
        implementation: ctx.implementation,
        outcome,
        latency: started.elapsed(),
    };
    tracing::debug!(
        correlation_id = %ctx.correlation_id,
        implementation = %result.implementation,
        shadow = ctx.shadow,
        latency_ms = result.latency.as_millis() as u64,
        ok = result.outcome.is_ok(),
        "adapter call finished"
    );
    result
}

trait IntoPayload {
    fn into_payload(self) -> Result<Payload, MigrationError>;
}

impl IntoPayload for ExecutionResult {
    fn into_payload(self) -> Result<Payload, MigrationError> {
        let implementation = self.implementation;
        self.outcome
            .map_err(|source| MigrationError::ExecutionError { implementation, source })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use cutover_exec::StubExecutor;
    use cutover_types::{ExecError, MigrationPhase};

    use super::*;

    fn decision(implementation: Implementation) -> RoutingDecision {
        RoutingDecision {
            correlation_id: "req-1".into(),
            phase: MigrationPhase::NewArchitecture,
            implementation,
            shadow_sampled: false,
            bucket: 0,
        }
    }

    fn request() -> ExecRequest {
        ExecRequest::new("tickets.get", json!({ "id": 1 }))
    }

    fn config(timeout_ms: u64) -> RoutingConfig {
        RoutingConfig {
            phase: MigrationPhase::NewArchitecture,
            fallback_timeout: Duration::from_millis(timeout_ms),
            ..RoutingConfig::default()
        }
    }

    fn supervisor(
        legacy: &StubExecutor,
        new: &StubExecutor,
    ) -> FallbackSupervisor<StubExecutor, StubExecutor> {
        FallbackSupervisor::new(Arc::new(legacy.clone()), Arc::new(new.clone()))
    }

    #[tokio::test]
    async fn legacy_decision_skips_new() {
        let legacy = StubExecutor::responding(json!("legacy"));
        let new = StubExecutor::responding(json!("new"));
        let out = supervisor(&legacy, &new)
            .run_with_fallback(&decision(Implementation::Legacy), &request(), &config(100))
            .await
            .unwrap();
        assert_eq!(out.payload, json!("legacy"));
        assert!(!out.fallback_triggered);
        assert_eq!(new.calls(), 0);
    }

    #[tokio::test]
    async fn legacy_decision_failure_is_not_retried() {
        let legacy = StubExecutor::failing(ExecError::NotFound("ticket 1".into()));
        let new = StubExecutor::responding(json!("new"));
        let err = supervisor(&legacy, &new)
            .run_with_fallback(&decision(Implementation::Legacy), &request(), &config(100))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MigrationError::ExecutionError { implementation: Implementation::Legacy, .. }
        ));
        assert_eq!(legacy.calls(), 1);
        assert_eq!(new.calls(), 0);
    }

    #[tokio::test]
    async fn new_success_within_timeout() {
        let legacy = StubExecutor::responding(json!("legacy"));
        let new = StubExecutor::responding(json!("new")).with_latency(Duration::from_millis(5));
        let out = supervisor(&legacy, &new)
            .run_with_fallback(&decision(Implementation::New), &request(), &config(500))
            .await
            .unwrap();
        assert_eq!(out.payload, json!("new"));
        assert_eq!(out.implementation_used, Implementation::New);
        assert!(!out.fallback_triggered);
        assert!(out.primary_failure.is_none());
        assert_eq!(legacy.calls(), 0);
    }

    #[tokio::test]
    async fn slow_new_falls_back_after_timeout() {
        let legacy = StubExecutor::responding(json!("legacy"));
        let new = StubExecutor::responding(json!("new")).with_latency(Duration::from_millis(500));
        let started = Instant::now();
        let out = supervisor(&legacy, &new)
            .run_with_fallback(&decision(Implementation::New), &request(), &config(100))
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert_eq!(out.payload, json!("legacy"));
        assert_eq!(out.implementation_used, Implementation::Legacy);
        assert!(out.fallback_triggered);
        assert!(matches!(out.primary_failure, Some(MigrationError::ExecutionTimeout { .. })));
        assert!(elapsed < Duration::from_millis(400), "took {elapsed:?}");
        assert_eq!(new.cancelled(), 1);
        assert_eq!(legacy.calls(), 1);
    }

    #[tokio::test]
    async fn new_error_falls_back_once() {
        let legacy = StubExecutor::responding(json!("legacy"));
        let new = StubExecutor::failing(ExecError::Internal("boom".into()));
        let out = supervisor(&legacy, &new)
            .run_with_fallback(&decision(Implementation::New), &request(), &config(100))
            .await
            .unwrap();
        assert_eq!(out.payload, json!("legacy"));
        assert!(out.fallback_triggered);
        assert_eq!(new.calls(), 1);
        assert_eq!(legacy.calls(), 1);
    }

    #[tokio::test]
    async fn both_failing_is_terminal() {
        let legacy = StubExecutor::failing(ExecError::Unavailable("db".into()));
        let new = StubExecutor::failing(ExecError::Internal("boom".into()));
        let err = supervisor(&legacy, &new)
            .run_with_fallback(&decision(Implementation::New), &request(), &config(100))
            .await
            .unwrap_err();
        match err {
            MigrationError::BothImplementationsFailed { primary, fallback } => {
                assert!(matches!(*primary, MigrationError::ExecutionError { .. }));
                assert_eq!(fallback, ExecError::Unavailable("db".into()));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(new.calls(), 1);
        assert_eq!(legacy.calls(), 1);
    }

    #[tokio::test]
    async fn disabled_fallback_surfaces_new_error() {
        let legacy = StubExecutor::responding(json!("legacy"));
        let new = StubExecutor::failing(ExecError::InvalidRequest("bad".into()));
        let mut cfg = config(100);
        cfg.fallback_enabled = false;
        let err = supervisor(&legacy, &new)
            .run_with_fallback(&decision(Implementation::New), &request(), &cfg)
            .await
            .unwrap_err();
        assert_eq!(err.into_caller_error(), ExecError::InvalidRequest("bad".into()));
        assert_eq!(legacy.calls(), 0);
    }

    #[tokio::test]
    async fn dropping_the_request_cancels_the_adapter_call() {
        let legacy = StubExecutor::responding(json!("legacy"));
        let new = StubExecutor::responding(json!("new")).with_latency(Duration::from_secs(10));
        let sup = supervisor(&legacy, &new);
        let dec = decision(Implementation::New);
        let req = request();
        let cfg = config(5_000);

        let aborted = tokio::time::timeout(
            Duration::from_millis(30),
            sup.run_with_fallback(&dec, &req, &cfg),
        )
        .await;
        assert!(aborted.is_err());
        assert_eq!(new.cancelled(), 1);
        assert_eq!(new.in_flight(), 0);
        assert_eq!(legacy.calls(), 0);
    }
}
