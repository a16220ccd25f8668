use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::time::Instant;

use cutover_exec::{ExecRequest, Executor};
use cutover_telemetry::{TelemetryEmitter, TelemetryStats};
use cutover_types::{
    ExecError, Implementation, MigrationError, Payload, RoutingDecision, TelemetryEvent,
};

use crate::fallback::FallbackSupervisor;
use crate::phase::PhaseController;
use crate::route::decide;
use crate::shadow::{ShadowConfig, ShadowJob, ShadowStats, ShadowValidator};

/// Fresh correlation id for callers that arrive without one.
pub fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    served_legacy: AtomicU64,
    served_new: AtomicU64,
    fallbacks: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RouterStats {
    pub requests: u64,
    pub served_legacy: u64,
    pub served_new: u64,
    pub fallbacks: u64,
    /// Requests answered with an error.
    pub failures: u64,
}

/// Inbound entry point tying the controller, supervisor, shadow validator and
/// telemetry together.
pub struct MigrationRouter<L, N> {
    controller: Arc<PhaseController>,
    supervisor: FallbackSupervisor<L, N>,
    shadow: ShadowValidator<N>,
    emitter: TelemetryEmitter,
    counters: Counters,
}

impl<L: Executor, N: Executor> MigrationRouter<L, N> {
    pub fn new(
        controller: Arc<PhaseController>,
        legacy: Arc<L>,
        new: Arc<N>,
        shadow: &ShadowConfig,
        emitter: TelemetryEmitter,
    ) -> Result<Self, MigrationError> {
        Ok(MigrationRouter {
            controller,
            supervisor: FallbackSupervisor::new(legacy, new.clone()),
            shadow: ShadowValidator::new(new, shadow, emitter.clone())?,
            emitter,
            counters: Counters::default(),
        })
    }

    pub fn controller(&self) -> &Arc<PhaseController> {
        &self.controller
    }

    /// Routing decision the current snapshot would make, without executing.
    pub fn decide(&self, correlation_id: &str) -> RoutingDecision {
        decide(&self.controller.get_config(), correlation_id)
    }

    /// Serve one request.
    ///
    /// Exactly one implementation's payload is returned. When both New and the
    /// Legacy fallback fail, the caller sees Legacy's error unchanged.
    pub async fn handle(
        &self,
        correlation_id: &str,
        endpoint_id: &str,
        body: Value,
    ) -> Result<Payload, ExecError> {
        let started = Instant::now();
        self.counters.requests.fetch_add(1, Ordering::Relaxed);

        // One snapshot for the whole request; admin writes mid-flight do not apply.
        let config = self.controller.get_config();
        let decision = decide(&config, correlation_id);
        tracing::debug!(
            correlation_id,
            endpoint_id,
            phase = %decision.phase,
            implementation = %decision.implementation,
            shadow_sampled = decision.shadow_sampled,
            revision = config.revision,
            "request routed"
        );

        let request = ExecRequest::new(endpoint_id, body);
        match self.supervisor.run_with_fallback(&decision, &request, &config).await {
            Ok(outcome) => {
                let served = match outcome.implementation_used {
                    Implementation::Legacy => &self.counters.served_legacy,
                    Implementation::New => &self.counters.served_new,
                };
                served.fetch_add(1, Ordering::Relaxed);

                let served_by_legacy = outcome.implementation_used == Implementation::Legacy;
                if decision.shadow_sampled && served_by_legacy {
                    self.shadow.launch(ShadowJob {
                        correlation_id: decision.correlation_id.clone(),
                        phase: decision.phase,
                        request,
                        legacy_output: outcome.payload.clone(),
                    });
                }

                let mut event = TelemetryEvent::request(
                    &decision,
                    endpoint_id,
                    outcome.implementation_used,
                    started.elapsed(),
                );
                if let Some(primary) = &outcome.primary_failure {
                    self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
                    event = event.with_fallback(primary.to_string());
                }
                self.emitter.emit(event);
                Ok(outcome.payload)
            }
            Err(err) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                let event = match &err {
                    MigrationError::BothImplementationsFailed { primary, .. } => {
                        self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
                        TelemetryEvent::request(
                            &decision,
                            endpoint_id,
                            Implementation::Legacy,
                            started.elapsed(),
                        )
                        .with_fallback(primary.to_string())
                    }
                    _ => TelemetryEvent::request(
                        &decision,
                        endpoint_id,
                        decision.implementation,
                        started.elapsed(),
                    ),
                };
                tracing::debug!(correlation_id, error = %err, "request failed");
                self.emitter.emit(event.with_error(err.to_string()));
                Err(err.into_caller_error())
            }
        }
    }

    pub fn stats(&self) -> RouterStats {
        let c = &self.counters;
        RouterStats {
            requests: c.requests.load(Ordering::Relaxed),
            served_legacy: c.served_legacy.load(Ordering::Relaxed),
            served_new: c.served_new.load(Ordering::Relaxed),
            fallbacks: c.fallbacks.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
        }
    }

    pub fn shadow_stats(&self) -> ShadowStats {
        self.shadow.stats()
    }

    pub fn telemetry_stats(&self) -> TelemetryStats {
        self.emitter.stats()
    }
}
