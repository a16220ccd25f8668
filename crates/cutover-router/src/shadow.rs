use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;

use cutover_exec::{ExecContext, ExecRequest, Executor};
use cutover_telemetry::TelemetryEmitter;
use cutover_types::{
    Classification, ComparisonRecord, CorrelationId, EndpointId, Implementation, MigrationError,
    MigrationPhase, Payload, TelemetryEvent,
};

use crate::diff::diff_values;
use crate::fallback::call;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ShadowConfig {
    /// Shadow calls allowed in flight at once; the rest are skipped.
    pub max_concurrent_shadow: usize,
    pub timeout_ms: u64,
    /// Paths or leaf key names excluded from comparison.
    pub ignored_fields: Vec<String>,
    pub max_recorded_diffs: usize,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        ShadowConfig {
            max_concurrent_shadow: 8,
            timeout_ms: 2000,
            ignored_fields: Vec::new(),
            max_recorded_diffs: 50,
        }
    }
}

impl ShadowConfig {
    /// Rejects sizes the runtime cannot honor.
    pub fn validate(&self) -> Result<(), MigrationError> {
        if self.max_concurrent_shadow > Semaphore::MAX_PERMITS {
            return Err(MigrationError::InvalidConfiguration(format!(
                "max_concurrent_shadow must be at most {}, got {}",
                Semaphore::MAX_PERMITS,
                self.max_concurrent_shadow
            )));
        }
        if self.timeout_ms == 0 {
            return Err(MigrationError::InvalidConfiguration(
                "shadow timeout_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Default)]
struct Counters {
    launched: AtomicU64,
    skipped_overload: AtomicU64,
    matched: AtomicU64,
    diverged: AtomicU64,
    new_failed: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ShadowStats {
    pub launched: u64,
    pub skipped_overload: u64,
    pub matched: u64,
    pub diverged: u64,
    pub new_failed: u64,
    /// Shadow runs that panicked and became `ShadowExecutionFailure` events.
    pub failures: u64,
    pub in_flight: usize,
}

/// Everything a shadow run needs, captured after the caller's response exists.
#[derive(Debug, Clone)]
pub struct ShadowJob {
    pub correlation_id: CorrelationId,
    pub phase: MigrationPhase,
    pub request: ExecRequest,
    pub legacy_output: Payload,
}

#[derive(Debug)]
pub enum ShadowLaunch {
    Spawned(JoinHandle<()>),
    SkippedOverload,
}

/// Runs New off the request path and compares it against Legacy's output.
///
/// `launch` never waits: when every permit is taken the sample is dropped.
/// Spawned runs are detached from the caller, so a disconnecting caller does
/// not cancel them; they end at their own timeout. Nothing a shadow run does,
/// including panicking, reaches the caller.
pub struct ShadowValidator<N> {
    new: Arc<N>,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    timeout: Duration,
    ignored_fields: Arc<[String]>,
    max_recorded_diffs: usize,
    emitter: TelemetryEmitter,
    counters: Arc<Counters>,
}

impl<N: Executor> ShadowValidator<N> {
    pub fn new(
        new: Arc<N>,
        config: &ShadowConfig,
        emitter: TelemetryEmitter,
    ) -> Result<Self, MigrationError> {
        config.validate()?;
        Ok(ShadowValidator {
            new,
            permits: Arc::new(Semaphore::new(config.max_concurrent_shadow)),
            max_concurrent: config.max_concurrent_shadow,
            timeout: Duration::from_millis(config.timeout_ms),
            ignored_fields: config.ignored_fields.clone().into(),
            max_recorded_diffs: config.max_recorded_diffs,
            emitter,
            counters: Arc::new(Counters::default()),
        })
    }

    pub fn launch(&self, job: ShadowJob) -> ShadowLaunch {
        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.counters.skipped_overload.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    correlation_id = %job.correlation_id,
                    "shadow capacity saturated; sample skipped"
                );
                self.emitter.emit(TelemetryEvent::shadow_skipped(
                    &job.correlation_id,
                    &job.request.endpoint_id,
                    job.phase,
                ));
                return ShadowLaunch::SkippedOverload;
            }
        };
        self.counters.launched.fetch_add(1, Ordering::Relaxed);

        let report = FailureReport {
            correlation_id: job.correlation_id.clone(),
            endpoint_id: job.request.endpoint_id.clone(),
            phase: job.phase,
            emitter: self.emitter.clone(),
            counters: self.counters.clone(),
        };
        let run = ShadowRun {
            new: self.new.clone(),
            timeout: self.timeout,
            ignored_fields: self.ignored_fields.clone(),
            max_recorded_diffs: self.max_recorded_diffs,
            emitter: self.emitter.clone(),
            counters: self.counters.clone(),
        };
        ShadowLaunch::Spawned(tokio::spawn(async move {
            let _permit = permit;
            contain_panics(run.execute(job), report).await;
        }))
    }

    pub fn stats(&self) -> ShadowStats {
        let c = &self.counters;
        ShadowStats {
            launched: c.launched.load(Ordering::Relaxed),
            skipped_overload: c.skipped_overload.load(Ordering::Relaxed),
            matched: c.matched.load(Ordering::Relaxed),
            diverged: c.diverged.load(Ordering::Relaxed),
            new_failed: c.new_failed.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            in_flight: self
                .max_concurrent
                .saturating_sub(self.permits.available_permits()),
        }
    }
}

struct ShadowRun<N> {
    new: Arc<N>,
    timeout: Duration,
    ignored_fields: Arc<[String]>,
    max_recorded_diffs: usize,
    emitter: TelemetryEmitter,
    counters: Arc<Counters>,
}

impl<N: Executor> ShadowRun<N> {
    async fn execute(self, job: ShadowJob) {
        let ShadowJob { correlation_id, phase, request, legacy_output } = job;
        let endpoint_id = request.endpoint_id.clone();
        let timeout = self.timeout;
        let ctx = ExecContext::new(correlation_id.clone(), Implementation::New)
            .for_shadow()
            .with_timeout(timeout);

        let started = Instant::now();
        let outcome =
            tokio::time::timeout(timeout, call(self.new.as_ref(), &ctx, &request)).await;
        let new_latency = started.elapsed();

        let (new_output, new_error) = match outcome {
            Ok(result) => match result.outcome {
                Ok(payload) => (Some(payload), None),
                Err(source) => {
                    let err = MigrationError::ExecutionError {
                        implementation: Implementation::New,
                        source,
                    };
                    (None, Some(err.to_string()))
                }
            },
            Err(_elapsed) => {
                let err = MigrationError::ExecutionTimeout {
                    implementation: Implementation::New,
                    timeout,
                };
                (None, Some(err.to_string()))
            }
        };

        let (field_diffs, classification) = match &new_output {
            Some(output) => {
                let diff = diff_values(
                    &legacy_output,
                    output,
                    &self.ignored_fields,
                    self.max_recorded_diffs,
                );
                let class = if diff.is_match() {
                    Classification::Match
                } else {
                    Classification::Diverged
                };
                (diff.diffs, class)
            }
            None => (Vec::new(), Classification::NewFailed),
        };

        let counter = match classification {
            Classification::Match => &self.counters.matched,
            Classification::Diverged => &self.counters.diverged,
            Classification::NewFailed => &self.counters.new_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let record = ComparisonRecord {
            correlation_id,
            endpoint_id,
            legacy_output,
            new_output,
            new_error,
            field_diffs,
            classification,
            new_latency,
        };
        tracing::debug!(
            correlation_id = %record.correlation_id,
            classification = %record.classification,
            diffs = record.field_diffs.len(),
            new_latency_ms = record.new_latency.as_millis() as u64,
            "shadow comparison finished"
        );
        self.emitter.emit(TelemetryEvent::comparison(&record, phase));
    }
}

/// What a crashed shadow run is reported as.
struct FailureReport {
    correlation_id: CorrelationId,
    endpoint_id: EndpointId,
    phase: MigrationPhase,
    emitter: TelemetryEmitter,
    counters: Arc<Counters>,
}

/// Runs a whole shadow run in its own task, so a panic anywhere in it (adapter,
/// diff or classification) surfaces here as a `JoinError` and is reported
/// instead of unwinding further.
async fn contain_panics<F>(run: F, report: FailureReport)
where
    F: Future<Output = ()> + Send + 'static,
{
    let Err(join_err) = tokio::spawn(run).await else {
        return;
    };
    let err = MigrationError::ShadowExecutionFailure(panic_message(join_err));
    report.counters.failures.fetch_add(1, Ordering::Relaxed);
    tracing::warn!(
        correlation_id = %report.correlation_id,
        error = %err,
        "shadow run crashed"
    );
    report.emitter.emit(TelemetryEvent::shadow_failure(
        &report.correlation_id,
        &report.endpoint_id,
        report.phase,
        &err,
    ));
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return "shadow task cancelled".to_string();
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("new implementation panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("new implementation panicked: {s}")
    } else {
        "new implementation panicked".to_string()
    }
}
