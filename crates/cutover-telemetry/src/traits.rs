use std::future::Future;

use cutover_types::TelemetryEvent;

use crate::TelemetryError;

/// Destination for batched telemetry records (log pipeline, metrics collector).
///
/// Called only from the emitter's drain task, never from a request path, so a
/// slow sink delays nothing but the drain. A failed batch is counted and
/// discarded by the emitter; implementations should not retry internally.
pub trait TelemetrySink: Send + Sync + 'static {
    fn write_batch(&self, events: Vec<TelemetryEvent>)
        -> impl Future<Output = Result<(), TelemetryError>> + Send;
}
