use cutover_types::TelemetryEvent;

use crate::traits::TelemetrySink;
use crate::TelemetryError;

/// Writes each event as one JSON line through `tracing` under the
/// `cutover::telemetry` target, leaving transport to the subscriber.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    async fn write_batch(&self, events: Vec<TelemetryEvent>) -> Result<(), TelemetryError> {
        for event in &events {
            let line = serde_json::to_string(event)?;
            tracing::info!(
                target: "cutover::telemetry",
                kind = ?event.kind,
                correlation_id = %event.correlation_id,
                "{line}"
            );
        }
        Ok(())
    }
}
