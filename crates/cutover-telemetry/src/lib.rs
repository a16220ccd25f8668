pub mod emitter;
pub mod mem;
pub mod tracing_sink;
pub mod traits;

pub use emitter::{TelemetryConfig, TelemetryEmitter, TelemetryStats, MAX_BATCH_SIZE};
pub use mem::MemSink;
pub use tracing_sink::TracingSink;
pub use traits::TelemetrySink;

#[derive(thiserror::Error, Debug)]
pub enum TelemetryError {
    #[error("telemetry sink unavailable: {0}")]
    Unavailable(String),
    #[error("invalid telemetry configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to encode telemetry event: {0}")]
    Encode(#[from] serde_json::Error),
}
