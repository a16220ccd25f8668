use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use cutover_types::TelemetryEvent;

use crate::traits::TelemetrySink;
use crate::TelemetryError;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Events buffered between request paths and the drain task.
    pub queue_capacity: usize,
    pub batch_size: usize,
    /// Upper bound on how long a partial batch waits before flushing.
    pub flush_interval_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        TelemetryConfig {
            queue_capacity: 4096,
            batch_size: 64,
            flush_interval_ms: 250,
        }
    }
}

/// Largest batch the drain will buffer; batches are pre-allocated at this size.
pub const MAX_BATCH_SIZE: usize = 65_536;

impl TelemetryConfig {
    pub fn validate(&self) -> Result<(), TelemetryError> {
        if self.queue_capacity == 0 || self.queue_capacity > Semaphore::MAX_PERMITS {
            return Err(TelemetryError::InvalidConfig(format!(
                "queue_capacity must be within 1..={}, got {}",
                Semaphore::MAX_PERMITS,
                self.queue_capacity
            )));
        }
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(TelemetryError::InvalidConfig(format!(
                "batch_size must be within 1..={MAX_BATCH_SIZE}, got {}",
                self.batch_size
            )));
        }
        if self.flush_interval_ms == 0 {
            return Err(TelemetryError::InvalidConfig(
                "flush_interval_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Default)]
struct Counters {
    emitted: AtomicU64,
    dropped: AtomicU64,
    written: AtomicU64,
    sink_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct TelemetryStats {
    /// Events accepted into the queue.
    pub emitted: u64,
    /// Events rejected because the queue was full or closed.
    pub dropped: u64,
    /// Events the sink acknowledged.
    pub written: u64,
    /// Batches the sink rejected. Their events are discarded.
    pub sink_failures: u64,
}

/// Cheap, cloneable handle used by the request and shadow paths.
///
/// `emit` never awaits: a full queue drops the event and bumps `dropped`.
/// The drain task exits after every handle has been dropped and the queue
/// has been flushed, yielding the final counters.
#[derive(Clone)]
pub struct TelemetryEmitter {
    tx: mpsc::Sender<TelemetryEvent>,
    counters: Arc<Counters>,
}

impl TelemetryEmitter {
    pub fn spawn<S: TelemetrySink>(
        sink: Arc<S>,
        config: &TelemetryConfig,
    ) -> Result<(Self, JoinHandle<TelemetryStats>), TelemetryError> {
        config.validate()?;
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let counters = Arc::new(Counters::default());
        let task = tokio::spawn(drain(
            sink,
            rx,
            config.batch_size,
            Duration::from_millis(config.flush_interval_ms),
            counters.clone(),
        ));
        Ok((TelemetryEmitter { tx, counters }, task))
    }

    pub fn emit(&self, event: TelemetryEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {
                self.counters.emitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(event)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    correlation_id = %event.correlation_id,
                    kind = ?event.kind,
                    "telemetry queue full; event dropped"
                );
            }
            Err(TrySendError::Closed(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn stats(&self) -> TelemetryStats {
        self.counters.snapshot()
    }
}

impl Counters {
    fn snapshot(&self) -> TelemetryStats {
        TelemetryStats {
            emitted: self.emitted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            sink_failures: self.sink_failures.load(Ordering::Relaxed),
        }
    }
}

async fn drain<S: TelemetrySink>(
    sink: Arc<S>,
    rx: mpsc::Receiver<TelemetryEvent>,
    batch_size: usize,
    flush_interval: Duration,
    counters: Arc<Counters>,
) -> TelemetryStats {
    let batches = ReceiverStream::new(rx).chunks_timeout(batch_size, flush_interval);
    tokio::pin!(batches);

    while let Some(batch) = batches.next().await {
        let n = batch.len() as u64;
        match sink.write_batch(batch).await {
            Ok(()) => {
                counters.written.fetch_add(n, Ordering::Relaxed);
            }
            Err(e) => {
                counters.sink_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    error = %e,
                    events = n,
                    "telemetry sink write failed; batch discarded"
                );
            }
        }
    }
    tracing::debug!("telemetry drain finished");
    counters.snapshot()
}

#[cfg(test)]
mod tests {
    use cutover_types::{EventKind, MigrationPhase};

    use super::*;
    use crate::MemSink;

    fn cfg(queue_capacity: usize) -> TelemetryConfig {
        TelemetryConfig {
            queue_capacity,
            batch_size: 8,
            flush_interval_ms: 10,
        }
    }

    fn event(i: usize) -> TelemetryEvent {
        TelemetryEvent::shadow_skipped(
            &format!("req-{i}"),
            "tickets.list",
            MigrationPhase::Validation,
        )
    }

    #[tokio::test]
    async fn delivers_batches_to_sink() {
        let sink = Arc::new(MemSink::new());
        let (emitter, _task) = TelemetryEmitter::spawn(sink.clone(), &cfg(64)).unwrap();
        for i in 0..20 {
            emitter.emit(event(i));
        }
        let got = sink.wait_for(EventKind::ShadowSkipped, 20, Duration::from_secs(2)).await;
        assert_eq!(got.len(), 20);
        assert_eq!(got[0].correlation_id, "req-0");
        assert_eq!(got[19].correlation_id, "req-19");

        let stats = emitter.stats();
        assert_eq!(stats.emitted, 20);
        assert_eq!(stats.dropped, 0);
    }

    #[tokio::test]
    async fn full_queue_drops_without_blocking() {
        let sink = Arc::new(MemSink::new());
        let (emitter, _task) = TelemetryEmitter::spawn(sink.clone(), &cfg(2)).unwrap();
        // The drain task cannot run before this loop yields, so only two fit.
        for i in 0..10 {
            emitter.emit(event(i));
        }
        let stats = emitter.stats();
        assert_eq!(stats.emitted, 2);
        assert_eq!(stats.dropped, 8);

        let got = sink.wait_for(EventKind::ShadowSkipped, 2, Duration::from_secs(2)).await;
        assert_eq!(got.len(), 2);
    }

    #[tokio::test]
    async fn sink_failure_is_counted_not_retried() {
        let sink = Arc::new(MemSink::new());
        sink.set_unavailable(true);
        let (emitter, _task) = TelemetryEmitter::spawn(sink.clone(), &cfg(64)).unwrap();
        emitter.emit(event(0));
        emitter.emit(event(1));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while emitter.stats().sink_failures == 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let stats = emitter.stats();
        assert_eq!(stats.sink_failures, 1);
        assert_eq!(stats.written, 0);

        sink.set_unavailable(false);
        emitter.emit(event(2));
        let got = sink.wait_for(EventKind::ShadowSkipped, 1, Duration::from_secs(2)).await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].correlation_id, "req-2");
    }

    #[tokio::test]
    async fn rejects_sizes_the_runtime_cannot_honor() {
        let sink = Arc::new(MemSink::new());
        let bad = [
            TelemetryConfig { queue_capacity: 0, ..cfg(64) },
            TelemetryConfig { queue_capacity: usize::MAX, ..cfg(64) },
            TelemetryConfig { batch_size: 0, ..cfg(64) },
            TelemetryConfig { batch_size: MAX_BATCH_SIZE + 1, ..cfg(64) },
            TelemetryConfig { flush_interval_ms: 0, ..cfg(64) },
        ];
        for config in bad {
            let err = TelemetryEmitter::spawn(sink.clone(), &config).err();
            assert!(
                matches!(err, Some(TelemetryError::InvalidConfig(_))),
                "{config:?} was accepted"
            );
        }
        assert!(TelemetryConfig::default().validate().is_ok());
    }

    #[tokio::test]
    async fn drain_exits_after_last_handle_dropped() {
        let sink = Arc::new(MemSink::new());
        let (emitter, task) = TelemetryEmitter::spawn(sink.clone(), &cfg(64)).unwrap();
        emitter.emit(event(0));
        drop(emitter);
        let final_stats = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("drain task should finish")
            .unwrap();
        assert_eq!(sink.len().await, 1);
        assert_eq!(final_stats.emitted, 1);
        assert_eq!(final_stats.written, 1);
    }
}
