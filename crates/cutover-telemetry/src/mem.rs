use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, RwLock};
use tokio::time::Instant;

use cutover_types::{EventKind, TelemetryEvent};

use crate::traits::TelemetrySink;
use crate::TelemetryError;

/// In-memory `TelemetrySink` that keeps every delivered event.
///
/// Intended for tests; clones share the same buffer.
#[derive(Clone, Default)]
pub struct MemSink {
    events: Arc<RwLock<Vec<TelemetryEvent>>>,
    written: Arc<Notify>,
    unavailable: Arc<AtomicBool>,
}

impl MemSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every batch is rejected with `TelemetryError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn events(&self) -> Vec<TelemetryEvent> {
        self.events.read().await.clone()
    }

    pub async fn of_kind(&self, kind: EventKind) -> Vec<TelemetryEvent> {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }

    /// Wait until at least `count` events of `kind` arrived or `timeout` elapses,
    /// then return whatever events of that kind are present.
    pub async fn wait_for(
        &self,
        kind: EventKind,
        count: usize,
        timeout: Duration,
    ) -> Vec<TelemetryEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            // Registered before the check so a write in between is not missed.
            let written = self.written.notified();
            let current = self.of_kind(kind).await;
            if current.len() >= count {
                return current;
            }
            if tokio::time::timeout_at(deadline, written).await.is_err() {
                return self.of_kind(kind).await;
            }
        }
    }
}

impl TelemetrySink for MemSink {
    async fn write_batch(&self, events: Vec<TelemetryEvent>) -> Result<(), TelemetryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(TelemetryError::Unavailable("mem sink marked unavailable".into()));
        }
        self.events.write().await.extend(events);
        self.written.notify_waiters();
        Ok(())
    }
}
