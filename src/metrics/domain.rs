//! Contadores del pipeline.
//!
//! Todo descarte de datos incrementa un contador además de dejar un log. El snapshot
//! es serializable para que cualquier stack de monitoreo externo lo consuma.


use std::sync::atomic::{AtomicU64, Ordering};
use serde::Serialize;


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    MessagesEnqueued,
    MessagesApplied,
    MessagesSkippedStale,
    MessagesSkippedUnchanged,
    MessagesRequeued,
    MessagesExpired,
    MessagesDeadLettered,
    MessagesQuarantined,
    MessagesDroppedOnShutdown,
    QueueFullRejections,
    StoreErrors,
    WorkerRestarts,
    PatchesNotEvaluated,
    AlertsRaised,
    AlertsRefreshed,
    AlertsResolved,
    AlertsSuppressed,
    AlertsDropped,
}


const COUNTERS: usize = 18;


#[derive(Debug, Default)]
pub struct PipelineMetrics {
    values: [AtomicU64; COUNTERS],
}


impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, amount: u64) {
        self.values[counter as usize].fetch_add(amount, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.values[counter as usize].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        use Counter::*;
        MetricsSnapshot {
            messages_enqueued: self.get(MessagesEnqueued),
            messages_applied: self.get(MessagesApplied),
            messages_skipped_stale: self.get(MessagesSkippedStale),
            messages_skipped_unchanged: self.get(MessagesSkippedUnchanged),
            messages_requeued: self.get(MessagesRequeued),
            messages_expired: self.get(MessagesExpired),
            messages_dead_lettered: self.get(MessagesDeadLettered),
            messages_quarantined: self.get(MessagesQuarantined),
            messages_dropped_on_shutdown: self.get(MessagesDroppedOnShutdown),
            queue_full_rejections: self.get(QueueFullRejections),
            store_errors: self.get(StoreErrors),
            worker_restarts: self.get(WorkerRestarts),
            patches_not_evaluated: self.get(PatchesNotEvaluated),
            alerts_raised: self.get(AlertsRaised),
            alerts_refreshed: self.get(AlertsRefreshed),
            alerts_resolved: self.get(AlertsResolved),
            alerts_suppressed: self.get(AlertsSuppressed),
            alerts_dropped: self.get(AlertsDropped),
        }
    }
}


#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub messages_enqueued: u64,
    pub messages_applied: u64,
    pub messages_skipped_stale: u64,
    pub messages_skipped_unchanged: u64,
    pub messages_requeued: u64,
    pub messages_expired: u64,
    pub messages_dead_lettered: u64,
    pub messages_quarantined: u64,
    pub messages_dropped_on_shutdown: u64,
    pub queue_full_rejections: u64,
    pub store_errors: u64,
    pub worker_restarts: u64,
    pub patches_not_evaluated: u64,
    pub alerts_raised: u64,
    pub alerts_refreshed: u64,
    pub alerts_resolved: u64,
    pub alerts_suppressed: u64,
    pub alerts_dropped: u64,
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_independent() {
        let metrics = PipelineMetrics::new();
        metrics.incr(Counter::MessagesEnqueued);
        metrics.incr(Counter::MessagesEnqueued);
        metrics.add(Counter::AlertsDropped, 3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_enqueued, 2);
        assert_eq!(snapshot.alerts_dropped, 3);
        assert_eq!(snapshot.messages_applied, 0);
    }
}
