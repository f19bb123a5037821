//! Supervisión de los workers de shard.
//!
//! # Arquitectura de Actores
//! Funciona en coordinación con una tarea de temporización (Watchdog/Timer):
//! 1. Esta tarea solicita un temporizador (`Event::InitTimer`).
//! 2. La tarea de temporización espera y responde con `Event::Timeout`.
//! 3. Esta tarea reacciona al timeout revisando los workers y reiniciando el ciclo.
//!
//! En cada revisión se relanzan los workers que murieron por pánico (su lote en
//! vuelo vuelve al frente del shard), se advierte de los shards sin latido reciente
//! y, cada `metrics_interval`, se publica el snapshot de métricas.


use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, error, info, instrument, warn};
use crate::config::supervisor::{DRAIN_POLL, JOIN_TIMEOUT, STALL_BEATS};
use crate::metrics::domain::{Counter, PipelineMetrics};
use crate::projection::logic::WorkerFactory;
use super::domain::{Event, SupervisorSettings};


pub struct ShardSupervisor {
    factory: WorkerFactory,
    workers: Vec<Option<JoinHandle<()>>>,
    metrics: Arc<PipelineMetrics>,
    settings: SupervisorSettings,
    last_report: Instant,
}


impl ShardSupervisor {
    /// Lanza un worker por shard.
    pub fn start_workers(factory: WorkerFactory,
                         metrics: Arc<PipelineMetrics>,
                         settings: SupervisorSettings) -> Self {

        let workers = (0..factory.queue.shard_count())
            .map(|shard_id| Some(factory.spawn(shard_id)))
            .collect();

        info!("Info: {} workers de shard iniciados", factory.queue.shard_count());
        Self {
            factory,
            workers,
            metrics,
            settings,
            last_report: Instant::now(),
        }
    }

    /// Workers que todavía no terminaron.
    pub fn running(&self) -> usize {
        self.workers.iter().flatten().filter(|h| !h.is_finished()).count()
    }

    /// Revisa cada worker: relanza los caídos y advierte de los detenidos.
    pub async fn check(&mut self) {
        let now_ms = Utc::now().timestamp_millis();
        let stall_ms = STALL_BEATS * self.settings.check_interval.as_millis() as i64;

        for shard_id in 0..self.workers.len() {
            let finished = match &self.workers[shard_id] {
                Some(handle) => handle.is_finished(),
                None => continue,
            };

            if !finished {
                let silence = now_ms - self.factory.queue.shard(shard_id).last_beat_ms();
                if silence > stall_ms {
                    warn!("Warning: shard {} sin latido hace {} ms", shard_id, silence);
                }
                continue;
            }

            let Some(handle) = self.workers[shard_id].take() else {
                continue;
            };
            match handle.await {
                Ok(()) => debug!("Debug: worker del shard {} terminó", shard_id),
                Err(e) if e.is_panic() => self.replace(shard_id),
                Err(e) => warn!("Warning: worker del shard {} cancelado: {}", shard_id, e),
            }
        }

        if self.last_report.elapsed() >= self.settings.metrics_interval {
            self.report_metrics();
        }
    }

    fn replace(&mut self, shard_id: usize) {
        let shard = self.factory.queue.shard(shard_id);
        shard.set_available(false);
        let recovered = shard.recover_in_flight();

        if self.factory.cancel.is_cancelled() {
            warn!("Warning: worker del shard {} cayó durante el cierre, {} mensajes quedan sin procesar",
                  shard_id, recovered);
            return;
        }

        self.metrics.incr(Counter::WorkerRestarts);
        error!("Error: worker del shard {} cayó, {} mensajes en vuelo vuelven a la cola", shard_id, recovered);
        self.workers[shard_id] = Some(self.factory.spawn(shard_id));
        shard.set_available(true);
    }

    fn report_metrics(&mut self) {
        self.last_report = Instant::now();
        match serde_json::to_string(&self.metrics.snapshot()) {
            Ok(snapshot) => info!("Info: métricas {}", snapshot),
            Err(e) => error!("Error: no se pudo serializar el snapshot de métricas: {}", e),
        }
    }

    /// Espera a que los workers drenen sus shards. Al vencer `grace` los cancela y,
    /// si alguno no responde, lo aborta.
    pub async fn drain(mut self, grace: Duration) {
        let deadline = Instant::now() + grace;

        loop {
            self.check().await;
            if self.running() == 0 {
                break;
            }
            tokio::select! {
                _ = sleep_until(deadline) => {
                    warn!("Warning: período de gracia agotado, cancelando {} workers", self.running());
                    self.factory.cancel.cancel();
                    break;
                }
                _ = sleep(DRAIN_POLL) => {}
            }
        }
        self.factory.cancel.cancel();

        for (shard_id, slot) in self.workers.iter_mut().enumerate() {
            let Some(mut handle) = slot.take() else {
                continue;
            };
            if timeout(JOIN_TIMEOUT, &mut handle).await.is_err() {
                error!("Error: worker del shard {} no respondió a la cancelación, abortando", shard_id);
                handle.abort();
                let _ = handle.await;
            }
        }

        for shard_id in 0..self.factory.queue.shard_count() {
            self.factory.queue.shard(shard_id).recover_in_flight();
        }
        self.report_metrics();
    }
}


/// Ejecuta el bucle de supervisión hasta recibir la orden de cierre, que trae el
/// período de gracia para drenar.
#[instrument(name = "shard_supervisor", skip_all)]
pub async fn run_supervisor(tx_event: mpsc::Sender<Event>,
                            mut rx_from_watchdog: mpsc::Receiver<Event>,
                            mut supervisor: ShardSupervisor,
                            mut rx_stop: oneshot::Receiver<Duration>) {

    info!("Info: supervisor de shards creado");
    let check_interval = supervisor.settings.check_interval;

    if tx_event.send(Event::InitTimer(check_interval)).await.is_err() {
        error!("Error: no se pudo enviar el evento al watchdog");
    }

    let grace = loop {
        tokio::select! {
            grace = &mut rx_stop => break grace.unwrap_or(Duration::ZERO),
            event = rx_from_watchdog.recv() => {
                match event {
                    Some(Event::Timeout) => {
                        supervisor.check().await;
                        if tx_event.send(Event::InitTimer(check_interval)).await.is_err() {
                            error!("Error: no se pudo enviar el evento al watchdog");
                        }
                    }
                    Some(_) => {}
                    None => {
                        error!("Error: watchdog finalizado, supervisión detenida hasta el cierre");
                        break (&mut rx_stop).await.unwrap_or(Duration::ZERO);
                    }
                }
            }
        }
    };

    info!("Info: drenando shards con {:?} de gracia", grace);
    supervisor.drain(grace).await;
    info!("Info: supervisor de shards finalizado");
}


pub fn start_supervisor(to_watchdog: mpsc::Sender<Event>,
                        from_watchdog: mpsc::Receiver<Event>,
                        supervisor: ShardSupervisor,
                        stop: oneshot::Receiver<Duration>) -> JoinHandle<()> {

    info!("Info: iniciando supervisor de shards");
    tokio::spawn(async move {
        run_supervisor(
            to_watchdog,
            from_watchdog,
            supervisor,
            stop,
        ).await;
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;
    use crate::heartbeat::domain::start_watchdog;
    use crate::message::domain::{EntityKind, FieldValue, Fields, TelemetryMessage};
    use crate::projection::logic::{ProjectionEngine, WorkerSettings};
    use crate::queue::domain::{QueueSettings, ShardKey};
    use crate::queue::logic::IngestionQueue;
    use crate::twin::domain::{PatchResult, StoreError, TwinEntity, TwinPatch, TwinStore};
    use crate::twin::logic::InMemoryTwinStore;

    /// Entra en pánico la primera vez que ve la secuencia `poison`.
    struct PanickingStore {
        inner: InMemoryTwinStore,
        poison: u64,
        fired: AtomicBool,
    }

    #[async_trait]
    impl TwinStore for PanickingStore {
        async fn get_or_create(&self, entity_id: &str, kind: EntityKind) -> Result<TwinEntity, StoreError> {
            self.inner.get_or_create(entity_id, kind).await
        }

        async fn apply_patch(&self, patch: &TwinPatch) -> Result<PatchResult, StoreError> {
            if patch.sequence == self.poison && !self.fired.swap(true, Ordering::SeqCst) {
                panic!("simulated worker crash");
            }
            self.inner.apply_patch(patch).await
        }

        async fn snapshot(&self, entity_id: &str) -> Option<TwinEntity> {
            self.inner.snapshot(entity_id).await
        }

        async fn entity_ids(&self) -> Vec<String> {
            self.inner.entity_ids().await
        }

        async fn quarantine(&self, entity_id: &str, reason: &str) {
            self.inner.quarantine(entity_id, reason).await
        }
    }

    fn reading(sequence: u64) -> TelemetryMessage {
        let mut fields = Fields::new();
        fields.insert("temperature".into(), FieldValue::Number(60.0 + sequence as f64));
        TelemetryMessage::new("d1", "machineA", EntityKind::Machine, sequence, fields)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_crashed_worker_is_replaced_and_batch_redelivered() {
        let metrics = Arc::new(PipelineMetrics::new());
        let queue = Arc::new(IngestionQueue::new(QueueSettings {
            shard_count: 1,
            shard_capacity: 16,
            shard_key: ShardKey::Device,
            message_ttl: Duration::from_secs(300),
        }, metrics.clone()));

        let store = Arc::new(PanickingStore {
            inner: InMemoryTwinStore::new(),
            poison: 2,
            fired: AtomicBool::new(false),
        });
        let (tx_patches, _rx_patches) = mpsc::channel(64);
        let (tx_dead_letter, _rx_dead_letter) = mpsc::channel(4);
        let factory = WorkerFactory {
            queue: queue.clone(),
            engine: Arc::new(ProjectionEngine::new(store.clone(), tx_patches, metrics.clone())),
            tx_dead_letter,
            settings: WorkerSettings {
                batch_size: 8,
                batch_wait: Duration::from_millis(10),
                max_delivery_attempts: 5,
            },
            cancel: CancellationToken::new(),
        };

        for sequence in 1..=3 {
            queue.enqueue(reading(sequence), None).await.unwrap();
        }

        let settings = SupervisorSettings {
            check_interval: Duration::from_millis(20),
            metrics_interval: Duration::from_secs(60),
        };
        let supervisor = ShardSupervisor::start_workers(factory, metrics.clone(), settings);

        let (tx_cmd, rx_cmd) = mpsc::channel(4);
        let (tx_timeout, rx_timeout) = mpsc::channel(4);
        start_watchdog(tx_timeout, rx_cmd);
        let (tx_stop, rx_stop) = oneshot::channel();
        let handle = start_supervisor(tx_cmd, rx_timeout, supervisor, rx_stop);

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if store.snapshot("machineA").await.is_some_and(|t| t.last_sequence_for("d1") == Some(3)) {
                    break;
                }
                sleep(Duration::from_millis(10)).await;
            }
        }).await.unwrap();

        queue.close();
        tx_stop.send(Duration::from_secs(1)).unwrap();
        handle.await.unwrap();

        let twin = store.snapshot("machineA").await.unwrap();
        assert_eq!(twin.version, 3);
        assert_eq!(metrics.get(Counter::WorkerRestarts), 1);
        assert!(queue.shard(0).is_available());
        assert_eq!(queue.outstanding(), 0);
    }
}
