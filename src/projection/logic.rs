//! Proyección de telemetría sobre los gemelos y workers por shard.
//!
//! El worker de un shard saca lotes de la cola y los procesa de a un mensaje, en
//! orden. Cada parche confirmado en el store se entrega al evaluador de alertas con
//! un tiempo máximo de espera: la proyección nunca se frena por las alertas.


use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use crate::config::projection::{ALERT_HANDOFF_TIMEOUT, REQUEUE_PAUSE, STORE_BACKOFF};
use crate::dead_letter::domain::DeadLetter;
use crate::message::domain::TelemetryMessage;
use crate::metrics::domain::{Counter, PipelineMetrics};
use crate::queue::domain::QueuedMessage;
use crate::queue::logic::{IngestionQueue, Shard};
use crate::twin::domain::{PatchResult, StoreError, TwinPatch, TwinStore};
use super::domain::{CommittedPatch, PatchOutcome, ProjectionError};


pub struct ProjectionEngine {
    store: Arc<dyn TwinStore>,
    tx_patches: mpsc::Sender<CommittedPatch>,
    metrics: Arc<PipelineMetrics>,
    backoff: Vec<Duration>,
}


impl ProjectionEngine {
    pub fn new(store: Arc<dyn TwinStore>,
               tx_patches: mpsc::Sender<CommittedPatch>,
               metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            store,
            tx_patches,
            metrics,
            backoff: STORE_BACKOFF.to_vec(),
        }
    }

    /// Reemplaza las esperas entre reintentos. Un reintento por elemento.
    pub fn with_backoff(mut self, backoff: Vec<Duration>) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// Aplica un mensaje sobre su gemelo.
    ///
    /// Los mensajes viejos o repetidos son un resultado (`SkippedStale`), no un error.
    /// Solo un `Applied` genera un `CommittedPatch` para el evaluador.
    #[instrument(name = "process_message",
                 skip_all,
                 fields(entity = %msg.entity_id, device = %msg.device_id, sequence = msg.sequence))]
    pub async fn process_message(&self, msg: &TelemetryMessage) -> Result<PatchOutcome, ProjectionError> {
        let patch = TwinPatch::from(msg);

        match self.apply_with_retry(&patch).await? {
            PatchResult::Stale { last_sequence } => {
                self.metrics.incr(Counter::MessagesSkippedStale);
                debug!("Debug: secuencia {} descartada, última aplicada {}", msg.sequence, last_sequence);
                Ok(PatchOutcome::SkippedStale)
            }
            PatchResult::Unchanged { .. } => {
                self.metrics.incr(Counter::MessagesSkippedUnchanged);
                Ok(PatchOutcome::SkippedUnchanged)
            }
            PatchResult::Applied { version, changed_fields, snapshot } => {
                self.metrics.incr(Counter::MessagesApplied);
                self.hand_off(CommittedPatch {
                    entity_id: msg.entity_id.clone(),
                    entity_kind: msg.entity_kind,
                    device_id: msg.device_id.clone(),
                    sequence: msg.sequence,
                    version,
                    changed_fields: changed_fields.clone(),
                    snapshot,
                    committed_at: Utc::now(),
                }).await;
                Ok(PatchOutcome::Applied { version, changed_fields })
            }
        }
    }

    async fn apply_with_retry(&self, patch: &TwinPatch) -> Result<PatchResult, ProjectionError> {
        let mut retries = 0usize;

        loop {
            match self.store.apply_patch(patch).await {
                Ok(result) => return Ok(result),
                Err(StoreError::Unavailable(reason)) => {
                    self.metrics.incr(Counter::StoreErrors);
                    let Some(delay) = self.backoff.get(retries).copied() else {
                        return Err(ProjectionError::StoreUnavailable {
                            entity_id: patch.entity_id.clone(),
                            attempts: (retries + 1) as u32,
                            reason,
                        });
                    };
                    warn!("Warning: store no disponible ({}), reintento en {:?}", reason, delay);
                    retries += 1;
                    sleep(delay).await;
                }
                Err(StoreError::Corrupt { entity_id, reason }) => {
                    self.metrics.incr(Counter::StoreErrors);
                    error!("Error: entidad {} corrupta, queda en cuarentena: {}", entity_id, reason);
                    self.store.quarantine(&entity_id, &reason).await;
                    return Err(ProjectionError::Quarantined { entity_id });
                }
                Err(StoreError::Quarantined(entity_id)) => {
                    return Err(ProjectionError::Quarantined { entity_id });
                }
                Err(StoreError::Backend(reason)) => {
                    self.metrics.incr(Counter::StoreErrors);
                    return Err(ProjectionError::Backend {
                        entity_id: patch.entity_id.clone(),
                        reason,
                    });
                }
            }
        }
    }

    async fn hand_off(&self, patch: CommittedPatch) {
        match self.tx_patches.send_timeout(patch, ALERT_HANDOFF_TIMEOUT).await {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(patch)) => {
                self.metrics.incr(Counter::PatchesNotEvaluated);
                warn!("Warning: evaluador saturado, versión {} de {} sin evaluar",
                      patch.version, patch.entity_id);
            }
            Err(SendTimeoutError::Closed(patch)) => {
                self.metrics.incr(Counter::PatchesNotEvaluated);
                debug!("Debug: evaluador cerrado, versión {} de {} sin evaluar",
                       patch.version, patch.entity_id);
            }
        }
    }
}


#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub batch_size: usize,
    pub batch_wait: Duration,
    pub max_delivery_attempts: u32,
}


/// Todo lo que necesita un worker de shard. El supervisor lo usa para relanzar
/// workers caídos con las mismas dependencias.
#[derive(Clone)]
pub struct WorkerFactory {
    pub queue: Arc<IngestionQueue>,
    pub engine: Arc<ProjectionEngine>,
    pub tx_dead_letter: mpsc::Sender<DeadLetter>,
    pub settings: WorkerSettings,
    pub cancel: CancellationToken,
}


impl WorkerFactory {
    pub fn spawn(&self, shard_id: usize) -> JoinHandle<()> {
        let factory = self.clone();
        tokio::spawn(async move {
            shard_worker(shard_id,
                         factory.queue,
                         factory.engine,
                         factory.tx_dead_letter,
                         factory.settings,
                         factory.cancel
            ).await;
        })
    }
}


/// Si el worker muere por pánico, el shard deja de aceptar mensajes hasta que el
/// supervisor lo reemplace.
struct PanicGuard(Arc<Shard>);


impl Drop for PanicGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.set_available(false);
        }
    }
}


/// Bucle del worker de un shard.
///
/// Termina cuando la cola está cerrada y el shard vacío, o cuando se cancela. La
/// cancelación solo se atiende entre lotes o mientras se espera el próximo.
#[instrument(name = "shard_worker", skip(queue, engine, tx_dead_letter, settings, cancel))]
pub async fn shard_worker(shard_id: usize,
                          queue: Arc<IngestionQueue>,
                          engine: Arc<ProjectionEngine>,
                          tx_dead_letter: mpsc::Sender<DeadLetter>,
                          settings: WorkerSettings,
                          cancel: CancellationToken) {

    let shard = queue.shard(shard_id);
    let _guard = PanicGuard(shard.clone());
    info!("Info: worker del shard {} iniciado", shard_id);

    loop {
        shard.beat();
        if queue.is_closed() && shard.pending() == 0 {
            break;
        }

        let batch = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            batch = queue.dequeue_batch(shard_id, settings.batch_size, settings.batch_wait) => batch,
        };
        if batch.is_empty() {
            continue;
        }

        let requeued = process_batch(batch, &shard, &engine, &tx_dead_letter, &settings).await;
        shard.ack();

        if requeued {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(REQUEUE_PAUSE) => {}
            }
        }
    }

    info!("Info: worker del shard {} finalizado", shard_id);
}


/// Procesa el lote en orden. Devuelve `true` si una falla transitoria obligó a
/// devolver el resto del lote a la cola.
async fn process_batch(batch: Vec<QueuedMessage>,
                       shard: &Shard,
                       engine: &ProjectionEngine,
                       tx_dead_letter: &mpsc::Sender<DeadLetter>,
                       settings: &WorkerSettings) -> bool {

    let metrics = engine.metrics();
    let mut items = batch.into_iter();

    while let Some(mut item) = items.next() {
        item.attempts += 1;

        match engine.process_message(&item.message).await {
            Ok(_) => {}
            Err(ProjectionError::StoreUnavailable { .. }) if item.attempts < settings.max_delivery_attempts => {
                let mut rest = vec![item];
                rest.extend(items);
                metrics.add(Counter::MessagesRequeued, rest.len() as u64);
                warn!("Warning: store no disponible, {} mensajes vuelven al shard {}", rest.len(), shard.id());
                shard.requeue(rest);
                return true;
            }
            Err(ProjectionError::Quarantined { entity_id }) => {
                metrics.incr(Counter::MessagesQuarantined);
                warn!("Warning: entidad {} en cuarentena, secuencia {} de {} descartada",
                      entity_id, item.message.sequence, item.message.device_id);
            }
            Err(e) => {
                metrics.incr(Counter::MessagesDeadLettered);
                let attempts = item.attempts;
                if tx_dead_letter.send(DeadLetter::new(item.message, e.to_string(), attempts)).await.is_err() {
                    error!("Error: canal de dead-letter cerrado, mensaje perdido: {}", e);
                }
            }
        }
    }

    false
}
