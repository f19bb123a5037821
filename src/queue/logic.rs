//! Cola de ingreso acotada y particionada por shards.
//!
//! Cada shard es un canal `mpsc` acotado: el orden por clave de particionado sale
//! gratis y la memoria queda limitada por `shard_capacity`. El consumidor de un shard
//! es siempre un único worker; el lote que tiene en mano queda registrado como
//! "en vuelo" hasta que lo confirma, de modo que si el worker muere el supervisor
//! puede devolverlo a la cola.


use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tracing::{debug, warn};
use crate::message::domain::TelemetryMessage;
use crate::metrics::domain::{Counter, PipelineMetrics};
use super::domain::{group_by_entity, shard_for, QueueError, QueueSettings, QueuedMessage};


fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}


pub struct Shard {
    id: usize,
    tx: mpsc::Sender<QueuedMessage>,
    rx: tokio::sync::Mutex<mpsc::Receiver<QueuedMessage>>,
    redelivery: Mutex<VecDeque<QueuedMessage>>,
    in_flight: Mutex<Vec<QueuedMessage>>,
    available: AtomicBool,
    last_beat_ms: AtomicI64,
}


impl Shard {
    fn new(id: usize, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            id,
            tx,
            rx: tokio::sync::Mutex::new(rx),
            redelivery: Mutex::new(VecDeque::new()),
            in_flight: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
            last_beat_ms: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Mensajes esperando en el canal más los pendientes de reentrega.
    pub fn pending(&self) -> usize {
        let queued = self.tx.max_capacity() - self.tx.capacity();
        queued + lock(&self.redelivery).len()
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Registra que el worker del shard sigue vivo.
    pub fn beat(&self) {
        self.last_beat_ms.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_beat_ms(&self) -> i64 {
        self.last_beat_ms.load(Ordering::Relaxed)
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// Confirma el lote en vuelo: ya fue procesado o devuelto a la cola.
    pub fn ack(&self) {
        lock(&self.in_flight).clear();
    }

    /// Devuelve mensajes al frente de la cola de reentrega, en el orden dado.
    pub fn requeue(&self, messages: Vec<QueuedMessage>) {
        let mut redelivery = lock(&self.redelivery);
        for message in messages.into_iter().rev() {
            redelivery.push_front(message);
        }
    }

    /// Recupera el lote en vuelo de un worker caído. Devuelve cuántos mensajes volvieron.
    pub fn recover_in_flight(&self) -> usize {
        let batch = std::mem::take(&mut *lock(&self.in_flight));
        let recovered = batch.len();
        self.requeue(batch);
        recovered
    }
}


pub struct IngestionQueue {
    shards: Vec<Arc<Shard>>,
    settings: QueueSettings,
    closed: AtomicBool,
    metrics: Arc<PipelineMetrics>,
}


impl IngestionQueue {
    pub fn new(settings: QueueSettings, metrics: Arc<PipelineMetrics>) -> Self {
        let shards = (0..settings.shard_count)
            .map(|id| Arc::new(Shard::new(id, settings.shard_capacity)))
            .collect();

        Self {
            shards,
            settings,
            closed: AtomicBool::new(false),
            metrics,
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard(&self, id: usize) -> Arc<Shard> {
        self.shards[id].clone()
    }

    pub fn shard_of(&self, message: &TelemetryMessage) -> usize {
        shard_for(self.settings.shard_key.key_of(message), self.shards.len())
    }

    /// Acepta un mensaje en su shard.
    ///
    /// Con `timeout = None` rechaza de inmediato si el shard está lleno; con
    /// `Some(t)` espera como máximo `t` a que se libere lugar.
    pub async fn enqueue(&self,
                         mut message: TelemetryMessage,
                         timeout: Option<Duration>) -> Result<(), QueueError> {

        if self.is_closed() {
            return Err(QueueError::Closed);
        }

        let shard_id = self.shard_of(&message);
        let shard = &self.shards[shard_id];
        if !shard.is_available() {
            return Err(QueueError::ShardUnavailable { shard: shard_id });
        }

        message.ingested_at = Utc::now();
        let item = QueuedMessage::new(message);

        let result = match timeout {
            None => shard.tx.try_send(item).map_err(|e| match e {
                TrySendError::Full(_) => QueueError::Full { shard: shard_id },
                TrySendError::Closed(_) => QueueError::Closed,
            }),
            Some(wait) => shard.tx.send_timeout(item, wait).await.map_err(|e| match e {
                SendTimeoutError::Timeout(_) => QueueError::Full { shard: shard_id },
                SendTimeoutError::Closed(_) => QueueError::Closed,
            }),
        };

        match result {
            Ok(()) => {
                self.metrics.incr(Counter::MessagesEnqueued);
                Ok(())
            }
            Err(QueueError::Full { shard }) => {
                self.metrics.incr(Counter::QueueFullRejections);
                warn!("Warning: shard {} lleno, mensaje rechazado", shard);
                Err(QueueError::Full { shard })
            }
            Err(e) => Err(e),
        }
    }

    /// Extrae hasta `max_size` mensajes del shard, esperando como máximo `max_wait`
    /// por el primero. Los reentregados salen antes que los nuevos. El lote devuelto
    /// queda en vuelo hasta `Shard::ack`.
    pub async fn dequeue_batch(&self,
                               shard_id: usize,
                               max_size: usize,
                               max_wait: Duration) -> Vec<QueuedMessage> {

        let shard = &self.shards[shard_id];
        let max_size = max_size.max(1);
        let mut batch = Vec::with_capacity(max_size);

        // El candado del receptor se toma antes de sacar nada: si el futuro se
        // cancela en esa espera, ningún mensaje queda fuera de la cola.
        {
            let mut rx = shard.rx.lock().await;
            {
                let mut redelivery = lock(&shard.redelivery);
                while batch.len() < max_size {
                    match redelivery.pop_front() {
                        Some(item) => batch.push(item),
                        None => break,
                    }
                }
            }
            if batch.is_empty() {
                if let Ok(Some(item)) = tokio::time::timeout(max_wait, rx.recv()).await {
                    batch.push(item);
                }
            }
            while batch.len() < max_size {
                match rx.try_recv() {
                    Ok(item) => batch.push(item),
                    Err(_) => break,
                }
            }
        }

        let batch = self.drop_expired(shard_id, batch);
        let batch = group_by_entity(batch);
        *lock(&shard.in_flight) = batch.clone();
        batch
    }

    /// Descarta los mensajes vencidos que ya fueron superados por uno más nuevo del
    /// mismo dispositivo y entidad dentro del lote. Un mensaje viejo sin sucesor se
    /// procesa igual: es el último dato que se tiene de ese dispositivo.
    fn drop_expired(&self, shard_id: usize, batch: Vec<QueuedMessage>) -> Vec<QueuedMessage> {
        let Ok(ttl) = chrono::Duration::from_std(self.settings.message_ttl) else {
            return batch;
        };
        let now = Utc::now();

        let mut newest: HashMap<(&str, &str), u64> = HashMap::new();
        for item in &batch {
            let key = (item.message.entity_id.as_str(), item.message.device_id.as_str());
            let sequence = newest.entry(key).or_insert(item.message.sequence);
            *sequence = (*sequence).max(item.message.sequence);
        }

        let expired: Vec<bool> = batch.iter()
            .map(|item| {
                let key = (item.message.entity_id.as_str(), item.message.device_id.as_str());
                let superseded = newest.get(&key).is_some_and(|&last| last > item.message.sequence);
                superseded && now - item.message.ingested_at > ttl
            })
            .collect();

        batch.into_iter()
            .zip(expired)
            .filter_map(|(item, expired)| {
                if expired {
                    self.metrics.incr(Counter::MessagesExpired);
                    warn!("Warning: mensaje expirado en shard {} (device {}, sequence {})",
                          shard_id, item.message.device_id, item.message.sequence);
                    return None;
                }
                Some(item)
            })
            .collect()
    }

    /// Deja de aceptar mensajes nuevos. Lo ya encolado sigue disponible para drenar.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("Debug: cola de ingreso cerrada");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mensajes aún no confirmados en todos los shards (pendientes + en vuelo).
    pub fn outstanding(&self) -> usize {
        self.shards.iter().map(|s| s.pending() + s.in_flight()).sum()
    }
}
