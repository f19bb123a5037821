//! Evaluación de alertas y despacho hacia el sink.
//!
//! # Arquitectura de Actores
//! 1. Los workers de proyección entregan cada `CommittedPatch` al evaluador.
//! 2. El evaluador compara los campos cambiados contra las reglas vigentes y emite
//!    transiciones (`Raise`, `Refresh`, `Resolve`) con deduplicación por alerta activa.
//! 3. El despachador publica cada transición en el `AlertSink`, con reintentos acotados.
//!
//! Las reglas viajan por un canal `watch`: una recarga reemplaza el conjunto entero
//! y el evaluador resuelve las alertas cuyas reglas desaparecieron.


use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use crate::config::alert::{PUBLISH_ATTEMPTS, PUBLISH_BACKOFF};
use crate::message::domain::Fields;
use crate::metrics::domain::{Counter, PipelineMetrics};
use crate::projection::domain::CommittedPatch;
use crate::twin::domain::TwinEntity;
use super::domain::{alert_id, AlertEvent, AlertSink, AlertState, AlertTransition, RepeatPolicy,
                    RuleSet, Severity, SinkError};


fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}


/// Punto único de reemplazo del conjunto de reglas.
#[derive(Clone)]
pub struct RuleHandle {
    tx: Arc<watch::Sender<Arc<RuleSet>>>,
}


impl RuleHandle {
    pub fn new(rules: RuleSet) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(rules));
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> Arc<RuleSet> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<RuleSet>> {
        self.tx.subscribe()
    }

    /// Publica un conjunto nuevo. Los suscriptores lo ven de forma atómica.
    pub fn reload(&self, rules: RuleSet) {
        info!("Info: reglas de alerta recargadas ({} reglas)", rules.len());
        self.tx.send_replace(Arc::new(rules));
    }
}


#[derive(Debug, Clone)]
struct ActiveAlert {
    event: AlertEvent,
    last_emitted: DateTime<Utc>,
}


/// Estado de deduplicación del evaluador.
///
/// Es una función pura del estado, el parche y `now`: no hace I/O ni lee el reloj.
pub struct AlertEvaluator {
    rules: Arc<RuleSet>,
    refresh_interval: chrono::Duration,
    active: HashMap<(String, String), ActiveAlert>,
    field_versions: HashMap<(String, String), u64>,
    metrics: Arc<PipelineMetrics>,
}


impl AlertEvaluator {
    pub fn new(rules: Arc<RuleSet>, refresh_interval: Duration, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            rules,
            refresh_interval: chrono::Duration::from_std(refresh_interval)
                .unwrap_or(chrono::Duration::MAX),
            active: HashMap::new(),
            field_versions: HashMap::new(),
            metrics,
        }
    }

    /// Evalúa un parche confirmado.
    ///
    /// Los parches de una entidad pueden llegar desordenados cuando la escriben
    /// varios workers. Cada campo se evalúa solo si la versión del parche es más
    /// nueva que la última que lo tocó: un parche atrasado aporta los campos que
    /// nadie pisó después y descarta el resto.
    pub fn evaluate_patch(&mut self, patch: &CommittedPatch, now: DateTime<Utc>) -> Vec<AlertTransition> {
        let mut fresh = Fields::new();
        for (field, value) in &patch.changed_fields {
            let seen = self.field_versions
                .entry((patch.entity_id.clone(), field.clone()))
                .or_insert(0);
            if patch.version > *seen {
                *seen = patch.version;
                fresh.insert(field.clone(), value.clone());
            }
        }

        if fresh.len() < patch.changed_fields.len() {
            debug!("Debug: versión {} de {} llegó tarde, {} campos ya evaluados",
                   patch.version, patch.entity_id, patch.changed_fields.len() - fresh.len());
        }
        if fresh.is_empty() {
            return Vec::new();
        }

        self.evaluate(&patch.entity_id, &fresh, &patch.snapshot, now)
    }

    pub fn evaluate(&mut self,
                    entity_id: &str,
                    changed_fields: &Fields,
                    snapshot: &TwinEntity,
                    now: DateTime<Utc>) -> Vec<AlertTransition> {

        let rules = self.rules.clone();
        let mut transitions = Vec::new();

        for (field, value) in changed_fields {
            let Some(value) = value.as_f64() else {
                continue;
            };

            for rule in rules.rules_for(snapshot.entity_kind, field) {
                let key = (entity_id.to_string(), rule.rule_id.clone());

                if !rule.breached(value) {
                    if let Some(active) = self.active.remove(&key) {
                        let mut event = active.event;
                        event.state = AlertState::Resolved;
                        event.value = value;
                        event.message = rule.describe(entity_id, value);
                        self.metrics.incr(Counter::AlertsResolved);
                        transitions.push(AlertTransition::Resolve(event));
                    }
                    continue;
                }

                match self.active.get_mut(&key) {
                    None => {
                        let event = AlertEvent {
                            alert_id: alert_id(entity_id, &rule.rule_id, snapshot.version),
                            entity_id: entity_id.to_string(),
                            rule_id: rule.rule_id.clone(),
                            severity: rule.severity,
                            message: rule.describe(entity_id, value),
                            raised_at: now,
                            value,
                            state: AlertState::Open,
                        };
                        self.active.insert(key, ActiveAlert { event: event.clone(), last_emitted: now });
                        self.metrics.incr(Counter::AlertsRaised);
                        transitions.push(AlertTransition::Raise(event));
                    }
                    Some(active) => {
                        active.event.value = value;
                        active.event.message = rule.describe(entity_id, value);

                        match rule.repeat {
                            RepeatPolicy::Refresh if now - active.last_emitted >= self.refresh_interval => {
                                active.last_emitted = now;
                                active.event.raised_at = now;
                                self.metrics.incr(Counter::AlertsRefreshed);
                                transitions.push(AlertTransition::Refresh(active.event.clone()));
                            }
                            RepeatPolicy::Refresh => {}
                            RepeatPolicy::Suppress => {
                                active.event.state = AlertState::Suppressed;
                                self.metrics.incr(Counter::AlertsSuppressed);
                            }
                        }
                    }
                }
            }
        }

        transitions
    }

    /// Adopta un conjunto de reglas nuevo y resuelve las alertas huérfanas.
    pub fn reconcile(&mut self, rules: Arc<RuleSet>) -> Vec<AlertTransition> {
        self.rules = rules;

        let orphaned: Vec<(String, String)> = self.active.keys()
            .filter(|(_, rule_id)| !self.rules.contains(rule_id))
            .cloned()
            .collect();

        let mut transitions = Vec::with_capacity(orphaned.len());
        for key in orphaned {
            if let Some(active) = self.active.remove(&key) {
                let mut event = active.event;
                event.state = AlertState::Resolved;
                event.message = format!("{}: rule {} removed", event.entity_id, event.rule_id);
                self.metrics.incr(Counter::AlertsResolved);
                transitions.push(AlertTransition::Resolve(event));
            }
        }
        transitions
    }

    /// Alertas activas (abiertas o suprimidas), ordenadas por entidad y regla.
    pub fn open_alerts(&self) -> Vec<AlertEvent> {
        let mut open: Vec<AlertEvent> = self.active.values().map(|a| a.event.clone()).collect();
        open.sort_by(|a, b| (&a.entity_id, &a.rule_id).cmp(&(&b.entity_id, &b.rule_id)));
        open
    }
}


/// Tarea del evaluador. Termina cuando se cierran todos los emisores de parches.
#[instrument(name = "alert_evaluator", skip_all)]
pub async fn run_alert_evaluator(mut rx_patches: mpsc::Receiver<CommittedPatch>,
                                 tx_alerts: mpsc::Sender<AlertTransition>,
                                 evaluator: Arc<Mutex<AlertEvaluator>>,
                                 mut rx_rules: watch::Receiver<Arc<RuleSet>>) {

    info!("Info: evaluador de alertas iniciado");
    let mut rules_open = true;

    loop {
        let transitions = tokio::select! {
            patch = rx_patches.recv() => {
                match patch {
                    Some(patch) => lock(&evaluator).evaluate_patch(&patch, Utc::now()),
                    None => break,
                }
            }
            changed = rx_rules.changed(), if rules_open => {
                match changed {
                    Ok(()) => {
                        let rules = rx_rules.borrow_and_update().clone();
                        lock(&evaluator).reconcile(rules)
                    }
                    Err(_) => {
                        rules_open = false;
                        Vec::new()
                    }
                }
            }
        };

        for transition in transitions {
            if tx_alerts.send(transition).await.is_err() {
                error!("Error: despachador de alertas cerrado");
            }
        }
    }

    info!("Info: evaluador de alertas finalizado");
}


/// Publica cada transición en el sink. Termina cuando el evaluador se cierra.
#[instrument(name = "alert_dispatcher", skip_all)]
pub async fn run_alert_dispatcher(mut rx_alerts: mpsc::Receiver<AlertTransition>,
                                  sink: Arc<dyn AlertSink>,
                                  metrics: Arc<PipelineMetrics>) {

    info!("Info: despachador de alertas iniciado");
    while let Some(transition) = rx_alerts.recv().await {
        publish_with_retry(&transition, sink.as_ref(), &metrics).await;
    }
    info!("Info: despachador de alertas finalizado");
}


async fn publish_with_retry(transition: &AlertTransition, sink: &dyn AlertSink, metrics: &PipelineMetrics) {
    let event = transition.event();

    for attempt in 1..=PUBLISH_ATTEMPTS {
        match sink.publish(event).await {
            Ok(()) => {
                debug!("Debug: alerta {} publicada ({})", event.alert_id, transition.label());
                return;
            }
            Err(SinkError::Rejected(reason)) => {
                metrics.incr(Counter::AlertsDropped);
                error!("Error: sink rechazó la alerta {}: {}", event.alert_id, reason);
                return;
            }
            Err(SinkError::Unavailable(reason)) if attempt < PUBLISH_ATTEMPTS => {
                warn!("Warning: sink no disponible (intento {}): {}", attempt, reason);
                sleep(PUBLISH_BACKOFF * attempt).await;
            }
            Err(SinkError::Unavailable(reason)) => {
                warn!("Warning: sink no disponible (intento {}): {}", attempt, reason);
            }
        }
    }

    metrics.incr(Counter::AlertsDropped);
    error!("Error: alerta {} ({}) descartada tras {} intentos",
           event.alert_id, transition.label(), PUBLISH_ATTEMPTS);
}


/// Sink que solo deja las alertas en el log.
#[derive(Debug, Default, Clone)]
pub struct LogAlertSink;


#[async_trait]
impl AlertSink for LogAlertSink {
    async fn publish(&self, alert: &AlertEvent) -> Result<(), SinkError> {
        let payload = serde_json::to_string(alert)
            .map_err(|e| SinkError::Rejected(e.to_string()))?;

        match (alert.state, alert.severity) {
            (AlertState::Resolved, _) => info!("Info: alerta resuelta {}", payload),
            (_, Severity::Critical) => error!("Error: alerta {}", payload),
            (_, Severity::Warning) => warn!("Warning: alerta {}", payload),
            (_, Severity::Info) => info!("Info: alerta {}", payload),
        }
        Ok(())
    }
}


/// Relee el archivo de reglas cada `every` y publica el conjunto si cambió.
/// Un archivo inválido deja vigentes las reglas anteriores.
#[instrument(name = "rule_reloader", skip(handle, cancel))]
pub async fn run_rule_reloader(path: PathBuf,
                               handle: RuleHandle,
                               every: Duration,
                               cancel: CancellationToken) {

    let mut ticker = interval(every);
    let mut last_contents: Option<String> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) => {
                warn!("Warning: no se pudo leer {}: {}", path.display(), e);
                continue;
            }
        };
        if last_contents.as_deref() == Some(contents.as_str()) {
            continue;
        }

        match RuleSet::from_json(&contents) {
            Ok(rules) => handle.reload(rules),
            Err(e) => error!("Error: reglas inválidas en {}, se mantienen las actuales: {}", path.display(), e),
        }
        last_contents = Some(contents);
    }

    info!("Info: recarga de reglas finalizada");
}


pub fn start_alert_evaluator(rx_from_workers: mpsc::Receiver<CommittedPatch>,
                             tx_to_dispatcher: mpsc::Sender<AlertTransition>,
                             evaluator: Arc<Mutex<AlertEvaluator>>,
                             rules: watch::Receiver<Arc<RuleSet>>) -> JoinHandle<()> {

    tokio::spawn(async move {
        run_alert_evaluator(rx_from_workers,
                            tx_to_dispatcher,
                            evaluator,
                            rules
        ).await;
    })
}


pub fn start_alert_dispatcher(rx_from_evaluator: mpsc::Receiver<AlertTransition>,
                              sink: Arc<dyn AlertSink>,
                              metrics: Arc<PipelineMetrics>) -> JoinHandle<()> {

    tokio::spawn(async move {
        run_alert_dispatcher(rx_from_evaluator,
                             sink,
                             metrics
        ).await;
    })
}


pub fn start_rule_reloader(path: PathBuf,
                           handle: RuleHandle,
                           every: Duration,
                           cancel: CancellationToken) -> JoinHandle<()> {

    info!("Info: iniciando recarga de reglas desde {}", path.display());
    tokio::spawn(async move {
        run_rule_reloader(path, handle, every, cancel).await;
    })
}
