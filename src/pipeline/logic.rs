//! Fachada pública del pipeline.
//!
//! `Pipeline::start` arma los canales, lanza las tareas (workers, supervisor,
//! evaluador, despachador, dead-letter y, si corresponde, simulador y recarga de
//! reglas) y devuelve el handle con el que se ingresa telemetría y se consultan
//! los gemelos. `shutdown` las detiene en orden y devuelve un `ShutdownReport`.


use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use crate::alert::domain::{AlertEvent, RuleSet};
use crate::alert::logic::{start_alert_dispatcher, start_alert_evaluator, start_rule_reloader, AlertEvaluator};
use crate::channels::domain::Channels;
use crate::context::domain::AppContext;
use crate::dead_letter::logic::start_dead_letter;
use crate::heartbeat::domain::{start_watchdog, SupervisorSettings};
use crate::heartbeat::logic::{start_supervisor, ShardSupervisor};
use crate::message::domain::TelemetryMessage;
use crate::metrics::domain::{Counter, MetricsSnapshot};
use crate::projection::logic::{ProjectionEngine, WorkerFactory, WorkerSettings};
use crate::queue::domain::{QueueError, QueueSettings};
use crate::queue::logic::IngestionQueue;
use crate::simulator::logic::start_simulator;
use crate::twin::domain::TwinEntity;
use super::domain::ShutdownReport;


fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}


struct Tasks {
    stop_supervisor: oneshot::Sender<Duration>,
    supervisor: JoinHandle<()>,
    watchdog: JoinHandle<()>,
    evaluator: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
    dead_letter: JoinHandle<()>,
    auxiliary: Vec<JoinHandle<()>>,
    auxiliary_cancel: CancellationToken,
}


pub struct Pipeline {
    ctx: AppContext,
    queue: Arc<IngestionQueue>,
    evaluator: Arc<Mutex<AlertEvaluator>>,
    tasks: Tasks,
}


impl Pipeline {
    /// Lanza todas las tareas del pipeline. Debe llamarse dentro de un runtime de tokio.
    pub fn start(ctx: AppContext) -> Self {
        let system = ctx.system.clone();
        let channels = Channels::new();

        let queue = Arc::new(IngestionQueue::new(QueueSettings {
            shard_count: system.shard_count,
            shard_capacity: system.shard_capacity,
            shard_key: system.shard_key,
            message_ttl: system.message_ttl,
        }, ctx.metrics.clone()));

        let rx_rules = ctx.rules.subscribe();
        let rules = rx_rules.borrow().clone();
        let evaluator = Arc::new(Mutex::new(
            AlertEvaluator::new(rules, system.alert_refresh, ctx.metrics.clone())
        ));

        let evaluator_task = start_alert_evaluator(channels.evaluator_from_workers,
                                                   channels.evaluator_to_dispatcher,
                                                   evaluator.clone(),
                                                   rx_rules);

        let dispatcher = start_alert_dispatcher(channels.dispatcher_from_evaluator,
                                                ctx.sink.clone(),
                                                ctx.metrics.clone());

        let dead_letter = start_dead_letter(channels.dead_letter_from_workers,
                                            system.dead_letter_path.clone());

        let engine = ProjectionEngine::new(ctx.store.clone(),
                                           channels.workers_to_evaluator,
                                           ctx.metrics.clone());

        let factory = WorkerFactory {
            queue: queue.clone(),
            engine: Arc::new(engine),
            tx_dead_letter: channels.workers_to_dead_letter,
            settings: WorkerSettings {
                batch_size: system.batch_size,
                batch_wait: system.batch_wait,
                max_delivery_attempts: system.max_delivery_attempts,
            },
            cancel: CancellationToken::new(),
        };

        let supervisor = ShardSupervisor::start_workers(factory, ctx.metrics.clone(), SupervisorSettings {
            check_interval: system.supervisor_interval,
            metrics_interval: system.metrics_interval,
        });

        let watchdog = start_watchdog(channels.watchdog_to_supervisor,
                                      channels.watchdog_from_supervisor);

        let (stop_supervisor, rx_stop) = oneshot::channel();
        let supervisor = start_supervisor(channels.supervisor_to_watchdog,
                                          channels.supervisor_from_watchdog,
                                          supervisor,
                                          rx_stop);

        let auxiliary_cancel = CancellationToken::new();
        let mut auxiliary = Vec::new();
        if let Some(path) = &system.rules_path {
            auxiliary.push(start_rule_reloader(path.clone(),
                                               ctx.rules.clone(),
                                               system.rules_reload,
                                               auxiliary_cancel.clone()));
        }
        if system.simulator_enabled {
            auxiliary.push(start_simulator(queue.clone(),
                                           system.simulator_interval,
                                           auxiliary_cancel.clone()));
        }

        info!("Info: pipeline iniciado con {} shards", system.shard_count);
        Self {
            ctx,
            queue,
            evaluator,
            tasks: Tasks {
                stop_supervisor,
                supervisor,
                watchdog,
                evaluator: evaluator_task,
                dispatcher,
                dead_letter,
                auxiliary,
                auxiliary_cancel,
            },
        }
    }

    /// Ingresa un mensaje. Si su shard está lleno devuelve `QueueError::Full` sin esperar.
    pub async fn submit_telemetry(&self, msg: TelemetryMessage) -> Result<(), QueueError> {
        self.queue.enqueue(msg, None).await
    }

    /// Como `submit_telemetry`, pero espera hasta `timeout` a que el shard tenga lugar.
    pub async fn submit_telemetry_timeout(&self,
                                          msg: TelemetryMessage,
                                          timeout: Duration) -> Result<(), QueueError> {
        self.queue.enqueue(msg, Some(timeout)).await
    }

    pub async fn get_twin_snapshot(&self, entity_id: &str) -> Option<TwinEntity> {
        self.ctx.store.snapshot(entity_id).await
    }

    /// Todos los gemelos conocidos, ordenados por id.
    pub async fn list_twins(&self) -> Vec<TwinEntity> {
        let mut twins = Vec::new();
        for entity_id in self.ctx.store.entity_ids().await {
            if let Some(twin) = self.ctx.store.snapshot(&entity_id).await {
                twins.push(twin);
            }
        }
        twins
    }

    pub fn reload_rules(&self, rules: RuleSet) {
        self.ctx.rules.reload(rules);
    }

    pub fn open_alerts(&self) -> Vec<AlertEvent> {
        lock(&self.evaluator).open_alerts()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.ctx.metrics.snapshot()
    }

    /// Cierre cooperativo.
    ///
    /// 1. Detiene el simulador y la recarga de reglas.
    /// 2. Cierra la cola y deja que los workers drenen durante `grace`.
    /// 3. Cancela a los que no terminaron y cuenta lo que quedó sin procesar.
    /// 4. Espera a que evaluador, despachador y dead-letter vacíen sus canales.
    pub async fn shutdown(self, grace: Duration) -> ShutdownReport {
        info!("Info: cerrando pipeline");
        let Pipeline { ctx, queue, evaluator, tasks } = self;

        tasks.auxiliary_cancel.cancel();
        for handle in tasks.auxiliary {
            if let Err(e) = handle.await {
                error!("Error: tarea auxiliar finalizó con error: {}", e);
            }
        }

        queue.close();
        if tasks.stop_supervisor.send(grace).is_err() {
            error!("Error: el supervisor ya había finalizado");
        }
        if let Err(e) = tasks.supervisor.await {
            error!("Error: supervisor finalizó con error: {}", e);
        }

        let dropped = queue.outstanding() as u64;
        if dropped > 0 {
            ctx.metrics.add(Counter::MessagesDroppedOnShutdown, dropped);
            warn!("Warning: {} mensajes descartados al cerrar", dropped);
        }

        for (name, handle) in [("watchdog", tasks.watchdog),
                               ("evaluador", tasks.evaluator),
                               ("despachador", tasks.dispatcher),
                               ("dead-letter", tasks.dead_letter)] {
            if let Err(e) = handle.await {
                error!("Error: tarea {} finalizó con error: {}", name, e);
            }
        }

        let report = ShutdownReport {
            messages_dropped: dropped,
            open_alerts: lock(&evaluator).open_alerts().len(),
            metrics: ctx.metrics.snapshot(),
        };
        info!("Info: pipeline cerrado ({} mensajes descartados)", report.messages_dropped);
        report
    }
}
