//! Definición del Contexto de Aplicación (Shared State).
//!
//! Este módulo implementa el patrón de **Estado Compartido** para aplicaciones asíncronas.
//! El `AppContext` actúa como un contenedor de "Inyección de Dependencias" manual,
//! agrupando los recursos que deben ser accesibles por múltiples tareas concurrentes
//! (store de gemelos, configuración, reglas, métricas y sink de alertas).


use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use crate::alert::domain::{AlertSink, RuleError, RuleSet};
use crate::alert::logic::{LogAlertSink, RuleHandle};
use crate::database::repository::PostgresTwinStore;
use crate::metrics::domain::PipelineMetrics;
use crate::system::domain::{StoreBackend, System};
use crate::twin::domain::TwinStore;
use crate::twin::logic::InMemoryTwinStore;


#[derive(Debug, Error)]
pub enum ContextError {
    #[error("cannot open twin store: {0}")]
    Store(#[from] sqlx::Error),

    #[error(transparent)]
    Rules(#[from] RuleError),

    #[error("STORE_BACKEND=postgres requires DATABASE_URL")]
    MissingDatabaseUrl,
}


#[derive(Clone)]
pub struct AppContext {
    pub system: Arc<System>,
    pub store: Arc<dyn TwinStore>,
    pub metrics: Arc<PipelineMetrics>,
    pub rules: RuleHandle,
    pub sink: Arc<dyn AlertSink>,
}


impl AppContext {
    /// Arma el contexto según la configuración: abre el store elegido y carga las
    /// reglas desde `RULES_PATH` (o las de fábrica si no hay archivo).
    pub async fn new(system: System) -> Result<Self, ContextError> {
        let store: Arc<dyn TwinStore> = match system.store_backend {
            StoreBackend::Memory => Arc::new(InMemoryTwinStore::new()),
            StoreBackend::Postgres => {
                let url = system.database_url.as_deref().ok_or(ContextError::MissingDatabaseUrl)?;
                Arc::new(PostgresTwinStore::connect(url, system.db_pool_size).await?)
            }
        };

        let rules = match &system.rules_path {
            Some(path) => RuleSet::load(path).await?,
            None => RuleSet::factory_defaults(),
        };
        info!("Info: {} reglas de alerta cargadas", rules.len());

        Ok(Self {
            system: Arc::new(system),
            store,
            metrics: Arc::new(PipelineMetrics::new()),
            rules: RuleHandle::new(rules),
            sink: Arc::new(LogAlertSink),
        })
    }

    /// Contexto en memoria con las reglas de fábrica y alertas al log.
    pub fn in_memory(system: System) -> Self {
        Self {
            system: Arc::new(system),
            store: Arc::new(InMemoryTwinStore::new()),
            metrics: Arc::new(PipelineMetrics::new()),
            rules: RuleHandle::new(RuleSet::factory_defaults()),
            sink: Arc::new(LogAlertSink),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn TwinStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_rules(mut self, rules: RuleSet) -> Self {
        self.rules = RuleHandle::new(rules);
        self
    }
}
