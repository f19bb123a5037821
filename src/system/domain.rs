//! Módulo de configuración central y gestión del entorno de ejecución.
//!
//! Este módulo actúa como la fuente única de verdad para la configuración del pipeline.
//! Se encarga de leer las variables de entorno, establecer valores por defecto seguros
//! y proveer las estructuras necesarias para iniciar los subsistemas (Cola, Store, Alertas, Logging).
//!
//! # Funcionalidades Principales
//! * **Carga de Configuración:** Lee de `.env` en desarrollo y variables de sistema en producción.
//! * **Observabilidad:** Configura `tracing_subscriber` para logs estructurados o legibles.
//! * **Selección de Backend:** Decide entre el store en memoria y el store Postgres.
//!


use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};
use crate::queue::domain::ShardKey;


/// Backend de persistencia para los gemelos.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Postgres,
}


#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} has an invalid value: {value}")]
    Invalid { key: &'static str, value: String },

    #[error("STORE_BACKEND=postgres requires DATABASE_URL")]
    MissingDatabaseUrl,
}


/// Representa la configuración global del pipeline y el estado del entorno.
#[derive(Debug, Clone)]
pub struct System {
    /// Entorno de ejecución actual (`development`, `staging`, `production`).
    /// Afecta el formato de logs y la carga de archivos `.env`.
    pub environment: String,

    /// Nivel de detalle de los logs (ej. `info`, `debug`, `warn`).
    /// Se autoconfigura según el `environment` si no se especifica.
    pub rust_log: String,

    /// Backend del store de gemelos. Por defecto: `memory`.
    pub store_backend: StoreBackend,

    /// URL de conexión a PostgreSQL (sin el prefijo `postgres://`).
    /// **Requerido** solo con `STORE_BACKEND=postgres`.
    pub database_url: Option<String>,

    /// Tamaño máximo del pool de conexiones. Por defecto: `10`.
    pub db_pool_size: u32,

    /// Cantidad de shards de la cola de ingreso. Por defecto: `4`.
    pub shard_count: usize,

    /// Mensajes pendientes admitidos por shard. Por defecto: `2500`.
    pub shard_capacity: usize,

    /// Clave de particionado de la cola. Por defecto: `device`.
    pub shard_key: ShardKey,

    pub batch_size: usize,
    pub batch_wait: Duration,

    /// Antigüedad máxima de un mensaje en cola antes de expirar. Por defecto: 300 s.
    pub message_ttl: Duration,

    /// Entregas permitidas antes de enviar un mensaje a dead-letter. Por defecto: `5`.
    pub max_delivery_attempts: u32,

    /// Intervalo mínimo entre dos `Refresh` de una misma alerta. Por defecto: 60 s.
    pub alert_refresh: Duration,

    /// Archivo JSON con las reglas de alerta. Sin archivo se usan las reglas de fábrica.
    pub rules_path: Option<PathBuf>,
    pub rules_reload: Duration,

    /// Archivo JSON-lines para los mensajes en dead-letter.
    pub dead_letter_path: Option<PathBuf>,

    pub supervisor_interval: Duration,
    pub metrics_interval: Duration,
    pub shutdown_grace: Duration,

    pub simulator_enabled: bool,
    pub simulator_interval: Duration,
}


impl System {

    /// Carga la configuración desde las variables de entorno.
    ///
    /// # Comportamiento
    /// * Si `ENVIRONMENT` es "development", intenta cargar un archivo `.env`.
    /// * Establece valores por defecto para variables opcionales.
    ///
    /// # Errores
    /// * `ConfigError::Invalid` si una variable numérica no es un número válido.
    /// * `ConfigError::MissingDatabaseUrl` si se pide Postgres sin `DATABASE_URL`.
    pub fn new() -> Result<Self, ConfigError> {

        let environment = env::var("ENVIRONMENT")
            .unwrap_or_else(|_| "development".into());

        if environment == "development" {
            dotenv::dotenv().ok();
        }

        let system = Self::from_lookup(|key| env::var(key).ok())?;
        info!("Info: configuración cargada para entorno {}", system.environment);
        Ok(system)
    }

    /// Construye la configuración a partir de una función de búsqueda de variables.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let environment = lookup("ENVIRONMENT")
            .unwrap_or_else(|| "development".into());

        let rust_log = lookup("RUST_LOG")
            .unwrap_or_else(|| {
                match environment.as_str() {
                    "development" => "debug".to_string(),
                    "staging" => "info".to_string(),
                    _ => "warn".to_string(),
                }
            });

        let store_backend = match lookup("STORE_BACKEND").as_deref() {
            None | Some("memory") => StoreBackend::Memory,
            Some("postgres") => StoreBackend::Postgres,
            Some(other) => return Err(ConfigError::Invalid {
                key: "STORE_BACKEND",
                value: other.to_string(),
            }),
        };

        let database_url = lookup("DATABASE_URL");
        if store_backend == StoreBackend::Postgres && database_url.is_none() {
            return Err(ConfigError::MissingDatabaseUrl);
        }

        let shard_key = match lookup("SHARD_KEY").as_deref() {
            None | Some("device") => ShardKey::Device,
            Some("entity") => ShardKey::Entity,
            Some(other) => return Err(ConfigError::Invalid {
                key: "SHARD_KEY",
                value: other.to_string(),
            }),
        };

        let shard_count: usize = parse_or(&lookup, "SHARD_COUNT", 4)?;
        if shard_count == 0 {
            return Err(ConfigError::Invalid { key: "SHARD_COUNT", value: "0".into() });
        }
        let shard_capacity: usize = parse_or(&lookup, "SHARD_CAPACITY", 2500)?;
        if shard_capacity == 0 {
            return Err(ConfigError::Invalid { key: "SHARD_CAPACITY", value: "0".into() });
        }

        let simulator_default = environment == "development";

        Ok(System {
            store_backend,
            database_url,
            db_pool_size: parse_or(&lookup, "DB_POOL_SIZE", 10)?,
            shard_count,
            shard_capacity,
            shard_key,
            batch_size: parse_or::<usize, _>(&lookup, "BATCH_SIZE", 64)?.max(1),
            batch_wait: Duration::from_millis(parse_or(&lookup, "BATCH_WAIT_MS", 100)?),
            message_ttl: Duration::from_secs(parse_or(&lookup, "MESSAGE_TTL_SECS", 300)?),
            max_delivery_attempts: parse_or::<u32, _>(&lookup, "MAX_DELIVERY_ATTEMPTS", 5)?.max(1),
            alert_refresh: Duration::from_secs(parse_or(&lookup, "ALERT_REFRESH_SECS", 60)?),
            rules_path: lookup("RULES_PATH").map(PathBuf::from),
            rules_reload: Duration::from_secs(parse_or(&lookup, "RULES_RELOAD_SECS", 30)?),
            dead_letter_path: lookup("DEAD_LETTER_PATH").map(PathBuf::from),
            supervisor_interval: Duration::from_millis(parse_or(&lookup, "SUPERVISOR_INTERVAL_MS", 1000)?),
            metrics_interval: Duration::from_secs(parse_or(&lookup, "METRICS_INTERVAL_SECS", 30)?),
            shutdown_grace: Duration::from_secs(parse_or(&lookup, "SHUTDOWN_GRACE_SECS", 10)?),
            simulator_enabled: parse_or(&lookup, "SIMULATOR_ENABLED", simulator_default)?,
            simulator_interval: Duration::from_millis(parse_or(&lookup, "SIMULATOR_INTERVAL_MS", 1000)?),
            rust_log,
            environment,
        })
    }
}


impl Default for System {
    /// Configuración por defecto en memoria, sin simulador. Útil en tests.
    fn default() -> Self {
        let mut system = Self::from_lookup(|key| match key {
            "ENVIRONMENT" => Some("test".to_string()),
            _ => None,
        })
            .unwrap_or_else(|_| unreachable!("los valores por defecto siempre son válidos"));
        system.simulator_enabled = false;
        system
    }
}


fn parse_or<T, F>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}


/// Inicializa el sistema de trazabilidad y logs (Tracing).
///
/// Configura el formato de salida basándose en el entorno:
/// * **Production**: Salida JSON (para logs estructurados en la nube).
/// * **Development/Otros**: Salida "Pretty" (colores y formato legible).
pub fn init_tracing(system: &System) {

    let filter = EnvFilter::try_new(&system.rust_log)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = fmt().with_env_filter(filter).with_target(false);

    if system.environment == "production" {
        builder.json().init();
    } else {
        builder.pretty().init();
    }
}


#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let system = System::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(system.environment, "development");
        assert_eq!(system.rust_log, "debug");
        assert_eq!(system.store_backend, StoreBackend::Memory);
        assert_eq!(system.shard_count, 4);
        assert_eq!(system.shard_capacity, 2500);
        assert_eq!(system.shard_key, ShardKey::Device);
        assert_eq!(system.message_ttl, Duration::from_secs(300));
        assert_eq!(system.alert_refresh, Duration::from_secs(60));
        assert!(system.simulator_enabled);
    }

    #[test]
    fn test_production_log_level_and_overrides() {
        let system = System::from_lookup(lookup_from(&[
            ("ENVIRONMENT", "production"),
            ("SHARD_COUNT", "8"),
            ("SHARD_KEY", "entity"),
            ("RULES_PATH", "/etc/factory/rules.json"),
        ])).unwrap();

        assert_eq!(system.rust_log, "warn");
        assert_eq!(system.shard_count, 8);
        assert_eq!(system.shard_key, ShardKey::Entity);
        assert_eq!(system.rules_path, Some(PathBuf::from("/etc/factory/rules.json")));
        assert!(!system.simulator_enabled);
    }

    #[test]
    fn test_invalid_values_are_reported() {
        let err = System::from_lookup(lookup_from(&[("SHARD_COUNT", "many")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "SHARD_COUNT", .. }));

        let err = System::from_lookup(lookup_from(&[("STORE_BACKEND", "postgres")])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingDatabaseUrl));
    }
}
