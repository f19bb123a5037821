use chrono::{DateTime, Utc};
use thiserror::Error;
use crate::message::domain::{EntityKind, Fields};
use crate::twin::domain::TwinEntity;


/// Resultado de proyectar un mensaje sobre su gemelo.
#[derive(Debug, Clone, PartialEq)]
pub enum PatchOutcome {
    Applied { version: u64, changed_fields: Fields },
    /// La secuencia ya fue aplicada (o es anterior) para ese dispositivo.
    SkippedStale,
    /// Nada cambió; igual avanzó la última secuencia del dispositivo.
    SkippedUnchanged,
}


/// Parche ya confirmado en el store, tal como lo recibe el evaluador de alertas.
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedPatch {
    pub entity_id: String,
    pub entity_kind: EntityKind,
    pub device_id: String,
    pub sequence: u64,
    pub version: u64,
    pub changed_fields: Fields,
    pub snapshot: TwinEntity,
    pub committed_at: DateTime<Utc>,
}


#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProjectionError {
    /// Falla transitoria que agotó los reintentos. El mensaje debe reentregarse.
    #[error("store unavailable for {entity_id} after {attempts} attempts: {reason}")]
    StoreUnavailable { entity_id: String, attempts: u32, reason: String },

    #[error("entity {entity_id} is quarantined")]
    Quarantined { entity_id: String },

    #[error("store rejected patch for {entity_id}: {reason}")]
    Backend { entity_id: String, reason: String },
}
