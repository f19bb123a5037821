//! Dominio de los gemelos digitales.
//!
//! Un `TwinEntity` es el estado proyectado de una máquina, línea, sensor o fábrica.
//! El `TwinStore` es su único dueño: nadie más lo muta. La regla de fusión vive aquí
//! como función pura para que todas las implementaciones del store la compartan.


use std::collections::{BTreeMap, HashMap};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use crate::message::domain::{EntityKind, FieldValue, Fields, TelemetryMessage};


#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwinEntity {
    pub entity_id: String,
    pub entity_kind: EntityKind,
    pub properties: Fields,
    /// Se incrementa exactamente una vez por parche aplicado.
    pub version: u64,
    /// Última secuencia aplicada por cada dispositivo que alimenta la entidad.
    pub last_sequence: HashMap<String, u64>,
    pub updated_at: DateTime<Utc>,
}


/// Cambios de campo derivados de un mensaje de telemetría.
#[derive(Debug, Clone, PartialEq)]
pub struct TwinPatch {
    pub entity_id: String,
    pub entity_kind: EntityKind,
    pub device_id: String,
    pub sequence: u64,
    pub fields: Fields,
}


impl From<&TelemetryMessage> for TwinPatch {
    fn from(msg: &TelemetryMessage) -> Self {
        Self {
            entity_id: msg.entity_id.clone(),
            entity_kind: msg.entity_kind,
            device_id: msg.device_id.clone(),
            sequence: msg.sequence,
            fields: msg.fields.clone(),
        }
    }
}


/// Resultado de fusionar un parche contra el estado actual, antes de persistir.
#[derive(Debug, Clone, PartialEq)]
pub enum Merge {
    Stale { last_sequence: u64 },
    Unchanged(TwinEntity),
    Changed { next: TwinEntity, changed_fields: Fields },
}


impl TwinEntity {
    pub fn new(entity_id: impl Into<String>, entity_kind: EntityKind, now: DateTime<Utc>) -> Self {
        Self {
            entity_id: entity_id.into(),
            entity_kind,
            properties: BTreeMap::new(),
            version: 0,
            last_sequence: HashMap::new(),
            updated_at: now,
        }
    }

    pub fn last_sequence_for(&self, device_id: &str) -> Option<u64> {
        self.last_sequence.get(device_id).copied()
    }

    /// Calcula el próximo estado sin mutar `self`.
    ///
    /// * Secuencia menor o igual a la última del dispositivo: `Stale`.
    /// * Todos los campos iguales a los actuales: `Unchanged`, que solo avanza la secuencia.
    /// * En otro caso: upsert campo a campo y `version + 1`.
    pub fn merge(&self, patch: &TwinPatch, now: DateTime<Utc>) -> Merge {
        if let Some(last) = self.last_sequence_for(&patch.device_id) {
            if patch.sequence <= last {
                return Merge::Stale { last_sequence: last };
            }
        }

        let changed_fields: Fields = patch.fields.iter()
            .filter(|(name, value)| self.properties.get(*name) != Some(*value))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        let mut next = self.clone();
        next.last_sequence.insert(patch.device_id.clone(), patch.sequence);

        if changed_fields.is_empty() {
            return Merge::Unchanged(next);
        }

        for (name, value) in &changed_fields {
            next.properties.insert(name.clone(), value.clone());
        }
        next.version += 1;
        next.updated_at = now;

        Merge::Changed { next, changed_fields }
    }

    pub fn property(&self, name: &str) -> Option<&FieldValue> {
        self.properties.get(name)
    }
}


/// Resultado confirmado de `TwinStore::apply_patch`.
#[derive(Debug, Clone, PartialEq)]
pub enum PatchResult {
    Applied { version: u64, changed_fields: Fields, snapshot: TwinEntity },
    Stale { last_sequence: u64 },
    Unchanged { version: u64 },
}


#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("entity {entity_id} is corrupt: {reason}")]
    Corrupt { entity_id: String, reason: String },

    #[error("entity {0} is quarantined")]
    Quarantined(String),

    #[error("store backend error: {0}")]
    Backend(String),
}


impl StoreError {
    /// Fallas que vale la pena reintentar.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}


/// Almacén versionado de gemelos con lecturas y escrituras linealizables por entidad.
#[async_trait]
pub trait TwinStore: Send + Sync {
    /// Devuelve la entidad, creándola vacía (`version = 0`) si no existe.
    async fn get_or_create(&self, entity_id: &str, entity_kind: EntityKind) -> Result<TwinEntity, StoreError>;

    /// Única mutación atómica: verifica la secuencia, fusiona, persiste y publica.
    /// Dos llamadas sobre la misma entidad nunca se intercalan.
    async fn apply_patch(&self, patch: &TwinPatch) -> Result<PatchResult, StoreError>;

    /// Copia consistente del estado confirmado.
    async fn snapshot(&self, entity_id: &str) -> Option<TwinEntity>;

    async fn entity_ids(&self) -> Vec<String>;

    /// Marca la entidad como no disponible. Las demás siguen procesándose.
    async fn quarantine(&self, entity_id: &str, reason: &str);
}


#[cfg(test)]
mod tests {
    use super::*;

    fn patch(device: &str, sequence: u64, fields: &[(&str, FieldValue)]) -> TwinPatch {
        TwinPatch {
            entity_id: "machineA".into(),
            entity_kind: EntityKind::Machine,
            device_id: device.into(),
            sequence,
            fields: fields.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
        }
    }

    #[test]
    fn test_merge_upserts_fields_and_bumps_version() {
        let now = Utc::now();
        let twin = TwinEntity::new("machineA", EntityKind::Machine, now);

        let Merge::Changed { next, changed_fields } =
            twin.merge(&patch("d1", 1, &[("temperature", FieldValue::Number(70.0))]), now) else {
            panic!("expected change");
        };
        assert_eq!(next.version, 1);
        assert_eq!(changed_fields.len(), 1);

        let Merge::Changed { next, .. } =
            next.merge(&patch("d1", 2, &[("status", "running".into())]), now) else {
            panic!("expected change");
        };
        assert_eq!(next.version, 2);
        assert_eq!(next.property("temperature"), Some(&FieldValue::Number(70.0)));
        assert_eq!(next.property("status"), Some(&FieldValue::Text("running".into())));
        assert_eq!(next.last_sequence_for("d1"), Some(2));
    }

    #[test]
    fn test_merge_rejects_replayed_and_older_sequences() {
        let now = Utc::now();
        let twin = TwinEntity::new("machineA", EntityKind::Machine, now);
        let Merge::Changed { next, .. } = twin.merge(&patch("d1", 5, &[("temperature", FieldValue::Number(70.0))]), now) else {
            panic!("expected change");
        };

        assert_eq!(next.merge(&patch("d1", 5, &[("temperature", FieldValue::Number(1.0))]), now),
                   Merge::Stale { last_sequence: 5 });
        assert_eq!(next.merge(&patch("d1", 2, &[("temperature", FieldValue::Number(1.0))]), now),
                   Merge::Stale { last_sequence: 5 });
    }

    #[test]
    fn test_sequences_are_tracked_per_device() {
        let now = Utc::now();
        let twin = TwinEntity::new("lineA", EntityKind::Line, now);
        let Merge::Changed { next, .. } = twin.merge(&patch("d1", 10, &[("oee", FieldValue::Number(0.9))]), now) else {
            panic!("expected change");
        };

        let merged = next.merge(&patch("d2", 1, &[("throughput", FieldValue::Number(120.0))]), now);
        assert!(matches!(merged, Merge::Changed { .. }));
    }

    #[test]
    fn test_unchanged_patch_advances_sequence_only() {
        let now = Utc::now();
        let twin = TwinEntity::new("machineA", EntityKind::Machine, now);
        let Merge::Changed { next, .. } = twin.merge(&patch("d1", 1, &[("temperature", FieldValue::Number(70.0))]), now) else {
            panic!("expected change");
        };

        let Merge::Unchanged(after) = next.merge(&patch("d1", 2, &[("temperature", FieldValue::Number(70.0))]), now) else {
            panic!("expected unchanged");
        };
        assert_eq!(after.version, 1);
        assert_eq!(after.last_sequence_for("d1"), Some(2));
    }
}
