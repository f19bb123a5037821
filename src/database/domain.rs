//! Estructuras de dominio para la persistencia de gemelos en PostgreSQL.
//!
//! Las filas se leen tal cual vienen de la base y recién después se convierten a
//! `TwinEntity`. Una fila que no se puede decodificar no tumba la carga completa:
//! se informa como `StoreError::Corrupt` y solo esa entidad queda en cuarentena.


use std::collections::HashMap;
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use sqlx::types::Json;
use crate::message::domain::{EntityKind, Fields};
use crate::twin::domain::{StoreError, TwinEntity};


#[derive(Debug, Clone, FromRow)]
pub struct TwinRow {
    pub entity_id: String,
    pub entity_kind: String,
    pub properties: Json<serde_json::Value>,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}


#[derive(Debug, Clone, FromRow)]
pub struct SequenceRow {
    pub entity_id: String,
    pub device_id: String,
    pub last_sequence: i64,
}


impl TwinRow {
    /// Convierte la fila en entidad, junto con las secuencias por dispositivo.
    pub fn into_entity(self, sequences: HashMap<String, u64>) -> Result<TwinEntity, StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt {
            entity_id: self.entity_id.clone(),
            reason,
        };

        let entity_kind: EntityKind = self.entity_kind.parse()
            .map_err(|_| corrupt(format!("unknown kind {}", self.entity_kind)))?;
        let properties: Fields = serde_json::from_value(self.properties.0.clone())
            .map_err(|e| corrupt(format!("properties: {e}")))?;
        let version = u64::try_from(self.version)
            .map_err(|_| corrupt(format!("negative version {}", self.version)))?;

        Ok(TwinEntity {
            entity_id: self.entity_id.clone(),
            entity_kind,
            properties,
            version,
            last_sequence: sequences,
            updated_at: self.updated_at,
        })
    }
}


/// Secuencias persistidas agrupadas por entidad.
#[derive(Debug, Default)]
pub struct GroupedSequences {
    pub by_entity: HashMap<String, HashMap<String, u64>>,
    /// Entidades con al menos una fila ilegible, con el motivo.
    pub corrupt: HashMap<String, String>,
}


/// Agrupa las filas de secuencia por entidad. Una fila inválida marca solo a su
/// entidad como corrupta; las demás conservan sus secuencias.
pub fn sequences_by_entity(rows: Vec<SequenceRow>) -> GroupedSequences {
    let mut grouped = GroupedSequences::default();
    for row in rows {
        match u64::try_from(row.last_sequence) {
            Ok(sequence) => {
                grouped.by_entity.entry(row.entity_id).or_default().insert(row.device_id, sequence);
            }
            Err(_) => {
                let reason = format!("negative sequence {} for device {}", row.last_sequence, row.device_id);
                grouped.corrupt.insert(row.entity_id, reason);
            }
        }
    }
    for entity_id in grouped.corrupt.keys() {
        grouped.by_entity.remove(entity_id);
    }
    grouped
}


/// Conversión de contadores a las columnas `BIGINT`.
pub fn to_column(value: u64, what: &str) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Backend(format!("{what} {value} exceeds BIGINT")))
}


/// Clasifica los errores de sqlx: los de conectividad se reintentan, el resto no.
impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(e.to_string()),
            other => StoreError::Backend(other.to_string()),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::domain::FieldValue;

    fn row(kind: &str, properties: serde_json::Value, version: i64) -> TwinRow {
        TwinRow {
            entity_id: "machineA".into(),
            entity_kind: kind.into(),
            properties: Json(properties),
            version,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_row_into_entity() {
        let twin = row("machine", serde_json::json!({ "temperature": 90.0, "status": "ok" }), 2)
            .into_entity(HashMap::from([("d1".to_string(), 2)]))
            .unwrap();

        assert_eq!(twin.entity_kind, EntityKind::Machine);
        assert_eq!(twin.version, 2);
        assert_eq!(twin.property("temperature"), Some(&FieldValue::Number(90.0)));
        assert_eq!(twin.last_sequence_for("d1"), Some(2));
    }

    #[test]
    fn test_undecodable_rows_are_corrupt() {
        let err = row("robot", serde_json::json!({}), 1).into_entity(HashMap::new()).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));

        let err = row("machine", serde_json::json!([1, 2]), 1).into_entity(HashMap::new()).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));

        let err = row("machine", serde_json::json!({}), -1).into_entity(HashMap::new()).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[test]
    fn test_sqlx_errors_are_classified() {
        assert!(StoreError::from(sqlx::Error::PoolTimedOut).is_transient());
        assert!(StoreError::from(sqlx::Error::PoolClosed).is_transient());
        assert!(!StoreError::from(sqlx::Error::RowNotFound).is_transient());
    }

    #[test]
    fn test_sequences_grouping() {
        let grouped = sequences_by_entity(vec![
            SequenceRow { entity_id: "a".into(), device_id: "d1".into(), last_sequence: 3 },
            SequenceRow { entity_id: "a".into(), device_id: "d2".into(), last_sequence: 9 },
            SequenceRow { entity_id: "b".into(), device_id: "d1".into(), last_sequence: 1 },
        ]);

        assert_eq!(grouped.by_entity["a"].len(), 2);
        assert_eq!(grouped.by_entity["b"]["d1"], 1);
        assert!(grouped.corrupt.is_empty());
    }

    #[test]
    fn test_bad_sequence_row_only_marks_its_entity() {
        let grouped = sequences_by_entity(vec![
            SequenceRow { entity_id: "a".into(), device_id: "d1".into(), last_sequence: 3 },
            SequenceRow { entity_id: "b".into(), device_id: "d1".into(), last_sequence: 5 },
            SequenceRow { entity_id: "b".into(), device_id: "d2".into(), last_sequence: -1 },
            SequenceRow { entity_id: "c".into(), device_id: "d9".into(), last_sequence: 7 },
        ]);

        assert_eq!(grouped.by_entity["a"]["d1"], 3);
        assert_eq!(grouped.by_entity["c"]["d9"], 7);
        assert!(!grouped.by_entity.contains_key("b"));
        assert!(grouped.corrupt["b"].contains("d2"));
    }
}
