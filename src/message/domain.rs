//! Dominio de Mensajería y Modelos de Telemetría.
//!
//! Este módulo define las estructuras que entran al pipeline desde los dispositivos
//! (simuladores, gateways reales o puentes HTTP/MQTT externos). Toda la validación
//! ocurre una única vez en el borde: a partir de aquí los componentes internos
//! trabajan con un `TelemetryMessage` tipado y nunca revisan campos opcionales.


use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;


/// Tipo lógico de la entidad gemela destino.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Machine,
    Line,
    Sensor,
    Factory,
}


impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Machine => "machine",
            EntityKind::Line => "line",
            EntityKind::Sensor => "sensor",
            EntityKind::Factory => "factory",
        }
    }
}


impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}


impl FromStr for EntityKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "machine" => Ok(EntityKind::Machine),
            "line" => Ok(EntityKind::Line),
            "sensor" => Ok(EntityKind::Sensor),
            "factory" => Ok(EntityKind::Factory),
            other => Err(ValidationError::UnknownEntityKind(other.to_string())),
        }
    }
}


/// Valor de un campo de telemetría o propiedad de un gemelo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Text(String),
    Flag(bool),
}


impl FieldValue {
    /// Valor numérico del campo, si lo tiene. Las reglas de alerta solo evalúan números.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            _ => None,
        }
    }
}


impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Number(value)
    }
}


impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}


pub type Fields = BTreeMap<String, FieldValue>;


/// Campos que el modelo de fábrica conoce como numéricos. Un texto en cualquiera
/// de ellos se rechaza en el borde.
const NUMERIC_FIELDS: &[&str] = &[
    "temperature", "vibration", "pressure", "health", "oee", "throughput",
    "value", "efficiency", "energyConsumption", "overallEfficiency",
    "predictedFailure", "anomalyScore",
];


/// Una observación de un dispositivo, ya validada.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryMessage {
    pub device_id: String,
    pub entity_id: String,
    pub entity_kind: EntityKind,
    pub fields: Fields,
    /// Contador estrictamente creciente por `device_id`.
    pub sequence: u64,
    pub observed_at: DateTime<Utc>,
    /// Lo asigna la cola al aceptar el mensaje.
    pub ingested_at: DateTime<Utc>,
}


impl TelemetryMessage {
    pub fn new(device_id: impl Into<String>,
               entity_id: impl Into<String>,
               entity_kind: EntityKind,
               sequence: u64,
               fields: Fields) -> Self {

        let now = Utc::now();
        Self {
            device_id: device_id.into(),
            entity_id: entity_id.into(),
            entity_kind,
            fields,
            sequence,
            observed_at: now,
            ingested_at: now,
        }
    }

    /// Deserializa y valida un mensaje JSON tal como llega de un puente externo.
    pub fn from_json(payload: &str) -> Result<Self, ValidationError> {
        let raw: RawTelemetry = serde_json::from_str(payload)?;
        TelemetryMessage::try_from(raw)
    }
}


/// Forma cruda del mensaje en el borde de ingreso (JSON con campos opcionales).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTelemetry {
    pub device_id: Option<String>,
    pub entity_id: Option<String>,
    pub entity_kind: Option<String>,
    pub fields: Option<serde_json::Map<String, serde_json::Value>>,
    pub sequence: Option<u64>,
    pub observed_at: Option<DateTime<Utc>>,
}


#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("empty identifier: {0}")]
    EmptyIdentifier(&'static str),

    #[error("unknown entity kind: {0}")]
    UnknownEntityKind(String),

    #[error("telemetry carries no fields")]
    EmptyFields,

    #[error("field {field} has an unsupported value")]
    UnsupportedValue { field: String },

    #[error("field {field} must be numeric")]
    TypeMismatch { field: String },

    #[error("field {field} is not a finite number")]
    NonFinite { field: String },

    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
}


impl TryFrom<RawTelemetry> for TelemetryMessage {
    type Error = ValidationError;

    fn try_from(raw: RawTelemetry) -> Result<Self, Self::Error> {
        let device_id = non_empty(raw.device_id, "deviceId")?;
        let entity_id = non_empty(raw.entity_id, "entityId")?;
        let entity_kind: EntityKind = raw.entity_kind
            .ok_or(ValidationError::MissingField("entityKind"))?
            .parse()?;
        let sequence = raw.sequence.ok_or(ValidationError::MissingField("sequence"))?;
        let raw_fields = raw.fields.ok_or(ValidationError::MissingField("fields"))?;

        if raw_fields.is_empty() {
            return Err(ValidationError::EmptyFields);
        }

        let mut fields = Fields::new();
        for (name, value) in raw_fields {
            let value = convert_value(&name, value)?;
            fields.insert(name, value);
        }

        let now = Utc::now();
        Ok(TelemetryMessage {
            device_id,
            entity_id,
            entity_kind,
            fields,
            sequence,
            observed_at: raw.observed_at.unwrap_or(now),
            ingested_at: now,
        })
    }
}


fn non_empty(value: Option<String>, name: &'static str) -> Result<String, ValidationError> {
    let value = value.ok_or(ValidationError::MissingField(name))?;
    if value.trim().is_empty() {
        return Err(ValidationError::EmptyIdentifier(name));
    }
    Ok(value)
}


fn convert_value(name: &str, value: serde_json::Value) -> Result<FieldValue, ValidationError> {
    let numeric = NUMERIC_FIELDS.contains(&name);

    match value {
        serde_json::Value::Number(n) => {
            let n = n.as_f64().ok_or_else(|| ValidationError::NonFinite { field: name.to_string() })?;
            if !n.is_finite() {
                return Err(ValidationError::NonFinite { field: name.to_string() });
            }
            Ok(FieldValue::Number(n))
        }
        serde_json::Value::String(_) | serde_json::Value::Bool(_) if numeric => {
            Err(ValidationError::TypeMismatch { field: name.to_string() })
        }
        serde_json::Value::String(s) => Ok(FieldValue::Text(s)),
        serde_json::Value::Bool(b) => Ok(FieldValue::Flag(b)),
        _ => Err(ValidationError::UnsupportedValue { field: name.to_string() }),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_json_builds_typed_message() {
        let msg = TelemetryMessage::from_json(r#"{
            "deviceId": "d1",
            "entityId": "machineA",
            "entityKind": "machine",
            "sequence": 7,
            "fields": { "temperature": 70, "status": "operational", "isActive": true }
        }"#).unwrap();

        assert_eq!(msg.device_id, "d1");
        assert_eq!(msg.entity_kind, EntityKind::Machine);
        assert_eq!(msg.sequence, 7);
        assert_eq!(msg.fields.get("temperature"), Some(&FieldValue::Number(70.0)));
        assert_eq!(msg.fields.get("status"), Some(&FieldValue::Text("operational".into())));
        assert_eq!(msg.fields.get("isActive"), Some(&FieldValue::Flag(true)));
    }

    #[test]
    fn test_missing_sequence_is_rejected() {
        let err = TelemetryMessage::from_json(r#"{
            "deviceId": "d1", "entityId": "m", "entityKind": "machine",
            "fields": { "temperature": 70 }
        }"#).unwrap_err();

        assert!(matches!(err, ValidationError::MissingField("sequence")));
    }

    #[test]
    fn test_text_in_numeric_field_is_rejected() {
        let err = TelemetryMessage::from_json(r#"{
            "deviceId": "d1", "entityId": "m", "entityKind": "machine", "sequence": 1,
            "fields": { "temperature": "hot" }
        }"#).unwrap_err();

        assert!(matches!(err, ValidationError::TypeMismatch { .. }));
    }

    #[test]
    fn test_unknown_kind_and_blank_ids() {
        let raw = RawTelemetry {
            device_id: Some("d1".into()),
            entity_id: Some("m".into()),
            entity_kind: Some("robot".into()),
            fields: Some(serde_json::Map::new()),
            sequence: Some(1),
            observed_at: None,
        };
        assert!(matches!(TelemetryMessage::try_from(raw), Err(ValidationError::UnknownEntityKind(_))));

        let raw = RawTelemetry {
            device_id: Some("  ".into()),
            ..Default::default()
        };
        assert!(matches!(TelemetryMessage::try_from(raw), Err(ValidationError::EmptyIdentifier("deviceId"))));
    }

    #[test]
    fn test_nested_values_are_unsupported() {
        let err = TelemetryMessage::from_json(r#"{
            "deviceId": "d1", "entityId": "m", "entityKind": "line", "sequence": 1,
            "fields": { "extra": { "a": 1 } }
        }"#).unwrap_err();

        assert!(matches!(err, ValidationError::UnsupportedValue { .. }));
    }
}
