//! Estructuras de dominio para los mensajes descartados tras agotar sus entregas.
//!
//! El buffer acumula dead-letters en memoria y se vuelca en bloque, igual que las
//! escrituras masivas: al llenarse, por intervalo o al cerrar el pipeline.


use chrono::{DateTime, Utc};
use serde::Serialize;
use crate::config::dead_letter::BATCH_SIZE;
use crate::message::domain::TelemetryMessage;


#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub message: TelemetryMessage,
    pub reason: String,
    pub attempts: u32,
    pub dead_lettered_at: DateTime<Utc>,
}


impl DeadLetter {
    pub fn new(message: TelemetryMessage, reason: impl Into<String>, attempts: u32) -> Self {
        Self {
            message,
            reason: reason.into(),
            attempts,
            dead_lettered_at: Utc::now(),
        }
    }
}


#[derive(Debug, Default)]
pub struct DeadLetterBuffer {
    pub entries: Vec<DeadLetter>,
}


impl DeadLetterBuffer {

    /// Crea el buffer con la capacidad de un lote pre-reservada.
    pub fn new() -> Self {
        Self { entries: Vec::with_capacity(BATCH_SIZE) }
    }

    pub fn push(&mut self, entry: DeadLetter) {
        self.entries.push(entry);
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= BATCH_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serializa el lote como JSON-lines y vacía el buffer sin liberar su capacidad.
    pub fn drain_lines(&mut self) -> String {
        let mut lines = String::new();
        for entry in self.entries.drain(..) {
            match serde_json::to_string(&entry) {
                Ok(line) => {
                    lines.push_str(&line);
                    lines.push('\n');
                }
                Err(e) => tracing::error!("Error: dead-letter no serializable: {}", e),
            }
        }
        lines
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::domain::{EntityKind, Fields};

    #[test]
    fn test_drain_lines_emits_one_json_object_per_entry() {
        let mut buffer = DeadLetterBuffer::new();
        for seq in 1..=3 {
            let msg = TelemetryMessage::new("d1", "m", EntityKind::Machine, seq, Fields::new());
            buffer.push(DeadLetter::new(msg, "store unavailable", 5));
        }

        let lines = buffer.drain_lines();
        assert_eq!(lines.lines().count(), 3);
        assert!(buffer.is_empty());

        let first: serde_json::Value = serde_json::from_str(lines.lines().next().unwrap()).unwrap();
        assert_eq!(first["attempts"], 5);
        assert_eq!(first["message"]["sequence"], 1);
    }
}
