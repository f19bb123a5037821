use serde::Serialize;
use crate::metrics::domain::MetricsSnapshot;


/// Resumen del cierre del pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownReport {
    /// Mensajes aceptados que no llegaron a procesarse antes de cancelar los workers.
    pub messages_dropped: u64,
    /// Alertas que seguían activas al cerrar.
    pub open_alerts: usize,
    pub metrics: MetricsSnapshot,
}


impl ShutdownReport {
    /// `true` si todo lo aceptado se procesó.
    pub fn drained(&self) -> bool {
        self.messages_dropped == 0
    }
}
