//! Pipeline de telemetría de planta: ingreso particionado, proyección sobre
//! gemelos digitales y alertas por umbral.

pub mod alert;
pub mod channels;
pub mod config;
pub mod context;
pub mod database;
pub mod dead_letter;
pub mod heartbeat;
pub mod message;
pub mod metrics;
pub mod pipeline;
pub mod projection;
pub mod queue;
pub mod simulator;
pub mod system;
pub mod twin;
