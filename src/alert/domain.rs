//! Dominio de alertas: reglas de umbral, eventos y la interfaz del sink externo.
//!
//! Las reglas son datos. Se indexan por `(entity_kind, field)` y pueden
//! reemplazarse en caliente sin detener el pipeline.


use std::collections::{HashMap, HashSet};
use std::path::Path;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use xxhash_rust::xxh64::Xxh64;
use crate::message::domain::EntityKind;


#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}


#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertState {
    Open,
    Suppressed,
    Resolved,
}


#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertEvent {
    pub alert_id: String,
    pub entity_id: String,
    pub rule_id: String,
    pub severity: Severity,
    pub message: String,
    pub raised_at: DateTime<Utc>,
    pub value: f64,
    pub state: AlertState,
}


/// Transición emitida por el evaluador. Cada variante lleva el evento completo
/// (incluido su `alert_id`) para que el sink no necesite estado propio.
#[derive(Debug, Clone, PartialEq)]
pub enum AlertTransition {
    Raise(AlertEvent),
    Refresh(AlertEvent),
    Resolve(AlertEvent),
}


impl AlertTransition {
    pub fn event(&self) -> &AlertEvent {
        match self {
            AlertTransition::Raise(e) | AlertTransition::Refresh(e) | AlertTransition::Resolve(e) => e,
        }
    }

    pub fn alert_id(&self) -> &str {
        &self.event().alert_id
    }

    pub fn label(&self) -> &'static str {
        match self {
            AlertTransition::Raise(_) => "raise",
            AlertTransition::Refresh(_) => "refresh",
            AlertTransition::Resolve(_) => "resolve",
        }
    }
}


/// Identificador determinista de una alerta, estable entre ejecuciones y toolchains.
pub fn alert_id(entity_id: &str, rule_id: &str, version: u64) -> String {
    let mut hasher = Xxh64::new(0);
    hasher.update(entity_id.as_bytes());
    hasher.update(&[0]);
    hasher.update(rule_id.as_bytes());
    hasher.update(&[0]);
    hasher.update(&version.to_le_bytes());
    format!("{:016x}", hasher.digest())
}


#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparison {
    Gt,
    Ge,
    Lt,
    Le,
}


impl Comparison {
    fn symbol(&self) -> &'static str {
        match self {
            Comparison::Gt => ">",
            Comparison::Ge => ">=",
            Comparison::Lt => "<",
            Comparison::Le => "<=",
        }
    }
}


/// Qué hacer cuando una alerta activa vuelve a dispararse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeatPolicy {
    /// Emitir `Refresh` como mucho una vez por intervalo.
    #[default]
    Refresh,
    /// No emitir nada hasta que se resuelva.
    Suppress,
}


#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub rule_id: String,
    pub entity_kind: EntityKind,
    pub field: String,
    pub comparison: Comparison,
    pub threshold: f64,
    pub severity: Severity,
    #[serde(default)]
    pub repeat: RepeatPolicy,
    #[serde(default)]
    pub message: Option<String>,
}


impl Rule {
    pub fn new(rule_id: &str,
               entity_kind: EntityKind,
               field: &str,
               comparison: Comparison,
               threshold: f64,
               severity: Severity) -> Self {
        Self {
            rule_id: rule_id.to_string(),
            entity_kind,
            field: field.to_string(),
            comparison,
            threshold,
            severity,
            repeat: RepeatPolicy::Refresh,
            message: None,
        }
    }

    pub fn with_repeat(mut self, repeat: RepeatPolicy) -> Self {
        self.repeat = repeat;
        self
    }

    pub fn breached(&self, value: f64) -> bool {
        match self.comparison {
            Comparison::Gt => value > self.threshold,
            Comparison::Ge => value >= self.threshold,
            Comparison::Lt => value < self.threshold,
            Comparison::Le => value <= self.threshold,
        }
    }

    pub fn describe(&self, entity_id: &str, value: f64) -> String {
        match &self.message {
            Some(text) => format!("{entity_id}: {text} ({} = {value})", self.field),
            None => format!("{entity_id}: {} {value} {} {}",
                            self.field, self.comparison.symbol(), self.threshold),
        }
    }
}


#[derive(Debug, Error)]
pub enum RuleError {
    #[error("cannot read rules: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse rules: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("duplicate rule id: {0}")]
    DuplicateRule(String),

    #[error("rule {0} has a non-finite threshold")]
    InvalidThreshold(String),
}


#[derive(Debug, Deserialize)]
struct RuleFile {
    rules: Vec<Rule>,
}


/// Conjunto inmutable de reglas. Se reemplaza entero en cada recarga.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
    index: HashMap<(EntityKind, String), Vec<usize>>,
}


impl RuleSet {
    pub fn new(rules: Vec<Rule>) -> Result<Self, RuleError> {
        let mut seen = HashSet::new();
        let mut index: HashMap<(EntityKind, String), Vec<usize>> = HashMap::new();

        for (position, rule) in rules.iter().enumerate() {
            if !seen.insert(rule.rule_id.clone()) {
                return Err(RuleError::DuplicateRule(rule.rule_id.clone()));
            }
            if !rule.threshold.is_finite() {
                return Err(RuleError::InvalidThreshold(rule.rule_id.clone()));
            }
            index.entry((rule.entity_kind, rule.field.clone())).or_default().push(position);
        }

        Ok(Self { rules, index })
    }

    /// Formato: `{ "rules": [ { "ruleId": ..., "entityKind": ..., "field": ..., ... } ] }`.
    pub fn from_json(payload: &str) -> Result<Self, RuleError> {
        let file: RuleFile = serde_json::from_str(payload)?;
        Self::new(file.rules)
    }

    pub async fn load(path: &Path) -> Result<Self, RuleError> {
        let payload = tokio::fs::read_to_string(path).await?;
        Self::from_json(&payload)
    }

    /// Reglas de fábrica, tomadas de los chequeos de anomalías del simulador de planta.
    pub fn factory_defaults() -> Self {
        use Comparison::*;
        use EntityKind::*;
        use Severity::*;

        let rules = vec![
            Rule::new("temperature-critical", Machine, "temperature", Gt, 85.0, Critical),
            Rule::new("temperature-warning", Machine, "temperature", Gt, 75.0, Warning),
            Rule::new("vibration-high", Machine, "vibration", Gt, 0.4, Warning),
            Rule::new("health-critical", Machine, "health", Lt, 70.0, Critical),
            Rule::new("health-degraded", Machine, "health", Lt, 80.0, Warning),
            Rule::new("oee-low", Line, "oee", Lt, 0.6, Warning),
        ];

        Self::new(rules).unwrap_or_default()
    }

    pub fn rules_for<'a>(&'a self, kind: EntityKind, field: &str) -> impl Iterator<Item = &'a Rule> + 'a {
        self.index
            .get(&(kind, field.to_string()))
            .into_iter()
            .flatten()
            .map(|&position| &self.rules[position])
    }

    pub fn contains(&self, rule_id: &str) -> bool {
        self.rules.iter().any(|r| r.rule_id == rule_id)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}


#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("alert sink unavailable: {0}")]
    Unavailable(String),

    #[error("alert rejected by sink: {0}")]
    Rejected(String),
}


/// Destino externo de las alertas (notificaciones push, base de datos, bus de mensajes).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn publish(&self, alert: &AlertEvent) -> Result<(), SinkError>;
}
