//! Flota simulada de la planta: cuatro máquinas, una línea y un sensor ambiente.
//!
//! Cada lectura oscila alrededor de un valor base. Con baja probabilidad una máquina
//! sufre una excursión térmica por encima del umbral crítico, para que las reglas de
//! fábrica tengan algo que detectar.


use rand::Rng;
use crate::message::domain::{EntityKind, FieldValue, Fields, TelemetryMessage};


#[derive(Debug, Clone, PartialEq)]
pub struct FieldProfile {
    pub name: &'static str,
    pub baseline: f64,
    /// Amplitud total del ruido: la lectura cae en `baseline ± jitter / 2`.
    pub jitter: f64,
    pub min: f64,
    pub max: f64,
}


impl FieldProfile {
    const fn new(name: &'static str, baseline: f64, jitter: f64, min: f64, max: f64) -> Self {
        Self { name, baseline, jitter, min, max }
    }
}


#[derive(Debug, Clone, PartialEq)]
pub struct DeviceProfile {
    pub device_id: String,
    pub entity_id: String,
    pub entity_kind: EntityKind,
    pub fields: Vec<FieldProfile>,
}


fn machine(id: &str, health: f64, temperature: f64, vibration: f64, production_rate: f64) -> DeviceProfile {
    DeviceProfile {
        device_id: format!("edge-{id}"),
        entity_id: id.to_string(),
        entity_kind: EntityKind::Machine,
        fields: vec![
            FieldProfile::new("health", health, 2.0, 0.0, 100.0),
            FieldProfile::new("temperature", temperature, 5.0, -40.0, 150.0),
            FieldProfile::new("vibration", vibration, 0.1, 0.0, 10.0),
            FieldProfile::new("productionRate", production_rate, 10.0, 0.0, 100.0),
        ],
    }
}


/// Dispositivos de la planta `factory-001`, con las lecturas base del piso de producción A.
pub fn factory_fleet() -> Vec<DeviceProfile> {
    vec![
        machine("cnc-milling-01", 87.0, 42.5, 0.23, 95.2),
        machine("robotic-arm-02", 92.0, 38.1, 0.15, 98.7),
        machine("assembly-line-03", 78.0, 45.8, 0.41, 82.3),
        machine("quality-control-04", 95.0, 35.2, 0.12, 99.1),
        DeviceProfile {
            device_id: "plc-line-a".into(),
            entity_id: "line-a".into(),
            entity_kind: EntityKind::Line,
            fields: vec![
                FieldProfile::new("oee", 0.78, 0.3, 0.0, 1.0),
                FieldProfile::new("throughput", 120.0, 20.0, 0.0, 500.0),
            ],
        },
        DeviceProfile {
            device_id: "env-sensor-01".into(),
            entity_id: "ambient-01".into(),
            entity_kind: EntityKind::Sensor,
            fields: vec![
                FieldProfile::new("temperature", 22.0, 1.5, -40.0, 80.0),
                FieldProfile::new("value", 45.0, 6.0, 0.0, 100.0),
            ],
        },
    ]
}


/// Un dispositivo simulado con su propio contador de secuencia.
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    profile: DeviceProfile,
    sequence: u64,
}


impl SimulatedDevice {
    pub fn new(profile: DeviceProfile) -> Self {
        Self { profile, sequence: 0 }
    }

    pub fn device_id(&self) -> &str {
        &self.profile.device_id
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Genera la próxima lectura. Con `excursion` la temperatura de una máquina
    /// salta por encima de 85 °C.
    pub fn next_reading<R: Rng + ?Sized>(&mut self, rng: &mut R, excursion: bool) -> TelemetryMessage {
        self.sequence += 1;

        let mut fields = Fields::new();
        for field in &self.profile.fields {
            let value = if excursion && field.name == "temperature" && self.profile.entity_kind == EntityKind::Machine {
                rng.random_range(86.0..95.0)
            } else {
                let noise = (rng.random::<f64>() - 0.5) * field.jitter;
                (field.baseline + noise).clamp(field.min, field.max)
            };
            fields.insert(field.name.to_string(), FieldValue::Number(value));
        }

        TelemetryMessage::new(self.profile.device_id.clone(),
                              self.profile.entity_id.clone(),
                              self.profile.entity_kind,
                              self.sequence,
                              fields)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_sequences_increase_per_device() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut device = SimulatedDevice::new(factory_fleet().remove(0));

        let first = device.next_reading(&mut rng, false);
        let second = device.next_reading(&mut rng, false);
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert_eq!(first.device_id, "edge-cnc-milling-01");
    }

    #[test]
    fn test_readings_stay_near_baseline() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut device = SimulatedDevice::new(factory_fleet().remove(0));

        for _ in 0..100 {
            let reading = device.next_reading(&mut rng, false);
            let temperature = reading.fields["temperature"].as_f64().unwrap();
            assert!((40.0..=45.0).contains(&temperature));
        }
    }

    #[test]
    fn test_excursion_breaches_critical_threshold() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut device = SimulatedDevice::new(factory_fleet().remove(1));

        let reading = device.next_reading(&mut rng, true);
        assert!(reading.fields["temperature"].as_f64().unwrap() > 85.0);
    }
}
