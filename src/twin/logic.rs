//! Tabla de entidades con exclusión mutua por entidad y el store en memoria.
//!
//! Cada entidad tiene un candado de escritura asíncrono (serializa los
//! read-modify-write) y el estado confirmado detrás de un `RwLock` corto. El
//! escritor calcula el próximo estado sobre una copia, lo persiste si el backend lo
//! requiere y recién entonces lo publica; un lector nunca espera la I/O de un escritor.


use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error};
use crate::message::domain::{EntityKind, Fields};
use super::domain::{Merge, PatchResult, StoreError, TwinEntity, TwinPatch, TwinStore};


/// Un slot creado por un escritor queda oculto a los lectores hasta su primer
/// `commit`: si la persistencia falla no aparece un gemelo vacío.
struct TwinSlot {
    writer: Arc<Mutex<()>>,
    state: RwLock<Arc<TwinEntity>>,
    visible: AtomicBool,
}


impl TwinSlot {
    fn new(entity: TwinEntity, visible: bool) -> Self {
        Self {
            writer: Arc::new(Mutex::new(())),
            state: RwLock::new(Arc::new(entity)),
            visible: AtomicBool::new(visible),
        }
    }

    fn is_visible(&self) -> bool {
        self.visible.load(Ordering::Acquire)
    }

    fn reveal(&self) {
        self.visible.store(true, Ordering::Release);
    }

    fn current(&self) -> Arc<TwinEntity> {
        self.state.read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn publish(&self, entity: TwinEntity) {
        *self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(entity);
        self.reveal();
    }
}


/// Escritura preparada y aún no publicada. Mantiene tomado el candado de la entidad;
/// si se descarta sin `commit` el estado confirmado no cambia.
pub struct PendingWrite {
    slot: Arc<TwinSlot>,
    _guard: OwnedMutexGuard<()>,
    pub previous: Arc<TwinEntity>,
    pub next: TwinEntity,
    changed_fields: Option<Fields>,
}


impl PendingWrite {
    pub fn is_change(&self) -> bool {
        self.changed_fields.is_some()
    }

    pub fn commit(self) -> PatchResult {
        let version = self.next.version;
        let result = match self.changed_fields {
            Some(changed_fields) => PatchResult::Applied {
                version,
                changed_fields,
                snapshot: self.next.clone(),
            },
            None => PatchResult::Unchanged { version },
        };
        self.slot.publish(self.next);
        result
    }
}


pub enum Prepared {
    Stale { last_sequence: u64 },
    Write(PendingWrite),
}


#[derive(Default)]
pub struct TwinTable {
    slots: DashMap<String, Arc<TwinSlot>>,
    quarantined: DashMap<String, String>,
}


impl TwinTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, entity_id: &str, entity_kind: EntityKind) -> Arc<TwinSlot> {
        if let Some(slot) = self.slots.get(entity_id) {
            return slot.clone();
        }
        self.slots
            .entry(entity_id.to_string())
            .or_insert_with(|| {
                debug!("Debug: creando gemelo {} ({})", entity_id, entity_kind);
                Arc::new(TwinSlot::new(TwinEntity::new(entity_id, entity_kind, Utc::now()), false))
            })
            .clone()
    }

    /// Carga una entidad existente (hidratación desde un backend persistente).
    pub fn load(&self, entity: TwinEntity) {
        self.slots.insert(entity.entity_id.clone(), Arc::new(TwinSlot::new(entity, true)));
    }

    pub fn get_or_create(&self, entity_id: &str, entity_kind: EntityKind) -> Result<TwinEntity, StoreError> {
        self.check(entity_id)?;
        let slot = self.slot(entity_id, entity_kind);
        slot.reveal();
        Ok(slot.current().as_ref().clone())
    }

    /// Toma el candado de la entidad y calcula el próximo estado.
    pub async fn prepare(&self, patch: &TwinPatch) -> Result<Prepared, StoreError> {
        self.check(&patch.entity_id)?;

        let slot = self.slot(&patch.entity_id, patch.entity_kind);
        let guard = slot.writer.clone().lock_owned().await;

        // La cuarentena pudo llegar mientras se esperaba el candado.
        self.check(&patch.entity_id)?;

        let previous = slot.current();
        let (next, changed_fields) = match previous.merge(patch, Utc::now()) {
            Merge::Stale { last_sequence } => return Ok(Prepared::Stale { last_sequence }),
            Merge::Unchanged(next) => (next, None),
            Merge::Changed { next, changed_fields } => (next, Some(changed_fields)),
        };

        Ok(Prepared::Write(PendingWrite {
            slot,
            _guard: guard,
            previous,
            next,
            changed_fields,
        }))
    }

    pub fn snapshot(&self, entity_id: &str) -> Option<TwinEntity> {
        self.slots.get(entity_id)
            .filter(|slot| slot.is_visible())
            .map(|slot| slot.current().as_ref().clone())
    }

    pub fn entity_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.slots.iter()
            .filter(|entry| entry.value().is_visible())
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn quarantine(&self, entity_id: &str, reason: &str) {
        error!("Error: gemelo {} en cuarentena: {}", entity_id, reason);
        self.quarantined.insert(entity_id.to_string(), reason.to_string());
    }

    pub fn is_quarantined(&self, entity_id: &str) -> bool {
        self.quarantined.contains_key(entity_id)
    }

    fn check(&self, entity_id: &str) -> Result<(), StoreError> {
        if self.is_quarantined(entity_id) {
            return Err(StoreError::Quarantined(entity_id.to_string()));
        }
        Ok(())
    }
}


/// Store por defecto: el estado vive solo en memoria del proceso.
#[derive(Default)]
pub struct InMemoryTwinStore {
    table: TwinTable,
}


impl InMemoryTwinStore {
    pub fn new() -> Self {
        Self::default()
    }
}


#[async_trait]
impl TwinStore for InMemoryTwinStore {
    async fn get_or_create(&self, entity_id: &str, entity_kind: EntityKind) -> Result<TwinEntity, StoreError> {
        self.table.get_or_create(entity_id, entity_kind)
    }

    async fn apply_patch(&self, patch: &TwinPatch) -> Result<PatchResult, StoreError> {
        match self.table.prepare(patch).await? {
            Prepared::Stale { last_sequence } => Ok(PatchResult::Stale { last_sequence }),
            Prepared::Write(write) => Ok(write.commit()),
        }
    }

    async fn snapshot(&self, entity_id: &str) -> Option<TwinEntity> {
        self.table.snapshot(entity_id)
    }

    async fn entity_ids(&self) -> Vec<String> {
        self.table.entity_ids()
    }

    async fn quarantine(&self, entity_id: &str, reason: &str) {
        self.table.quarantine(entity_id, reason);
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::domain::FieldValue;

    fn patch(entity: &str, device: &str, sequence: u64, field: &str, value: f64) -> TwinPatch {
        let mut fields = Fields::new();
        fields.insert(field.to_string(), FieldValue::Number(value));
        TwinPatch {
            entity_id: entity.into(),
            entity_kind: EntityKind::Machine,
            device_id: device.into(),
            sequence,
            fields,
        }
    }

    #[tokio::test]
    async fn test_get_or_create_starts_empty() {
        let store = InMemoryTwinStore::new();
        let twin = store.get_or_create("m1", EntityKind::Machine).await.unwrap();
        assert_eq!(twin.version, 0);
        assert!(twin.properties.is_empty());
        assert_eq!(store.entity_ids().await, vec!["m1".to_string()]);
    }

    #[tokio::test]
    async fn test_apply_patch_and_replay() {
        let store = InMemoryTwinStore::new();

        let result = store.apply_patch(&patch("m1", "d1", 1, "temperature", 70.0)).await.unwrap();
        assert!(matches!(result, PatchResult::Applied { version: 1, .. }));

        let result = store.apply_patch(&patch("m1", "d1", 1, "temperature", 10.0)).await.unwrap();
        assert_eq!(result, PatchResult::Stale { last_sequence: 1 });

        let result = store.apply_patch(&patch("m1", "d1", 2, "temperature", 70.0)).await.unwrap();
        assert_eq!(result, PatchResult::Unchanged { version: 1 });

        let twin = store.snapshot("m1").await.unwrap();
        assert_eq!(twin.version, 1);
        assert_eq!(twin.last_sequence_for("d1"), Some(2));
        assert_eq!(twin.property("temperature"), Some(&FieldValue::Number(70.0)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_disjoint_patches_are_merged() {
        let store = Arc::new(InMemoryTwinStore::new());
        let mut handles = Vec::new();

        for device in 0..8u64 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for seq in 1..=25u64 {
                    let field = format!("field_{device}");
                    store.apply_patch(&patch("lineA", &format!("d{device}"), seq, &field, seq as f64))
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let twin = store.snapshot("lineA").await.unwrap();
        assert_eq!(twin.version, 8 * 25);
        for device in 0..8 {
            assert_eq!(twin.property(&format!("field_{device}")), Some(&FieldValue::Number(25.0)));
        }
    }

    #[tokio::test]
    async fn test_dropped_write_leaves_state_untouched() {
        let table = TwinTable::new();
        let Prepared::Write(write) = table.prepare(&patch("m1", "d1", 1, "temperature", 70.0)).await.unwrap() else {
            panic!("expected write");
        };
        assert!(write.is_change());
        drop(write);

        assert!(table.snapshot("m1").is_none());
        assert!(table.entity_ids().is_empty());

        let Prepared::Write(write) = table.prepare(&patch("m1", "d1", 1, "temperature", 70.0)).await.unwrap() else {
            panic!("expected write");
        };
        assert_eq!(write.previous.version, 0);
        write.commit();

        let twin = table.snapshot("m1").unwrap();
        assert_eq!(twin.version, 1);
        assert_eq!(table.entity_ids(), vec!["m1".to_string()]);
    }

    #[tokio::test]
    async fn test_quarantined_entity_rejects_writes() {
        let store = InMemoryTwinStore::new();
        store.quarantine("m1", "checksum mismatch").await;

        let err = store.apply_patch(&patch("m1", "d1", 1, "temperature", 70.0)).await.unwrap_err();
        assert_eq!(err, StoreError::Quarantined("m1".into()));

        let ok = store.apply_patch(&patch("m2", "d1", 1, "temperature", 70.0)).await;
        assert!(ok.is_ok());
    }
}
