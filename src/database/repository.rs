use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio::time::sleep;
use tracing::{error, info};
use crate::config::postgres::{CONNECT_ATTEMPTS, WAIT_FOR};
use crate::database::domain::sequences_by_entity;
use crate::database::tables::twin::{create_table_twin, select_twins, upsert_twin};
use crate::database::tables::twin_sequence::{create_table_twin_sequence, select_sequences, upsert_sequence};
use crate::message::domain::EntityKind;
use crate::twin::domain::{PatchResult, StoreError, TwinEntity, TwinPatch, TwinStore};
use crate::twin::logic::{Prepared, TwinTable};


/// `TwinStore` respaldado por PostgreSQL.
///
/// El estado confirmado se sirve desde memoria; cada parche se persiste en una
/// transacción (gemelo + secuencia del dispositivo) antes de publicarse.
pub struct PostgresTwinStore {
    pool: PgPool,
    table: TwinTable,
}


impl PostgresTwinStore {
    pub async fn new(database_url: &str, pool_size: u32) -> Result<Self, sqlx::Error> {
        let pool = create_pool(database_url, pool_size).await?;
        init_schema(&pool).await?;
        let store = Self { pool, table: TwinTable::new() };
        store.hydrate().await?;
        Ok(store)
    }

    /// Reintenta la conexión inicial unas pocas veces antes de rendirse.
    pub async fn connect(database_url: &str, pool_size: u32) -> Result<Self, sqlx::Error> {
        let mut attempt = 1;
        loop {
            match Self::new(database_url, pool_size).await {
                Ok(store) => return Ok(store),
                Err(e) if attempt < CONNECT_ATTEMPTS => {
                    error!("Error inicializando store Postgres (intento {}): {:?}", attempt, e);
                    attempt += 1;
                    sleep(WAIT_FOR).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Carga todos los gemelos persistidos. Las filas corruptas dejan a su entidad
    /// en cuarentena sin impedir la carga del resto.
    async fn hydrate(&self) -> Result<(), sqlx::Error> {
        let rows = select_twins(&self.pool).await?;
        let grouped = sequences_by_entity(select_sequences(&self.pool).await?);
        for (entity_id, reason) in &grouped.corrupt {
            self.table.quarantine(entity_id, reason);
        }
        let mut sequences = grouped.by_entity;

        let mut loaded = 0usize;
        for row in rows {
            let entity_id = row.entity_id.clone();
            if self.table.is_quarantined(&entity_id) {
                continue;
            }
            let entity_sequences = sequences.remove(&entity_id).unwrap_or_default();
            match row.into_entity(entity_sequences) {
                Ok(entity) => {
                    self.table.load(entity);
                    loaded += 1;
                }
                Err(e) => self.table.quarantine(&entity_id, &e.to_string()),
            }
        }

        info!("Info: {} gemelos cargados desde Postgres", loaded);
        Ok(())
    }

    async fn persist(&self,
                     next: &TwinEntity,
                     expected_version: u64,
                     device_id: &str,
                     sequence: u64) -> Result<(), StoreError> {

        let mut tx = self.pool.begin().await?;

        if !upsert_twin(&mut *tx, next, expected_version).await? {
            return Err(StoreError::Corrupt {
                entity_id: next.entity_id.clone(),
                reason: format!("stored version differs from expected {expected_version}"),
            });
        }
        upsert_sequence(&mut *tx, &next.entity_id, device_id, sequence).await?;

        tx.commit().await?;
        Ok(())
    }
}


#[async_trait]
impl TwinStore for PostgresTwinStore {
    async fn get_or_create(&self, entity_id: &str, entity_kind: EntityKind) -> Result<TwinEntity, StoreError> {
        self.table.get_or_create(entity_id, entity_kind)
    }

    async fn apply_patch(&self, patch: &TwinPatch) -> Result<PatchResult, StoreError> {
        match self.table.prepare(patch).await? {
            Prepared::Stale { last_sequence } => Ok(PatchResult::Stale { last_sequence }),
            Prepared::Write(write) => {
                self.persist(&write.next, write.previous.version, &patch.device_id, patch.sequence).await?;
                Ok(write.commit())
            }
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


async fn create_pool(db_path: &str, pool_size: u32) -> Result<PgPool, sqlx::Error> {
    let database_url = format!("postgres://{}", db_path);

    let pool = PgPoolOptions::new()
        .max_connections(pool_size)
        .acquire_timeout(WAIT_FOR)
        .connect(&database_url)
        .await?;

    Ok(pool)
}


async fn init_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    create_table_twin(pool).await?;
    create_table_twin_sequence(pool).await?;
    Ok(())
}
