//! Módulo de persistencia para la última secuencia aplicada por dispositivo.
//!


use sqlx::{Executor, PgConnection, PgPool};
use crate::database::domain::{to_column, SequenceRow};
use crate::twin::domain::StoreError;


/// Crea la tabla `twin_sequence`.
///
/// # Schema
/// * `entity_id`: Entidad alimentada.
/// * `device_id`: Dispositivo que la alimenta.
/// * `last_sequence`: Última secuencia aplicada para el par.
pub async fn create_table_twin_sequence(pool: &PgPool) -> Result<(), sqlx::Error> {
    pool.execute(
        r#"
        CREATE TABLE IF NOT EXISTS twin_sequence (
            entity_id            TEXT NOT NULL,
            device_id            TEXT NOT NULL,
            last_sequence        BIGINT NOT NULL,
            PRIMARY KEY (entity_id, device_id)
        );
        "#
    )
        .await?;

    Ok(())
}


pub async fn upsert_sequence(conn: &mut PgConnection,
                             entity_id: &str,
                             device_id: &str,
                             sequence: u64) -> Result<(), StoreError> {

    sqlx::query(
        r#"
        INSERT INTO twin_sequence (entity_id, device_id, last_sequence)
        VALUES ($1, $2, $3)
        ON CONFLICT (entity_id, device_id) DO UPDATE
            SET last_sequence = EXCLUDED.last_sequence
        "#
    )
        .bind(entity_id)
        .bind(device_id)
        .bind(to_column(sequence, "sequence")?)
        .execute(conn)
        .await?;

    Ok(())
}


pub async fn select_sequences(pool: &PgPool) -> Result<Vec<SequenceRow>, sqlx::Error> {
    sqlx::query_as::<_, SequenceRow>(
        "SELECT entity_id, device_id, last_sequence FROM twin_sequence"
    )
        .fetch_all(pool)
        .await
}
