//! Módulo de persistencia para el estado de los gemelos.
//!


use sqlx::{Executor, PgConnection, PgPool};
use sqlx::types::Json;
use crate::database::domain::{to_column, TwinRow};
use crate::twin::domain::{StoreError, TwinEntity};


/// Crea la tabla `twin` con el último estado confirmado de cada entidad.
///
/// # Schema
/// * `entity_id`: Identificador de la entidad (clave primaria).
/// * `entity_kind`: `machine`, `line`, `sensor` o `factory`.
/// * `properties`: Propiedades actuales como objeto JSON.
/// * `version`: Versión monotónica de la entidad.
/// * `updated_at`: Momento del último parche aplicado.
pub async fn create_table_twin(pool: &PgPool) -> Result<(), sqlx::Error> {
    pool.execute(
        r#"
        CREATE TABLE IF NOT EXISTS twin (
            entity_id            TEXT PRIMARY KEY,
            entity_kind          TEXT NOT NULL,
            properties           JSONB NOT NULL,
            version              BIGINT NOT NULL,
            updated_at           TIMESTAMPTZ NOT NULL
        );
        "#
    )
        .await?;

    Ok(())
}


/// Escribe el próximo estado solo si la fila sigue en `expected_version`.
///
/// # Retorno
/// * `true`: la fila se insertó o actualizó.
/// * `false`: la versión en base no coincide con la esperada.
pub async fn upsert_twin(conn: &mut PgConnection,
                         next: &TwinEntity,
                         expected_version: u64) -> Result<bool, StoreError> {

    let result = sqlx::query(
        r#"
        INSERT INTO twin (entity_id, entity_kind, properties, version, updated_at)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (entity_id) DO UPDATE
            SET properties = EXCLUDED.properties,
                version    = EXCLUDED.version,
                updated_at = EXCLUDED.updated_at
            WHERE twin.version = $6
        "#
    )
        .bind(&next.entity_id)
        .bind(next.entity_kind.as_str())
        .bind(Json(&next.properties))
        .bind(to_column(next.version, "version")?)
        .bind(next.updated_at)
        .bind(to_column(expected_version, "version")?)
        .execute(conn)
        .await?;

    Ok(result.rows_affected() == 1)
}


pub async fn select_twins(pool: &PgPool) -> Result<Vec<TwinRow>, sqlx::Error> {
    sqlx::query_as::<_, TwinRow>(
        "SELECT entity_id, entity_kind, properties, version, updated_at FROM twin"
    )
        .fetch_all(pool)
        .await
}
