//! Single-row record of the last block the indexer folded an event from.

use sqlx::{Sqlite, SqlitePool, Transaction};

use super::StoreError;

pub(crate) async fn get(pool: &SqlitePool) -> Result<Option<u64>, StoreError> {
    let block: Option<i64> =
        sqlx::query_scalar("SELECT block_number FROM indexer_cursor WHERE id = 1")
            .fetch_optional(pool)
            .await?;

    Ok(block.map(u64::try_from).transpose()?)
}

/// Moves the cursor forward to `block_number`. Never moves it back.
pub(crate) async fn advance(
    sql_tx: &mut Transaction<'_, Sqlite>,
    block_number: u64,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO indexer_cursor (id, block_number)
        VALUES (1, ?)
        ON CONFLICT(id) DO UPDATE SET
            block_number = MAX(block_number, excluded.block_number)
        "#,
    )
    .bind(i64::try_from(block_number)?)
    .execute(sql_tx.as_mut())
    .await?;

    Ok(())
}

/// Moves the cursor back to `block_number` if it is ahead of it. A missing
/// cursor stays missing.
pub(crate) async fn rewind(
    sql_tx: &mut Transaction<'_, Sqlite>,
    block_number: u64,
) -> Result<(), StoreError> {
    sqlx::query("UPDATE indexer_cursor SET block_number = MIN(block_number, ?) WHERE id = 1")
        .bind(i64::try_from(block_number)?)
        .execute(sql_tx.as_mut())
        .await?;

    Ok(())
}
