//! Per-vault rebalance claims shared by every process on the database, so
//! the server's scheduler and an operator CLI never send at the same time.

use alloy::primitives::Address;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::time::Duration;

use super::StoreError;
use crate::event::address_key;

/// Takes the claim on `vault` for `holder`. A claim older than `ttl` is
/// taken over; one held by a crashed process expires instead of blocking
/// the vault forever.
///
/// Returns false when another holder's claim is still live.
pub(crate) async fn try_claim(
    pool: &SqlitePool,
    vault: &Address,
    holder: &str,
    now: DateTime<Utc>,
    ttl: Duration,
) -> Result<bool, StoreError> {
    let ttl_secs = i64::try_from(ttl.as_secs())?;
    let now = now.timestamp();

    let result = sqlx::query(
        r#"
        INSERT INTO rebalance_claims (vault_address, holder, claimed_at)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(vault_address) DO UPDATE SET
            holder = excluded.holder,
            claimed_at = excluded.claimed_at
        WHERE rebalance_claims.claimed_at <= ?3 - ?4
        "#,
    )
    .bind(address_key(vault))
    .bind(holder)
    .bind(now)
    .bind(ttl_secs)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Drops `holder`'s claim on `vault`. A claim another holder has since taken
/// over is left alone.
pub(crate) async fn release(
    pool: &SqlitePool,
    vault: &Address,
    holder: &str,
) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM rebalance_claims WHERE vault_address = ? AND holder = ?")
        .bind(address_key(vault))
        .bind(holder)
        .execute(pool)
        .await?;

    Ok(())
}
