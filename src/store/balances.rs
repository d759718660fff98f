//! Per-user share balances, merged by signed delta.

use alloy::primitives::{Address, I256};
use serde::Serialize;
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::warn;

use super::{StoreError, as_address_key, as_decimal, parse_address, parse_i256};
use crate::event::address_key;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserBalance {
    #[serde(serialize_with = "as_address_key")]
    pub user: Address,
    #[serde(serialize_with = "as_address_key")]
    pub vault: Address,
    #[serde(serialize_with = "as_decimal")]
    pub shares: I256,
}

#[derive(sqlx::FromRow)]
struct UserBalanceRow {
    user_address: String,
    vault_address: String,
    shares: String,
}

impl TryFrom<UserBalanceRow> for UserBalance {
    type Error = StoreError;

    fn try_from(row: UserBalanceRow) -> Result<Self, Self::Error> {
        Ok(Self {
            user: parse_address("user_address", &row.user_address)?,
            vault: parse_address("vault_address", &row.vault_address)?,
            shares: parse_i256("shares", &row.shares)?,
        })
    }
}

async fn load_shares(
    sql_tx: &mut Transaction<'_, Sqlite>,
    user: &str,
    vault: &str,
) -> Result<Option<I256>, StoreError> {
    let shares: Option<String> = sqlx::query_scalar(
        "SELECT shares FROM user_balances WHERE user_address = ? AND vault_address = ?",
    )
    .bind(user)
    .bind(vault)
    .fetch_optional(sql_tx.as_mut())
    .await?;

    shares.map(|shares| parse_i256("shares", &shares)).transpose()
}

/// Adds `delta` to the `(user, vault)` balance, creating it at `delta` when
/// absent. Returns the new balance.
///
/// Runs on the caller's transaction: the read and the
/// `INSERT .. ON CONFLICT DO UPDATE` see the same snapshot, so two merges
/// for the same key can never lose an update.
///
/// A negative result is stored as-is. During backfill a withdrawal can be
/// folded before the deposit that funds it has been seen; the balance
/// corrects itself once that deposit arrives.
pub(crate) async fn upsert_merge(
    sql_tx: &mut Transaction<'_, Sqlite>,
    user: &Address,
    vault: &Address,
    delta: I256,
) -> Result<I256, StoreError> {
    let user_key = address_key(user);
    let vault_key = address_key(vault);

    let existing = load_shares(sql_tx, &user_key, &vault_key).await?;
    let merged = existing
        .unwrap_or(I256::ZERO)
        .checked_add(delta)
        .ok_or(StoreError::BalanceOverflow {
            user: *user,
            vault: *vault,
        })?;

    if merged.is_negative() {
        warn!(
            user = %user_key,
            vault = %vault_key,
            shares = %merged,
            "User share balance is negative"
        );
    }

    sqlx::query(
        r#"
        INSERT INTO user_balances (user_address, vault_address, shares)
        VALUES (?, ?, ?)
        ON CONFLICT(user_address, vault_address) DO UPDATE SET
            shares = excluded.shares
        "#,
    )
    .bind(&user_key)
    .bind(&vault_key)
    .bind(merged.to_string())
    .execute(sql_tx.as_mut())
    .await?;

    Ok(merged)
}

/// Deletes the `(user, vault)` row. Used when a retraction brings a balance
/// back to a state that never existed on the canonical chain.
pub(crate) async fn delete(
    sql_tx: &mut Transaction<'_, Sqlite>,
    user: &Address,
    vault: &Address,
) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM user_balances WHERE user_address = ? AND vault_address = ?")
        .bind(address_key(user))
        .bind(address_key(vault))
        .execute(sql_tx.as_mut())
        .await?;

    Ok(())
}

pub(crate) async fn get(
    pool: &SqlitePool,
    user: &Address,
    vault: &Address,
) -> Result<Option<UserBalance>, StoreError> {
    let row: Option<UserBalanceRow> = sqlx::query_as(
        r#"
        SELECT user_address, vault_address, shares
        FROM user_balances
        WHERE user_address = ? AND vault_address = ?
        "#,
    )
    .bind(address_key(user))
    .bind(address_key(vault))
    .fetch_optional(pool)
    .await?;

    row.map(UserBalance::try_from).transpose()
}
