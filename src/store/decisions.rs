//! Recommendation Store: append-only log of allocation decisions.

use alloy::primitives::Address;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Serialize, Serializer};
use sqlx::SqlitePool;
use std::collections::BTreeMap;

use super::{Page, StoreError, as_address_key, parse_address};
use crate::event::address_key;

/// A decision as produced by the Decision Engine, before it has an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAgentDecision {
    pub vault: Address,
    pub chain_id: u64,
    /// Strategy address to basis points.
    pub allocations: BTreeMap<Address, u64>,
    pub expected_apy_bp: u64,
    pub risk_score: f64,
    pub confidence: f64,
    pub reasoning: String,
    pub market_context: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentDecision {
    pub id: i64,
    #[serde(serialize_with = "as_address_key")]
    pub vault: Address,
    pub chain_id: u64,
    #[serde(serialize_with = "allocations_by_address_key")]
    pub allocations: BTreeMap<Address, u64>,
    pub expected_apy_bp: u64,
    pub risk_score: f64,
    pub confidence: f64,
    pub reasoning: String,
    pub market_context: String,
    pub created_at: DateTime<Utc>,
}

fn allocations_by_address_key<S: Serializer>(
    allocations: &BTreeMap<Address, u64>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_map(
        allocations
            .iter()
            .map(|(strategy, bp)| (address_key(strategy), bp)),
    )
}

#[derive(sqlx::FromRow)]
struct AgentDecisionRow {
    id: i64,
    vault_address: String,
    chain_id: i64,
    allocations: String,
    expected_apy_bp: i64,
    risk_score: f64,
    confidence: f64,
    reasoning: String,
    market_context: String,
    created_at: String,
}

impl TryFrom<AgentDecisionRow> for AgentDecision {
    type Error = StoreError;

    fn try_from(row: AgentDecisionRow) -> Result<Self, Self::Error> {
        let raw: BTreeMap<String, u64> = serde_json::from_str(&row.allocations)?;
        let allocations = raw
            .iter()
            .map(|(strategy, bp)| Ok((parse_address("allocations", strategy)?, *bp)))
            .collect::<Result<_, StoreError>>()?;

        let created_at = DateTime::parse_from_rfc3339(&row.created_at)
            .map_err(|_| StoreError::InvalidTimestamp {
                column: "created_at",
                value: row.created_at.clone(),
            })?
            .with_timezone(&Utc);

        Ok(Self {
            id: row.id,
            vault: parse_address("vault_address", &row.vault_address)?,
            chain_id: u64::try_from(row.chain_id)?,
            allocations,
            expected_apy_bp: u64::try_from(row.expected_apy_bp)?,
            risk_score: row.risk_score,
            confidence: row.confidence,
            reasoning: row.reasoning,
            market_context: row.market_context,
            created_at,
        })
    }
}

/// Fixed-width RFC 3339 so that `ORDER BY created_at` is chronological.
fn format_created_at(created_at: &DateTime<Utc>) -> String {
    created_at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[tracing::instrument(skip(pool, decision), fields(vault = %decision.vault), level = tracing::Level::DEBUG)]
pub(crate) async fn insert(
    pool: &SqlitePool,
    decision: &NewAgentDecision,
    created_at: DateTime<Utc>,
) -> Result<AgentDecision, StoreError> {
    let created_at = created_at.trunc_subsecs(6);
    let allocations: BTreeMap<String, u64> = decision
        .allocations
        .iter()
        .map(|(strategy, bp)| (address_key(strategy), *bp))
        .collect();

    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO agent_decisions (
            vault_address, chain_id, allocations, expected_apy_bp, risk_score,
            confidence, reasoning, market_context, created_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(address_key(&decision.vault))
    .bind(i64::try_from(decision.chain_id)?)
    .bind(serde_json::to_string(&allocations)?)
    .bind(i64::try_from(decision.expected_apy_bp)?)
    .bind(decision.risk_score)
    .bind(decision.confidence)
    .bind(&decision.reasoning)
    .bind(&decision.market_context)
    .bind(format_created_at(&created_at))
    .fetch_one(pool)
    .await?;

    Ok(AgentDecision {
        id,
        vault: decision.vault,
        chain_id: decision.chain_id,
        allocations: decision.allocations.clone(),
        expected_apy_bp: decision.expected_apy_bp,
        risk_score: decision.risk_score,
        confidence: decision.confidence,
        reasoning: decision.reasoning.clone(),
        market_context: decision.market_context.clone(),
        created_at,
    })
}

/// The decision with the greatest `created_at` for `vault`; ties go to the
/// later insert.
pub(crate) async fn latest(
    pool: &SqlitePool,
    vault: &Address,
) -> Result<Option<AgentDecision>, StoreError> {
    let row: Option<AgentDecisionRow> = sqlx::query_as(
        r#"
        SELECT
            id, vault_address, chain_id, allocations, expected_apy_bp, risk_score,
            confidence, reasoning, market_context, created_at
        FROM agent_decisions
        WHERE vault_address = ?
        ORDER BY created_at DESC, id DESC
        LIMIT 1
        "#,
    )
    .bind(address_key(vault))
    .fetch_optional(pool)
    .await?;

    row.map(AgentDecision::try_from).transpose()
}

pub(crate) async fn list(
    pool: &SqlitePool,
    vault: &Address,
    page: Page,
) -> Result<Vec<AgentDecision>, StoreError> {
    let rows: Vec<AgentDecisionRow> = sqlx::query_as(
        r#"
        SELECT
            id, vault_address, chain_id, allocations, expected_apy_bp, risk_score,
            confidence, reasoning, market_context, created_at
        FROM agent_decisions
        WHERE vault_address = ?
        ORDER BY created_at DESC, id DESC
        LIMIT ? OFFSET ?
        "#,
    )
    .bind(address_key(vault))
    .bind(page.limit)
    .bind(page.offset)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(AgentDecision::try_from).collect()
}
