//! Transaction state machine and idempotency cache.
//!
//! States: pending -> negotiating -> negotiated -> confirmed (terminal);
//! any non-terminal state -> failed (terminal). `set_status` is the single
//! authoritative status mutator.

use crate::{
    error::{GatewayError, Result},
    model::{EngineOutcome, ExecutionResult, Offer, Transaction, TransactionStatus},
    TransactionId,
};
use chrono::{Duration, Utc};
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Outcome of trying to claim the execution slot for an idempotency key.
/// The slot is the (request_id, execution_type) row itself: inserting it
/// with a NULL result reserves it, filling in the result completes it.
#[derive(Debug)]
pub enum ExecutionClaim {
    /// The caller owns the slot and must perform the execution.
    Claimed,
    /// A completed result already exists under this key.
    Completed(ExecutionResult),
    /// Another caller holds the slot and has not finished yet.
    InFlight,
}

#[derive(Clone)]
pub struct TransactionStore {
    pool: SqlitePool,
}

impl TransactionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a transaction for a request, deduplicating on `request_id`.
    /// A repeat create for the same id returns the existing transaction;
    /// the UNIQUE constraint provides mutual exclusion for simultaneous
    /// creates.
    pub async fn create_transaction(
        &self,
        request_id: &str,
        agent_id: &str,
        property_id: &str,
    ) -> Result<Transaction> {
        let tx = Transaction::new(
            request_id.to_string(),
            agent_id.to_string(),
            property_id.to_string(),
        );

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO transactions
                (tx_id, request_id, agent_id, property_id, session_id, status,
                 negotiation_round, current_offer, created_at, updated_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(tx.tx_id.to_string())
        .bind(&tx.request_id)
        .bind(&tx.agent_id)
        .bind(&tx.property_id)
        .bind(tx.session_id.to_string())
        .bind(tx.status.as_str())
        .bind(tx.negotiation_round)
        .bind(Option::<String>::None)
        .bind(tx.created_at)
        .bind(tx.updated_at)
        .bind(tx.expires_at)
        .execute(&self.pool)
        .await?;

        self.get_transaction_by_request_id(request_id)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("Transaction for request {request_id}")))
    }

    pub async fn get_transaction(&self, tx_id: TransactionId) -> Result<Option<Transaction>> {
        let row = sqlx::query(&format!("{SELECT_TX} WHERE tx_id = ?"))
            .bind(tx_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_transaction).transpose()
    }

    pub async fn get_transaction_by_request_id(
        &self,
        request_id: &str,
    ) -> Result<Option<Transaction>> {
        let row = sqlx::query(&format!("{SELECT_TX} WHERE request_id = ?"))
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_transaction).transpose()
    }

    /// Resolve the most recently updated transaction still negotiating under
    /// the given session id, so a negotiation can resume across stateless
    /// round trips.
    pub async fn get_transaction_by_session_id(
        &self,
        session_id: Uuid,
    ) -> Result<Option<Transaction>> {
        let row = sqlx::query(&format!(
            "{SELECT_TX} WHERE session_id = ? AND status = 'negotiating' ORDER BY updated_at DESC LIMIT 1"
        ))
        .bind(session_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_transaction).transpose()
    }

    /// Resolve the most recently updated transaction in `negotiated` state
    /// for a session: the continuation target for an execute intent.
    pub async fn get_executable_transaction(&self, session_id: Uuid) -> Result<Option<Transaction>> {
        let row = sqlx::query(&format!(
            "{SELECT_TX} WHERE session_id = ? AND status = 'negotiated' ORDER BY updated_at DESC LIMIT 1"
        ))
        .bind(session_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_transaction).transpose()
    }

    /// The single authoritative status mutator. Rejects transitions out of
    /// terminal states and any move the state machine does not define.
    pub async fn set_status(
        &self,
        tx_id: TransactionId,
        status: TransactionStatus,
    ) -> Result<()> {
        let current = self
            .get_transaction(tx_id)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("Transaction {tx_id}")))?;

        if !transition_allowed(current.status, status) {
            return Err(GatewayError::StateConflict(format!(
                "Illegal transition {} -> {}",
                current.status.as_str(),
                status.as_str()
            )));
        }

        sqlx::query("UPDATE transactions SET status = ?, updated_at = ? WHERE tx_id = ?")
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(tx_id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Map a negotiation-engine outcome onto the state machine:
    /// counter/accepted -> negotiating, negotiated -> negotiated (snapshots
    /// the agreed offer), confirmed -> confirmed, everything else -> failed.
    pub async fn update_transaction_from_result(
        &self,
        tx: &Transaction,
        result: &EngineOutcome,
    ) -> Result<Transaction> {
        let status = match result {
            EngineOutcome::Counter(_) | EngineOutcome::Accepted(_) => TransactionStatus::Negotiating,
            EngineOutcome::Negotiated(_) => TransactionStatus::Negotiated,
            EngineOutcome::Confirmed => TransactionStatus::Confirmed,
            EngineOutcome::Rejected(_) | EngineOutcome::Error(_) | EngineOutcome::Timeout => {
                TransactionStatus::Failed
            }
        };

        let offer = match result {
            EngineOutcome::Counter(o) | EngineOutcome::Accepted(o) | EngineOutcome::Negotiated(o) => {
                Some(o.clone())
            }
            _ => tx.current_offer.clone(),
        };

        let offer_json = offer
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            "UPDATE transactions SET negotiation_round = ?, current_offer = ?, updated_at = ? WHERE tx_id = ?",
        )
        .bind(tx.negotiation_round)
        .bind(offer_json)
        .bind(Utc::now())
        .bind(tx.tx_id.to_string())
        .execute(&self.pool)
        .await?;

        self.set_status(tx.tx_id, status).await?;

        self.get_transaction(tx.tx_id)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("Transaction {}", tx.tx_id)))
    }

    /// Look up the canonical cached result for a (request_id, execution_type)
    /// pair. A hit with a different payload hash means the caller reused an
    /// idempotency key for a different request, which is a conflict.
    pub async fn get_idempotent_result(
        &self,
        request_id: &str,
        execution_type: &str,
        payload_hash: &str,
    ) -> Result<Option<ExecutionResult>> {
        let row = sqlx::query(
            "SELECT payload_hash, result FROM idempotency_records WHERE request_id = ? AND execution_type = ?",
        )
        .bind(request_id)
        .bind(execution_type)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };

        let stored_hash: String = row.get(0);
        if stored_hash != payload_hash {
            return Err(GatewayError::StateConflict(format!(
                "request_id {request_id} was already used with a different payload"
            )));
        }

        match row.get::<Option<String>, _>(1) {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            // claimed but not completed yet; the claimer will fill it in
            None => Ok(None),
        }
    }

    /// Reserve the execution slot for an idempotency key before any side
    /// effect happens. The primary key on (request_id, execution_type) makes
    /// exactly one concurrent caller the winner; everyone else sees the
    /// claim in flight, or the completed result once it lands.
    pub async fn claim_execution(
        &self,
        request_id: &str,
        execution_type: &str,
        payload_hash: &str,
    ) -> Result<ExecutionClaim> {
        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO idempotency_records
                (request_id, execution_type, payload_hash, result, created_at)
            VALUES (?, ?, ?, NULL, ?)
            "#,
        )
        .bind(request_id)
        .bind(execution_type)
        .bind(payload_hash)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 1 {
            return Ok(ExecutionClaim::Claimed);
        }

        let row = sqlx::query(
            "SELECT payload_hash, result FROM idempotency_records WHERE request_id = ? AND execution_type = ?",
        )
        .bind(request_id)
        .bind(execution_type)
        .fetch_optional(&self.pool)
        .await?;

        // the holder may have released between our insert and this read;
        // the caller retries and claims on the next attempt
        let Some(row) = row else { return Ok(ExecutionClaim::InFlight) };

        let stored_hash: String = row.get(0);
        if stored_hash != payload_hash {
            return Err(GatewayError::StateConflict(format!(
                "request_id {request_id} was already used with a different payload"
            )));
        }

        match row.get::<Option<String>, _>(1) {
            Some(json) => Ok(ExecutionClaim::Completed(serde_json::from_str(&json)?)),
            None => Ok(ExecutionClaim::InFlight),
        }
    }

    /// Release an unfinished claim after a failed execution. Failures are
    /// never cached, so the same request_id stays retryable.
    pub async fn release_claim(&self, request_id: &str, execution_type: &str) -> Result<()> {
        sqlx::query(
            "DELETE FROM idempotency_records WHERE request_id = ? AND execution_type = ? AND result IS NULL",
        )
        .bind(request_id)
        .bind(execution_type)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Cache a successful execution (or valid dry-run), completing the
    /// caller's claim if one is open.
    pub async fn store_idempotent_result(
        &self,
        request_id: &str,
        execution_type: &str,
        payload_hash: &str,
        result: &ExecutionResult,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO idempotency_records
                (request_id, execution_type, payload_hash, result, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (request_id, execution_type) DO UPDATE SET result = excluded.result
            "#,
        )
        .bind(request_id)
        .bind(execution_type)
        .bind(payload_hash)
        .bind(serde_json::to_string(result)?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Retention-bounded garbage collection of idempotency records.
    pub async fn cleanup_old_idempotency_records(&self, days: u32) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(days as i64);
        let result = sqlx::query("DELETE FROM idempotency_records WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// Deterministic hash binding an idempotency record to its request payload.
pub fn payload_hash(payload: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

fn transition_allowed(from: TransactionStatus, to: TransactionStatus) -> bool {
    use TransactionStatus::*;
    if from.is_terminal() {
        return false;
    }
    match (from, to) {
        (Pending, Negotiating) => true,
        // an opening offer that already fits the caller's budget closes
        // the negotiation in a single round
        (Pending, Negotiated) => true,
        (Negotiating, Negotiating) => true,
        (Negotiating, Negotiated) => true,
        (Negotiated, Confirmed) => true,
        (_, Failed) => true,
        _ => false,
    }
}

const SELECT_TX: &str = r#"
    SELECT tx_id, request_id, agent_id, property_id, session_id, status,
           negotiation_round, current_offer, created_at, updated_at, expires_at
    FROM transactions
"#;

fn row_to_transaction(row: sqlx::sqlite::SqliteRow) -> Result<Transaction> {
    let current_offer: Option<Offer> = row
        .get::<Option<String>, _>(7)
        .map(|s| serde_json::from_str(&s))
        .transpose()?;

    Ok(Transaction {
        tx_id: TransactionId::parse_str(&row.get::<String, _>(0))?,
        request_id: row.get(1),
        agent_id: row.get(2),
        property_id: row.get(3),
        session_id: Uuid::parse_str(&row.get::<String, _>(4))?,
        status: TransactionStatus::parse(&row.get::<String, _>(5))?,
        negotiation_round: row.get::<i64, _>(6) as u32,
        current_offer,
        created_at: row.get(8),
        updated_at: row.get(9),
        expires_at: row.get(10),
    })
}
