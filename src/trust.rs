//! Trust layer: agent identity, sliding-window rate limiting, and
//! authorization policy. Fails closed for unknown or suspended agents.

use crate::{
    error::{GatewayError, Result},
    model::{AcpRequest, AgentIdentity, Intent, VerificationStatus},
};
use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, SqlitePool};

/// Width of the rolling rate-limit window.
const RATE_WINDOW_SECS: i64 = 60;

#[derive(Debug, Clone)]
pub struct AuthOutcome {
    pub identity: AgentIdentity,
    pub rate_limit_remaining: u32,
}

#[derive(Clone)]
pub struct Authenticator {
    pool: SqlitePool,
    min_execute_reputation: f64,
}

impl Authenticator {
    pub fn new(pool: SqlitePool, min_execute_reputation: f64) -> Self {
        Self {
            pool,
            min_execute_reputation,
        }
    }

    /// Register a new agent identity. Returns false without overwriting if
    /// the agent id is already taken.
    pub async fn register_agent(&self, identity: &AgentIdentity) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO agents
                (agent_id, name, verification_status, reputation_score,
                 allowed_domains, blocked_entities, requests_per_minute,
                 created_at, last_active)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&identity.agent_id)
        .bind(&identity.name)
        .bind(identity.verification_status.as_str())
        .bind(identity.reputation_score)
        .bind(serde_json::to_string(&identity.allowed_domains)?)
        .bind(serde_json::to_string(&identity.blocked_entities)?)
        .bind(identity.requests_per_minute)
        .bind(identity.created_at)
        .bind(identity.last_active)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn get_agent(&self, agent_id: &str) -> Result<Option<AgentIdentity>> {
        let row = sqlx::query(
            r#"
            SELECT agent_id, name, verification_status, reputation_score,
                   allowed_domains, blocked_entities, requests_per_minute,
                   created_at, last_active
            FROM agents WHERE agent_id = ?
            "#,
        )
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_agent).transpose()
    }

    /// Verify the caller's identity and rate budget. Only verified agents
    /// pass; pending, rejected, and suspended identities fail closed.
    /// Updates `last_active` on success.
    pub async fn authenticate(&self, request: &AcpRequest) -> Result<AuthOutcome> {
        let identity = self
            .get_agent(&request.agent_id)
            .await?
            .ok_or_else(|| GatewayError::Authentication(format!("Unknown agent: {}", request.agent_id)))?;

        match identity.verification_status {
            VerificationStatus::Verified => {}
            VerificationStatus::Suspended => {
                return Err(GatewayError::Authentication(format!(
                    "Agent {} is suspended",
                    identity.agent_id
                )))
            }
            VerificationStatus::Pending | VerificationStatus::Rejected => {
                return Err(GatewayError::Authentication(format!(
                    "Agent {} is not verified",
                    identity.agent_id
                )))
            }
        }

        let used = self.requests_in_window(&identity.agent_id, Utc::now()).await?;
        if used >= identity.requests_per_minute {
            return Err(GatewayError::RateLimited(used));
        }

        sqlx::query("UPDATE agents SET last_active = ? WHERE agent_id = ?")
            .bind(Utc::now())
            .bind(&identity.agent_id)
            .execute(&self.pool)
            .await?;

        Ok(AuthOutcome {
            rate_limit_remaining: identity.requests_per_minute - used,
            identity,
        })
    }

    /// Policy check: target domain allowed, target entity not blocked, and
    /// enough reputation to execute. Low-trust agents may query and
    /// negotiate but not commit funds.
    pub fn authorize(
        &self,
        identity: &AgentIdentity,
        request: &AcpRequest,
        intent: &Intent,
    ) -> Result<()> {
        if !identity.may_target_domain(&request.target_domain) {
            return Err(GatewayError::Authorization(format!(
                "Agent {} may not target domain {}",
                identity.agent_id, request.target_domain
            )));
        }

        if identity
            .blocked_entities
            .iter()
            .any(|e| e == &request.target_entity_id)
        {
            return Err(GatewayError::Authorization(format!(
                "Agent {} is blocked from entity {}",
                identity.agent_id, request.target_entity_id
            )));
        }

        if matches!(intent, Intent::Execute(_))
            && identity.reputation_score < self.min_execute_reputation
        {
            return Err(GatewayError::Authorization(format!(
                "Reputation {:.2} below execute threshold {:.2}",
                identity.reputation_score, self.min_execute_reputation
            )));
        }

        Ok(())
    }

    /// Append a request-log row after a completed round trip. The log feeds
    /// both the sliding-window rate limiter and analytics.
    pub async fn log_request(
        &self,
        agent_id: &str,
        intent_type: &str,
        target_entity_id: &str,
        status_code: u16,
        latency_ms: u64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO request_log
                (agent_id, intent_type, target_entity_id, status_code, latency_ms, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(agent_id)
        .bind(intent_type)
        .bind(target_entity_id)
        .bind(status_code)
        .bind(latency_ms as i64)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Admin-only: flip an agent's verification status. Suspension
    /// invalidates all future authentication immediately.
    pub async fn set_verification_status(
        &self,
        agent_id: &str,
        status: VerificationStatus,
    ) -> Result<bool> {
        let result = sqlx::query("UPDATE agents SET verification_status = ? WHERE agent_id = ?")
            .bind(status.as_str())
            .bind(agent_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Write a reputation score computed out of band (analytics pipeline or
    /// admin override). Clamped into [0, 1].
    pub async fn set_reputation(&self, agent_id: &str, score: f64) -> Result<bool> {
        let result = sqlx::query("UPDATE agents SET reputation_score = ? WHERE agent_id = ?")
            .bind(score.clamp(0.0, 1.0))
            .bind(agent_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn requests_in_window(&self, agent_id: &str, now: DateTime<Utc>) -> Result<u32> {
        let window_start = now - Duration::seconds(RATE_WINDOW_SECS);
        let row = sqlx::query(
            "SELECT COUNT(*) FROM request_log WHERE agent_id = ? AND created_at > ?",
        )
        .bind(agent_id)
        .bind(window_start)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get::<i64, _>(0) as u32)
    }
}

fn row_to_agent(row: sqlx::sqlite::SqliteRow) -> Result<AgentIdentity> {
    let allowed_domains: Vec<String> = serde_json::from_str(&row.get::<String, _>(4))?;
    let blocked_entities: Vec<String> = serde_json::from_str(&row.get::<String, _>(5))?;

    Ok(AgentIdentity {
        agent_id: row.get(0),
        name: row.get(1),
        verification_status: VerificationStatus::parse(&row.get::<String, _>(2))?,
        reputation_score: row.get(3),
        allowed_domains,
        blocked_entities,
        requests_per_minute: row.get::<i64, _>(6) as u32,
        created_at: row.get(7),
        last_active: row.get(8),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AgentContext, Constraints, AvailabilityQuery, ExecutePayload, PROTOCOL_VERSION};
    use tempfile::NamedTempFile;

    async fn setup() -> (NamedTempFile, Authenticator) {
        let temp = NamedTempFile::new().unwrap();
        let url = format!("sqlite://{}", temp.path().to_string_lossy());
        let pool = crate::db::connect(&url).await.unwrap();
        (temp, Authenticator::new(pool, 0.3))
    }

    fn verified_agent(agent_id: &str, rpm: u32) -> AgentIdentity {
        let mut identity = AgentIdentity::new_pending(
            agent_id.to_string(),
            "Test Agent".to_string(),
            vec!["hospitality".to_string()],
        );
        identity.verification_status = VerificationStatus::Verified;
        identity.requests_per_minute = rpm;
        identity
    }

    fn request_for(agent_id: &str) -> AcpRequest {
        AcpRequest {
            protocol_version: PROTOCOL_VERSION.to_string(),
            request_id: "req-1".to_string(),
            timestamp: Utc::now(),
            agent_id: agent_id.to_string(),
            agent_signature: None,
            target_domain: "hospitality".to_string(),
            target_entity_id: "prop-1".to_string(),
            intent_type: "query".to_string(),
            intent_payload: serde_json::Value::Null,
            constraints: Constraints::default(),
            agent_context: AgentContext::default(),
        }
    }

    fn query_intent() -> Intent {
        Intent::Query(AvailabilityQuery {
            check_in: "2026-09-01".parse().unwrap(),
            check_out: "2026-09-03".parse().unwrap(),
            room_type: None,
            guests: None,
        })
    }

    fn execute_intent() -> Intent {
        Intent::Execute(ExecutePayload {
            guest_name: "Guest".to_string(),
            guest_email: "guest@example.com".to_string(),
            check_in: "2026-09-01".parse().unwrap(),
            check_out: "2026-09-03".parse().unwrap(),
            room_type: "standard".to_string(),
            dry_run: false,
        })
    }

    #[tokio::test]
    async fn test_register_is_idempotent_guard() {
        let (_tmp, auth) = setup().await;
        let identity = verified_agent("agent-1", 60);

        assert!(auth.register_agent(&identity).await.unwrap());
        assert!(!auth.register_agent(&identity).await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_agent_fails_closed() {
        let (_tmp, auth) = setup().await;
        let err = auth.authenticate(&request_for("ghost")).await.unwrap_err();
        assert_eq!(err.status_code(), 401);
    }

    #[tokio::test]
    async fn test_suspended_agent_fails_closed() {
        let (_tmp, auth) = setup().await;
        let identity = verified_agent("agent-1", 60);
        auth.register_agent(&identity).await.unwrap();
        auth.set_verification_status("agent-1", VerificationStatus::Suspended)
            .await
            .unwrap();

        let err = auth.authenticate(&request_for("agent-1")).await.unwrap_err();
        assert_eq!(err.status_code(), 401);
    }

    #[tokio::test]
    async fn test_pending_agent_cannot_authenticate() {
        let (_tmp, auth) = setup().await;
        let identity = AgentIdentity::new_pending(
            "agent-1".to_string(),
            "Pending".to_string(),
            vec!["*".to_string()],
        );
        auth.register_agent(&identity).await.unwrap();

        assert!(auth.authenticate(&request_for("agent-1")).await.is_err());
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_excess_in_window() {
        let (_tmp, auth) = setup().await;
        let identity = verified_agent("agent-1", 3);
        auth.register_agent(&identity).await.unwrap();

        for i in 0..3 {
            let outcome = auth.authenticate(&request_for("agent-1")).await.unwrap();
            assert_eq!(outcome.rate_limit_remaining, 3 - i);
            auth.log_request("agent-1", "query", "prop-1", 200, 5)
                .await
                .unwrap();
        }

        let err = auth.authenticate(&request_for("agent-1")).await.unwrap_err();
        assert_eq!(err.status_code(), 429);
    }

    #[tokio::test]
    async fn test_authorize_domain_and_blocked_entity() {
        let (_tmp, auth) = setup().await;
        let mut identity = verified_agent("agent-1", 60);
        identity.blocked_entities = vec!["prop-9".to_string()];

        let request = request_for("agent-1");
        assert!(auth.authorize(&identity, &request, &query_intent()).is_ok());

        let mut foreign = request.clone();
        foreign.target_domain = "airlines".to_string();
        assert!(auth.authorize(&identity, &foreign, &query_intent()).is_err());

        let mut blocked = request.clone();
        blocked.target_entity_id = "prop-9".to_string();
        assert!(auth.authorize(&identity, &blocked, &query_intent()).is_err());
    }

    #[tokio::test]
    async fn test_low_reputation_may_query_but_not_execute() {
        let (_tmp, auth) = setup().await;
        let mut identity = verified_agent("agent-1", 60);
        identity.reputation_score = 0.2;

        let request = request_for("agent-1");
        assert!(auth.authorize(&identity, &request, &query_intent()).is_ok());
        let err = auth
            .authorize(&identity, &request, &execute_intent())
            .unwrap_err();
        assert_eq!(err.status_code(), 403);
    }
}
