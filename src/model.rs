use crate::{GatewayError, Result, TransactionId};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Minutes before a transaction expires once created.
pub const TRANSACTION_TTL_MINUTES: i64 = 30;

// ============================================================================
// AGENTS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub agent_id: String,
    pub name: String,
    pub verification_status: VerificationStatus,
    /// Trust metric in [0, 1] affecting negotiation and execute eligibility.
    pub reputation_score: f64,
    /// Domains this agent may target; `"*"` grants all.
    pub allowed_domains: Vec<String>,
    /// Entity ids this agent may never target.
    pub blocked_entities: Vec<String>,
    pub requests_per_minute: u32,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    Pending,
    Verified,
    Suspended,
    Rejected,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Verified => "verified",
            Self::Suspended => "suspended",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "verified" => Ok(Self::Verified),
            "suspended" => Ok(Self::Suspended),
            "rejected" => Ok(Self::Rejected),
            other => Err(GatewayError::Validation(format!(
                "Invalid verification status: {other}"
            ))),
        }
    }
}

impl AgentIdentity {
    /// New identities start pending until an admin verifies them.
    pub fn new_pending(agent_id: String, name: String, allowed_domains: Vec<String>) -> Self {
        Self {
            agent_id,
            name,
            verification_status: VerificationStatus::Pending,
            reputation_score: 0.5,
            allowed_domains,
            blocked_entities: vec![],
            requests_per_minute: 60,
            created_at: Utc::now(),
            last_active: Utc::now(),
        }
    }

    pub fn may_target_domain(&self, domain: &str) -> bool {
        self.allowed_domains.iter().any(|d| d == "*" || d == domain)
    }
}

// ============================================================================
// PROPERTIES
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Property {
    pub property_id: String,
    pub name: String,
    pub pms_type: String,
    /// Encoded credentials blob; decoded only for adapter construction.
    #[serde(skip_serializing)]
    pub credentials: String,
    pub tier: PropertyTier,
    pub is_active: bool,
    pub paused_reason: Option<String>,
    pub config: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyTier {
    Budget,
    Standard,
    Luxury,
}

impl PropertyTier {
    /// Ceiling on the reputation-proportional discount for this tier.
    pub fn discount_factor(&self) -> f64 {
        match self {
            Self::Budget => 0.10,
            Self::Standard => 0.15,
            Self::Luxury => 0.20,
        }
    }

    /// Commission rate applied to booking value by the ledger collaborator.
    pub fn commission_rate(&self) -> f64 {
        match self {
            Self::Budget => 0.08,
            Self::Standard => 0.10,
            Self::Luxury => 0.12,
        }
    }

    /// Whether bundled terms (breakfast, late checkout, spa) are offered.
    pub fn bundles_terms(&self) -> bool {
        !matches!(self, Self::Budget)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Budget => "budget",
            Self::Standard => "standard",
            Self::Luxury => "luxury",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "budget" => Ok(Self::Budget),
            "standard" => Ok(Self::Standard),
            "luxury" => Ok(Self::Luxury),
            other => Err(GatewayError::Validation(format!("Invalid tier: {other}"))),
        }
    }
}

// ============================================================================
// TRANSACTIONS & OFFERS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Negotiating,
    Negotiated,
    Confirmed,
    Failed,
}

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Negotiating => "negotiating",
            Self::Negotiated => "negotiated",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "negotiating" => Ok(Self::Negotiating),
            "negotiated" => Ok(Self::Negotiated),
            "confirmed" => Ok(Self::Confirmed),
            "failed" => Ok(Self::Failed),
            other => Err(GatewayError::Validation(format!(
                "Invalid transaction status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub tx_id: TransactionId,
    /// Caller-supplied idempotency and tracing key; unique per transaction.
    pub request_id: String,
    pub agent_id: String,
    pub property_id: String,
    pub session_id: Uuid,
    pub status: TransactionStatus,
    pub negotiation_round: u32,
    pub current_offer: Option<Offer>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Transaction {
    pub fn new(request_id: String, agent_id: String, property_id: String) -> Self {
        let now = Utc::now();
        Self {
            tx_id: Uuid::new_v4(),
            request_id,
            agent_id,
            property_id,
            session_id: Uuid::new_v4(),
            status: TransactionStatus::Pending,
            negotiation_round: 0,
            current_offer: None,
            created_at: now,
            updated_at: now,
            expires_at: now + Duration::minutes(TRANSACTION_TTL_MINUTES),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

/// An immutable priced offer; each negotiation round produces a fresh one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Offer {
    pub offer_id: Uuid,
    pub price: f64,
    pub currency: String,
    pub terms: HashMap<String, serde_json::Value>,
    pub valid_until: DateTime<Utc>,
}

impl Offer {
    pub fn new(price: f64, currency: String, terms: HashMap<String, serde_json::Value>) -> Self {
        Self {
            offer_id: Uuid::new_v4(),
            price,
            currency,
            terms,
            valid_until: Utc::now() + Duration::minutes(TRANSACTION_TTL_MINUTES),
        }
    }
}

/// Outcome of one negotiation-engine step, mapped onto the transaction
/// state machine by `TransactionStore::update_transaction_from_result`.
#[derive(Debug, Clone)]
pub enum EngineOutcome {
    /// Gateway counter-offer, awaiting the agent's next move.
    Counter(Offer),
    /// Agent accepted an intermediate offer; negotiation continues.
    Accepted(Offer),
    /// Price agreement reached; transaction is executable.
    Negotiated(Offer),
    /// Booking side effect completed.
    Confirmed,
    Rejected(String),
    Error(String),
    Timeout,
}

impl EngineOutcome {
    pub fn response_status(&self) -> ResponseStatus {
        match self {
            Self::Counter(_) => ResponseStatus::Counter,
            Self::Accepted(_) => ResponseStatus::Accepted,
            Self::Negotiated(_) => ResponseStatus::Negotiated,
            Self::Confirmed => ResponseStatus::Confirmed,
            Self::Rejected(_) => ResponseStatus::Rejected,
            Self::Error(_) => ResponseStatus::Error,
            Self::Timeout => ResponseStatus::Timeout,
        }
    }
}

// ============================================================================
// ADAPTER RESULTS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomOffer {
    pub property_id: String,
    pub room_type: String,
    pub nightly_rate: f64,
    pub currency: String,
    pub available: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub booking_reference: String,
    pub property_id: String,
    pub room_type: String,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub total_price: f64,
    pub currency: String,
    pub dry_run: bool,
    pub executed_at: DateTime<Utc>,
}

// ============================================================================
// PROTOCOL ENVELOPES
// ============================================================================

pub const PROTOCOL_VERSION: &str = "acp/1.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcpRequest {
    pub protocol_version: String,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub agent_id: String,
    /// Accepted and logged, not cryptographically verified.
    #[serde(default)]
    pub agent_signature: Option<String>,
    pub target_domain: String,
    /// `"*"` fans the intent out across every active property.
    pub target_entity_id: String,
    pub intent_type: String,
    #[serde(default)]
    pub intent_payload: serde_json::Value,
    #[serde(default)]
    pub constraints: Constraints,
    #[serde(default)]
    pub agent_context: AgentContext,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Constraints {
    #[serde(default)]
    pub budget_max: Option<f64>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentContext {
    #[serde(default)]
    pub negotiation_session_id: Option<Uuid>,
    #[serde(default)]
    pub reputation_score: Option<f64>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl AcpRequest {
    pub fn validate(&self) -> Result<()> {
        if self.protocol_version != PROTOCOL_VERSION {
            return Err(GatewayError::Validation(format!(
                "Unsupported protocol version: {}",
                self.protocol_version
            )));
        }
        if self.request_id.is_empty() {
            return Err(GatewayError::Validation("request_id is required".into()));
        }
        if self.agent_id.is_empty() {
            return Err(GatewayError::Validation("agent_id is required".into()));
        }
        if self.target_entity_id.is_empty() {
            return Err(GatewayError::Validation(
                "target_entity_id is required".into(),
            ));
        }
        if let Some(budget) = self.constraints.budget_max {
            if budget <= 0.0 {
                return Err(GatewayError::Validation(
                    "budget_max must be greater than 0".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn is_wildcard(&self) -> bool {
        self.target_entity_id == "*"
    }
}

// ============================================================================
// TYPED INTENTS
// ============================================================================

/// Stay parameters shared by the informational intents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailabilityQuery {
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    #[serde(default)]
    pub room_type: Option<String>,
    #[serde(default)]
    pub guests: Option<u32>,
}

impl AvailabilityQuery {
    pub fn validate(&self) -> Result<()> {
        if self.check_out <= self.check_in {
            return Err(GatewayError::Validation(
                "check_out must be after check_in".into(),
            ));
        }
        Ok(())
    }

    pub fn nights(&self) -> i64 {
        (self.check_out - self.check_in).num_days()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiatePayload {
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub room_type: String,
    /// Present on continuation rounds; absent on the opening round.
    #[serde(default)]
    pub counter_price: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutePayload {
    pub guest_name: String,
    pub guest_email: String,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub room_type: String,
    /// Validate and estimate without performing the real booking.
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelPayload {
    #[serde(default)]
    pub transaction_id: Option<TransactionId>,
}

/// `intent_payload` parsed into a variant keyed by `intent_type`, so intent
/// handling is exhaustive instead of dispatching on an untyped map.
#[derive(Debug, Clone)]
pub enum Intent {
    Discover(AvailabilityQuery),
    Query(AvailabilityQuery),
    Negotiate(NegotiatePayload),
    Execute(ExecutePayload),
    Cancel(CancelPayload),
    Verify,
}

impl Intent {
    pub fn parse(intent_type: &str, payload: &serde_json::Value) -> Result<Self> {
        let invalid = |e: serde_json::Error| {
            GatewayError::Validation(format!("Invalid {intent_type} payload: {e}"))
        };
        match intent_type {
            "discover" => {
                let q: AvailabilityQuery =
                    serde_json::from_value(payload.clone()).map_err(invalid)?;
                q.validate()?;
                Ok(Self::Discover(q))
            }
            "query" => {
                let q: AvailabilityQuery =
                    serde_json::from_value(payload.clone()).map_err(invalid)?;
                q.validate()?;
                Ok(Self::Query(q))
            }
            "negotiate" => {
                let p: NegotiatePayload =
                    serde_json::from_value(payload.clone()).map_err(invalid)?;
                if p.check_out <= p.check_in {
                    return Err(GatewayError::Validation(
                        "check_out must be after check_in".into(),
                    ));
                }
                Ok(Self::Negotiate(p))
            }
            "execute" => {
                let p: ExecutePayload = serde_json::from_value(payload.clone()).map_err(invalid)?;
                if p.guest_name.is_empty() || p.guest_email.is_empty() {
                    return Err(GatewayError::Validation(
                        "guest_name and guest_email are required".into(),
                    ));
                }
                Ok(Self::Execute(p))
            }
            "cancel" => {
                let p: CancelPayload = serde_json::from_value(payload.clone()).map_err(invalid)?;
                Ok(Self::Cancel(p))
            }
            "verify" => Ok(Self::Verify),
            other => Err(GatewayError::Validation(format!(
                "Unknown intent type: {other}"
            ))),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Discover(_) => "discover",
            Self::Query(_) => "query",
            Self::Negotiate(_) => "negotiate",
            Self::Execute(_) => "execute",
            Self::Cancel(_) => "cancel",
            Self::Verify => "verify",
        }
    }
}

// ============================================================================
// RESPONSE ENVELOPE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Accepted,
    Rejected,
    Counter,
    Pending,
    Error,
    Timeout,
    Negotiated,
    Confirmed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcpResponse {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: ResponseStatus,
    pub status_code: u16,
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub negotiation_session_id: Option<Uuid>,
    pub processing_time_ms: u64,
    pub gateway_node_id: String,
}

impl AcpResponse {
    pub fn ok(
        request_id: String,
        status: ResponseStatus,
        status_code: u16,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            request_id,
            timestamp: Utc::now(),
            status,
            status_code,
            payload,
            negotiation_session_id: None,
            processing_time_ms: 0,
            gateway_node_id: String::new(),
        }
    }

    pub fn from_error(request_id: String, err: &GatewayError) -> Self {
        Self {
            request_id,
            timestamp: Utc::now(),
            status: ResponseStatus::Error,
            status_code: err.status_code(),
            payload: serde_json::json!({
                "error": err.to_string(),
                "retryable": err.retryable(),
            }),
            negotiation_session_id: None,
            processing_time_ms: 0,
            gateway_node_id: String::new(),
        }
    }
}
