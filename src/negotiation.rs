//! Bounded multi-round negotiation engine.
//!
//! Opening offers discount the property's base price in proportion to the
//! agent's reputation, capped by the tier's discount factor. Counter rounds
//! split the difference between the standing offer and the agent's bid. The
//! concession rule is observed business policy, kept behind a replaceable
//! `PricingPolicy` so it can be swapped without touching the protocol.
//!
//! Session state is cache-aside: the authoritative round count and standing
//! offer live on the persisted transaction, and a session can always be
//! reconstructed from those two fields alone.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::adapter::DomainAdapter;
use crate::error::{GatewayError, Result};
use crate::model::{EngineOutcome, NegotiatePayload, Offer, Property, PropertyTier, Transaction};
use crate::TransactionId;

/// Smallest price the engine will ever offer, in currency units.
const PRICE_FLOOR: f64 = 1.0;

/// Reputation needed for the breakfast and late-checkout bundle.
const TERMS_THRESHOLD_BASIC: f64 = 0.7;
/// Reputation needed for spa access on top of the basic bundle.
const TERMS_THRESHOLD_PREMIUM: f64 = 0.9;

/// Pricing decisions, isolated from the round-keeping protocol.
pub trait PricingPolicy: Send + Sync {
    /// Price of the opening offer before flooring.
    fn opening_price(
        &self,
        base_price: f64,
        demand_multiplier: f64,
        reputation: f64,
        tier: PropertyTier,
    ) -> f64;

    /// Price of the next counter-offer given the standing offer and the
    /// agent's bid.
    fn counter_price(&self, last_offer_price: f64, agent_price: f64) -> f64;
}

/// The observed production policy: reputation-proportional discount within
/// the tier ceiling, then split-the-difference convergence.
#[derive(Debug, Default)]
pub struct StandardPolicy;

impl PricingPolicy for StandardPolicy {
    fn opening_price(
        &self,
        base_price: f64,
        demand_multiplier: f64,
        reputation: f64,
        tier: PropertyTier,
    ) -> f64 {
        base_price * demand_multiplier - base_price * reputation * tier.discount_factor()
    }

    fn counter_price(&self, last_offer_price: f64, agent_price: f64) -> f64 {
        (last_offer_price + agent_price) / 2.0
    }
}

/// One entry in a session's append-only history.
#[derive(Debug, Clone)]
pub struct RoundRecord {
    pub round: u32,
    /// The agent's bid, absent on the opening round.
    pub agent_price: Option<f64>,
    pub offer: Offer,
    pub at: DateTime<Utc>,
}

/// Ephemeral per-transaction negotiation state. Not a source of truth: the
/// persisted transaction's round count and standing offer are.
#[derive(Debug, Clone)]
pub struct NegotiationSession {
    pub tx_id: TransactionId,
    pub session_id: Uuid,
    pub round: u32,
    pub last_offer: Option<Offer>,
    pub history: Vec<RoundRecord>,
}

impl NegotiationSession {
    /// Pure reconstruction from persisted transaction fields. History before
    /// the reconstruction point is not recoverable and not needed.
    pub fn reconstruct(tx: &Transaction) -> Self {
        Self {
            tx_id: tx.tx_id,
            session_id: tx.session_id,
            round: tx.negotiation_round,
            last_offer: tx.current_offer.clone(),
            history: Vec::new(),
        }
    }
}

pub struct NegotiationEngine {
    policy: Arc<dyn PricingPolicy>,
    max_rounds: u32,
    sessions: RwLock<HashMap<TransactionId, NegotiationSession>>,
}

impl NegotiationEngine {
    pub fn new(max_rounds: u32) -> Self {
        Self::with_policy(max_rounds, Arc::new(StandardPolicy))
    }

    pub fn with_policy(max_rounds: u32, policy: Arc<dyn PricingPolicy>) -> Self {
        Self {
            policy,
            max_rounds,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Open a negotiation: compute the opening offer from the property's
    /// live pricing and the agent's reputation. If the opening price already
    /// fits the caller's budget the deal closes in one round.
    ///
    /// Consumes round 1 and advances `tx.negotiation_round`; the caller
    /// persists the outcome through the transaction store.
    pub async fn start_negotiation(
        &self,
        tx: &mut Transaction,
        property: &Property,
        adapter: &dyn DomainAdapter,
        payload: &NegotiatePayload,
        reputation: f64,
        budget_max: Option<f64>,
    ) -> Result<EngineOutcome> {
        if tx.negotiation_round > 0 {
            return Err(GatewayError::StateConflict(format!(
                "Transaction {} already has an open negotiation",
                tx.tx_id
            )));
        }

        let base_price = adapter
            .base_price(payload.check_in, payload.check_out, &payload.room_type)
            .await?;
        let demand = adapter
            .demand_multiplier(payload.check_in, payload.check_out)
            .await?;

        let price = self
            .policy
            .opening_price(base_price, demand, reputation, property.tier)
            .max(PRICE_FLOOR);
        let offer = Offer::new(price, "USD".to_string(), bundled_terms(property.tier, reputation));

        tx.negotiation_round = 1;

        let mut session = NegotiationSession {
            tx_id: tx.tx_id,
            session_id: tx.session_id,
            round: 1,
            last_offer: Some(offer.clone()),
            history: Vec::new(),
        };
        session.history.push(RoundRecord {
            round: 1,
            agent_price: None,
            offer: offer.clone(),
            at: Utc::now(),
        });

        let within_budget = budget_max.map(|b| price <= b).unwrap_or(false);
        info!(
            tx_id = %tx.tx_id,
            property_id = %property.property_id,
            base_price,
            demand,
            opening_price = price,
            within_budget,
            "opening offer computed"
        );

        if within_budget {
            self.sessions.write().remove(&tx.tx_id);
            return Ok(EngineOutcome::Negotiated(offer));
        }

        self.sessions.write().insert(tx.tx_id, session);
        Ok(EngineOutcome::Counter(offer))
    }

    /// Advance a negotiation by one round using the agent's counter price.
    ///
    /// A missing or non-positive counter is rejected without consuming a
    /// round, as is a continuation past the round cap. The emitted price
    /// never exceeds the standing offer, so offers are monotonically
    /// non-increasing across rounds.
    pub async fn continue_negotiation(
        &self,
        tx: &mut Transaction,
        payload: &NegotiatePayload,
    ) -> Result<EngineOutcome> {
        let agent_price = match payload.counter_price {
            Some(p) if p > 0.0 => p,
            Some(p) => {
                return Err(GatewayError::Validation(format!(
                    "counter_price must be positive, got {p}"
                )))
            }
            None => {
                return Err(GatewayError::Validation(
                    "counter_price is required to continue a negotiation".into(),
                ))
            }
        };

        if tx.is_expired() {
            self.sessions.write().remove(&tx.tx_id);
            return Ok(EngineOutcome::Timeout);
        }

        let session = self.session_for(tx);
        let last_offer = session
            .last_offer
            .clone()
            .ok_or_else(|| {
                GatewayError::StateConflict(format!(
                    "Transaction {} has no standing offer to counter",
                    tx.tx_id
                ))
            })?;

        if tx.negotiation_round >= self.max_rounds {
            self.sessions.write().remove(&tx.tx_id);
            debug!(tx_id = %tx.tx_id, rounds = tx.negotiation_round, "round cap reached");
            return Ok(EngineOutcome::Rejected(format!(
                "Negotiation rounds exhausted after {} rounds",
                tx.negotiation_round
            )));
        }

        let next_price = self
            .policy
            .counter_price(last_offer.price, agent_price)
            .min(last_offer.price)
            .max(PRICE_FLOOR);

        tx.negotiation_round += 1;
        let offer = Offer::new(next_price, last_offer.currency.clone(), last_offer.terms.clone());

        let agreed = agent_price >= next_price;
        info!(
            tx_id = %tx.tx_id,
            round = tx.negotiation_round,
            agent_price,
            next_price,
            agreed,
            "negotiation round advanced"
        );

        let mut sessions = self.sessions.write();
        let entry = sessions
            .entry(tx.tx_id)
            .or_insert_with(|| NegotiationSession::reconstruct(tx));
        entry.round = tx.negotiation_round;
        entry.last_offer = Some(offer.clone());
        entry.history.push(RoundRecord {
            round: tx.negotiation_round,
            agent_price: Some(agent_price),
            offer: offer.clone(),
            at: Utc::now(),
        });

        if agreed {
            sessions.remove(&tx.tx_id);
            return Ok(EngineOutcome::Negotiated(offer));
        }
        Ok(EngineOutcome::Counter(offer))
    }

    /// Drop any cached session for a transaction that reached a terminal
    /// state through another path (cancel, failure).
    pub fn forget_session(&self, tx_id: TransactionId) {
        self.sessions.write().remove(&tx_id);
    }

    /// Cached session, or a fresh reconstruction from the transaction.
    fn session_for(&self, tx: &Transaction) -> NegotiationSession {
        if let Some(session) = self.sessions.read().get(&tx.tx_id) {
            return session.clone();
        }
        NegotiationSession::reconstruct(tx)
    }

    #[cfg(test)]
    fn cached_session_count(&self) -> usize {
        self.sessions.read().len()
    }
}

/// Terms bundled into every offer of a negotiation, by tier and reputation.
/// Budget properties bundle nothing.
fn bundled_terms(tier: PropertyTier, reputation: f64) -> HashMap<String, serde_json::Value> {
    let mut terms = HashMap::new();
    if !tier.bundles_terms() {
        return terms;
    }
    if reputation >= TERMS_THRESHOLD_BASIC {
        terms.insert("breakfast_included".to_string(), serde_json::json!(true));
        terms.insert("late_checkout".to_string(), serde_json::json!(true));
    }
    if reputation >= TERMS_THRESHOLD_PREMIUM {
        terms.insert("spa_access".to_string(), serde_json::json!(true));
    }
    terms
}
