//! The protocol entry point. One fixed, fail-fast pipeline per request:
//! parse, authenticate, authorize, resolve the transaction, dispatch by
//! intent, persist the transition, log the outcome.
//!
//! Wildcard discovery fans out one concurrent query per active property and
//! tolerates partial failure: a property whose adapter errors is dropped
//! from the aggregate instead of failing the request.

use parking_lot::RwLock;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::adapter::{AdapterFactory, DomainAdapter};
use crate::error::{GatewayError, Result};
use crate::model::{
    AcpRequest, AcpResponse, AvailabilityQuery, CancelPayload, EngineOutcome, ExecutePayload,
    ExecutionResult, Intent, NegotiatePayload, Property, PropertyTier, ResponseStatus, Transaction,
    TransactionStatus,
};
use crate::negotiation::NegotiationEngine;
use crate::registry::PropertyRegistry;
use crate::store::{payload_hash, ExecutionClaim, TransactionStore};
use crate::trust::{AuthOutcome, Authenticator};

/// How long a losing concurrent execute waits for the claim holder before
/// giving up with a conflict.
const CLAIM_WAIT_INTERVAL: Duration = Duration::from_millis(50);
const CLAIM_WAIT_ATTEMPTS: u32 = 100;

/// Books commissions after successful executions. The ledger's bookkeeping
/// lives outside this crate; the gateway only notifies it.
#[async_trait::async_trait]
pub trait CommissionLedger: Send + Sync {
    async fn record_commission(
        &self,
        tx: &Transaction,
        tier: PropertyTier,
        result: &ExecutionResult,
    );
}

/// Receives one metric per completed round-trip against a concrete property.
#[async_trait::async_trait]
pub trait MonitoringDashboard: Send + Sync {
    async fn record_booking_metric(&self, property_id: &str, success: bool, latency_ms: u64);
}

/// Default ledger: emits the commission as a structured log line.
pub struct TracingLedger;

#[async_trait::async_trait]
impl CommissionLedger for TracingLedger {
    async fn record_commission(
        &self,
        tx: &Transaction,
        tier: PropertyTier,
        result: &ExecutionResult,
    ) {
        let commission = result.total_price * tier.commission_rate();
        info!(
            tx_id = %tx.tx_id,
            property_id = %result.property_id,
            booking_value = result.total_price,
            tier = tier.as_str(),
            commission,
            "commission recorded"
        );
    }
}

/// Default dashboard: emits the metric as a structured log line.
pub struct TracingDashboard;

#[async_trait::async_trait]
impl MonitoringDashboard for TracingDashboard {
    async fn record_booking_metric(&self, property_id: &str, success: bool, latency_ms: u64) {
        info!(property_id, success, latency_ms, "booking metric");
    }
}

pub struct Gateway {
    node_id: String,
    authenticator: Authenticator,
    registry: PropertyRegistry,
    store: TransactionStore,
    engine: NegotiationEngine,
    factory: Arc<dyn AdapterFactory>,
    /// One adapter instance per property, so breaker and cache state stay
    /// instance-local and survive across requests.
    adapters: RwLock<HashMap<String, Arc<dyn DomainAdapter>>>,
    ledger: Arc<dyn CommissionLedger>,
    dashboard: Arc<dyn MonitoringDashboard>,
}

impl Gateway {
    pub fn new(
        node_id: String,
        authenticator: Authenticator,
        registry: PropertyRegistry,
        store: TransactionStore,
        engine: NegotiationEngine,
        factory: Arc<dyn AdapterFactory>,
    ) -> Self {
        Self {
            node_id,
            authenticator,
            registry,
            store,
            engine,
            factory,
            adapters: RwLock::new(HashMap::new()),
            ledger: Arc::new(TracingLedger),
            dashboard: Arc::new(TracingDashboard),
        }
    }

    pub fn with_collaborators(
        mut self,
        ledger: Arc<dyn CommissionLedger>,
        dashboard: Arc<dyn MonitoringDashboard>,
    ) -> Self {
        self.ledger = ledger;
        self.dashboard = dashboard;
        self
    }

    /// Handle one protocol envelope end to end. Never returns an error: every
    /// failure class becomes a response envelope with the matching status
    /// code, and malformed input that yields no request id is answered under
    /// the placeholder id `"unknown"`.
    pub async fn handle(&self, raw: serde_json::Value) -> AcpResponse {
        let started = Instant::now();

        let request: AcpRequest = match serde_json::from_value(raw) {
            Ok(request) => request,
            Err(e) => {
                let err = GatewayError::Validation(format!("Malformed envelope: {e}"));
                warn!(error = %err, "rejecting unparseable envelope");
                return self.finalize(AcpResponse::from_error("unknown".to_string(), &err), started);
            }
        };

        let response = match self.process(&request).await {
            Ok(response) => response,
            Err(err) => self.error_response(&request, err),
        };
        let response = self.finalize(response, started);

        // the request log feeds both the sliding-window rate limiter and
        // analytics, so it is appended after every completed round trip
        if !request.agent_id.is_empty() {
            if let Err(err) = self
                .authenticator
                .log_request(
                    &request.agent_id,
                    &request.intent_type,
                    &request.target_entity_id,
                    response.status_code,
                    response.processing_time_ms,
                )
                .await
            {
                warn!(error = %err, "failed to append request log");
            }
        }
        if !request.target_entity_id.is_empty() && !request.is_wildcard() {
            self.dashboard
                .record_booking_metric(
                    &request.target_entity_id,
                    response.status_code < 400,
                    response.processing_time_ms,
                )
                .await;
        }

        info!(
            request_id = %response.request_id,
            agent_id = %request.agent_id,
            intent = %request.intent_type,
            status_code = response.status_code,
            latency_ms = response.processing_time_ms,
            "request completed"
        );
        response
    }

    async fn process(&self, request: &AcpRequest) -> Result<AcpResponse> {
        request.validate()?;
        let intent = Intent::parse(&request.intent_type, &request.intent_payload)?;
        let auth = self.authenticator.authenticate(request).await?;
        self.authenticator.authorize(&auth.identity, request, &intent)?;

        match intent {
            Intent::Discover(query) | Intent::Query(query) => {
                self.handle_query(request, &query).await
            }
            Intent::Negotiate(payload) => self.handle_negotiate(request, &auth, &payload).await,
            Intent::Execute(payload) => self.handle_execute(request, &payload).await,
            Intent::Cancel(payload) => self.handle_cancel(request, &payload).await,
            Intent::Verify => Ok(self.handle_verify(request, &auth)),
        }
    }

    /// Availability lookups. A wildcard target queries every active property
    /// concurrently, with per-task error isolation.
    async fn handle_query(
        &self,
        request: &AcpRequest,
        query: &AvailabilityQuery,
    ) -> Result<AcpResponse> {
        if request.is_wildcard() {
            let properties = self.registry.list_active_properties().await?;
            let mut tasks = JoinSet::new();
            for property in properties {
                let adapter = match self.adapter_for(&property) {
                    Ok(adapter) => adapter,
                    Err(err) => {
                        warn!(property_id = %property.property_id, error = %err,
                            "skipping property, adapter construction failed");
                        continue;
                    }
                };
                let query = query.clone();
                tasks.spawn(async move {
                    let property_id = adapter.property_id().to_string();
                    (property_id, adapter.query(&query).await)
                });
            }

            let mut results = Vec::new();
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((property_id, Ok(offers))) => {
                        results.push(json!({"property_id": property_id, "offers": offers}));
                    }
                    Ok((property_id, Err(err))) => {
                        warn!(%property_id, error = %err, "dropping failed property from aggregate");
                    }
                    Err(err) => warn!(error = %err, "discovery task panicked"),
                }
            }
            results.sort_by_key(|r| r["property_id"].as_str().unwrap_or_default().to_string());

            let total_found = results.len();
            return Ok(AcpResponse::ok(
                request.request_id.clone(),
                ResponseStatus::Accepted,
                200,
                json!({"properties": results, "total_found": total_found}),
            ));
        }

        let property = self
            .registry
            .get_active_property(&request.target_entity_id)
            .await?;
        let adapter = self.adapter_for(&property)?;
        let offers = adapter.query(query).await?;
        Ok(AcpResponse::ok(
            request.request_id.clone(),
            ResponseStatus::Accepted,
            200,
            json!({
                "property_id": property.property_id,
                "offers": offers,
                "total_found": offers.len(),
            }),
        ))
    }

    async fn handle_negotiate(
        &self,
        request: &AcpRequest,
        auth: &AuthOutcome,
        payload: &NegotiatePayload,
    ) -> Result<AcpResponse> {
        let property = self
            .registry
            .get_active_property(&request.target_entity_id)
            .await?;
        let adapter = self.adapter_for(&property)?;
        let mut tx = self.resolve_or_create_transaction(request).await?;
        ensure_transaction_matches(&tx, request)?;

        let outcome = match tx.status {
            TransactionStatus::Pending => {
                self.engine
                    .start_negotiation(
                        &mut tx,
                        &property,
                        adapter.as_ref(),
                        payload,
                        auth.identity.reputation_score,
                        request.constraints.budget_max,
                    )
                    .await?
            }
            TransactionStatus::Negotiating => {
                self.engine.continue_negotiation(&mut tx, payload).await?
            }
            other => {
                return Err(GatewayError::StateConflict(format!(
                    "Transaction {} is {} and cannot be negotiated",
                    tx.tx_id,
                    other.as_str()
                )))
            }
        };

        let tx = self.store.update_transaction_from_result(&tx, &outcome).await?;
        Ok(self.negotiation_response(request, &tx, &outcome))
    }

    /// Execute a negotiated transaction with at-most-once semantics: the
    /// execution slot is claimed before the adapter is ever invoked, so
    /// concurrent calls under one request_id trigger the booking side
    /// effect exactly once, and only successful outcomes (or valid
    /// dry-runs) are stored.
    async fn handle_execute(
        &self,
        request: &AcpRequest,
        payload: &ExecutePayload,
    ) -> Result<AcpResponse> {
        let execution_type = if payload.dry_run { "dry_run" } else { "live" };
        let hash = payload_hash(&request.intent_payload);

        if let Some(cached) = self
            .store
            .get_idempotent_result(&request.request_id, execution_type, &hash)
            .await?
        {
            info!(request_id = %request.request_id, execution_type, "idempotent replay");
            return Ok(self.replay_response(request, payload.dry_run, cached));
        }

        let property = self
            .registry
            .get_active_property(&request.target_entity_id)
            .await?;
        let tx = self.resolve_executable_transaction(request).await?;
        ensure_transaction_matches(&tx, request)?;
        if tx.status != TransactionStatus::Negotiated {
            return Err(GatewayError::StateConflict(format!(
                "Transaction {} is {}; execute requires a negotiated transaction",
                tx.tx_id,
                tx.status.as_str()
            )));
        }
        if tx.is_expired() {
            self.store.set_status(tx.tx_id, TransactionStatus::Failed).await?;
            return Err(GatewayError::StateConflict(format!(
                "Transaction {} expired before execution",
                tx.tx_id
            )));
        }

        let adapter = self.adapter_for(&property)?;

        // claim the execution slot before touching the adapter; a losing
        // concurrent caller waits here and replays the winner's result
        let mut attempts = 0;
        loop {
            match self
                .store
                .claim_execution(&request.request_id, execution_type, &hash)
                .await?
            {
                ExecutionClaim::Claimed => break,
                ExecutionClaim::Completed(cached) => {
                    info!(request_id = %request.request_id, execution_type, "idempotent replay");
                    return Ok(self.replay_response(request, payload.dry_run, cached));
                }
                ExecutionClaim::InFlight => {
                    attempts += 1;
                    if attempts > CLAIM_WAIT_ATTEMPTS {
                        return Err(GatewayError::StateConflict(format!(
                            "Execution for request {} is still in progress",
                            request.request_id
                        )));
                    }
                    tokio::time::sleep(CLAIM_WAIT_INTERVAL).await;
                }
            }
        }

        let result = match adapter.execute(&tx, payload).await {
            Ok(result) => result,
            Err(err) => {
                // failures are never cached; free the slot so the same
                // request_id stays retryable
                self.store
                    .release_claim(&request.request_id, execution_type)
                    .await?;
                return Err(err);
            }
        };

        self.store
            .store_idempotent_result(&request.request_id, execution_type, &hash, &result)
            .await?;

        if payload.dry_run {
            let mut response = AcpResponse::ok(
                request.request_id.clone(),
                ResponseStatus::Accepted,
                200,
                json!({"result": result, "dry_run": true}),
            );
            response.negotiation_session_id = Some(tx.session_id);
            return Ok(response);
        }

        let tx = self
            .store
            .update_transaction_from_result(&tx, &EngineOutcome::Confirmed)
            .await?;
        self.engine.forget_session(tx.tx_id);
        self.ledger.record_commission(&tx, property.tier, &result).await;

        let mut response = AcpResponse::ok(
            request.request_id.clone(),
            ResponseStatus::Confirmed,
            200,
            json!({"result": result}),
        );
        response.negotiation_session_id = Some(tx.session_id);
        Ok(response)
    }

    async fn handle_cancel(
        &self,
        request: &AcpRequest,
        payload: &CancelPayload,
    ) -> Result<AcpResponse> {
        let tx = match payload.transaction_id {
            Some(tx_id) => self
                .store
                .get_transaction(tx_id)
                .await?
                .ok_or_else(|| GatewayError::NotFound(format!("Transaction {tx_id}")))?,
            None => self.resolve_open_transaction(request).await?,
        };
        ensure_transaction_matches(&tx, request)?;

        if tx.status.is_terminal() {
            return Err(GatewayError::StateConflict(format!(
                "Transaction {} is already {}",
                tx.tx_id,
                tx.status.as_str()
            )));
        }

        self.store.set_status(tx.tx_id, TransactionStatus::Failed).await?;
        self.engine.forget_session(tx.tx_id);
        Ok(AcpResponse::ok(
            request.request_id.clone(),
            ResponseStatus::Accepted,
            200,
            json!({"transaction_id": tx.tx_id, "status": "failed"}),
        ))
    }

    /// Introspection counterpart of the trust layer: the agent's own view of
    /// its standing.
    fn handle_verify(&self, request: &AcpRequest, auth: &AuthOutcome) -> AcpResponse {
        AcpResponse::ok(
            request.request_id.clone(),
            ResponseStatus::Accepted,
            200,
            json!({
                "agent_id": auth.identity.agent_id,
                "verification_status": auth.identity.verification_status,
                "reputation_score": auth.identity.reputation_score,
                "rate_limit_remaining": auth.rate_limit_remaining,
                "allowed_domains": auth.identity.allowed_domains,
            }),
        )
    }

    /// Resolve-or-create for negotiation: an existing transaction resolved
    /// by session id wins over a fresh create, so continuations survive
    /// stateless round trips.
    async fn resolve_or_create_transaction(&self, request: &AcpRequest) -> Result<Transaction> {
        if let Some(session_id) = request.agent_context.negotiation_session_id {
            if let Some(tx) = self.store.get_transaction_by_session_id(session_id).await? {
                return Ok(tx);
            }
        }
        self.store
            .create_transaction(&request.request_id, &request.agent_id, &request.target_entity_id)
            .await
    }

    /// Resolution for execute: prefer the negotiated transaction behind the
    /// caller's session id; otherwise fall back to resolve-or-create, which
    /// yields a pending transaction the state check then rejects.
    async fn resolve_executable_transaction(&self, request: &AcpRequest) -> Result<Transaction> {
        if let Some(session_id) = request.agent_context.negotiation_session_id {
            if let Some(tx) = self.store.get_executable_transaction(session_id).await? {
                return Ok(tx);
            }
        }
        self.resolve_or_create_transaction(request).await
    }

    /// Any non-terminal transaction reachable from the request, for cancel.
    async fn resolve_open_transaction(&self, request: &AcpRequest) -> Result<Transaction> {
        if let Some(session_id) = request.agent_context.negotiation_session_id {
            if let Some(tx) = self.store.get_transaction_by_session_id(session_id).await? {
                return Ok(tx);
            }
            if let Some(tx) = self.store.get_executable_transaction(session_id).await? {
                return Ok(tx);
            }
        }
        self.store
            .get_transaction_by_request_id(&request.request_id)
            .await?
            .ok_or_else(|| {
                GatewayError::NotFound(format!(
                    "No open transaction for request {}",
                    request.request_id
                ))
            })
    }

    fn replay_response(
        &self,
        request: &AcpRequest,
        dry_run: bool,
        result: ExecutionResult,
    ) -> AcpResponse {
        AcpResponse::ok(
            request.request_id.clone(),
            if dry_run {
                ResponseStatus::Accepted
            } else {
                ResponseStatus::Confirmed
            },
            200,
            json!({"result": result, "idempotent_replay": true}),
        )
    }

    fn negotiation_response(
        &self,
        request: &AcpRequest,
        tx: &Transaction,
        outcome: &EngineOutcome,
    ) -> AcpResponse {
        let (status_code, payload) = match outcome {
            EngineOutcome::Counter(offer)
            | EngineOutcome::Accepted(offer)
            | EngineOutcome::Negotiated(offer) => (
                200,
                json!({"offer": offer, "round": tx.negotiation_round}),
            ),
            EngineOutcome::Confirmed => (200, json!({"transaction_id": tx.tx_id})),
            EngineOutcome::Rejected(reason) => (409, json!({"reason": reason})),
            EngineOutcome::Timeout => (504, json!({"reason": "transaction expired"})),
            EngineOutcome::Error(detail) => (500, json!({"error": detail})),
        };
        let mut response = AcpResponse::ok(
            request.request_id.clone(),
            outcome.response_status(),
            status_code,
            payload,
        );
        response.negotiation_session_id = Some(tx.session_id);
        response
    }

    /// Expected business outcomes surface as structured rejections, not
    /// generic errors: a state conflict answers `rejected`/409.
    fn error_response(&self, request: &AcpRequest, err: GatewayError) -> AcpResponse {
        let mut response = AcpResponse::from_error(request.request_id.clone(), &err);
        if matches!(err, GatewayError::StateConflict(_)) {
            response.status = ResponseStatus::Rejected;
        }
        response
    }

    fn finalize(&self, mut response: AcpResponse, started: Instant) -> AcpResponse {
        response.processing_time_ms = started.elapsed().as_millis() as u64;
        response.gateway_node_id = self.node_id.clone();
        response
    }

    fn adapter_for(&self, property: &Property) -> Result<Arc<dyn DomainAdapter>> {
        if let Some(adapter) = self.adapters.read().get(&property.property_id) {
            return Ok(Arc::clone(adapter));
        }
        let credentials = self.registry.decode_credentials(property)?;
        let adapter = self.factory.create(property, &credentials)?;
        self.adapters
            .write()
            .insert(property.property_id.clone(), Arc::clone(&adapter));
        Ok(adapter)
    }
}

/// A transaction resumed by session or transaction id must belong to the
/// requesting agent and the targeted property. A session handle alone is
/// not a bearer credential for someone else's negotiation, and a price
/// negotiated at one property must not book a room at another.
fn ensure_transaction_matches(tx: &Transaction, request: &AcpRequest) -> Result<()> {
    if tx.agent_id != request.agent_id {
        return Err(GatewayError::StateConflict(format!(
            "Transaction {} belongs to another agent",
            tx.tx_id
        )));
    }
    if !request.is_wildcard() && tx.property_id != request.target_entity_id {
        return Err(GatewayError::StateConflict(format!(
            "Transaction {} is for property {}, not {}",
            tx.tx_id, tx.property_id, request.target_entity_id
        )));
    }
    Ok(())
}
