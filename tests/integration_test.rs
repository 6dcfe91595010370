//! End-to-end flows through the public gateway surface: registration,
//! discovery, negotiation, execution, and the admin lifecycle around them.

use acp_gateway::{
    model::{AgentIdentity, PropertyTier, ResponseStatus, VerificationStatus, PROTOCOL_VERSION},
    registry::PmsCredentials,
    AcpResponse, AdapterFactory, Authenticator, Gateway, LocalAdapterFactory, NegotiationEngine,
    PropertyRegistry, TransactionStore,
};
use serde_json::json;
use std::sync::Arc;
use tempfile::NamedTempFile;

struct TestStack {
    _tmp: NamedTempFile,
    gateway: Gateway,
    authenticator: Authenticator,
    registry: PropertyRegistry,
    store: TransactionStore,
}

async fn setup() -> TestStack {
    let tmp = NamedTempFile::new().unwrap();
    let url = format!("sqlite://{}", tmp.path().to_string_lossy());
    let pool = acp_gateway::db::connect(&url).await.unwrap();

    let authenticator = Authenticator::new(pool.clone(), 0.3);
    let registry = PropertyRegistry::new(pool.clone());
    let store = TransactionStore::new(pool);
    let gateway = Gateway::new(
        "gw-itest".to_string(),
        authenticator.clone(),
        registry.clone(),
        store.clone(),
        NegotiationEngine::new(5),
        Arc::new(LocalAdapterFactory) as Arc<dyn AdapterFactory>,
    );

    TestStack {
        _tmp: tmp,
        gateway,
        authenticator,
        registry,
        store,
    }
}

async fn onboard_agent(stack: &TestStack, agent_id: &str, reputation: f64) {
    let identity = AgentIdentity::new_pending(
        agent_id.to_string(),
        "Integration Agency".to_string(),
        vec!["hospitality".to_string()],
    );
    assert!(stack.authenticator.register_agent(&identity).await.unwrap());
    assert!(stack
        .authenticator
        .set_verification_status(agent_id, VerificationStatus::Verified)
        .await
        .unwrap());
    assert!(stack
        .authenticator
        .set_reputation(agent_id, reputation)
        .await
        .unwrap());
}

async fn onboard_property(stack: &TestStack, property_id: &str, tier: PropertyTier) {
    let credentials = PmsCredentials {
        api_base_url: "http://pms.invalid".to_string(),
        client_id: "itest".to_string(),
        client_secret: "secret".to_string(),
    };
    let config = serde_json::from_value(json!({
        "base_rates": {"deluxe": 200.0, "standard": 120.0},
        "demand_multiplier": 1.0,
    }))
    .unwrap();
    assert!(stack
        .registry
        .register_property(property_id, property_id, "local", &credentials, tier, config)
        .await
        .unwrap());
}

fn envelope(
    request_id: &str,
    agent_id: &str,
    target: &str,
    intent_type: &str,
    payload: serde_json::Value,
) -> serde_json::Value {
    json!({
        "protocol_version": PROTOCOL_VERSION,
        "request_id": request_id,
        "timestamp": chrono::Utc::now(),
        "agent_id": agent_id,
        "target_domain": "hospitality",
        "target_entity_id": target,
        "intent_type": intent_type,
        "intent_payload": payload,
    })
}

fn stay() -> serde_json::Value {
    json!({"check_in": "2026-10-05", "check_out": "2026-10-08", "room_type": "deluxe"})
}

fn guest() -> serde_json::Value {
    json!({
        "guest_name": "Margaret Hamilton",
        "guest_email": "margaret@example.com",
        "check_in": "2026-10-05",
        "check_out": "2026-10-08",
        "room_type": "deluxe",
    })
}

async fn send(stack: &TestStack, request: serde_json::Value) -> AcpResponse {
    stack.gateway.handle(request).await
}

#[tokio::test]
async fn test_pending_agent_is_refused_until_verified() {
    let stack = setup().await;
    onboard_property(&stack, "hotel-1", PropertyTier::Standard).await;

    let identity = AgentIdentity::new_pending(
        "new-agency".to_string(),
        "New Agency".to_string(),
        vec!["hospitality".to_string()],
    );
    stack.authenticator.register_agent(&identity).await.unwrap();

    let response = send(&stack, envelope("r1", "new-agency", "hotel-1", "query", stay())).await;
    assert_eq!(response.status_code, 401);

    stack
        .authenticator
        .set_verification_status("new-agency", VerificationStatus::Verified)
        .await
        .unwrap();
    let response = send(&stack, envelope("r2", "new-agency", "hotel-1", "query", stay())).await;
    assert_eq!(response.status_code, 200);
    assert_eq!(response.gateway_node_id, "gw-itest");
}

#[tokio::test]
async fn test_suspension_cuts_off_an_active_agent() {
    let stack = setup().await;
    onboard_agent(&stack, "agency-1", 0.5).await;
    onboard_property(&stack, "hotel-1", PropertyTier::Standard).await;

    let response = send(&stack, envelope("r1", "agency-1", "hotel-1", "query", stay())).await;
    assert_eq!(response.status_code, 200);

    stack
        .authenticator
        .set_verification_status("agency-1", VerificationStatus::Suspended)
        .await
        .unwrap();
    let response = send(&stack, envelope("r2", "agency-1", "hotel-1", "query", stay())).await;
    assert_eq!(response.status_code, 401);
}

#[tokio::test]
async fn test_full_booking_flow_negotiate_dry_run_execute() {
    let stack = setup().await;
    onboard_agent(&stack, "agency-1", 0.5).await;
    onboard_property(&stack, "hotel-1", PropertyTier::Standard).await;

    // open the negotiation; 200 - 200 * 0.5 * 0.15 = 185
    let response = send(&stack, envelope("neg-1", "agency-1", "hotel-1", "negotiate", stay())).await;
    assert_eq!(response.status, ResponseStatus::Counter);
    assert_eq!(response.payload["offer"]["price"], json!(185.0));
    let session_id = response.negotiation_session_id.unwrap();

    // meet the standing offer to close
    let mut counter = stay();
    counter["counter_price"] = json!(185.0);
    let mut request = envelope("neg-2", "agency-1", "hotel-1", "negotiate", counter);
    request["agent_context"] = json!({"negotiation_session_id": session_id});
    let response = send(&stack, request).await;
    assert_eq!(response.status, ResponseStatus::Negotiated);

    // dry-run validates the negotiated offer without booking
    let mut dry = guest();
    dry["dry_run"] = json!(true);
    let mut request = envelope("dry-1", "agency-1", "hotel-1", "execute", dry);
    request["agent_context"] = json!({"negotiation_session_id": session_id});
    let response = send(&stack, request).await;
    assert_eq!(response.status, ResponseStatus::Accepted);
    assert_eq!(response.payload["result"]["dry_run"], json!(true));
    // three nights at the agreed 185
    assert_eq!(response.payload["result"]["total_price"], json!(555.0));

    // commit the booking
    let mut request = envelope("exec-1", "agency-1", "hotel-1", "execute", guest());
    request["agent_context"] = json!({"negotiation_session_id": session_id});
    let response = send(&stack, request).await;
    assert_eq!(response.status, ResponseStatus::Confirmed);
    assert_eq!(response.status_code, 200);
    let reference = response.payload["result"]["booking_reference"].clone();
    assert!(reference.as_str().unwrap().starts_with("LOC-"));

    // replaying the execute yields the identical cached result
    let mut request = envelope("exec-1", "agency-1", "hotel-1", "execute", guest());
    request["agent_context"] = json!({"negotiation_session_id": session_id});
    let response = send(&stack, request).await;
    assert_eq!(response.status, ResponseStatus::Confirmed);
    assert_eq!(response.payload["result"]["booking_reference"], reference);
    assert_eq!(response.payload["idempotent_replay"], json!(true));
}

#[tokio::test]
async fn test_negotiation_survives_engine_restart() {
    let stack = setup().await;
    onboard_agent(&stack, "agency-1", 0.5).await;
    onboard_property(&stack, "hotel-1", PropertyTier::Standard).await;

    let response = send(&stack, envelope("neg-1", "agency-1", "hotel-1", "negotiate", stay())).await;
    assert_eq!(response.status, ResponseStatus::Counter);
    let session_id = response.negotiation_session_id.unwrap();

    // a second gateway instance over the same store: the session must be
    // reconstructable from the persisted transaction alone
    let second = Gateway::new(
        "gw-itest-2".to_string(),
        stack.authenticator.clone(),
        stack.registry.clone(),
        stack.store.clone(),
        NegotiationEngine::new(5),
        Arc::new(LocalAdapterFactory) as Arc<dyn AdapterFactory>,
    );

    let mut counter = stay();
    counter["counter_price"] = json!(185.0);
    let mut request = envelope("neg-2", "agency-1", "hotel-1", "negotiate", counter);
    request["agent_context"] = json!({"negotiation_session_id": session_id});
    let response = second.handle(request).await;
    assert_eq!(response.status, ResponseStatus::Negotiated);
    assert_eq!(response.payload["offer"]["price"], json!(185.0));
}

#[tokio::test]
async fn test_round_cap_ends_negotiation_with_rejection() {
    let stack = setup().await;
    onboard_agent(&stack, "agency-1", 0.0).await;
    onboard_property(&stack, "hotel-1", PropertyTier::Luxury).await;

    let response = send(&stack, envelope("neg-1", "agency-1", "hotel-1", "negotiate", stay())).await;
    assert_eq!(response.status, ResponseStatus::Counter);
    let session_id = response.negotiation_session_id.unwrap();

    // lowball every round; rounds 2..=5 counter, then the cap rejects
    let mut last_status = ResponseStatus::Counter;
    for i in 0..5 {
        let mut counter = stay();
        counter["counter_price"] = json!(1.0);
        let mut request = envelope(
            &format!("neg-{}", i + 2),
            "agency-1",
            "hotel-1",
            "negotiate",
            counter,
        );
        request["agent_context"] = json!({"negotiation_session_id": session_id});
        let response = send(&stack, request).await;
        last_status = response.status;
        if response.status == ResponseStatus::Rejected {
            assert_eq!(response.status_code, 409);
            break;
        }
        assert_eq!(response.status, ResponseStatus::Counter);
    }
    assert_eq!(last_status, ResponseStatus::Rejected);
}

#[tokio::test]
async fn test_wildcard_discovery_spans_active_properties_only() {
    let stack = setup().await;
    onboard_agent(&stack, "agency-1", 0.5).await;
    onboard_property(&stack, "hotel-1", PropertyTier::Budget).await;
    onboard_property(&stack, "hotel-2", PropertyTier::Standard).await;
    onboard_property(&stack, "hotel-3", PropertyTier::Luxury).await;
    stack
        .registry
        .pause_property("hotel-2", "seasonal closure")
        .await
        .unwrap();

    let response = send(&stack, envelope("r1", "agency-1", "*", "discover", stay())).await;
    assert_eq!(response.status_code, 200);
    assert_eq!(response.payload["total_found"], json!(2));
}

#[tokio::test]
async fn test_failed_execute_remains_retryable() {
    let stack = setup().await;
    onboard_agent(&stack, "agency-1", 0.5).await;
    onboard_property(&stack, "hotel-1", PropertyTier::Standard).await;

    // execute with no negotiation behind it fails with a conflict...
    let response = send(&stack, envelope("exec-1", "agency-1", "hotel-1", "execute", guest())).await;
    assert_eq!(response.status, ResponseStatus::Rejected);
    assert_eq!(response.status_code, 409);

    // ...and nothing was cached for the request id, so the same id succeeds
    // once a negotiation has been closed
    let mut request = envelope("neg-1", "agency-1", "hotel-1", "negotiate", stay());
    request["constraints"] = json!({"budget_max": 1000.0});
    let response = send(&stack, request).await;
    assert_eq!(response.status, ResponseStatus::Negotiated);
    let session_id = response.negotiation_session_id.unwrap();

    let mut request = envelope("exec-1", "agency-1", "hotel-1", "execute", guest());
    request["agent_context"] = json!({"negotiation_session_id": session_id});
    let response = send(&stack, request).await;
    assert_eq!(response.status, ResponseStatus::Confirmed);
}
