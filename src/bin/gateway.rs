use acp_gateway::{
    config::{create_default_config_file, AppConfig},
    model::{AgentIdentity, PropertyTier, VerificationStatus},
    registry::PmsCredentials,
    AdapterFactory, Authenticator, Gateway, NegotiationEngine, PropertyRegistry,
    StandardAdapterFactory, TransactionStore,
};
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use clap::Parser;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

#[derive(Parser)]
#[command(name = "acp-gateway")]
#[command(about = "Agent Commerce Protocol gateway for affiliated properties")]
struct Args {
    #[arg(short, long, default_value = "gateway.toml")]
    config: String,

    /// Write a default config file to the given path and exit.
    #[arg(long)]
    init_config: bool,
}

#[derive(Clone)]
struct AppState {
    gateway: Arc<Gateway>,
    authenticator: Authenticator,
    registry: PropertyRegistry,
    default_requests_per_minute: u32,
    admin_token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.init_config {
        create_default_config_file(&args.config)?;
        println!("Wrote default config to {}", args.config);
        return Ok(());
    }

    let config = AppConfig::load_with_env_overrides(&args.config)?;
    config.validate()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .init();

    let pool = acp_gateway::db::connect(&config.database.url).await?;
    let authenticator = Authenticator::new(pool.clone(), config.trust.min_execute_reputation);
    let registry = PropertyRegistry::new(pool.clone());
    let store = TransactionStore::new(pool);

    let factory: Arc<dyn AdapterFactory> = Arc::new(StandardAdapterFactory::new(
        acp_gateway::CircuitBreakerConfig {
            failure_threshold: config.upstream.failure_threshold,
            cooldown: Duration::from_secs(config.upstream.cooldown_secs),
        },
        Duration::from_secs(config.cache.ttl_secs),
        config.upstream.rate_limit_retries,
        Duration::from_secs(config.upstream.request_timeout_secs),
    ));

    let gateway = Arc::new(Gateway::new(
        config.server.node_id.clone(),
        authenticator.clone(),
        registry.clone(),
        store.clone(),
        NegotiationEngine::new(config.negotiation.max_rounds),
        factory,
    ));

    // daily retention sweep over the idempotency cache
    let retention_days = config.idempotency.retention_days;
    let gc_store = store.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
        loop {
            interval.tick().await;
            match gc_store.cleanup_old_idempotency_records(retention_days).await {
                Ok(removed) if removed > 0 => {
                    tracing::info!(removed, "pruned idempotency records")
                }
                Ok(_) => {}
                Err(e) => tracing::error!("idempotency cleanup failed: {}", e),
            }
        }
    });

    let state = AppState {
        gateway,
        authenticator,
        registry,
        default_requests_per_minute: config.trust.default_requests_per_minute,
        admin_token: config.trust.admin_token.clone(),
    };

    let app = Router::new()
        .route("/acp/v1/requests", post(handle_acp_request))
        .route("/acp/v1/agents", post(register_agent))
        .route("/admin/agents/:agent_id/verify", post(verify_agent))
        .route("/admin/agents/:agent_id/suspend", post(suspend_agent))
        .route("/admin/properties", post(register_property))
        .route("/admin/properties/:property_id/pause", post(pause_property))
        .route("/admin/properties/:property_id/resume", post(resume_property))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = TcpListener::bind(config.server_address()).await?;
    tracing::info!(
        address = %config.server_address(),
        node_id = %config.server.node_id,
        "ACP gateway listening"
    );
    axum::serve(listener, app).await?;

    Ok(())
}

async fn handle_acp_request(
    State(state): State<AppState>,
    Json(envelope): Json<serde_json::Value>,
) -> Json<serde_json::Value> {
    let response = state.gateway.handle(envelope).await;
    Json(serde_json::json!(response))
}

#[derive(Deserialize)]
struct RegisterAgentRequest {
    agent_id: String,
    name: String,
    #[serde(default)]
    allowed_domains: Vec<String>,
}

/// Self-registration creates a pending identity; only an admin verify
/// unlocks authentication.
async fn register_agent(
    State(state): State<AppState>,
    Json(request): Json<RegisterAgentRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    let mut identity = AgentIdentity::new_pending(
        request.agent_id.clone(),
        request.name,
        if request.allowed_domains.is_empty() {
            vec!["hospitality".to_string()]
        } else {
            request.allowed_domains
        },
    );
    identity.requests_per_minute = state.default_requests_per_minute;

    match state.authenticator.register_agent(&identity).await {
        Ok(true) => (
            StatusCode::CREATED,
            Json(serde_json::json!({
                "status": "success",
                "agent_id": identity.agent_id,
                "verification_status": identity.verification_status,
            })),
        ),
        Ok(false) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({
                "status": "error",
                "message": format!("Agent {} already exists", request.agent_id),
            })),
        ),
        Err(e) => {
            tracing::error!("Failed to register agent: {}", e);
            internal_error(e)
        }
    }
}

async fn verify_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
) -> (StatusCode, Json<serde_json::Value>) {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    set_agent_status(&state, &agent_id, VerificationStatus::Verified).await
}

async fn suspend_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
) -> (StatusCode, Json<serde_json::Value>) {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    set_agent_status(&state, &agent_id, VerificationStatus::Suspended).await
}

async fn set_agent_status(
    state: &AppState,
    agent_id: &str,
    status: VerificationStatus,
) -> (StatusCode, Json<serde_json::Value>) {
    match state.authenticator.set_verification_status(agent_id, status).await {
        Ok(true) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "success",
                "agent_id": agent_id,
                "verification_status": status,
            })),
        ),
        Ok(false) => not_found(format!("Agent {agent_id} not found")),
        Err(e) => {
            tracing::error!("Failed to update agent status: {}", e);
            internal_error(e)
        }
    }
}

#[derive(Deserialize)]
struct RegisterPropertyRequest {
    property_id: String,
    name: String,
    pms_type: String,
    credentials: PmsCredentials,
    tier: PropertyTier,
    #[serde(default)]
    config: HashMap<String, serde_json::Value>,
}

async fn register_property(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<RegisterPropertyRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    match state
        .registry
        .register_property(
            &request.property_id,
            &request.name,
            &request.pms_type,
            &request.credentials,
            request.tier,
            request.config,
        )
        .await
    {
        Ok(true) => (
            StatusCode::CREATED,
            Json(serde_json::json!({
                "status": "success",
                "property_id": request.property_id,
            })),
        ),
        Ok(false) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({
                "status": "error",
                "message": format!("Property {} already exists", request.property_id),
            })),
        ),
        Err(e) => {
            tracing::error!("Failed to register property: {}", e);
            internal_error(e)
        }
    }
}

#[derive(Deserialize)]
struct PauseRequest {
    reason: String,
}

async fn pause_property(
    State(state): State<AppState>,
    Path(property_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<PauseRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    match state.registry.pause_property(&property_id, &request.reason).await {
        Ok(true) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "success", "property_id": property_id})),
        ),
        Ok(false) => not_found(format!("Property {property_id} not found")),
        Err(e) => {
            tracing::error!("Failed to pause property: {}", e);
            internal_error(e)
        }
    }
}

async fn resume_property(
    State(state): State<AppState>,
    Path(property_id): Path<String>,
    headers: HeaderMap,
) -> (StatusCode, Json<serde_json::Value>) {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    match state.registry.resume_property(&property_id).await {
        Ok(true) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "success", "property_id": property_id})),
        ),
        Ok(false) => not_found(format!("Property {property_id} not found")),
        Err(e) => {
            tracing::error!("Failed to resume property: {}", e);
            internal_error(e)
        }
    }
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "healthy"}))
}

type AdminCheck = Result<(), (StatusCode, Json<serde_json::Value>)>;

/// The privileged endpoints sit behind a static bearer token. With no token
/// configured they are disabled outright.
fn require_admin(state: &AppState, headers: &HeaderMap) -> AdminCheck {
    let Some(ref expected) = state.admin_token else {
        return Err((
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({
                "status": "error",
                "message": "Admin endpoints are disabled: no admin token configured",
            })),
        ));
    };

    let presented = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    if presented == Some(expected.as_str()) {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({
                "status": "error",
                "message": "Missing or invalid admin token",
            })),
        ))
    }
}

fn not_found(message: String) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({"status": "error", "message": message})),
    )
}

fn internal_error(e: acp_gateway::GatewayError) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"status": "error", "message": e.to_string()})),
    )
}
