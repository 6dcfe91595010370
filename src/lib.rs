//! # ACP Gateway
//!
//! An Agent Commerce Protocol (ACP) gateway that lets autonomous software
//! agents discover, negotiate, and book inventory at affiliated properties
//! through a single structured endpoint.
//!
//! ## Architecture
//!
//! - **Gateway**: single protocol entry point dispatching typed intents
//! - **Authenticator**: agent identity, rate limiting, authorization policy
//! - **TransactionStore**: booking state machine + idempotency cache (SQLite)
//! - **NegotiationEngine**: bounded multi-round counter-offer protocol
//! - **DomainAdapter**: local reference adapter and a resilient remote
//!   adapter (circuit breaker + inventory cache) over a property's PMS
//! - **PropertyRegistry**: per-property config and encoded PMS credentials

pub mod adapter;
pub mod breaker;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod model;
pub mod negotiation;
pub mod registry;
pub mod store;
pub mod trust;

pub use adapter::{
    AdapterFactory, DomainAdapter, LocalAdapter, LocalAdapterFactory, RemoteAdapter,
    StandardAdapterFactory,
};
pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use cache::{CacheKey, InventoryCache};
pub use config::AppConfig;
pub use error::{GatewayError, Result};
pub use gateway::{CommissionLedger, Gateway, MonitoringDashboard, TracingDashboard, TracingLedger};
pub use model::{AcpRequest, AcpResponse, AgentIdentity, Intent, Offer, Property, Transaction};
pub use negotiation::{NegotiationEngine, NegotiationSession, PricingPolicy, StandardPolicy};
pub use registry::PropertyRegistry;
pub use store::TransactionStore;
pub use trust::Authenticator;

pub type TransactionId = uuid::Uuid;
