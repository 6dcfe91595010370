//! Domain adapters translate protocol intents into property-management
//! system (PMS) operations. The gateway sees one trait; behind it sit a
//! local reference implementation and a resilient HTTP client.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::sync::Arc;
use std::time::Duration;

use crate::breaker::CircuitBreakerConfig;
use crate::model::{AvailabilityQuery, ExecutePayload, ExecutionResult, Property, RoomOffer, Transaction};
use crate::registry::PmsCredentials;
use crate::Result;

mod local;
mod remote;

pub use local::LocalAdapter;
pub use remote::RemoteAdapter;

/// One adapter instance serves one property; resilience state (circuit
/// breaker, availability cache) lives inside the instance.
#[async_trait]
pub trait DomainAdapter: Send + Sync {
    fn property_id(&self) -> &str;

    /// Room availability for a stay, possibly served from cache.
    async fn query(&self, query: &AvailabilityQuery) -> Result<Vec<RoomOffer>>;

    /// Undiscounted nightly rate for the stay, used as the negotiation anchor.
    async fn base_price(
        &self,
        check_in: NaiveDate,
        check_out: NaiveDate,
        room_type: &str,
    ) -> Result<f64>;

    /// Demand multiplier for the stay dates, typically in [0.8, 2.0].
    async fn demand_multiplier(&self, check_in: NaiveDate, check_out: NaiveDate) -> Result<f64>;

    /// Perform (or, when `payload.dry_run` is set, simulate) the booking.
    async fn execute(&self, tx: &Transaction, payload: &ExecutePayload) -> Result<ExecutionResult>;
}

/// Builds the adapter for a property. The gateway caches the result, so a
/// factory is only consulted once per property per process.
pub trait AdapterFactory: Send + Sync {
    fn create(&self, property: &Property, credentials: &PmsCredentials)
        -> Result<Arc<dyn DomainAdapter>>;
}

/// Every property gets a local synthetic adapter. Used by tests and demos.
#[derive(Default)]
pub struct LocalAdapterFactory;

impl AdapterFactory for LocalAdapterFactory {
    fn create(
        &self,
        property: &Property,
        _credentials: &PmsCredentials,
    ) -> Result<Arc<dyn DomainAdapter>> {
        Ok(Arc::new(LocalAdapter::new(property)))
    }
}

/// Production factory: `pms_type = "local"` gets the synthetic adapter,
/// anything else gets the HTTP adapter against the property's PMS.
pub struct StandardAdapterFactory {
    breaker_config: CircuitBreakerConfig,
    cache_ttl: Duration,
    rate_limit_retries: u32,
    request_timeout: Duration,
}

impl StandardAdapterFactory {
    pub fn new(
        breaker_config: CircuitBreakerConfig,
        cache_ttl: Duration,
        rate_limit_retries: u32,
        request_timeout: Duration,
    ) -> Self {
        Self {
            breaker_config,
            cache_ttl,
            rate_limit_retries,
            request_timeout,
        }
    }
}

impl AdapterFactory for StandardAdapterFactory {
    fn create(
        &self,
        property: &Property,
        credentials: &PmsCredentials,
    ) -> Result<Arc<dyn DomainAdapter>> {
        if property.pms_type == "local" {
            return Ok(Arc::new(LocalAdapter::new(property)));
        }
        Ok(Arc::new(RemoteAdapter::new(
            property.property_id.clone(),
            credentials.clone(),
            self.breaker_config.clone(),
            self.cache_ttl,
            self.rate_limit_retries,
            self.request_timeout,
        )?))
    }
}
