//! HTTP adapter for a property's hosted PMS. Wraps every upstream call in
//! a circuit breaker, serves availability through a short-TTL cache, and
//! retries rate-limited responses with a fixed backoff schedule.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use parking_lot::RwLock;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::cache::{CacheKey, InventoryCache};
use crate::error::GatewayError;
use crate::model::{AvailabilityQuery, ExecutePayload, ExecutionResult, RoomOffer, Transaction};
use crate::registry::PmsCredentials;
use crate::Result;

use super::DomainAdapter;

/// Renew the bearer token this long before the PMS says it expires.
const TOKEN_RENEWAL_SLACK: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct AvailabilityResponse {
    rooms: Vec<RemoteRoom>,
}

#[derive(Debug, Deserialize)]
struct RemoteRoom {
    room_type: String,
    nightly_rate: f64,
    currency: String,
    available: u32,
}

#[derive(Debug, Deserialize)]
struct RateResponse {
    nightly_rate: f64,
}

#[derive(Debug, Deserialize)]
struct DemandResponse {
    multiplier: f64,
}

#[derive(Debug, Serialize)]
struct BookingRequest<'a> {
    guest_name: &'a str,
    guest_email: &'a str,
    check_in: NaiveDate,
    check_out: NaiveDate,
    room_type: &'a str,
    agreed_total: Option<f64>,
    client_reference: String,
}

#[derive(Debug, Deserialize)]
struct BookingResponse {
    booking_reference: String,
    total_price: f64,
    currency: String,
}

pub struct RemoteAdapter {
    property_id: String,
    credentials: PmsCredentials,
    http: Client,
    breaker: CircuitBreaker,
    cache: InventoryCache,
    token: RwLock<Option<(String, Instant)>>,
    rate_limit_retries: u32,
}

impl RemoteAdapter {
    pub fn new(
        property_id: String,
        credentials: PmsCredentials,
        breaker_config: CircuitBreakerConfig,
        cache_ttl: Duration,
        rate_limit_retries: u32,
        request_timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            property_id,
            credentials,
            http,
            breaker: CircuitBreaker::new(breaker_config),
            cache: InventoryCache::new(cache_ttl),
            token: RwLock::new(None),
            rate_limit_retries,
        })
    }

    #[cfg(test)]
    pub(crate) fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.credentials.api_base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn bearer_token(&self) -> Result<String> {
        if let Some((token, expires_at)) = self.token.read().clone() {
            if Instant::now() < expires_at {
                return Ok(token);
            }
        }
        debug!(property_id = %self.property_id, "refreshing PMS bearer token");
        let resp = self
            .http
            .post(self.url("oauth/token"))
            .json(&serde_json::json!({
                "grant_type": "client_credentials",
                "client_id": self.credentials.client_id,
                "client_secret": self.credentials.client_secret,
            }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(GatewayError::Upstream(format!(
                "Token refresh failed for property {}: {}",
                self.property_id,
                resp.status()
            )));
        }
        let body: TokenResponse = resp.json().await?;
        let expires_at = Instant::now() + Duration::from_secs(body.expires_in)
            - TOKEN_RENEWAL_SLACK.min(Duration::from_secs(body.expires_in));
        *self.token.write() = Some((body.access_token.clone(), expires_at));
        Ok(body.access_token)
    }

    /// One guarded upstream call: breaker check, auth, rate-limit retries.
    /// Only the final disposition is reported to the breaker, so a request
    /// that recovers after a 429 does not count as a failure.
    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T> {
        if !self.breaker.proceed() {
            return Err(GatewayError::CircuitOpen(self.property_id.clone()));
        }
        match self.call_with_retries(method, path, body).await {
            Ok(value) => {
                self.breaker.record_success();
                Ok(value)
            }
            Err(err) => {
                self.breaker.record_failure();
                Err(err)
            }
        }
    }

    async fn call_with_retries<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T> {
        let token = self.bearer_token().await?;
        let url = self.url(path);
        let mut attempt: u32 = 0;
        loop {
            let mut req = self
                .http
                .request(method.clone(), &url)
                .bearer_auth(&token);
            if let Some(ref json) = body {
                req = req.json(json);
            }
            let resp = req.send().await?;
            let status = resp.status();
            if status == StatusCode::TOO_MANY_REQUESTS && attempt < self.rate_limit_retries {
                let delay = Duration::from_secs(1 << attempt);
                warn!(
                    property_id = %self.property_id,
                    attempt,
                    delay_secs = delay.as_secs(),
                    "PMS rate limited, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }
            if !status.is_success() {
                return Err(GatewayError::Upstream(format!(
                    "PMS returned {status} for {url}"
                )));
            }
            return Ok(resp.json().await?);
        }
    }

    fn cache_key(&self, query: &AvailabilityQuery) -> CacheKey {
        CacheKey {
            property_id: self.property_id.clone(),
            check_in: query.check_in,
            check_out: query.check_out,
            room_type: query.room_type.clone(),
        }
    }
}

#[async_trait]
impl DomainAdapter for RemoteAdapter {
    fn property_id(&self) -> &str {
        &self.property_id
    }

    async fn query(&self, query: &AvailabilityQuery) -> Result<Vec<RoomOffer>> {
        let key = self.cache_key(query);
        if let Some(offers) = self.cache.get(&key) {
            debug!(property_id = %self.property_id, "availability cache hit");
            return Ok(offers);
        }
        let mut path = format!(
            "availability?check_in={}&check_out={}",
            query.check_in, query.check_out
        );
        if let Some(ref room_type) = query.room_type {
            path.push_str(&format!("&room_type={room_type}"));
        }
        if let Some(guests) = query.guests {
            path.push_str(&format!("&guests={guests}"));
        }
        let body: AvailabilityResponse = self.call(Method::GET, &path, None).await?;
        let offers: Vec<RoomOffer> = body
            .rooms
            .into_iter()
            .map(|room| RoomOffer {
                property_id: self.property_id.clone(),
                room_type: room.room_type,
                nightly_rate: room.nightly_rate,
                currency: room.currency,
                available: room.available,
            })
            .collect();
        self.cache.put(key, offers.clone());
        Ok(offers)
    }

    async fn base_price(
        &self,
        check_in: NaiveDate,
        check_out: NaiveDate,
        room_type: &str,
    ) -> Result<f64> {
        let path = format!(
            "rates?check_in={check_in}&check_out={check_out}&room_type={room_type}"
        );
        let body: RateResponse = self.call(Method::GET, &path, None).await?;
        Ok(body.nightly_rate)
    }

    async fn demand_multiplier(&self, check_in: NaiveDate, check_out: NaiveDate) -> Result<f64> {
        let path = format!("demand?check_in={check_in}&check_out={check_out}");
        let body: DemandResponse = self.call(Method::GET, &path, None).await?;
        // guard against a misbehaving PMS skewing negotiations
        Ok(body.multiplier.clamp(0.5, 3.0))
    }

    async fn execute(&self, tx: &Transaction, payload: &ExecutePayload) -> Result<ExecutionResult> {
        let nights = (payload.check_out - payload.check_in).num_days().max(1) as f64;
        let agreed_total = tx.current_offer.as_ref().map(|o| o.price * nights);

        if payload.dry_run {
            // estimate without touching the booking endpoint
            let total_price = match agreed_total {
                Some(total) => total,
                None => {
                    self.base_price(payload.check_in, payload.check_out, &payload.room_type)
                        .await?
                        * nights
                }
            };
            return Ok(ExecutionResult {
                booking_reference: format!("DRY-{}", tx.tx_id.simple()),
                property_id: self.property_id.clone(),
                room_type: payload.room_type.clone(),
                check_in: payload.check_in,
                check_out: payload.check_out,
                total_price,
                currency: tx
                    .current_offer
                    .as_ref()
                    .map(|o| o.currency.clone())
                    .unwrap_or_else(|| "USD".to_string()),
                dry_run: true,
                executed_at: Utc::now(),
            });
        }

        let request = BookingRequest {
            guest_name: &payload.guest_name,
            guest_email: &payload.guest_email,
            check_in: payload.check_in,
            check_out: payload.check_out,
            room_type: &payload.room_type,
            agreed_total,
            client_reference: tx.tx_id.to_string(),
        };
        let body: BookingResponse = self
            .call(Method::POST, "bookings", Some(serde_json::to_value(&request)?))
            .await?;

        // stale availability for these dates must not be served again
        self.cache
            .invalidate_overlapping(&self.property_id, payload.check_in, payload.check_out);

        Ok(ExecutionResult {
            booking_reference: body.booking_reference,
            property_id: self.property_id.clone(),
            room_type: payload.room_type.clone(),
            check_in: payload.check_in,
            check_out: payload.check_out,
            total_price: body.total_price,
            currency: body.currency,
            dry_run: false,
            executed_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Offer;
    use std::collections::HashMap;

    fn adapter() -> RemoteAdapter {
        RemoteAdapter::new(
            "hotel-9".to_string(),
            PmsCredentials {
                api_base_url: "http://pms.invalid".to_string(),
                client_id: "gw".to_string(),
                client_secret: "secret".to_string(),
            },
            CircuitBreakerConfig::default(),
            Duration::from_secs(120),
            3,
            Duration::from_secs(2),
        )
        .unwrap()
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn stay() -> AvailabilityQuery {
        AvailabilityQuery {
            check_in: date("2026-09-07"),
            check_out: date("2026-09-09"),
            room_type: Some("deluxe".to_string()),
            guests: None,
        }
    }

    #[tokio::test]
    async fn test_open_breaker_short_circuits_before_http() {
        let adapter = adapter();
        for _ in 0..3 {
            adapter.breaker().record_failure();
        }
        let err = adapter.query(&stay()).await.unwrap_err();
        assert!(matches!(err, GatewayError::CircuitOpen(_)));
        assert_eq!(err.status_code(), 503);
    }

    #[tokio::test]
    async fn test_cached_availability_served_without_upstream() {
        let adapter = adapter();
        let key = adapter.cache_key(&stay());
        adapter.cache.put(
            key,
            vec![RoomOffer {
                property_id: "hotel-9".to_string(),
                room_type: "deluxe".to_string(),
                nightly_rate: 210.0,
                currency: "USD".to_string(),
                available: 3,
            }],
        );
        // no reachable upstream, so a hit proves the cache answered
        let offers = adapter.query(&stay()).await.unwrap();
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].nightly_rate, 210.0);
    }

    #[tokio::test]
    async fn test_dry_run_with_agreed_offer_skips_upstream() {
        let adapter = adapter();
        let mut tx = Transaction::new("req-1".into(), "agent-1".into(), "hotel-9".into());
        tx.current_offer = Some(Offer::new(150.0, "USD".to_string(), HashMap::new()));
        let payload = ExecutePayload {
            guest_name: "Ada".to_string(),
            guest_email: "ada@example.com".to_string(),
            check_in: date("2026-09-07"),
            check_out: date("2026-09-09"),
            room_type: "deluxe".to_string(),
            dry_run: true,
        };
        let result = adapter.execute(&tx, &payload).await.unwrap();
        assert!(result.dry_run);
        assert_eq!(result.total_price, 300.0);
        assert!(result.booking_reference.starts_with("DRY-"));
    }
}
