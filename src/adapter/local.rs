//! Synthetic in-process adapter. Serves deterministic inventory from the
//! property's config map, so negotiation and booking flows run without any
//! upstream PMS. Also the reference implementation adapter authors can
//! compare against.

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Utc, Weekday};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::GatewayError;
use crate::model::{AvailabilityQuery, ExecutePayload, ExecutionResult, Property, RoomOffer, Transaction};
use crate::Result;

use super::DomainAdapter;

const DEFAULT_ROOMS_AVAILABLE: u32 = 5;

fn default_rates() -> HashMap<String, f64> {
    HashMap::from([
        ("standard".to_string(), 120.0),
        ("deluxe".to_string(), 200.0),
        ("suite".to_string(), 320.0),
    ])
}

pub struct LocalAdapter {
    property_id: String,
    /// Nightly base rate per room type, overridable via property config
    /// key `base_rates`.
    rates: HashMap<String, f64>,
    /// Fixed multiplier from config key `demand_multiplier`; when absent,
    /// derived deterministically from the check-in weekday.
    demand_override: Option<f64>,
    rooms_available: u32,
    bookings: AtomicU32,
    /// When set via config key `fail_queries`, every read fails. Lets
    /// tests exercise partial fan-out failure and the circuit breaker.
    fail_queries: bool,
}

impl LocalAdapter {
    pub fn new(property: &Property) -> Self {
        let rates = property
            .config
            .get("base_rates")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_else(default_rates);
        let demand_override = property
            .config
            .get("demand_multiplier")
            .and_then(|v| v.as_f64());
        let rooms_available = property
            .config
            .get("rooms_available")
            .and_then(|v| v.as_u64())
            .map(|n| n as u32)
            .unwrap_or(DEFAULT_ROOMS_AVAILABLE);
        let fail_queries = property
            .config
            .get("fail_queries")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        Self {
            property_id: property.property_id.clone(),
            rates,
            demand_override,
            rooms_available,
            bookings: AtomicU32::new(0),
            fail_queries,
        }
    }

    /// Number of real (non-dry-run) bookings this instance performed.
    pub fn bookings_made(&self) -> u32 {
        self.bookings.load(Ordering::SeqCst)
    }

    fn rate_for(&self, room_type: &str) -> Result<f64> {
        self.rates.get(room_type).copied().ok_or_else(|| {
            GatewayError::NotFound(format!(
                "Room type {room_type} at property {}",
                self.property_id
            ))
        })
    }

    fn multiplier_for(&self, check_in: NaiveDate) -> f64 {
        if let Some(m) = self.demand_override {
            return m;
        }
        // weekend stays carry a modest premium
        match check_in.weekday() {
            Weekday::Fri | Weekday::Sat => 1.15,
            _ => 1.0,
        }
    }
}

#[async_trait]
impl DomainAdapter for LocalAdapter {
    fn property_id(&self) -> &str {
        &self.property_id
    }

    async fn query(&self, query: &AvailabilityQuery) -> Result<Vec<RoomOffer>> {
        if self.fail_queries {
            return Err(GatewayError::Upstream(format!(
                "PMS unavailable for property {}",
                self.property_id
            )));
        }
        let multiplier = self.multiplier_for(query.check_in);
        let mut offers: Vec<RoomOffer> = self
            .rates
            .iter()
            .filter(|(room_type, _)| {
                query
                    .room_type
                    .as_ref()
                    .map(|wanted| wanted == *room_type)
                    .unwrap_or(true)
            })
            .map(|(room_type, rate)| RoomOffer {
                property_id: self.property_id.clone(),
                room_type: room_type.clone(),
                nightly_rate: rate * multiplier,
                currency: "USD".to_string(),
                available: self.rooms_available,
            })
            .collect();
        offers.sort_by(|a, b| a.nightly_rate.total_cmp(&b.nightly_rate));
        Ok(offers)
    }

    async fn base_price(
        &self,
        _check_in: NaiveDate,
        _check_out: NaiveDate,
        room_type: &str,
    ) -> Result<f64> {
        self.rate_for(room_type)
    }

    async fn demand_multiplier(&self, check_in: NaiveDate, _check_out: NaiveDate) -> Result<f64> {
        if self.fail_queries {
            return Err(GatewayError::Upstream(format!(
                "PMS unavailable for property {}",
                self.property_id
            )));
        }
        Ok(self.multiplier_for(check_in))
    }

    async fn execute(&self, tx: &Transaction, payload: &ExecutePayload) -> Result<ExecutionResult> {
        let nights = (payload.check_out - payload.check_in).num_days().max(1) as f64;
        let total_price = match &tx.current_offer {
            Some(offer) => offer.price * nights,
            None => self.rate_for(&payload.room_type)? * nights,
        };
        let booking_reference = if payload.dry_run {
            format!("DRY-{}", tx.tx_id.simple())
        } else {
            let seq = self.bookings.fetch_add(1, Ordering::SeqCst) + 1;
            format!("LOC-{}-{seq:04}", self.property_id.to_uppercase())
        };
        Ok(ExecutionResult {
            booking_reference,
            property_id: self.property_id.clone(),
            room_type: payload.room_type.clone(),
            check_in: payload.check_in,
            check_out: payload.check_out,
            total_price,
            currency: "USD".to_string(),
            dry_run: payload.dry_run,
            executed_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PropertyTier;

    fn property(config: serde_json::Value) -> Property {
        Property {
            property_id: "hotel-1".to_string(),
            name: "Test Hotel".to_string(),
            pms_type: "local".to_string(),
            credentials: String::new(),
            tier: PropertyTier::Standard,
            is_active: true,
            paused_reason: None,
            config: serde_json::from_value(config).unwrap(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn stay() -> AvailabilityQuery {
        AvailabilityQuery {
            // a Monday, so no weekend premium
            check_in: date("2026-09-07"),
            check_out: date("2026-09-09"),
            room_type: None,
            guests: Some(2),
        }
    }

    #[tokio::test]
    async fn test_query_respects_config_rates() {
        let adapter = LocalAdapter::new(&property(serde_json::json!({
            "base_rates": {"deluxe": 400.0},
            "rooms_available": 2,
        })));
        let offers = adapter.query(&stay()).await.unwrap();
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].room_type, "deluxe");
        assert_eq!(offers[0].nightly_rate, 400.0);
        assert_eq!(offers[0].available, 2);
    }

    #[tokio::test]
    async fn test_room_type_filter_and_unknown_type() {
        let adapter = LocalAdapter::new(&property(serde_json::json!({})));
        let mut q = stay();
        q.room_type = Some("suite".to_string());
        let offers = adapter.query(&q).await.unwrap();
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].room_type, "suite");

        let err = adapter
            .base_price(q.check_in, q.check_out, "penthouse")
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn test_weekend_premium_unless_overridden() {
        let adapter = LocalAdapter::new(&property(serde_json::json!({})));
        let friday = date("2026-09-11");
        let monday = date("2026-09-07");
        assert_eq!(
            adapter.demand_multiplier(friday, friday).await.unwrap(),
            1.15
        );
        assert_eq!(
            adapter.demand_multiplier(monday, monday).await.unwrap(),
            1.0
        );

        let fixed = LocalAdapter::new(&property(serde_json::json!({"demand_multiplier": 1.4})));
        assert_eq!(fixed.demand_multiplier(friday, friday).await.unwrap(), 1.4);
    }

    #[tokio::test]
    async fn test_dry_run_does_not_consume_a_booking() {
        let adapter = LocalAdapter::new(&property(serde_json::json!({})));
        let tx = Transaction::new("req-1".into(), "agent-1".into(), "hotel-1".into());
        let mut payload = ExecutePayload {
            guest_name: "Ada".to_string(),
            guest_email: "ada@example.com".to_string(),
            check_in: date("2026-09-07"),
            check_out: date("2026-09-09"),
            room_type: "standard".to_string(),
            dry_run: true,
        };

        let dry = adapter.execute(&tx, &payload).await.unwrap();
        assert!(dry.dry_run);
        assert!(dry.booking_reference.starts_with("DRY-"));
        assert_eq!(adapter.bookings_made(), 0);

        payload.dry_run = false;
        let real = adapter.execute(&tx, &payload).await.unwrap();
        assert!(!real.dry_run);
        assert_eq!(real.total_price, 240.0);
        assert_eq!(adapter.bookings_made(), 1);
    }

    #[tokio::test]
    async fn test_configured_failure_mode() {
        let adapter = LocalAdapter::new(&property(serde_json::json!({"fail_queries": true})));
        let err = adapter.query(&stay()).await.unwrap_err();
        assert_eq!(err.status_code(), 502);
    }
}
