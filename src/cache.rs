//! In-memory availability cache for remote PMS adapters.
//!
//! Entries are keyed by the full query shape and expire lazily after a
//! fixed TTL. A confirmed booking invalidates every cached entry whose
//! date range overlaps the booked stay, so the next query goes upstream.

use chrono::NaiveDate;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::model::RoomOffer;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub property_id: String,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub room_type: Option<String>,
}

struct Entry {
    offers: Vec<RoomOffer>,
    inserted_at: Instant,
}

pub struct InventoryCache {
    entries: RwLock<HashMap<CacheKey, Entry>>,
    ttl: Duration,
}

impl InventoryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<Vec<RoomOffer>> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&self, key: &CacheKey, now: Instant) -> Option<Vec<RoomOffer>> {
        {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if now.duration_since(entry.inserted_at) < self.ttl => {
                    return Some(entry.offers.clone());
                }
                Some(_) => {}
                None => return None,
            }
        }
        // expired: drop it so the map does not grow unbounded
        self.entries.write().remove(key);
        None
    }

    pub fn put(&self, key: CacheKey, offers: Vec<RoomOffer>) {
        self.put_at(key, offers, Instant::now());
    }

    pub fn put_at(&self, key: CacheKey, offers: Vec<RoomOffer>, now: Instant) {
        self.entries.write().insert(
            key,
            Entry {
                offers,
                inserted_at: now,
            },
        );
    }

    /// Drop every cached entry for `property_id` whose date range overlaps
    /// `[check_in, check_out)`. Called after a successful booking.
    pub fn invalidate_overlapping(&self, property_id: &str, check_in: NaiveDate, check_out: NaiveDate) {
        let mut entries = self.entries.write();
        entries.retain(|key, _| {
            key.property_id != property_id || key.check_in >= check_out || key.check_out <= check_in
        });
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.read().len()
    }
}
