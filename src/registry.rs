//! Property registry: per-property config, encoded PMS credentials, and
//! the active/paused flag. Properties are never deleted; pausing excludes
//! them from discovery and new negotiations without touching history.

use crate::{
    error::{GatewayError, Result},
    model::{Property, PropertyTier},
};
use base64::{engine::general_purpose, Engine};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

/// Plaintext PMS connection material; exists in memory only while an
/// adapter is being constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PmsCredentials {
    pub api_base_url: String,
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Clone)]
pub struct PropertyRegistry {
    pool: SqlitePool,
}

impl PropertyRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Register a property. Returns false without overwriting if the
    /// property id already exists. Credentials are stored encoded.
    pub async fn register_property(
        &self,
        property_id: &str,
        name: &str,
        pms_type: &str,
        credentials: &PmsCredentials,
        tier: PropertyTier,
        config: HashMap<String, serde_json::Value>,
    ) -> Result<bool> {
        let encoded = encode_credentials(credentials)?;
        let now = Utc::now();

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO properties
                (property_id, name, pms_type, credentials, tier, is_active,
                 paused_reason, config, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 1, NULL, ?, ?, ?)
            "#,
        )
        .bind(property_id)
        .bind(name)
        .bind(pms_type)
        .bind(encoded)
        .bind(tier.as_str())
        .bind(serde_json::to_string(&config)?)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn get_property(&self, property_id: &str) -> Result<Option<Property>> {
        let row = sqlx::query(&format!("{SELECT_PROPERTY} WHERE property_id = ?"))
            .bind(property_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_property).transpose()
    }

    /// Resolve a property eligible for new business: it must exist and be
    /// active. Paused properties are invisible to discovery and negotiation.
    pub async fn get_active_property(&self, property_id: &str) -> Result<Property> {
        let property = self
            .get_property(property_id)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("Property {property_id}")))?;

        if !property.is_active {
            return Err(GatewayError::StateConflict(format!(
                "Property {property_id} is paused"
            )));
        }
        Ok(property)
    }

    pub async fn list_active_properties(&self) -> Result<Vec<Property>> {
        let rows = sqlx::query(&format!(
            "{SELECT_PROPERTY} WHERE is_active = 1 ORDER BY property_id"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_property).collect()
    }

    /// Pause a property, recording why. Confirmed transactions are left
    /// untouched.
    pub async fn pause_property(&self, property_id: &str, reason: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE properties SET is_active = 0, paused_reason = ?, updated_at = ? WHERE property_id = ?",
        )
        .bind(reason)
        .bind(Utc::now())
        .bind(property_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn resume_property(&self, property_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE properties SET is_active = 1, paused_reason = NULL, updated_at = ? WHERE property_id = ?",
        )
        .bind(Utc::now())
        .bind(property_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Internal decode path for adapter construction; the only place the
    /// stored blob becomes plaintext again.
    pub(crate) fn decode_credentials(&self, property: &Property) -> Result<PmsCredentials> {
        let bytes = general_purpose::STANDARD
            .decode(&property.credentials)
            .map_err(|e| GatewayError::Serialization(format!("Invalid credentials blob: {e}")))?;
        let creds: PmsCredentials = serde_json::from_slice(&bytes)?;
        Ok(creds)
    }
}

fn encode_credentials(credentials: &PmsCredentials) -> Result<String> {
    let json = serde_json::to_vec(credentials)?;
    Ok(general_purpose::STANDARD.encode(json))
}

const SELECT_PROPERTY: &str = r#"
    SELECT property_id, name, pms_type, credentials, tier, is_active,
           paused_reason, config, created_at, updated_at
    FROM properties
"#;

fn row_to_property(row: sqlx::sqlite::SqliteRow) -> Result<Property> {
    let config: HashMap<String, serde_json::Value> =
        serde_json::from_str(&row.get::<String, _>(7))?;

    Ok(Property {
        property_id: row.get(0),
        name: row.get(1),
        pms_type: row.get(2),
        credentials: row.get(3),
        tier: PropertyTier::parse(&row.get::<String, _>(4))?,
        is_active: row.get::<i64, _>(5) == 1,
        paused_reason: row.get(6),
        config,
        created_at: row.get(8),
        updated_at: row.get(9),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    async fn setup() -> (NamedTempFile, PropertyRegistry) {
        let temp = NamedTempFile::new().unwrap();
        let url = format!("sqlite://{}", temp.path().to_string_lossy());
        let pool = crate::db::connect(&url).await.unwrap();
        (temp, PropertyRegistry::new(pool))
    }

    fn creds() -> PmsCredentials {
        PmsCredentials {
            api_base_url: "https://pms.example.com".to_string(),
            client_id: "client-1".to_string(),
            client_secret: "s3cret".to_string(),
        }
    }

    #[tokio::test]
    async fn test_duplicate_registration_fails() {
        let (_tmp, registry) = setup().await;
        assert!(registry
            .register_property("p1", "Seaside", "opera", &creds(), PropertyTier::Luxury, HashMap::new())
            .await
            .unwrap());
        assert!(!registry
            .register_property("p1", "Other", "mews", &creds(), PropertyTier::Budget, HashMap::new())
            .await
            .unwrap());

        // first registration wins
        let property = registry.get_property("p1").await.unwrap().unwrap();
        assert_eq!(property.name, "Seaside");
        assert_eq!(property.tier, PropertyTier::Luxury);
    }

    #[tokio::test]
    async fn test_credentials_stored_encoded_and_decodable() {
        let (_tmp, registry) = setup().await;
        registry
            .register_property("p1", "Seaside", "opera", &creds(), PropertyTier::Standard, HashMap::new())
            .await
            .unwrap();

        let property = registry.get_property("p1").await.unwrap().unwrap();
        assert!(!property.credentials.contains("s3cret"));

        let decoded = registry.decode_credentials(&property).unwrap();
        assert_eq!(decoded.client_secret, "s3cret");
        assert_eq!(decoded.api_base_url, "https://pms.example.com");
    }

    #[tokio::test]
    async fn test_pause_excludes_from_active_listing() {
        let (_tmp, registry) = setup().await;
        registry
            .register_property("p1", "A", "opera", &creds(), PropertyTier::Budget, HashMap::new())
            .await
            .unwrap();
        registry
            .register_property("p2", "B", "mews", &creds(), PropertyTier::Standard, HashMap::new())
            .await
            .unwrap();

        assert_eq!(registry.list_active_properties().await.unwrap().len(), 2);

        registry.pause_property("p1", "renovation").await.unwrap();
        let active = registry.list_active_properties().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].property_id, "p2");

        let paused = registry.get_property("p1").await.unwrap().unwrap();
        assert_eq!(paused.paused_reason.as_deref(), Some("renovation"));
        assert!(registry.get_active_property("p1").await.is_err());

        registry.resume_property("p1").await.unwrap();
        assert_eq!(registry.list_active_properties().await.unwrap().len(), 2);
        assert!(registry
            .get_property("p1")
            .await
            .unwrap()
            .unwrap()
            .paused_reason
            .is_none());
    }
}
