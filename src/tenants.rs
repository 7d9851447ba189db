//! Tenant management.
//!
//! Tenants are issued opaque API keys prefixed `fra_`. Only the SHA-256
//! of a key is ever persisted; the plaintext is returned exactly once at
//! creation. Authenticated tenants are cached in-process keyed by hash
//! and invalidated whenever usage changes, so budget checks always see
//! fresh numbers.

use crate::config::Strategy;
use crate::storage::Storage;
use crate::GatewayError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::info;

/// Prefix for gateway-issued API keys.
pub const KEY_PREFIX: &str = "fra_";

/// A gateway tenant. `api_key_hash` is the only credential material
/// stored anywhere.
#[derive(Debug, Clone, Serialize)]
pub struct Tenant {
    pub id: String,
    #[serde(skip_serializing)]
    pub api_key_hash: String,
    pub name: String,
    pub strategy: Strategy,
    pub allowed_models: Option<Vec<String>>,
    pub budget_limit_monthly: Option<f64>,
    pub rate_limit_rpm: u32,
    pub rate_limit_tpm: u32,
    pub usage_this_month: f64,
    pub created_at: DateTime<Utc>,
}

impl Tenant {
    /// Whether the tenant may spend more this month.
    pub fn within_budget(&self) -> bool {
        match self.budget_limit_monthly {
            Some(limit) => self.usage_this_month < limit,
            None => true,
        }
    }

    /// Whether the tenant may use the given model. `None` allowlist
    /// admits everything.
    pub fn model_allowed(&self, model_id: &str) -> bool {
        match &self.allowed_models {
            Some(list) => list.iter().any(|m| m == model_id),
            None => true,
        }
    }
}

/// Parameters for tenant creation.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct NewTenant {
    pub name: String,
    #[serde(default)]
    pub strategy: Option<Strategy>,
    #[serde(default)]
    pub allowed_models: Option<Vec<String>>,
    #[serde(default)]
    pub budget_limit_monthly: Option<f64>,
    #[serde(default)]
    pub rate_limit_rpm: Option<u32>,
    #[serde(default)]
    pub rate_limit_tpm: Option<u32>,
}

/// Issues, authenticates, and tracks tenants.
pub struct TenantManager {
    storage: Arc<Storage>,
    /// Authenticated-tenant cache keyed by api_key_hash.
    cache: DashMap<String, Tenant>,
}

impl TenantManager {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            cache: DashMap::new(),
        }
    }

    /// Create a tenant and return it alongside the plaintext key. The
    /// key is not retrievable afterwards.
    pub async fn issue(&self, req: NewTenant) -> Result<(Tenant, String), GatewayError> {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        let plaintext = format!("{KEY_PREFIX}{}", hex(&secret));

        let tenant = Tenant {
            id: format!("tn-{}", uuid::Uuid::new_v4()),
            api_key_hash: hash_key(&plaintext),
            name: req.name,
            strategy: req.strategy.unwrap_or_default(),
            allowed_models: req.allowed_models,
            budget_limit_monthly: req.budget_limit_monthly,
            rate_limit_rpm: req.rate_limit_rpm.unwrap_or(60),
            rate_limit_tpm: req.rate_limit_tpm.unwrap_or(100_000),
            usage_this_month: 0.0,
            created_at: Utc::now(),
        };

        self.storage.insert_tenant(&tenant).await?;
        info!(tenant = tenant.id.as_str(), name = tenant.name.as_str(), "tenant issued");
        Ok((tenant, plaintext))
    }

    /// Authenticate an API key. Hits the in-process cache first.
    pub async fn authenticate(&self, api_key: &str) -> Result<Option<Tenant>, GatewayError> {
        let hash = hash_key(api_key);
        if let Some(cached) = self.cache.get(&hash) {
            return Ok(Some(cached.clone()));
        }
        match self.storage.find_tenant_by_hash(&hash).await? {
            Some(tenant) => {
                self.cache.insert(hash, tenant.clone());
                Ok(Some(tenant))
            }
            None => Ok(None),
        }
    }

    /// Record spend against a tenant and drop its cache entry so the
    /// next authentication re-reads fresh usage.
    pub async fn record_usage(&self, tenant: &Tenant, cost: f64) -> Result<(), GatewayError> {
        self.storage.add_tenant_usage(&tenant.id, cost).await?;
        self.cache.remove(&tenant.api_key_hash);
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<Tenant>, GatewayError> {
        self.storage.list_tenants().await
    }
}

/// SHA-256 hex of a key.
pub fn hash_key(api_key: &str) -> String {
    hex(&Sha256::digest(api_key.as_bytes()))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// ── Tests ──────────────────────────────────────────────────────────────
