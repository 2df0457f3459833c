//! Read-through revocation cache for device-access tokens
//!
//! Every data-plane request checks its token's revocation state. The cache
//! keeps that check off the registry's hot path while bounding staleness:
//! entries live at most `cache_ttl` (and never past the token's own
//! expiry), and `revoke_all` evicts the affected entries synchronously so
//! revocation through this handle takes effect immediately rather than
//! after the cache ages out.
//!
//! Unknown `jti`s resolve to revoked and are not cached. A token this
//! process cannot account for must never pass, and the registry is
//! append-only so absence never turns into presence later.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::errors::Result;
use super::store::TokenRegistry;

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    revoked: bool,
    cached_until: DateTime<Utc>,
}

/// Caches per-token revocation state in front of the token registry
#[derive(Debug)]
pub struct TokenRevocationCache {
    registry: Arc<dyn TokenRegistry>,
    entries: RwLock<HashMap<String, CacheEntry>>,
    cache_ttl: Duration,
}

impl TokenRevocationCache {
    /// Build a cache over a token registry
    #[must_use]
    pub fn new(registry: Arc<dyn TokenRegistry>, cache_ttl: Duration) -> Self {
        Self {
            registry,
            entries: RwLock::new(HashMap::new()),
            cache_ttl,
        }
    }

    /// Whether the token with this `jti` is revoked
    ///
    /// # Errors
    /// Propagates registry failures; a failed lookup never defaults to
    /// "not revoked".
    pub async fn is_revoked(&self, jti: &str) -> Result<bool> {
        let now = Utc::now();

        if let Some(entry) = self.entries.read().await.get(jti) {
            if now < entry.cached_until {
                return Ok(entry.revoked);
            }
        }

        let Some(record) = self.registry.get(jti).await? else {
            debug!(jti, "revocation check for unknown token");
            return Ok(true);
        };

        let ttl = chrono::Duration::from_std(self.cache_ttl).unwrap_or_default();
        let entry = CacheEntry {
            revoked: record.revoked,
            // Never cache past the token's own expiry
            cached_until: (now + ttl).min(record.expires_at),
        };
        self.entries.write().await.insert(jti.to_string(), entry);
        Ok(record.revoked)
    }

    /// Revoke every token of a device and evict the affected cache entries
    ///
    /// Eviction happens before returning, so a caller that checks
    /// revocation through this same cache observes the revocation
    /// immediately.
    ///
    /// # Errors
    /// Propagates registry failures.
    pub async fn revoke_all(&self, device_id: &str) -> Result<Vec<String>> {
        let affected = self.registry.revoke_all(device_id).await?;

        let mut entries = self.entries.write().await;
        for jti in &affected {
            entries.remove(jti);
        }
        drop(entries);

        info!(device_id, count = affected.len(), "revoked device tokens");
        Ok(affected)
    }
}
