//! Campaign attribution: capture at start, persist on creation.
//!
//! The snapshot is taken once, from the landing query string, and never
//! changes afterwards. When a transaction is created the snapshot is posted
//! alongside the transaction id so the backend can attribute the sale.
//! Failures here are logged and otherwise ignored.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::host::{HttpClient, HttpRequest, KeyValueStore};
use crate::signal::Customer;

/// Campaign tags captured from the page query string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct AttributionSnapshot {
    tags: BTreeMap<String, String>,
}

impl AttributionSnapshot {
    /// Capture `keys` from a query string (leading `?` optional). The first
    /// non-empty occurrence of each key wins.
    #[must_use]
    pub fn capture(query: &str, keys: &[String]) -> Self {
        let query = query.strip_prefix('?').unwrap_or(query);
        let mut tags = BTreeMap::new();
        for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
            if value.is_empty() || !keys.iter().any(|key| *key == name) {
                continue;
            }
            tags.entry(name.into_owned()).or_insert_with(|| value.into_owned());
        }
        Self { tags }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    /// JSON object text, as stored and as sent in `utmQuery`.
    pub fn to_json_string(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(&self.tags)?)
    }

    /// Write the snapshot under `key`. Empty snapshots are not written.
    pub fn store(&self, store: &dyn KeyValueStore, key: &str) -> crate::Result<bool> {
        if self.is_empty() {
            return Ok(false);
        }
        store.set(key, &self.to_json_string()?)?;
        debug!(key, tags = self.tags.len(), "Campaign tags stored");
        Ok(true)
    }
}

/// Posts `{transactionId, utmQuery, customer}` to the tag endpoint.
#[derive(Clone)]
pub struct TagPersister {
    http: Arc<dyn HttpClient>,
    endpoint: String,
}

impl std::fmt::Debug for TagPersister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagPersister")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl TagPersister {
    #[must_use]
    pub fn new(http: Arc<dyn HttpClient>, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
        }
    }

    /// Request body for one transaction.
    pub fn payload(
        transaction_id: &str,
        snapshot: &AttributionSnapshot,
        customer: &Customer,
    ) -> crate::Result<serde_json::Value> {
        Ok(json!({
            "transactionId": transaction_id,
            "utmQuery": snapshot.to_json_string()?,
            "customer": customer,
        }))
    }

    /// Post the tags. Non-2xx answers are errors.
    pub async fn persist(
        &self,
        transaction_id: &str,
        snapshot: &AttributionSnapshot,
        customer: &Customer,
    ) -> crate::Result<()> {
        let body = Self::payload(transaction_id, snapshot, customer)?;
        let response = self
            .http
            .send(HttpRequest::post_json(self.endpoint.clone(), body))
            .await?;
        if !response.is_success() {
            response.into_json()?;
        }
        info!(transaction_id, "Campaign tags persisted");
        Ok(())
    }

    /// Best-effort variant: logs and swallows failures.
    pub async fn persist_best_effort(
        &self,
        transaction_id: &str,
        snapshot: &AttributionSnapshot,
        customer: &Customer,
    ) {
        if let Err(err) = self.persist(transaction_id, snapshot, customer).await {
            warn!(transaction_id, error = %err, "Failed to persist campaign tags");
        }
    }
}
