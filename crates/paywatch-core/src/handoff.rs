//! Terminal hand-off: what happens once a payment is confirmed.
//!
//! 1. The purchase notification goes out through the invoker, with any
//!    field no signal captured filled from the [`FallbackPolicy`].
//! 2. The funnel router picks the next page from the current path.
//! 3. After the navigation delay the page moves on, carrying the persisted
//!    campaign tags in its query string. When nothing was persisted under
//!    the redirect key, the tags captured at activation are used instead.
//!
//! A path no rule matches means the funnel ends here: nothing happens.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::attribution::AttributionSnapshot;
use crate::config::{FallbackPolicy, FunnelRule, HandoffConfig};
use crate::host::{KeyValueStore, Navigator};
use crate::invoker::{DeliveryReport, ReadyInvoker};
use crate::poller::{ConfirmationHandler, PollSession};
use crate::signal::{ConversionEvent, ConversionKind};

/// Ordered path rules; first match wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunnelRouter {
    rules: Vec<FunnelRule>,
}

impl FunnelRouter {
    #[must_use]
    pub fn new(rules: Vec<FunnelRule>) -> Self {
        Self { rules }
    }

    /// Next funnel step for `path`, if any rule applies.
    #[must_use]
    pub fn next_step(&self, path: &str) -> Option<&str> {
        self.rules
            .iter()
            .find(|rule| {
                path.contains(&rule.contains)
                    && rule
                        .unless
                        .as_deref()
                        .is_none_or(|unless| !path.contains(unless))
            })
            .map(|rule| rule.target.as_str())
    }
}

/// Query string built from the tags persisted under `key`.
///
/// Only `keys` with non-empty string values are forwarded, in `keys` order.
#[must_use]
pub fn redirect_query(store: &dyn KeyValueStore, key: &str, keys: &[String]) -> Option<String> {
    let raw = store.get(key)?;
    let tags: Value = match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(err) => {
            warn!(key, error = %err, "Persisted campaign tags are unreadable");
            return None;
        }
    };
    forwarded_query(keys, |name| tags.get(name).and_then(Value::as_str))
}

/// Query string built from the tags captured at activation, same rules as
/// [`redirect_query`].
#[must_use]
pub fn snapshot_query(snapshot: &AttributionSnapshot, keys: &[String]) -> Option<String> {
    forwarded_query(keys, |name| snapshot.get(name))
}

fn forwarded_query<'a>(keys: &[String], lookup: impl Fn(&str) -> Option<&'a str>) -> Option<String> {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    let mut any = false;
    for name in keys {
        if let Some(value) = lookup(name).filter(|v| !v.is_empty()) {
            serializer.append_pair(name, value);
            any = true;
        }
    }
    any.then(|| serializer.finish())
}

/// Purchase payload for a confirmed session.
#[must_use]
pub fn purchase_event(
    session: &PollSession,
    fallback: &FallbackPolicy,
    content_id: &str,
) -> ConversionEvent {
    ConversionEvent {
        transaction_id: session.transaction_id.clone(),
        amount: session.amount.or(fallback.amount).unwrap_or_default(),
        customer: session.customer.clone().or_fill(&fallback.customer),
        content_id: content_id.to_string(),
    }
}

/// Result of one hand-off.
#[derive(Debug, Clone, PartialEq)]
pub struct HandoffReport {
    /// Purchase notification outcome
    pub delivery: DeliveryReport,
    /// Where the page was sent, if anywhere
    pub navigated_to: Option<String>,
}

/// Runs the hand-off for a confirmed session.
#[derive(Clone)]
pub struct ConfirmationHandoff {
    invoker: ReadyInvoker,
    router: FunnelRouter,
    store: Arc<dyn KeyValueStore>,
    navigator: Arc<dyn Navigator>,
    fallback: FallbackPolicy,
    content_id: String,
    redirect_key: String,
    redirect_keys: Vec<String>,
    snapshot: AttributionSnapshot,
    navigation_delay: Duration,
    runtime: Handle,
}

impl std::fmt::Debug for ConfirmationHandoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfirmationHandoff")
            .field("router", &self.router)
            .field("content_id", &self.content_id)
            .field("navigation_delay", &self.navigation_delay)
            .finish_non_exhaustive()
    }
}

impl ConfirmationHandoff {
    /// Build from the hand-off config.
    #[must_use]
    pub fn new(
        config: &HandoffConfig,
        invoker: ReadyInvoker,
        store: Arc<dyn KeyValueStore>,
        navigator: Arc<dyn Navigator>,
        runtime: Handle,
    ) -> Self {
        Self {
            invoker,
            router: FunnelRouter::new(config.funnel.clone()),
            store,
            navigator,
            fallback: config.fallback.clone(),
            content_id: crate::config::InvokerConfig::default().content_id,
            redirect_key: crate::config::AttributionConfig::default().redirect_key,
            redirect_keys: crate::config::AttributionConfig::default().redirect_keys,
            snapshot: AttributionSnapshot::default(),
            navigation_delay: config.navigation_delay(),
            runtime,
        }
    }

    /// Content id attached to the purchase event.
    #[must_use]
    pub fn with_content_id(mut self, content_id: impl Into<String>) -> Self {
        self.content_id = content_id.into();
        self
    }

    /// Storage key and tag names forwarded on redirect.
    #[must_use]
    pub fn with_redirect_tags(mut self, key: impl Into<String>, keys: Vec<String>) -> Self {
        self.redirect_key = key.into();
        self.redirect_keys = keys;
        self
    }

    /// Tags captured at activation, forwarded when storage has none.
    #[must_use]
    pub fn with_snapshot(mut self, snapshot: AttributionSnapshot) -> Self {
        self.snapshot = snapshot;
        self
    }

    /// Redirect target for the current page, query string included.
    #[must_use]
    pub fn redirect_target(&self) -> Option<String> {
        let path = self.navigator.current_path();
        let Some(step) = self.router.next_step(&path) else {
            debug!(path = %path, "No funnel step after this page");
            return None;
        };
        let query = redirect_query(self.store.as_ref(), &self.redirect_key, &self.redirect_keys)
            .or_else(|| snapshot_query(&self.snapshot, &self.redirect_keys));
        Some(match query {
            Some(query) => format!("{step}?{query}"),
            None => step.to_string(),
        })
    }

    /// Notify the purchase, then move the page on.
    pub async fn complete(&self, session: PollSession) -> HandoffReport {
        let event = purchase_event(&session, &self.fallback, &self.content_id);
        let delivery = self.invoker.notify(ConversionKind::Purchase, &event).await;

        let navigated_to = self.redirect_target();
        if let Some(target) = &navigated_to {
            info!(
                target = %target,
                delay_ms = self.navigation_delay.as_millis() as u64,
                "Redirecting to next funnel step"
            );
            tokio::time::sleep(self.navigation_delay).await;
            self.navigator.navigate(target);
        }

        HandoffReport {
            delivery,
            navigated_to,
        }
    }
}

impl ConfirmationHandler for ConfirmationHandoff {
    fn on_confirmed(&self, session: PollSession) {
        let handoff = self.clone();
        self.runtime.spawn(async move {
            handoff.complete(session).await;
        });
    }
}
