//! DOM-mutation watcher.
//!
//! Fallback for checkouts whose network traffic we cannot classify: when a
//! QR code shows up in the document, wait for the page to settle and then
//! dig the transaction id out of attributes, globals or visible text. The
//! resulting signal never has an amount.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::config::DomConfig;
use crate::gate::GateDecision;
use crate::host::{DocumentProbe, KeyValueStore};
use crate::signal::{Customer, SignalSource, TransactionSignal};
use crate::sources::SignalSink;
use crate::sources::profile::read_profile;

static TXN_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)TXN-[\w-]+").expect("static pattern"));
static TXN_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)transaction[_-]?id[:\s]+([\w-]+)").expect("static pattern")
});

/// One inserted element and its subtree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElementSnapshot {
    /// Lowercase tag name
    pub tag: String,
    /// `id` attribute
    pub id: Option<String>,
    /// `class` attribute
    pub class: Option<String>,
    /// Remaining attributes
    pub attributes: BTreeMap<String, String>,
    /// Child elements
    pub children: Vec<ElementSnapshot>,
}

impl ElementSnapshot {
    /// Element with a tag and nothing else.
    #[must_use]
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Self::default()
        }
    }

    /// Set the `id`.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the `class`.
    #[must_use]
    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.class = Some(class.into());
        self
    }

    /// Add an attribute.
    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Add a child.
    #[must_use]
    pub fn with_child(mut self, child: ElementSnapshot) -> Self {
        self.children.push(child);
        self
    }

    fn is_qr_marker(&self) -> bool {
        let named_qr = |value: &Option<String>| {
            value.as_deref().is_some_and(|v| {
                let v = v.to_ascii_lowercase();
                v.contains("qrcode") || v.contains("qr-code")
            })
        };
        if named_qr(&self.id) || named_qr(&self.class) {
            return true;
        }
        match self.tag.to_ascii_lowercase().as_str() {
            "canvas" => true,
            "img" => self
                .attributes
                .get("src")
                .is_some_and(|src| src.contains("qr")),
            _ => false,
        }
    }

    /// Whether this element or any descendant looks like a rendered QR code.
    #[must_use]
    pub fn contains_qr(&self) -> bool {
        self.is_qr_marker() || self.children.iter().any(Self::contains_qr)
    }
}

/// Elements inserted by one mutation callback.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationBatch {
    /// Inserted elements (text nodes are not forwarded)
    pub added: Vec<ElementSnapshot>,
}

impl MutationBatch {
    /// Batch of inserted elements.
    #[must_use]
    pub fn new(added: Vec<ElementSnapshot>) -> Self {
        Self { added }
    }

    /// Whether any inserted subtree contains a QR code.
    #[must_use]
    pub fn contains_qr(&self) -> bool {
        self.added.iter().any(ElementSnapshot::contains_qr)
    }
}

/// Extract a transaction id from free text.
#[must_use]
pub fn transaction_id_from_text(text: &str) -> Option<String> {
    if let Some(token) = TXN_TOKEN.find(text) {
        return Some(token.as_str().to_string());
    }
    TXN_LABEL
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Look for a transaction id in the document, in probe order: data
/// attributes, the global variable, then visible text.
#[must_use]
pub fn find_transaction_id(probe: &dyn DocumentProbe, config: &DomConfig) -> Option<String> {
    let non_blank = |value: String| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    };
    config
        .transaction_attributes
        .iter()
        .find_map(|attribute| probe.attribute_value(attribute).and_then(non_blank))
        .or_else(|| probe.global_string(&config.global_variable).and_then(non_blank))
        .or_else(|| transaction_id_from_text(&probe.visible_text()))
}

/// Turns QR-code insertions into signals.
pub struct DomWatcher {
    config: DomConfig,
    probe: Arc<dyn DocumentProbe>,
    sink: Arc<dyn SignalSink>,
    profile: Option<(Arc<dyn KeyValueStore>, String)>,
    scan_pending: AtomicBool,
    runtime: Handle,
}

impl DomWatcher {
    /// Create a watcher over `probe`. Delayed scans run on `runtime`.
    #[must_use]
    pub fn new(
        config: DomConfig,
        probe: Arc<dyn DocumentProbe>,
        sink: Arc<dyn SignalSink>,
        runtime: Handle,
    ) -> Self {
        Self {
            config,
            probe,
            sink,
            profile: None,
            scan_pending: AtomicBool::new(false),
            runtime,
        }
    }

    /// Attach customer fields from the stored profile.
    #[must_use]
    pub fn with_profile(mut self, store: Arc<dyn KeyValueStore>, key: impl Into<String>) -> Self {
        self.profile = Some((store, key.into()));
        self
    }

    /// Feed one mutation batch. Returns `true` when a delayed scan was
    /// scheduled.
    pub fn observe(self: &Arc<Self>, batch: &MutationBatch) -> bool {
        if !self.config.enabled || self.sink.has_fired() || !batch.contains_qr() {
            return false;
        }
        if self.scan_pending.swap(true, Ordering::AcqRel) {
            debug!("QR code seen while a scan is already pending");
            return false;
        }
        debug!(
            delay_ms = self.config.settle_delay_ms,
            "QR code detected, scheduling document scan"
        );
        let watcher = Arc::clone(self);
        self.runtime.spawn(async move {
            tokio::time::sleep(watcher.config.settle_delay()).await;
            watcher.scan_pending.store(false, Ordering::Release);
            watcher.scan_now();
        });
        true
    }

    /// Scan the document right away.
    pub fn scan_now(&self) -> Option<GateDecision> {
        if self.sink.has_fired() {
            return None;
        }
        let Some(transaction_id) = find_transaction_id(self.probe.as_ref(), &self.config) else {
            debug!("QR code present but no transaction id found");
            return None;
        };
        info!(transaction_id = %transaction_id, "Transaction id found in document");
        let customer = self
            .profile
            .as_ref()
            .map_or_else(Customer::default, |(store, key)| read_profile(store.as_ref(), key));
        Some(
            self.sink
                .submit(TransactionSignal::new(transaction_id, SignalSource::Dom).with_customer(customer)),
        )
    }
}

impl std::fmt::Debug for DomWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomWatcher")
            .field("config", &self.config)
            .field("scan_pending", &self.scan_pending.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
