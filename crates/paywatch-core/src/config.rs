//! Configuration management for paywatch
//!
//! The engine activates with [`Config::default`], which carries the timing
//! and matching constants the checkout observer has always used. Hosts that
//! need different endpoints or cadences can build a `Config` in code or parse
//! a TOML document with [`Config::from_toml_str`] / [`Config::load_from`].
//! Nothing is read from disk implicitly.

use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::signal::Customer;

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,
    /// Network-call interceptor settings
    pub network: NetworkConfig,
    /// DOM-mutation watcher settings
    pub dom: DomConfig,
    /// Cross-context message listener settings
    pub messages: MessageConfig,
    /// Ready-dependency invoker settings
    pub invoker: InvokerConfig,
    /// Confirmation poller settings
    pub poller: PollerConfig,
    /// Terminal hand-off settings
    pub handoff: HandoffConfig,
    /// Attribution capture and persistence settings
    pub attribution: AttributionConfig,
    /// Outbound HTTP settings
    pub http: HttpConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

/// Network-call interceptor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Regex matched against outgoing request URLs
    pub payment_endpoint_pattern: String,
    /// Amounts strictly above this are treated as minor currency units
    pub minor_unit_threshold: f64,
    /// Divisor applied to minor-unit amounts
    pub minor_unit_divisor: f64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            payment_endpoint_pattern: r"(?i)payments\.php".to_string(),
            minor_unit_threshold: 1000.0,
            minor_unit_divisor: 100.0,
        }
    }
}

/// DOM-mutation watcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DomConfig {
    /// Disable to rely on network and message signals only
    pub enabled: bool,
    /// Delay between spotting a QR code and scanning the page
    pub settle_delay_ms: u64,
    /// Data attributes that may carry the transaction id, checked in order
    pub transaction_attributes: Vec<String>,
    /// Global variable that may carry the transaction id
    pub global_variable: String,
}

impl Default for DomConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            settle_delay_ms: 1000,
            transaction_attributes: vec![
                "data-transaction-id".to_string(),
                "data-transactionId".to_string(),
            ],
            global_variable: "transactionId".to_string(),
        }
    }
}

impl DomConfig {
    /// Settle delay as a duration.
    #[must_use]
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

/// Cross-context message listener configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageConfig {
    /// Origins accepted as message senders; empty accepts every origin
    pub allowed_origins: Vec<String>,
}

/// Ready-dependency invoker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InvokerConfig {
    /// Delay between attempts after the immediate first one
    pub retry_delay_ms: u64,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Content identifier attached to every conversion event
    pub content_id: String,
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: 500,
            max_retries: 5,
            content_id: "tiktokpay_magic".to_string(),
        }
    }
}

/// Confirmation poller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Fixed cadence between verification requests
    pub interval_ms: u64,
    /// Fallback verification endpoint, queried with `?transactionId=`
    pub verify_endpoint: String,
    /// Extra status tokens treated as paid, matched exactly
    pub extra_paid_statuses: Vec<String>,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 8000,
            verify_endpoint: "../production/payments.php".to_string(),
            extra_paid_statuses: Vec::new(),
        }
    }
}

impl PollerConfig {
    /// Poll interval as a duration.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Values substituted when a confirmed payment never carried real data.
///
/// This is a policy, not a recovery: whatever is configured here is what the
/// purchase notification reports for fields no signal ever captured. The
/// shipped default substitutes an amount but no customer identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackPolicy {
    /// Amount reported when none was captured
    pub amount: Option<f64>,
    /// Per-field customer values reported when none were captured
    pub customer: Customer,
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self {
            amount: Some(21.67),
            customer: Customer::default(),
        }
    }
}

/// One ordered funnel rule: a path containing `contains` (and not
/// containing `unless`) moves on to `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunnelRule {
    /// Substring the current path must contain
    pub contains: String,
    /// Substring that disqualifies the rule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unless: Option<String>,
    /// Next funnel step
    pub target: String,
}

impl FunnelRule {
    /// Create a rule without an exclusion.
    #[must_use]
    pub fn new(contains: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            contains: contains.into(),
            unless: None,
            target: target.into(),
        }
    }

    /// Add an exclusion substring.
    #[must_use]
    pub fn unless(mut self, unless: impl Into<String>) -> Self {
        self.unless = Some(unless.into());
        self
    }
}

/// Terminal hand-off configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandoffConfig {
    /// Delay before navigating to the next funnel step
    pub navigation_delay_ms: u64,
    /// Placeholder policy for the purchase notification
    pub fallback: FallbackPolicy,
    /// Ordered funnel rules, first match wins
    pub funnel: Vec<FunnelRule>,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        let mut funnel = vec![FunnelRule::new("/checkout", "/up1/index.html").unless("/up")];
        for step in 1..=5 {
            funnel.push(FunnelRule::new(
                format!("/up{step}/checkout"),
                format!("/up{}/index.html", step + 1),
            ));
        }
        funnel.push(FunnelRule::new("/up6/checkout", "/up6/index.html"));
        Self {
            navigation_delay_ms: 1500,
            fallback: FallbackPolicy::default(),
            funnel,
        }
    }
}

impl HandoffConfig {
    /// Navigation delay as a duration.
    #[must_use]
    pub fn navigation_delay(&self) -> Duration {
        Duration::from_millis(self.navigation_delay_ms)
    }
}

/// Attribution capture and persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributionConfig {
    /// Query parameters captured at engine start
    pub capture_keys: Vec<String>,
    /// Storage key the captured snapshot is written to
    pub snapshot_key: String,
    /// Storage key read when building the redirect query string
    pub redirect_key: String,
    /// Keys forwarded on redirect
    pub redirect_keys: Vec<String>,
    /// Storage key holding the customer profile typed into the checkout form
    pub profile_key: String,
    /// Endpoint receiving `{transactionId, utmQuery, customer}`
    pub tag_endpoint: String,
    /// Post attribution tags when a transaction is created
    pub persist_tags: bool,
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self {
            capture_keys: [
                "utm_source",
                "utm_medium",
                "utm_campaign",
                "utm_term",
                "utm_content",
                "click_id",
                "fbclid",
                "gclid",
                "msclkid",
                "ttclid",
            ]
            .iter()
            .map(|key| (*key).to_string())
            .collect(),
            snapshot_key: "utm_params".to_string(),
            redirect_key: "utm_params_persistent".to_string(),
            redirect_keys: [
                "utm_source",
                "utm_medium",
                "utm_campaign",
                "utm_term",
                "utm_content",
                "ttclid",
            ]
            .iter()
            .map(|key| (*key).to_string())
            .collect(),
            profile_key: "userPixData".to_string(),
            tag_endpoint: "../production/save-utm-query.php".to_string(),
            persist_tags: true,
        }
    }
}

/// Outbound HTTP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Base URL relative endpoints are resolved against (the page URL)
    pub base_url: Option<String>,
    /// Per-request timeout
    pub timeout_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_ms: 15_000,
        }
    }
}

impl Config {
    /// Parse a TOML document; missing sections keep their defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(raw).map_err(|err| ConfigError::ParseError(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> crate::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(Self::from_toml_str(&raw)?)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Err(err) = Regex::new(&self.network.payment_endpoint_pattern) {
            return Err(ConfigError::InvalidValue {
                field: "network.payment_endpoint_pattern",
                reason: err.to_string(),
            });
        }
        let divisor = self.network.minor_unit_divisor;
        if divisor.is_nan() || divisor <= 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "network.minor_unit_divisor",
                reason: "must be positive".to_string(),
            });
        }
        if self.poller.interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "poller.interval_ms",
                reason: "must be non-zero".to_string(),
            });
        }
        if self.poller.verify_endpoint.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "poller.verify_endpoint",
                reason: "must not be empty".to_string(),
            });
        }
        if let Some(base) = &self.http.base_url {
            if let Err(err) = url::Url::parse(base) {
                return Err(ConfigError::InvalidValue {
                    field: "http.base_url",
                    reason: err.to_string(),
                });
            }
        }
        Ok(())
    }
}
