//! Transaction signals and the payloads derived from them.
//!
//! A [`TransactionSignal`] is one vantage point's claim that a payment
//! instrument was created. Signals are transient: the correlation gate keeps
//! the first one and drops the rest, and the winning signal is turned into
//! [`ConversionEvent`]s for the downstream notifiers.
//!
//! The JSON helpers at the bottom are shared by every source. Checkout
//! backends are inconsistent about types (ids arrive as numbers, amounts as
//! strings), so lookups accept both and treat empty strings as absent.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// Signal types
// =============================================================================

/// Where a signal was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalSource {
    /// Intercepted payment-creation call
    Network,
    /// QR code appearing in the document
    Dom,
    /// Message from another browsing context
    Message,
}

impl SignalSource {
    /// Stable label for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Dom => "dom",
            Self::Message => "message",
        }
    }
}

impl fmt::Display for SignalSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Customer fields, all optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Customer {
    /// E-mail address
    pub email: Option<String>,
    /// Phone number
    pub phone: Option<String>,
    /// Full name
    pub name: Option<String>,
    /// Tax document (digits)
    pub document: Option<String>,
}

impl Customer {
    /// True when no field is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.email.is_none() && self.phone.is_none() && self.name.is_none() && self.document.is_none()
    }

    /// True when the fields that identify a buyer (email or name) are present.
    #[must_use]
    pub fn has_identity(&self) -> bool {
        self.email.is_some() || self.name.is_some()
    }

    /// Fill every missing field from `fallback`.
    #[must_use]
    pub fn or_fill(mut self, fallback: &Customer) -> Self {
        if self.email.is_none() {
            self.email.clone_from(&fallback.email);
        }
        if self.phone.is_none() {
            self.phone.clone_from(&fallback.phone);
        }
        if self.name.is_none() {
            self.name.clone_from(&fallback.name);
        }
        if self.document.is_none() {
            self.document.clone_from(&fallback.document);
        }
        self
    }

    /// Read the conventional checkout keys from a JSON object.
    ///
    /// `payerName` wins over `name`, `document` over `cpf`.
    #[must_use]
    pub fn from_json(value: &Value) -> Self {
        Self {
            email: string_field(value, &["email"]),
            phone: string_field(value, &["phone"]),
            name: string_field(value, &["payerName", "name"]),
            document: string_field(value, &["document", "cpf"]),
        }
    }
}

/// A candidate "transaction observed" signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionSignal {
    /// Transaction identifier; the gate rejects empty ids
    pub transaction_id: String,
    /// Amount in major currency units, when the source saw one
    pub amount: Option<f64>,
    /// Customer fields the source could extract
    pub customer: Customer,
    /// Which source produced the signal
    pub source: SignalSource,
}

impl TransactionSignal {
    /// Create a signal with no amount and no customer data.
    #[must_use]
    pub fn new(transaction_id: impl Into<String>, source: SignalSource) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            amount: None,
            customer: Customer::default(),
            source,
        }
    }

    /// Attach an amount.
    #[must_use]
    pub fn with_amount(mut self, amount: Option<f64>) -> Self {
        self.amount = amount;
        self
    }

    /// Attach customer fields.
    #[must_use]
    pub fn with_customer(mut self, customer: Customer) -> Self {
        self.customer = customer;
        self
    }

    /// The transaction id with surrounding whitespace removed.
    #[must_use]
    pub fn trimmed_id(&self) -> &str {
        self.transaction_id.trim()
    }
}

/// Which downstream notifier an event is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionKind {
    /// "track initiate": payment instrument created
    Initiate,
    /// "track purchase": payment confirmed
    Purchase,
}

impl ConversionKind {
    /// Stable label for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initiate => "initiate",
            Self::Purchase => "purchase",
        }
    }
}

/// Payload handed to the host's tracking functions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionEvent {
    /// Canonical transaction id
    pub transaction_id: String,
    /// Amount in major units
    pub amount: f64,
    /// Customer fields
    pub customer: Customer,
    /// Content identifier configured for the funnel
    pub content_id: String,
}

// =============================================================================
// Amount normalization
// =============================================================================

/// Heuristic minor-unit detection.
///
/// Amounts above `threshold` are assumed to be in cents and divided by
/// `divisor`. This is not a currency convention; a genuine 1500.00 order is
/// misread as 15.00.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AmountNormalizer {
    /// Amounts strictly above this are divided
    pub threshold: f64,
    /// Divisor for minor-unit amounts
    pub divisor: f64,
}

impl Default for AmountNormalizer {
    fn default() -> Self {
        Self {
            threshold: 1000.0,
            divisor: 100.0,
        }
    }
}

impl AmountNormalizer {
    /// Build from the network config section.
    #[must_use]
    pub fn from_config(config: &crate::config::NetworkConfig) -> Self {
        Self {
            threshold: config.minor_unit_threshold,
            divisor: config.minor_unit_divisor,
        }
    }

    /// Normalize a raw amount.
    #[must_use]
    pub fn normalize(&self, raw: f64) -> f64 {
        if raw > self.threshold {
            raw / self.divisor
        } else {
            raw
        }
    }
}

/// Normalize with the default 1000 / 100 heuristic.
#[must_use]
pub fn normalize_amount(raw: f64) -> f64 {
    AmountNormalizer::default().normalize(raw)
}

// =============================================================================
// JSON helpers
// =============================================================================

/// First non-empty string (or number rendered as a string) among `keys`.
#[must_use]
pub fn string_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match value.get(*key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// First non-zero number (or numeric string) among `keys`.
///
/// Zero counts as absent, matching how checkout scripts treat a falsy
/// amount.
#[must_use]
pub fn number_field(value: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|key| {
        let raw = match value.get(*key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }?;
        (raw.is_finite() && raw != 0.0).then_some(raw)
    })
}

/// True when `value[key]` is a JSON `true`.
#[must_use]
pub fn is_true(value: &Value, key: &str) -> bool {
    value.get(key).and_then(Value::as_bool).unwrap_or(false)
}
