//! Cross-context message listener.
//!
//! Some checkouts render the payment step in an embedded frame that posts
//! the transaction back to the parent page. Any object carrying a
//! transaction id is taken as a signal; the amount is used as sent.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::config::MessageConfig;
use crate::gate::GateDecision;
use crate::signal::{Customer, SignalSource, TransactionSignal, number_field, string_field};
use crate::sources::SignalSink;

/// Parse a posted message into a signal.
#[must_use]
pub fn parse_message(payload: &Value) -> Option<TransactionSignal> {
    if !payload.is_object() {
        return None;
    }
    let transaction_id = string_field(payload, &["transactionId", "transaction_id", "id"])?;
    let customer = Customer {
        email: string_field(payload, &["email"]),
        phone: string_field(payload, &["phone"]),
        name: string_field(payload, &["name", "payerName"]),
        document: string_field(payload, &["document", "cpf"]),
    };
    Some(
        TransactionSignal::new(transaction_id, SignalSource::Message)
            .with_amount(number_field(payload, &["amount", "value"]))
            .with_customer(customer),
    )
}

/// Forwards posted messages to the gate.
pub struct MessageListener {
    allowed_origins: Vec<String>,
    sink: Arc<dyn SignalSink>,
}

impl MessageListener {
    #[must_use]
    pub fn new(config: &MessageConfig, sink: Arc<dyn SignalSink>) -> Self {
        Self {
            allowed_origins: config.allowed_origins.clone(),
            sink,
        }
    }

    fn origin_allowed(&self, origin: Option<&str>) -> bool {
        self.allowed_origins.is_empty()
            || origin.is_some_and(|origin| self.allowed_origins.iter().any(|allowed| allowed == origin))
    }

    /// Handle one message event.
    pub fn receive(&self, payload: &Value, origin: Option<&str>) -> Option<GateDecision> {
        if !self.origin_allowed(origin) {
            debug!(origin = origin.unwrap_or("<none>"), "Ignored message from foreign origin");
            return None;
        }
        let signal = parse_message(payload)?;
        Some(self.sink.submit(signal))
    }

    /// Handle a message whose data arrived serialized.
    pub fn receive_text(&self, raw: &str, origin: Option<&str>) -> Option<GateDecision> {
        match serde_json::from_str::<Value>(raw) {
            Ok(payload) => self.receive(&payload, origin),
            Err(err) => {
                debug!(error = %err, "Ignored non-JSON message");
                None
            }
        }
    }
}

impl std::fmt::Debug for MessageListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageListener")
            .field("allowed_origins", &self.allowed_origins)
            .finish_non_exhaustive()
    }
}
