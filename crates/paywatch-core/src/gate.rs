//! Single-fire correlation gate.
//!
//! Every source forwards its signals here. The first signal with a usable
//! transaction id wins; everything after it is a no-op, whatever its source
//! or payload quality.
//!
//! ```text
//!   submit(signal) ──► id blank? ──yes──► Rejected
//!                         │ no
//!                         ▼
//!                    fired already? ──yes──► Duplicate
//!                         │ no
//!                         ▼
//!                   mark fired ──► handler.on_canonical(event) ──► Fired
//! ```
//!
//! The check and the set happen in one critical section, so two sources
//! racing on a multi-threaded runtime still produce exactly one `Fired`.
//! Arrival order decides the winner: a low-quality DOM signal that lands a
//! millisecond before a complete network signal wins.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::signal::TransactionSignal;
use crate::sources::SignalSink;

/// Outcome of [`CorrelationGate::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    /// This signal became the canonical event
    Fired,
    /// A canonical event already exists; the signal was dropped
    Duplicate,
    /// The signal carried no usable transaction id
    Rejected,
}

impl GateDecision {
    /// True for [`GateDecision::Fired`].
    #[must_use]
    pub const fn fired(self) -> bool {
        matches!(self, Self::Fired)
    }
}

/// The signal that won the gate.
#[derive(Debug, Clone)]
pub struct CanonicalEvent {
    /// Winning signal, transaction id trimmed
    pub signal: TransactionSignal,
    /// When the gate accepted it
    pub accepted_at: Instant,
}

impl CanonicalEvent {
    /// Canonical transaction id.
    #[must_use]
    pub fn transaction_id(&self) -> &str {
        &self.signal.transaction_id
    }
}

/// Receives the canonical event exactly once.
///
/// Called synchronously from `submit`; implementations must not block and
/// should spawn any async work.
pub trait CanonicalEventHandler: Send + Sync {
    /// Handle the canonical "created" event.
    fn on_canonical(&self, event: CanonicalEvent);
}

/// Gate state. `fired` never reverts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorrelationState {
    /// Whether a canonical event was emitted
    pub fired: bool,
    /// Transaction id of the canonical event
    pub canonical_transaction_id: Option<String>,
}

/// Merges signals from every source into at most one canonical event.
pub struct CorrelationGate {
    state: Mutex<CorrelationState>,
    handler: Arc<dyn CanonicalEventHandler>,
}

impl std::fmt::Debug for CorrelationGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationGate")
            .field("state", &self.snapshot())
            .finish_non_exhaustive()
    }
}

impl CorrelationGate {
    /// Create a gate that reports its canonical event to `handler`.
    #[must_use]
    pub fn new(handler: Arc<dyn CanonicalEventHandler>) -> Self {
        Self {
            state: Mutex::new(CorrelationState::default()),
            handler,
        }
    }

    /// Offer a signal to the gate.
    pub fn submit(&self, mut signal: TransactionSignal) -> GateDecision {
        let transaction_id = signal.trimmed_id().to_string();
        if transaction_id.is_empty() {
            debug!(source = %signal.source, "Rejected signal without transaction id");
            return GateDecision::Rejected;
        }

        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.fired {
                debug!(
                    source = %signal.source,
                    transaction_id = %transaction_id,
                    canonical = ?state.canonical_transaction_id,
                    "Dropped duplicate signal"
                );
                return GateDecision::Duplicate;
            }
            state.fired = true;
            state.canonical_transaction_id = Some(transaction_id.clone());
        }

        info!(
            source = %signal.source,
            transaction_id = %transaction_id,
            has_amount = signal.amount.is_some(),
            has_customer = !signal.customer.is_empty(),
            "Payment instrument created"
        );

        signal.transaction_id = transaction_id;
        self.handler.on_canonical(CanonicalEvent {
            signal,
            accepted_at: Instant::now(),
        });
        GateDecision::Fired
    }

    /// Whether a canonical event was emitted.
    #[must_use]
    pub fn has_fired(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).fired
    }

    /// Transaction id of the canonical event, if any.
    #[must_use]
    pub fn canonical_transaction_id(&self) -> Option<String> {
        self.snapshot().canonical_transaction_id
    }

    /// Copy of the current state.
    #[must_use]
    pub fn snapshot(&self) -> CorrelationState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl SignalSink for CorrelationGate {
    fn submit(&self, signal: TransactionSignal) -> GateDecision {
        CorrelationGate::submit(self, signal)
    }

    fn has_fired(&self) -> bool {
        CorrelationGate::has_fired(self)
    }
}
