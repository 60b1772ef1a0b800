//! Signal sources.
//!
//! Three independent vantage points on the same event. None of them is
//! reliable on its own, and none may fail in a way the host page notices:
//! every parse or lookup error is logged here and turned into "no signal".
//!
//! - [`network`]: payment-creation calls, under three request conventions
//! - [`dom`]: a QR code appearing in the document
//! - [`message`]: objects posted from another browsing context
//! - [`profile`]: customer data the checkout form left in storage

pub mod dom;
pub mod message;
pub mod network;
pub mod profile;

use crate::gate::GateDecision;
use crate::signal::TransactionSignal;

/// Destination for signals. Implemented by the correlation gate.
pub trait SignalSink: Send + Sync {
    /// Offer a signal.
    fn submit(&self, signal: TransactionSignal) -> GateDecision;

    /// Whether a canonical event already exists. Sources use this to skip
    /// expensive work.
    fn has_fired(&self) -> bool;
}
