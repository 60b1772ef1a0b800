//! Property-based tests for the correlation gate.
//!
//! Whatever the order, source mix or id shape of incoming signals, the gate
//! fires at most once, and the canonical id is the first non-blank one.

use std::sync::{Arc, Mutex};

use proptest::prelude::*;

use paywatch_core::gate::{CanonicalEvent, CanonicalEventHandler, CorrelationGate, GateDecision};
use paywatch_core::signal::{SignalSource, TransactionSignal};

// =============================================================================
// Strategies
// =============================================================================

fn arb_source() -> impl Strategy<Value = SignalSource> {
    prop_oneof![
        Just(SignalSource::Network),
        Just(SignalSource::Dom),
        Just(SignalSource::Message),
    ]
}

/// Transaction ids, including blank and padded ones.
fn arb_transaction_id() -> impl Strategy<Value = String> {
    prop_oneof![
        2 => Just(String::new()),
        1 => " {1,4}",
        7 => "[ ]{0,2}[A-Za-z0-9-]{1,16}[ ]{0,2}",
    ]
}

fn arb_signal() -> impl Strategy<Value = TransactionSignal> {
    (arb_transaction_id(), arb_source(), proptest::option::of(0.0f64..100_000.0))
        .prop_map(|(id, source, amount)| TransactionSignal::new(id, source).with_amount(amount))
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<CanonicalEvent>>,
}

impl CanonicalEventHandler for Recorder {
    fn on_canonical(&self, event: CanonicalEvent) {
        self.events.lock().unwrap().push(event);
    }
}

fn gate() -> (CorrelationGate, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    (CorrelationGate::new(recorder.clone()), recorder)
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #[test]
    fn fires_at_most_once(signals in prop::collection::vec(arb_signal(), 0..24)) {
        let (gate, recorder) = gate();
        let fired = signals
            .into_iter()
            .map(|signal| gate.submit(signal))
            .filter(|decision| decision.fired())
            .count();
        prop_assert!(fired <= 1);
        prop_assert_eq!(recorder.events.lock().unwrap().len(), fired);
        prop_assert_eq!(gate.has_fired(), fired == 1);
    }

    #[test]
    fn first_non_blank_id_wins(signals in prop::collection::vec(arb_signal(), 1..24)) {
        let expected = signals
            .iter()
            .map(|s| s.transaction_id.trim().to_string())
            .find(|id| !id.is_empty());
        let (gate, recorder) = gate();
        for signal in signals {
            gate.submit(signal);
        }
        prop_assert_eq!(gate.canonical_transaction_id(), expected.clone());
        let events = recorder.events.lock().unwrap();
        prop_assert_eq!(events.first().map(|e| e.transaction_id().to_string()), expected);
    }

    #[test]
    fn blank_ids_never_fire(blank in " {0,6}", source in arb_source()) {
        let (gate, recorder) = gate();
        prop_assert_eq!(gate.submit(TransactionSignal::new(blank, source)), GateDecision::Rejected);
        prop_assert!(!gate.has_fired());
        prop_assert!(recorder.events.lock().unwrap().is_empty());
    }

    #[test]
    fn decisions_after_fire_are_duplicates(
        first in "[A-Z0-9]{1,12}",
        rest in prop::collection::vec("[A-Z0-9]{1,12}", 1..10),
    ) {
        let (gate, _recorder) = gate();
        prop_assert_eq!(
            gate.submit(TransactionSignal::new(first, SignalSource::Network)),
            GateDecision::Fired
        );
        for id in rest {
            prop_assert_eq!(
                gate.submit(TransactionSignal::new(id, SignalSource::Message)),
                GateDecision::Duplicate
            );
        }
    }

    #[test]
    fn canonical_event_keeps_payload(
        id in "[A-Z0-9]{1,12}",
        amount in proptest::option::of(1.0f64..10_000.0),
        source in arb_source(),
    ) {
        let (gate, recorder) = gate();
        gate.submit(TransactionSignal::new(format!("  {id} "), source).with_amount(amount));
        let events = recorder.events.lock().unwrap();
        prop_assert_eq!(events.len(), 1);
        prop_assert_eq!(events[0].transaction_id(), id.as_str());
        prop_assert_eq!(events[0].signal.amount, amount);
        prop_assert_eq!(events[0].signal.source, source);
    }
}
