#![no_main]

use libfuzzer_sys::fuzz_target;
use paywatch_core::sources::message::parse_message;
use serde_json::Value;

fuzz_target!(|data: &[u8]| {
    let Ok(payload) = serde_json::from_slice::<Value>(data) else {
        return;
    };
    if let Some(signal) = parse_message(&payload) {
        assert!(payload.is_object());
        assert!(!signal.transaction_id.trim().is_empty());
    }
});
