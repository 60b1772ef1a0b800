#![no_main]

use libfuzzer_sys::fuzz_target;
use paywatch_core::signal::{AmountNormalizer, SignalSource};
use paywatch_core::sources::network::classify_creation_response;
use serde_json::Value;

// Input layout: request body and response body separated by a NUL byte.
fuzz_target!(|data: &[u8]| {
    let (request, response) = match data.iter().position(|b| *b == 0) {
        Some(split) => (&data[..split], &data[split + 1..]),
        None => (&[][..], data),
    };
    let Ok(response) = serde_json::from_slice::<Value>(response) else {
        return;
    };
    let request = serde_json::from_slice::<Value>(request).ok();

    let normalizer = AmountNormalizer::default();
    if let Some(signal) = classify_creation_response(request.as_ref(), &response, &normalizer) {
        assert!(!signal.transaction_id.trim().is_empty());
        assert_eq!(signal.source, SignalSource::Network);
    }
});
