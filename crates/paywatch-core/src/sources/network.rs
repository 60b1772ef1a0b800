//! Network-call interceptor.
//!
//! Watches the page's payment-creation calls without changing them. Pages
//! issue those calls through one of three conventions, each with its own
//! adapter:
//!
//! | Convention | Adapter |
//! |---|---|
//! | promise-based (`fetch`) | [`InterceptedClient`] wraps the page's [`HttpClient`] |
//! | request object (`XMLHttpRequest`) | [`RequestObjectTap`] fed `open` / `send` / ready-state events |
//! | pre-parsed (`axios`) | [`NetworkInterceptor::observe_parsed`] |
//!
//! All three end in [`classify_creation_response`]. The page always gets
//! its original response back, untouched, whatever the classifier decides.

use std::sync::Arc;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, trace};

use crate::config::NetworkConfig;
use crate::error::{ConfigError, HttpError};
use crate::gate::GateDecision;
use crate::host::{HostFuture, HttpClient, HttpRequest, HttpResponse, KeyValueStore, RequestBody};
use crate::signal::{AmountNormalizer, Customer, SignalSource, TransactionSignal, number_field, string_field};
use crate::sources::SignalSink;
use crate::sources::profile::read_profile;

/// XHR `readyState` value for a finished request.
pub const READY_STATE_DONE: u8 = 4;

/// Fields any one of which proves a payment instrument exists.
const PROOF_FIELDS: &[&[&str]] = &[
    &["paymentInfo", "qrCode"],
    &["qrCode"],
    &["pixCode"],
    &["pix_code"],
    &["paymentInfo", "pixCode"],
    &["qrcode"],
];

fn lookup<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, key| current.get(*key))
}

fn has_proof(response: &Value) -> bool {
    PROOF_FIELDS.iter().any(|path| match lookup(response, path) {
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(Value::Null | Value::Bool(false)) | None => false,
        Some(_) => true,
    })
}

fn transaction_id(response: &Value) -> Option<String> {
    string_field(response, &["transactionId", "transaction_id"])
        .or_else(|| {
            response
                .get("paymentInfo")
                .and_then(|info| string_field(info, &["transactionId"]))
        })
        .or_else(|| string_field(response, &["id"]))
}

fn raw_amount(request_body: Option<&Value>, response: &Value) -> Option<f64> {
    request_body
        .and_then(|body| number_field(body, &["value", "amount"]))
        .or_else(|| number_field(response, &["value"]))
        .or_else(|| {
            let info = response.get("paymentInfo")?;
            number_field(info, &["amount"]).or_else(|| number_field(info, &["value"]))
        })
}

/// Decide whether `response` reports a created payment instrument.
///
/// Requires `success == true`, a transaction id and at least one
/// proof-of-payment field. The amount comes from the request body first,
/// then the response, and is normalized; customer fields come from the
/// request body only.
#[must_use]
pub fn classify_creation_response(
    request_body: Option<&Value>,
    response: &Value,
    normalizer: &AmountNormalizer,
) -> Option<TransactionSignal> {
    if !crate::signal::is_true(response, "success") {
        return None;
    }
    let transaction_id = transaction_id(response)?;
    if !has_proof(response) {
        return None;
    }
    let customer = request_body.map(Customer::from_json).unwrap_or_default();
    let amount = raw_amount(request_body, response).map(|raw| normalizer.normalize(raw));
    Some(
        TransactionSignal::new(transaction_id, SignalSource::Network)
            .with_amount(amount)
            .with_customer(customer),
    )
}

/// Shared classification state for every network convention.
pub struct NetworkInterceptor {
    pattern: Regex,
    normalizer: AmountNormalizer,
    profile: Option<(Arc<dyn KeyValueStore>, String)>,
    sink: Arc<dyn SignalSink>,
}

impl std::fmt::Debug for NetworkInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkInterceptor")
            .field("pattern", &self.pattern.as_str())
            .field("normalizer", &self.normalizer)
            .finish_non_exhaustive()
    }
}

impl NetworkInterceptor {
    /// Build an interceptor that forwards signals to `sink`.
    pub fn new(config: &NetworkConfig, sink: Arc<dyn SignalSink>) -> Result<Self, ConfigError> {
        let pattern =
            Regex::new(&config.payment_endpoint_pattern).map_err(|err| ConfigError::InvalidValue {
                field: "network.payment_endpoint_pattern",
                reason: err.to_string(),
            })?;
        Ok(Self {
            pattern,
            normalizer: AmountNormalizer::from_config(config),
            profile: None,
            sink,
        })
    }

    /// Fill customer fields from the stored profile when the request body
    /// carried neither e-mail nor name.
    #[must_use]
    pub fn with_profile(mut self, store: Arc<dyn KeyValueStore>, key: impl Into<String>) -> Self {
        self.profile = Some((store, key.into()));
        self
    }

    /// Whether a request is a payment-creation call.
    #[must_use]
    pub fn matches(&self, method: &str, url: &str) -> bool {
        method.eq_ignore_ascii_case("POST") && self.pattern.is_match(url)
    }

    /// Classify an already-parsed response (axios-style clients).
    ///
    /// Returns `None` when the request does not match or the response is not
    /// a creation response.
    pub fn observe_parsed(
        &self,
        method: &str,
        url: &str,
        request_body: Option<&RequestBody>,
        response: &Value,
    ) -> Option<GateDecision> {
        if !self.matches(method, url) {
            return None;
        }
        self.classify(request_body, response)
    }

    /// Classify a raw response body for a matching request.
    pub fn observe_response(
        &self,
        request: &HttpRequest,
        response: &HttpResponse,
    ) -> Option<GateDecision> {
        if !self.matches(&request.method, &request.url) {
            return None;
        }
        match response.json() {
            Ok(parsed) => self.classify(request.body.as_ref(), &parsed),
            Err(err) => {
                debug!(url = %request.url, error = %err, "Payment response is not JSON");
                None
            }
        }
    }

    /// Wrap the page's promise-style client.
    #[must_use]
    pub fn wrap<C: HttpClient>(self: &Arc<Self>, inner: C) -> InterceptedClient<C> {
        InterceptedClient {
            inner,
            interceptor: Arc::clone(self),
        }
    }

    /// Start observing one request object.
    #[must_use]
    pub fn tap(self: &Arc<Self>) -> RequestObjectTap {
        RequestObjectTap {
            interceptor: Arc::clone(self),
            method: None,
            url: None,
            body: None,
            watching: false,
            done: false,
        }
    }

    fn classify(&self, request_body: Option<&RequestBody>, response: &Value) -> Option<GateDecision> {
        let body = request_body.and_then(|body| match body.to_json() {
            Ok(value) => Some(value),
            Err(err) => {
                debug!(error = %err, "Payment request body is not JSON");
                None
            }
        });

        let Some(mut signal) = classify_creation_response(body.as_ref(), response, &self.normalizer)
        else {
            debug!("Response does not describe a created payment");
            return None;
        };

        if !signal.customer.has_identity() {
            if let Some((store, key)) = &self.profile {
                signal.customer = read_profile(store.as_ref(), key).or_fill(&signal.customer);
            }
        }

        trace!(transaction_id = %signal.transaction_id, "Network signal classified");
        Some(self.sink.submit(signal))
    }
}

/// Transparent decorator over the page's promise-style client.
///
/// Requests and responses pass through unmodified; transport errors are
/// returned to the caller exactly as the inner client produced them.
pub struct InterceptedClient<C> {
    inner: C,
    interceptor: Arc<NetworkInterceptor>,
}

impl<C> InterceptedClient<C> {
    /// The wrapped client.
    pub fn inner(&self) -> &C {
        &self.inner
    }
}

impl<C: HttpClient> HttpClient for InterceptedClient<C> {
    fn send<'a>(&'a self, request: HttpRequest) -> HostFuture<'a, Result<HttpResponse, HttpError>> {
        Box::pin(async move {
            let observed = self
                .interceptor
                .matches(&request.method, &request.url)
                .then(|| request.clone());
            let response = self.inner.send(request).await?;
            if let Some(request) = observed {
                self.interceptor.observe_response(&request, &response);
            }
            Ok(response)
        })
    }
}

/// Observer for one request object (XHR-style).
///
/// The host binding forwards `open`, `send` and every ready-state change,
/// then invokes the page's own handler itself; the tap never replaces or
/// suppresses it.
#[derive(Debug)]
pub struct RequestObjectTap {
    interceptor: Arc<NetworkInterceptor>,
    method: Option<String>,
    url: Option<String>,
    body: Option<RequestBody>,
    watching: bool,
    done: bool,
}

impl RequestObjectTap {
    /// Record the request line. Reopening starts a fresh request.
    pub fn open(&mut self, method: &str, url: &str) {
        self.method = Some(method.to_string());
        self.url = Some(url.to_string());
        self.body = None;
        self.watching = false;
        self.done = false;
    }

    /// Record the body and decide whether this request is worth watching.
    pub fn send(&mut self, body: Option<RequestBody>) {
        let method = self.method.as_deref().unwrap_or("GET");
        let url = self.url.as_deref().unwrap_or_default();
        self.watching = self.interceptor.matches(method, url);
        if self.watching {
            debug!(url, "Watching payment request object");
        }
        self.body = body;
    }

    /// Report a ready-state change. Classifies once, when the request is
    /// done with a 2xx status.
    pub fn ready_state_changed(
        &mut self,
        ready_state: u8,
        status: u16,
        response_text: &str,
    ) -> Option<GateDecision> {
        if !self.watching || self.done || ready_state != READY_STATE_DONE {
            return None;
        }
        self.done = true;
        if !(200..300).contains(&status) {
            debug!(status, "Payment request object finished without success");
            return None;
        }
        match serde_json::from_str::<Value>(response_text) {
            Ok(parsed) => self.interceptor.classify(self.body.as_ref(), &parsed),
            Err(err) => {
                debug!(error = %err, "Payment response is not JSON");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CollectingSink {
        signals: Mutex<Vec<TransactionSignal>>,
    }

    impl SignalSink for CollectingSink {
        fn submit(&self, signal: TransactionSignal) -> GateDecision {
            self.signals.lock().unwrap().push(signal);
            GateDecision::Fired
        }

        fn has_fired(&self) -> bool {
            !self.signals.lock().unwrap().is_empty()
        }
    }

    fn interceptor() -> (Arc<NetworkInterceptor>, Arc<CollectingSink>) {
        let sink = Arc::new(CollectingSink::default());
        let interceptor = NetworkInterceptor::new(&NetworkConfig::default(), sink.clone()).unwrap();
        (Arc::new(interceptor), sink)
    }

    #[test]
    fn classifies_minor_unit_amount() {
        let signal = classify_creation_response(
            None,
            &json!({"success": true, "transactionId": "TXN-1", "qrCode": "000201", "value": 2500}),
            &AmountNormalizer::default(),
        )
        .unwrap();
        assert_eq!(signal.transaction_id, "TXN-1");
        assert_eq!(signal.amount, Some(25.0));
        assert_eq!(signal.source, SignalSource::Network);
    }

    #[test]
    fn requires_success_and_proof() {
        let normalizer = AmountNormalizer::default();
        assert!(
            classify_creation_response(
                None,
                &json!({"success": false, "transactionId": "T", "qrCode": "x"}),
                &normalizer
            )
            .is_none()
        );
        assert!(
            classify_creation_response(
                None,
                &json!({"success": true, "transactionId": "T"}),
                &normalizer
            )
            .is_none()
        );
        assert!(
            classify_creation_response(
                None,
                &json!({"success": true, "qrCode": "x"}),
                &normalizer
            )
            .is_none()
        );
    }

    #[test]
    fn transaction_id_lookup_order() {
        let normalizer = AmountNormalizer::default();
        let signal = classify_creation_response(
            None,
            &json!({
                "success": true,
                "id": 99,
                "paymentInfo": {"transactionId": "nested", "pixCode": "abc"}
            }),
            &normalizer,
        )
        .unwrap();
        assert_eq!(signal.transaction_id, "nested");

        let signal = classify_creation_response(
            None,
            &json!({"success": true, "id": 99, "pix_code": "abc"}),
            &normalizer,
        )
        .unwrap();
        assert_eq!(signal.transaction_id, "99");
    }

    #[test]
    fn request_amount_wins_over_response() {
        let signal = classify_creation_response(
            Some(&json!({"amount": "19.90", "email": "a@b.c", "cpf": "1"})),
            &json!({"success": true, "transactionId": "T", "qrcode": "q", "value": 5000}),
            &AmountNormalizer::default(),
        )
        .unwrap();
        assert_eq!(signal.amount, Some(19.9));
        assert_eq!(signal.customer.email.as_deref(), Some("a@b.c"));
        assert_eq!(signal.customer.document.as_deref(), Some("1"));
    }

    #[test]
    fn payment_info_amount_is_last_resort() {
        let signal = classify_creation_response(
            None,
            &json!({"success": true, "transactionId": "T", "qrCode": "q", "paymentInfo": {"amount": 4990}}),
            &AmountNormalizer::default(),
        )
        .unwrap();
        assert_eq!(signal.amount, Some(49.9));
    }

    #[test]
    fn match_filter_is_post_only() {
        let (interceptor, _) = interceptor();
        assert!(interceptor.matches("post", "../production/Payments.php"));
        assert!(!interceptor.matches("GET", "../production/payments.php"));
        assert!(!interceptor.matches("POST", "/api/orders"));
    }

    #[test]
    fn profile_fills_missing_identity() {
        let sink = Arc::new(CollectingSink::default());
        let store = Arc::new(crate::host::MemoryStore::with_entries([(
            "userPixData",
            r#"{"nome":"Ana","email":"ana@x.y"}"#,
        )]));
        let interceptor = NetworkInterceptor::new(&NetworkConfig::default(), sink.clone())
            .unwrap()
            .with_profile(store, "userPixData");
        let decision = interceptor.observe_parsed(
            "POST",
            "/payments.php",
            Some(&RequestBody::Text(r#"{"phone":"119"}"#.into())),
            &json!({"success": true, "transactionId": "T", "qrCode": "q"}),
        );
        assert_eq!(decision, Some(GateDecision::Fired));
        let signals = sink.signals.lock().unwrap();
        assert_eq!(signals[0].customer.email.as_deref(), Some("ana@x.y"));
        assert_eq!(signals[0].customer.phone.as_deref(), Some("119"));
    }

    #[test]
    fn request_object_classifies_once_on_done() {
        let (interceptor, sink) = interceptor();
        let mut tap = interceptor.tap();
        tap.open("POST", "/payments.php");
        tap.send(Some(RequestBody::Text(r#"{"value": 2500}"#.into())));
        let body = r#"{"success":true,"transactionId":"T","qrCode":"q"}"#;
        assert_eq!(tap.ready_state_changed(2, 200, ""), None);
        assert_eq!(tap.ready_state_changed(4, 200, body), Some(GateDecision::Fired));
        assert_eq!(tap.ready_state_changed(4, 200, body), None);
        assert_eq!(sink.signals.lock().unwrap()[0].amount, Some(25.0));
    }

    #[test]
    fn request_object_ignores_failed_status() {
        let (interceptor, sink) = interceptor();
        let mut tap = interceptor.tap();
        tap.open("POST", "/payments.php");
        tap.send(None);
        let body = r#"{"success":true,"transactionId":"T","qrCode":"q"}"#;
        assert_eq!(tap.ready_state_changed(4, 500, body), None);
        assert!(sink.signals.lock().unwrap().is_empty());
    }

    #[test]
    fn reopened_request_object_classifies_again() {
        let (interceptor, sink) = interceptor();
        let mut tap = interceptor.tap();
        let body = r#"{"success":true,"transactionId":"T2","qrCode":"q"}"#;

        tap.open("POST", "/payments.php");
        tap.send(Some(RequestBody::Text(r#"{"value": 2500}"#.into())));
        assert_eq!(tap.ready_state_changed(4, 502, "bad gateway"), None);

        // unwatched request in between leaves nothing behind
        tap.open("GET", "/api/cart");
        tap.send(None);
        assert_eq!(tap.ready_state_changed(4, 200, body), None);

        tap.open("POST", "/payments.php");
        tap.send(Some(RequestBody::Text(r#"{"value": 4990}"#.into())));
        assert_eq!(tap.ready_state_changed(4, 200, body), Some(GateDecision::Fired));

        let signals = sink.signals.lock().unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].transaction_id, "T2");
        assert_eq!(signals[0].amount, Some(49.9));
    }
}
