//! Shared test infrastructure for paywatch-core integration tests.
//!
//! Mock host capabilities with scripted behavior and call recording. All
//! timing goes through `tokio::time`, so tests run on a paused clock.
//!
//! ```ignore
//! mod common;
//! use common::{TestHost, ScriptedVerifier};
//! ```

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use paywatch_core::error::HttpError;
use paywatch_core::host::{
    ConversionNotifier, DocumentProbe, HostBindings, HostFuture, HttpClient, HttpRequest,
    HttpResponse, KeyValueStore, MemoryStore, Navigator, NotifierRegistry, PaymentVerifier,
};
use paywatch_core::signal::{ConversionEvent, ConversionKind};
use serde_json::Value;
use tokio::time::Instant;

// ────────────────────────────────────────────────────────────────────
// HTTP
// ────────────────────────────────────────────────────────────────────

/// One scripted answer: wait `delay`, then resolve.
#[derive(Clone)]
pub struct Reply {
    pub delay: Duration,
    pub result: Result<HttpResponse, HttpError>,
}

impl Reply {
    pub fn ok(status: u16, body: impl Into<String>) -> Self {
        Self {
            delay: Duration::ZERO,
            result: Ok(HttpResponse::new(status, body)),
        }
    }

    pub fn json(body: &Value) -> Self {
        Self::ok(200, body.to_string())
    }

    pub fn transport_error(message: &str) -> Self {
        Self {
            delay: Duration::ZERO,
            result: Err(HttpError::Transport(message.to_string())),
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// HTTP client answering from a script; the last reply repeats forever.
#[derive(Default)]
pub struct ScriptedHttp {
    replies: Mutex<VecDeque<Reply>>,
    pub requests: Mutex<Vec<(Instant, HttpRequest)>>,
}

impl ScriptedHttp {
    pub fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn request_times(&self) -> Vec<Instant> {
        self.requests.lock().unwrap().iter().map(|(t, _)| *t).collect()
    }

    fn next_reply(&self) -> Reply {
        let mut replies = self.replies.lock().unwrap();
        if replies.len() > 1 {
            replies.pop_front().unwrap()
        } else {
            replies
                .front()
                .cloned()
                .unwrap_or_else(|| Reply::ok(404, "no script"))
        }
    }
}

impl HttpClient for ScriptedHttp {
    fn send<'a>(&'a self, request: HttpRequest) -> HostFuture<'a, Result<HttpResponse, HttpError>> {
        self.requests.lock().unwrap().push((Instant::now(), request));
        let reply = self.next_reply();
        Box::pin(async move {
            tokio::time::sleep(reply.delay).await;
            reply.result
        })
    }
}

// ────────────────────────────────────────────────────────────────────
// Verification
// ────────────────────────────────────────────────────────────────────

/// Verifier answering from a script; the last answer repeats forever.
#[derive(Default)]
pub struct ScriptedVerifier {
    answers: Mutex<VecDeque<(Duration, Result<Value, String>)>>,
    pub calls: Mutex<Vec<(Instant, String)>>,
}

impl ScriptedVerifier {
    pub fn new(answers: Vec<(Duration, Result<Value, String>)>) -> Arc<Self> {
        Arc::new(Self {
            answers: Mutex::new(answers.into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Immediate answers with the given statuses.
    pub fn statuses(statuses: &[&str]) -> Arc<Self> {
        Self::new(
            statuses
                .iter()
                .map(|s| (Duration::ZERO, Ok(serde_json::json!({ "status": s }))))
                .collect(),
        )
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().iter().map(|(t, _)| *t).collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl PaymentVerifier for ScriptedVerifier {
    fn verify<'a>(&'a self, transaction_id: &'a str) -> HostFuture<'a, paywatch_core::Result<Value>> {
        self.calls
            .lock()
            .unwrap()
            .push((Instant::now(), transaction_id.to_string()));
        let (delay, answer) = {
            let mut answers = self.answers.lock().unwrap();
            if answers.len() > 1 {
                answers.pop_front().unwrap()
            } else {
                answers
                    .front()
                    .cloned()
                    .unwrap_or((Duration::ZERO, Err("no script".to_string())))
            }
        };
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            answer.map_err(paywatch_core::Error::Verification)
        })
    }
}

// ────────────────────────────────────────────────────────────────────
// Notifiers
// ────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingNotifier {
    pub events: Mutex<Vec<(Instant, ConversionEvent)>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<ConversionEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(_, e)| e.clone())
            .collect()
    }
}

impl ConversionNotifier for RecordingNotifier {
    fn track(&self, event: &ConversionEvent) -> paywatch_core::Result<()> {
        self.events
            .lock()
            .unwrap()
            .push((Instant::now(), event.clone()));
        Ok(())
    }
}

/// Registry whose notifiers can be installed at any time.
#[derive(Default)]
pub struct LateRegistry {
    pub initiate: Arc<RecordingNotifier>,
    pub purchase: Arc<RecordingNotifier>,
    installed: Mutex<BTreeMap<&'static str, bool>>,
    verifier: Mutex<Option<Arc<ScriptedVerifier>>>,
    pub lookups: Mutex<Vec<(Instant, ConversionKind)>>,
}

impl LateRegistry {
    /// Both notifiers installed up front.
    pub fn ready() -> Arc<Self> {
        let registry = Arc::new(Self::default());
        registry.install(ConversionKind::Initiate);
        registry.install(ConversionKind::Purchase);
        registry
    }

    /// Nothing installed yet.
    pub fn empty() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn install(&self, kind: ConversionKind) {
        self.installed.lock().unwrap().insert(kind.as_str(), true);
    }

    pub fn set_verifier(&self, verifier: Arc<ScriptedVerifier>) {
        *self.verifier.lock().unwrap() = Some(verifier);
    }

    pub fn lookup_count(&self, kind: ConversionKind) -> usize {
        self.lookups
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, k)| *k == kind)
            .count()
    }
}

impl NotifierRegistry for LateRegistry {
    fn notifier(&self, kind: ConversionKind) -> Option<Arc<dyn ConversionNotifier>> {
        self.lookups.lock().unwrap().push((Instant::now(), kind));
        let installed = self
            .installed
            .lock()
            .unwrap()
            .get(kind.as_str())
            .copied()
            .unwrap_or(false);
        if !installed {
            return None;
        }
        let notifier: Arc<dyn ConversionNotifier> = match kind {
            ConversionKind::Initiate => self.initiate.clone(),
            ConversionKind::Purchase => self.purchase.clone(),
        };
        Some(notifier)
    }

    fn verifier(&self) -> Option<Arc<dyn PaymentVerifier>> {
        self.verifier
            .lock()
            .unwrap()
            .clone()
            .map(|v| v as Arc<dyn PaymentVerifier>)
    }
}

// ────────────────────────────────────────────────────────────────────
// Page
// ────────────────────────────────────────────────────────────────────

pub struct FakeNavigator {
    pub path: String,
    pub query: String,
    pub navigations: Mutex<Vec<(Instant, String)>>,
}

impl FakeNavigator {
    pub fn new(path: &str, query: &str) -> Arc<Self> {
        Arc::new(Self {
            path: path.to_string(),
            query: query.to_string(),
            navigations: Mutex::new(Vec::new()),
        })
    }

    pub fn targets(&self) -> Vec<String> {
        self.navigations
            .lock()
            .unwrap()
            .iter()
            .map(|(_, t)| t.clone())
            .collect()
    }
}

impl Navigator for FakeNavigator {
    fn current_path(&self) -> String {
        self.path.clone()
    }

    fn current_query(&self) -> String {
        self.query.clone()
    }

    fn navigate(&self, target: &str) {
        self.navigations
            .lock()
            .unwrap()
            .push((Instant::now(), target.to_string()));
    }
}

#[derive(Default)]
pub struct FakeDocument {
    pub attributes: Mutex<BTreeMap<String, String>>,
    pub globals: Mutex<BTreeMap<String, String>>,
    pub text: Mutex<String>,
}

impl FakeDocument {
    pub fn with_text(text: &str) -> Arc<Self> {
        let document = Self::default();
        *document.text.lock().unwrap() = text.to_string();
        Arc::new(document)
    }
}

impl DocumentProbe for FakeDocument {
    fn attribute_value(&self, attribute: &str) -> Option<String> {
        self.attributes.lock().unwrap().get(attribute).cloned()
    }

    fn global_string(&self, name: &str) -> Option<String> {
        self.globals.lock().unwrap().get(name).cloned()
    }

    fn visible_text(&self) -> String {
        self.text.lock().unwrap().clone()
    }
}

// ────────────────────────────────────────────────────────────────────
// Assembled host
// ────────────────────────────────────────────────────────────────────

/// Every mock, with handles kept for assertions.
pub struct TestHost {
    pub http: Arc<ScriptedHttp>,
    pub registry: Arc<LateRegistry>,
    pub store: Arc<MemoryStore>,
    pub document: Arc<FakeDocument>,
    pub navigator: Arc<FakeNavigator>,
}

impl TestHost {
    /// Checkout page at `/checkout/index.html`, notifiers ready, verifier
    /// answering `statuses` in order.
    pub fn checkout(statuses: &[&str]) -> Self {
        let registry = LateRegistry::ready();
        registry.set_verifier(ScriptedVerifier::statuses(statuses));
        Self {
            http: ScriptedHttp::new(vec![Reply::ok(200, "{}")]),
            registry,
            store: Arc::new(MemoryStore::new()),
            document: Arc::new(FakeDocument::default()),
            navigator: FakeNavigator::new("/checkout/index.html", ""),
        }
    }

    pub fn with_navigator(mut self, navigator: Arc<FakeNavigator>) -> Self {
        self.navigator = navigator;
        self
    }

    pub fn with_registry(mut self, registry: Arc<LateRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_http(mut self, http: Arc<ScriptedHttp>) -> Self {
        self.http = http;
        self
    }

    pub fn with_store_entry(self, key: &str, value: &str) -> Self {
        self.store.set(key, value).unwrap();
        self
    }

    pub fn verifier(&self) -> Arc<ScriptedVerifier> {
        self.registry
            .verifier
            .lock()
            .unwrap()
            .clone()
            .expect("verifier installed")
    }

    pub fn bindings(&self) -> HostBindings {
        HostBindings {
            http: self.http.clone(),
            notifiers: self.registry.clone(),
            store: self.store.clone(),
            document: Some(self.document.clone() as Arc<dyn DocumentProbe>),
            navigator: self.navigator.clone(),
        }
    }
}

/// Creation response as the checkout backend sends it.
pub fn creation_response(transaction_id: &str, value: f64) -> Value {
    serde_json::json!({
        "success": true,
        "transactionId": transaction_id,
        "value": value,
        "paymentInfo": { "qrCode": "00020126580014br.gov.bcb.pix" }
    })
}

/// Let spawned tasks run without moving the clock.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}
