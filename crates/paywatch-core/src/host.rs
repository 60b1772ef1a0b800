//! Host capability interfaces.
//!
//! The engine never touches a concrete page API. Everything it observes or
//! calls goes through the traits below, implemented by whatever binding
//! layer embeds the engine (a browser bridge, a headless harness, tests).
//!
//! ```text
//!   host page ──HttpClient──► InterceptedClient ──► NetworkInterceptor ─┐
//!   host page ──mutations───► DomWatcher ──DocumentProbe──────────────┼─► gate
//!   host page ──messages────► MessageListener ─────────────────────────┘
//!
//!   gate ─► invoker ──NotifierRegistry──► host tracking functions
//!   gate ─► poller ──PaymentVerifier | HttpClient──► verification
//!   poller ─► handoff ──Navigator──► next funnel step
//! ```

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::HttpError;
use crate::signal::{ConversionEvent, ConversionKind};

/// Boxed future returned by host capabilities.
pub type HostFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// =============================================================================
// HTTP
// =============================================================================

/// Request body as the page handed it to its request mechanism.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum RequestBody {
    /// Raw text (usually a JSON string)
    Text(String),
    /// Already-structured body
    Json(Value),
}

impl RequestBody {
    /// Structured view of the body, parsing text when needed.
    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::Text(text) => serde_json::from_str(text),
            Self::Json(value) => Ok(value.clone()),
        }
    }
}

/// Outgoing HTTP request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    /// Method as given by the caller (any case)
    pub method: String,
    /// Target URL, possibly relative
    pub url: String,
    /// Header pairs
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    /// Optional body
    #[serde(default)]
    pub body: Option<RequestBody>,
}

impl HttpRequest {
    /// GET without body.
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: None,
        }
    }

    /// POST with a JSON body.
    #[must_use]
    pub fn post_json(url: impl Into<String>, body: Value) -> Self {
        Self {
            method: "POST".to_string(),
            url: url.into(),
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: Some(RequestBody::Json(body)),
        }
    }

    /// Case-insensitive method comparison.
    #[must_use]
    pub fn is_method(&self, method: &str) -> bool {
        self.method.eq_ignore_ascii_case(method)
    }
}

/// Completed HTTP response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponse {
    /// Status code
    pub status: u16,
    /// Body text
    pub body: String,
}

impl HttpResponse {
    /// Build a response.
    #[must_use]
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// 2xx status.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parse the body as JSON.
    pub fn json(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_str(&self.body)
    }

    /// Parse a 2xx body as JSON, turning other statuses into errors.
    pub fn into_json(self) -> crate::Result<Value> {
        if !self.is_success() {
            return Err(HttpError::Status {
                status: self.status,
                body: truncate(&self.body, 256),
            }
            .into());
        }
        Ok(self.json()?)
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Promise-style request mechanism.
///
/// The page's own client is wrapped by
/// [`InterceptedClient`](crate::sources::network::InterceptedClient); the
/// engine's outbound calls (verification fallback, tag persistence) use an
/// unwrapped one.
pub trait HttpClient: Send + Sync {
    /// Send a request and resolve to its response.
    fn send<'a>(&'a self, request: HttpRequest) -> HostFuture<'a, Result<HttpResponse, HttpError>>;
}

impl<T: HttpClient + ?Sized> HttpClient for Arc<T> {
    fn send<'a>(&'a self, request: HttpRequest) -> HostFuture<'a, Result<HttpResponse, HttpError>> {
        (**self).send(request)
    }
}

// =============================================================================
// Notifiers and verification
// =============================================================================

/// A host tracking function ("track initiate" / "track purchase").
pub trait ConversionNotifier: Send + Sync {
    /// Invoke the tracking function. Errors count as failed attempts.
    fn track(&self, event: &ConversionEvent) -> crate::Result<()>;
}

/// External "verify payment status" capability.
pub trait PaymentVerifier: Send + Sync {
    /// Resolve to the raw status payload for `transaction_id`.
    fn verify<'a>(&'a self, transaction_id: &'a str) -> HostFuture<'a, crate::Result<Value>>;
}

/// Lookup of capabilities the host installs asynchronously.
///
/// Each lookup reflects the host's state at call time: a notifier missing now
/// may be present on the next attempt.
pub trait NotifierRegistry: Send + Sync {
    /// Notifier for `kind`, if installed.
    fn notifier(&self, kind: ConversionKind) -> Option<Arc<dyn ConversionNotifier>>;

    /// Verification capability, if installed.
    fn verifier(&self) -> Option<Arc<dyn PaymentVerifier>> {
        None
    }
}

// =============================================================================
// Storage, document, navigation
// =============================================================================

/// Page-scoped persistent key-value storage.
pub trait KeyValueStore: Send + Sync {
    /// Read a value.
    fn get(&self, key: &str) -> Option<String>;
    /// Write a value.
    fn set(&self, key: &str, value: &str) -> crate::Result<()>;
}

/// In-memory [`KeyValueStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with `entries`.
    #[must_use]
    pub fn with_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: Mutex::new(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        let guard = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        guard.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> crate::Result<()> {
        let mut guard = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        guard.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Read-only document queries used by the DOM watcher.
pub trait DocumentProbe: Send + Sync {
    /// Value of the first element carrying `attribute`.
    fn attribute_value(&self, attribute: &str) -> Option<String>;
    /// Global variable rendered as a string, when set.
    fn global_string(&self, name: &str) -> Option<String>;
    /// Visible text of the document body.
    fn visible_text(&self) -> String;
}

/// Page location and navigation.
pub trait Navigator: Send + Sync {
    /// Current path (`/up1/checkout/index.html`).
    fn current_path(&self) -> String;
    /// Current query string without the leading `?`.
    fn current_query(&self) -> String;
    /// Navigate to `target`.
    fn navigate(&self, target: &str);
}

/// Everything the engine needs from its host.
#[derive(Clone)]
pub struct HostBindings {
    /// Client for the engine's own outbound calls
    pub http: Arc<dyn HttpClient>,
    /// Late-bound tracking functions and verifier
    pub notifiers: Arc<dyn NotifierRegistry>,
    /// Page-scoped storage
    pub store: Arc<dyn KeyValueStore>,
    /// Document queries; `None` disables the DOM watcher
    pub document: Option<Arc<dyn DocumentProbe>>,
    /// Location and navigation
    pub navigator: Arc<dyn Navigator>,
}
