//! Confirmation poller.
//!
//! Turns a canonical "created" event into a "confirmed" one by asking the
//! payment backend, over and over, whether the transaction has been paid.
//!
//! ```text
//!   start ──► check #1 ──paid──────────────────────────► Confirmed
//!                │ not paid / error
//!                ▼
//!          every interval: spawn check #n (no waiting on #n-1)
//!                │ first paid result
//!                ▼
//!          cancel schedule (once) ──► Confirmed ──► handler (once)
//! ```
//!
//! Checks may overlap when the backend is slower than the interval; their
//! results funnel through one driver task, so only the first paid answer
//! counts. Errors never stop polling and there is no attempt cap.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::PollerConfig;
use crate::host::{HttpClient, HttpRequest, NotifierRegistry};
use crate::retry::{RepeatingSchedule, RetryPolicy, spawn_repeating};
use crate::signal::Customer;

/// Status tokens that mean "paid", matched exactly.
pub const PAID_STATUSES: &[&str] = &[
    "completed",
    "COMPLETED",
    "paid",
    "PAID",
    "approved",
    "APPROVED",
    "confirmado",
    "CONFIRMADO",
    "aprovado",
    "APROVADO",
    "pago",
    "PAGO",
];

/// Default paid predicate: `paid == true` or a known status token.
#[must_use]
pub fn is_paid(response: &Value) -> bool {
    PaidPredicate::default().is_paid(response)
}

/// Paid predicate with optional extra status tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaidPredicate {
    extra_statuses: Vec<String>,
}

impl PaidPredicate {
    /// Predicate accepting `extra_statuses` on top of the built-in ones.
    #[must_use]
    pub fn new(extra_statuses: Vec<String>) -> Self {
        Self { extra_statuses }
    }

    /// Whether `response` reports the payment as settled.
    #[must_use]
    pub fn is_paid(&self, response: &Value) -> bool {
        if crate::signal::is_true(response, "paid") {
            return true;
        }
        let Some(status) = response.get("status").and_then(Value::as_str) else {
            return false;
        };
        PAID_STATUSES.contains(&status) || self.extra_statuses.iter().any(|s| s == status)
    }
}

/// Build `{endpoint}?transactionId=<id>` with the id URL-encoded.
#[must_use]
pub fn verification_url(endpoint: &str, transaction_id: &str) -> String {
    let separator = if endpoint.contains('?') { '&' } else { '?' };
    let encoded: String = url::form_urlencoded::byte_serialize(transaction_id.as_bytes()).collect();
    format!("{endpoint}{separator}transactionId={encoded}")
}

/// Asks the backend for a transaction's payment status.
///
/// Prefers the host's own verification capability; falls back to a GET
/// against the configured endpoint.
pub struct StatusChecker {
    registry: Arc<dyn NotifierRegistry>,
    http: Arc<dyn HttpClient>,
    endpoint: String,
}

impl StatusChecker {
    #[must_use]
    pub fn new(
        registry: Arc<dyn NotifierRegistry>,
        http: Arc<dyn HttpClient>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            http,
            endpoint: endpoint.into(),
        }
    }

    /// Fetch the raw status payload.
    pub async fn check(&self, transaction_id: &str) -> crate::Result<Value> {
        if let Some(verifier) = self.registry.verifier() {
            return verifier.verify(transaction_id).await;
        }
        let url = verification_url(&self.endpoint, transaction_id);
        debug!(url = %url, "Verifying payment through fallback endpoint");
        let response = self.http.send(HttpRequest::get(url)).await?;
        response.into_json()
    }
}

/// Where a polling session stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollStatus {
    /// Still checking
    Polling,
    /// A check reported the payment as settled
    Confirmed,
    /// Stopped by its owner before confirmation
    Abandoned,
}

/// Snapshot of one polling session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollSession {
    /// Canonical transaction id
    pub transaction_id: String,
    /// Amount captured at creation
    pub amount: Option<f64>,
    /// Customer captured at creation
    pub customer: Customer,
    /// Verifications issued so far
    pub attempts: u64,
    /// Current status
    pub status: PollStatus,
}

/// Receives the session once it is confirmed. Called at most once per
/// session; must not block.
pub trait ConfirmationHandler: Send + Sync {
    /// Payment confirmed.
    fn on_confirmed(&self, session: PollSession);
}

struct Inner {
    session: PollSession,
    schedule: Option<RepeatingSchedule>,
}

struct Shared {
    inner: Mutex<Inner>,
    cancel_count: AtomicU32,
    status_tx: watch::Sender<PollStatus>,
    runtime: Handle,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stop the schedule if it is running. Caller holds the lock.
    fn cancel_schedule(&self, inner: &mut Inner) {
        if let Some(mut schedule) = inner.schedule.take() {
            if schedule.cancel() {
                self.cancel_count.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}

type CheckResult = (u64, crate::Result<Value>);

/// Starts polling sessions.
pub struct ConfirmationPoller {
    checker: Arc<StatusChecker>,
    predicate: Arc<PaidPredicate>,
    policy: RetryPolicy,
    handler: Arc<dyn ConfirmationHandler>,
    runtime: Handle,
}

impl ConfirmationPoller {
    /// Poller built from config. Sessions run their checks on `runtime`.
    #[must_use]
    pub fn new(
        config: &PollerConfig,
        checker: StatusChecker,
        handler: Arc<dyn ConfirmationHandler>,
        runtime: Handle,
    ) -> Self {
        Self {
            checker: Arc::new(checker),
            predicate: Arc::new(PaidPredicate::new(config.extra_paid_statuses.clone())),
            policy: RetryPolicy::verification(config),
            handler,
            runtime,
        }
    }

    /// Start polling for `transaction_id`. Callable from any thread.
    pub fn start(
        &self,
        transaction_id: impl Into<String>,
        amount: Option<f64>,
        customer: Customer,
    ) -> PollHandle {
        let (status_tx, status_rx) = watch::channel(PollStatus::Polling);
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                session: PollSession {
                    transaction_id: transaction_id.into(),
                    amount,
                    customer,
                    attempts: 0,
                    status: PollStatus::Polling,
                },
                schedule: None,
            }),
            cancel_count: AtomicU32::new(0),
            status_tx,
            runtime: self.runtime.clone(),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        spawn_check(&shared, &self.checker, &tx);
        self.runtime.spawn(drive(
            Arc::clone(&shared),
            Arc::clone(&self.checker),
            Arc::clone(&self.predicate),
            self.policy.clone(),
            Arc::clone(&self.handler),
            tx,
            rx,
        ));

        PollHandle { shared, status_rx }
    }
}

/// Issue one verification in its own task. Returns `false` once the
/// session has settled; no check is issued then.
fn spawn_check(
    shared: &Arc<Shared>,
    checker: &Arc<StatusChecker>,
    tx: &mpsc::UnboundedSender<CheckResult>,
) -> bool {
    let (attempt, transaction_id) = {
        let mut inner = shared.lock();
        if inner.session.status != PollStatus::Polling {
            return false;
        }
        inner.session.attempts += 1;
        (inner.session.attempts, inner.session.transaction_id.clone())
    };
    let checker = Arc::clone(checker);
    let tx = tx.clone();
    shared.runtime.spawn(async move {
        let result = checker.check(&transaction_id).await;
        // receiver is gone once the session is settled
        let _ = tx.send((attempt, result));
    });
    true
}

async fn drive(
    shared: Arc<Shared>,
    checker: Arc<StatusChecker>,
    predicate: Arc<PaidPredicate>,
    policy: RetryPolicy,
    handler: Arc<dyn ConfirmationHandler>,
    tx: mpsc::UnboundedSender<CheckResult>,
    mut rx: mpsc::UnboundedReceiver<CheckResult>,
) {
    let mut tx = Some(tx);

    while let Some((attempt, result)) = rx.recv().await {
        let paid = match &result {
            Ok(response) => {
                let paid = predicate.is_paid(response);
                if !paid {
                    let status = response
                        .get("status")
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or("<none>");
                    debug!(attempt, status, "Payment not settled yet");
                }
                paid
            }
            Err(err) => {
                warn!(attempt, error = %err, "Payment verification failed");
                false
            }
        };

        let mut inner = shared.lock();
        if inner.session.status != PollStatus::Polling {
            // abandoned; drain in-flight checks and exit
            tx = None;
            continue;
        }

        if paid {
            shared.cancel_schedule(&mut inner);
            inner.session.status = PollStatus::Confirmed;
            let session = inner.session.clone();
            drop(inner);
            info!(
                transaction_id = %session.transaction_id,
                attempts = session.attempts,
                "Payment confirmed"
            );
            shared.status_tx.send_replace(PollStatus::Confirmed);
            handler.on_confirmed(session);
            return;
        }

        // first result in, paid or not: arm the repeating schedule
        if let Some(sender) = tx.take() {
            let tick_shared = Arc::clone(&shared);
            let tick_checker = Arc::clone(&checker);
            debug!(
                delay_ms = policy.initial_delay.as_millis() as u64,
                "Starting confirmation schedule"
            );
            inner.schedule = Some(spawn_repeating(policy.clone(), 2, move |_| {
                if !spawn_check(&tick_shared, &tick_checker, &sender) {
                    debug!("Tick after settlement skipped");
                }
            }));
        }
    }
}

/// Owner's view of a polling session.
#[derive(Clone)]
pub struct PollHandle {
    shared: Arc<Shared>,
    status_rx: watch::Receiver<PollStatus>,
}

impl std::fmt::Debug for PollHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollHandle")
            .field("session", &self.session())
            .field("cancel_count", &self.cancel_count())
            .finish()
    }
}

impl PollHandle {
    /// Current status.
    #[must_use]
    pub fn status(&self) -> PollStatus {
        self.shared.lock().session.status
    }

    /// Verifications issued so far.
    #[must_use]
    pub fn attempts(&self) -> u64 {
        self.shared.lock().session.attempts
    }

    /// How many times the repeating schedule was cancelled (0 or 1).
    #[must_use]
    pub fn cancel_count(&self) -> u32 {
        self.shared.cancel_count.load(Ordering::SeqCst)
    }

    /// Copy of the session.
    #[must_use]
    pub fn session(&self) -> PollSession {
        self.shared.lock().session.clone()
    }

    /// Stop polling without confirming. No-op once settled.
    pub fn abandon(&self) -> bool {
        let mut inner = self.shared.lock();
        if inner.session.status != PollStatus::Polling {
            return false;
        }
        self.shared.cancel_schedule(&mut inner);
        inner.session.status = PollStatus::Abandoned;
        drop(inner);
        self.shared.status_tx.send_replace(PollStatus::Abandoned);
        info!("Payment polling abandoned");
        true
    }

    /// Wait until the session settles. Resolves to `true` when it was
    /// confirmed.
    pub async fn confirmed(&self) -> bool {
        let mut rx = self.status_rx.clone();
        match rx.wait_for(|status| *status != PollStatus::Polling).await {
            Ok(status) => *status == PollStatus::Confirmed,
            Err(_) => false,
        }
    }
}
