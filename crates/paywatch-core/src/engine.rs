//! Engine activation and wiring.
//!
//! [`Engine::start`] captures attribution, builds every component from the
//! config and returns [`EngineHandles`], the only surface the host binding
//! talks to afterwards: it feeds page events in through the handles and the
//! engine calls back out through [`HostBindings`].
//!
//! ```text
//!  handles.intercept / tap / observe_parsed ─┐
//!  handles.observe_mutations ────────────────┼─► CorrelationGate
//!  handles.receive_message ──────────────────┘        │ Fired (once)
//!                                                     ▼
//!                                              CreationHandler
//!                                     ┌───────────────┼──────────────────┐
//!                                     ▼               ▼                  ▼
//!                          invoker (initiate)   poller.start     tag persistence
//!                                                     │ confirmed (once)
//!                                                     ▼
//!                                           ConfirmationHandoff
//! ```

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{info, warn};

use crate::attribution::{AttributionSnapshot, TagPersister};
use crate::config::{Config, FallbackPolicy};
use crate::error::Error;
use crate::gate::{CanonicalEvent, CanonicalEventHandler, CorrelationGate, GateDecision};
use crate::handoff::ConfirmationHandoff;
use crate::host::{HostBindings, HttpClient, RequestBody};
use crate::invoker::{DeliveryReport, ReadyInvoker};
use crate::poller::{ConfirmationPoller, PollHandle, StatusChecker};
use crate::signal::{ConversionEvent, ConversionKind};
use crate::sources::SignalSink;
use crate::sources::dom::{DomWatcher, MutationBatch};
use crate::sources::message::MessageListener;
use crate::sources::network::{InterceptedClient, NetworkInterceptor, RequestObjectTap};

/// What the engine did after the canonical event.
#[derive(Debug, Default)]
struct Activity {
    initiate: Mutex<Option<DeliveryReport>>,
    poll: Mutex<Option<PollHandle>>,
}

/// Reacts to the canonical "created" event.
struct CreationHandler {
    invoker: ReadyInvoker,
    poller: ConfirmationPoller,
    persister: Option<TagPersister>,
    snapshot: AttributionSnapshot,
    fallback: FallbackPolicy,
    content_id: String,
    activity: Arc<Activity>,
    runtime: Handle,
}

impl CanonicalEventHandler for CreationHandler {
    fn on_canonical(&self, event: CanonicalEvent) {
        let signal = event.signal;
        let initiate = ConversionEvent {
            transaction_id: signal.transaction_id.clone(),
            amount: signal.amount.or(self.fallback.amount).unwrap_or_default(),
            customer: signal.customer.clone(),
            content_id: self.content_id.clone(),
        };

        let invoker = self.invoker.clone();
        let activity = Arc::clone(&self.activity);
        self.runtime.spawn(async move {
            let report = invoker.notify(ConversionKind::Initiate, &initiate).await;
            *activity.initiate.lock().unwrap_or_else(|e| e.into_inner()) = Some(report);
        });

        let handle = self.poller.start(
            signal.transaction_id.clone(),
            signal.amount,
            signal.customer.clone(),
        );
        *self.activity.poll.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        if let Some(persister) = self.persister.clone() {
            let snapshot = self.snapshot.clone();
            self.runtime.spawn(async move {
                persister
                    .persist_best_effort(&signal.transaction_id, &snapshot, &signal.customer)
                    .await;
            });
        }
    }
}

/// Not-yet-started engine.
pub struct Engine {
    config: Config,
    host: HostBindings,
}

impl Engine {
    #[must_use]
    pub fn new(config: Config, host: HostBindings) -> Self {
        Self { config, host }
    }

    /// Activate the engine.
    ///
    /// Must be called inside a tokio runtime. Every task the engine spawns
    /// later runs on that runtime, so page events may be fed in from any
    /// thread afterwards.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration or when no runtime is current; host
    /// capabilities are never touched in a way that can fail here.
    pub fn start(self) -> crate::Result<EngineHandles> {
        let Self { config, host } = self;
        config.validate()?;
        let runtime = Handle::try_current().map_err(|err| Error::NoRuntime(err.to_string()))?;

        let snapshot = AttributionSnapshot::capture(
            &host.navigator.current_query(),
            &config.attribution.capture_keys,
        );
        if let Err(err) = snapshot.store(host.store.as_ref(), &config.attribution.snapshot_key) {
            warn!(error = %err, "Failed to store campaign tags");
        }

        let invoker = ReadyInvoker::from_config(Arc::clone(&host.notifiers), &config.invoker);
        let handoff = ConfirmationHandoff::new(
            &config.handoff,
            invoker.clone(),
            Arc::clone(&host.store),
            Arc::clone(&host.navigator),
            runtime.clone(),
        )
        .with_content_id(config.invoker.content_id.clone())
        .with_redirect_tags(
            config.attribution.redirect_key.clone(),
            config.attribution.redirect_keys.clone(),
        )
        .with_snapshot(snapshot.clone());
        let poller = ConfirmationPoller::new(
            &config.poller,
            StatusChecker::new(
                Arc::clone(&host.notifiers),
                Arc::clone(&host.http),
                config.poller.verify_endpoint.clone(),
            ),
            Arc::new(handoff),
            runtime.clone(),
        );

        let activity = Arc::new(Activity::default());
        let handler = CreationHandler {
            invoker,
            poller,
            persister: config
                .attribution
                .persist_tags
                .then(|| TagPersister::new(Arc::clone(&host.http), config.attribution.tag_endpoint.clone())),
            snapshot: snapshot.clone(),
            fallback: config.handoff.fallback.clone(),
            content_id: config.invoker.content_id.clone(),
            activity: Arc::clone(&activity),
            runtime: runtime.clone(),
        };

        let gate = Arc::new(CorrelationGate::new(Arc::new(handler)));
        let sink: Arc<dyn SignalSink> = gate.clone();
        let profile_key = config.attribution.profile_key.clone();

        let network = Arc::new(
            NetworkInterceptor::new(&config.network, Arc::clone(&sink))?
                .with_profile(Arc::clone(&host.store), profile_key.clone()),
        );
        let dom = match (&host.document, config.dom.enabled) {
            (Some(document), true) => Some(Arc::new(
                DomWatcher::new(
                    config.dom.clone(),
                    Arc::clone(document),
                    Arc::clone(&sink),
                    runtime,
                )
                .with_profile(Arc::clone(&host.store), profile_key),
            )),
            _ => None,
        };
        let messages = Arc::new(MessageListener::new(&config.messages, sink));

        info!(
            dom_watcher = dom.is_some(),
            campaign_tags = snapshot.tags().len(),
            "Payment watcher active"
        );

        Ok(EngineHandles {
            gate,
            network,
            dom,
            messages,
            snapshot,
            activity,
        })
    }
}

/// Entry points for the host binding.
#[derive(Clone)]
pub struct EngineHandles {
    gate: Arc<CorrelationGate>,
    network: Arc<NetworkInterceptor>,
    dom: Option<Arc<DomWatcher>>,
    messages: Arc<MessageListener>,
    snapshot: AttributionSnapshot,
    activity: Arc<Activity>,
}

impl std::fmt::Debug for EngineHandles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandles")
            .field("gate", &self.gate)
            .field("dom_watcher", &self.dom.is_some())
            .field("snapshot", &self.snapshot)
            .finish_non_exhaustive()
    }
}

impl EngineHandles {
    /// Wrap the page's promise-style client.
    #[must_use]
    pub fn intercept<C: HttpClient>(&self, inner: C) -> InterceptedClient<C> {
        self.network.wrap(inner)
    }

    /// Observer for one XHR-style request object.
    #[must_use]
    pub fn request_tap(&self) -> RequestObjectTap {
        self.network.tap()
    }

    /// Report an already-parsed response.
    pub fn observe_parsed(
        &self,
        method: &str,
        url: &str,
        request_body: Option<&RequestBody>,
        response: &Value,
    ) -> Option<GateDecision> {
        self.network.observe_parsed(method, url, request_body, response)
    }

    /// Report inserted elements. Returns `true` when a scan was scheduled.
    pub fn observe_mutations(&self, batch: &MutationBatch) -> bool {
        self.dom.as_ref().is_some_and(|dom| dom.observe(batch))
    }

    /// Report a posted message.
    pub fn receive_message(&self, payload: &Value, origin: Option<&str>) -> Option<GateDecision> {
        self.messages.receive(payload, origin)
    }

    /// The correlation gate.
    #[must_use]
    pub fn gate(&self) -> &CorrelationGate {
        &self.gate
    }

    /// Tags captured at start.
    #[must_use]
    pub fn attribution(&self) -> &AttributionSnapshot {
        &self.snapshot
    }

    /// Polling session, once a transaction was created.
    #[must_use]
    pub fn poll_handle(&self) -> Option<PollHandle> {
        self.activity
            .poll
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Outcome of the "created" notification, once settled.
    #[must_use]
    pub fn initiate_report(&self) -> Option<DeliveryReport> {
        self.activity
            .initiate
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Stop polling. Returns `true` if a running session was abandoned.
    pub fn shutdown(&self) -> bool {
        self.poll_handle().is_some_and(|handle| handle.abandon())
    }
}
