//! Ready-dependency invoker.
//!
//! The host installs its tracking functions whenever its own scripts finish
//! loading, which may be after the engine has something to report. Each
//! attempt looks the notifier up again; a missing notifier and a notifier
//! that throws are both just failed attempts.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info};

use crate::config::InvokerConfig;
use crate::error::Error;
use crate::host::NotifierRegistry;
use crate::retry::{RetryPolicy, with_retry_outcome};
use crate::signal::{ConversionEvent, ConversionKind};

/// What happened to one notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    /// Notifier the event was meant for
    pub kind: ConversionKind,
    /// Whether some attempt succeeded
    pub delivered: bool,
    /// Attempts made, including the successful one
    pub attempts: u32,
    /// Time from the first attempt to the outcome
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    #[allow(clippy::cast_possible_truncation)]
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}

/// Delivers conversion events to late-bound notifiers.
#[derive(Clone)]
pub struct ReadyInvoker {
    registry: Arc<dyn NotifierRegistry>,
    policy: RetryPolicy,
}

impl std::fmt::Debug for ReadyInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadyInvoker")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl ReadyInvoker {
    /// Invoker with an explicit retry policy.
    #[must_use]
    pub fn new(registry: Arc<dyn NotifierRegistry>, policy: RetryPolicy) -> Self {
        Self { registry, policy }
    }

    /// Invoker with the configured delay and retry budget.
    #[must_use]
    pub fn from_config(registry: Arc<dyn NotifierRegistry>, config: &InvokerConfig) -> Self {
        Self::new(registry, RetryPolicy::notifier(config))
    }

    /// Retry policy in use.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn attempt(&self, kind: ConversionKind, event: &ConversionEvent) -> crate::Result<()> {
        let notifier = self
            .registry
            .notifier(kind)
            .ok_or(Error::NotifierUnavailable(kind.as_str()))?;
        notifier.track(event)
    }

    /// Deliver `event` to the `kind` notifier, retrying per policy.
    ///
    /// Never fails: exhaustion is logged and reported as
    /// `delivered == false`.
    pub async fn notify(&self, kind: ConversionKind, event: &ConversionEvent) -> DeliveryReport {
        let outcome = with_retry_outcome(&self.policy, || {
            let result = self.attempt(kind, event);
            if let Err(err) = &result {
                debug!(
                    notifier = kind.as_str(),
                    transaction_id = %event.transaction_id,
                    transient = err.is_transient(),
                    error = %err,
                    "Notifier attempt failed"
                );
            }
            std::future::ready(result)
        })
        .await;

        let delivered = outcome.result.is_ok();
        if delivered {
            info!(
                notifier = kind.as_str(),
                transaction_id = %event.transaction_id,
                attempts = outcome.attempts,
                "Conversion notified"
            );
        } else {
            error!(
                notifier = kind.as_str(),
                transaction_id = %event.transaction_id,
                attempts = outcome.attempts,
                "Notifier never became ready, notification dropped"
            );
        }

        DeliveryReport {
            kind,
            delivered,
            attempts: outcome.attempts,
            elapsed: outcome.elapsed,
        }
    }
}
