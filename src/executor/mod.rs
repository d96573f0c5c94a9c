//! # Action Executor
//!
//! Runs the two downstream actions for one scan event concurrently and folds
//! their outcomes into a single [`ProcessingResult`]:
//!
//! - [`HttpNotifier`]: `GET <base_url>?query=<area>,<station>`
//! - [`ProcessMutation`]: `<program> <args...> --add --db <area>`
//!
//! Every action is bounded by its own timeout. Timeouts, transport errors and
//! spawn failures all become [`ActionOutcome`]s here; nothing escapes as an error.

mod mutation;
mod notification;
mod outcome;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::config::{ConfigResult, RelayConfig};
use crate::messaging::ScanEvent;

pub use mutation::ProcessMutation;
pub use notification::{classify_status, HttpNotifier};
pub use outcome::{ActionOutcome, OutcomeKind, ProcessingResult};

/// One downstream side effect of a scan event
#[async_trait]
pub trait ScanAction: Send + Sync + 'static {
    /// Name used in outcomes and logs
    fn name(&self) -> &'static str;

    /// Wall-clock limit; exceeding it is a transient failure
    fn timeout(&self) -> Duration;

    /// Perform the action, classifying every failure
    async fn run(&self, event: &ScanEvent) -> ActionOutcome;
}

/// Notification and mutation actions for one event
#[derive(Clone)]
pub struct ActionExecutor {
    notification: Arc<dyn ScanAction>,
    mutation: Arc<dyn ScanAction>,
}

impl std::fmt::Debug for ActionExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionExecutor")
            .field("notification", &self.notification.name())
            .field("mutation", &self.mutation.name())
            .finish()
    }
}

impl ActionExecutor {
    pub fn new(notification: Arc<dyn ScanAction>, mutation: Arc<dyn ScanAction>) -> Self {
        Self {
            notification,
            mutation,
        }
    }

    /// HTTP notifier and process mutation built from configuration
    pub fn from_config(config: &RelayConfig) -> ConfigResult<Self> {
        let notification = HttpNotifier::from_config(&config.notification)?;
        let mutation = ProcessMutation::from_config(&config.mutation);
        Ok(Self::new(Arc::new(notification), Arc::new(mutation)))
    }

    /// Run both actions concurrently and wait for both
    pub async fn execute(&self, event: &ScanEvent) -> ProcessingResult {
        let (notification, mutation) = tokio::join!(
            run_bounded(self.notification.as_ref(), event),
            run_bounded(self.mutation.as_ref(), event),
        );

        let result = ProcessingResult::from_outcomes(vec![notification, mutation]);
        debug!(
            event = %event,
            kind = %result.kind,
            detail = %result.detail(),
            "Actions finished"
        );
        result
    }
}

async fn run_bounded(action: &dyn ScanAction, event: &ScanEvent) -> ActionOutcome {
    let limit = action.timeout();
    match tokio::time::timeout(limit, action.run(event)).await {
        Ok(outcome) => outcome,
        Err(_) => ActionOutcome::transient(
            action.name(),
            format!("timed out after {}ms", limit.as_millis()),
        ),
    }
}
