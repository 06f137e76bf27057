//! Hook-gated reference updates.
//!
//! A [`HookedUpdate`] walks one set of reference updates through
//! `NotStarted -> PreReceiveRan -> UpdateRan -> Swapped -> PostReceiveRan`.
//! The compare-and-swap only happens once both gating hooks allowed it, and
//! a rejection or cancellation before that point leaves every reference
//! untouched. The swap and post-receive run on a detached task so that a
//! caller going away cannot interrupt them halfway.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::hooks::{HookEnvironment, HookError, HookExecutor, HookKind, HookOutcome};
use crate::reference::{RefUpdate, ReferenceUpdateError, ReferenceUpdater};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionPhase {
    NotStarted,
    PreReceiveRan,
    UpdateRan,
    Swapped,
    PostReceiveRan,
}

impl TransactionPhase {
    fn next(self) -> Option<Self> {
        match self {
            Self::NotStarted => Some(Self::PreReceiveRan),
            Self::PreReceiveRan => Some(Self::UpdateRan),
            Self::UpdateRan => Some(Self::Swapped),
            Self::Swapped => Some(Self::PostReceiveRan),
            Self::PostReceiveRan => None,
        }
    }
}

impl fmt::Display for TransactionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotStarted => "not started",
            Self::PreReceiveRan => "pre-receive ran",
            Self::UpdateRan => "update ran",
            Self::Swapped => "swapped",
            Self::PostReceiveRan => "post-receive ran",
        };
        f.write_str(name)
    }
}

/// Asks whether the caller is still interested in the result.
#[derive(Clone, Default)]
pub struct CancelSignal(Option<Arc<dyn Fn() -> bool + Send + Sync>>);

impl CancelSignal {
    pub fn never() -> Self {
        Self(None)
    }

    pub fn new(check: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        Self(Some(Arc::new(check)))
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.as_ref().is_some_and(|check| check())
    }
}

impl fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CancelSignal").field(&self.0.is_some()).finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionOutcome {
    Committed,
    Rejected { hook: HookKind, message: String },
}

#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("cancelled by the caller after {phase}")]
    Cancelled { phase: TransactionPhase },
    #[error("illegal transition from {from} to {to}")]
    IllegalTransition {
        from: TransactionPhase,
        to: TransactionPhase,
    },
    #[error(transparent)]
    Hook(#[from] HookError),
    #[error(transparent)]
    Update(#[from] ReferenceUpdateError),
    #[error("reference update task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub struct HookedUpdate<H> {
    hooks: Arc<H>,
    updater: ReferenceUpdater,
    environment: HookEnvironment,
    updates: Vec<RefUpdate>,
    cancel: CancelSignal,
    phase: TransactionPhase,
}

impl<H> HookedUpdate<H>
where
    H: HookExecutor + 'static,
{
    pub fn new(
        hooks: Arc<H>,
        updater: ReferenceUpdater,
        environment: HookEnvironment,
        updates: Vec<RefUpdate>,
    ) -> Self {
        Self {
            hooks,
            updater,
            environment,
            updates,
            cancel: CancelSignal::never(),
            phase: TransactionPhase::NotStarted,
        }
    }

    pub fn with_cancel_signal(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn phase(&self) -> TransactionPhase {
        self.phase
    }

    pub async fn execute(mut self) -> Result<TransactionOutcome, TransactionError> {
        for hook in [HookKind::PreReceive, HookKind::Update] {
            self.ensure_not_cancelled()?;
            let outcome = self
                .hooks
                .run(hook, &self.environment, &self.updates)
                .await?;
            if let HookOutcome::Rejected(message) = outcome {
                return Ok(TransactionOutcome::Rejected { hook, message });
            }
            self.advance(match hook {
                HookKind::PreReceive => TransactionPhase::PreReceiveRan,
                _ => TransactionPhase::UpdateRan,
            })?;
        }

        self.ensure_not_cancelled()?;
        self.advance(TransactionPhase::Swapped)?;

        let hooks = Arc::clone(&self.hooks);
        let updater = self.updater.clone();
        let environment = self.environment.clone();
        let updates = self.updates.clone();
        let swap = tokio::spawn(async move {
            updater.apply(&updates).await?;
            for update in &updates {
                info!(
                    reference = %update.reference,
                    old = %update.old_oid,
                    new = %update.new_oid,
                    "reference updated"
                );
            }

            match hooks.run(HookKind::PostReceive, &environment, &updates).await {
                Ok(HookOutcome::Allowed) => {}
                Ok(HookOutcome::Rejected(message)) => {
                    warn!(%message, "post-receive hook failed after the update was applied");
                }
                Err(err) => warn!(error = %err, "post-receive hook could not run"),
            }
            Ok::<_, ReferenceUpdateError>(())
        });
        swap.await??;

        self.advance(TransactionPhase::PostReceiveRan)?;
        Ok(TransactionOutcome::Committed)
    }

    fn ensure_not_cancelled(&self) -> Result<(), TransactionError> {
        if self.cancel.is_cancelled() {
            return Err(TransactionError::Cancelled { phase: self.phase });
        }
        Ok(())
    }

    fn advance(&mut self, to: TransactionPhase) -> Result<(), TransactionError> {
        if self.phase.next() != Some(to) {
            return Err(TransactionError::IllegalTransition {
                from: self.phase,
                to,
            });
        }
        self.phase = to;
        Ok(())
    }
}
