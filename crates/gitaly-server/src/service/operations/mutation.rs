//! Hook-gated reference updates shared by every `User*` RPC.

use std::sync::Arc;

use gitaly_error::GitalyError;
use gitaly_git::object_id::ObjectId;
use gitaly_git::reference::{RefUpdate, ReferenceName, ReferenceUpdateError};
use gitaly_git::transaction::{CancelSignal, HookedUpdate, TransactionError, TransactionOutcome};
use gitaly_proto::gitaly::OperationBranchUpdate;
use tonic::Status;
use tracing::{debug, info};

use crate::dependencies::Dependencies;
use crate::service::actors::{Actor, ResolvedRepository};
use crate::service::internal_error;

use super::outcome::{BusinessOutcome, Outcome};

/// Runs pre-receive, update, the swap and post-receive for one update.
pub(crate) async fn run_hooked_update(
    dependencies: &Dependencies,
    repository: &ResolvedRepository,
    user: &Actor,
    update: RefUpdate,
    cancel: CancelSignal,
) -> Result<TransactionOutcome, TransactionError> {
    debug!(
        repository = %repository.relative_path,
        reference = %update.reference,
        old = %update.old_oid,
        new = %update.new_oid,
        "starting hooked reference update"
    );

    let outcome = HookedUpdate::new(
        Arc::clone(&dependencies.hooks),
        repository.git.reference_updater(),
        repository.hook_environment(Some(user)),
        vec![update.clone()],
    )
    .with_cancel_signal(cancel)
    .execute()
    .await?;

    match &outcome {
        TransactionOutcome::Committed => info!(
            repository = %repository.relative_path,
            reference = %update.reference,
            old = %update.old_oid,
            new = %update.new_oid,
            user = %user.gl_id,
            "reference updated"
        ),
        TransactionOutcome::Rejected { hook, .. } => info!(
            repository = %repository.relative_path,
            reference = %update.reference,
            hook = %hook,
            "reference update rejected by hook"
        ),
    }
    Ok(outcome)
}

/// [`run_hooked_update`] with the usual error mapping: a hook rejection is
/// a business outcome, everything else a transport error.
pub(crate) async fn update_reference(
    dependencies: &Dependencies,
    repository: &ResolvedRepository,
    user: &Actor,
    update: RefUpdate,
    cancel: CancelSignal,
) -> Result<Outcome<()>, Status> {
    match run_hooked_update(dependencies, repository, user, update, cancel).await {
        Ok(TransactionOutcome::Committed) => Ok(Outcome::Applied(())),
        Ok(TransactionOutcome::Rejected { message, .. }) => {
            Ok(Outcome::Rejected(BusinessOutcome::HookRejected(message)))
        }
        Err(err) => Err(transaction_status(err)),
    }
}

pub(crate) fn is_conflict(err: &TransactionError) -> bool {
    matches!(
        err,
        TransactionError::Update(ReferenceUpdateError::Conflict { .. })
    )
}

pub(crate) fn transaction_status(err: TransactionError) -> Status {
    match err {
        TransactionError::Update(ReferenceUpdateError::Conflict { reference, .. }) => {
            GitalyError::failed_precondition(format!(
                "Could not update {reference}. Please refresh and try again."
            ))
            .with_reference(reference.as_str())
            .into()
        }
        TransactionError::Cancelled { phase } => {
            Status::cancelled(format!("request cancelled after {phase}"))
        }
        err => internal_error(err),
    }
}

/// A branch as it was when the operation started.
#[derive(Debug, Clone)]
pub(crate) struct BranchState {
    pub(crate) reference: ReferenceName,
    pub(crate) tip: Option<ObjectId>,
    /// The repository had no branch at all.
    pub(crate) repo_empty: bool,
}

impl BranchState {
    pub(crate) async fn load(
        repository: &ResolvedRepository,
        reference: ReferenceName,
    ) -> Result<Self, Status> {
        let tip = repository
            .git
            .reference_target(&reference)
            .await
            .map_err(internal_error)?;
        let repo_empty = match tip {
            Some(_) => false,
            None => !repository.git.has_branches().await.map_err(internal_error)?,
        };
        Ok(Self {
            reference,
            tip,
            repo_empty,
        })
    }

    /// The tip, or `FailedPrecondition` naming the missing branch.
    pub(crate) fn require_tip(&self) -> Result<&ObjectId, Status> {
        self.tip.as_ref().ok_or_else(|| {
            GitalyError::failed_precondition(format!(
                "branch not found: {}",
                self.reference.short_name()
            ))
            .with_reference(self.reference.as_str())
            .into()
        })
    }

    /// Compare-and-swap from the tip read at load time to `new_oid`.
    pub(crate) fn update_to(&self, new_oid: ObjectId) -> RefUpdate {
        match &self.tip {
            Some(old_oid) => RefUpdate::update(self.reference.clone(), old_oid.clone(), new_oid),
            None => RefUpdate::create(self.reference.clone(), new_oid),
        }
    }

    pub(crate) fn branch_update(&self, new_oid: &ObjectId) -> OperationBranchUpdate {
        OperationBranchUpdate {
            commit_id: new_oid.to_string(),
            repo_created: self.repo_empty,
            branch_created: self.tip.is_none(),
        }
    }
}
