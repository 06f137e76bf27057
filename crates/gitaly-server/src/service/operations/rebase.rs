//! `UserRebase`: replays a branch onto the tip of a remote branch.
//!
//! Anything git-level that stops the rebase (a conflict, a missing remote
//! branch, the branch having moved) is reported in `git_error`. Only a
//! hook rejection is reported as `pre_receive_error`.

use gitaly_error::GitalyError;
use gitaly_git::object_id::ObjectId;
use gitaly_git::remote::RemoteRepository;
use gitaly_git::repository::{MergeTreeResult, NewCommit};
use gitaly_git::transaction::{CancelSignal, TransactionOutcome};
use gitaly_proto::gitaly::{UserRebaseRequest, UserRebaseResponse};
use tonic::Status;
use tracing::debug;

use crate::dependencies::Dependencies;
use crate::service::actors::{
    branch_reference, load_commit, parse_object_id, required_text, resolve_remote,
    resolve_repository, Actor, ResolvedRepository,
};
use crate::service::internal_error;

use super::mutation::{is_conflict, run_hooked_update, transaction_status, BranchState};
use super::outcome::{into_envelope, BusinessOutcome, Outcome};

pub(crate) async fn user_rebase(
    dependencies: &Dependencies,
    request: UserRebaseRequest,
) -> Result<UserRebaseResponse, Status> {
    let repository = resolve_repository(dependencies, request.repository.as_ref()).await?;
    let user = Actor::from_request(request.user.as_ref())?;
    if request.rebase_id.trim().is_empty() {
        return Err(GitalyError::invalid_argument("empty RebaseId").into());
    }
    let branch_name = required_text(&request.branch, "Branch")?;
    let branch_sha = parse_object_id(&request.branch_sha, "BranchSha")?;
    let remote_branch = required_text(&request.remote_branch, "RemoteBranch")?;
    let remote = resolve_remote(dependencies, request.remote_repository.as_ref())?
        .ok_or_else(|| GitalyError::invalid_argument("empty RemoteRepository"))?;

    let reference = branch_reference(&repository, &branch_name).await?;
    let branch = BranchState::load(&repository, reference).await?;
    if branch.tip.as_ref() != Some(&branch_sha) {
        return into_envelope(Outcome::Rejected(BusinessOutcome::Git(format!(
            "Invalid branch: {branch_name} is not at {branch_sha}"
        ))));
    }

    let remote_tip = match remote.fetch_branch(&repository.git, &remote_branch).await {
        Ok(Some(tip)) => tip,
        Ok(None) => {
            return into_envelope(Outcome::Rejected(BusinessOutcome::Git(format!(
                "Invalid remote branch: {remote_branch}"
            ))))
        }
        Err(err) => return into_envelope(Outcome::Rejected(BusinessOutcome::Git(err.to_string()))),
    };

    let rebased = match replay(&repository, &user, &remote_tip, &branch_sha).await? {
        Ok(rebased) => rebased,
        Err(message) => return into_envelope(Outcome::Rejected(BusinessOutcome::Git(message))),
    };

    let update = branch.update_to(rebased.clone());
    let outcome = match run_hooked_update(
        dependencies,
        &repository,
        &user,
        update,
        CancelSignal::never(),
    )
    .await
    {
        Ok(TransactionOutcome::Committed) => Outcome::Applied(rebased.to_string()),
        Ok(TransactionOutcome::Rejected { message, .. }) => {
            Outcome::Rejected(BusinessOutcome::HookRejected(message))
        }
        Err(err) if is_conflict(&err) => Outcome::Rejected(BusinessOutcome::Git(err.to_string())),
        Err(err) => return Err(transaction_status(err)),
    };
    into_envelope(outcome)
}

/// Replays the non-merge commits of `onto..head` on top of `onto`.
/// Commits that become empty are dropped. The inner error is a git-level
/// failure for `git_error`.
async fn replay(
    repository: &ResolvedRepository,
    user: &Actor,
    onto: &ObjectId,
    head: &ObjectId,
) -> Result<Result<ObjectId, String>, Status> {
    let commits = repository
        .git
        .rev_list(onto, head)
        .await
        .map_err(internal_error)?;

    let mut current = onto.clone();
    let mut current_tree = load_commit(repository, onto).await?.tree;
    for oid in commits {
        let commit = load_commit(repository, &oid).await?;
        let base = commit
            .parents
            .first()
            .cloned()
            .unwrap_or_else(|| repository.git.object_hash().empty_tree());

        let tree = match repository
            .git
            .merge_tree(&current, &commit.id, Some(&base))
            .await
            .map_err(internal_error)?
        {
            MergeTreeResult::Clean(tree) => tree,
            MergeTreeResult::Conflict { paths } => {
                return Ok(Err(format!(
                    "rebase conflict while applying {}: {}",
                    commit.id,
                    paths.join(", ")
                )))
            }
        };
        if tree == current_tree {
            debug!(commit = %commit.id, "dropping commit that became empty");
            continue;
        }

        current = repository
            .git
            .write_commit(&NewCommit {
                tree: tree.clone(),
                parents: vec![current],
                author: commit.author.clone(),
                committer: user.signature(),
                message: commit.message.clone(),
            })
            .await
            .map_err(internal_error)?;
        current_tree = tree;
    }

    Ok(Ok(current))
}
