//! `UserCherryPick` and `UserRevert`: replay one commit's change, or its
//! inverse, on top of a branch.

use std::fmt;

use gitaly_error::GitalyError;
use gitaly_git::object_id::ObjectId;
use gitaly_git::reference::ReferenceName;
use gitaly_git::remote::RemoteRepository;
use gitaly_git::repository::{MergeTreeResult, NewCommit};
use gitaly_git::transaction::CancelSignal;
use gitaly_proto::gitaly::{
    GitCommit, OperationBranchUpdate, Repository, User, UserCherryPickRequest,
    UserCherryPickResponse, UserRevertRequest, UserRevertResponse,
};
use tonic::Status;
use tracing::debug;

use crate::dependencies::Dependencies;
use crate::service::actors::{
    branch_reference, load_commit, optional_text, parse_object_id, required_text,
    resolve_remote, resolve_repository, Actor, ResolvedRepository,
};
use crate::service::internal_error;

use super::mutation::{update_reference, BranchState};
use super::outcome::{into_envelope, BusinessOutcome, CreateTreeFailure, Outcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PickKind {
    CherryPick,
    Revert,
}

impl fmt::Display for PickKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CherryPick => f.write_str("cherry-pick"),
            Self::Revert => f.write_str("revert"),
        }
    }
}

struct PickRequest {
    repository: Option<Repository>,
    user: Option<User>,
    commit: Option<GitCommit>,
    branch_name: Vec<u8>,
    message: Vec<u8>,
    start_branch_name: Vec<u8>,
    start_repository: Option<Repository>,
}

impl From<UserCherryPickRequest> for PickRequest {
    fn from(request: UserCherryPickRequest) -> Self {
        Self {
            repository: request.repository,
            user: request.user,
            commit: request.commit,
            branch_name: request.branch_name,
            message: request.message,
            start_branch_name: request.start_branch_name,
            start_repository: request.start_repository,
        }
    }
}

impl From<UserRevertRequest> for PickRequest {
    fn from(request: UserRevertRequest) -> Self {
        Self {
            repository: request.repository,
            user: request.user,
            commit: request.commit,
            branch_name: request.branch_name,
            message: request.message,
            start_branch_name: request.start_branch_name,
            start_repository: request.start_repository,
        }
    }
}

pub(crate) async fn user_cherry_pick(
    dependencies: &Dependencies,
    request: UserCherryPickRequest,
) -> Result<UserCherryPickResponse, Status> {
    into_envelope(pick(dependencies, PickKind::CherryPick, request.into()).await?)
}

pub(crate) async fn user_revert(
    dependencies: &Dependencies,
    request: UserRevertRequest,
) -> Result<UserRevertResponse, Status> {
    into_envelope(pick(dependencies, PickKind::Revert, request.into()).await?)
}

async fn pick(
    dependencies: &Dependencies,
    kind: PickKind,
    request: PickRequest,
) -> Result<Outcome<OperationBranchUpdate>, Status> {
    let repository = resolve_repository(dependencies, request.repository.as_ref()).await?;
    let user = Actor::from_request(request.user.as_ref())?;
    let commit = request
        .commit
        .as_ref()
        .ok_or_else(|| GitalyError::invalid_argument("empty Commit"))?;
    let commit_id = parse_object_id(&commit.id, "Commit.Id")?;
    let branch_name = required_text(&request.branch_name, "BranchName")?;
    let message = required_text(&request.message, "Message")?;
    let reference = branch_reference(&repository, &branch_name).await?;

    let picked = repository
        .git
        .read_commit(&commit_id)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| GitalyError::not_found(format!("{kind}: commit not found: {commit_id}")))?;

    let branch = BranchState::load(&repository, reference).await?;
    let start = match &branch.tip {
        Some(tip) => tip.clone(),
        None => {
            let start_branch = optional_text(&request.start_branch_name, "StartBranchName")?;
            match start_point(dependencies, &repository, &request, start_branch).await? {
                Some(start) => start,
                None => {
                    return Ok(Outcome::Rejected(BusinessOutcome::Commit(format!(
                        "{kind}: branch not found: {branch_name}"
                    ))))
                }
            }
        }
    };
    let start_commit = load_commit(&repository, &start).await?;

    // Merge commits are replayed relative to their first parent.
    let parent = picked
        .parents
        .first()
        .cloned()
        .unwrap_or_else(|| repository.git.object_hash().empty_tree());
    let (theirs, base) = match kind {
        PickKind::CherryPick => (picked.id.clone(), parent),
        PickKind::Revert => (parent, picked.id.clone()),
    };

    let tree = match repository
        .git
        .merge_tree(&start, &theirs, Some(&base))
        .await
        .map_err(internal_error)?
    {
        MergeTreeResult::Clean(tree) if tree == start_commit.tree => {
            return Ok(Outcome::Rejected(BusinessOutcome::CreateTree {
                failure: CreateTreeFailure::Empty,
                message: format!("{kind}: could not apply because the result was empty"),
            }))
        }
        MergeTreeResult::Clean(tree) => tree,
        MergeTreeResult::Conflict { paths } => {
            debug!(%kind, commit = %picked.id, ?paths, "pick conflicts");
            return Ok(Outcome::Rejected(BusinessOutcome::CreateTree {
                failure: CreateTreeFailure::Conflict,
                message: format!("{kind}: there are merge conflicts"),
            }));
        }
    };

    let committer = user.signature();
    let author = match kind {
        PickKind::CherryPick => picked.author.clone(),
        PickKind::Revert => committer.clone(),
    };
    let new_commit = repository
        .git
        .write_commit(&NewCommit {
            tree,
            parents: vec![start],
            author,
            committer,
            message: message.into_bytes(),
        })
        .await
        .map_err(internal_error)?;

    let outcome = update_reference(
        dependencies,
        &repository,
        &user,
        branch.update_to(new_commit.clone()),
        CancelSignal::never(),
    )
    .await?;
    Ok(outcome.map(|()| branch.branch_update(&new_commit)))
}

/// Where a pick onto a missing branch starts: `start_branch_name`, taken
/// from `start_repository` when one is given.
async fn start_point(
    dependencies: &Dependencies,
    repository: &ResolvedRepository,
    request: &PickRequest,
    start_branch: Option<String>,
) -> Result<Option<ObjectId>, Status> {
    let remote = resolve_remote(dependencies, request.start_repository.as_ref())?;
    match (remote, start_branch) {
        (Some(remote), start_branch) => {
            let name = match start_branch {
                Some(name) => name,
                None => required_text(&request.branch_name, "BranchName")?,
            };
            remote
                .fetch_branch(&repository.git, &name)
                .await
                .map_err(internal_error)
        }
        (None, Some(name)) => {
            let reference = ReferenceName::branch(&name).map_err(|err| {
                GitalyError::invalid_argument(format!("invalid start branch `{name}`: {err}"))
            })?;
            repository
                .git
                .reference_target(&reference)
                .await
                .map_err(internal_error)
        }
        (None, None) => Ok(None),
    }
}
