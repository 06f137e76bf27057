//! `UserMergeBranch` and `UserFFBranch`.
//!
//! A merge is a two round session on one bidirectional stream. The first
//! client message names the merge, the server answers with the id of the
//! merge commit it wrote and then waits. Only a second message with
//! `apply` set links that commit into the branch. An abort, or the client
//! going away before applying, leaves the branch untouched.

use std::fmt;
use std::sync::Arc;

use gitaly_error::GitalyError;
use gitaly_git::object_id::ObjectId;
use gitaly_git::repository::{MergeTreeResult, NewCommit};
use gitaly_git::transaction::CancelSignal;
use gitaly_proto::gitaly::{
    UserFfBranchRequest, UserFfBranchResponse, UserMergeBranchRequest, UserMergeBranchResponse,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::Status;
use tracing::{debug, info, Instrument, Span};

use crate::dependencies::Dependencies;
use crate::service::actors::{
    branch_reference, parse_object_id, required_text, resolve_commit, resolve_repository,
    Actor, ResolvedRepository,
};
use crate::service::internal_error;

use super::mutation::{update_reference, BranchState};
use super::outcome::into_envelope;

type Outbound = mpsc::Sender<Result<UserMergeBranchResponse, Status>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MergePhase {
    AwaitingCommit,
    AwaitingApply,
    Finalizing,
    Done,
}

impl fmt::Display for MergePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AwaitingCommit => "awaiting commit",
            Self::AwaitingApply => "awaiting apply",
            Self::Finalizing => "finalizing",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// How a session ends when it does not complete.
#[derive(Debug)]
enum SessionEnd {
    Failed(Status),
    /// The client went away; nothing is sent and nothing is applied.
    Abandoned,
}

impl From<Status> for SessionEnd {
    fn from(status: Status) -> Self {
        Self::Failed(status)
    }
}

impl From<GitalyError> for SessionEnd {
    fn from(error: GitalyError) -> Self {
        Self::Failed(error.into())
    }
}

/// The merge commit written in the first round, not yet on any branch.
struct PreparedMerge {
    repository: ResolvedRepository,
    user: Actor,
    branch: BranchState,
    merge_commit: ObjectId,
}

/// Starts a merge session over `inbound` and returns the response stream.
pub(crate) fn user_merge_branch<S>(
    dependencies: Arc<Dependencies>,
    inbound: S,
    span: Span,
) -> ReceiverStream<Result<UserMergeBranchResponse, Status>>
where
    S: Stream<Item = Result<UserMergeBranchRequest, Status>> + Send + Unpin + 'static,
{
    let (outbound, receiver) = mpsc::channel(2);
    let session = MergeSession {
        dependencies,
        outbound,
        phase: MergePhase::AwaitingCommit,
    };
    tokio::spawn(session.drive(inbound).instrument(span));
    ReceiverStream::new(receiver)
}

struct MergeSession {
    dependencies: Arc<Dependencies>,
    outbound: Outbound,
    phase: MergePhase,
}

impl MergeSession {
    async fn drive<S>(mut self, mut inbound: S)
    where
        S: Stream<Item = Result<UserMergeBranchRequest, Status>> + Unpin,
    {
        match self.run(&mut inbound).await {
            Ok(()) => {}
            Err(SessionEnd::Failed(status)) => {
                debug!(phase = %self.phase, error = %status.message(), "merge session failed");
                let _ = self.outbound.send(Err(status)).await;
            }
            Err(SessionEnd::Abandoned) => {
                info!(phase = %self.phase, "merge session abandoned, branch left untouched");
            }
        }
        self.phase = MergePhase::Done;
    }

    async fn run<S>(&mut self, inbound: &mut S) -> Result<(), SessionEnd>
    where
        S: Stream<Item = Result<UserMergeBranchRequest, Status>> + Unpin,
    {
        let first = match inbound.next().await {
            Some(Ok(message)) => message,
            Some(Err(_)) | None => {
                return Err(GitalyError::invalid_argument("empty request stream").into())
            }
        };
        let prepared = self.prepare(first).await?;
        self.send(UserMergeBranchResponse {
            commit_id: prepared.merge_commit.to_string(),
            ..UserMergeBranchResponse::default()
        })
        .await?;
        self.phase = MergePhase::AwaitingApply;

        let second = match inbound.next().await {
            Some(Ok(message)) => message,
            Some(Err(_)) | None => return Err(SessionEnd::Abandoned),
        };
        if !second.apply {
            return Err(GitalyError::failed_precondition("merge aborted by client")
                .with_reference(prepared.branch.reference.as_str())
                .into());
        }

        self.phase = MergePhase::Finalizing;
        let outbound = self.outbound.clone();
        let cancel = CancelSignal::new(move || outbound.is_closed());
        let outcome = update_reference(
            &self.dependencies,
            &prepared.repository,
            &prepared.user,
            prepared.branch.update_to(prepared.merge_commit.clone()),
            cancel,
        )
        .await?;

        let response = into_envelope(
            outcome.map(|()| prepared.branch.branch_update(&prepared.merge_commit)),
        )?;
        self.send(response).await
    }

    async fn prepare(&self, request: UserMergeBranchRequest) -> Result<PreparedMerge, Status> {
        let repository =
            resolve_repository(&self.dependencies, request.repository.as_ref()).await?;
        let user = Actor::from_request(request.user.as_ref())?;
        let branch_name = required_text(&request.branch, "Branch")?;
        let commit_id = parse_object_id(&request.commit_id, "CommitId")?;
        let message = required_text(&request.message, "Message")?;

        let reference = branch_reference(&repository, &branch_name).await?;
        let branch = BranchState::load(&repository, reference).await?;
        let ours = branch.require_tip()?.clone();
        let theirs = resolve_commit(&repository, commit_id.as_str()).await?;

        let tree = match repository
            .git
            .merge_tree(&ours, &theirs, None)
            .await
            .map_err(internal_error)?
        {
            MergeTreeResult::Clean(tree) => tree,
            MergeTreeResult::Conflict { paths } => {
                return Err(GitalyError::failed_precondition(format!(
                    "merge conflict in: {}",
                    paths.join(", ")
                ))
                .with_reference(branch.reference.as_str())
                .into())
            }
        };

        let signature = user.signature();
        let merge_commit = repository
            .git
            .write_commit(&NewCommit {
                tree,
                parents: vec![ours, theirs],
                author: signature.clone(),
                committer: signature,
                message: message.into_bytes(),
            })
            .await
            .map_err(internal_error)?;

        debug!(
            reference = %branch.reference,
            merge_commit = %merge_commit,
            "merge commit prepared"
        );
        Ok(PreparedMerge {
            repository,
            user,
            branch,
            merge_commit,
        })
    }

    async fn send(&self, response: UserMergeBranchResponse) -> Result<(), SessionEnd> {
        self.outbound
            .send(Ok(response))
            .await
            .map_err(|_| SessionEnd::Abandoned)
    }
}

pub(crate) async fn user_ff_branch(
    dependencies: &Dependencies,
    request: UserFfBranchRequest,
) -> Result<UserFfBranchResponse, Status> {
    let repository = resolve_repository(dependencies, request.repository.as_ref()).await?;
    let user = Actor::from_request(request.user.as_ref())?;
    let commit_id = parse_object_id(&request.commit_id, "CommitId")?;
    let branch_name = required_text(&request.branch, "Branch")?;

    let reference = branch_reference(&repository, &branch_name).await?;
    let branch = BranchState::load(&repository, reference).await?;
    let tip = branch.require_tip()?.clone();
    let target = resolve_commit(&repository, commit_id.as_str()).await?;

    let fast_forward = repository
        .git
        .is_ancestor(&tip, &target)
        .await
        .map_err(internal_error)?;
    if !fast_forward {
        return Err(GitalyError::failed_precondition("not fast forward")
            .with_reference(branch.reference.as_str())
            .into());
    }

    let outcome = update_reference(
        dependencies,
        &repository,
        &user,
        branch.update_to(target.clone()),
        CancelSignal::never(),
    )
    .await?;
    into_envelope(outcome.map(|()| branch.branch_update(&target)))
}
