//! `UserCommitFiles`: one commit built from a streamed list of file actions.
//!
//! The stream opens with a request header. After it, every action header
//! starts a new action and closes the previous one; content chunks append to
//! whichever action was opened last. Nothing touches the repository until
//! the stream has ended.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use gitaly_error::GitalyError;
use gitaly_git::commit::Signature;
use gitaly_git::object_id::ObjectId;
use gitaly_git::remote::RemoteRepository;
use gitaly_git::repository::NewCommit;
use gitaly_git::transaction::CancelSignal;
use gitaly_git::tree::{IndexError, TreeIndex};
use gitaly_proto::gitaly::user_commit_files_action::UserCommitFilesActionPayload;
use gitaly_proto::gitaly::user_commit_files_action_header::ActionType;
use gitaly_proto::gitaly::user_commit_files_request::UserCommitFilesRequestPayload;
use gitaly_proto::gitaly::{
    UserCommitFilesActionHeader, UserCommitFilesRequest, UserCommitFilesRequestHeader,
    UserCommitFilesResponse,
};
use tokio_stream::{Stream, StreamExt};
use tonic::Status;
use tracing::{debug, info};

use crate::dependencies::Dependencies;
use crate::service::actors::{
    branch_reference, now, optional_text, required_text, resolve_commit, resolve_remote,
    resolve_repository, Actor, ResolvedRepository,
};
use crate::service::internal_error;

use super::mutation::{update_reference, BranchState};
use super::outcome::{into_envelope, BusinessOutcome, Outcome};

/// One file action with its fully assembled content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PlannedAction {
    pub(crate) kind: ActionType,
    pub(crate) path: String,
    pub(crate) previous_path: Option<String>,
    pub(crate) base64: bool,
    pub(crate) executable: bool,
    pub(crate) infer_content: bool,
    pub(crate) content: Vec<u8>,
}

impl PlannedAction {
    fn from_header(header: UserCommitFilesActionHeader) -> Result<Self, Status> {
        let kind = ActionType::try_from(header.action).map_err(|_| {
            GitalyError::invalid_argument(format!("unknown action type {}", header.action))
        })?;
        let path = String::from_utf8(header.file_path)
            .map_err(|_| GitalyError::invalid_argument("FilePath is not valid UTF-8"))?;

        Ok(Self {
            kind,
            path,
            previous_path: optional_text(&header.previous_path, "PreviousPath")?,
            base64: header.base64_content,
            executable: header.execute_filemode,
            infer_content: header.infer_content,
            content: Vec::new(),
        })
    }

    fn decoded_content(&self) -> Result<Vec<u8>, IndexError> {
        if !self.base64 {
            return Ok(self.content.clone());
        }
        BASE64
            .decode(&self.content)
            .map_err(|_| IndexError::InvalidBase64(self.path.clone()))
    }
}

/// Reassembles the action list from the flat message sequence.
#[derive(Debug, Default)]
pub(crate) struct ActionPlanBuilder {
    actions: Vec<PlannedAction>,
    current: Option<PlannedAction>,
}

impl ActionPlanBuilder {
    pub(crate) fn push_header(
        &mut self,
        header: UserCommitFilesActionHeader,
    ) -> Result<(), Status> {
        let next = PlannedAction::from_header(header)?;
        if let Some(done) = self.current.replace(next) {
            self.actions.push(done);
        }
        Ok(())
    }

    pub(crate) fn push_content(&mut self, chunk: &[u8]) -> Result<(), Status> {
        let current = self.current.as_mut().ok_or_else(|| {
            GitalyError::invalid_argument("content sent before any action header")
        })?;
        current.content.extend_from_slice(chunk);
        Ok(())
    }

    pub(crate) fn finish(mut self) -> Vec<PlannedAction> {
        self.actions.extend(self.current.take());
        self.actions
    }
}

pub(crate) async fn user_commit_files<S>(
    dependencies: &Dependencies,
    mut inbound: S,
) -> Result<UserCommitFilesResponse, Status>
where
    S: Stream<Item = Result<UserCommitFilesRequest, Status>> + Unpin,
{
    let header = match inbound.next().await.transpose()? {
        Some(UserCommitFilesRequest {
            user_commit_files_request_payload: Some(UserCommitFilesRequestPayload::Header(header)),
        }) => header,
        Some(_) => {
            return Err(GitalyError::invalid_argument("first message must carry the header").into())
        }
        None => return Err(GitalyError::invalid_argument("empty request stream").into()),
    };

    let mut plan = ActionPlanBuilder::default();
    while let Some(message) = inbound.next().await {
        match message?.user_commit_files_request_payload {
            Some(UserCommitFilesRequestPayload::Action(action)) => {
                match action.user_commit_files_action_payload {
                    Some(UserCommitFilesActionPayload::Header(action_header)) => {
                        plan.push_header(action_header)?
                    }
                    Some(UserCommitFilesActionPayload::Content(chunk)) => {
                        plan.push_content(&chunk)?
                    }
                    None => return Err(GitalyError::invalid_argument("empty action").into()),
                }
            }
            Some(UserCommitFilesRequestPayload::Header(_)) => {
                return Err(GitalyError::invalid_argument("header sent twice").into())
            }
            None => return Err(GitalyError::invalid_argument("empty message").into()),
        }
    }

    commit_actions(dependencies, header, plan.finish()).await
}

async fn commit_actions(
    dependencies: &Dependencies,
    header: UserCommitFilesRequestHeader,
    actions: Vec<PlannedAction>,
) -> Result<UserCommitFilesResponse, Status> {
    let repository = resolve_repository(dependencies, header.repository.as_ref()).await?;
    let user = Actor::from_request(header.user.as_ref())?;
    let branch_name = required_text(&header.branch_name, "BranchName")?;
    let message = required_text(&header.commit_message, "CommitMessage")?;

    let reference = branch_reference(&repository, &branch_name).await?;
    let branch = BranchState::load(&repository, reference).await?;
    let parent = start_point(dependencies, &repository, &header, &branch, &branch_name).await?;
    if !header.force {
        ensure_descends_from_tip(&repository, &branch, parent.as_ref()).await?;
    }

    let mut index = match &parent {
        Some(parent) => repository.git.read_tree(parent).await.map_err(internal_error)?,
        None => TreeIndex::new(),
    };
    debug!(actions = actions.len(), parent = ?parent, "applying file actions");
    for action in &actions {
        if let Err(err) = apply_action(&repository, &mut index, action).await? {
            return into_envelope(Outcome::Rejected(BusinessOutcome::Index(err.to_string())));
        }
    }

    let tree = repository.git.write_tree(&index).await.map_err(internal_error)?;
    let committer = user.signature();
    let author = Signature::new(
        optional_text(&header.commit_author_name, "CommitAuthorName")?
            .unwrap_or_else(|| user.name.clone()),
        optional_text(&header.commit_author_email, "CommitAuthorEmail")?
            .unwrap_or_else(|| user.email.clone()),
        now(),
    );
    let commit = repository
        .git
        .write_commit(&NewCommit {
            tree,
            parents: parent.into_iter().collect(),
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
        branch.update_to(commit.clone()),
        CancelSignal::never(),
    )
    .await?;
    if matches!(outcome, Outcome::Applied(())) {
        info!(reference = %branch.reference, commit = %commit, "committed file actions");
    }
    into_envelope(outcome.map(|()| branch.branch_update(&commit)))
}

/// The commit the new one is built on. `None` makes a root commit.
async fn start_point(
    dependencies: &Dependencies,
    repository: &ResolvedRepository,
    header: &UserCommitFilesRequestHeader,
    branch: &BranchState,
    branch_name: &str,
) -> Result<Option<ObjectId>, Status> {
    if !header.start_sha.is_empty() {
        return resolve_commit(repository, &header.start_sha).await.map(Some);
    }

    if branch.tip.is_none() || header.force {
        let start_branch = optional_text(&header.start_branch_name, "StartBranchName")?;
        if let Some(remote) = resolve_remote(dependencies, header.start_repository.as_ref())? {
            let name = start_branch.as_deref().unwrap_or(branch_name);
            let tip = remote
                .fetch_branch(&repository.git, name)
                .await
                .map_err(internal_error)?;
            return match tip {
                Some(tip) => Ok(Some(tip)),
                None if start_branch.is_none() && branch.tip.is_none() => Ok(None),
                None => Err(GitalyError::failed_precondition(format!(
                    "start branch not found: {name}"
                ))
                .into()),
            };
        }
        if let Some(name) = start_branch {
            let reference = branch_reference(repository, &name).await?;
            let tip = repository
                .git
                .reference_target(&reference)
                .await
                .map_err(internal_error)?;
            return tip.map(Some).ok_or_else(|| {
                GitalyError::failed_precondition(format!("start branch not found: {name}"))
                    .with_reference(reference.as_str())
                    .into()
            });
        }
    }

    Ok(branch.tip.clone())
}

/// Without `force` the new commit may only move the branch forward.
async fn ensure_descends_from_tip(
    repository: &ResolvedRepository,
    branch: &BranchState,
    parent: Option<&ObjectId>,
) -> Result<(), Status> {
    let Some(tip) = &branch.tip else {
        return Ok(());
    };
    let descends = match parent {
        Some(parent) if parent == tip => true,
        Some(parent) => repository
            .git
            .is_ancestor(tip, parent)
            .await
            .map_err(internal_error)?,
        None => false,
    };
    if descends {
        return Ok(());
    }

    debug!(reference = %branch.reference, tip = %tip, parent = ?parent, "start point diverged");
    Err(GitalyError::failed_precondition("Branch diverged")
        .with_reference(branch.reference.as_str())
        .into())
}

/// Applies one action to `index`. The inner error is user-facing and goes
/// into `index_error`.
async fn apply_action(
    repository: &ResolvedRepository,
    index: &mut TreeIndex,
    action: &PlannedAction,
) -> Result<Result<(), IndexError>, Status> {
    let write_content = |content: Vec<u8>| async move {
        repository
            .git
            .write_blob(&content)
            .await
            .map_err(internal_error)
    };
    let content = match action.kind {
        ActionType::Create | ActionType::Update => Some(action.decoded_content()),
        ActionType::Move if !action.infer_content => Some(action.decoded_content()),
        _ => None,
    };
    let blob = match content {
        Some(Ok(content)) => Some(write_content(content).await?),
        Some(Err(err)) => return Ok(Err(err)),
        None => None,
    };

    let path = action.path.as_str();
    let applied = match (action.kind, blob) {
        (ActionType::Create, Some(blob)) => index.create_file(path, blob, action.executable),
        (ActionType::Update, Some(blob)) => index.update_file(path, blob),
        (ActionType::Move, blob) => {
            let from = action.previous_path.as_deref().unwrap_or_default();
            index.move_file(from, path, blob)
        }
        (ActionType::CreateDir, _) => {
            let empty = write_content(Vec::new()).await?;
            index.create_dir(path, empty)
        }
        (ActionType::Delete, _) => index.delete_file(path),
        (ActionType::Chmod, _) => index.chmod(path, action.executable),
        (ActionType::Create | ActionType::Update, None) => {
            return Err(GitalyError::internal("content-bearing action without a blob").into())
        }
    };
    Ok(applied)
}
