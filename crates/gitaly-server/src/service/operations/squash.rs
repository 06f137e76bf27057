use gitaly_error::GitalyError;
use gitaly_git::commit::Signature;
use gitaly_git::repository::{MergeTreeResult, NewCommit};
use gitaly_proto::gitaly::{UserSquashRequest, UserSquashResponse};
use tonic::Status;
use tracing::info;

use crate::dependencies::Dependencies;
use crate::service::actors::{now, resolve_repository, Actor};
use crate::service::internal_error;

use super::outcome::{into_envelope, BusinessOutcome, Outcome};

const RPC: &str = "UserSquash";

fn validate(request: &UserSquashRequest) -> Result<(), GitalyError> {
    let missing = if request.repository.is_none() {
        Some("Repository")
    } else if request.user.is_none() {
        Some("User")
    } else if request.squash_id.is_empty() {
        Some("SquashId")
    } else if request.branch.is_empty() {
        Some("Branch")
    } else if request.start_sha.is_empty() {
        Some("StartSha")
    } else if request.end_sha.is_empty() {
        Some("EndSha")
    } else if request.commit_message.is_empty() {
        Some("CommitMessage")
    } else if request.author.is_none() {
        Some("Author")
    } else {
        None
    };

    match missing {
        Some(field) => Err(GitalyError::invalid_argument(format!("empty {field}")).with_rpc(RPC)),
        None => Ok(()),
    }
}

/// Folds the changes between `start_sha` and `end_sha` into one commit on
/// top of `start_sha`. No reference is touched; the caller decides where
/// the commit goes.
pub(crate) async fn user_squash(
    dependencies: &Dependencies,
    request: UserSquashRequest,
) -> Result<UserSquashResponse, Status> {
    validate(&request)?;
    let repository = resolve_repository(dependencies, request.repository.as_ref()).await?;
    let committer = Actor::from_request(request.user.as_ref())
        .map_err(|status| GitalyError::invalid_argument(status.message()).with_rpc(RPC))?;
    // The author is only a commit identity and needs no GlId.
    let author = request
        .author
        .as_ref()
        .map(|author| {
            Signature::new(
                String::from_utf8_lossy(&author.name),
                String::from_utf8_lossy(&author.email),
                now(),
            )
        })
        .ok_or_else(|| GitalyError::invalid_argument("empty Author").with_rpc(RPC))?;

    let git_error =
        |message: String| into_envelope(Outcome::Rejected(BusinessOutcome::Git(message)));

    let resolve = |revision: String| {
        let repository = &repository;
        async move { repository.git.resolve_commit(&revision).await.map_err(internal_error) }
    };
    let Some(start) = resolve(request.start_sha.clone()).await? else {
        return git_error(format!("invalid start sha: {}", request.start_sha));
    };
    let Some(end) = resolve(request.end_sha.clone()).await? else {
        return git_error(format!("invalid end sha: {}", request.end_sha));
    };

    let Some(base) = repository
        .git
        .merge_base(&start, &end)
        .await
        .map_err(internal_error)?
    else {
        return git_error(format!("{start} and {end} have no common ancestor"));
    };

    let tree = match repository
        .git
        .merge_tree(&start, &end, Some(&base))
        .await
        .map_err(internal_error)?
    {
        MergeTreeResult::Clean(tree) => tree,
        MergeTreeResult::Conflict { paths } => {
            return git_error(format!("squash conflicts in: {}", paths.join(", ")));
        }
    };

    let squash = repository
        .git
        .write_commit(&NewCommit {
            tree,
            parents: vec![start],
            author,
            committer: committer.signature(),
            message: request.commit_message,
        })
        .await
        .map_err(internal_error)?;

    info!(squash_id = %request.squash_id, squash = %squash, "squashed commit range");
    into_envelope(Outcome::Applied(squash.to_string()))
}
