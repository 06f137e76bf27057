use gitaly_error::GitalyError;
use gitaly_git::reference::RefUpdate;
use gitaly_git::repository::NewTag;
use gitaly_git::transaction::CancelSignal;
use gitaly_proto::gitaly::{
    Tag, UserCreateTagRequest, UserCreateTagResponse, UserDeleteTagRequest,
    UserDeleteTagResponse,
};
use tonic::Status;

use crate::dependencies::Dependencies;
use crate::service::actors::{
    git_commit, required_text, resolve_repository, tag_reference, Actor,
};
use crate::service::internal_error;

use super::mutation::update_reference;
use super::outcome::{into_envelope, BusinessOutcome, Outcome};

/// Creates a lightweight tag, or an annotated one when a message is given.
pub(crate) async fn user_create_tag(
    dependencies: &Dependencies,
    request: UserCreateTagRequest,
) -> Result<UserCreateTagResponse, Status> {
    let repository = resolve_repository(dependencies, request.repository.as_ref()).await?;
    let user = Actor::from_request(request.user.as_ref())?;
    let tag_name = required_text(&request.tag_name, "TagName")?;
    let target_revision = required_text(&request.target_revision, "TargetRevision")?;
    let reference = tag_reference(&repository, &tag_name).await?;

    let target = repository
        .git
        .object_info(&target_revision)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| {
            GitalyError::failed_precondition(format!("revspec '{target_revision}' not found"))
        })?;

    let existing = repository
        .git
        .reference_target(&reference)
        .await
        .map_err(internal_error)?;
    if existing.is_some() {
        return into_envelope(Outcome::Rejected(BusinessOutcome::AlreadyExists));
    }

    let tag_id = if request.message.is_empty() {
        target.oid.clone()
    } else {
        repository
            .git
            .write_tag(&NewTag {
                target: target.oid.clone(),
                target_kind: target.kind,
                name: tag_name.clone(),
                tagger: user.signature(),
                message: request.message.clone(),
            })
            .await
            .map_err(internal_error)?
    };

    let outcome = update_reference(
        dependencies,
        &repository,
        &user,
        RefUpdate::create(reference, tag_id.clone()),
        CancelSignal::never(),
    )
    .await?;
    if let Outcome::Rejected(rejection) = outcome {
        return into_envelope(Outcome::Rejected(rejection));
    }

    let peeled = repository
        .git
        .resolve_commit(tag_id.as_str())
        .await
        .map_err(internal_error)?;
    let target_commit = match peeled {
        Some(oid) => repository
            .git
            .read_commit(&oid)
            .await
            .map_err(internal_error)?
            .map(|commit| git_commit(&commit)),
        None => None,
    };

    into_envelope(Outcome::Applied(Tag {
        name: tag_name.into_bytes(),
        id: tag_id.to_string(),
        target_commit,
        message_size: request.message.len() as i64,
        message: request.message,
    }))
}

pub(crate) async fn user_delete_tag(
    dependencies: &Dependencies,
    request: UserDeleteTagRequest,
) -> Result<UserDeleteTagResponse, Status> {
    let repository = resolve_repository(dependencies, request.repository.as_ref()).await?;
    let user = Actor::from_request(request.user.as_ref())?;
    let tag_name = required_text(&request.tag_name, "TagName")?;
    let reference = tag_reference(&repository, &tag_name).await?;

    let current = repository
        .git
        .reference_target(&reference)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| {
            GitalyError::failed_precondition(format!("tag not found: {tag_name}"))
                .with_reference(reference.as_str())
        })?;

    let outcome = update_reference(
        dependencies,
        &repository,
        &user,
        RefUpdate::delete(reference, current),
        CancelSignal::never(),
    )
    .await?;
    into_envelope(outcome)
}
