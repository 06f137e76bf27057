//! `RefService`: plain branch creation and deletion, no hooks involved.

use std::sync::Arc;

use gitaly_error::GitalyError;
use gitaly_git::reference::{RefUpdate, ReferenceName, ReferenceUpdateError};
use tonic::{Code, Request, Response, Status};
use tracing::{debug, info, Instrument};

use gitaly_proto::gitaly::create_branch_response::Status as CreateBranchStatus;
use gitaly_proto::gitaly::ref_service_server::RefService;
use gitaly_proto::gitaly::{
    Branch, CreateBranchRequest, CreateBranchResponse, DeleteBranchRequest, DeleteBranchResponse,
};

use crate::dependencies::Dependencies;
use crate::middleware::request_span;
use crate::service::actors::{
    branch_reference, git_commit, load_commit, required_text, resolve_repository,
};
use crate::service::internal_error;

#[derive(Debug, Clone)]
pub struct RefServiceImpl {
    dependencies: Arc<Dependencies>,
}

impl RefServiceImpl {
    #[must_use]
    pub fn new(dependencies: Arc<Dependencies>) -> Self {
        Self { dependencies }
    }

    async fn create_unhooked(
        &self,
        request: CreateBranchRequest,
    ) -> Result<CreateBranchResponse, Status> {
        let repository = resolve_repository(&self.dependencies, request.repository.as_ref()).await?;
        let refused = |status: CreateBranchStatus| CreateBranchResponse {
            status: status as i32,
            branch: None,
        };

        let Ok(name) = required_text(&request.name, "Name") else {
            return Ok(refused(CreateBranchStatus::ErrInvalid));
        };
        let Some(reference) = invalid_as_none(branch_reference(&repository, &name).await)? else {
            debug!(branch = %name, "refusing invalid branch name");
            return Ok(refused(CreateBranchStatus::ErrInvalid));
        };

        let start_point = match String::from_utf8(request.start_point) {
            Ok(start_point) if start_point.is_empty() => "HEAD".to_string(),
            Ok(start_point) => start_point,
            Err(_) => return Ok(refused(CreateBranchStatus::ErrInvalidStartPoint)),
        };
        let Some(target) = repository
            .git
            .resolve_commit(&start_point)
            .await
            .map_err(internal_error)?
        else {
            return Ok(refused(CreateBranchStatus::ErrInvalidStartPoint));
        };

        let existing = repository
            .git
            .reference_target(&reference)
            .await
            .map_err(internal_error)?;
        if existing.is_some() {
            return Ok(refused(CreateBranchStatus::ErrExists));
        }

        let update = RefUpdate::create(reference.clone(), target.clone());
        match repository.git.reference_updater().apply(&[update]).await {
            Ok(()) => {}
            Err(ReferenceUpdateError::Conflict { .. }) => {
                return Ok(refused(CreateBranchStatus::ErrExists))
            }
            Err(err) => return Err(internal_error(err)),
        }
        info!(reference = %reference, new_oid = %target, "created branch");

        let commit = load_commit(&repository, &target).await?;
        Ok(CreateBranchResponse {
            status: CreateBranchStatus::Ok as i32,
            branch: Some(Branch {
                name: name.into_bytes(),
                target_commit: Some(git_commit(&commit)),
            }),
        })
    }

    async fn delete_unhooked(
        &self,
        request: DeleteBranchRequest,
    ) -> Result<DeleteBranchResponse, Status> {
        let repository = resolve_repository(&self.dependencies, request.repository.as_ref()).await?;
        let name = required_text(&request.name, "Name")?;
        let reference = ReferenceName::branch(&name).map_err(|err| {
            GitalyError::invalid_argument(format!("invalid branch name `{name}`: {err}"))
        })?;

        let Some(old_oid) = repository
            .git
            .reference_target(&reference)
            .await
            .map_err(internal_error)?
        else {
            return Err(GitalyError::failed_precondition(format!("branch not found: {name}"))
                .with_reference(reference.as_str())
                .into());
        };

        let update = RefUpdate::delete(reference.clone(), old_oid.clone());
        match repository.git.reference_updater().apply(&[update]).await {
            Ok(()) => {}
            Err(ReferenceUpdateError::Conflict { .. }) => {
                return Err(GitalyError::failed_precondition(format!(
                    "Could not update {reference}. Please refresh and try again."
                ))
                .with_reference(reference.as_str())
                .into())
            }
            Err(err) => return Err(internal_error(err)),
        }
        info!(reference = %reference, old_oid = %old_oid, "deleted branch");

        Ok(DeleteBranchResponse {})
    }
}

#[tonic::async_trait]
impl RefService for RefServiceImpl {
    async fn create_branch(
        &self,
        request: Request<CreateBranchRequest>,
    ) -> Result<Response<CreateBranchResponse>, Status> {
        let span = request_span(&request);
        self.create_unhooked(request.into_inner())
            .instrument(span)
            .await
            .map(Response::new)
    }

    async fn delete_branch(
        &self,
        request: Request<DeleteBranchRequest>,
    ) -> Result<Response<DeleteBranchResponse>, Status> {
        let span = request_span(&request);
        self.delete_unhooked(request.into_inner())
            .instrument(span)
            .await
            .map(Response::new)
    }
}

/// Name validation failures become a status; git failures stay errors.
fn invalid_as_none<T>(result: Result<T, Status>) -> Result<Option<T>, Status> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(status) if status.code() == Code::InvalidArgument => Ok(None),
        Err(status) => Err(status),
    }
}
