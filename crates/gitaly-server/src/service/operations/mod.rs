//! `OperationService`: user-facing mutations gated by the hook chain.

use std::pin::Pin;
use std::sync::Arc;

use tokio_stream::Stream;
use tonic::{Request, Response, Status, Streaming};
use tracing::Instrument;

use gitaly_proto::gitaly::operation_service_server::OperationService;
use gitaly_proto::gitaly::{
    UserCherryPickRequest, UserCherryPickResponse, UserCommitFilesRequest,
    UserCommitFilesResponse, UserCreateBranchRequest, UserCreateBranchResponse,
    UserCreateTagRequest, UserCreateTagResponse, UserDeleteBranchRequest,
    UserDeleteBranchResponse, UserDeleteTagRequest, UserDeleteTagResponse, UserFfBranchRequest,
    UserFfBranchResponse, UserMergeBranchRequest, UserMergeBranchResponse, UserRebaseRequest,
    UserRebaseResponse, UserRevertRequest, UserRevertResponse, UserSquashRequest,
    UserSquashResponse,
};

use crate::dependencies::Dependencies;
use crate::middleware::request_span;

pub(crate) mod branches;
pub(crate) mod cherry_pick;
pub(crate) mod commit_files;
pub(crate) mod merge;
pub(crate) mod mutation;
pub(crate) mod outcome;
pub(crate) mod rebase;
pub(crate) mod squash;
pub(crate) mod tags;

type ServiceStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send + 'static>>;

#[derive(Debug, Clone)]
pub struct OperationServiceImpl {
    dependencies: Arc<Dependencies>,
}

impl OperationServiceImpl {
    #[must_use]
    pub fn new(dependencies: Arc<Dependencies>) -> Self {
        Self { dependencies }
    }
}

#[tonic::async_trait]
impl OperationService for OperationServiceImpl {
    type UserMergeBranchStream = ServiceStream<UserMergeBranchResponse>;

    async fn user_create_branch(
        &self,
        request: Request<UserCreateBranchRequest>,
    ) -> Result<Response<UserCreateBranchResponse>, Status> {
        let span = request_span(&request);
        branches::user_create_branch(&self.dependencies, request.into_inner())
            .instrument(span)
            .await
            .map(Response::new)
    }

    async fn user_delete_branch(
        &self,
        request: Request<UserDeleteBranchRequest>,
    ) -> Result<Response<UserDeleteBranchResponse>, Status> {
        let span = request_span(&request);
        branches::user_delete_branch(&self.dependencies, request.into_inner())
            .instrument(span)
            .await
            .map(Response::new)
    }

    async fn user_create_tag(
        &self,
        request: Request<UserCreateTagRequest>,
    ) -> Result<Response<UserCreateTagResponse>, Status> {
        let span = request_span(&request);
        tags::user_create_tag(&self.dependencies, request.into_inner())
            .instrument(span)
            .await
            .map(Response::new)
    }

    async fn user_delete_tag(
        &self,
        request: Request<UserDeleteTagRequest>,
    ) -> Result<Response<UserDeleteTagResponse>, Status> {
        let span = request_span(&request);
        tags::user_delete_tag(&self.dependencies, request.into_inner())
            .instrument(span)
            .await
            .map(Response::new)
    }

    async fn user_merge_branch(
        &self,
        request: Request<Streaming<UserMergeBranchRequest>>,
    ) -> Result<Response<Self::UserMergeBranchStream>, Status> {
        let span = request_span(&request);
        let responses =
            merge::user_merge_branch(Arc::clone(&self.dependencies), request.into_inner(), span);
        Ok(Response::new(Box::pin(responses)))
    }

    async fn user_ff_branch(
        &self,
        request: Request<UserFfBranchRequest>,
    ) -> Result<Response<UserFfBranchResponse>, Status> {
        let span = request_span(&request);
        merge::user_ff_branch(&self.dependencies, request.into_inner())
            .instrument(span)
            .await
            .map(Response::new)
    }

    async fn user_cherry_pick(
        &self,
        request: Request<UserCherryPickRequest>,
    ) -> Result<Response<UserCherryPickResponse>, Status> {
        let span = request_span(&request);
        cherry_pick::user_cherry_pick(&self.dependencies, request.into_inner())
            .instrument(span)
            .await
            .map(Response::new)
    }

    async fn user_revert(
        &self,
        request: Request<UserRevertRequest>,
    ) -> Result<Response<UserRevertResponse>, Status> {
        let span = request_span(&request);
        cherry_pick::user_revert(&self.dependencies, request.into_inner())
            .instrument(span)
            .await
            .map(Response::new)
    }

    async fn user_commit_files(
        &self,
        request: Request<Streaming<UserCommitFilesRequest>>,
    ) -> Result<Response<UserCommitFilesResponse>, Status> {
        let span = request_span(&request);
        commit_files::user_commit_files(&self.dependencies, request.into_inner())
            .instrument(span)
            .await
            .map(Response::new)
    }

    async fn user_rebase(
        &self,
        request: Request<UserRebaseRequest>,
    ) -> Result<Response<UserRebaseResponse>, Status> {
        let span = request_span(&request);
        rebase::user_rebase(&self.dependencies, request.into_inner())
            .instrument(span)
            .await
            .map(Response::new)
    }

    async fn user_squash(
        &self,
        request: Request<UserSquashRequest>,
    ) -> Result<Response<UserSquashResponse>, Status> {
        let span = request_span(&request);
        squash::user_squash(&self.dependencies, request.into_inner())
            .instrument(span)
            .await
            .map(Response::new)
    }
}
