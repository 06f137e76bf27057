use gitaly_git::reference::RefUpdate;
use gitaly_git::transaction::CancelSignal;
use gitaly_proto::gitaly::{
    Branch, UserCreateBranchRequest, UserCreateBranchResponse, UserDeleteBranchRequest,
    UserDeleteBranchResponse,
};
use tonic::Status;

use crate::dependencies::Dependencies;
use crate::service::actors::{
    branch_reference, git_commit, load_commit, required_text, resolve_commit,
    resolve_repository, Actor,
};

use super::mutation::{update_reference, BranchState};
use super::outcome::{into_envelope, BusinessOutcome, Outcome};

pub(crate) async fn user_create_branch(
    dependencies: &Dependencies,
    request: UserCreateBranchRequest,
) -> Result<UserCreateBranchResponse, Status> {
    let repository = resolve_repository(dependencies, request.repository.as_ref()).await?;
    let user = Actor::from_request(request.user.as_ref())?;
    let branch_name = required_text(&request.branch_name, "BranchName")?;
    let start_point = required_text(&request.start_point, "StartPoint")?;
    let reference = branch_reference(&repository, &branch_name).await?;

    let start = resolve_commit(&repository, &start_point).await?;
    let state = BranchState::load(&repository, reference).await?;
    if state.tip.is_some() {
        return into_envelope(Outcome::Rejected(BusinessOutcome::AlreadyExists));
    }

    let outcome = update_reference(
        dependencies,
        &repository,
        &user,
        state.update_to(start.clone()),
        CancelSignal::never(),
    )
    .await?;

    match outcome {
        Outcome::Applied(()) => {
            let commit = load_commit(&repository, &start).await?;
            into_envelope(Outcome::Applied(Branch {
                name: branch_name.into_bytes(),
                target_commit: Some(git_commit(&commit)),
            }))
        }
        Outcome::Rejected(rejection) => into_envelope(Outcome::Rejected(rejection)),
    }
}

pub(crate) async fn user_delete_branch(
    dependencies: &Dependencies,
    request: UserDeleteBranchRequest,
) -> Result<UserDeleteBranchResponse, Status> {
    let repository = resolve_repository(dependencies, request.repository.as_ref()).await?;
    let user = Actor::from_request(request.user.as_ref())?;
    let branch_name = required_text(&request.branch_name, "BranchName")?;
    let reference = branch_reference(&repository, &branch_name).await?;

    let state = BranchState::load(&repository, reference).await?;
    let tip = state.require_tip()?.clone();

    let outcome = update_reference(
        dependencies,
        &repository,
        &user,
        RefUpdate::delete(state.reference, tip),
        CancelSignal::never(),
    )
    .await?;
    into_envelope(outcome)
}
