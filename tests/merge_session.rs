mod support;

use gitaly_proto::gitaly::operation_service_client::OperationServiceClient;
use gitaly_proto::gitaly::{UserMergeBranchRequest, UserMergeBranchResponse};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;
use tonic::{Code, Streaming};

use support::{start_test_server, user, Fixture};

/// `main` and `feature` diverged from a common base without conflicts.
fn diverged(repo: &Fixture) -> (String, String) {
    let base = repo.commit("main", &[("README.md", "base")], "base");
    repo.git(&["update-ref", "refs/heads/feature", &base]);
    let main = repo.commit("main", &[("main.txt", "main")], "main work");
    let feature = repo.commit("feature", &[("feature.txt", "feature")], "feature work");
    (main, feature)
}

fn first_message(repo: &Fixture, commit_id: &str) -> UserMergeBranchRequest {
    UserMergeBranchRequest {
        repository: repo.proto(),
        user: user(),
        commit_id: commit_id.to_string(),
        branch: b"main".to_vec(),
        message: b"Merge branch 'feature'".to_vec(),
        apply: false,
    }
}

fn apply_message(apply: bool) -> UserMergeBranchRequest {
    UserMergeBranchRequest {
        apply,
        ..UserMergeBranchRequest::default()
    }
}

async fn open_session(
    client: &mut OperationServiceClient<Channel>,
    first: UserMergeBranchRequest,
) -> (
    mpsc::Sender<UserMergeBranchRequest>,
    Streaming<UserMergeBranchResponse>,
    UserMergeBranchResponse,
) {
    let (requests, inbound) = mpsc::channel(4);
    requests.send(first).await.expect("first message should queue");
    let mut responses = client
        .user_merge_branch(ReceiverStream::new(inbound))
        .await
        .expect("merge session should open")
        .into_inner();
    let prepared = responses
        .message()
        .await
        .expect("first response should arrive")
        .expect("server should announce the merge commit");
    (requests, responses, prepared)
}

#[tokio::test]
async fn applied_merge_moves_branch_to_announced_commit() {
    let server = start_test_server("merge-apply").await;
    let repo = server.create_repository("project.git");
    let (main, feature) = diverged(&repo);
    let mut client = server.operation_client().await;

    let (requests, mut responses, prepared) =
        open_session(&mut client, first_message(&repo, &feature)).await;
    assert!(!prepared.commit_id.is_empty());
    assert_eq!(repo.tip("main").as_deref(), Some(main.as_str()));

    requests
        .send(apply_message(true))
        .await
        .expect("apply should queue");
    let applied = responses
        .message()
        .await
        .expect("apply should succeed")
        .expect("server should report the branch update");

    let update = applied.branch_update.expect("branch update should be set");
    assert_eq!(update.commit_id, prepared.commit_id);
    assert_eq!(repo.tip("main").as_deref(), Some(prepared.commit_id.as_str()));
    assert_eq!(
        repo.git(&["log", "-1", "--format=%P", "main"]),
        format!("{main} {feature}")
    );

    server.shutdown().await;
}

#[tokio::test]
async fn aborted_merge_leaves_branch_untouched() {
    let server = start_test_server("merge-abort").await;
    let repo = server.create_repository("project.git");
    let (_, feature) = diverged(&repo);
    let before = repo.refs();
    let mut client = server.operation_client().await;

    let (requests, mut responses, _) =
        open_session(&mut client, first_message(&repo, &feature)).await;
    requests
        .send(apply_message(false))
        .await
        .expect("abort should queue");
    let status = responses
        .message()
        .await
        .expect_err("abort should end the call with an error");

    assert_eq!(status.code(), Code::FailedPrecondition);
    assert_eq!(repo.refs(), before);

    server.shutdown().await;
}

#[tokio::test]
async fn disconnect_before_apply_abandons_session() {
    let server = start_test_server("merge-disconnect").await;
    let repo = server.create_repository("project.git");
    let (_, feature) = diverged(&repo);
    let before = repo.refs();
    let mut client = server.operation_client().await;

    let (requests, mut responses, _) =
        open_session(&mut client, first_message(&repo, &feature)).await;
    drop(requests);
    let trailing = responses
        .message()
        .await
        .expect("abandoned session ends cleanly");

    assert!(trailing.is_none());
    assert_eq!(repo.refs(), before);

    server.shutdown().await;
}

#[tokio::test]
async fn pre_receive_rejection_is_reported_after_apply() {
    let server = start_test_server("merge-hook").await;
    let repo = server.create_repository("project.git");
    let (main, feature) = diverged(&repo);
    repo.install_hook("pre-receive", "echo 'merges are frozen'; exit 1");
    let mut client = server.operation_client().await;

    let (requests, mut responses, _) =
        open_session(&mut client, first_message(&repo, &feature)).await;
    requests
        .send(apply_message(true))
        .await
        .expect("apply should queue");
    let rejected = responses
        .message()
        .await
        .expect("rejection is a business outcome")
        .expect("server should report the rejection");

    assert_eq!(rejected.pre_receive_error.trim(), "merges are frozen");
    assert!(rejected.branch_update.is_none());
    assert_eq!(repo.tip("main").as_deref(), Some(main.as_str()));

    server.shutdown().await;
}
