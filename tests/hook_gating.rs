mod support;

use gitaly_proto::gitaly::{
    UserCreateBranchRequest, UserCreateTagRequest, UserDeleteBranchRequest, UserFfBranchRequest,
};

use support::{start_test_server, user};

#[tokio::test]
async fn pre_receive_rejection_writes_no_reference() {
    let server = start_test_server("hooks-pre-receive").await;
    let repo = server.create_repository("project.git");
    repo.commit("main", &[("README.md", "base")], "base");
    repo.install_hook("pre-receive", "echo 'GL-HOOK-ERR: pushes are frozen'; exit 1");
    let before = repo.refs();
    let mut client = server.operation_client().await;

    let branch = client
        .user_create_branch(UserCreateBranchRequest {
            repository: repo.proto(),
            branch_name: b"feature".to_vec(),
            user: user(),
            start_point: b"main".to_vec(),
        })
        .await
        .expect("rejection is a business outcome")
        .into_inner();
    assert_eq!(branch.pre_receive_error.trim(), "GL-HOOK-ERR: pushes are frozen");
    assert!(branch.branch.is_none());

    let tag = client
        .user_create_tag(UserCreateTagRequest {
            repository: repo.proto(),
            tag_name: b"v1.0.0".to_vec(),
            user: user(),
            target_revision: b"main".to_vec(),
            message: b"Release".to_vec(),
        })
        .await
        .expect("rejection is a business outcome")
        .into_inner();
    assert_eq!(tag.pre_receive_error.trim(), "GL-HOOK-ERR: pushes are frozen");
    assert!(!tag.exists);

    assert_eq!(repo.refs(), before);

    server.shutdown().await;
}

#[tokio::test]
async fn hooks_observe_one_consistent_change() {
    let server = start_test_server("hooks-observe").await;
    let repo = server.create_repository("project.git");
    let base = repo.commit("main", &[("README.md", "base")], "base");
    repo.git(&["update-ref", "refs/heads/feature", &base]);
    let target = repo.commit("feature", &[("feature.txt", "feature")], "feature work");

    let pre = server.dirs.scratch("pre-receive.log");
    let update = server.dirs.scratch("update.log");
    let post = server.dirs.scratch("post-receive.log");
    server.install_global_hook("pre-receive", &format!("cat > {}", pre.display()));
    repo.install_hook("update", &format!("echo \"$1 $2 $3\" > {}", update.display()));
    server.install_global_hook(
        "post-receive",
        &format!("cat > {}; echo \"$GL_ID $GL_USERNAME\" >> {}", post.display(), post.display()),
    );
    let mut client = server.operation_client().await;

    let response = client
        .user_ff_branch(UserFfBranchRequest {
            repository: repo.proto(),
            user: user(),
            commit_id: target.clone(),
            branch: b"main".to_vec(),
        })
        .await
        .expect("fast-forward should succeed")
        .into_inner();

    assert_eq!(
        response.branch_update.map(|update| update.commit_id).as_deref(),
        Some(target.as_str())
    );
    let expected = format!("{base} {target} refs/heads/main");
    let read = |path: &std::path::Path| std::fs::read_to_string(path).expect("hook should run");
    assert_eq!(read(&pre).trim(), expected);
    assert_eq!(read(&update).trim(), format!("refs/heads/main {base} {target}"));
    assert_eq!(read(&post), format!("{expected}\nuser-123 jane\n"));

    server.shutdown().await;
}

#[tokio::test]
async fn update_hook_rejection_uses_stderr_when_stdout_is_blank() {
    let server = start_test_server("hooks-update").await;
    let repo = server.create_repository("project.git");
    repo.commit("main", &[("README.md", "base")], "base");
    repo.git(&["branch", "protected", "main"]);
    repo.install_hook("update", "echo 'protected branch' >&2; exit 1");
    let mut client = server.operation_client().await;

    let response = client
        .user_delete_branch(UserDeleteBranchRequest {
            repository: repo.proto(),
            branch_name: b"protected".to_vec(),
            user: user(),
        })
        .await
        .expect("rejection is a business outcome")
        .into_inner();

    assert_eq!(response.pre_receive_error.trim(), "protected branch");
    assert!(repo.tip("protected").is_some());

    server.shutdown().await;
}

#[tokio::test]
async fn post_receive_failure_is_not_reported() {
    let server = start_test_server("hooks-post-receive").await;
    let repo = server.create_repository("project.git");
    let head = repo.commit("main", &[("README.md", "base")], "base");
    repo.install_hook("post-receive", "echo 'notification service down'; exit 1");
    let mut client = server.operation_client().await;

    let response = client
        .user_create_branch(UserCreateBranchRequest {
            repository: repo.proto(),
            branch_name: b"feature".to_vec(),
            user: user(),
            start_point: b"main".to_vec(),
        })
        .await
        .expect("post-receive failure stays server side")
        .into_inner();

    assert!(response.pre_receive_error.is_empty());
    assert!(response.branch.is_some());
    assert_eq!(repo.tip("feature").as_deref(), Some(head.as_str()));

    server.shutdown().await;
}
