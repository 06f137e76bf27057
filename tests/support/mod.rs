#![allow(dead_code)]

use std::future::Future;
use std::io::Write;
use std::net::TcpListener;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use gitaly_proto::gitaly::operation_service_client::OperationServiceClient;
use gitaly_proto::gitaly::ref_service_client::RefServiceClient;
use gitaly_proto::gitaly::{Repository, User};
use gitaly_server::{Dependencies, GitalyServer};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tonic::transport::Channel;

pub const STORAGE_NAME: &str = "default";
const CONNECT_ATTEMPTS: usize = 50;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(20);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);
const HOOK_TIMEOUT: Duration = Duration::from_secs(10);

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

pub struct TestDirs {
    root_dir: PathBuf,
    pub storage_dir: PathBuf,
    pub global_hooks_dir: PathBuf,
}

impl TestDirs {
    fn new(prefix: &str) -> Self {
        let counter = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let now_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock should be after the epoch")
            .as_nanos();
        let root_dir = std::env::temp_dir().join(format!(
            "gitaly-ops-tests-{prefix}-{}-{now_nanos}-{counter}",
            std::process::id()
        ));
        let storage_dir = root_dir.join("storage");
        let global_hooks_dir = root_dir.join("hooks");

        std::fs::create_dir_all(&storage_dir).expect("storage dir should be creatable");
        std::fs::create_dir_all(&global_hooks_dir).expect("hooks dir should be creatable");

        Self {
            root_dir,
            storage_dir,
            global_hooks_dir,
        }
    }

    pub fn scratch(&self, name: &str) -> PathBuf {
        self.root_dir.join(name)
    }
}

impl Drop for TestDirs {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root_dir);
    }
}

pub struct TestServer {
    pub dirs: TestDirs,
    pub dependencies: Arc<Dependencies>,
    pub endpoint: String,
    shutdown_tx: Option<oneshot::Sender<()>>,
    server_task: Option<JoinHandle<Result<(), tonic::transport::Error>>>,
}

impl TestServer {
    pub async fn shutdown(mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }

        if let Some(server_task) = self.server_task.take() {
            let joined = timeout(SHUTDOWN_TIMEOUT, server_task)
                .await
                .expect("server should stop within timeout");
            let result = joined.expect("server task should not panic");
            if let Err(error) = result {
                panic!("server task should stop cleanly: {error}");
            }
        }
    }

    pub fn create_repository(&self, relative_path: &str) -> Fixture {
        let path = self.dirs.storage_dir.join(relative_path);
        std::fs::create_dir_all(&path).expect("repository dir should be creatable");
        let fixture = Fixture {
            path,
            relative_path: relative_path.to_string(),
        };
        fixture.git(&["init", "--bare", "--quiet"]);
        fixture.git(&["symbolic-ref", "HEAD", "refs/heads/main"]);
        fixture
    }

    /// Installs a hook that runs for every repository in the storage.
    pub fn install_global_hook(&self, name: &str, script: &str) {
        write_hook(&self.dirs.global_hooks_dir, name, script);
    }

    pub async fn operation_client(&self) -> OperationServiceClient<Channel> {
        let endpoint = self.endpoint.clone();
        connect_with_retries(move || OperationServiceClient::connect(endpoint.clone()))
            .await
            .unwrap_or_else(|error| panic!("operation client should connect: {error}"))
    }

    pub async fn ref_client(&self) -> RefServiceClient<Channel> {
        let endpoint = self.endpoint.clone();
        connect_with_retries(move || RefServiceClient::connect(endpoint.clone()))
            .await
            .unwrap_or_else(|error| panic!("ref client should connect: {error}"))
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(server_task) = self.server_task.take() {
            server_task.abort();
        }
    }
}

pub async fn start_test_server(prefix: &str) -> TestServer {
    let dirs = TestDirs::new(prefix);
    let dependencies = Arc::new(
        Dependencies::default()
            .with_storage(STORAGE_NAME, &dirs.storage_dir)
            .with_hooks(Some(dirs.global_hooks_dir.clone()), HOOK_TIMEOUT),
    );
    let router = GitalyServer::build_router_with_dependencies(Arc::clone(&dependencies));

    let listener =
        TcpListener::bind("127.0.0.1:0").expect("ephemeral listener should bind successfully");
    let listen_addr = listener
        .local_addr()
        .expect("ephemeral listener should have local address");
    drop(listener);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server_task = tokio::spawn(async move {
        router
            .serve_with_shutdown(listen_addr, async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    TestServer {
        dirs,
        dependencies,
        endpoint: format!("http://{listen_addr}"),
        shutdown_tx: Some(shutdown_tx),
        server_task: Some(server_task),
    }
}

async fn connect_with_retries<Client, Connector, Fut>(
    mut connector: Connector,
) -> Result<Client, tonic::transport::Error>
where
    Connector: FnMut() -> Fut,
    Fut: Future<Output = Result<Client, tonic::transport::Error>>,
{
    let mut last_error = None;

    for _ in 0..CONNECT_ATTEMPTS {
        match connector().await {
            Ok(client) => return Ok(client),
            Err(error) => {
                last_error = Some(error);
                sleep(CONNECT_RETRY_DELAY).await;
            }
        }
    }

    Err(last_error.expect("at least one connection attempt should run"))
}

pub fn user() -> Option<User> {
    Some(User {
        gl_id: "user-123".to_string(),
        name: b"Jane Doe".to_vec(),
        email: b"jane@example.com".to_vec(),
        gl_username: "jane".to_string(),
    })
}

/// A bare repository inside the test server's storage.
pub struct Fixture {
    pub path: PathBuf,
    relative_path: String,
}

impl Fixture {
    pub fn proto(&self) -> Option<Repository> {
        Some(Repository {
            storage_name: STORAGE_NAME.to_string(),
            relative_path: self.relative_path.clone(),
            gl_repository: "project-1".to_string(),
        })
    }

    /// Commits `files` on top of `branch`, creating the branch when absent.
    pub fn commit(&self, branch: &str, files: &[(&str, &str)], message: &str) -> String {
        let parent = self.tip(branch);
        let index = self.path.join(format!("fixture-index-{branch}"));
        let index = index.to_string_lossy().into_owned();
        let index_env = [("GIT_INDEX_FILE", index.as_str())];

        if let Some(parent) = &parent {
            self.git_env(&["read-tree", parent], &index_env, None);
        }
        for (path, content) in files {
            let blob = self.git_env(
                &["hash-object", "-w", "--stdin"],
                &[],
                Some(content.as_bytes()),
            );
            let info = format!("100644,{blob},{path}");
            self.git_env(&["update-index", "--add", "--cacheinfo", &info], &index_env, None);
        }
        let tree = self.git_env(&["write-tree"], &index_env, None);
        let _ = std::fs::remove_file(&index);

        let mut args = vec!["commit-tree", tree.as_str()];
        if let Some(parent) = &parent {
            args.extend(["-p", parent.as_str()]);
        }
        let commit = self.git_env(&args, &[], Some(message.as_bytes()));
        self.git(&["update-ref", &format!("refs/heads/{branch}"), &commit]);
        commit
    }

    pub fn tip(&self, branch: &str) -> Option<String> {
        self.resolve(&format!("refs/heads/{branch}"))
    }

    pub fn resolve(&self, revision: &str) -> Option<String> {
        let output = git_command(&self.path, &["rev-parse", "--verify", "--quiet", revision])
            .output()
            .expect("git should run");
        output
            .status
            .success()
            .then(|| String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub fn file_at(&self, revision: &str, path: &str) -> Option<Vec<u8>> {
        let output = git_command(&self.path, &["cat-file", "blob", &format!("{revision}:{path}")])
            .output()
            .expect("git should run");
        output.status.success().then_some(output.stdout)
    }

    /// Snapshot of every reference, for checking that nothing was written.
    pub fn refs(&self) -> String {
        self.git(&["for-each-ref", "--format=%(refname) %(objectname)"])
    }

    pub fn install_hook(&self, name: &str, script: &str) {
        write_hook(&self.path.join("custom_hooks"), name, script);
    }

    pub fn git(&self, args: &[&str]) -> String {
        self.git_env(args, &[], None)
    }

    fn git_env(&self, args: &[&str], env: &[(&str, &str)], input: Option<&[u8]>) -> String {
        let mut child = git_command(&self.path, args)
            .envs(env.iter().copied())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .expect("git should spawn");
        let mut stdin = child.stdin.take().expect("stdin should be piped");
        if let Some(input) = input {
            stdin.write_all(input).expect("stdin should be writable");
        }
        drop(stdin);

        let output = child.wait_with_output().expect("git should finish");
        assert!(
            output.status.success(),
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }
}

fn write_hook(dir: &Path, name: &str, script: &str) {
    std::fs::create_dir_all(dir).expect("hook dir should be creatable");
    let hook = dir.join(name);
    std::fs::write(&hook, format!("#!/bin/sh\n{script}\n")).expect("hook should be writable");
    std::fs::set_permissions(&hook, std::fs::Permissions::from_mode(0o755))
        .expect("hook should be executable");
}

fn git_command(path: &Path, args: &[&str]) -> Command {
    let mut command = Command::new("git");
    command
        .arg("-C")
        .arg(path)
        .args(args)
        .env("GIT_CONFIG_GLOBAL", "/dev/null")
        .env("GIT_CONFIG_SYSTEM", "/dev/null")
        .env("GIT_AUTHOR_NAME", "Fixture Author")
        .env("GIT_AUTHOR_EMAIL", "fixture@example.com")
        .env("GIT_AUTHOR_DATE", "1700000000 +0000")
        .env("GIT_COMMITTER_NAME", "Fixture Author")
        .env("GIT_COMMITTER_EMAIL", "fixture@example.com")
        .env("GIT_COMMITTER_DATE", "1700000000 +0000");
    command
}
