//! Execution of the pre-receive, update and post-receive hooks that gate
//! every reference update.
//!
//! Hooks are looked up in an optional global directory and then in the
//! repository's `custom_hooks/` directory. Every executable found runs in
//! that order; the first rejection wins. A missing hook allows the update.

use std::fmt;
use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::command::{CommandError, CommandOutput, CommandRunner, CommandSpec};
use crate::reference::RefUpdate;

pub const ENV_HOOKS_PAYLOAD: &str = "GITALY_HOOKS_PAYLOAD";
pub const CUSTOM_HOOKS_DIR: &str = "custom_hooks";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookKind {
    PreReceive,
    Update,
    PostReceive,
}

impl HookKind {
    pub const ALL: [HookKind; 3] = [Self::PreReceive, Self::Update, Self::PostReceive];

    pub fn name(self) -> &'static str {
        match self {
            Self::PreReceive => "pre-receive",
            Self::Update => "update",
            Self::PostReceive => "post-receive",
        }
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Repository, user and requested hooks, handed to hooks as base64 JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HooksPayload {
    pub repository: HookRepository,
    pub object_format: String,
    pub requested_hooks: Vec<HookKind>,
    #[serde(default)]
    pub user_details: Option<UserDetails>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookRepository {
    pub storage_name: String,
    pub relative_path: String,
    pub gl_repository: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDetails {
    pub user_id: String,
    pub username: String,
    pub protocol: String,
}

impl HooksPayload {
    pub fn to_env_value(&self) -> Result<String, HookError> {
        let json = serde_json::to_vec(self).map_err(HookError::Payload)?;
        Ok(BASE64_STANDARD.encode(json))
    }

    pub fn from_env_value(value: &str) -> Result<Self, HookError> {
        let decoded = BASE64_STANDARD
            .decode(value.trim().as_bytes())
            .map_err(HookError::PayloadEncoding)?;
        serde_json::from_slice(&decoded).map_err(HookError::Payload)
    }
}

/// Per-mutation context the hooks run in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookEnvironment {
    pub repo_path: PathBuf,
    pub payload: HooksPayload,
}

impl HookEnvironment {
    pub fn env_vars(&self) -> Result<Vec<(String, String)>, HookError> {
        let user = self.payload.user_details.as_ref();
        Ok(vec![
            (
                "GIT_DIR".to_string(),
                self.repo_path.to_string_lossy().into_owned(),
            ),
            (
                "GL_ID".to_string(),
                user.map(|user| user.user_id.clone()).unwrap_or_default(),
            ),
            (
                "GL_USERNAME".to_string(),
                user.map(|user| user.username.clone()).unwrap_or_default(),
            ),
            (
                "GL_PROTOCOL".to_string(),
                user.map(|user| user.protocol.clone())
                    .unwrap_or_else(|| "web".to_string()),
            ),
            (
                "GL_REPOSITORY".to_string(),
                self.payload.repository.gl_repository.clone(),
            ),
            (ENV_HOOKS_PAYLOAD.to_string(), self.payload.to_env_value()?),
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    Allowed,
    /// The hook refused; carries the message to show the user.
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum HookError {
    #[error("failed to run {hook} hook `{}`: {source}", .path.display())]
    Execution {
        hook: HookKind,
        path: PathBuf,
        #[source]
        source: CommandError,
    },
    #[error("failed to encode hooks payload: {0}")]
    Payload(#[source] serde_json::Error),
    #[error("failed to decode hooks payload: {0}")]
    PayloadEncoding(#[source] base64::DecodeError),
}

/// Runs one phase of the hook protocol for a set of reference updates.
pub trait HookExecutor: Send + Sync {
    fn run(
        &self,
        kind: HookKind,
        environment: &HookEnvironment,
        updates: &[RefUpdate],
    ) -> impl Future<Output = Result<HookOutcome, HookError>> + Send;
}

#[derive(Debug, Clone)]
pub struct HookManager {
    global_dir: Option<PathBuf>,
    timeout: Duration,
    runner: CommandRunner,
}

impl HookManager {
    pub fn new(global_dir: Option<PathBuf>, timeout: Duration) -> Self {
        Self {
            global_dir,
            timeout,
            runner: CommandRunner,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Executable hook programs for `kind`, in execution order.
    pub fn hook_chain(&self, kind: HookKind, repo_path: &Path) -> Vec<PathBuf> {
        self.global_dir
            .iter()
            .cloned()
            .chain(std::iter::once(repo_path.join(CUSTOM_HOOKS_DIR)))
            .map(|dir| dir.join(kind.name()))
            .filter(|path| is_executable(path))
            .collect()
    }

    async fn run_program(
        &self,
        kind: HookKind,
        path: &Path,
        environment: &HookEnvironment,
        env: &[(String, String)],
        updates: &[RefUpdate],
    ) -> Result<HookOutcome, HookError> {
        let mut spec = CommandSpec::new(path.to_string_lossy()).current_dir(&environment.repo_path);
        for (name, value) in env {
            spec = spec.env(name.as_str(), value.as_str());
        }

        let execution_error = |source| HookError::Execution {
            hook: kind,
            path: path.to_path_buf(),
            source,
        };

        if kind == HookKind::Update {
            for update in updates {
                let spec = spec
                    .clone()
                    .arg(update.reference.as_str())
                    .arg(update.old_oid.as_str())
                    .arg(update.new_oid.as_str());
                let output = self
                    .runner
                    .run_with_timeout(&spec, self.timeout)
                    .await
                    .map_err(execution_error)?;
                if !output.success() {
                    return Ok(HookOutcome::Rejected(rejection_message(kind, &output)));
                }
            }
            return Ok(HookOutcome::Allowed);
        }

        let stdin: String = updates
            .iter()
            .map(|update| format!("{} {} {}\n", update.old_oid, update.new_oid, update.reference))
            .collect();
        let output = self
            .runner
            .run_with_input_timeout(&spec, stdin.as_bytes(), self.timeout)
            .await
            .map_err(execution_error)?;

        if output.success() {
            Ok(HookOutcome::Allowed)
        } else {
            Ok(HookOutcome::Rejected(rejection_message(kind, &output)))
        }
    }
}

impl HookExecutor for HookManager {
    async fn run(
        &self,
        kind: HookKind,
        environment: &HookEnvironment,
        updates: &[RefUpdate],
    ) -> Result<HookOutcome, HookError> {
        let chain = self.hook_chain(kind, &environment.repo_path);
        if chain.is_empty() {
            return Ok(HookOutcome::Allowed);
        }

        let env = environment.env_vars()?;
        for path in chain {
            debug!(hook = %kind, path = %path.display(), "running hook");
            let outcome = self
                .run_program(kind, &path, environment, &env, updates)
                .await?;
            if let HookOutcome::Rejected(message) = &outcome {
                info!(hook = %kind, path = %path.display(), %message, "hook rejected update");
                return Ok(outcome);
            }
        }

        Ok(HookOutcome::Allowed)
    }
}

/// stdout when the hook printed anything there, stderr otherwise, and a
/// generic message when both are blank.
fn rejection_message(kind: HookKind, output: &CommandOutput) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    if !stdout.trim().is_empty() {
        return stdout.into_owned();
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        return stderr.into_owned();
    }

    let status = output
        .status_code
        .map_or_else(|| "signal".to_string(), |code| code.to_string());
    format!("{kind} hook rejected the update (exit status {status})")
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|metadata| metadata.is_file() && metadata.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::Duration;

    use super::{
        HookEnvironment, HookError, HookExecutor, HookKind, HookManager, HookOutcome,
        HookRepository, HooksPayload, UserDetails,
    };
    use crate::object_id::ObjectId;
    use crate::reference::{RefUpdate, ReferenceName};
    use crate::testing::{install_hook_in, TestRepo};

    fn environment(repo: &TestRepo) -> HookEnvironment {
        HookEnvironment {
            repo_path: repo.path().to_path_buf(),
            payload: HooksPayload {
                repository: HookRepository {
                    storage_name: "default".to_string(),
                    relative_path: "repo.git".to_string(),
                    gl_repository: "project-1".to_string(),
                },
                object_format: "sha1".to_string(),
                requested_hooks: HookKind::ALL.to_vec(),
                user_details: Some(UserDetails {
                    user_id: "user-123".to_string(),
                    username: "jane".to_string(),
                    protocol: "web".to_string(),
                }),
            },
        }
    }

    fn update() -> RefUpdate {
        RefUpdate::create(
            ReferenceName::branch("main").expect("valid"),
            ObjectId::parse(&"a".repeat(40)).expect("valid"),
        )
    }

    fn manager() -> HookManager {
        HookManager::new(None, Duration::from_secs(10))
    }

    #[tokio::test]
    async fn missing_hooks_allow_the_update() {
        let repo = TestRepo::new();

        let outcome = manager()
            .run(HookKind::PreReceive, &environment(&repo), &[update()])
            .await
            .expect("missing hook is not an error");

        assert_eq!(outcome, HookOutcome::Allowed);
    }

    #[tokio::test]
    async fn pre_receive_sees_changes_on_stdin_and_environment() {
        let repo = TestRepo::new();
        let record = repo.scratch_dir().join("stdin");
        let script = format!(
            "cat > {path}; printf '%s %s' \"$GL_ID\" \"$GL_REPOSITORY\" >> {path}",
            path = record.display(),
        );
        repo.install_hook("pre-receive", &script);

        let outcome = manager()
            .run(HookKind::PreReceive, &environment(&repo), &[update()])
            .await
            .expect("hook should run");

        assert_eq!(outcome, HookOutcome::Allowed);
        let recorded = fs::read_to_string(&record).expect("hook should write stdin");
        assert_eq!(
            recorded,
            format!("{} {} refs/heads/main\nuser-123 project-1", "0".repeat(40), "a".repeat(40))
        );
    }

    #[tokio::test]
    async fn update_hook_receives_arguments() {
        let repo = TestRepo::new();
        repo.install_hook("update", "echo \"denied $1 $3\"; exit 1");

        let outcome = manager()
            .run(HookKind::Update, &environment(&repo), &[update()])
            .await
            .expect("hook should run");

        assert_eq!(
            outcome,
            HookOutcome::Rejected(format!("denied refs/heads/main {}\n", "a".repeat(40)))
        );
    }

    #[tokio::test]
    async fn rejection_prefers_stdout_then_stderr_then_generic_message() {
        let repo = TestRepo::new();
        let env = environment(&repo);

        repo.install_hook("pre-receive", "echo 'to stderr' >&2; exit 1");
        let outcome = manager()
            .run(HookKind::PreReceive, &env, &[update()])
            .await
            .expect("hook should run");
        assert_eq!(outcome, HookOutcome::Rejected("to stderr\n".to_string()));

        repo.install_hook("pre-receive", "exit 3");
        let outcome = manager()
            .run(HookKind::PreReceive, &env, &[update()])
            .await
            .expect("hook should run");
        assert_eq!(
            outcome,
            HookOutcome::Rejected(
                "pre-receive hook rejected the update (exit status 3)".to_string()
            )
        );
    }

    #[tokio::test]
    async fn global_hooks_run_before_repository_hooks() {
        let repo = TestRepo::new();
        let global = repo.scratch_dir().join("global-hooks");
        let marker = repo.scratch_dir().join("repo-hook-ran");
        install_hook_in(&global, "pre-receive", "echo 'global says no'; exit 1");
        repo.install_hook("pre-receive", &format!("touch {}", marker.display()));

        let manager = HookManager::new(Some(global), Duration::from_secs(10));
        assert_eq!(manager.hook_chain(HookKind::PreReceive, repo.path()).len(), 2);

        let outcome = manager
            .run(HookKind::PreReceive, &environment(&repo), &[update()])
            .await
            .expect("hook should run");

        assert_eq!(outcome, HookOutcome::Rejected("global says no\n".to_string()));
        assert!(!marker.exists(), "chain must stop at the first rejection");
    }

    #[tokio::test]
    async fn non_executable_files_are_ignored_and_timeouts_are_errors() {
        let repo = TestRepo::new();
        let hooks_dir = repo.path().join("custom_hooks");
        fs::create_dir_all(&hooks_dir).expect("hooks dir");
        fs::write(hooks_dir.join("post-receive"), "#!/bin/sh\nexit 1\n").expect("write");
        assert!(manager()
            .hook_chain(HookKind::PostReceive, repo.path())
            .is_empty());

        repo.install_hook("update", "sleep 5");
        let err = HookManager::new(None, Duration::from_millis(100))
            .run(HookKind::Update, &environment(&repo), &[update()])
            .await
            .expect_err("slow hook should time out");
        assert!(matches!(err, HookError::Execution { hook: HookKind::Update, .. }));
    }

    #[test]
    fn payload_roundtrips_through_env_value() {
        let repo = TestRepo::new();
        let env = environment(&repo);
        let vars = env.env_vars().expect("env vars");
        let encoded = vars
            .iter()
            .find(|(name, _)| name == super::ENV_HOOKS_PAYLOAD)
            .map(|(_, value)| value.clone())
            .expect("payload variable present");

        assert_eq!(
            HooksPayload::from_env_value(&encoded).expect("decode"),
            env.payload
        );
        assert!(matches!(
            HooksPayload::from_env_value("%%%"),
            Err(HookError::PayloadEncoding(_))
        ));
    }
}
