//! A throwaway storage with bare repositories for handler tests.

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use tempfile::TempDir;

use gitaly_proto::gitaly::{Repository, User};

use crate::dependencies::Dependencies;

pub(crate) const STORAGE: &str = "default";

pub(crate) struct TestStorage {
    root: TempDir,
}

impl TestStorage {
    pub(crate) fn new() -> Self {
        Self {
            root: tempfile::tempdir().expect("temp storage should be creatable"),
        }
    }

    pub(crate) fn dependencies(&self) -> Dependencies {
        Dependencies::default().with_storage(STORAGE, self.root.path())
    }

    pub(crate) fn create_repository(&self, relative_path: &str) -> TestRepository {
        let path = self.root.path().join(relative_path);
        fs::create_dir_all(&path).expect("repository dir should be creatable");
        let repository = TestRepository {
            path,
            relative_path: relative_path.to_string(),
        };
        repository.git(&["init", "--bare", "--quiet"]);
        repository.git(&["symbolic-ref", "HEAD", "refs/heads/main"]);
        repository
    }
}

pub(crate) struct TestRepository {
    path: PathBuf,
    relative_path: String,
}

impl TestRepository {
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn proto(&self) -> Option<Repository> {
        Some(Repository {
            storage_name: STORAGE.to_string(),
            relative_path: self.relative_path.clone(),
            gl_repository: format!("project-{}", self.relative_path.len()),
        })
    }

    /// Commits `files` on top of `branch`, creating it when absent.
    pub(crate) fn commit(&self, branch: &str, files: &[(&str, &str)], message: &str) -> String {
        let parent = self.tip(branch);
        let scratch = tempfile::tempdir().expect("scratch dir should be creatable");
        let index = scratch.path().join("index").to_string_lossy().into_owned();
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

        let mut args = vec!["commit-tree", tree.as_str()];
        if let Some(parent) = &parent {
            args.extend(["-p", parent.as_str()]);
        }
        let commit = self.git_env(&args, &[], Some(message.as_bytes()));
        self.git(&["update-ref", &format!("refs/heads/{branch}"), &commit]);
        commit
    }

    pub(crate) fn tip(&self, branch: &str) -> Option<String> {
        self.resolve(&format!("refs/heads/{branch}"))
    }

    pub(crate) fn resolve(&self, revision: &str) -> Option<String> {
        let output = git_command(&self.path, &["rev-parse", "--verify", "--quiet", revision])
            .output()
            .expect("git should run");
        output
            .status
            .success()
            .then(|| String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub(crate) fn file_at(&self, revision: &str, path: &str) -> Option<String> {
        let output = git_command(&self.path, &["cat-file", "-p", &format!("{revision}:{path}")])
            .output()
            .expect("git should run");
        output
            .status
            .success()
            .then(|| String::from_utf8_lossy(&output.stdout).into_owned())
    }

    pub(crate) fn install_hook(&self, name: &str, script: &str) {
        let dir = self.path.join("custom_hooks");
        fs::create_dir_all(&dir).expect("hook dir should be creatable");
        let hook = dir.join(name);
        fs::write(&hook, format!("#!/bin/sh\n{script}\n")).expect("hook should be writable");
        fs::set_permissions(&hook, fs::Permissions::from_mode(0o755))
            .expect("hook should be executable");
    }

    pub(crate) fn git(&self, args: &[&str]) -> String {
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
        assert_success(args, &output);
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }
}

pub(crate) fn user() -> Option<User> {
    Some(User {
        gl_id: "user-123".to_string(),
        name: b"Jane Doe".to_vec(),
        email: b"jane@example.com".to_vec(),
        gl_username: "jane".to_string(),
    })
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

fn assert_success(args: &[&str], output: &Output) {
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}
