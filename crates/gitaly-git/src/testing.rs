//! Temporary bare repositories for unit tests.

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};

pub(crate) struct TestRepo {
    root: PathBuf,
    path: PathBuf,
}

impl TestRepo {
    pub(crate) fn new() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(0);
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let root = std::env::temp_dir().join(format!(
            "gitaly-git-tests-{}-{id}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&root);
        let path = root.join("repo.git");
        fs::create_dir_all(&path).expect("temp repo directory should be creatable");

        let repo = Self { root, path };
        repo.git_success(&["init", "--bare", "--quiet"]);
        repo.git_success(&["symbolic-ref", "HEAD", "refs/heads/main"]);
        repo
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn scratch_dir(&self) -> PathBuf {
        let dir = self.root.join("scratch");
        fs::create_dir_all(&dir).expect("scratch dir should be creatable");
        dir
    }

    /// Commits `files` on top of `branch` (creating it when absent) and
    /// returns the new commit id.
    pub(crate) fn commit_files(
        &self,
        branch: &str,
        files: &[(&str, &[u8])],
        message: &str,
    ) -> String {
        let parent = self.branch_tip(branch);
        let index = self.root.join(format!("index-{branch}").replace('/', "-"));
        let _ = fs::remove_file(&index);
        let index = index.to_string_lossy().into_owned();

        if let Some(parent) = &parent {
            self.git_with_env(&["read-tree", parent], &[("GIT_INDEX_FILE", &index)]);
        }
        for (path, content) in files {
            let blob = self.git_input_stdout(&["hash-object", "-w", "--stdin"], content);
            self.git_with_env(
                &["update-index", "--add", "--cacheinfo", &format!("100644,{blob},{path}")],
                &[("GIT_INDEX_FILE", &index)],
            );
        }
        let tree = stdout_of(self.git_with_env(&["write-tree"], &[("GIT_INDEX_FILE", &index)]));

        let mut args = vec!["commit-tree".to_string(), tree];
        if let Some(parent) = parent {
            args.push("-p".to_string());
            args.push(parent);
        }
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let commit = self.git_input_stdout(&args, message.as_bytes());
        self.git_success(&["update-ref", &format!("refs/heads/{branch}"), &commit]);
        commit
    }

    pub(crate) fn commit_file(
        &self,
        branch: &str,
        path: &str,
        content: &[u8],
        message: &str,
    ) -> String {
        self.commit_files(branch, &[(path, content)], message)
    }

    pub(crate) fn branch_tip(&self, branch: &str) -> Option<String> {
        let reference = format!("refs/heads/{branch}");
        let output = self.git(&["rev-parse", "--verify", "--quiet", &reference]);
        output.status.success().then(|| stdout_of(output))
    }

    pub(crate) fn install_hook(&self, name: &str, script: &str) -> PathBuf {
        install_hook_in(&self.path.join("custom_hooks"), name, script)
    }

    pub(crate) fn git(&self, args: &[&str]) -> Output {
        git_command(&self.path, args)
            .output()
            .expect("git command should execute")
    }

    pub(crate) fn git_success(&self, args: &[&str]) {
        let output = self.git(args);
        assert_success(&self.path, args, &output);
    }

    pub(crate) fn git_stdout(&self, args: &[&str]) -> String {
        let output = self.git(args);
        assert_success(&self.path, args, &output);
        stdout_of(output)
    }

    fn git_with_env(&self, args: &[&str], env: &[(&str, &str)]) -> Output {
        let output = git_command(&self.path, args)
            .envs(env.iter().copied())
            .output()
            .expect("git command should execute");
        assert_success(&self.path, args, &output);
        output
    }

    fn git_input_stdout(&self, args: &[&str], input: &[u8]) -> String {
        let mut child = git_command(&self.path, args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .expect("git command should spawn");
        child
            .stdin
            .take()
            .expect("stdin should be piped")
            .write_all(input)
            .expect("stdin should be writable");
        let output = child.wait_with_output().expect("git command should finish");
        assert_success(&self.path, args, &output);
        stdout_of(output)
    }
}

impl Drop for TestRepo {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

pub(crate) fn install_hook_in(dir: &Path, name: &str, script: &str) -> PathBuf {
    fs::create_dir_all(dir).expect("hook dir should be creatable");
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{script}\n")).expect("hook should be writable");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
        .expect("hook should be made executable");
    path
}

fn git_command(repo_path: &Path, args: &[&str]) -> Command {
    let mut command = Command::new("git");
    command
        .arg("-C")
        .arg(repo_path)
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

fn assert_success(repo_path: &Path, args: &[&str], output: &Output) {
    assert!(
        output.status.success(),
        "git command failed: git -C {} {}\nstdout: {}\nstderr: {}",
        repo_path.display(),
        args.join(" "),
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn stdout_of(output: Output) -> String {
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}
