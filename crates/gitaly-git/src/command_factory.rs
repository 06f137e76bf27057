//! git command factory with allowlist policy and hardened defaults.

use std::collections::HashSet;
use std::path::Path;

use thiserror::Error;

use crate::command::CommandSpec;

/// Plumbing the operation services are allowed to run.
const OPERATION_SUBCOMMANDS: [&str; 16] = [
    "cat-file",
    "check-ref-format",
    "commit-tree",
    "fetch",
    "for-each-ref",
    "hash-object",
    "ls-tree",
    "merge-base",
    "merge-file",
    "mktag",
    "rev-list",
    "rev-parse",
    "show-ref",
    "update-index",
    "update-ref",
    "write-tree",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandAllowlist {
    allowed_subcommands: HashSet<String>,
}

impl CommandAllowlist {
    pub fn new<I, S>(allowed_subcommands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_subcommands: allowed_subcommands.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_allowed(&self, subcommand: &str) -> bool {
        self.allowed_subcommands.contains(subcommand)
    }
}

impl Default for CommandAllowlist {
    fn default() -> Self {
        Self::new(OPERATION_SUBCOMMANDS)
    }
}

#[derive(Debug, Clone)]
pub struct GitCommandFactory {
    allowlist: CommandAllowlist,
    hardened_env: Vec<(String, String)>,
}

impl GitCommandFactory {
    pub fn new(allowlist: CommandAllowlist) -> Self {
        Self {
            allowlist,
            hardened_env: default_hardened_env(),
        }
    }

    /// Builds `git -C <repo_path> <args...>` with the hardened environment.
    pub fn build_for_repo<I, S>(
        &self,
        repo_path: &Path,
        args: I,
    ) -> Result<CommandSpec, CommandFactoryError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        let subcommand = args.first().ok_or(CommandFactoryError::MissingSubcommand)?;

        if !self.allowlist.is_allowed(subcommand) {
            return Err(CommandFactoryError::ForbiddenSubcommand {
                subcommand: subcommand.clone(),
            });
        }

        let mut command_args = Vec::with_capacity(args.len() + 2);
        command_args.push("-C".to_string());
        command_args.push(repo_path.to_string_lossy().into_owned());
        command_args.extend(args);

        Ok(CommandSpec {
            program: "git".to_string(),
            args: command_args,
            env: self.hardened_env.clone(),
            current_dir: None,
        })
    }
}

impl Default for GitCommandFactory {
    fn default() -> Self {
        Self::new(CommandAllowlist::default())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandFactoryError {
    #[error("git command requires a subcommand")]
    MissingSubcommand,
    #[error("git subcommand `{subcommand}` is not allowed")]
    ForbiddenSubcommand { subcommand: String },
}

fn default_hardened_env() -> Vec<(String, String)> {
    vec![
        ("LANG".to_string(), "en_US.UTF-8".to_string()),
        ("GIT_TERMINAL_PROMPT".to_string(), "0".to_string()),
        ("GIT_CONFIG_GLOBAL".to_string(), "/dev/null".to_string()),
        ("GIT_CONFIG_SYSTEM".to_string(), "/dev/null".to_string()),
        ("XDG_CONFIG_HOME".to_string(), "/dev/null".to_string()),
    ]
}
