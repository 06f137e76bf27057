//! Reference names and atomic reference updates.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

use crate::command::{CommandError, CommandRunner};
use crate::command_factory::{CommandFactoryError, GitCommandFactory};
use crate::object_id::{ObjectId, ObjectIdError};

pub const BRANCH_PREFIX: &str = "refs/heads/";
pub const TAG_PREFIX: &str = "refs/tags/";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReferenceName(String);

impl ReferenceName {
    pub fn new(value: impl Into<String>) -> Result<Self, ReferenceNameError> {
        let value = value.into();

        if value.is_empty() {
            return Err(ReferenceNameError::Empty);
        }

        if value.contains(' ') {
            return Err(ReferenceNameError::ContainsSpace);
        }

        if value.contains("..") {
            return Err(ReferenceNameError::ContainsDoubleDot);
        }

        if value.starts_with('/') || value.starts_with('-') {
            return Err(ReferenceNameError::LeadingSlash);
        }

        if value.ends_with('/') {
            return Err(ReferenceNameError::TrailingSlash);
        }

        if value.ends_with(".lock") {
            return Err(ReferenceNameError::LockSuffix);
        }

        if value
            .chars()
            .any(|character| character.is_ascii_control() || "~^:?*[\\".contains(character))
        {
            return Err(ReferenceNameError::InvalidCharacter);
        }

        Ok(Self(value))
    }

    pub fn branch(name: &str) -> Result<Self, ReferenceNameError> {
        Self::new(format!("{BRANCH_PREFIX}{name}"))
    }

    pub fn tag(name: &str) -> Result<Self, ReferenceNameError> {
        Self::new(format!("{TAG_PREFIX}{name}"))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// The name without its `refs/heads/` or `refs/tags/` prefix.
    pub fn short_name(&self) -> &str {
        self.0
            .strip_prefix(BRANCH_PREFIX)
            .or_else(|| self.0.strip_prefix(TAG_PREFIX))
            .unwrap_or(&self.0)
    }

    pub fn is_branch(&self) -> bool {
        self.0.starts_with(BRANCH_PREFIX)
    }
}

impl fmt::Display for ReferenceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ReferenceName {
    type Err = ReferenceNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReferenceNameError {
    #[error("reference name cannot be empty")]
    Empty,
    #[error("reference name cannot contain spaces")]
    ContainsSpace,
    #[error("reference name cannot contain `..`")]
    ContainsDoubleDot,
    #[error("reference name cannot start with `/` or `-`")]
    LeadingSlash,
    #[error("reference name cannot end with `/`")]
    TrailingSlash,
    #[error("reference name cannot end with `.lock`")]
    LockSuffix,
    #[error("reference name contains a forbidden character")]
    InvalidCharacter,
}

/// One compare-and-swap on a reference. A zero `old_oid` requires the
/// reference to be absent, a zero `new_oid` deletes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefUpdate {
    pub reference: ReferenceName,
    pub old_oid: ObjectId,
    pub new_oid: ObjectId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefUpdateKind {
    Create,
    Update,
    Delete,
}

impl RefUpdate {
    pub fn create(reference: ReferenceName, new_oid: ObjectId) -> Self {
        Self {
            reference,
            old_oid: new_oid.hash().zero_oid(),
            new_oid,
        }
    }

    pub fn update(reference: ReferenceName, old_oid: ObjectId, new_oid: ObjectId) -> Self {
        Self {
            reference,
            old_oid,
            new_oid,
        }
    }

    pub fn delete(reference: ReferenceName, old_oid: ObjectId) -> Self {
        Self {
            reference,
            new_oid: old_oid.hash().zero_oid(),
            old_oid,
        }
    }

    pub fn kind(&self) -> RefUpdateKind {
        if self.old_oid.is_zero() {
            RefUpdateKind::Create
        } else if self.new_oid.is_zero() {
            RefUpdateKind::Delete
        } else {
            RefUpdateKind::Update
        }
    }

    fn update_ref_stdin_line(&self) -> String {
        format!("update {} {} {}\n", self.reference, self.new_oid, self.old_oid)
    }
}

#[derive(Debug, Clone)]
pub struct ReferenceUpdater {
    runner: CommandRunner,
    repo_path: PathBuf,
    command_factory: GitCommandFactory,
}

impl ReferenceUpdater {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            runner: CommandRunner,
            repo_path: path.into(),
            command_factory: GitCommandFactory::default(),
        }
    }

    /// Applies all updates in a single `update-ref` transaction.
    ///
    /// When git refuses the transaction each reference is re-read; a value
    /// differing from the expected old value is reported as
    /// [`ReferenceUpdateError::Conflict`].
    pub async fn apply(&self, updates: &[RefUpdate]) -> Result<(), ReferenceUpdateError> {
        if updates.is_empty() {
            return Ok(());
        }

        let mut script = String::from("start\n");
        for update in updates {
            script.push_str(&update.update_ref_stdin_line());
        }
        script.push_str("prepare\ncommit\n");

        let spec = self
            .command_factory
            .build_for_repo(&self.repo_path, ["update-ref", "--stdin"])?;
        let output = self
            .runner
            .run_with_input(&spec, script.as_bytes())
            .await
            .map_err(ReferenceUpdateError::Command)?;

        if output.success() {
            return Ok(());
        }

        for update in updates {
            let actual = self.read(&update.reference).await?;
            let expected = (!update.old_oid.is_zero()).then(|| update.old_oid.clone());
            if actual != expected {
                return Err(ReferenceUpdateError::Conflict {
                    reference: update.reference.clone(),
                    expected: update.old_oid.clone(),
                    actual,
                });
            }
        }

        Err(ReferenceUpdateError::GitFailed {
            status_code: output.status_code,
            stderr: output.stderr_lossy(),
        })
    }

    /// Current value of `reference`, without peeling.
    pub async fn read(
        &self,
        reference: &ReferenceName,
    ) -> Result<Option<ObjectId>, ReferenceUpdateError> {
        let spec = self.command_factory.build_for_repo(
            &self.repo_path,
            ["rev-parse", "--verify", "--quiet", reference.as_str()],
        )?;
        let output = self
            .runner
            .run(&spec)
            .await
            .map_err(ReferenceUpdateError::Command)?;

        match output.status_code {
            Some(0) => Ok(Some(ObjectId::parse(&String::from_utf8_lossy(
                &output.stdout,
            ))?)),
            Some(1) => Ok(None),
            status_code => Err(ReferenceUpdateError::GitFailed {
                status_code,
                stderr: output.stderr_lossy(),
            }),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReferenceUpdateError {
    #[error("failed to build git command: {0}")]
    CommandFactory(#[from] CommandFactoryError),
    #[error("failed to run `git update-ref`: {0}")]
    Command(#[source] CommandError),
    #[error("reference `{reference}` changed concurrently: expected {expected}, found {}", .actual.as_ref().map_or_else(|| "nothing".to_string(), ToString::to_string))]
    Conflict {
        reference: ReferenceName,
        expected: ObjectId,
        actual: Option<ObjectId>,
    },
    #[error("git update-ref failed (status {status_code:?}): {stderr}")]
    GitFailed {
        status_code: Option<i32>,
        stderr: String,
    },
    #[error("unexpected reference value: {0}")]
    InvalidOutput(#[from] ObjectIdError),
}
