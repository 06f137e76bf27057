//! git object lookup helpers backed by `git cat-file` batch modes.

use std::fmt;
use std::num::ParseIntError;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

use crate::command::{CommandError, CommandRunner, CommandSpec};
use crate::command_factory::{CommandAllowlist, CommandFactoryError, GitCommandFactory};
use crate::object_id::{ObjectId, ObjectIdError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Commit,
    Tree,
    Blob,
    Tag,
}

impl ObjectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Tree => "tree",
            Self::Blob => "blob",
            Self::Tag => "tag",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "commit" => Ok(Self::Commit),
            "tree" => Ok(Self::Tree),
            "blob" => Ok(Self::Blob),
            "tag" => Ok(Self::Tag),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub oid: ObjectId,
    pub kind: ObjectKind,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectData {
    pub info: ObjectInfo,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct CatFileReader {
    repo_path: PathBuf,
    runner: CommandRunner,
    command_factory: GitCommandFactory,
}

impl CatFileReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: path.into(),
            runner: CommandRunner,
            command_factory: GitCommandFactory::new(CommandAllowlist::new(["cat-file"])),
        }
    }

    pub async fn object_info(&self, revision: &str) -> Result<Option<ObjectInfo>, CatFileError> {
        let stdout = self.batch("--batch-check", revision).await?;
        let stdout = String::from_utf8(stdout)?;
        let first_line = stdout.lines().next().unwrap_or_default();

        parse_batch_header(first_line)
    }

    pub async fn object_contents(
        &self,
        revision: &str,
    ) -> Result<Option<ObjectData>, CatFileError> {
        let stdout = self.batch("--batch", revision).await?;
        parse_batch_payload(&stdout)
    }

    async fn batch(&self, mode: &str, revision: &str) -> Result<Vec<u8>, CatFileError> {
        // A newline in the revision would smuggle a second batch request.
        if revision.contains('\n') {
            return Err(CatFileError::InvalidRevision(revision.to_string()));
        }

        let command = self.git_spec(["cat-file", mode])?;
        let stdin = format!("{revision}\n");
        let output = self
            .runner
            .run_with_input(&command, stdin.as_bytes())
            .await?;

        if !output.success() {
            return Err(CatFileError::CommandFailure {
                status_code: output.status_code,
                stderr: output.stderr_lossy(),
            });
        }

        Ok(output.stdout)
    }

    fn git_spec<const N: usize>(&self, args: [&str; N]) -> Result<CommandSpec, CatFileError> {
        self.command_factory
            .build_for_repo(&self.repo_path, args)
            .map_err(CatFileError::CommandFactory)
    }
}

#[derive(Debug, Error)]
pub enum CatFileError {
    #[error("failed to build git command: {0}")]
    CommandFactory(#[from] CommandFactoryError),
    #[error("command execution failed: {0}")]
    Command(#[from] CommandError),
    #[error("git command failed with status {status_code:?}: {stderr}")]
    CommandFailure {
        status_code: Option<i32>,
        stderr: String,
    },
    #[error("revision `{0}` cannot be looked up")]
    InvalidRevision(String),
    #[error("invalid cat-file header `{header}`")]
    InvalidHeader { header: String },
    #[error("invalid object id in cat-file header: {0}")]
    InvalidObjectId(#[from] ObjectIdError),
    #[error("invalid object size in cat-file header `{header}`: {source}")]
    InvalidSize {
        header: String,
        #[source]
        source: ParseIntError,
    },
    #[error("failed to decode UTF-8 from git output: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("invalid cat-file payload: {reason}")]
    InvalidPayload { reason: String },
}

fn parse_batch_header(line: &str) -> Result<Option<ObjectInfo>, CatFileError> {
    let line = line.trim_end_matches(['\n', '\r']);
    let invalid = || CatFileError::InvalidHeader {
        header: if line.is_empty() {
            "<empty>".to_string()
        } else {
            line.to_string()
        },
    };

    // `<rev> missing` and `<rev> ambiguous` both mean "no such object".
    if line.ends_with(" missing") || line.ends_with(" ambiguous") {
        return Ok(None);
    }

    let mut fields = line.split(' ');
    let (Some(oid), Some(kind), Some(size), None) =
        (fields.next(), fields.next(), fields.next(), fields.next())
    else {
        return Err(invalid());
    };

    let kind = kind.parse::<ObjectKind>().map_err(|_| invalid())?;
    let size = size.parse().map_err(|source| CatFileError::InvalidSize {
        header: line.to_string(),
        source,
    })?;

    Ok(Some(ObjectInfo {
        oid: ObjectId::parse(oid)?,
        kind,
        size,
    }))
}

fn parse_batch_payload(stdout: &[u8]) -> Result<Option<ObjectData>, CatFileError> {
    let header_end = stdout
        .iter()
        .position(|byte| *byte == b'\n')
        .ok_or_else(|| CatFileError::InvalidPayload {
            reason: "missing header newline".to_string(),
        })?;
    let header = std::str::from_utf8(&stdout[..header_end]).map_err(|_| {
        CatFileError::InvalidPayload {
            reason: "header is not UTF-8".to_string(),
        }
    })?;
    let Some(info) = parse_batch_header(header)? else {
        return Ok(None);
    };

    let body_start = header_end + 1;
    let body_end = body_start + info.size;
    if stdout.len() < body_end + 1 || stdout[body_end] != b'\n' {
        return Err(CatFileError::InvalidPayload {
            reason: format!(
                "expected {} content bytes and a trailing newline, got {} bytes after header",
                info.size,
                stdout.len().saturating_sub(body_start)
            ),
        });
    }

    Ok(Some(ObjectData {
        content: stdout[body_start..body_end].to_vec(),
        info,
    }))
}
