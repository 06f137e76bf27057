//! Turns raw request fields into validated repositories, users and names.
//!
//! Nothing here mutates a repository. Every failure is a transport error:
//! `InvalidArgument` for malformed input, `NotFound` when the repository
//! does not exist.

use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use gitaly_error::GitalyError;
use gitaly_git::commit::{Commit, Signature};
use gitaly_git::hooks::{HookEnvironment, HookKind, HookRepository, HooksPayload, UserDetails};
use gitaly_git::object_id::ObjectId;
use gitaly_git::reference::ReferenceName;
use gitaly_git::remote::LocalRemote;
use gitaly_git::repository::Repository as GitRepository;
use gitaly_proto::gitaly::{CommitAuthor, GitCommit, Repository, User};
use tonic::Status;

use crate::dependencies::Dependencies;

use super::internal_error;

/// A request's repository, opened and checked to be a git directory.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedRepository {
    pub(crate) git: GitRepository,
    pub(crate) storage_name: String,
    pub(crate) relative_path: String,
    pub(crate) gl_repository: String,
}

impl ResolvedRepository {
    pub(crate) fn hook_environment(&self, user: Option<&Actor>) -> HookEnvironment {
        HookEnvironment {
            repo_path: self.git.path().to_path_buf(),
            payload: HooksPayload {
                repository: HookRepository {
                    storage_name: self.storage_name.clone(),
                    relative_path: self.relative_path.clone(),
                    gl_repository: self.gl_repository.clone(),
                },
                object_format: self.git.object_hash().to_string(),
                requested_hooks: HookKind::ALL.to_vec(),
                user_details: user.map(|user| UserDetails {
                    user_id: user.gl_id.clone(),
                    username: user.username.clone(),
                    protocol: "web".to_string(),
                }),
            },
        }
    }
}

pub(crate) async fn resolve_repository(
    dependencies: &Dependencies,
    repository: Option<&Repository>,
) -> Result<ResolvedRepository, Status> {
    let repository =
        repository.ok_or_else(|| GitalyError::invalid_argument("empty Repository"))?;
    let path = repository_path(dependencies, repository)?;
    if !is_git_directory(&path) {
        return Err(GitalyError::not_found(format!(
            "repository not found: {}/{}",
            repository.storage_name, repository.relative_path
        ))
        .into());
    }

    let git = GitRepository::open(&path).await.map_err(internal_error)?;
    Ok(ResolvedRepository {
        git,
        storage_name: repository.storage_name.clone(),
        relative_path: repository.relative_path.clone(),
        gl_repository: repository.gl_repository.clone(),
    })
}

/// A second repository taking part in the operation. Unset or empty
/// locators mean "no remote".
pub(crate) fn resolve_remote(
    dependencies: &Dependencies,
    repository: Option<&Repository>,
) -> Result<Option<LocalRemote>, Status> {
    let Some(repository) = repository else {
        return Ok(None);
    };
    if repository.storage_name.is_empty() && repository.relative_path.is_empty() {
        return Ok(None);
    }

    let path = repository_path(dependencies, repository)?;
    if !is_git_directory(&path) {
        return Err(GitalyError::not_found(format!(
            "remote repository not found: {}/{}",
            repository.storage_name, repository.relative_path
        ))
        .into());
    }
    Ok(Some(LocalRemote::new(path)))
}

fn repository_path(
    dependencies: &Dependencies,
    repository: &Repository,
) -> Result<PathBuf, Status> {
    if repository.storage_name.trim().is_empty() {
        return Err(GitalyError::invalid_argument("empty StorageName").into());
    }
    if repository.relative_path.trim().is_empty() {
        return Err(GitalyError::invalid_argument("empty RelativePath").into());
    }
    validate_relative_path(&repository.relative_path)?;

    let storage_root = dependencies
        .storage_paths
        .get(&repository.storage_name)
        .ok_or_else(|| {
            GitalyError::not_found(format!(
                "storage `{}` is not configured",
                repository.storage_name
            ))
        })?;

    Ok(storage_root.join(&repository.relative_path))
}

fn validate_relative_path(relative_path: &str) -> Result<(), Status> {
    let path = Path::new(relative_path);
    let escapes = path.is_absolute()
        || path
            .components()
            .any(|component| !matches!(component, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(GitalyError::invalid_argument(format!(
            "relative path escapes the storage: {relative_path}"
        ))
        .into());
    }
    Ok(())
}

fn is_git_directory(path: &Path) -> bool {
    path.join("objects").is_dir() && path.join("HEAD").is_file()
}

/// The user on whose behalf a mutation happens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Actor {
    pub(crate) gl_id: String,
    pub(crate) username: String,
    pub(crate) name: String,
    pub(crate) email: String,
}

impl Actor {
    pub(crate) fn from_request(user: Option<&User>) -> Result<Self, Status> {
        let user = user.ok_or_else(|| GitalyError::invalid_argument("empty User"))?;
        if user.gl_id.trim().is_empty() {
            return Err(GitalyError::invalid_argument("empty User.GlId").into());
        }

        Ok(Self {
            gl_id: user.gl_id.clone(),
            username: user.gl_username.clone(),
            name: String::from_utf8_lossy(&user.name).into_owned(),
            email: String::from_utf8_lossy(&user.email).into_owned(),
        })
    }

    /// Signature stamped with the current time.
    pub(crate) fn signature(&self) -> Signature {
        Signature::new(self.name.as_str(), self.email.as_str(), now())
    }
}

pub(crate) fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_secs() as i64)
}

/// A required UTF-8 field given as bytes on the wire.
pub(crate) fn required_text(value: &[u8], field: &str) -> Result<String, Status> {
    if value.is_empty() {
        return Err(GitalyError::invalid_argument(format!("empty {field}")).into());
    }
    String::from_utf8(value.to_vec())
        .map_err(|_| GitalyError::invalid_argument(format!("{field} is not valid UTF-8")).into())
}

pub(crate) fn optional_text(value: &[u8], field: &str) -> Result<Option<String>, Status> {
    if value.is_empty() {
        return Ok(None);
    }
    required_text(value, field).map(Some)
}

/// Validates `name` as a branch both locally and through git.
pub(crate) async fn branch_reference(
    repository: &ResolvedRepository,
    name: &str,
) -> Result<ReferenceName, Status> {
    let reference = ReferenceName::branch(name).map_err(|err| {
        GitalyError::invalid_argument(format!("invalid branch name `{name}`: {err}"))
    })?;
    ensure_ref_format(repository, reference).await
}

pub(crate) async fn tag_reference(
    repository: &ResolvedRepository,
    name: &str,
) -> Result<ReferenceName, Status> {
    let reference = ReferenceName::tag(name)
        .map_err(|err| GitalyError::invalid_argument(format!("invalid tag name `{name}`: {err}")))?;
    ensure_ref_format(repository, reference).await
}

async fn ensure_ref_format(
    repository: &ResolvedRepository,
    reference: ReferenceName,
) -> Result<ReferenceName, Status> {
    let valid = repository
        .git
        .check_ref_format(reference.as_str())
        .await
        .map_err(internal_error)?;
    if !valid {
        return Err(GitalyError::invalid_argument(format!(
            "invalid reference name `{reference}`"
        ))
        .into());
    }
    Ok(reference)
}

pub(crate) fn parse_object_id(value: &str, field: &str) -> Result<ObjectId, Status> {
    if value.trim().is_empty() {
        return Err(GitalyError::invalid_argument(format!("empty {field}")).into());
    }
    ObjectId::parse(value)
        .map_err(|err| GitalyError::invalid_argument(format!("cannot parse {field}: {err}")).into())
}

/// Resolves `revision` to a commit, `FailedPrecondition` when it names none.
pub(crate) async fn resolve_commit(
    repository: &ResolvedRepository,
    revision: &str,
) -> Result<ObjectId, Status> {
    repository
        .git
        .resolve_commit(revision)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| {
            GitalyError::failed_precondition(format!("revspec '{revision}' not found")).into()
        })
}

pub(crate) async fn load_commit(
    repository: &ResolvedRepository,
    oid: &ObjectId,
) -> Result<Commit, Status> {
    repository
        .git
        .read_commit(oid)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| GitalyError::internal(format!("commit {oid} vanished")).into())
}

pub(crate) fn git_commit(commit: &Commit) -> GitCommit {
    let author = |signature: &Signature| CommitAuthor {
        name: signature.name.clone().into_bytes(),
        email: signature.email.clone().into_bytes(),
        date: signature.time,
        timezone: signature.timezone.clone().into_bytes(),
    };

    GitCommit {
        id: commit.id.to_string(),
        subject: commit.subject().to_vec(),
        body: commit.message.clone(),
        author: Some(author(&commit.author)),
        committer: Some(author(&commit.committer)),
        parent_ids: commit.parents.iter().map(ToString::to_string).collect(),
        body_size: commit.message.len() as i64,
        tree_id: commit.tree.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use gitaly_proto::gitaly::User;
    use tonic::Code;

    use super::{required_text, validate_relative_path, Actor};

    #[test]
    fn actor_requires_user_with_gl_id() {
        let missing = Actor::from_request(None).expect_err("missing user should fail");
        assert_eq!(missing.code(), Code::InvalidArgument);

        let anonymous = User::default();
        let status = Actor::from_request(Some(&anonymous)).expect_err("empty gl_id should fail");
        assert_eq!(status.code(), Code::InvalidArgument);

        let user = User {
            gl_id: "user-7".to_string(),
            name: b"Jane <Doe>".to_vec(),
            email: b"jane@example.com".to_vec(),
            gl_username: "jane".to_string(),
        };
        let actor = Actor::from_request(Some(&user)).expect("user should convert");
        assert_eq!(actor.signature().name, "Jane Doe");
        assert_eq!(actor.username, "jane");
    }

    #[test]
    fn relative_paths_must_stay_inside_the_storage() {
        validate_relative_path("group/project.git").expect("plain path is valid");
        validate_relative_path("./group/project.git").expect("leading dot is valid");

        for path in ["/etc/passwd", "../outside.git", "group/../../outside.git"] {
            let status = validate_relative_path(path).expect_err("escaping path should fail");
            assert_eq!(status.code(), Code::InvalidArgument, "{path}");
        }
    }

    #[test]
    fn required_text_rejects_empty_and_non_utf8_values() {
        assert_eq!(
            required_text(b"", "BranchName")
                .expect_err("empty should fail")
                .message(),
            "empty BranchName"
        );
        assert!(required_text(&[0xff, 0xfe], "BranchName").is_err());
        assert_eq!(
            required_text(b"feature", "BranchName").expect("valid text"),
            "feature"
        );
    }
}
