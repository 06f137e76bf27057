//! Access to a second repository taking part in an operation, such as the
//! start repository of a cherry-pick or the remote of a rebase.

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tracing::debug;

use crate::object_id::ObjectId;
use crate::reference::{RefUpdate, ReferenceName, ReferenceNameError};
use crate::repository::{Repository, RepositoryError};

const TEMPORARY_REF_PREFIX: &str = "refs/tmp/gitaly-ops";

pub trait RemoteRepository: Send + Sync {
    /// Makes the tip of `branch` available in `into` and returns its id,
    /// or `None` when the remote has no such branch.
    fn fetch_branch(
        &self,
        into: &Repository,
        branch: &str,
    ) -> impl Future<Output = Result<Option<ObjectId>, RemoteError>> + Send;
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("invalid remote branch name: {0}")]
    InvalidBranch(#[from] ReferenceNameError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// A repository on the same host, reached through its path.
#[derive(Debug, Clone)]
pub struct LocalRemote {
    path: PathBuf,
}

impl LocalRemote {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RemoteRepository for LocalRemote {
    async fn fetch_branch(
        &self,
        into: &Repository,
        branch: &str,
    ) -> Result<Option<ObjectId>, RemoteError> {
        let source_ref = ReferenceName::branch(branch)?;
        if same_repository(&self.path, into) {
            return Ok(into.reference_target(&source_ref).await?);
        }

        let remote = Repository::with_hash(self.path.clone(), into.object_hash());
        if remote.reference_target(&source_ref).await?.is_none() {
            return Ok(None);
        }

        let temporary = temporary_reference()?;
        debug!(
            remote = %self.path.display(),
            reference = %source_ref,
            temporary = %temporary,
            "fetching from remote repository"
        );
        into.fetch_reference(&self.path, &source_ref, &temporary).await?;

        // The objects stay; only the temporary name is dropped.
        let fetched = into.reference_target(&temporary).await?;
        if let Some(oid) = &fetched {
            into.reference_updater()
                .apply(&[RefUpdate::delete(temporary, oid.clone())])
                .await
                .map_err(RepositoryError::from)?;
        }
        Ok(fetched)
    }
}

fn same_repository(path: &std::path::Path, repository: &Repository) -> bool {
    match (path.canonicalize(), repository.path().canonicalize()) {
        (Ok(left), Ok(right)) => left == right,
        _ => path == repository.path(),
    }
}

fn temporary_reference() -> Result<ReferenceName, ReferenceNameError> {
    static NEXT_ID: AtomicU64 = AtomicU64::new(0);
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    ReferenceName::new(format!(
        "{TEMPORARY_REF_PREFIX}/{}-{id}",
        std::process::id()
    ))
}
