//! Repository-level git plumbing used by the mutating operations.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::catfile::{CatFileError, CatFileReader, ObjectInfo, ObjectKind};
use crate::command::{CommandOutput, CommandRunner, CommandSpec};
use crate::command_factory::{CommandFactoryError, GitCommandFactory};
use crate::commit::{Commit, CommitParseError, Signature};
use crate::object_id::{ObjectHash, ObjectId, ObjectIdError};
use crate::reference::{ReferenceName, ReferenceUpdateError, ReferenceUpdater};
use crate::tree::{FileMode, TreeEntry, TreeIndex};

#[derive(Debug, Clone)]
pub struct Repository {
    path: PathBuf,
    hash: ObjectHash,
    runner: CommandRunner,
    command_factory: GitCommandFactory,
    catfile_reader: CatFileReader,
}

/// Everything `commit-tree` needs to write a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCommit {
    pub tree: ObjectId,
    pub parents: Vec<ObjectId>,
    pub author: Signature,
    pub committer: Signature,
    pub message: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTag {
    pub target: ObjectId,
    pub target_kind: ObjectKind,
    pub name: String,
    pub tagger: Signature,
    pub message: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeTreeResult {
    Clean(ObjectId),
    Conflict { paths: Vec<String> },
}

impl Repository {
    /// Opens the repository at `path`, detecting its object format.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, RepositoryError> {
        let mut repository = Self::with_hash(path, ObjectHash::Sha1);
        let format = repository
            .git_stdout(["rev-parse", "--show-object-format"])
            .await?;
        if format.trim() == "sha256" {
            repository.hash = ObjectHash::Sha256;
        }
        Ok(repository)
    }

    pub fn with_hash(path: impl Into<PathBuf>, hash: ObjectHash) -> Self {
        let path = path.into();

        Self {
            catfile_reader: CatFileReader::new(path.clone()),
            path,
            hash,
            runner: CommandRunner,
            command_factory: GitCommandFactory::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn object_hash(&self) -> ObjectHash {
        self.hash
    }

    pub fn reference_updater(&self) -> ReferenceUpdater {
        ReferenceUpdater::new(self.path.clone())
    }

    /// Resolves any revision to an object id, or `None` when it does not
    /// name an object.
    pub async fn resolve_revision(
        &self,
        revision: &str,
    ) -> Result<Option<ObjectId>, RepositoryError> {
        if revision.is_empty() || revision.starts_with('-') {
            return Ok(None);
        }

        let output = self
            .git(["rev-parse", "--verify", "--quiet", revision])
            .await?;
        match output.status_code {
            Some(0) => Ok(Some(parse_oid(&output.stdout)?)),
            Some(1) | Some(128) => Ok(None),
            _ => Err(command_failure(output)),
        }
    }

    /// Resolves a revision and peels it to a commit.
    pub async fn resolve_commit(
        &self,
        revision: &str,
    ) -> Result<Option<ObjectId>, RepositoryError> {
        if revision.is_empty() {
            return Ok(None);
        }
        self.resolve_revision(&format!("{revision}^{{commit}}")).await
    }

    pub async fn reference_target(
        &self,
        reference: &ReferenceName,
    ) -> Result<Option<ObjectId>, RepositoryError> {
        Ok(self.reference_updater().read(reference).await?)
    }

    pub async fn has_branches(&self) -> Result<bool, RepositoryError> {
        let stdout = self
            .git_stdout(["for-each-ref", "--count=1", "--format=%(refname)", "refs/heads/"])
            .await?;
        Ok(!stdout.trim().is_empty())
    }

    /// `git check-ref-format`, the authoritative reference name check.
    pub async fn check_ref_format(&self, reference: &str) -> Result<bool, RepositoryError> {
        let output = self.git(["check-ref-format", reference]).await?;
        Ok(output.success())
    }

    pub async fn object_info(&self, revision: &str) -> Result<Option<ObjectInfo>, RepositoryError> {
        Ok(self.catfile_reader.object_info(revision).await?)
    }

    pub async fn read_commit(&self, oid: &ObjectId) -> Result<Option<Commit>, RepositoryError> {
        let Some(object) = self.catfile_reader.object_contents(oid.as_str()).await? else {
            return Ok(None);
        };
        if object.info.kind != ObjectKind::Commit {
            return Ok(None);
        }
        Ok(Some(Commit::parse(object.info.oid, &object.content)?))
    }

    pub async fn is_ancestor(
        &self,
        ancestor: &ObjectId,
        descendant: &ObjectId,
    ) -> Result<bool, RepositoryError> {
        let output = self
            .git([
                "merge-base",
                "--is-ancestor",
                ancestor.as_str(),
                descendant.as_str(),
            ])
            .await?;
        match output.status_code {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(command_failure(output)),
        }
    }

    pub async fn merge_base(
        &self,
        left: &ObjectId,
        right: &ObjectId,
    ) -> Result<Option<ObjectId>, RepositoryError> {
        let output = self
            .git(["merge-base", left.as_str(), right.as_str()])
            .await?;
        match output.status_code {
            Some(0) => Ok(Some(parse_oid(&output.stdout)?)),
            Some(1) => Ok(None),
            _ => Err(command_failure(output)),
        }
    }

    /// Three-way merges `ours` and `theirs` without touching any worktree.
    /// With `merge_base` unset the base is their merge base, or the empty
    /// tree for unrelated histories. Any tree-ish works as a base.
    ///
    /// Entries are merged path by path; only blobs changed on both sides
    /// go through `git merge-file`. Renames are not detected.
    pub async fn merge_tree(
        &self,
        ours: &ObjectId,
        theirs: &ObjectId,
        merge_base: Option<&ObjectId>,
    ) -> Result<MergeTreeResult, RepositoryError> {
        let base = match merge_base {
            Some(base) => base.clone(),
            None => self
                .merge_base(ours, theirs)
                .await?
                .unwrap_or_else(|| self.hash.empty_tree()),
        };
        let base = self.read_tree(&base).await?;
        let ours = self.read_tree(ours).await?;
        let theirs = self.read_tree(theirs).await?;

        let paths: BTreeSet<&String> = base
            .iter()
            .chain(ours.iter())
            .chain(theirs.iter())
            .map(|(path, _)| path)
            .collect();
        let mut merged = Vec::with_capacity(paths.len());
        let mut conflicts = Vec::new();
        for path in paths {
            match merge_entry(base.get(path), ours.get(path), theirs.get(path)) {
                EntryMerge::Keep(entry) => merged.push((path.clone(), entry)),
                EntryMerge::Remove => {}
                EntryMerge::Content {
                    mode,
                    base,
                    ours,
                    theirs,
                } => match self.merge_blobs(base.as_ref(), &ours, &theirs).await? {
                    Some(oid) => merged.push((path.clone(), TreeEntry { mode, oid })),
                    None => conflicts.push(path.clone()),
                },
                EntryMerge::Conflict => conflicts.push(path.clone()),
            }
        }
        conflicts.extend(directory_file_clashes(&merged));

        if !conflicts.is_empty() {
            conflicts.sort();
            conflicts.dedup();
            return Ok(MergeTreeResult::Conflict { paths: conflicts });
        }
        let tree = self.write_tree(&TreeIndex::from_entries(merged)).await?;
        Ok(MergeTreeResult::Clean(tree))
    }

    /// Line-level merge of three blobs; `None` when the hunks overlap.
    async fn merge_blobs(
        &self,
        base: Option<&ObjectId>,
        ours: &ObjectId,
        theirs: &ObjectId,
    ) -> Result<Option<ObjectId>, RepositoryError> {
        let scratch = tempfile::tempdir().map_err(RepositoryError::Io)?;
        let mut files = Vec::with_capacity(3);
        for (name, oid) in [("ours", Some(ours)), ("base", base), ("theirs", Some(theirs))] {
            let content = match oid {
                Some(oid) => self.blob_content(oid).await?,
                None => Vec::new(),
            };
            let file = scratch.path().join(name);
            tokio::fs::write(&file, content)
                .await
                .map_err(RepositoryError::Io)?;
            files.push(file.to_string_lossy().into_owned());
        }

        let mut args = vec!["merge-file".to_string(), "-p".to_string(), "-q".to_string()];
        args.extend(files);
        let output = self.git(args).await?;
        match output.status_code {
            Some(0) => Ok(Some(self.write_blob(&output.stdout).await?)),
            // merge-file exits with the number of conflicting hunks.
            Some(1..=127) => Ok(None),
            _ => Err(command_failure(output)),
        }
    }

    async fn blob_content(&self, oid: &ObjectId) -> Result<Vec<u8>, RepositoryError> {
        self.catfile_reader
            .object_contents(oid.as_str())
            .await?
            .map(|object| object.content)
            .ok_or_else(|| RepositoryError::InvalidOutput {
                reason: format!("blob {oid} is missing"),
            })
    }

    pub async fn write_blob(&self, content: &[u8]) -> Result<ObjectId, RepositoryError> {
        let spec = self.git_spec(["hash-object", "-w", "--stdin"])?;
        let output = self.run(spec, Some(content)).await?;
        if !output.success() {
            return Err(command_failure(output));
        }
        parse_oid(&output.stdout)
    }

    pub async fn write_commit(&self, commit: &NewCommit) -> Result<ObjectId, RepositoryError> {
        let mut args = vec!["commit-tree".to_string(), commit.tree.to_string()];
        for parent in &commit.parents {
            args.push("-p".to_string());
            args.push(parent.to_string());
        }

        let spec = self
            .git_spec(args)?
            .env("GIT_AUTHOR_NAME", commit.author.name.as_str())
            .env("GIT_AUTHOR_EMAIL", commit.author.email.as_str())
            .env("GIT_AUTHOR_DATE", commit.author.git_date())
            .env("GIT_COMMITTER_NAME", commit.committer.name.as_str())
            .env("GIT_COMMITTER_EMAIL", commit.committer.email.as_str())
            .env("GIT_COMMITTER_DATE", commit.committer.git_date());
        let output = self.run(spec, Some(&commit.message)).await?;
        if !output.success() {
            return Err(command_failure(output));
        }
        parse_oid(&output.stdout)
    }

    pub async fn write_tag(&self, tag: &NewTag) -> Result<ObjectId, RepositoryError> {
        let mut content = format!(
            "object {}\ntype {}\ntag {}\ntagger {}\n\n",
            tag.target,
            tag.target_kind,
            tag.name,
            tag.tagger.to_ident()
        )
        .into_bytes();
        content.extend_from_slice(&tag.message);
        if !content.ends_with(b"\n") {
            content.push(b'\n');
        }

        let output = self.run(self.git_spec(["mktag"])?, Some(&content)).await?;
        if !output.success() {
            return Err(command_failure(output));
        }
        parse_oid(&output.stdout)
    }

    /// Loads every blob and submodule entry reachable from `treeish`.
    pub async fn read_tree(&self, treeish: &ObjectId) -> Result<TreeIndex, RepositoryError> {
        let output = self
            .git(["ls-tree", "-r", "-z", "--full-tree", treeish.as_str()])
            .await?;
        if !output.success() {
            return Err(command_failure(output));
        }

        let mut entries = Vec::new();
        for record in output.stdout.split(|byte| *byte == 0) {
            if record.is_empty() {
                continue;
            }
            let record = String::from_utf8_lossy(record);
            let invalid = || RepositoryError::InvalidOutput {
                reason: format!("unexpected ls-tree record `{record}`"),
            };
            let (meta, path) = record.split_once('\t').ok_or_else(invalid)?;
            let mut meta = meta.split(' ');
            let (Some(mode), Some(_kind), Some(oid)) = (meta.next(), meta.next(), meta.next())
            else {
                return Err(invalid());
            };
            let mode = FileMode::from_octal(mode).ok_or_else(invalid)?;
            entries.push((
                path.to_string(),
                TreeEntry {
                    mode,
                    oid: ObjectId::parse(oid)?,
                },
            ));
        }

        Ok(TreeIndex::from_entries(entries))
    }

    /// Writes `index` as a tree object using a throwaway index file.
    pub async fn write_tree(&self, index: &TreeIndex) -> Result<ObjectId, RepositoryError> {
        let scratch = tempfile::tempdir().map_err(RepositoryError::Io)?;
        let index_file = scratch.path().join("index").to_string_lossy().into_owned();

        if !index.is_empty() {
            let spec = self
                .git_spec(["update-index", "-z", "--index-info"])?
                .env("GIT_INDEX_FILE", index_file.as_str());
            let output = self.run(spec, Some(&index.index_info())).await?;
            if !output.success() {
                return Err(command_failure(output));
            }
        }

        let spec = self
            .git_spec(["write-tree"])?
            .env("GIT_INDEX_FILE", index_file.as_str());
        let output = self.run(spec, None).await?;
        if !output.success() {
            return Err(command_failure(output));
        }
        parse_oid(&output.stdout)
    }

    /// Non-merge commits in `exclude..include`, oldest first.
    pub async fn rev_list(
        &self,
        exclude: &ObjectId,
        include: &ObjectId,
    ) -> Result<Vec<ObjectId>, RepositoryError> {
        let stdout = self
            .git_stdout([
                "rev-list",
                "--reverse",
                "--no-merges",
                include.as_str(),
                &format!("^{exclude}"),
            ])
            .await?;
        stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| ObjectId::parse(line).map_err(RepositoryError::from))
            .collect()
    }

    /// Fetches `source_ref` from the repository at `remote` into
    /// `target_ref`, overwriting it.
    pub async fn fetch_reference(
        &self,
        remote: &Path,
        source_ref: &ReferenceName,
        target_ref: &ReferenceName,
    ) -> Result<(), RepositoryError> {
        let remote = remote.to_string_lossy().into_owned();
        let refspec = format!("+{source_ref}:{target_ref}");
        let output = self
            .git([
                "fetch",
                "--no-tags",
                "--quiet",
                "--no-write-fetch-head",
                remote.as_str(),
                refspec.as_str(),
            ])
            .await?;
        if !output.success() {
            return Err(command_failure(output));
        }
        Ok(())
    }

    async fn git<I, S>(&self, args: I) -> Result<CommandOutput, RepositoryError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.run(self.git_spec(args)?, None).await
    }

    async fn git_stdout<I, S>(&self, args: I) -> Result<String, RepositoryError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let output = self.git(args).await?;
        if !output.success() {
            return Err(command_failure(output));
        }
        Ok(String::from_utf8(output.stdout)?)
    }

    async fn run(
        &self,
        spec: CommandSpec,
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput, RepositoryError> {
        let output = match stdin {
            Some(stdin) => self.runner.run_with_input(&spec, stdin).await?,
            None => self.runner.run(&spec).await?,
        };
        Ok(output)
    }

    fn git_spec<I, S>(&self, args: I) -> Result<CommandSpec, RepositoryError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Ok(self.command_factory.build_for_repo(&self.path, args)?)
    }
}

/// How one path comes out of a three-way merge.
#[derive(Debug, Clone, PartialEq, Eq)]
enum EntryMerge {
    Keep(TreeEntry),
    Remove,
    Content {
        mode: FileMode,
        base: Option<ObjectId>,
        ours: ObjectId,
        theirs: ObjectId,
    },
    Conflict,
}

fn merge_entry(
    base: Option<&TreeEntry>,
    ours: Option<&TreeEntry>,
    theirs: Option<&TreeEntry>,
) -> EntryMerge {
    let keep = |entry: Option<&TreeEntry>| match entry {
        Some(entry) => EntryMerge::Keep(entry.clone()),
        None => EntryMerge::Remove,
    };
    if ours == theirs || base == theirs {
        return keep(ours);
    }
    if base == ours {
        return keep(theirs);
    }

    let (Some(ours), Some(theirs)) = (ours, theirs) else {
        return EntryMerge::Conflict;
    };
    if !is_file(ours.mode) || !is_file(theirs.mode) {
        return EntryMerge::Conflict;
    }
    let base = base.filter(|base| is_file(base.mode));
    let base_mode = base.map(|base| base.mode);
    let mode = if ours.mode == theirs.mode || base_mode == Some(theirs.mode) {
        ours.mode
    } else if base_mode == Some(ours.mode) {
        theirs.mode
    } else {
        return EntryMerge::Conflict;
    };
    if ours.oid == theirs.oid {
        return EntryMerge::Keep(TreeEntry {
            mode,
            oid: ours.oid.clone(),
        });
    }

    EntryMerge::Content {
        mode,
        base: base.map(|base| base.oid.clone()),
        ours: ours.oid.clone(),
        theirs: theirs.oid.clone(),
    }
}

fn is_file(mode: FileMode) -> bool {
    matches!(mode, FileMode::Regular | FileMode::Executable)
}

/// Paths that became a file on one side and a directory on the other.
fn directory_file_clashes(entries: &[(String, TreeEntry)]) -> Vec<String> {
    let files: BTreeSet<&str> = entries.iter().map(|(path, _)| path.as_str()).collect();
    let mut clashes = Vec::new();
    for (path, _) in entries {
        for (index, _) in path.match_indices('/') {
            let parent = &path[..index];
            if files.contains(parent) {
                clashes.push(parent.to_string());
                clashes.push(path.clone());
            }
        }
    }
    clashes
}

fn parse_oid(stdout: &[u8]) -> Result<ObjectId, RepositoryError> {
    let text = String::from_utf8_lossy(stdout);
    let oid = text.trim();
    if oid.is_empty() {
        return Err(RepositoryError::InvalidOutput {
            reason: "expected an object id, got empty output".to_string(),
        });
    }
    Ok(ObjectId::parse(oid)?)
}

fn command_failure(output: CommandOutput) -> RepositoryError {
    RepositoryError::CommandFailure {
        status_code: output.status_code,
        stderr: output.stderr_lossy(),
    }
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("cat-file operation failed: {0}")]
    CatFile(#[from] CatFileError),
    #[error("failed to build git command: {0}")]
    CommandFactory(#[from] CommandFactoryError),
    #[error("command execution failed: {0}")]
    Command(#[from] crate::command::CommandError),
    #[error("git command failed with status {status_code:?}: {stderr}")]
    CommandFailure {
        status_code: Option<i32>,
        stderr: String,
    },
    #[error("reference operation failed: {0}")]
    Reference(#[from] ReferenceUpdateError),
    #[error("failed to parse commit: {0}")]
    Commit(#[from] CommitParseError),
    #[error("invalid object id in git output: {0}")]
    ObjectId(#[from] ObjectIdError),
    #[error("failed to parse UTF-8 output: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("invalid git output: {reason}")]
    InvalidOutput { reason: String },
    #[error("scratch space unavailable: {0}")]
    Io(#[source] std::io::Error),
}
