//! In-memory tree editing used to assemble multi-file commits.
//!
//! A [`TreeIndex`] is a flat map from full path to blob entry, loaded from
//! `git ls-tree -r` and written back through a temporary index file.
//! Directories only exist implicitly through the paths below them.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::object_id::ObjectId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    Regular,
    Executable,
    Symlink,
    Gitlink,
}

impl FileMode {
    pub fn as_octal(self) -> &'static str {
        match self {
            Self::Regular => "100644",
            Self::Executable => "100755",
            Self::Symlink => "120000",
            Self::Gitlink => "160000",
        }
    }

    pub fn from_octal(mode: &str) -> Option<Self> {
        match mode {
            "100644" | "100664" => Some(Self::Regular),
            "100755" => Some(Self::Executable),
            "120000" => Some(Self::Symlink),
            "160000" => Some(Self::Gitlink),
            _ => None,
        }
    }

    fn object_type(self) -> &'static str {
        match self {
            Self::Gitlink => "commit",
            _ => "blob",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub mode: FileMode,
    pub oid: ObjectId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeIndex {
    entries: BTreeMap<String, TreeEntry>,
}

impl TreeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (String, TreeEntry)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    pub fn get(&self, path: &str) -> Option<&TreeEntry> {
        self.entries.get(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TreeEntry)> {
        self.entries.iter()
    }

    /// Renders the entries as `git update-index -z --index-info` input.
    pub fn index_info(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (path, entry) in &self.entries {
            out.extend_from_slice(
                format!(
                    "{} {} {}\t{path}\0",
                    entry.mode.as_octal(),
                    entry.mode.object_type(),
                    entry.oid
                )
                .as_bytes(),
            );
        }
        out
    }

    pub fn create_file(
        &mut self,
        path: &str,
        oid: ObjectId,
        executable: bool,
    ) -> Result<(), IndexError> {
        let path = validate_path(path)?;
        self.ensure_free(&path)?;

        let mode = if executable {
            FileMode::Executable
        } else {
            FileMode::Regular
        };
        self.entries.insert(path, TreeEntry { mode, oid });
        Ok(())
    }

    /// Creates `path` as an empty directory by adding a `.gitkeep` blob.
    pub fn create_dir(&mut self, path: &str, empty_blob: ObjectId) -> Result<(), IndexError> {
        let path = validate_path(path)?;
        self.ensure_free(&path)?;

        self.entries.insert(
            format!("{path}/.gitkeep"),
            TreeEntry {
                mode: FileMode::Regular,
                oid: empty_blob,
            },
        );
        Ok(())
    }

    pub fn update_file(&mut self, path: &str, oid: ObjectId) -> Result<(), IndexError> {
        let path = validate_path(path)?;
        let entry = self
            .entries
            .get_mut(&path)
            .ok_or(IndexError::FileNotFound(path))?;
        entry.oid = oid;
        Ok(())
    }

    /// Moves `from` to `to`, replacing the content when `oid` is given.
    pub fn move_file(
        &mut self,
        from: &str,
        to: &str,
        oid: Option<ObjectId>,
    ) -> Result<(), IndexError> {
        let from = validate_path(from)?;
        let to = validate_path(to)?;
        if !self.entries.contains_key(&from) {
            return Err(IndexError::FileNotFound(from));
        }
        self.ensure_free(&to)?;

        let mut entry = self
            .entries
            .remove(&from)
            .ok_or_else(|| IndexError::FileNotFound(from.clone()))?;
        if let Some(oid) = oid {
            entry.oid = oid;
        }
        self.entries.insert(to, entry);
        Ok(())
    }

    pub fn delete_file(&mut self, path: &str) -> Result<(), IndexError> {
        let path = validate_path(path)?;
        self.entries
            .remove(&path)
            .map(|_| ())
            .ok_or(IndexError::FileNotFound(path))
    }

    pub fn chmod(&mut self, path: &str, executable: bool) -> Result<(), IndexError> {
        let path = validate_path(path)?;
        let entry = self
            .entries
            .get_mut(&path)
            .ok_or(IndexError::FileNotFound(path))?;
        entry.mode = if executable {
            FileMode::Executable
        } else {
            FileMode::Regular
        };
        Ok(())
    }

    fn is_dir(&self, path: &str) -> bool {
        let prefix = format!("{path}/");
        self.entries
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(existing, _)| existing.starts_with(&prefix))
    }

    fn ensure_free(&self, path: &str) -> Result<(), IndexError> {
        if self.entries.contains_key(path) {
            return Err(IndexError::FileExists(path.to_string()));
        }
        if self.is_dir(path) {
            return Err(IndexError::DirectoryExists(path.to_string()));
        }

        // A file cannot also be used as a parent directory.
        let mut parent = path;
        while let Some((head, _)) = parent.rsplit_once('/') {
            if self.entries.contains_key(head) {
                return Err(IndexError::FileExists(head.to_string()));
            }
            parent = head;
        }
        Ok(())
    }
}

fn validate_path(path: &str) -> Result<String, IndexError> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Err(IndexError::EmptyPath);
    }

    for component in trimmed.split('/') {
        match component {
            ".." => return Err(IndexError::DirectoryTraversal(path.to_string())),
            "" | "." | ".git" => return Err(IndexError::InvalidPath(path.to_string())),
            _ if component.contains('\0') || component.contains('\n') => {
                return Err(IndexError::InvalidPath(path.to_string()))
            }
            _ => {}
        }
    }

    Ok(trimmed.to_string())
}

/// Problems building the new tree. These are user-facing and reported in
/// the response rather than as transport errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IndexError {
    #[error("You must provide a file path")]
    EmptyPath,
    #[error("Path cannot include directory traversal")]
    DirectoryTraversal(String),
    #[error("invalid path: '{0}'")]
    InvalidPath(String),
    #[error("A file with this name already exists")]
    FileExists(String),
    #[error("A file with this name doesn't exist")]
    FileNotFound(String),
    #[error("A directory with this name already exists")]
    DirectoryExists(String),
    #[error("invalid base64 content for '{0}'")]
    InvalidBase64(String),
}
