//! Commit objects: identities and parsing of raw commit content.

use thiserror::Error;

use crate::object_id::{ObjectId, ObjectIdError};

/// An author, committer or tagger identity with its timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub name: String,
    pub email: String,
    /// Seconds since the Unix epoch.
    pub time: i64,
    /// Offset in git's `+hhmm` notation.
    pub timezone: String,
}

impl Signature {
    pub fn new(name: impl Into<String>, email: impl Into<String>, time: i64) -> Self {
        Self {
            name: sanitize(&name.into()),
            email: sanitize(&email.into()),
            time,
            timezone: "+0000".to_string(),
        }
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }

    /// Value for `GIT_AUTHOR_DATE` and friends, in git's internal format.
    pub fn git_date(&self) -> String {
        format!("{} {}", self.time, self.timezone)
    }

    /// The `Name <email> time tz` line used in commit and tag headers.
    pub fn to_ident(&self) -> String {
        format!("{} <{}> {}", self.name, self.email, self.git_date())
    }

    pub fn parse(ident: &str) -> Result<Self, CommitParseError> {
        let invalid = || CommitParseError::InvalidSignature(ident.to_string());
        let open = ident.find('<').ok_or_else(invalid)?;
        let close = ident[open..].find('>').map(|idx| open + idx).ok_or_else(invalid)?;

        let name = ident[..open].trim().to_string();
        let email = ident[open + 1..close].to_string();
        let mut when = ident[close + 1..].split_whitespace();
        let time = when
            .next()
            .and_then(|value| value.parse().ok())
            .ok_or_else(invalid)?;
        let timezone = when.next().unwrap_or("+0000").to_string();

        Ok(Self {
            name,
            email,
            time,
            timezone,
        })
    }
}

/// git strips these from identities; doing it up front keeps
/// `commit-tree` from rejecting them.
fn sanitize(value: &str) -> String {
    value
        .chars()
        .filter(|character| !matches!(character, '<' | '>' | '\n' | '\0'))
        .collect::<String>()
        .trim()
        .to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub id: ObjectId,
    pub tree: ObjectId,
    pub parents: Vec<ObjectId>,
    pub author: Signature,
    pub committer: Signature,
    pub message: Vec<u8>,
}

impl Commit {
    pub fn parse(id: ObjectId, raw: &[u8]) -> Result<Self, CommitParseError> {
        let split = raw
            .windows(2)
            .position(|window| window == b"\n\n")
            .map_or((raw, &[][..]), |idx| (&raw[..idx], &raw[idx + 2..]));
        let (headers, message) = split;
        let headers = std::str::from_utf8(headers).map_err(|_| CommitParseError::NonUtf8Header)?;

        let mut tree = None;
        let mut parents = Vec::new();
        let mut author = None;
        let mut committer = None;

        for line in headers.lines() {
            // Continuation lines belong to multi-line headers like gpgsig.
            if line.starts_with(' ') {
                continue;
            }
            let Some((key, value)) = line.split_once(' ') else {
                continue;
            };
            match key {
                "tree" => tree = Some(ObjectId::parse(value)?),
                "parent" => parents.push(ObjectId::parse(value)?),
                "author" => author = Some(Signature::parse(value)?),
                "committer" => committer = Some(Signature::parse(value)?),
                _ => {}
            }
        }

        Ok(Self {
            id,
            tree: tree.ok_or(CommitParseError::MissingHeader("tree"))?,
            parents,
            author: author.ok_or(CommitParseError::MissingHeader("author"))?,
            committer: committer.ok_or(CommitParseError::MissingHeader("committer"))?,
            message: message.to_vec(),
        })
    }

    pub fn subject(&self) -> &[u8] {
        let end = self
            .message
            .iter()
            .position(|byte| *byte == b'\n')
            .unwrap_or(self.message.len());
        &self.message[..end]
    }

    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommitParseError {
    #[error("commit header is not valid UTF-8")]
    NonUtf8Header,
    #[error("commit is missing the `{0}` header")]
    MissingHeader(&'static str),
    #[error("invalid signature `{0}`")]
    InvalidSignature(String),
    #[error(transparent)]
    ObjectId(#[from] ObjectIdError),
}
