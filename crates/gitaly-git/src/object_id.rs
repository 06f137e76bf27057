//! object id and object hash primitives.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectHash {
    Sha1,
    Sha256,
}

impl ObjectHash {
    pub const fn hex_len(self) -> usize {
        match self {
            Self::Sha1 => 40,
            Self::Sha256 => 64,
        }
    }

    /// The all-zero id git uses for "no object" in ref updates and hooks.
    pub fn zero_oid(self) -> ObjectId {
        ObjectId {
            hex: "0".repeat(self.hex_len()),
            hash: self,
        }
    }

    /// The id of the empty tree.
    pub fn empty_tree(self) -> ObjectId {
        let hex = match self {
            Self::Sha1 => "4b825dc642cb6eb9a060e54bf8d69288fbee4904",
            Self::Sha256 => "6ef19b41225c5369f1c104d45d8d85efa9b057b53b14b4b9b939dd74decc5321",
        };
        ObjectId {
            hex: hex.to_string(),
            hash: self,
        }
    }

    fn from_hex_len(len: usize) -> Option<Self> {
        match len {
            40 => Some(Self::Sha1),
            64 => Some(Self::Sha256),
            _ => None,
        }
    }
}

impl fmt::Display for ObjectHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha1 => f.write_str("sha1"),
            Self::Sha256 => f.write_str("sha256"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectId {
    hex: String,
    hash: ObjectHash,
}

impl ObjectId {
    pub fn new(value: impl Into<String>, hash: ObjectHash) -> Result<Self, ObjectIdError> {
        let hex = value.into();
        let expected = hash.hex_len();
        let actual = hex.len();

        if actual != expected {
            return Err(ObjectIdError::InvalidLength {
                hash,
                expected,
                actual,
            });
        }

        validate_hex(&hex)?;
        Ok(Self { hex, hash })
    }

    /// Parses an id of either hash length, as printed by git.
    pub fn parse(value: &str) -> Result<Self, ObjectIdError> {
        let value = value.trim();
        let hash = ObjectHash::from_hex_len(value.len())
            .ok_or(ObjectIdError::UnknownLength(value.len()))?;
        Self::new(value, hash)
    }

    pub fn as_str(&self) -> &str {
        &self.hex
    }

    pub fn hash(&self) -> ObjectHash {
        self.hash
    }

    pub fn is_zero(&self) -> bool {
        self.hex.bytes().all(|byte| byte == b'0')
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex)
    }
}

fn validate_hex(hex: &str) -> Result<(), ObjectIdError> {
    for (index, character) in hex.chars().enumerate() {
        if !matches!(character, '0'..='9' | 'a'..='f') {
            return Err(ObjectIdError::InvalidHexCharacter { index, character });
        }
    }
    Ok(())
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ObjectIdError {
    #[error("invalid object id length for {hash}: expected {expected}, got {actual}")]
    InvalidLength {
        hash: ObjectHash,
        expected: usize,
        actual: usize,
    },
    #[error("object id length {0} matches no known hash")]
    UnknownLength(usize),
    #[error("invalid lowercase hex character `{character}` at index {index}")]
    InvalidHexCharacter { index: usize, character: char },
}
