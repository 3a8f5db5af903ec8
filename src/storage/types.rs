//! core type-safe wrappers around git primitives for the storage layer.

use std::fmt;

use git2::Oid;
use serde::{Deserialize, Serialize};

/// This makes sure we don't accidentally pass a blob OID where a commit OID
/// is expected. The inner Oid is only accessible within the storage module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommitId(pub(crate) Oid);

impl CommitId {
    pub(crate) fn new(oid: Oid) -> Self {
        Self(oid)
    }

    /// raw Oid (for internal use only)
    pub(crate) fn raw(&self) -> Oid {
        self.0
    }

    /// short form of the commit ID
    pub fn short(&self) -> String {
        self.0.to_string()[..7].to_string()
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A validated document id.
///
/// Document ids become file names inside the store's tree, so they have the
/// same restrictions as any tree entry: no path separators, no traversal.
///
/// Valid ids:
/// - 1-128 characters
/// - Alphanumeric, underscores, hyphens, colons, dots
/// - Cannot start with a dot or an underscore (reserved for metadata)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocId(String);

impl DocId {
    /// create a new DocId, validating the input
    pub fn new(id: impl Into<String>) -> Result<Self, InvalidNameError> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    fn validate(id: &str) -> Result<(), InvalidNameError> {
        if id.is_empty() {
            return Err(InvalidNameError::Empty);
        }

        if id.len() > 128 {
            return Err(InvalidNameError::TooLong(id.len()));
        }

        let first = id.chars().next().expect("non-empty");
        if first == '.' || first == '_' {
            return Err(InvalidNameError::InvalidStart(first));
        }

        for (i, c) in id.chars().enumerate() {
            if !c.is_ascii_alphanumeric() && !matches!(c, '_' | '-' | ':' | '.') {
                return Err(InvalidNameError::InvalidCharacter { char: c, position: i });
            }
        }

        Ok(())
    }

    /// get the string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// convert to owned String
    pub fn into_string(self) -> String {
        self.0
    }

    /// Generate a new random 128-bit id, ULID-encoded.
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string().to_lowercase())
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for DocId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A revision id: `<generation>-<body digest prefix>`.
///
/// The generation is a monotonic integer increasing with each persisted
/// write of the document; it is the tiebreaker used when no conflict
/// resolver is installed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RevId(String);

impl RevId {
    /// number of digest characters kept in the id
    const DIGEST_LEN: usize = 12;

    pub(crate) fn next(parent: Option<&RevId>, body_digest: &str) -> Self {
        let generation = parent.map(|p| p.generation()).unwrap_or(0) + 1;
        let digest: String = body_digest.chars().take(Self::DIGEST_LEN).collect();
        Self(format!("{}-{}", generation, digest))
    }

    /// parse the generation prefix; 0 for a malformed id
    pub fn generation(&self) -> u64 {
        self.0
            .split_once('-')
            .and_then(|(gen, _)| gen.parse().ok())
            .unwrap_or(0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// flags carried by a stored document record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DocumentFlags {
    /// the record is present in the store
    pub exists: bool,
    /// the current revision is a deletion tombstone
    pub deleted: bool,
    /// the body references at least one attachment blob
    pub has_attachments: bool,
}

/// a document read out of the store
#[derive(Debug, Clone)]
pub struct RawDocument {
    pub id: DocId,
    pub rev_id: RevId,
    pub sequence: u64,
    pub flags: DocumentFlags,
    pub body: Vec<u8>,
}

/// one entry in the change feed
#[derive(Debug, Clone)]
pub struct ChangeEntry {
    pub doc_id: DocId,
    pub rev_id: RevId,
    pub sequence: u64,
}

/// commit signature (author/committer info)
#[derive(Debug, Clone)]
pub struct StoreSignature {
    pub name: String,
    pub email: String,
}

impl StoreSignature {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }

    /// default signature for store-internal commits
    pub fn vellum() -> Self {
        Self::new("Vellum", "vellum@localhost")
    }

    pub(crate) fn to_git2_signature(&self) -> Result<git2::Signature<'static>, git2::Error> {
        git2::Signature::now(&self.name, &self.email)
    }
}

impl Default for StoreSignature {
    fn default() -> Self {
        Self::vellum()
    }
}

/// document versioning scheme used by the store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Versioning {
    /// one revision tree per document, conflict on stale parent
    #[default]
    RevisionTrees,
}

/// options for opening a store
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    /// create the store if it doesn't exist
    pub create: bool,
    /// reject writes
    pub read_only: bool,
    /// versioning scheme
    pub versioning: Versioning,
    /// hook for encryption at rest; opening fails when set
    pub encryption_key: Option<Vec<u8>>,
}

/// error type for invalid names (document ids, index names)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidNameError {
    Empty,
    TooLong(usize),
    InvalidStart(char),
    InvalidCharacter { char: char, position: usize },
}

impl fmt::Display for InvalidNameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "name cannot be empty"),
            Self::TooLong(len) => write!(f, "name too long: {} characters", len),
            Self::InvalidStart(c) => write!(f, "name cannot start with '{}'", c),
            Self::InvalidCharacter { char, position } => {
                write!(f, "invalid character '{}' at position {}", char, position)
            }
        }
    }
}

impl std::error::Error for InvalidNameError {}
