//! The records kept in a [`MetadataStore`](super::MetadataStore).

use std::collections::BTreeSet;

use super::{KeyId, Timestamp};

pub const IV_LEN: usize = 12;
pub const SALT_LEN: usize = 32;
pub const TAG_LEN: usize = 16;

/// Names one ciphertext: either a whole document, or one version of it.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextId(String);

const VERSION_SEPARATOR: &str = "#v";

impl ContextId {
	pub fn new(id: impl Into<String>) -> Self {
		Self(id.into())
	}

	/// The context that one version of a document is encrypted under.
	pub fn version(document_id: &str, version_number: u32) -> Self {
		Self(format!("{document_id}{VERSION_SEPARATOR}{version_number}"))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	/// The document this context belongs to.
	pub fn document_id(&self) -> &str {
		match self.0.rsplit_once(VERSION_SEPARATOR) {
			Some((doc, n)) if !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()) => doc,
			_ => &self.0,
		}
	}
}

impl std::fmt::Display for ContextId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for ContextId {
	fn from(s: &str) -> Self {
		Self::new(s)
	}
}

impl From<String> for ContextId {
	fn from(s: String) -> Self {
		Self(s)
	}
}

/// The cipher suite a ciphertext was produced with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum Algorithm {
	/// ChaCha20-Poly1305 under a data key from HKDF-SHA256(master key, salt).
	#[default]
	ChaCha20Poly1305HkdfSha256,
}

impl std::fmt::Display for Algorithm {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Algorithm::ChaCha20Poly1305HkdfSha256 => f.write_str("chacha20poly1305+hkdf-sha256"),
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyState {
	/// The one key a principal encrypts new content with.
	Active,
	/// Superseded; still decrypts until its deletion schedule fires.
	DeletionScheduled,
}

/// A principal's master key version.  The key material itself lives, wrapped by the root key
/// service, in the blob store at `wrapped_blob_ref`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MasterKey {
	pub key_id: KeyId,
	pub principal_id: String,
	pub wrapped_blob_ref: String,
	pub created_at: Timestamp,
	pub last_rotated_at: Timestamp,
	pub state: KeyState,
}

/// Everything needed to decrypt exactly one ciphertext, except the master key itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptionMetadata {
	pub context_id: ContextId,
	pub principal_id: String,
	pub document_id: String,
	pub key_id: KeyId,
	pub algorithm: Algorithm,
	pub iv: [u8; IV_LEN],
	pub salt: [u8; SALT_LEN],
	pub auth_tag: [u8; TAG_LEN],
	pub blob_ref: String,
	pub created_at: Timestamp,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyDeletionSchedule {
	pub key_id: KeyId,
	pub scheduled_deletion: Timestamp,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DocumentRecord {
	pub document_id: String,
	pub owner: String,
	pub shared_with: BTreeSet<String>,
	/// Latest successfully persisted version, if any.
	pub current_version: Option<u32>,
	pub key_rotated_at: Timestamp,
	pub created_at: Timestamp,
}

impl DocumentRecord {
	pub fn new(document_id: impl Into<String>, owner: impl Into<String>, now: Timestamp) -> Self {
		Self {
			document_id: document_id.into(),
			owner: owner.into(),
			shared_with: BTreeSet::new(),
			current_version: None,
			key_rotated_at: now,
			created_at: now,
		}
	}

	pub fn can_access(&self, principal_id: &str) -> bool {
		self.owner == principal_id || self.shared_with.contains(principal_id)
	}
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionId {
	pub document_id: String,
	pub number: u32,
}

impl VersionId {
	pub fn new(document_id: impl Into<String>, number: u32) -> Self {
		Self {
			document_id: document_id.into(),
			number,
		}
	}

	pub fn context_id(&self) -> ContextId {
		ContextId::version(&self.document_id, self.number)
	}
}

impl std::fmt::Display for VersionId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}@v{}", self.document_id, self.number)
	}
}

/// One immutable entry in a document's history.  Its encryption metadata is stored under
/// `context_id`, and is replaced wholesale whenever the content is re-encrypted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DocumentVersion {
	pub document_id: String,
	pub version_number: u32,
	pub context_id: ContextId,
	/// Hex SHA-256 of the plaintext.
	pub checksum: String,
	pub size: usize,
	pub created_by: String,
	pub change_note: String,
	pub created_at: Timestamp,
}

impl DocumentVersion {
	pub fn id(&self) -> VersionId {
		VersionId::new(self.document_id.clone(), self.version_number)
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
	Info,
	Warning,
	Critical,
}

impl std::fmt::Display for Severity {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(match self {
			Severity::Info => "INFO",
			Severity::Warning => "WARNING",
			Severity::Critical => "CRITICAL",
		})
	}
}
