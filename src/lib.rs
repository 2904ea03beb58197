//! Per-principal document encryption, with key rotation, key age alerting, and an encrypted
//! version history.
//!
//! Every principal (a user, a service account, ...) has a *master key*, which is only ever
//! stored wrapped by a root key (see [`RootKeyService`]).  Document content is never encrypted
//! with the master key directly: each encryption derives a one-off data key from the master key
//! and a fresh random salt, and seals the content with ChaCha20-Poly1305.  The document's
//! *context* (its ID, or its ID and version number) is bound in as associated data, so a
//! ciphertext can't be passed off as belonging to some other document.
//!
//! The pieces:
//!
//! * [`DocumentCipher`] encrypts and decrypts content, and keeps the [`EncryptionMetadata`]
//!   that says how to decrypt each ciphertext.
//! * [`KeyStore`] creates, wraps, unwraps and destroys master keys.
//! * [`KeyRotationOrchestrator`] replaces master keys and data keys on a schedule, moving every
//!   affected ciphertext over, and deletes superseded keys once nothing needs them.
//! * [`KeyAgingMonitor`] alerts when keys or ciphertexts go too long without rotation.
//! * [`DocumentVersionChain`] keeps an append-only history of each document's content, every
//!   version encrypted separately.
//!
//! The easiest way to get all of them wired together is a [`Vault`].  Storage, locking, audit
//! and alerting all sit behind traits; in-memory implementations of each are included.
//!
//! # Failures
//!
//! Anything that might tell a caller *why* they can't read a document (it doesn't exist, it isn't
//! theirs, it has been tampered with) should be shown to them only as
//! [`Error::public_message`].  Integrity and corruption failures are reported as security
//! events (see [`SecurityEvents`]) as well as being returned.

mod audit;
mod cbor;
mod cipher;
mod clock;
mod config;
pub mod diff;
mod error;
mod kdf;
mod key;
mod key_id;
mod keystore;
mod lock;
mod monitor;
mod records;
mod root_key;
mod rotation;
pub mod scheduler;
mod store;
mod vault;
mod versions;

#[cfg(test)]
mod testing;

pub use audit::{
	AlertChannel, AuditEntry, AuditSink, MemoryAlertChannel, MemoryAuditLog, MemoryPager,
	PagingChannel, SecurityEvent, SecurityEvents, SentAlert,
};
pub use cipher::DocumentCipher;
pub use clock::{Clock, ManualClock, SystemClock, Timestamp, days};
pub use config::Config;
pub use error::Error;
pub use key::{Key, generate_key};
pub use key_id::KeyId;
pub use keystore::{KeyStore, ManagedKeyStore};
pub use lock::{LockGuard, LockManager, LockTarget, MemoryLockManager, try_lock};
pub use monitor::{AgedItem, AgingFinding, AgingReport, KeyAgingMonitor};
pub use records::{
	Algorithm, ContextId, DocumentRecord, DocumentVersion, EncryptionMetadata,
	KeyDeletionSchedule, KeyState, MasterKey, Severity, VersionId,
};
pub use root_key::{LocalRootKey, RootKeyService};
pub use rotation::{
	DeletionReport, ItemFailure, KeyRotationOrchestrator, RotationOutcome, RotationSummary,
	SweepReport,
};
pub use store::{BlobStore, MemoryBlobStore, MemoryMetadataStore, MetadataStore};
pub use vault::{Vault, VaultBuilder};
pub use versions::{DocumentVersionChain, VersionDiff};
