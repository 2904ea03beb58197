use sha2::{Digest as _, Sha256};
use std::{sync::Arc, time::Duration};

use super::{
	AuditEntry, AuditSink, Clock, ContextId, DocumentCipher, DocumentRecord, DocumentVersion,
	Error, LockGuard, LockManager, LockTarget, MetadataStore, SecurityEvent, Severity, VersionId,
	audit,
	diff::{LineDiff, diff_lines},
	lock,
};

/// The differences between two versions of a document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionDiff {
	pub from: VersionId,
	pub to: VersionId,
	pub diff: LineDiff,
}

impl VersionDiff {
	pub fn is_identical(&self) -> bool {
		self.diff.is_empty()
	}
}

fn checksum(content: &[u8]) -> String {
	Sha256::digest(content)
		.iter()
		.map(|b| format!("{b:02x}"))
		.collect()
}

/// Append-only, encrypted version history for documents.
///
/// Every version is encrypted separately, under its own context, with the document owner's
/// key.  History is never rewritten: restoring an old version appends a copy of it as the
/// newest version.  The only way versions go away is [`DocumentVersionChain::purge_older_than`],
/// which always spares the current version.
///
/// # Example
///
/// ```rust
/// use doc_vault::{Error, LocalRootKey, Vault};
/// # fn main() -> Result<(), Error> {
/// let vault = Vault::in_memory(LocalRootKey::new(doc_vault::generate_key()));
///
/// let v1 = vault.versions.create_version("doc1", "u1", b"Dear diary", "first draft")?;
/// let v2 = vault.versions.create_version("doc1", "u1", b"Dear diary,\nToday...", "more")?;
///
/// let diff = vault.versions.compare_versions(&v1, &v2, "u1")?;
/// assert_eq!(1, diff.diff.modified);
/// assert_eq!(1, diff.diff.added);
///
/// let v3 = vault.versions.restore_version("doc1", &v1, "u1")?;
/// assert_eq!(3, v3.number);
/// assert!(vault.versions.compare_versions(&v1, &v3, "u1")?.is_identical());
/// # Ok(())
/// # }
/// ```
pub struct DocumentVersionChain {
	cipher: DocumentCipher,
	metadata: Arc<dyn MetadataStore>,
	locks: Arc<dyn LockManager>,
	audit: Arc<dyn AuditSink>,
	clock: Arc<dyn Clock>,
	lock_ttl: Duration,
}

impl std::fmt::Debug for DocumentVersionChain {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("DocumentVersionChain")
			.field("lock_ttl", &self.lock_ttl)
			.finish_non_exhaustive()
	}
}

impl DocumentVersionChain {
	pub fn new(
		cipher: DocumentCipher,
		metadata: Arc<dyn MetadataStore>,
		locks: Arc<dyn LockManager>,
		audit: Arc<dyn AuditSink>,
		clock: Arc<dyn Clock>,
		lock_ttl: Duration,
	) -> Self {
		Self {
			cipher,
			metadata,
			locks,
			audit,
			clock,
			lock_ttl,
		}
	}

	/// Store `content` as the next version of `document_id`.  The first version of a document
	/// makes `principal_id` its owner.
	///
	/// Fails with [`Error::RotationInProgress`] if the document is locked by a rotation or
	/// another write; nothing is written in that case.
	#[tracing::instrument(level = "info", skip(self, content))]
	pub fn create_version(
		&self,
		document_id: &str,
		principal_id: &str,
		content: impl AsRef<[u8]>,
		change_note: &str,
	) -> Result<VersionId, Error> {
		let _guard = self.lock(document_id)?;

		self.append(document_id, principal_id, content.as_ref(), change_note)
	}

	/// All versions of the document, newest first.
	#[tracing::instrument(level = "debug", skip(self))]
	pub fn get_history(
		&self,
		document_id: &str,
		principal_id: &str,
	) -> Result<Vec<DocumentVersion>, Error> {
		self.authorized_document(document_id, principal_id)?;

		let mut versions = self.metadata.list_versions(document_id)?;
		versions.reverse();
		Ok(versions)
	}

	/// Decrypt and verify one version's content.
	#[tracing::instrument(level = "debug", skip(self))]
	pub fn read_version(&self, version: &VersionId, principal_id: &str) -> Result<Vec<u8>, Error> {
		let document = self.authorized_document(&version.document_id, principal_id)?;

		self.read_verified(&document, version)
	}

	/// Append a copy of an old version as the newest version.
	#[tracing::instrument(level = "info", skip(self))]
	pub fn restore_version(
		&self,
		document_id: &str,
		version: &VersionId,
		principal_id: &str,
	) -> Result<VersionId, Error> {
		if version.document_id != document_id {
			return Err(Error::not_found(format!("{version} in {document_id}")));
		}

		let _guard = self.lock(document_id)?;

		let document = self.authorized_document(document_id, principal_id)?;
		let content = self.read_verified(&document, version)?;

		self.append(
			document_id,
			principal_id,
			&content,
			&format!("Restored from version {}", version.number),
		)
	}

	/// Line diff between two versions.  Reads only.
	#[tracing::instrument(level = "debug", skip(self))]
	pub fn compare_versions(
		&self,
		from: &VersionId,
		to: &VersionId,
		principal_id: &str,
	) -> Result<VersionDiff, Error> {
		let old = self.read_version(from, principal_id)?;
		let new = self.read_version(to, principal_id)?;

		Ok(VersionDiff {
			from: from.clone(),
			to: to.clone(),
			diff: diff_lines(&old, &new),
		})
	}

	/// Delete versions created more than `retention` ago, apart from the current version.
	/// Returns the versions deleted.
	#[tracing::instrument(level = "info", skip(self))]
	pub fn purge_older_than(
		&self,
		document_id: &str,
		retention: Duration,
	) -> Result<Vec<VersionId>, Error> {
		let _guard = self.lock(document_id)?;

		let document = self
			.metadata
			.get_document(document_id)?
			.ok_or_else(|| Error::not_found(format!("document {document_id}")))?;
		let cutoff = self.clock.now() - retention;

		let mut purged = Vec::new();
		for version in self.metadata.list_versions(document_id)? {
			if version.created_at >= cutoff
				|| Some(version.version_number) == document.current_version
			{
				continue;
			}

			self.cipher.discard(&version.context_id)?;
			self.metadata
				.delete_version(document_id, version.version_number)?;
			purged.push(version.id());
		}

		if !purged.is_empty() {
			let _ = audit::record(
				self.audit.as_ref(),
				AuditEntry {
					at: self.clock.now(),
					severity: Severity::Info,
					action: "versions.purged".to_string(),
					subject: document_id.to_string(),
					detail: format!("{} versions older than {}s", purged.len(), retention.as_secs()),
				},
			);
		}

		Ok(purged)
	}

	/// Let `grantee` read and write the document.  Only the owner may share.
	#[tracing::instrument(level = "info", skip(self))]
	pub fn grant_access(&self, document_id: &str, owner: &str, grantee: &str) -> Result<(), Error> {
		self.edit_sharing(document_id, owner, |d| {
			d.shared_with.insert(grantee.to_string());
		})
	}

	#[tracing::instrument(level = "info", skip(self))]
	pub fn revoke_access(&self, document_id: &str, owner: &str, grantee: &str) -> Result<(), Error> {
		self.edit_sharing(document_id, owner, |d| {
			d.shared_with.remove(grantee);
		})
	}

	fn edit_sharing(
		&self,
		document_id: &str,
		owner: &str,
		f: impl FnOnce(&mut DocumentRecord),
	) -> Result<(), Error> {
		let _guard = self.lock(document_id)?;

		let mut document = self
			.metadata
			.get_document(document_id)?
			.ok_or_else(|| Error::not_found(format!("document {document_id}")))?;

		if document.owner != owner {
			return Err(Error::access_denied(owner, document_id));
		}

		f(&mut document);
		self.metadata.put_document(document)
	}

	fn lock(&self, document_id: &str) -> Result<LockGuard, Error> {
		lock::try_lock(
			&self.locks,
			LockTarget::Document(document_id.to_string()),
			self.lock_ttl,
		)?
		.ok_or_else(|| Error::rotation_in_progress(format!("document {document_id}")))
	}

	fn authorized_document(
		&self,
		document_id: &str,
		principal_id: &str,
	) -> Result<DocumentRecord, Error> {
		let document = self
			.metadata
			.get_document(document_id)?
			.ok_or_else(|| Error::not_found(format!("document {document_id}")))?;

		if !document.can_access(principal_id) {
			return Err(Error::access_denied(principal_id, document_id));
		}

		Ok(document)
	}

	// Caller holds the document lock
	fn append(
		&self,
		document_id: &str,
		principal_id: &str,
		content: &[u8],
		change_note: &str,
	) -> Result<VersionId, Error> {
		let now = self.clock.now();
		let mut document = match self.metadata.get_document(document_id)? {
			Some(d) if !d.can_access(principal_id) => {
				return Err(Error::access_denied(principal_id, document_id));
			}
			Some(d) => d,
			None => DocumentRecord::new(document_id, principal_id, now),
		};

		let latest = self
			.metadata
			.list_versions(document_id)?
			.iter()
			.map(|v| v.version_number)
			.max()
			.unwrap_or(0)
			.max(document.current_version.unwrap_or(0));
		let number = latest
			.checked_add(1)
			.ok_or_else(|| Error::versions_exhausted(document_id))?;

		let context_id = ContextId::version(document_id, number);
		let sealed = self.cipher.seal(content, &document.owner, &context_id)?;

		let version = DocumentVersion {
			document_id: document_id.to_string(),
			version_number: number,
			context_id: sealed.context_id,
			checksum: checksum(content),
			size: content.len(),
			created_by: principal_id.to_string(),
			change_note: change_note.to_string(),
			created_at: now,
		};

		if let Err(e) = self.metadata.put_version(version) {
			let _ = self.cipher.discard(&context_id);
			return Err(e);
		}

		// Only now that the version is safely stored does the document point at it
		document.current_version = Some(number);
		self.metadata.put_document(document)?;

		let id = VersionId::new(document_id, number);
		tracing::info!(version = %id, %principal_id, "version created");
		Ok(id)
	}

	fn read_verified(&self, document: &DocumentRecord, version: &VersionId) -> Result<Vec<u8>, Error> {
		let record = self
			.metadata
			.get_version(&version.document_id, version.number)?
			.ok_or_else(|| Error::not_found(format!("version {version}")))?;

		let content = self.cipher.open(&document.owner, &record.context_id)?;

		if !constant_time_eq::constant_time_eq(checksum(&content).as_bytes(), record.checksum.as_bytes())
		{
			self.cipher.security().report(
				SecurityEvent::ChecksumMismatch,
				&document.owner,
				&version.to_string(),
				"decrypted content does not match recorded checksum",
			);
			return Err(Error::corruption(version.to_string()));
		}

		Ok(content)
	}
}
