//! Interfaces to the blob store and the metadata/record store, plus in-memory implementations.
//!
//! Production deployments back these with whatever database and object store they already run;
//! the in-memory versions are complete enough to run a single-process service and all the tests.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

use super::{
	ContextId, DocumentRecord, DocumentVersion, EncryptionMetadata, Error, KeyDeletionSchedule,
	KeyId, KeyState, MasterKey, Timestamp, records::IV_LEN,
};

/// Opaque bytes addressed by a string.
pub trait BlobStore: Send + Sync {
	fn put(&self, address: &str, bytes: Vec<u8>) -> Result<(), Error>;

	/// Fails with [`Error::NotFound`] if nothing is stored at `address`.
	fn get(&self, address: &str) -> Result<Vec<u8>, Error>;

	/// Deleting a missing blob is not an error.
	fn delete(&self, address: &str) -> Result<(), Error>;
}

/// Durable records for keys, ciphertext metadata, documents and versions.
pub trait MetadataStore: Send + Sync {
	fn get_master_key(&self, key_id: &KeyId) -> Result<Option<MasterKey>, Error>;

	fn active_master_key(&self, principal_id: &str) -> Result<Option<MasterKey>, Error>;

	/// Store `key` as the principal's active key unless they already have one, in which case
	/// the existing active key is returned and `key` is discarded.
	fn create_master_key_if_absent(&self, key: MasterKey) -> Result<MasterKey, Error>;

	/// Insert a key record that is not (yet) active.
	fn put_master_key(&self, key: MasterKey) -> Result<(), Error>;

	/// Make `key_id` the principal's active key, stamping it as rotated at `at`, and move the
	/// previously active key (if any) to [`KeyState::DeletionScheduled`].  Returns the previously
	/// active key.
	fn activate_master_key(
		&self,
		principal_id: &str,
		key_id: &KeyId,
		at: Timestamp,
	) -> Result<Option<MasterKey>, Error>;

	fn mark_deletion_scheduled(&self, key_id: &KeyId) -> Result<(), Error>;

	fn list_master_keys(&self) -> Result<Vec<MasterKey>, Error>;

	fn delete_master_key(&self, key_id: &KeyId) -> Result<(), Error>;

	fn get_metadata(&self, context_id: &ContextId) -> Result<Option<EncryptionMetadata>, Error>;

	fn put_metadata(&self, metadata: EncryptionMetadata) -> Result<(), Error>;

	/// Replace the metadata for `context_id` only if its current IV is still `expected_iv`.
	/// Returns whether the swap happened.
	fn compare_and_swap_metadata(
		&self,
		context_id: &ContextId,
		expected_iv: &[u8; IV_LEN],
		new: EncryptionMetadata,
	) -> Result<bool, Error>;

	fn delete_metadata(&self, context_id: &ContextId) -> Result<(), Error>;

	fn list_metadata(&self) -> Result<Vec<EncryptionMetadata>, Error>;

	fn metadata_for_principal(&self, principal_id: &str)
	-> Result<Vec<EncryptionMetadata>, Error>;

	fn metadata_for_document(&self, document_id: &str) -> Result<Vec<EncryptionMetadata>, Error>;

	fn count_metadata_for_key(&self, key_id: &KeyId) -> Result<usize, Error>;

	fn get_document(&self, document_id: &str) -> Result<Option<DocumentRecord>, Error>;

	fn put_document(&self, document: DocumentRecord) -> Result<(), Error>;

	fn list_documents(&self) -> Result<Vec<DocumentRecord>, Error>;

	fn get_version(
		&self,
		document_id: &str,
		version_number: u32,
	) -> Result<Option<DocumentVersion>, Error>;

	fn put_version(&self, version: DocumentVersion) -> Result<(), Error>;

	/// All versions of a document, oldest first.
	fn list_versions(&self, document_id: &str) -> Result<Vec<DocumentVersion>, Error>;

	fn delete_version(&self, document_id: &str, version_number: u32) -> Result<(), Error>;

	/// Insert or overwrite; the latest call for a key wins.
	fn put_deletion_schedule(&self, schedule: KeyDeletionSchedule) -> Result<(), Error>;

	fn list_deletion_schedules(&self) -> Result<Vec<KeyDeletionSchedule>, Error>;

	fn delete_deletion_schedule(&self, key_id: &KeyId) -> Result<(), Error>;
}

#[derive(Debug, Default)]
pub struct MemoryBlobStore {
	blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn len(&self) -> usize {
		self.blobs.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.blobs.read().is_empty()
	}

	/// Mutate a stored blob in place.  Exists for exercising tamper detection.
	pub fn tamper(&self, address: &str, f: impl FnOnce(&mut Vec<u8>)) -> bool {
		match self.blobs.write().get_mut(address) {
			Some(b) => {
				f(b);
				true
			}
			None => false,
		}
	}
}

impl BlobStore for MemoryBlobStore {
	fn put(&self, address: &str, bytes: Vec<u8>) -> Result<(), Error> {
		self.blobs.write().insert(address.to_string(), bytes);
		Ok(())
	}

	fn get(&self, address: &str) -> Result<Vec<u8>, Error> {
		self.blobs
			.read()
			.get(address)
			.cloned()
			.ok_or_else(|| Error::not_found(format!("blob {address}")))
	}

	fn delete(&self, address: &str) -> Result<(), Error> {
		self.blobs.write().remove(address);
		Ok(())
	}
}

#[derive(Debug, Default)]
struct Records {
	keys: HashMap<KeyId, MasterKey>,
	metadata: BTreeMap<ContextId, EncryptionMetadata>,
	documents: BTreeMap<String, DocumentRecord>,
	versions: BTreeMap<(String, u32), DocumentVersion>,
	schedules: HashMap<KeyId, KeyDeletionSchedule>,
}

impl Records {
	fn active_key(&self, principal_id: &str) -> Option<&MasterKey> {
		self.keys
			.values()
			.find(|k| k.principal_id == principal_id && k.state == KeyState::Active)
	}
}

#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
	records: RwLock<Records>,
}

impl MemoryMetadataStore {
	pub fn new() -> Self {
		Self::default()
	}
}

impl MetadataStore for MemoryMetadataStore {
	fn get_master_key(&self, key_id: &KeyId) -> Result<Option<MasterKey>, Error> {
		Ok(self.records.read().keys.get(key_id).cloned())
	}

	fn active_master_key(&self, principal_id: &str) -> Result<Option<MasterKey>, Error> {
		Ok(self.records.read().active_key(principal_id).cloned())
	}

	fn create_master_key_if_absent(&self, key: MasterKey) -> Result<MasterKey, Error> {
		let mut records = self.records.write();

		if let Some(existing) = records.active_key(&key.principal_id) {
			return Ok(existing.clone());
		}

		let key = MasterKey {
			state: KeyState::Active,
			..key
		};
		records.keys.insert(key.key_id, key.clone());
		Ok(key)
	}

	fn put_master_key(&self, key: MasterKey) -> Result<(), Error> {
		self.records.write().keys.insert(key.key_id, key);
		Ok(())
	}

	fn activate_master_key(
		&self,
		principal_id: &str,
		key_id: &KeyId,
		at: Timestamp,
	) -> Result<Option<MasterKey>, Error> {
		let mut records = self.records.write();

		match records.keys.get(key_id) {
			Some(k) if k.principal_id == principal_id => (),
			_ => return Err(Error::not_found(format!("master key {key_id}"))),
		}

		let previous = records
			.keys
			.values_mut()
			.find(|k| {
				k.principal_id == principal_id && k.state == KeyState::Active && k.key_id != *key_id
			})
			.map(|k| {
				k.state = KeyState::DeletionScheduled;
				k.clone()
			});

		if let Some(k) = records.keys.get_mut(key_id) {
			k.state = KeyState::Active;
			k.last_rotated_at = at;
		}

		Ok(previous)
	}

	fn mark_deletion_scheduled(&self, key_id: &KeyId) -> Result<(), Error> {
		match self.records.write().keys.get_mut(key_id) {
			Some(k) => {
				k.state = KeyState::DeletionScheduled;
				Ok(())
			}
			None => Err(Error::not_found(format!("master key {key_id}"))),
		}
	}

	fn list_master_keys(&self) -> Result<Vec<MasterKey>, Error> {
		Ok(self.records.read().keys.values().cloned().collect())
	}

	fn delete_master_key(&self, key_id: &KeyId) -> Result<(), Error> {
		self.records.write().keys.remove(key_id);
		Ok(())
	}

	fn get_metadata(&self, context_id: &ContextId) -> Result<Option<EncryptionMetadata>, Error> {
		Ok(self.records.read().metadata.get(context_id).cloned())
	}

	fn put_metadata(&self, metadata: EncryptionMetadata) -> Result<(), Error> {
		self.records
			.write()
			.metadata
			.insert(metadata.context_id.clone(), metadata);
		Ok(())
	}

	fn compare_and_swap_metadata(
		&self,
		context_id: &ContextId,
		expected_iv: &[u8; IV_LEN],
		new: EncryptionMetadata,
	) -> Result<bool, Error> {
		let mut records = self.records.write();

		match records.metadata.get_mut(context_id) {
			Some(current) if constant_time_eq::constant_time_eq_n(&current.iv, expected_iv) => {
				*current = new;
				Ok(true)
			}
			_ => Ok(false),
		}
	}

	fn delete_metadata(&self, context_id: &ContextId) -> Result<(), Error> {
		self.records.write().metadata.remove(context_id);
		Ok(())
	}

	fn list_metadata(&self) -> Result<Vec<EncryptionMetadata>, Error> {
		Ok(self.records.read().metadata.values().cloned().collect())
	}

	fn metadata_for_principal(
		&self,
		principal_id: &str,
	) -> Result<Vec<EncryptionMetadata>, Error> {
		Ok(self
			.records
			.read()
			.metadata
			.values()
			.filter(|m| m.principal_id == principal_id)
			.cloned()
			.collect())
	}

	fn metadata_for_document(&self, document_id: &str) -> Result<Vec<EncryptionMetadata>, Error> {
		Ok(self
			.records
			.read()
			.metadata
			.values()
			.filter(|m| m.document_id == document_id)
			.cloned()
			.collect())
	}

	fn count_metadata_for_key(&self, key_id: &KeyId) -> Result<usize, Error> {
		Ok(self
			.records
			.read()
			.metadata
			.values()
			.filter(|m| m.key_id == *key_id)
			.count())
	}

	fn get_document(&self, document_id: &str) -> Result<Option<DocumentRecord>, Error> {
		Ok(self.records.read().documents.get(document_id).cloned())
	}

	fn put_document(&self, document: DocumentRecord) -> Result<(), Error> {
		self.records
			.write()
			.documents
			.insert(document.document_id.clone(), document);
		Ok(())
	}

	fn list_documents(&self) -> Result<Vec<DocumentRecord>, Error> {
		Ok(self.records.read().documents.values().cloned().collect())
	}

	fn get_version(
		&self,
		document_id: &str,
		version_number: u32,
	) -> Result<Option<DocumentVersion>, Error> {
		Ok(self
			.records
			.read()
			.versions
			.get(&(document_id.to_string(), version_number))
			.cloned())
	}

	fn put_version(&self, version: DocumentVersion) -> Result<(), Error> {
		self.records.write().versions.insert(
			(version.document_id.clone(), version.version_number),
			version,
		);
		Ok(())
	}

	fn list_versions(&self, document_id: &str) -> Result<Vec<DocumentVersion>, Error> {
		let start = (document_id.to_string(), 0);
		let end = (document_id.to_string(), u32::MAX);

		Ok(self
			.records
			.read()
			.versions
			.range(start..=end)
			.map(|(_, v)| v.clone())
			.collect())
	}

	fn delete_version(&self, document_id: &str, version_number: u32) -> Result<(), Error> {
		self.records
			.write()
			.versions
			.remove(&(document_id.to_string(), version_number));
		Ok(())
	}

	fn put_deletion_schedule(&self, schedule: KeyDeletionSchedule) -> Result<(), Error> {
		self.records
			.write()
			.schedules
			.insert(schedule.key_id, schedule);
		Ok(())
	}

	fn list_deletion_schedules(&self) -> Result<Vec<KeyDeletionSchedule>, Error> {
		Ok(self.records.read().schedules.values().cloned().collect())
	}

	fn delete_deletion_schedule(&self, key_id: &KeyId) -> Result<(), Error> {
		self.records.write().schedules.remove(key_id);
		Ok(())
	}
}
