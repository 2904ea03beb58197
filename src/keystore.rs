use std::{sync::Arc, time::Duration};

use super::{
	BlobStore, Clock, Error, Key, KeyDeletionSchedule, KeyId, KeyState, MasterKey, MetadataStore,
	RootKeyService, generate_key,
};

/// Access to principals' master keys.
///
/// Raw key material handed out by a [`KeyStore`] is meant to live for a single encrypt or
/// decrypt call, and then be dropped.
pub trait KeyStore: Send + Sync {
	/// The principal's active master key, minting one if they don't have one yet.
	fn get_or_create_master_key(&self, principal_id: &str) -> Result<(KeyId, Key), Error>;

	/// Wrap fresh key material for `principal_id` and store it as a new, *inactive* key
	/// version.  It becomes active via [`MetadataStore::activate_master_key`].
	fn wrap_and_store(&self, principal_id: &str, raw: &Key) -> Result<KeyId, Error>;

	/// Material for exactly `key_id`, whether active or scheduled for deletion.  A deleted key
	/// is [`Error::NotFound`].
	fn unwrap(&self, key_id: &KeyId) -> Result<Key, Error>;

	/// Stop `key_id` being used for new encryptions, and mark it for deletion once `grace`
	/// has passed.  Scheduling an already-scheduled key moves its deadline.
	fn schedule_deletion(&self, key_id: &KeyId, grace: Duration) -> Result<(), Error>;

	/// Remove the key material and record for good.
	fn destroy(&self, key_id: &KeyId) -> Result<(), Error>;
}

/// A [`KeyStore`] that keeps root-wrapped key blobs in a [`BlobStore`] and key records in a
/// [`MetadataStore`].
#[derive(Clone)]
pub struct ManagedKeyStore {
	root: Arc<dyn RootKeyService>,
	blobs: Arc<dyn BlobStore>,
	records: Arc<dyn MetadataStore>,
	clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ManagedKeyStore {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ManagedKeyStore")
			.field("clock", &self.clock)
			.finish_non_exhaustive()
	}
}

fn blob_address(key_id: &KeyId) -> String {
	format!("keys/{key_id}")
}

impl ManagedKeyStore {
	pub fn new(
		root: Arc<dyn RootKeyService>,
		blobs: Arc<dyn BlobStore>,
		records: Arc<dyn MetadataStore>,
		clock: Arc<dyn Clock>,
	) -> Self {
		Self {
			root,
			blobs,
			records,
			clock,
		}
	}

	fn store_wrapped(&self, raw: &Key) -> Result<(KeyId, String), Error> {
		let key_id = KeyId::generate();
		let address = blob_address(&key_id);
		let wrapped = self.root.wrap(raw)?;
		self.blobs.put(&address, wrapped)?;

		Ok((key_id, address))
	}
}

impl KeyStore for ManagedKeyStore {
	#[tracing::instrument(level = "debug", skip(self))]
	fn get_or_create_master_key(&self, principal_id: &str) -> Result<(KeyId, Key), Error> {
		if let Some(active) = self.records.active_master_key(principal_id)? {
			let key = self.unwrap(&active.key_id)?;
			return Ok((active.key_id, key));
		}

		let raw = generate_key();
		let (key_id, address) = self.store_wrapped(&raw)?;
		let now = self.clock.now();

		let winner = self.records.create_master_key_if_absent(MasterKey {
			key_id,
			principal_id: principal_id.to_string(),
			wrapped_blob_ref: address.clone(),
			created_at: now,
			last_rotated_at: now,
			state: KeyState::Active,
		})?;

		if winner.key_id == key_id {
			tracing::info!(target: "audit", %principal_id, %key_id, "master key created");
			Ok((key_id, raw))
		} else {
			// Someone else got there first; theirs is the one true active key
			tracing::debug!(%principal_id, lost=%key_id, won=%winner.key_id, "lost master key creation race");
			self.blobs.delete(&address)?;
			let key = self.unwrap(&winner.key_id)?;
			Ok((winner.key_id, key))
		}
	}

	#[tracing::instrument(level = "debug", skip(self, raw))]
	fn wrap_and_store(&self, principal_id: &str, raw: &Key) -> Result<KeyId, Error> {
		let (key_id, address) = self.store_wrapped(raw)?;
		let now = self.clock.now();

		self.records.put_master_key(MasterKey {
			key_id,
			principal_id: principal_id.to_string(),
			wrapped_blob_ref: address,
			created_at: now,
			last_rotated_at: now,
			state: KeyState::DeletionScheduled,
		})?;

		Ok(key_id)
	}

	#[tracing::instrument(level = "trace", skip(self))]
	fn unwrap(&self, key_id: &KeyId) -> Result<Key, Error> {
		let record = self
			.records
			.get_master_key(key_id)?
			.ok_or_else(|| Error::not_found(format!("master key {key_id}")))?;

		let wrapped = self.blobs.get(&record.wrapped_blob_ref)?;
		self.root.unwrap(&wrapped)
	}

	#[tracing::instrument(level = "debug", skip(self))]
	fn schedule_deletion(&self, key_id: &KeyId, grace: Duration) -> Result<(), Error> {
		self.records.mark_deletion_scheduled(key_id)?;

		let scheduled_deletion = self.clock.now() + grace;
		self.records.put_deletion_schedule(KeyDeletionSchedule {
			key_id: *key_id,
			scheduled_deletion,
		})?;

		tracing::info!(target: "audit", %key_id, %scheduled_deletion, "master key deletion scheduled");
		Ok(())
	}

	#[tracing::instrument(level = "debug", skip(self))]
	fn destroy(&self, key_id: &KeyId) -> Result<(), Error> {
		if let Some(record) = self.records.get_master_key(key_id)? {
			self.blobs.delete(&record.wrapped_blob_ref)?;
			self.records.delete_master_key(key_id)?;
		}
		self.records.delete_deletion_schedule(key_id)?;

		tracing::info!(target: "audit", %key_id, "master key destroyed");
		Ok(())
	}
}
