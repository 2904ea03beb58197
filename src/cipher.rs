use chacha20poly1305::{
	ChaCha20Poly1305, KeyInit as _, Tag,
	aead::AeadInPlace as _,
};
use std::sync::Arc;

use super::{
	Algorithm, BlobStore, Clock, ContextId, EncryptionMetadata, Error, Key, KeyId, KeyStore,
	MetadataStore, SecurityEvent, SecurityEvents,
	kdf,
	key::random_bytes,
	records::{IV_LEN, SALT_LEN, TAG_LEN},
};

/// Encrypts and decrypts document content for a principal.
///
/// Every encryption draws a fresh salt and IV, derives a one-off data key from the principal's
/// active master key and that salt, and seals the plaintext with ChaCha20-Poly1305.  The
/// context ID, key ID, IV and salt are all bound in as associated data, so a ciphertext can
/// only be decrypted under the exact metadata it was produced with: move it to a different
/// context, or point it at a different key, and decryption fails.
///
/// Neither master keys nor data keys outlive the call that needed them.
///
/// # Example
///
/// ```rust
/// use doc_vault::{ContextId, Error, LocalRootKey, Vault};
/// # fn main() -> Result<(), Error> {
/// let vault = Vault::in_memory(LocalRootKey::new(doc_vault::generate_key()));
///
/// let context = ContextId::new("doc1");
/// vault.cipher.seal(b"quarterly numbers", "u1", &context)?;
///
/// assert_eq!(b"quarterly numbers".to_vec(), vault.cipher.open("u1", &context)?);
///
/// // Somebody else's principal ID gets nowhere
/// assert!(matches!(vault.cipher.open("u2", &context), Err(Error::AccessDenied { .. })));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DocumentCipher {
	keys: Arc<dyn KeyStore>,
	metadata: Arc<dyn MetadataStore>,
	blobs: Arc<dyn BlobStore>,
	clock: Arc<dyn Clock>,
	security: SecurityEvents,
}

impl std::fmt::Debug for DocumentCipher {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("DocumentCipher")
			.field("security", &self.security)
			.finish_non_exhaustive()
	}
}

fn aad(context_id: &ContextId, key_id: &KeyId, iv: &[u8; IV_LEN], salt: &[u8; SALT_LEN]) -> Vec<u8> {
	let mut aad = Vec::<u8>::new();
	aad.extend_from_slice(context_id.as_str().as_bytes());
	// Context IDs are free text; the separator stops "a" + "bc" colliding with "ab" + "c"
	aad.push(0);
	aad.extend_from_slice(key_id.as_bytes());
	aad.extend_from_slice(iv);
	aad.extend_from_slice(salt);
	aad
}

fn blob_address(context_id: &ContextId, iv: &[u8; IV_LEN]) -> String {
	let iv_hex: String = iv.iter().map(|b| format!("{b:02x}")).collect();
	format!("blob/{context_id}/{iv_hex}")
}

impl DocumentCipher {
	pub fn new(
		keys: Arc<dyn KeyStore>,
		metadata: Arc<dyn MetadataStore>,
		blobs: Arc<dyn BlobStore>,
		clock: Arc<dyn Clock>,
		security: SecurityEvents,
	) -> Self {
		Self {
			keys,
			metadata,
			blobs,
			clock,
			security,
		}
	}

	pub(crate) fn security(&self) -> &SecurityEvents {
		&self.security
	}

	/// Encrypt `plaintext` for `principal_id` under `context_id`, using (and if necessary,
	/// creating) the principal's active master key.
	///
	/// Nothing is persisted; see [`DocumentCipher::seal`] for that.
	#[tracing::instrument(level = "debug", skip(self, plaintext))]
	pub fn encrypt(
		&self,
		plaintext: impl AsRef<[u8]>,
		principal_id: &str,
		context_id: &ContextId,
	) -> Result<(Vec<u8>, EncryptionMetadata), Error> {
		let (key_id, master) = self.keys.get_or_create_master_key(principal_id)?;

		self.encrypt_under(plaintext.as_ref(), principal_id, context_id, key_id, &master)
	}

	/// Encrypt with an explicitly supplied master key version.  Rotation uses this to
	/// re-encrypt under a key that isn't active yet.
	pub(crate) fn encrypt_under(
		&self,
		plaintext: &[u8],
		principal_id: &str,
		context_id: &ContextId,
		key_id: KeyId,
		master: &Key,
	) -> Result<(Vec<u8>, EncryptionMetadata), Error> {
		let salt: [u8; SALT_LEN] = random_bytes();
		let iv: [u8; IV_LEN] = random_bytes();

		let data_key = kdf::derive_data_key(master, &salt);
		let cipher = ChaCha20Poly1305::new(data_key.expose_secret().into());

		let mut buffer = plaintext.to_vec();
		let tag = cipher
			.encrypt_in_place_detached((&iv).into(), &aad(context_id, &key_id, &iv, &salt), &mut buffer)
			.map_err(|_| Error::Encryption)?;

		let mut auth_tag = [0u8; TAG_LEN];
		auth_tag.copy_from_slice(tag.as_slice());

		tracing::debug!(%key_id, %context_id, "Encrypting");

		Ok((
			buffer,
			EncryptionMetadata {
				context_id: context_id.clone(),
				principal_id: principal_id.to_string(),
				document_id: context_id.document_id().to_string(),
				key_id,
				algorithm: Algorithm::ChaCha20Poly1305HkdfSha256,
				iv,
				salt,
				auth_tag,
				blob_ref: blob_address(context_id, &iv),
				created_at: self.clock.now(),
			},
		))
	}

	/// Decrypt a ciphertext previously produced for `principal_id` under `context_id`, using the
	/// stored metadata for that context.
	///
	/// # Errors
	///
	/// * [`Error::NotFound`] if there is no metadata for the context, or its key has been deleted.
	/// * [`Error::AccessDenied`] if the context's content does not belong to `principal_id`.
	/// * [`Error::Integrity`] if the ciphertext, tag, or metadata has been tampered with.
	#[tracing::instrument(level = "debug", skip(self, ciphertext))]
	pub fn decrypt(
		&self,
		ciphertext: impl AsRef<[u8]>,
		principal_id: &str,
		context_id: &ContextId,
	) -> Result<Vec<u8>, Error> {
		let metadata = self.metadata_for(principal_id, context_id)?;

		self.decrypt_with(ciphertext, &metadata)
	}

	/// Decrypt using explicitly supplied metadata.  Deterministic: the same ciphertext and
	/// metadata always yield the same plaintext, as long as the key still exists.
	#[tracing::instrument(level = "debug", skip(self, ciphertext, metadata), fields(context_id = %metadata.context_id, key_id = %metadata.key_id))]
	pub fn decrypt_with(
		&self,
		ciphertext: impl AsRef<[u8]>,
		metadata: &EncryptionMetadata,
	) -> Result<Vec<u8>, Error> {
		let master = self.master_key(&metadata.key_id, metadata)?;
		self.decrypt_under(ciphertext.as_ref(), metadata, &master)
	}

	/// Unwrap `key_id` for work on the ciphertext `about` describes, reporting a key blob that
	/// fails its integrity check as a security event against that ciphertext.
	pub(crate) fn master_key(
		&self,
		key_id: &KeyId,
		about: &EncryptionMetadata,
	) -> Result<Key, Error> {
		self.keys.unwrap(key_id).inspect_err(|e| {
			if matches!(e, Error::Integrity(_)) {
				self.report_integrity(about, "master key failed to unwrap");
			}
		})
	}

	pub(crate) fn decrypt_under(
		&self,
		ciphertext: &[u8],
		metadata: &EncryptionMetadata,
		master: &Key,
	) -> Result<Vec<u8>, Error> {
		let data_key = kdf::derive_data_key(master, &metadata.salt);
		let cipher = ChaCha20Poly1305::new(data_key.expose_secret().into());

		let mut buffer = ciphertext.to_vec();
		let result = cipher.decrypt_in_place_detached(
			(&metadata.iv).into(),
			&aad(&metadata.context_id, &metadata.key_id, &metadata.iv, &metadata.salt),
			&mut buffer,
			Tag::from_slice(&metadata.auth_tag),
		);

		if result.is_err() {
			// The buffer holds unauthenticated garbage; don't let it escape
			buffer.clear();
			self.report_integrity(metadata, "authentication tag mismatch");
			return Err(Error::integrity(format!(
				"ciphertext for {} failed authentication",
				metadata.context_id
			)));
		}

		tracing::debug!(key_id=%metadata.key_id, "Decrypted");
		Ok(buffer)
	}

	/// Encrypt and persist: the ciphertext goes to the blob store, then the metadata is written
	/// (replacing any earlier content under the same context).
	#[tracing::instrument(level = "debug", skip(self, plaintext))]
	pub fn seal(
		&self,
		plaintext: impl AsRef<[u8]>,
		principal_id: &str,
		context_id: &ContextId,
	) -> Result<EncryptionMetadata, Error> {
		let (ciphertext, metadata) = self.encrypt(plaintext, principal_id, context_id)?;
		let previous = self.metadata.get_metadata(context_id)?;

		self.blobs.put(&metadata.blob_ref, ciphertext)?;
		if let Err(e) = self.metadata.put_metadata(metadata.clone()) {
			let _ = self.blobs.delete(&metadata.blob_ref);
			return Err(e);
		}

		if let Some(previous) = previous {
			self.blobs.delete(&previous.blob_ref)?;
		}

		Ok(metadata)
	}

	/// Load and decrypt the content stored under `context_id`.
	#[tracing::instrument(level = "debug", skip(self))]
	pub fn open(&self, principal_id: &str, context_id: &ContextId) -> Result<Vec<u8>, Error> {
		let metadata = self.metadata_for(principal_id, context_id)?;
		let ciphertext = self.blobs.get(&metadata.blob_ref)?;

		self.decrypt_with(ciphertext, &metadata)
	}

	/// Delete the ciphertext and metadata stored under `context_id`.
	#[tracing::instrument(level = "debug", skip(self))]
	pub fn discard(&self, context_id: &ContextId) -> Result<(), Error> {
		if let Some(metadata) = self.metadata.get_metadata(context_id)? {
			self.metadata.delete_metadata(context_id)?;
			self.blobs.delete(&metadata.blob_ref)?;
		}
		Ok(())
	}

	fn metadata_for(
		&self,
		principal_id: &str,
		context_id: &ContextId,
	) -> Result<EncryptionMetadata, Error> {
		let metadata = self
			.metadata
			.get_metadata(context_id)?
			.ok_or_else(|| Error::not_found(format!("metadata for {context_id}")))?;

		if metadata.principal_id != principal_id {
			tracing::debug!(%principal_id, owner=%metadata.principal_id, "Principal mismatch");
			return Err(Error::access_denied(principal_id, context_id.as_str()));
		}

		Ok(metadata)
	}

	fn report_integrity(&self, metadata: &EncryptionMetadata, detail: &str) {
		self.security.report(
			SecurityEvent::IntegrityFailure,
			&metadata.principal_id,
			metadata.context_id.as_str(),
			detail,
		);
	}
}
