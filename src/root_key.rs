use chacha20poly1305::{
	ChaCha20Poly1305, KeyInit as _,
	aead::{Aead as _, Payload},
};
use std::fmt::Debug;

use super::{Error, Key, KeyId, cbor, key::random_bytes, key_id::fingerprint};

/// The external service that wraps and unwraps master key material under a root key that never
/// leaves it (an HSM, a cloud KMS, ...).
pub trait RootKeyService: Send + Sync {
	fn wrap(&self, raw: &Key) -> Result<Vec<u8>, Error>;

	fn unwrap(&self, wrapped: &[u8]) -> Result<Key, Error>;
}

/// A [`RootKeyService`] that holds the root key in process memory.
///
/// Suitable for tests and single-node deployments where the root key comes from a secrets
/// manager at startup.  Wrapped blobs record which root key sealed them, so a service handed
/// the wrong root key fails cleanly instead of producing garbage.
#[derive(Clone, Debug)]
pub struct LocalRootKey {
	root: Key,
	root_id: KeyId,
}

impl LocalRootKey {
	#[tracing::instrument(level = "debug", skip(root))]
	pub fn new(root: impl Into<Key>) -> Self {
		let root = root.into();
		let root_id = fingerprint(&root);
		tracing::debug!(%root_id, "Root key loaded");

		Self { root, root_id }
	}

	fn aad(root_id: &KeyId, nonce: &[u8; 12]) -> Vec<u8> {
		let mut aad = b"doc-vault::wrap::".to_vec();
		aad.extend_from_slice(root_id.as_bytes());
		aad.extend_from_slice(nonce);
		aad
	}
}

impl RootKeyService for LocalRootKey {
	#[tracing::instrument(level = "debug", skip_all)]
	fn wrap(&self, raw: &Key) -> Result<Vec<u8>, Error> {
		let cipher = ChaCha20Poly1305::new(self.root.expose_secret().into());
		let nonce: [u8; 12] = random_bytes();

		let sealed = cipher
			.encrypt(
				(&nonce).into(),
				Payload {
					msg: raw.expose_secret(),
					aad: &Self::aad(&self.root_id, &nonce),
				},
			)
			.map_err(|_| Error::Encryption)?;

		WrappedKey {
			root_id: self.root_id,
			nonce,
			sealed,
		}
		.to_bytes()
	}

	#[tracing::instrument(level = "debug", skip_all)]
	fn unwrap(&self, wrapped: &[u8]) -> Result<Key, Error> {
		let wrapped = WrappedKey::try_from(wrapped)?;

		if wrapped.root_id != self.root_id {
			tracing::debug!(root_id=%wrapped.root_id, "Wrapped under a different root key");
			return Err(Error::integrity("wrapped under a different root key"));
		}

		let cipher = ChaCha20Poly1305::new(self.root.expose_secret().into());
		let raw = cipher
			.decrypt(
				(&wrapped.nonce).into(),
				Payload {
					msg: &wrapped.sealed,
					aad: &Self::aad(&wrapped.root_id, &wrapped.nonce),
				},
			)
			.map_err(|_| Error::integrity("wrapped key failed authentication"))?;

		Key::try_from_slice(&raw)
	}
}

// This makes more sense in base64
const WRAPPED_KEY_MAGIC: [u8; 3] = [0x8a, 0xb6, 0xa9];

// A sealed 32-byte key is 48 bytes; anything much bigger isn't one of ours
const MAX_SEALED_LEN: usize = 128;

#[derive(Clone, Debug)]
struct WrappedKey {
	root_id: KeyId,
	nonce: [u8; 12],
	sealed: Vec<u8>,
}

impl WrappedKey {
	fn to_bytes(&self) -> Result<Vec<u8>, Error> {
		use ciborium_ll::{Encoder, Header};

		let mut v: Vec<u8> = Vec::new();

		v.extend_from_slice(&WRAPPED_KEY_MAGIC);

		let mut enc = Encoder::from(&mut v);
		enc.push(Header::Array(Some(3)))
			.map_err(|e| Error::encoding("array", e))?;
		self.root_id.encode(&mut enc)?;
		enc.bytes(&self.nonce, None)
			.map_err(|e| Error::encoding("nonce", e))?;
		enc.bytes(&self.sealed, None)
			.map_err(|e| Error::encoding("sealed key", e))?;

		Ok(v)
	}
}

impl TryFrom<&[u8]> for WrappedKey {
	type Error = Error;

	fn try_from(b: &[u8]) -> Result<Self, Self::Error> {
		use ciborium_ll::{Decoder, Header};

		let Some(body) = b.strip_prefix(&WRAPPED_KEY_MAGIC[..]) else {
			tracing::debug!(prefix=?&b[..b.len().min(3)], "not a wrapped key");
			return Err(Error::invalid_key("not a wrapped key"));
		};

		let mut dec = Decoder::from(body);

		match dec.pull().map_err(|e| Error::decoding("wrapped key", e))? {
			Header::Array(Some(3)) => (),
			_ => return Err(Error::invalid_key("expected 3-element array")),
		}

		Ok(Self {
			root_id: KeyId::decode(&mut dec)?,
			nonce: cbor::read_array(&mut dec, "nonce")?,
			sealed: cbor::read_bytes(&mut dec, "sealed key", MAX_SEALED_LEN)?,
		})
	}
}
