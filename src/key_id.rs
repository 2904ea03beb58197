use super::{Error, Key, cbor, kdf, key::random_bytes};

type Kid = [u8; 16];

/// Identifier of one stored master key version (or, inside wrapped blobs, of a root key).
#[allow(clippy::derived_hash_with_manual_eq)] // k1 == k2 => hash(k1) == hash(k2) will hold
#[derive(Clone, Copy, Debug, Hash, Ord, PartialOrd)]
#[repr(transparent)]
pub struct KeyId(Kid);

impl KeyId {
	/// A fresh random identifier for a newly minted master key.
	pub fn generate() -> Self {
		Self(random_bytes())
	}

	pub fn as_bytes(&self) -> &Kid {
		&self.0
	}

	pub(crate) fn encode(&self, enc: &mut ciborium_ll::Encoder<&mut Vec<u8>>) -> Result<(), Error> {
		enc.bytes(&self.0, None)
			.map_err(|e| Error::encoding("key_id", e))?;
		Ok(())
	}

	pub(crate) fn decode(dec: &mut ciborium_ll::Decoder<&[u8]>) -> Result<Self, Error> {
		Ok(Self(cbor::read_array(dec, "key_id")?))
	}
}

impl PartialEq for KeyId {
	fn eq(&self, other: &Self) -> bool {
		constant_time_eq::constant_time_eq_n(&self.0, &other.0)
	}
}

impl Eq for KeyId {}

impl std::fmt::Display for KeyId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		for b in &self.0 {
			f.write_fmt(format_args!("{b:02x}"))?;
		}

		Ok(())
	}
}

/// Get a stable, non-secret ID for a piece of key material.
#[tracing::instrument(level = "trace", skip(key))]
pub(crate) fn fingerprint(key: &Key) -> KeyId {
	let mut id: Kid = Default::default();
	let derived = kdf::derive_label_key(key, b"key_id");
	id.copy_from_slice(&derived.expose_secret()[0..16]);

	KeyId(id)
}
