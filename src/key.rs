use rand::{RngCore as _, rng};
use secrecy::ExposeSecret as _;

use super::Error;

/// Length in bytes of every master key and derived data key.
pub const KEY_LEN: usize = 32;

/// Symmetric key material: a principal's master key, a derived data key, or a root key.
///
/// The bytes live in a [`secrecy::SecretBox`], so they are zeroed on drop and never show up in
/// `Debug` output.
#[derive(Debug)]
pub struct Key(secrecy::SecretBox<[u8; KEY_LEN]>);

impl Key {
	pub fn new(k: [u8; KEY_LEN]) -> Self {
		Self(Box::new(k).into())
	}

	pub fn expose_secret(&self) -> &[u8; KEY_LEN] {
		self.0.expose_secret()
	}

	/// Rebuild a key from bytes handed back by a root key service.
	pub fn try_from_slice(b: &[u8]) -> Result<Self, Error> {
		let k: [u8; KEY_LEN] = b.try_into().map_err(|_| {
			Error::invalid_key(format!("expected {KEY_LEN} bytes, got {}", b.len()))
		})?;

		Ok(Self::new(k))
	}
}

impl Clone for Key {
	fn clone(&self) -> Self {
		Self::new(*self.expose_secret())
	}
}

impl From<[u8; KEY_LEN]> for Key {
	fn from(k: [u8; KEY_LEN]) -> Self {
		Self::new(k)
	}
}

/// Create a fresh random key.
///
/// Master keys are minted by this when a principal first encrypts something, and again on
/// every rotation.  It is also handy for setting up a [`LocalRootKey`](super::LocalRootKey).
#[tracing::instrument(level = "debug")]
pub fn generate_key() -> Key {
	let mut k = [0u8; KEY_LEN];

	rng().fill_bytes(&mut k);

	Key::new(k)
}

/// Fill an array with fresh randomness.  Used for IVs and salts, which must never repeat.
pub(crate) fn random_bytes<const N: usize>() -> [u8; N] {
	let mut b = [0u8; N];
	rng().fill_bytes(&mut b);
	b
}
