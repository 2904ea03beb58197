use hkdf::Hkdf;
use sha2::Sha256;

use super::{Key, key::KEY_LEN};

const DATA_KEY_INFO: &[u8] = b"doc-vault::data-key::v1";

/// Derive the single-use data key for one encryption from a master key and that encryption's
/// random salt.
pub(crate) fn derive_data_key(master: &Key, salt: &[u8]) -> Key {
	let hk = Hkdf::<Sha256>::new(Some(salt), master.expose_secret());

	let mut output = [0u8; KEY_LEN];

	hk.expand(DATA_KEY_INFO, &mut output)
		.expect("32 bytes is always a valid HKDF-SHA256 output length");

	Key::new(output)
}

/// Derive a purpose-bound key from already-uniform key material.
pub(crate) fn derive_label_key(key: &Key, label: &[u8]) -> Key {
	let hk = Hkdf::<Sha256>::from_prk(key.expose_secret()).expect("key not long enough");

	let mut output = [0u8; KEY_LEN];

	hk.expand(label, &mut output).expect("KBKDF assploded");

	Key::new(output)
}
