use ciborium_ll::{Decoder, Header};

use super::Error;

/// Pull one byte string off `dec`, joining segments, and refusing anything longer than `limit`.
pub(crate) fn read_bytes(
	dec: &mut Decoder<&[u8]>,
	element: &str,
	limit: usize,
) -> Result<Vec<u8>, Error> {
	let len = match dec.pull().map_err(|e| Error::decoding(element, e))? {
		Header::Bytes(len) => len,
		other => {
			tracing::debug!(?other, element, "unexpected CBOR header");
			return Err(Error::invalid_key(format!("expected {element}")));
		}
	};

	if len.is_some_and(|n| n > limit) {
		return Err(Error::invalid_key(format!("{element} too long")));
	}

	let mut out = Vec::with_capacity(len.unwrap_or_default());
	let mut buf = [0u8; 256];
	let mut segments = dec.bytes(len);

	while let Some(mut segment) = segments.pull().map_err(|e| Error::decoding(element, e))? {
		while let Some(chunk) = segment
			.pull(&mut buf[..])
			.map_err(|e| Error::decoding(element, e))?
		{
			if out.len() + chunk.len() > limit {
				return Err(Error::invalid_key(format!("{element} too long")));
			}
			out.extend_from_slice(chunk);
		}
	}

	Ok(out)
}

/// [`read_bytes`] for a field of exactly `N` bytes.
pub(crate) fn read_array<const N: usize>(
	dec: &mut Decoder<&[u8]>,
	element: &str,
) -> Result<[u8; N], Error> {
	read_bytes(dec, element, N)?
		.try_into()
		.map_err(|_| Error::invalid_key(format!("{element} must be {N} bytes")))
}
