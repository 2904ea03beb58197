#[derive(Debug, thiserror::Error, thiserror_ext::Construct)]
#[non_exhaustive]
pub enum Error {
	#[error("{0} not found")]
	NotFound(String),

	#[error("principal {principal} may not access {document}")]
	AccessDenied { principal: String, document: String },

	#[error("integrity check failed: {0}")]
	Integrity(String),

	#[error("checksum mismatch on {0}")]
	Corruption(String),

	#[error("rotation in progress on {0}")]
	RotationInProgress(String),

	#[error("rotation of {target} failed for {failed} of {total} items")]
	PartialRotationFailure {
		target: String,
		failed: usize,
		total: usize,
	},

	#[error("external service failure: {0}")]
	ExternalService(String),

	#[error("failed to encrypt plaintext")]
	Encryption,

	#[error("wrapped key encoding failure on {element}: {cause}")]
	Encoding {
		element: String,
		cause: std::io::Error,
	},

	#[error("wrapped key decoding failure on {element}: {cause:?}")]
	Decoding {
		element: String,
		cause: ciborium_ll::Error<std::io::Error>,
	},

	#[error("invalid key: {0}")]
	InvalidKey(String),

	#[error("invalid configuration: {0}")]
	InvalidConfig(String),

	#[error("no version numbers left for {0}")]
	VersionsExhausted(String),
}

impl Error {
	/// The message to show an end user.
	///
	/// Every failure that could tell a tampering caller *which* check tripped collapses into the
	/// same string.
	pub fn public_message(&self) -> &'static str {
		match self {
			Error::NotFound(_)
			| Error::AccessDenied { .. }
			| Error::Integrity(_)
			| Error::Corruption(_)
			| Error::Decoding { .. }
			| Error::InvalidKey(_) => "cannot access document",
			Error::RotationInProgress(_) => "document is busy, try again shortly",
			Error::ExternalService(_) => "service temporarily unavailable",
			_ => "internal error",
		}
	}

	/// Whether the next scheduled cycle may reasonably succeed where this one failed.
	pub fn is_transient(&self) -> bool {
		matches!(self, Error::RotationInProgress(_) | Error::ExternalService(_))
	}
}
