use std::sync::{Arc, Once};
use tracing_subscriber::{layer::SubscriberExt as _, registry::Registry};

use super::{
	BlobStore, Config, DocumentCipher, DocumentVersionChain, KeyRotationOrchestrator, KeyStore,
	LocalRootKey, LockManager, ManualClock, MemoryAuditLog, MemoryBlobStore,
	MemoryMetadataStore, MetadataStore, Vault, generate_key,
};

static INIT: Once = Once::new();

pub(crate) fn init() {
	INIT.call_once(|| {
		let layer = tracing_tree::HierarchicalLayer::default()
			.with_writer(tracing_subscriber::fmt::TestWriter::new())
			.with_indent_lines(true)
			.with_indent_amount(2)
			.with_targets(true);

		let sub = Registry::default().with(layer);
		tracing::subscriber::set_global_default(sub).unwrap();
	});
}

/// A fully wired vault over in-memory stores and a clock that only moves when told to, with
/// the concrete stores kept to hand for poking at.
pub(crate) struct Fixture {
	pub clock: ManualClock,
	pub metadata: Arc<MemoryMetadataStore>,
	pub blobs: Arc<dyn BlobStore>,
	memory_blobs: Option<Arc<MemoryBlobStore>>,
	pub keys: Arc<dyn KeyStore>,
	pub locks: Arc<dyn LockManager>,
	pub audit: Arc<MemoryAuditLog>,
	pub cipher: DocumentCipher,
	pub rotation: Arc<KeyRotationOrchestrator>,
	pub versions: DocumentVersionChain,
}

impl Fixture {
	pub fn new() -> Self {
		let blobs = Arc::new(MemoryBlobStore::new());
		let mut fx = Self::with_blobs(blobs.clone());
		fx.memory_blobs = Some(blobs);
		fx
	}

	pub fn with_blobs(blobs: Arc<dyn BlobStore>) -> Self {
		Self::with_parts(Config::default(), |m| m, blobs)
	}

	/// Everything swappable at once.  `wrap` gets the in-memory metadata store, which stays
	/// reachable as `fx.metadata`, and returns what the vault should actually use.
	pub fn with_parts(
		config: Config,
		wrap: impl FnOnce(Arc<MemoryMetadataStore>) -> Arc<dyn MetadataStore>,
		blobs: Arc<dyn BlobStore>,
	) -> Self {
		init();

		let clock = ManualClock::frozen();
		let metadata = Arc::new(MemoryMetadataStore::new());
		let audit = Arc::new(MemoryAuditLog::new());

		let vault = Vault::builder(LocalRootKey::new(generate_key()))
			.with_config(config)
			.with_clock(Arc::new(clock.clone()))
			.with_metadata(wrap(metadata.clone()))
			.with_blobs(blobs)
			.with_audit(audit.clone())
			.build()
			.unwrap();

		Self {
			clock,
			metadata,
			blobs: vault.blobs,
			memory_blobs: None,
			keys: vault.keys,
			locks: vault.locks,
			audit,
			cipher: vault.cipher,
			rotation: vault.rotation,
			versions: vault.versions,
		}
	}

	/// Mutate a stored blob.  Only works on the default in-memory blob store.
	pub fn tamper(&self, address: &str, f: impl FnOnce(&mut Vec<u8>)) -> bool {
		self.memory_blobs
			.as_ref()
			.is_some_and(|b| b.tamper(address, f))
	}
}
