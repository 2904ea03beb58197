use std::sync::Arc;

use super::{
	AlertChannel, AuditSink, BlobStore, Clock, Config, DocumentCipher, DocumentVersionChain,
	Error, KeyAgingMonitor, KeyRotationOrchestrator, KeyStore, LockManager, ManagedKeyStore,
	MemoryAuditLog, MemoryBlobStore, MemoryLockManager, MemoryMetadataStore, MetadataStore,
	PagingChannel, RootKeyService, SecurityEvents, SystemClock,
	scheduler::{AgingSweep, PeriodicRunner, RotationSweep, RunnerHandle},
};

/// Every component, wired together over one set of stores.
///
/// ```rust
/// use doc_vault::{Config, LocalRootKey, Vault};
/// # fn main() -> Result<(), doc_vault::Error> {
/// let vault = Vault::builder(LocalRootKey::new(doc_vault::generate_key()))
/// 	.with_config(Config::default())
/// 	.build()?;
///
/// vault.versions.create_version("doc1", "u1", b"hello", "first")?;
/// assert!(vault.rotation.check_rotation_needs()?.rotated.is_empty());
/// # Ok(())
/// # }
/// ```
pub struct Vault {
	pub config: Config,
	pub clock: Arc<dyn Clock>,
	pub metadata: Arc<dyn MetadataStore>,
	pub blobs: Arc<dyn BlobStore>,
	pub keys: Arc<dyn KeyStore>,
	pub locks: Arc<dyn LockManager>,
	pub audit: Arc<dyn AuditSink>,
	pub cipher: DocumentCipher,
	pub rotation: Arc<KeyRotationOrchestrator>,
	pub monitor: Arc<KeyAgingMonitor>,
	pub versions: DocumentVersionChain,
}

impl std::fmt::Debug for Vault {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Vault")
			.field("config", &self.config)
			.field("clock", &self.clock)
			.finish_non_exhaustive()
	}
}

impl Vault {
	pub fn builder(root: impl RootKeyService + 'static) -> VaultBuilder {
		VaultBuilder::new(Arc::new(root))
	}

	/// Default configuration, the system clock, and in-memory storage for everything.
	pub fn in_memory(root: impl RootKeyService + 'static) -> Self {
		Self::builder(root).assemble()
	}

	/// Start the rotation sweep and the age scan on their configured intervals.
	pub fn spawn_background(&self) -> (RunnerHandle, RunnerHandle) {
		(
			PeriodicRunner::spawn(
				Arc::new(RotationSweep(self.rotation.clone())),
				self.config.rotation_sweep_interval,
			),
			PeriodicRunner::spawn(
				Arc::new(AgingSweep(self.monitor.clone())),
				self.config.monitor_interval,
			),
		)
	}
}

pub struct VaultBuilder {
	root: Arc<dyn RootKeyService>,
	config: Config,
	clock: Arc<dyn Clock>,
	metadata: Arc<dyn MetadataStore>,
	blobs: Arc<dyn BlobStore>,
	locks: Option<Arc<dyn LockManager>>,
	audit: Arc<dyn AuditSink>,
	channels: Vec<Arc<dyn AlertChannel>>,
	pager: Option<Arc<dyn PagingChannel>>,
}

impl std::fmt::Debug for VaultBuilder {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("VaultBuilder")
			.field("config", &self.config)
			.finish_non_exhaustive()
	}
}

impl VaultBuilder {
	fn new(root: Arc<dyn RootKeyService>) -> Self {
		Self {
			root,
			config: Config::default(),
			clock: Arc::new(SystemClock),
			metadata: Arc::new(MemoryMetadataStore::new()),
			blobs: Arc::new(MemoryBlobStore::new()),
			locks: None,
			audit: Arc::new(MemoryAuditLog::new()),
			channels: Vec::new(),
			pager: None,
		}
	}

	pub fn with_config(mut self, config: Config) -> Self {
		self.config = config;
		self
	}

	pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
		self.clock = clock;
		self
	}

	pub fn with_metadata(mut self, metadata: Arc<dyn MetadataStore>) -> Self {
		self.metadata = metadata;
		self
	}

	pub fn with_blobs(mut self, blobs: Arc<dyn BlobStore>) -> Self {
		self.blobs = blobs;
		self
	}

	/// Defaults to an in-process lock manager, which only excludes rotations within this
	/// process.
	pub fn with_locks(mut self, locks: Arc<dyn LockManager>) -> Self {
		self.locks = Some(locks);
		self
	}

	pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
		self.audit = audit;
		self
	}

	/// Key age alerts go to every channel added.  The first channel also receives security
	/// events at or above [`Config::security_alert_threshold`].
	pub fn with_alert_channel(mut self, channel: Arc<dyn AlertChannel>) -> Self {
		self.channels.push(channel);
		self
	}

	pub fn with_pager(mut self, pager: Arc<dyn PagingChannel>) -> Self {
		self.pager = Some(pager);
		self
	}

	pub fn build(self) -> Result<Vault, Error> {
		self.config.validate()?;
		Ok(self.assemble())
	}

	fn assemble(self) -> Vault {
		let Self {
			root,
			config,
			clock,
			metadata,
			blobs,
			locks,
			audit,
			channels,
			pager,
		} = self;

		let locks = locks.unwrap_or_else(|| Arc::new(MemoryLockManager::new(clock.clone())));

		let mut security = SecurityEvents::new(audit.clone(), clock.clone());
		if let Some(channel) = channels.first() {
			security = security.with_alerts(channel.clone(), config.security_alert_threshold);
		}

		let keys: Arc<dyn KeyStore> = Arc::new(ManagedKeyStore::new(
			root,
			blobs.clone(),
			metadata.clone(),
			clock.clone(),
		));

		let cipher = DocumentCipher::new(
			keys.clone(),
			metadata.clone(),
			blobs.clone(),
			clock.clone(),
			security,
		);

		let rotation = Arc::new(KeyRotationOrchestrator::new(
			config.clone(),
			keys.clone(),
			metadata.clone(),
			blobs.clone(),
			cipher.clone(),
			locks.clone(),
			audit.clone(),
			clock.clone(),
		));

		let mut monitor =
			KeyAgingMonitor::new(&config, metadata.clone(), audit.clone(), clock.clone());
		for channel in channels {
			monitor = monitor.with_channel(channel);
		}
		if let Some(pager) = pager {
			monitor = monitor.with_pager(pager);
		}

		let versions = DocumentVersionChain::new(
			cipher.clone(),
			metadata.clone(),
			locks.clone(),
			audit.clone(),
			clock.clone(),
			config.lock_ttl,
		);

		tracing::debug!(?config, "vault assembled");

		Vault {
			config,
			clock,
			metadata,
			blobs,
			keys,
			locks,
			audit,
			cipher,
			rotation,
			monitor: Arc::new(monitor),
			versions,
		}
	}
}
