use parking_lot::Mutex;
use std::{
	collections::HashMap,
	sync::Arc,
	time::Instant,
};

use super::{
	AuditEntry, AuditSink, BlobStore, Clock, Config, ContextId, DocumentCipher,
	EncryptionMetadata, Error, KeyId, KeyState, KeyStore, LockManager, LockTarget, MetadataStore,
	SecurityEvent, Severity, audit, generate_key, lock,
};

/// Why one item of a rotation batch could not be moved to the new key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ItemFailure {
	pub context_id: ContextId,
	pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RotationSummary {
	pub target: LockTarget,
	/// The master key retired by this rotation, for master key rotations.
	pub old_key_id: Option<KeyId>,
	/// The master key the content now lives under, if there was any content.
	pub new_key_id: Option<KeyId>,
	pub total: usize,
	pub succeeded: usize,
	pub failed: Vec<ItemFailure>,
}

impl RotationSummary {
	/// [`Error::PartialRotationFailure`] if any item failed.
	pub fn into_result(self) -> Result<Self, Error> {
		if self.failed.is_empty() {
			Ok(self)
		} else {
			Err(Error::partial_rotation_failure(
				self.target.to_string(),
				self.failed.len(),
				self.total,
			))
		}
	}
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RotationOutcome {
	Rotated(RotationSummary),
	/// Someone else holds the target's lock; the next sweep will get it.
	Skipped,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeletionReport {
	pub deleted: Vec<KeyId>,
	/// Due, but still referenced by live metadata, so pushed back.
	pub deferred: Vec<KeyId>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
	pub rotated: Vec<RotationSummary>,
	/// Targets that were due but locked by another worker.
	pub skipped: Vec<LockTarget>,
	pub errors: Vec<(LockTarget, String)>,
	pub deletions: DeletionReport,
}

/// Rotates master keys and per-document data keys, and retires superseded key material once
/// it is safe to do so.
///
/// Rotation re-encrypts every affected ciphertext under fresh salts and IVs.  Each item is
/// swapped over on its own (new blob written, metadata pointer swapped, old blob deleted), so a
/// failure part-way through leaves every item readable under either its old or its new key.
/// The old master key is only scheduled for deletion, never deleted on the spot, and the
/// deletion itself re-checks that nothing still references the key.
pub struct KeyRotationOrchestrator {
	config: Config,
	keys: Arc<dyn KeyStore>,
	metadata: Arc<dyn MetadataStore>,
	blobs: Arc<dyn BlobStore>,
	cipher: DocumentCipher,
	locks: Arc<dyn LockManager>,
	audit: Arc<dyn AuditSink>,
	clock: Arc<dyn Clock>,
	consecutive_partial_failures: Mutex<HashMap<LockTarget, u32>>,
}

impl std::fmt::Debug for KeyRotationOrchestrator {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("KeyRotationOrchestrator")
			.field("config", &self.config)
			.finish_non_exhaustive()
	}
}

impl KeyRotationOrchestrator {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		config: Config,
		keys: Arc<dyn KeyStore>,
		metadata: Arc<dyn MetadataStore>,
		blobs: Arc<dyn BlobStore>,
		cipher: DocumentCipher,
		locks: Arc<dyn LockManager>,
		audit: Arc<dyn AuditSink>,
		clock: Arc<dyn Clock>,
	) -> Self {
		Self {
			config,
			keys,
			metadata,
			blobs,
			cipher,
			locks,
			audit,
			clock,
			consecutive_partial_failures: Mutex::new(HashMap::new()),
		}
	}

	/// Replace `principal_id`'s master key, moving all of their content over to the new one.
	///
	/// Returns [`RotationOutcome::Skipped`] if another rotation of this principal is running.
	#[tracing::instrument(level = "info", skip(self))]
	pub fn rotate_master_key(&self, principal_id: &str) -> Result<RotationOutcome, Error> {
		let target = LockTarget::Principal(principal_id.to_string());
		let Some(guard) = lock::try_lock(&self.locks, target.clone(), self.config.lock_ttl)? else {
			tracing::info!(%target, "rotation already in progress; skipping");
			return Ok(RotationOutcome::Skipped);
		};

		let current = self
			.metadata
			.active_master_key(principal_id)?
			.ok_or_else(|| Error::not_found(format!("active master key for {principal_id}")))?;

		let new_key_id = {
			let raw = generate_key();
			self.keys.wrap_and_store(principal_id, &raw)?
		};

		let mut summary = RotationSummary {
			target: target.clone(),
			old_key_id: Some(current.key_id),
			new_key_id: Some(new_key_id),
			total: 0,
			succeeded: 0,
			failed: Vec::new(),
		};

		// Anything not yet on the new key comes along, including leftovers from earlier
		// rotations that failed part-way
		let moved = self
			.metadata
			.metadata_for_principal(principal_id)
			.and_then(|all| {
				let items: Vec<EncryptionMetadata> =
					all.into_iter().filter(|m| m.key_id != new_key_id).collect();
				summary.total = items.len();
				self.reencrypt_batch(&guard, &items, |_| Ok(new_key_id), &mut summary)
			});

		let result = match moved {
			Ok(()) => self.promote(principal_id, &new_key_id),
			Err(e) => {
				self.retire(&new_key_id);
				Err(e)
			}
		};

		if let Err(e) = &result {
			tracing::error!(%target, error = %e, "master key rotation failed");
		}

		self.finish(&summary, "rotation.master", principal_id, result.as_ref().err());
		result.map(|()| RotationOutcome::Rotated(summary))
	}

	/// Re-encrypt every ciphertext belonging to `document_id` with fresh data keys, under its
	/// owner's active master key.
	///
	/// Shares the document's lock with version creation, so content writes and key swaps on
	/// one document never interleave.
	#[tracing::instrument(level = "info", skip(self))]
	pub fn rotate_document_key(&self, document_id: &str) -> Result<RotationOutcome, Error> {
		let target = LockTarget::Document(document_id.to_string());
		let Some(guard) = lock::try_lock(&self.locks, target.clone(), self.config.lock_ttl)? else {
			tracing::info!(%target, "rotation already in progress; skipping");
			return Ok(RotationOutcome::Skipped);
		};

		let document = self.metadata.get_document(document_id)?;
		let items = self.metadata.metadata_for_document(document_id)?;

		if document.is_none() && items.is_empty() {
			return Err(Error::not_found(format!("document {document_id}")));
		}

		let mut summary = RotationSummary {
			target: target.clone(),
			old_key_id: None,
			new_key_id: None,
			total: items.len(),
			succeeded: 0,
			failed: Vec::new(),
		};

		let owner = match &document {
			Some(document) => document.owner.clone(),
			None => items
				.first()
				.map(|m| m.principal_id.clone())
				.unwrap_or_default(),
		};

		let result = self
			.reencrypt_batch(
				&guard,
				&items,
				|item| Ok(self.keys.get_or_create_master_key(&item.principal_id)?.0),
				&mut summary,
			)
			.and_then(|()| match document {
				Some(mut document) => {
					document.key_rotated_at = self.clock.now();
					self.metadata.put_document(document)
				}
				None => Ok(()),
			});

		self.finish(&summary, "rotation.document", &owner, result.as_ref().err());
		result.map(|()| RotationOutcome::Rotated(summary))
	}

	/// The periodic sweep: rotate whatever is past its interval, then process due key
	/// deletions.  Safe to run repeatedly and from several workers at once.
	///
	/// Only a failure to enumerate keys or documents fails the sweep; anything going wrong with
	/// one target is recorded in the report and the sweep moves on.
	#[tracing::instrument(level = "info", skip(self))]
	pub fn check_rotation_needs(&self) -> Result<SweepReport, Error> {
		let now = self.clock.now();
		let mut report = SweepReport::default();

		let due_principals: Vec<String> = self
			.metadata
			.list_master_keys()?
			.into_iter()
			.filter(|k| {
				k.state == KeyState::Active
					&& k.last_rotated_at.age_at(now) >= self.config.master_rotation_interval
			})
			.map(|k| k.principal_id)
			.collect();

		let due_documents: Vec<String> = self
			.metadata
			.list_documents()?
			.into_iter()
			.filter(|d| d.key_rotated_at.age_at(now) >= self.config.document_rotation_interval)
			.map(|d| d.document_id)
			.collect();

		tracing::debug!(
			principals = due_principals.len(),
			documents = due_documents.len(),
			"rotation sweep"
		);

		for principal_id in due_principals {
			let target = LockTarget::Principal(principal_id.clone());
			Self::tally(&mut report, target, self.rotate_master_key(&principal_id));
		}

		for document_id in due_documents {
			let target = LockTarget::Document(document_id.clone());
			Self::tally(&mut report, target, self.rotate_document_key(&document_id));
		}

		report.deletions = self.process_deletions()?;

		Ok(report)
	}

	/// Delete master keys whose grace period is over, provided no metadata still refers to
	/// them.  Keys that are still referenced get their deletion pushed back.
	#[tracing::instrument(level = "debug", skip(self))]
	pub fn process_deletions(&self) -> Result<DeletionReport, Error> {
		let now = self.clock.now();
		let mut report = DeletionReport::default();

		for schedule in self.metadata.list_deletion_schedules()? {
			if schedule.scheduled_deletion > now {
				continue;
			}

			let key_id = schedule.key_id;
			let result = self.metadata.count_metadata_for_key(&key_id).and_then(|refs| {
				if refs > 0 {
					let mut deferred = schedule.clone();
					deferred.scheduled_deletion = now + self.config.deletion_recheck;
					self.metadata.put_deletion_schedule(deferred)?;
					tracing::warn!(%key_id, refs, "key still referenced; deletion deferred");
					Ok(false)
				} else {
					self.keys.destroy(&key_id)?;
					Ok(true)
				}
			});

			match result {
				Ok(true) => {
					let _ = audit::record(
						self.audit.as_ref(),
						AuditEntry {
							at: now,
							severity: Severity::Info,
							action: "key.deleted".to_string(),
							subject: key_id.to_string(),
							detail: "grace period elapsed; no remaining references".to_string(),
						},
					);
					report.deleted.push(key_id);
				}
				Ok(false) => report.deferred.push(key_id),
				Err(e) => {
					tracing::error!(%key_id, error = %e, "key deletion failed; will retry next sweep");
				}
			}
		}

		Ok(report)
	}

	fn tally(
		report: &mut SweepReport,
		target: LockTarget,
		result: Result<RotationOutcome, Error>,
	) {
		match result {
			Ok(RotationOutcome::Rotated(summary)) => report.rotated.push(summary),
			Ok(RotationOutcome::Skipped) => report.skipped.push(target),
			Err(e) => {
				tracing::error!(%target, error = %e, "rotation failed");
				report.errors.push((target, e.to_string()));
			}
		}
	}

	/// Make `new_key_id` the principal's active key and schedule whichever key it displaced.
	fn promote(&self, principal_id: &str, new_key_id: &KeyId) -> Result<(), Error> {
		let previous = self
			.metadata
			.activate_master_key(principal_id, new_key_id, self.clock.now())
			.inspect_err(|_| self.retire(new_key_id))?;

		if let Some(previous) = previous {
			self.keys
				.schedule_deletion(&previous.key_id, self.config.deletion_grace)?;
		}
		Ok(())
	}

	/// Schedule a key that never became active, since nothing else ever will.  Items already
	/// moved onto it keep it alive until the next rotation moves them off again.
	fn retire(&self, key_id: &KeyId) {
		if let Err(e) = self.keys.schedule_deletion(key_id, self.config.deletion_grace) {
			tracing::warn!(%key_id, error = %e, "could not schedule unused key for deletion");
		}
	}

	/// Move each item in turn, renewing the lock before every one.  Item failures are recorded
	/// in `summary`; losing the lock stops the batch and fails the rest of it.
	fn reencrypt_batch(
		&self,
		guard: &lock::LockGuard,
		items: &[EncryptionMetadata],
		key_for: impl Fn(&EncryptionMetadata) -> Result<KeyId, Error>,
		summary: &mut RotationSummary,
	) -> Result<(), Error> {
		for (i, item) in items.iter().enumerate() {
			if let Err(e) = guard.extend(self.config.lock_ttl) {
				tracing::error!(lock = %guard.target(), error = %e, "lost rotation lock; abandoning batch");
				summary.failed.extend(items[i..].iter().map(|rest| ItemFailure {
					context_id: rest.context_id.clone(),
					reason: e.to_string(),
				}));
				return Err(e);
			}

			let result = key_for(item).and_then(|key_id| {
				self.reencrypt_item(item, key_id)?;
				Ok(key_id)
			});

			match result {
				Ok(key_id) => {
					summary.succeeded += 1;
					summary.new_key_id.get_or_insert(key_id);
				}
				Err(e) => {
					tracing::warn!(context_id = %item.context_id, error = %e, "re-encryption failed; skipping item");
					summary.failed.push(ItemFailure {
						context_id: item.context_id.clone(),
						reason: e.to_string(),
					});
				}
			}
		}

		Ok(())
	}

	/// Move one ciphertext to `new_key_id`: decrypt, re-encrypt with a fresh salt and IV, write
	/// the new blob, then swap the metadata, but only if nobody changed it in the meantime.
	#[tracing::instrument(level = "debug", skip(self, item), fields(context_id = %item.context_id))]
	fn reencrypt_item(&self, item: &EncryptionMetadata, new_key_id: KeyId) -> Result<(), Error> {
		let started = Instant::now();

		let ciphertext = self.blobs.get(&item.blob_ref)?;
		let plaintext = {
			let old = self.cipher.master_key(&item.key_id, item)?;
			self.cipher.decrypt_under(&ciphertext, item, &old)?
		};

		let (new_ciphertext, new_metadata) = {
			let new = self.cipher.master_key(&new_key_id, item)?;
			self.cipher.encrypt_under(
				&plaintext,
				&item.principal_id,
				&item.context_id,
				new_key_id,
				&new,
			)?
		};

		if started.elapsed() > self.config.item_timeout {
			return Err(Error::external_service(format!(
				"re-encrypting {} took longer than {:?}",
				item.context_id, self.config.item_timeout
			)));
		}

		self.blobs.put(&new_metadata.blob_ref, new_ciphertext)?;

		let new_blob = new_metadata.blob_ref.clone();
		if !self
			.metadata
			.compare_and_swap_metadata(&item.context_id, &item.iv, new_metadata)?
		{
			let _ = self.blobs.delete(&new_blob);
			return Err(Error::rotation_in_progress(format!(
				"{} changed during re-encryption",
				item.context_id
			)));
		}

		if let Err(e) = self.blobs.delete(&item.blob_ref) {
			tracing::warn!(blob = %item.blob_ref, error = %e, "orphaned superseded blob");
		}

		Ok(())
	}

	/// Audit the rotation and track the target's run of unsuccessful ones.  `error` is whatever
	/// stopped the rotation completing after its batch ran.
	fn finish(
		&self,
		summary: &RotationSummary,
		action: &str,
		principal_id: &str,
		error: Option<&Error>,
	) {
		let clean = summary.failed.is_empty() && error.is_none();
		let severity = if clean {
			Severity::Info
		} else {
			Severity::Warning
		};

		let mut detail = format!(
			"succeeded={} failed={} total={}",
			summary.succeeded,
			summary.failed.len(),
			summary.total
		);
		if let Some(e) = error {
			detail.push_str(&format!(" error={e}"));
		}

		let _ = audit::record(
			self.audit.as_ref(),
			AuditEntry {
				at: self.clock.now(),
				severity,
				action: action.to_string(),
				subject: summary.target.to_string(),
				detail,
			},
		);

		let streak = {
			let mut streaks = self.consecutive_partial_failures.lock();
			if clean {
				streaks.remove(&summary.target);
				0
			} else {
				let n = streaks.entry(summary.target.clone()).or_insert(0);
				*n += 1;
				*n
			}
		};

		if streak > 0 && streak >= self.config.partial_failure_alert_after {
			self.cipher.security().report(
				SecurityEvent::RepeatedPartialRotation,
				principal_id,
				&summary.target.to_string(),
				&format!(
					"{streak} consecutive partial rotations; latest failed {} of {}",
					summary.failed.len(),
					summary.total
				),
			);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		BlobStore as _, DocumentRecord, DocumentVersion, KeyDeletionSchedule, ManualClock,
		MasterKey, MemoryBlobStore, MemoryMetadataStore, Timestamp, days, records::IV_LEN,
		testing::Fixture,
	};
	use std::{
		sync::{
			atomic::{AtomicBool, Ordering},
			mpsc,
		},
		time::Duration,
	};

	fn doc(fx: &Fixture, principal: &str, id: &str, body: &[u8]) -> EncryptionMetadata {
		fx.cipher.seal(body, principal, &ContextId::new(id)).unwrap()
	}

	fn rotated(outcome: RotationOutcome) -> RotationSummary {
		match outcome {
			RotationOutcome::Rotated(s) => s,
			RotationOutcome::Skipped => panic!("rotation unexpectedly skipped"),
		}
	}

	#[test]
	fn master_rotation_moves_every_document() {
		let fx = Fixture::new();
		let k1 = doc(&fx, "u1", "doc1", b"first").key_id;
		assert_eq!(k1, doc(&fx, "u1", "doc2", b"second").key_id);

		let summary = rotated(fx.rotation.rotate_master_key("u1").unwrap());
		let k2 = summary.new_key_id.unwrap();

		assert_ne!(k1, k2);
		assert_eq!(Some(k1), summary.old_key_id);
		assert_eq!((2, 2), (summary.total, summary.succeeded));

		for (id, body) in [("doc1", &b"first"[..]), ("doc2", &b"second"[..])] {
			let ctx = ContextId::new(id);
			assert_eq!(k2, fx.metadata.get_metadata(&ctx).unwrap().unwrap().key_id);
			assert_eq!(body.to_vec(), fx.cipher.open("u1", &ctx).unwrap());
		}

		// New encryptions use the new key
		assert_eq!(k2, doc(&fx, "u1", "doc3", b"third").key_id);
	}

	#[test]
	fn old_key_is_deleted_only_after_grace() {
		let fx = Fixture::new();
		let stale = doc(&fx, "u1", "doc1", b"contents");
		let ciphertext_before = {
			// Grab the old ciphertext, as an in-flight reader would have
			let m = fx.metadata.get_metadata(&ContextId::new("doc1")).unwrap().unwrap();
			fx.blobs.get(&m.blob_ref).unwrap()
		};

		rotated(fx.rotation.rotate_master_key("u1").unwrap());

		// Within the grace period, the stale reference still works
		assert_eq!(
			b"contents".to_vec(),
			fx.cipher.decrypt_with(&ciphertext_before, &stale).unwrap()
		);
		assert!(fx.rotation.process_deletions().unwrap().deleted.is_empty());

		fx.clock.advance(days(7));
		let report = fx.rotation.process_deletions().unwrap();
		assert_eq!(vec![stale.key_id], report.deleted);

		assert!(matches!(
			fx.cipher.decrypt_with(&ciphertext_before, &stale),
			Err(Error::NotFound(_))
		));
		// The live copy is unaffected
		assert_eq!(
			b"contents".to_vec(),
			fx.cipher.open("u1", &ContextId::new("doc1")).unwrap()
		);
	}

	#[test]
	fn failed_items_do_not_abort_the_batch() {
		let fx = Fixture::new();
		doc(&fx, "u1", "doc1", b"fine");
		let broken = doc(&fx, "u1", "doc2", b"about to be mangled");
		doc(&fx, "u1", "doc3", b"also fine");
		assert!(fx.tamper(&broken.blob_ref, |b| b[0] ^= 0xff));

		let summary = rotated(fx.rotation.rotate_master_key("u1").unwrap());

		assert_eq!(3, summary.total);
		assert_eq!(2, summary.succeeded);
		assert_eq!(1, summary.failed.len());
		assert_eq!(ContextId::new("doc2"), summary.failed[0].context_id);
		assert!(matches!(
			summary.clone().into_result(),
			Err(Error::PartialRotationFailure { failed: 1, total: 3, .. })
		));

		// The broken item still references the old key, so that key can't go yet
		fx.clock.advance(days(7));
		let report = fx.rotation.process_deletions().unwrap();
		assert_eq!(vec![broken.key_id], report.deferred);
		assert!(fx.keys.unwrap(&broken.key_id).is_ok());

		let audit = fx.audit.with_action("rotation.master");
		assert_eq!(1, audit.len());
		assert_eq!(Severity::Warning, audit[0].severity);
		assert_eq!("succeeded=2 failed=1 total=3", audit[0].detail);
	}

	#[test]
	fn repeated_partial_failures_raise_a_security_event() {
		let fx = Fixture::new();
		let broken = doc(&fx, "u1", "doc1", b"mangled");
		fx.tamper(&broken.blob_ref, |b| b[0] ^= 0xff);

		rotated(fx.rotation.rotate_master_key("u1").unwrap());
		assert!(fx.audit.with_action("security.partial_rotation").is_empty());

		rotated(fx.rotation.rotate_master_key("u1").unwrap());
		assert_eq!(1, fx.audit.with_action("security.partial_rotation").len());
	}

	#[test]
	fn locked_target_is_a_no_op() {
		let fx = Fixture::new();
		doc(&fx, "u1", "doc1", b"contents");

		let _held = lock::try_lock(
			&fx.locks,
			LockTarget::Principal("u1".to_string()),
			days(1),
		)
		.unwrap()
		.unwrap();

		assert_eq!(RotationOutcome::Skipped, fx.rotation.rotate_master_key("u1").unwrap());
		assert!(fx.audit.with_action("rotation.master").is_empty());
	}

	#[test]
	fn unknown_principal_is_not_found() {
		let fx = Fixture::new();

		assert!(matches!(
			fx.rotation.rotate_master_key("nobody"),
			Err(Error::NotFound(_))
		));
	}

	/// Blob store that parks the first `get` until the test lets it continue.
	struct GatedBlobs {
		inner: crate::MemoryBlobStore,
		entered: Mutex<Option<mpsc::Sender<()>>>,
		release: Mutex<Option<mpsc::Receiver<()>>>,
	}

	impl crate::BlobStore for GatedBlobs {
		fn put(&self, address: &str, bytes: Vec<u8>) -> Result<(), Error> {
			self.inner.put(address, bytes)
		}

		fn get(&self, address: &str) -> Result<Vec<u8>, Error> {
			let entered = self.entered.lock().take();
			if let Some(entered) = entered {
				let release = self.release.lock().take();
				entered.send(()).unwrap();
				if let Some(release) = release {
					release.recv().unwrap();
				}
			}
			self.inner.get(address)
		}

		fn delete(&self, address: &str) -> Result<(), Error> {
			self.inner.delete(address)
		}
	}

	#[test]
	fn concurrent_rotations_run_once() {
		let (entered_tx, entered_rx) = mpsc::channel();
		let (release_tx, release_rx) = mpsc::channel();
		let gated = Arc::new(GatedBlobs {
			inner: crate::MemoryBlobStore::new(),
			entered: Mutex::new(None),
			release: Mutex::new(None),
		});
		let fx = Fixture::with_blobs(gated.clone());

		doc(&fx, "u1", "doc1", b"one");
		doc(&fx, "u1", "doc2", b"two");

		// Arm the gate only once setup is done
		*gated.entered.lock() = Some(entered_tx);
		*gated.release.lock() = Some(release_rx);

		std::thread::scope(|s| {
			let first = s.spawn(|| fx.rotation.rotate_master_key("u1").unwrap());

			// The first rotation is now mid-batch, holding the lock
			entered_rx.recv().unwrap();
			let second = fx.rotation.rotate_master_key("u1").unwrap();
			assert_eq!(RotationOutcome::Skipped, second);

			release_tx.send(()).unwrap();
			let summary = rotated(first.join().unwrap());
			assert_eq!(2, summary.succeeded);
		});

		assert_eq!(1, fx.audit.with_action("rotation.master").len());
	}

	#[test]
	fn document_rotation_refreshes_data_keys() {
		let fx = Fixture::new();
		let before = doc(&fx, "u1", "doc1", b"body");

		let summary = rotated(fx.rotation.rotate_document_key("doc1").unwrap());
		assert_eq!(1, summary.succeeded);

		let after = fx.metadata.get_metadata(&ContextId::new("doc1")).unwrap().unwrap();
		assert_eq!(before.key_id, after.key_id);
		assert_ne!((before.iv, before.salt), (after.iv, after.salt));
		assert_eq!(b"body".to_vec(), fx.cipher.open("u1", &ContextId::new("doc1")).unwrap());
		assert_eq!(1, fx.audit.with_action("rotation.document").len());
	}

	#[test]
	fn document_rotation_of_nothing_is_not_found() {
		let fx = Fixture::new();

		assert!(matches!(
			fx.rotation.rotate_document_key("ghost"),
			Err(Error::NotFound(_))
		));
	}

	#[test]
	fn sweep_rotates_once() {
		let fx = Fixture::new();
		doc(&fx, "u1", "doc1", b"a");
		doc(&fx, "u2", "doc2", b"b");

		// Nothing is due yet
		let report = fx.rotation.check_rotation_needs().unwrap();
		assert!(report.rotated.is_empty());

		fx.clock.advance(days(90));
		let first = fx.rotation.check_rotation_needs().unwrap();
		let second = fx.rotation.check_rotation_needs().unwrap();

		assert_eq!(2, first.rotated.len());
		assert!(second.rotated.is_empty());
		assert!(second.skipped.is_empty());
		assert_eq!(2, fx.audit.with_action("rotation.master").len());
	}

	#[test]
	fn sweep_processes_deletions() {
		let fx = Fixture::new();
		let old = doc(&fx, "u1", "doc1", b"a").key_id;

		fx.clock.advance(days(90));
		fx.rotation.check_rotation_needs().unwrap();

		fx.clock.advance(days(7));
		let report = fx.rotation.check_rotation_needs().unwrap();
		assert_eq!(vec![old], report.deletions.deleted);
		assert!(matches!(fx.keys.unwrap(&old), Err(Error::NotFound(_))));
	}

	/// Metadata store whose next key activation can be made to fail.
	struct FlakyActivation {
		inner: Arc<MemoryMetadataStore>,
		fail_next: AtomicBool,
	}

	impl MetadataStore for FlakyActivation {
		fn get_master_key(&self, key_id: &KeyId) -> Result<Option<MasterKey>, Error> {
			self.inner.get_master_key(key_id)
		}

		fn active_master_key(&self, principal_id: &str) -> Result<Option<MasterKey>, Error> {
			self.inner.active_master_key(principal_id)
		}

		fn create_master_key_if_absent(&self, key: MasterKey) -> Result<MasterKey, Error> {
			self.inner.create_master_key_if_absent(key)
		}

		fn put_master_key(&self, key: MasterKey) -> Result<(), Error> {
			self.inner.put_master_key(key)
		}

		fn activate_master_key(
			&self,
			principal_id: &str,
			key_id: &KeyId,
			at: Timestamp,
		) -> Result<Option<MasterKey>, Error> {
			if self.fail_next.swap(false, Ordering::SeqCst) {
				return Err(Error::external_service("metadata store unavailable"));
			}
			self.inner.activate_master_key(principal_id, key_id, at)
		}

		fn mark_deletion_scheduled(&self, key_id: &KeyId) -> Result<(), Error> {
			self.inner.mark_deletion_scheduled(key_id)
		}

		fn list_master_keys(&self) -> Result<Vec<MasterKey>, Error> {
			self.inner.list_master_keys()
		}

		fn delete_master_key(&self, key_id: &KeyId) -> Result<(), Error> {
			self.inner.delete_master_key(key_id)
		}

		fn get_metadata(&self, context_id: &ContextId) -> Result<Option<EncryptionMetadata>, Error> {
			self.inner.get_metadata(context_id)
		}

		fn put_metadata(&self, metadata: EncryptionMetadata) -> Result<(), Error> {
			self.inner.put_metadata(metadata)
		}

		fn compare_and_swap_metadata(
			&self,
			context_id: &ContextId,
			expected_iv: &[u8; IV_LEN],
			new: EncryptionMetadata,
		) -> Result<bool, Error> {
			self.inner.compare_and_swap_metadata(context_id, expected_iv, new)
		}

		fn delete_metadata(&self, context_id: &ContextId) -> Result<(), Error> {
			self.inner.delete_metadata(context_id)
		}

		fn list_metadata(&self) -> Result<Vec<EncryptionMetadata>, Error> {
			self.inner.list_metadata()
		}

		fn metadata_for_principal(
			&self,
			principal_id: &str,
		) -> Result<Vec<EncryptionMetadata>, Error> {
			self.inner.metadata_for_principal(principal_id)
		}

		fn metadata_for_document(&self, document_id: &str) -> Result<Vec<EncryptionMetadata>, Error> {
			self.inner.metadata_for_document(document_id)
		}

		fn count_metadata_for_key(&self, key_id: &KeyId) -> Result<usize, Error> {
			self.inner.count_metadata_for_key(key_id)
		}

		fn get_document(&self, document_id: &str) -> Result<Option<DocumentRecord>, Error> {
			self.inner.get_document(document_id)
		}

		fn put_document(&self, document: DocumentRecord) -> Result<(), Error> {
			self.inner.put_document(document)
		}

		fn list_documents(&self) -> Result<Vec<DocumentRecord>, Error> {
			self.inner.list_documents()
		}

		fn get_version(
			&self,
			document_id: &str,
			version_number: u32,
		) -> Result<Option<DocumentVersion>, Error> {
			self.inner.get_version(document_id, version_number)
		}

		fn put_version(&self, version: DocumentVersion) -> Result<(), Error> {
			self.inner.put_version(version)
		}

		fn list_versions(&self, document_id: &str) -> Result<Vec<DocumentVersion>, Error> {
			self.inner.list_versions(document_id)
		}

		fn delete_version(&self, document_id: &str, version_number: u32) -> Result<(), Error> {
			self.inner.delete_version(document_id, version_number)
		}

		fn put_deletion_schedule(&self, schedule: KeyDeletionSchedule) -> Result<(), Error> {
			self.inner.put_deletion_schedule(schedule)
		}

		fn list_deletion_schedules(&self) -> Result<Vec<KeyDeletionSchedule>, Error> {
			self.inner.list_deletion_schedules()
		}

		fn delete_deletion_schedule(&self, key_id: &KeyId) -> Result<(), Error> {
			self.inner.delete_deletion_schedule(key_id)
		}
	}

	#[test]
	fn failed_activation_is_audited_and_cleaned_up() {
		let mut flaky = None;
		let fx = Fixture::with_parts(
			Config::default(),
			|inner| {
				let store = Arc::new(FlakyActivation {
					inner,
					fail_next: AtomicBool::new(false),
				});
				flaky = Some(store.clone());
				store
			},
			Arc::new(MemoryBlobStore::new()),
		);
		let flaky = flaky.unwrap();

		let original = doc(&fx, "u1", "doc1", b"one").key_id;
		doc(&fx, "u1", "doc2", b"two");
		flaky.fail_next.store(true, Ordering::SeqCst);

		assert!(matches!(
			fx.rotation.rotate_master_key("u1"),
			Err(Error::ExternalService(_))
		));

		let audit = fx.audit.with_action("rotation.master");
		assert_eq!(1, audit.len());
		assert_eq!(Severity::Warning, audit[0].severity);
		assert!(audit[0].detail.starts_with("succeeded=2 failed=0 total=2 error="));

		// The content moved, but the key it moved onto never became active
		let orphan = fx.metadata.get_metadata(&ContextId::new("doc1")).unwrap().unwrap().key_id;
		assert_ne!(original, orphan);
		assert_eq!(
			Some(original),
			fx.metadata.active_master_key("u1").unwrap().map(|k| k.key_id)
		);
		assert_eq!(b"one".to_vec(), fx.cipher.open("u1", &ContextId::new("doc1")).unwrap());

		let summary = rotated(fx.rotation.rotate_master_key("u1").unwrap());
		let current = summary.new_key_id.unwrap();
		assert_eq!(Some(original), summary.old_key_id);
		assert_eq!(2, summary.succeeded);

		// Both superseded keys go once the grace period is over
		fx.clock.advance(days(7));
		let report = fx.rotation.process_deletions().unwrap();
		assert_eq!(2, report.deleted.len());
		assert!(report.deleted.contains(&original));
		assert!(report.deleted.contains(&orphan));
		assert!(fx.keys.unwrap(&current).is_ok());
		assert_eq!(b"two".to_vec(), fx.cipher.open("u1", &ContextId::new("doc2")).unwrap());
	}

	/// Blob store that stalls reads of one address.
	struct SlowBlobs {
		inner: MemoryBlobStore,
		slow: Mutex<Option<String>>,
	}

	impl crate::BlobStore for SlowBlobs {
		fn put(&self, address: &str, bytes: Vec<u8>) -> Result<(), Error> {
			self.inner.put(address, bytes)
		}

		fn get(&self, address: &str) -> Result<Vec<u8>, Error> {
			if self.slow.lock().as_deref() == Some(address) {
				std::thread::sleep(Duration::from_millis(200));
			}
			self.inner.get(address)
		}

		fn delete(&self, address: &str) -> Result<(), Error> {
			self.inner.delete(address)
		}
	}

	#[test]
	fn slow_item_times_out_and_is_left_alone() {
		let slow = Arc::new(SlowBlobs {
			inner: MemoryBlobStore::new(),
			slow: Mutex::new(None),
		});
		let config = Config {
			item_timeout: Duration::from_millis(50),
			..Config::default()
		};
		let fx = Fixture::with_parts(config, |m| m, slow.clone());

		doc(&fx, "u1", "doc1", b"quick");
		let stuck = doc(&fx, "u1", "doc2", b"slow");
		doc(&fx, "u1", "doc3", b"also quick");
		*slow.slow.lock() = Some(stuck.blob_ref.clone());

		let summary = rotated(fx.rotation.rotate_master_key("u1").unwrap());
		*slow.slow.lock() = None;

		assert_eq!((3, 2), (summary.total, summary.succeeded));
		assert_eq!(1, summary.failed.len());
		assert_eq!(ContextId::new("doc2"), summary.failed[0].context_id);
		assert!(summary.failed[0].reason.contains("took longer than"));

		// Untouched: same key, same IV, same blob, still readable
		let ctx = ContextId::new("doc2");
		assert_eq!(stuck, fx.metadata.get_metadata(&ctx).unwrap().unwrap());
		assert!(fx.blobs.get(&stuck.blob_ref).is_ok());
		assert_eq!(b"slow".to_vec(), fx.cipher.open("u1", &ctx).unwrap());

		let new_key = summary.new_key_id.unwrap();
		for id in ["doc1", "doc3"] {
			let m = fx.metadata.get_metadata(&ContextId::new(id)).unwrap().unwrap();
			assert_eq!(new_key, m.key_id);
		}
	}

	#[test]
	fn damaged_key_blob_is_a_security_event() {
		let fx = Fixture::new();
		let m = doc(&fx, "u1", "doc1", b"body");
		assert!(fx.tamper(&format!("keys/{}", m.key_id), |b| {
			let last = b.len() - 1;
			b[last] ^= 1;
		}));

		let summary = rotated(fx.rotation.rotate_master_key("u1").unwrap());
		assert_eq!(1, summary.failed.len());

		let events = fx.audit.with_action("security.integrity");
		assert_eq!(1, events.len());
		assert_eq!("doc1", events[0].subject);
	}

	/// Blob store whose document reads take `step` of (manual) clock time, and which tries to
	/// take the principal's rotation lock at each one.
	struct TickingBlobs {
		inner: MemoryBlobStore,
		hook: Mutex<Option<(ManualClock, Arc<dyn LockManager>, Duration)>>,
		stolen: AtomicBool,
	}

	impl TickingBlobs {
		fn new() -> Self {
			Self {
				inner: MemoryBlobStore::new(),
				hook: Mutex::new(None),
				stolen: AtomicBool::new(false),
			}
		}
	}

	impl crate::BlobStore for TickingBlobs {
		fn put(&self, address: &str, bytes: Vec<u8>) -> Result<(), Error> {
			self.inner.put(address, bytes)
		}

		fn get(&self, address: &str) -> Result<Vec<u8>, Error> {
			let hook = self.hook.lock().clone();
			if let Some((clock, locks, step)) = hook.filter(|_| address.starts_with("blob/")) {
				clock.advance(step);
				let target = LockTarget::Principal("u1".to_string());
				if let Some(token) = locks.try_acquire(&target, Duration::from_secs(1))? {
					self.stolen.store(true, Ordering::SeqCst);
					locks.release(&target, token)?;
				}
			}
			self.inner.get(address)
		}

		fn delete(&self, address: &str) -> Result<(), Error> {
			self.inner.delete(address)
		}
	}

	#[test]
	fn long_batches_keep_their_lock() {
		let ticking = Arc::new(TickingBlobs::new());
		let fx = Fixture::with_blobs(ticking.clone());
		for id in ["doc1", "doc2", "doc3"] {
			doc(&fx, "u1", id, b"contents");
		}

		// Each item takes 6 minutes against a 10 minute lock TTL
		*ticking.hook.lock() = Some((fx.clock.clone(), fx.locks.clone(), Duration::from_secs(360)));
		let summary = rotated(fx.rotation.rotate_master_key("u1").unwrap());

		assert_eq!(3, summary.succeeded);
		assert!(!ticking.stolen.load(Ordering::SeqCst));
	}

	#[test]
	fn batch_stops_once_its_lock_is_lost() {
		let ticking = Arc::new(TickingBlobs::new());
		let fx = Fixture::with_blobs(ticking.clone());
		let original = doc(&fx, "u1", "doc1", b"one").key_id;
		doc(&fx, "u1", "doc2", b"two");
		doc(&fx, "u1", "doc3", b"three");

		// One item outlasts the whole TTL
		*ticking.hook.lock() = Some((fx.clock.clone(), fx.locks.clone(), Duration::from_secs(660)));
		let result = fx.rotation.rotate_master_key("u1");
		*ticking.hook.lock() = None;

		assert!(matches!(result, Err(Error::RotationInProgress(_))));
		assert!(ticking.stolen.load(Ordering::SeqCst));

		let audit = fx.audit.with_action("rotation.master");
		assert_eq!(1, audit.len());
		assert!(audit[0].detail.starts_with("succeeded=1 failed=2 total=3"));

		// Nothing was activated; everything is still readable
		assert_eq!(
			Some(original),
			fx.metadata.active_master_key("u1").unwrap().map(|k| k.key_id)
		);
		for (id, body) in [("doc1", &b"one"[..]), ("doc2", &b"two"[..]), ("doc3", &b"three"[..])] {
			assert_eq!(body.to_vec(), fx.cipher.open("u1", &ContextId::new(id)).unwrap());
		}
	}
}
