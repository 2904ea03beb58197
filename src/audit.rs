//! Audit log, alert delivery, and security event reporting.

use parking_lot::Mutex;
use std::sync::Arc;

use super::{Clock, Error, Severity, Timestamp};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuditEntry {
	pub at: Timestamp,
	pub severity: Severity,
	/// Dotted event name, eg. `rotation.master`.
	pub action: String,
	/// The principal, document, or key the event concerns.
	pub subject: String,
	pub detail: String,
}

/// Append-only audit log.
pub trait AuditSink: Send + Sync {
	fn append(&self, entry: AuditEntry) -> Result<(), Error>;
}

/// A user-facing notification channel (in-app, email, ...).
pub trait AlertChannel: Send + Sync {
	fn name(&self) -> &str;

	fn send(&self, principal_id: &str, message: &str, severity: Severity) -> Result<(), Error>;
}

/// The escalation channel for [`Severity::Critical`] alerts.
pub trait PagingChannel: Send + Sync {
	fn page(&self, message: &str) -> Result<(), Error>;
}

/// Write `entry` to `sink`, mirroring it to the `audit` tracing target.  Sink failures are
/// logged and returned.
pub(crate) fn record(sink: &dyn AuditSink, entry: AuditEntry) -> Result<(), Error> {
	tracing::info!(
		target: "audit",
		action = %entry.action,
		subject = %entry.subject,
		severity = %entry.severity,
		detail = %entry.detail,
		"audit"
	);

	sink.append(entry).inspect_err(|e| {
		tracing::error!(error = %e, "audit log write failed");
	})
}

#[derive(Debug, Default)]
pub struct MemoryAuditLog {
	entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditLog {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn entries(&self) -> Vec<AuditEntry> {
		self.entries.lock().clone()
	}

	pub fn with_action(&self, action: &str) -> Vec<AuditEntry> {
		self.entries
			.lock()
			.iter()
			.filter(|e| e.action == action)
			.cloned()
			.collect()
	}
}

impl AuditSink for MemoryAuditLog {
	fn append(&self, entry: AuditEntry) -> Result<(), Error> {
		self.entries.lock().push(entry);
		Ok(())
	}
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentAlert {
	pub principal_id: String,
	pub message: String,
	pub severity: Severity,
}

/// Collects alerts instead of delivering them.  Can be told to fail, to exercise delivery
/// isolation.
#[derive(Debug, Default)]
pub struct MemoryAlertChannel {
	name: String,
	sent: Mutex<Vec<SentAlert>>,
	failing: Mutex<bool>,
}

impl MemoryAlertChannel {
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			..Self::default()
		}
	}

	pub fn sent(&self) -> Vec<SentAlert> {
		self.sent.lock().clone()
	}

	pub fn set_failing(&self, failing: bool) {
		*self.failing.lock() = failing;
	}
}

impl AlertChannel for MemoryAlertChannel {
	fn name(&self) -> &str {
		&self.name
	}

	fn send(&self, principal_id: &str, message: &str, severity: Severity) -> Result<(), Error> {
		if *self.failing.lock() {
			return Err(Error::external_service(format!("{} unavailable", self.name)));
		}

		self.sent.lock().push(SentAlert {
			principal_id: principal_id.to_string(),
			message: message.to_string(),
			severity,
		});
		Ok(())
	}
}

#[derive(Debug, Default)]
pub struct MemoryPager {
	pages: Mutex<Vec<String>>,
	failing: Mutex<bool>,
}

impl MemoryPager {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn pages(&self) -> Vec<String> {
		self.pages.lock().clone()
	}

	pub fn set_failing(&self, failing: bool) {
		*self.failing.lock() = failing;
	}
}

impl PagingChannel for MemoryPager {
	fn page(&self, message: &str) -> Result<(), Error> {
		if *self.failing.lock() {
			return Err(Error::external_service("pager unavailable"));
		}

		self.pages.lock().push(message.to_string());
		Ok(())
	}
}

/// Kinds of event that always land in the security log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SecurityEvent {
	/// An AEAD tag (or wrapped key) failed verification.
	IntegrityFailure,
	/// Decrypted content did not match its recorded checksum.
	ChecksumMismatch,
	/// A rotation target has failed items on several sweeps in a row.
	RepeatedPartialRotation,
}

impl SecurityEvent {
	fn action(&self) -> &'static str {
		match self {
			SecurityEvent::IntegrityFailure => "security.integrity",
			SecurityEvent::ChecksumMismatch => "security.corruption",
			SecurityEvent::RepeatedPartialRotation => "security.partial_rotation",
		}
	}

	fn severity(&self) -> Severity {
		match self {
			SecurityEvent::IntegrityFailure | SecurityEvent::ChecksumMismatch => {
				Severity::Critical
			}
			SecurityEvent::RepeatedPartialRotation => Severity::Warning,
		}
	}
}

/// Where integrity, corruption and rotation-failure events go.
///
/// Every event is written to the audit sink and the `security` tracing target.  Events at or
/// above the alert threshold are also sent to the alert channel, addressed to the affected
/// principal.
#[derive(Clone)]
pub struct SecurityEvents {
	audit: Arc<dyn AuditSink>,
	alerts: Option<Arc<dyn AlertChannel>>,
	threshold: Severity,
	clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for SecurityEvents {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SecurityEvents")
			.field("threshold", &self.threshold)
			.field("alerting", &self.alerts.is_some())
			.finish_non_exhaustive()
	}
}

impl SecurityEvents {
	pub fn new(audit: Arc<dyn AuditSink>, clock: Arc<dyn Clock>) -> Self {
		Self {
			audit,
			alerts: None,
			threshold: Severity::Critical,
			clock,
		}
	}

	pub fn with_alerts(mut self, alerts: Arc<dyn AlertChannel>, threshold: Severity) -> Self {
		self.alerts = Some(alerts);
		self.threshold = threshold;
		self
	}

	/// Report an event.  Never fails: a broken audit sink or alert channel is logged, and the
	/// caller carries on surfacing its own error.
	pub fn report(&self, event: SecurityEvent, principal_id: &str, subject: &str, detail: &str) {
		let severity = event.severity();

		tracing::warn!(
			target: "security",
			action = event.action(),
			%principal_id,
			%subject,
			%severity,
			%detail,
			"security event"
		);

		let _ = record(
			self.audit.as_ref(),
			AuditEntry {
				at: self.clock.now(),
				severity,
				action: event.action().to_string(),
				subject: subject.to_string(),
				detail: detail.to_string(),
			},
		);

		if severity < self.threshold {
			return;
		}

		if let Some(alerts) = &self.alerts {
			let message = format!("{}: {subject}", event.action());
			if let Err(e) = alerts.send(principal_id, &message, severity) {
				tracing::error!(channel = alerts.name(), error = %e, "security alert delivery failed");
			}
		}
	}
}
