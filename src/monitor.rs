use std::{sync::Arc, time::Duration};

use super::{
	AlertChannel, AuditEntry, AuditSink, Clock, Config, ContextId, Error, KeyId, KeyState,
	MetadataStore, PagingChannel, Severity, audit,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AgedItem {
	MasterKey { key_id: KeyId },
	Ciphertext { context_id: ContextId, key_id: KeyId },
}

impl std::fmt::Display for AgedItem {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			AgedItem::MasterKey { key_id } => write!(f, "master key {key_id}"),
			AgedItem::Ciphertext { context_id, .. } => write!(f, "encryption of {context_id}"),
		}
	}
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgingFinding {
	pub principal_id: String,
	pub item: AgedItem,
	pub age: Duration,
	pub severity: Severity,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AgingReport {
	pub findings: Vec<AgingFinding>,
	/// Individual channel deliveries (alert, page, or audit write) that failed.
	pub delivery_failures: usize,
}

impl AgingReport {
	pub fn count(&self, severity: Severity) -> usize {
		self.findings
			.iter()
			.filter(|f| f.severity == severity)
			.count()
	}
}

/// Finds keys and ciphertexts that have gone too long without rotation, and tells people.
///
/// Only ever reports: fixing things is the
/// [`KeyRotationOrchestrator`](super::KeyRotationOrchestrator)'s job.
pub struct KeyAgingMonitor {
	warning_age: Duration,
	critical_age: Duration,
	metadata: Arc<dyn MetadataStore>,
	channels: Vec<Arc<dyn AlertChannel>>,
	pager: Option<Arc<dyn PagingChannel>>,
	audit: Arc<dyn AuditSink>,
	clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for KeyAgingMonitor {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("KeyAgingMonitor")
			.field("warning_age", &self.warning_age)
			.field("critical_age", &self.critical_age)
			.field("channels", &self.channels.iter().map(|c| c.name().to_string()).collect::<Vec<_>>())
			.field("paging", &self.pager.is_some())
			.finish_non_exhaustive()
	}
}

impl KeyAgingMonitor {
	pub fn new(
		config: &Config,
		metadata: Arc<dyn MetadataStore>,
		audit: Arc<dyn AuditSink>,
		clock: Arc<dyn Clock>,
	) -> Self {
		Self {
			warning_age: config.warning_age,
			critical_age: config.critical_age,
			metadata,
			channels: Vec::new(),
			pager: None,
			audit,
			clock,
		}
	}

	/// Deliver alerts of either severity through `channel` too.
	pub fn with_channel(mut self, channel: Arc<dyn AlertChannel>) -> Self {
		self.channels.push(channel);
		self
	}

	/// Escalate critical alerts through `pager`.
	pub fn with_pager(mut self, pager: Arc<dyn PagingChannel>) -> Self {
		self.pager = Some(pager);
		self
	}

	/// Severity purely from age: critical beats warning, anything younger is fine.
	pub fn classify(&self, age: Duration) -> Option<Severity> {
		if age >= self.critical_age {
			Some(Severity::Critical)
		} else if age >= self.warning_age {
			Some(Severity::Warning)
		} else {
			None
		}
	}

	/// Scan every active master key and every ciphertext, and alert on the old ones.
	///
	/// Fails only if the metadata store can't be read; delivery problems are counted in the
	/// report and never stop the other channels, or the audit log write.
	#[tracing::instrument(level = "info", skip(self))]
	pub fn monitor_ages(&self) -> Result<AgingReport, Error> {
		let now = self.clock.now();
		let mut report = AgingReport::default();

		for key in self.metadata.list_master_keys()? {
			if key.state != KeyState::Active {
				continue;
			}
			let age = key.last_rotated_at.age_at(now);
			if let Some(severity) = self.classify(age) {
				report.findings.push(AgingFinding {
					principal_id: key.principal_id,
					item: AgedItem::MasterKey { key_id: key.key_id },
					age,
					severity,
				});
			}
		}

		for m in self.metadata.list_metadata()? {
			let age = m.created_at.age_at(now);
			if let Some(severity) = self.classify(age) {
				report.findings.push(AgingFinding {
					principal_id: m.principal_id,
					item: AgedItem::Ciphertext {
						context_id: m.context_id,
						key_id: m.key_id,
					},
					age,
					severity,
				});
			}
		}

		for finding in &report.findings {
			report.delivery_failures += self.deliver(finding);
		}

		tracing::info!(
			warnings = report.count(Severity::Warning),
			critical = report.count(Severity::Critical),
			delivery_failures = report.delivery_failures,
			"key age scan complete"
		);

		Ok(report)
	}

	/// Returns the number of failed deliveries.
	fn deliver(&self, finding: &AgingFinding) -> usize {
		let mut failures = 0;
		let age_days = finding.age.as_secs() / 86_400;
		let message = format!(
			"{}: {} is {age_days} days old and due for rotation",
			finding.severity, finding.item
		);

		for channel in &self.channels {
			if let Err(e) = channel.send(&finding.principal_id, &message, finding.severity) {
				tracing::warn!(channel = channel.name(), error = %e, "alert delivery failed");
				failures += 1;
			}
		}

		if finding.severity == Severity::Critical {
			if let Some(pager) = &self.pager {
				if let Err(e) = pager.page(&format!("[{}] {message}", finding.principal_id)) {
					tracing::warn!(error = %e, "page failed");
					failures += 1;
				}
			}
		}

		let action = match finding.item {
			AgedItem::MasterKey { .. } => "aging.master_key",
			AgedItem::Ciphertext { .. } => "aging.ciphertext",
		};
		if audit::record(
			self.audit.as_ref(),
			AuditEntry {
				at: self.clock.now(),
				severity: finding.severity,
				action: action.to_string(),
				subject: finding.item.to_string(),
				detail: message,
			},
		)
		.is_err()
		{
			failures += 1;
		}

		failures
	}
}
