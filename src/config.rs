use std::{env, time::Duration};

use super::{Error, Severity, days};

const HOUR: u64 = 3_600;

/// Intervals, thresholds and timeouts for rotation, key deletion and age monitoring.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
	/// How long a master key stays active before the sweep rotates it.
	pub master_rotation_interval: Duration,
	/// How long a document's content goes without fresh data keys before the sweep rotates it.
	pub document_rotation_interval: Duration,
	/// Delay between superseding a master key and deleting its material.
	pub deletion_grace: Duration,
	/// How far to push back a due deletion whose key is still referenced.
	pub deletion_recheck: Duration,
	pub lock_ttl: Duration,
	/// Budget for re-encrypting one item during a rotation.
	pub item_timeout: Duration,
	pub warning_age: Duration,
	pub critical_age: Duration,
	pub monitor_interval: Duration,
	pub rotation_sweep_interval: Duration,
	/// Consecutive partially-failed rotations of one target before a security event is raised.
	pub partial_failure_alert_after: u32,
	/// Security events at or above this severity are alerted on, not just logged.
	pub security_alert_threshold: Severity,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			master_rotation_interval: days(90),
			document_rotation_interval: days(30),
			deletion_grace: days(7),
			deletion_recheck: days(1),
			lock_ttl: Duration::from_secs(600),
			item_timeout: Duration::from_secs(30),
			warning_age: days(60),
			critical_age: days(80),
			monitor_interval: Duration::from_secs(12 * HOUR),
			rotation_sweep_interval: Duration::from_secs(24 * HOUR),
			partial_failure_alert_after: 2,
			security_alert_threshold: Severity::Critical,
		}
	}
}

impl Config {
	/// Defaults, overridden by any `DOC_VAULT_*` environment variables that are set.
	pub fn from_env() -> Result<Self, Error> {
		Self::from_lookup(|name| env::var(name).ok())
	}

	/// Like [`Config::from_env`], reading variables through `lookup`.
	#[tracing::instrument(level = "debug", skip(lookup))]
	pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
		let mut config = Self::default();
		let day = days(1).as_secs();

		let durations: [(&str, u64, &mut Duration); 10] = [
			("DOC_VAULT_MASTER_ROTATION_DAYS", day, &mut config.master_rotation_interval),
			("DOC_VAULT_DOCUMENT_ROTATION_DAYS", day, &mut config.document_rotation_interval),
			("DOC_VAULT_DELETION_GRACE_DAYS", day, &mut config.deletion_grace),
			("DOC_VAULT_DELETION_RECHECK_SECS", 1, &mut config.deletion_recheck),
			("DOC_VAULT_LOCK_TTL_SECS", 1, &mut config.lock_ttl),
			("DOC_VAULT_ITEM_TIMEOUT_SECS", 1, &mut config.item_timeout),
			("DOC_VAULT_WARNING_AGE_DAYS", day, &mut config.warning_age),
			("DOC_VAULT_CRITICAL_AGE_DAYS", day, &mut config.critical_age),
			("DOC_VAULT_MONITOR_INTERVAL_SECS", 1, &mut config.monitor_interval),
			("DOC_VAULT_ROTATION_SWEEP_INTERVAL_SECS", 1, &mut config.rotation_sweep_interval),
		];

		for (name, unit, slot) in durations {
			if let Some(n) = parse_number(&lookup, name)? {
				*slot = Duration::from_secs(n.saturating_mul(unit));
			}
		}

		if let Some(n) = parse_number(&lookup, "DOC_VAULT_PARTIAL_FAILURE_ALERT_AFTER")? {
			config.partial_failure_alert_after = u32::try_from(n).map_err(|_| {
				Error::invalid_config("DOC_VAULT_PARTIAL_FAILURE_ALERT_AFTER is too large")
			})?;
		}

		if let Some(s) = lookup("DOC_VAULT_SECURITY_ALERT_THRESHOLD") {
			config.security_alert_threshold = match s.trim().to_ascii_lowercase().as_str() {
				"info" => Severity::Info,
				"warning" => Severity::Warning,
				"critical" => Severity::Critical,
				other => {
					return Err(Error::invalid_config(format!(
						"DOC_VAULT_SECURITY_ALERT_THRESHOLD: unknown severity {other:?}"
					)));
				}
			};
		}

		config.validate()?;
		Ok(config)
	}

	pub fn validate(&self) -> Result<(), Error> {
		if self.critical_age < self.warning_age {
			return Err(Error::invalid_config(
				"critical age must not be shorter than warning age",
			));
		}
		if self.lock_ttl.is_zero() {
			return Err(Error::invalid_config("lock TTL must be positive"));
		}
		if self.item_timeout.is_zero() {
			return Err(Error::invalid_config("item timeout must be positive"));
		}
		Ok(())
	}
}

fn parse_number(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<u64>, Error> {
	lookup(name)
		.filter(|s| !s.trim().is_empty())
		.map(|s| {
			s.trim()
				.parse::<u64>()
				.map_err(|_| Error::invalid_config(format!("{name}: expected a whole number, got {s:?}")))
		})
		.transpose()
}
