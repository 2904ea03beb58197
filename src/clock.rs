use parking_lot::Mutex;
use std::{
	sync::Arc,
	time::{Duration, SystemTime, UNIX_EPOCH},
};

/// Whole seconds since the Unix epoch.
#[derive(Clone, Copy, Debug, Default, PartialEq, PartialOrd, Eq, Ord, Hash)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
	pub fn from_secs(s: u64) -> Self {
		Self(s)
	}

	pub fn as_secs(&self) -> u64 {
		self.0
	}

	/// How long ago `self` was, as seen from `now`.  Timestamps in the future have age zero.
	pub fn age_at(&self, now: Timestamp) -> Duration {
		Duration::from_secs(now.0.saturating_sub(self.0))
	}
}

impl std::fmt::Display for Timestamp {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_fmt(format_args!("{}", self.0))
	}
}

impl std::ops::Add<Duration> for Timestamp {
	type Output = Timestamp;

	fn add(self, t: Duration) -> Self {
		Self(self.0.saturating_add(t.as_secs()))
	}
}

impl std::ops::Sub<Duration> for Timestamp {
	type Output = Timestamp;

	fn sub(self, t: Duration) -> Self {
		Self(self.0.saturating_sub(t.as_secs()))
	}
}

/// Source of "now" for everything that stamps or ages records.
pub trait Clock: Send + Sync + std::fmt::Debug {
	fn now(&self) -> Timestamp;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
	fn now(&self) -> Timestamp {
		Timestamp(
			SystemTime::now()
				.duration_since(UNIX_EPOCH)
				.unwrap_or_default()
				.as_secs(),
		)
	}
}

/// A clock that only moves when told to.  Lets tests skip through grace periods and rotation
/// intervals.
#[derive(Clone, Debug)]
pub struct ManualClock(Arc<Mutex<Timestamp>>);

impl ManualClock {
	pub fn new(start: Timestamp) -> Self {
		Self(Arc::new(Mutex::new(start)))
	}

	/// Start from the real time, then freeze.
	pub fn frozen() -> Self {
		Self::new(SystemClock.now())
	}

	pub fn advance(&self, by: Duration) {
		let mut t = self.0.lock();
		*t = *t + by;
	}
}

impl Clock for ManualClock {
	fn now(&self) -> Timestamp {
		*self.0.lock()
	}
}

/// Shorthand for `n` days.
pub const fn days(n: u64) -> Duration {
	Duration::from_secs(n * 86_400)
}
