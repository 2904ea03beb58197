//! Advisory, TTL-bounded locks that serialize rotation (and version writes) per target.

use parking_lot::Mutex;
use std::{
	collections::HashMap,
	sync::{
		Arc,
		atomic::{AtomicU64, Ordering},
	},
	time::Duration,
};

use super::{Clock, Error, Timestamp};

/// What a lock protects.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum LockTarget {
	Principal(String),
	Document(String),
}

impl std::fmt::Display for LockTarget {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			LockTarget::Principal(p) => write!(f, "principal:{p}"),
			LockTarget::Document(d) => write!(f, "document:{d}"),
		}
	}
}

/// A lock service shared by every worker that may touch the same targets.
pub trait LockManager: Send + Sync {
	/// Take the lock on `target` for at most `ttl`, or return `None` if someone else holds it.
	/// An expired lock counts as free.
	fn try_acquire(&self, target: &LockTarget, ttl: Duration) -> Result<Option<u64>, Error>;

	/// Release a lock previously acquired with the given token.  Releasing a lock that has
	/// since expired and been taken by someone else does nothing.
	fn release(&self, target: &LockTarget, token: u64) -> Result<(), Error>;

	/// Push the expiry of a lock still held with `token` out to `ttl` from now.  Returns
	/// `false`, and changes nothing, if the lock has expired or changed hands.
	fn extend(&self, target: &LockTarget, token: u64, ttl: Duration) -> Result<bool, Error>;
}

/// Held lock; released when dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
	manager: Arc<dyn LockManager>,
	target: LockTarget,
	token: u64,
}

impl std::fmt::Debug for LockGuard {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("LockGuard")
			.field("target", &self.target)
			.field("token", &self.token)
			.finish()
	}
}

impl LockGuard {
	pub fn target(&self) -> &LockTarget {
		&self.target
	}

	/// Keep holding the lock for another `ttl`.  Fails with [`Error::RotationInProgress`] if it
	/// was lost in the meantime, after which nothing it protects should be touched.
	pub fn extend(&self, ttl: Duration) -> Result<(), Error> {
		if self.manager.extend(&self.target, self.token, ttl)? {
			Ok(())
		} else {
			Err(Error::rotation_in_progress(format!(
				"lock on {} expired before the work finished",
				self.target
			)))
		}
	}
}

impl Drop for LockGuard {
	fn drop(&mut self) {
		if let Err(e) = self.manager.release(&self.target, self.token) {
			tracing::warn!(target_lock = %self.target, error = %e, "failed to release lock; it will expire");
		}
	}
}

/// Acquire a guard over `target`, or `None` if it is held.
pub fn try_lock(
	manager: &Arc<dyn LockManager>,
	target: LockTarget,
	ttl: Duration,
) -> Result<Option<LockGuard>, Error> {
	Ok(manager.try_acquire(&target, ttl)?.map(|token| {
		tracing::trace!(lock = %target, token, "lock acquired");
		LockGuard {
			manager: Arc::clone(manager),
			target,
			token,
		}
	}))
}

#[derive(Debug)]
pub struct MemoryLockManager {
	clock: Arc<dyn Clock>,
	next_token: AtomicU64,
	held: Mutex<HashMap<LockTarget, (u64, Timestamp)>>,
}

impl MemoryLockManager {
	pub fn new(clock: Arc<dyn Clock>) -> Self {
		Self {
			clock,
			next_token: AtomicU64::new(1),
			held: Mutex::new(HashMap::new()),
		}
	}
}

impl LockManager for MemoryLockManager {
	fn try_acquire(&self, target: &LockTarget, ttl: Duration) -> Result<Option<u64>, Error> {
		let now = self.clock.now();
		let mut held = self.held.lock();

		if let Some((_, expires)) = held.get(target) {
			if *expires > now {
				return Ok(None);
			}
			tracing::debug!(lock = %target, "taking over expired lock");
		}

		let token = self.next_token.fetch_add(1, Ordering::Relaxed);
		held.insert(target.clone(), (token, now + ttl));
		Ok(Some(token))
	}

	fn release(&self, target: &LockTarget, token: u64) -> Result<(), Error> {
		let mut held = self.held.lock();

		if held.get(target).is_some_and(|(t, _)| *t == token) {
			held.remove(target);
		}
		Ok(())
	}

	fn extend(&self, target: &LockTarget, token: u64, ttl: Duration) -> Result<bool, Error> {
		let now = self.clock.now();
		let mut held = self.held.lock();

		match held.get_mut(target) {
			Some((t, expires)) if *t == token && *expires > now => {
				*expires = now + ttl;
				Ok(true)
			}
			_ => Ok(false),
		}
	}
}
