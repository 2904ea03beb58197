//! Periodic background jobs: the rotation sweep and the key age scan.
//!
//! Both jobs are synchronous and may block on storage, so each iteration runs on tokio's
//! blocking pool.  A failed iteration is logged and the next tick tries again.

use std::{sync::Arc, time::Duration};
use tokio::{sync::oneshot, task::JoinHandle, time::MissedTickBehavior};

use super::{Error, KeyAgingMonitor, KeyRotationOrchestrator};

pub trait PeriodicTask: Send + Sync + 'static {
	fn name(&self) -> &str;

	fn run(&self) -> Result<(), Error>;
}

/// [`KeyRotationOrchestrator::check_rotation_needs`] as a periodic task.
#[derive(Debug, Clone)]
pub struct RotationSweep(pub Arc<KeyRotationOrchestrator>);

impl PeriodicTask for RotationSweep {
	fn name(&self) -> &str {
		"rotation-sweep"
	}

	fn run(&self) -> Result<(), Error> {
		let report = self.0.check_rotation_needs()?;

		tracing::info!(
			rotated = report.rotated.len(),
			skipped = report.skipped.len(),
			errors = report.errors.len(),
			keys_deleted = report.deletions.deleted.len(),
			keys_deferred = report.deletions.deferred.len(),
			"rotation sweep complete"
		);
		Ok(())
	}
}

/// [`KeyAgingMonitor::monitor_ages`] as a periodic task.
#[derive(Debug, Clone)]
pub struct AgingSweep(pub Arc<KeyAgingMonitor>);

impl PeriodicTask for AgingSweep {
	fn name(&self) -> &str {
		"aging-sweep"
	}

	fn run(&self) -> Result<(), Error> {
		self.0.monitor_ages().map(|_| ())
	}
}

/// Runs one [`PeriodicTask`] on a fixed interval until shut down.
#[derive(Debug)]
pub struct PeriodicRunner;

impl PeriodicRunner {
	/// Start running `task` every `every`, the first run happening straight away.  Must be
	/// called from within a tokio runtime.
	pub fn spawn(task: Arc<dyn PeriodicTask>, every: Duration) -> RunnerHandle {
		let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
		let name = task.name().to_string();

		let join = tokio::spawn(async move {
			let mut timer = tokio::time::interval(every);
			// A slow sweep shouldn't be followed by a burst of catch-up runs
			timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

			loop {
				tokio::select! {
					_ = &mut shutdown_rx => break,
					_ = timer.tick() => {
						let task = task.clone();
						match tokio::task::spawn_blocking(move || task.run()).await {
							Ok(Ok(())) => (),
							Ok(Err(e)) => tracing::error!(task = %name, error = %e, "periodic task failed"),
							Err(e) => tracing::error!(task = %name, error = %e, "periodic task panicked"),
						}
					}
				}
			}

			tracing::info!(task = %name, "periodic task stopped");
		});

		RunnerHandle {
			shutdown: Some(shutdown_tx),
			join,
		}
	}
}

/// Stops its task when [`RunnerHandle::shutdown`] is called.  Dropping the handle without
/// calling `shutdown` leaves the task running for the life of the runtime.
#[derive(Debug)]
pub struct RunnerHandle {
	shutdown: Option<oneshot::Sender<()>>,
	join: JoinHandle<()>,
}

impl RunnerHandle {
	/// Signal the task to stop, and wait for any in-flight run to finish.
	pub async fn shutdown(mut self) {
		if let Some(tx) = self.shutdown.take() {
			let _ = tx.send(());
		}
		if let Err(e) = (&mut self.join).await {
			tracing::error!(error = %e, "periodic runner did not shut down cleanly");
		}
	}

	pub fn is_finished(&self) -> bool {
		self.join.is_finished()
	}
}
