//! In-flight work accounting for orderly shutdown.
//!
//! Every delivered message holds a [`DrainGuard`] from the moment the
//! dispatch loop takes it until its task finishes. Shutdown waits for the
//! count to reach zero before releasing the store connection.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct DrainTracker {
	count: Arc<watch::Sender<usize>>,
}

/// One unit of in-flight work. Dropping it releases the unit.
#[derive(Debug)]
#[must_use = "the unit is released as soon as the guard is dropped"]
pub struct DrainGuard {
	count: Arc<watch::Sender<usize>>,
}

impl Default for DrainTracker {
	fn default() -> Self {
		Self::new()
	}
}

impl DrainTracker {
	pub fn new() -> Self {
		let (count, _) = watch::channel(0);
		Self {
			count: Arc::new(count),
		}
	}

	/// Registers one unit of in-flight work.
	pub fn begin(&self) -> DrainGuard {
		self.count.send_modify(|count| *count += 1);
		DrainGuard {
			count: self.count.clone(),
		}
	}

	pub fn in_flight(&self) -> usize {
		*self.count.borrow()
	}

	/// Waits until no unit is in flight. Returns immediately if none is.
	pub async fn await_zero(&self) {
		let mut rx = self.count.subscribe();
		// The sender lives in self, so the channel cannot close here
		let _ = rx.wait_for(|count| *count == 0).await;
	}

	/// Like [`await_zero`](Self::await_zero) but gives up after `timeout`,
	/// returning the number of units still in flight.
	pub async fn await_zero_timeout(&self, timeout: Duration) -> Result<(), usize> {
		tokio::time::timeout(timeout, self.await_zero())
			.await
			.map_err(|_| self.in_flight())
	}
}

impl DrainGuard {
	/// Releases the unit explicitly.
	pub fn end(self) {}
}

impl Drop for DrainGuard {
	fn drop(&mut self) {
		self.count.send_modify(|count| *count = count.saturating_sub(1));
	}
}
