//! Lifecycle management for the order engine.
//!
//! Startup hydrates the cache from the store before anything subscribes.
//! Shutdown walks `Running → Draining → Closing → Closed`: stop delivery,
//! wait for in-flight tasks, then release the store and stream connections.
//! A failing step is logged and teardown carries on.

use super::{EngineError, OrderEngine};
use std::fmt;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::watch;

/// Observable phase of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleState {
	Starting,
	Running,
	Draining,
	Closing,
	Closed,
}

impl fmt::Display for LifecycleState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			LifecycleState::Starting => "starting",
			LifecycleState::Running => "running",
			LifecycleState::Draining => "draining",
			LifecycleState::Closing => "closing",
			LifecycleState::Closed => "closed",
		};
		f.write_str(name)
	}
}

impl OrderEngine {
	/// Loads every stored order into the cache.
	///
	/// Runs once; later calls return the current cache size. Any failure is
	/// fatal, since serving from a partially loaded cache would answer
	/// `{}` for orders that exist.
	pub async fn hydrate(&self) -> Result<usize, EngineError> {
		if self.hydrated.load(Ordering::SeqCst) {
			return Ok(self.cache.len().await);
		}

		let table = &self.config.service.table;
		let records = self.storage.load_records(table).await.map_err(|e| {
			EngineError::Startup(format!("Failed to hydrate cache from '{}': {}", table, e))
		})?;
		let count = self.cache.load_all(records).await;
		self.hydrated.store(true, Ordering::SeqCst);

		tracing::info!(component = "engine", table = %table, count, "Cache hydrated");
		Ok(count)
	}

	pub(super) async fn start(&self) -> Result<(), EngineError> {
		tracing::info!(component = "engine", id = %self.config.service.id, "Starting order engine");
		self.hydrate().await?;
		Ok(())
	}

	/// Stops delivery, waits for in-flight work and releases connections.
	pub async fn shutdown(&self) {
		self.set_state(LifecycleState::Draining);
		if let Err(e) = self.stream.unsubscribe().await {
			tracing::error!(component = "engine", error = %e, "Shutdown: failed to unsubscribe");
		}

		let in_flight = self.drain.in_flight();
		if in_flight > 0 {
			tracing::info!(component = "engine", in_flight, "Waiting for in-flight orders");
		}
		match self.config.service.drain_timeout_seconds {
			Some(seconds) => {
				if let Err(remaining) = self
					.drain
					.await_zero_timeout(Duration::from_secs(seconds))
					.await
				{
					tracing::error!(
						component = "engine",
						remaining,
						timeout_seconds = seconds,
						"Shutdown: drain timed out, closing with work in flight"
					);
				}
			},
			None => self.drain.await_zero().await,
		}

		self.set_state(LifecycleState::Closing);
		self.release_connections().await;
		self.set_state(LifecycleState::Closed);
	}

	pub(super) async fn release_connections(&self) {
		if let Err(e) = self.storage.close().await {
			tracing::error!(component = "storage", error = %e, "Shutdown: failed to close store");
		}
		if let Err(e) = self.stream.close().await {
			tracing::error!(component = "stream", error = %e, "Shutdown: failed to close stream");
		}
	}

	pub(super) fn set_state(&self, state: LifecycleState) {
		self.state.send_replace(state);
		tracing::info!(component = "engine", state = %state, "Lifecycle transition");
	}

	pub fn state(&self) -> LifecycleState {
		*self.state.borrow()
	}

	/// Subscribes to lifecycle transitions.
	pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
		self.state.subscribe()
	}
}

/// Resolves on SIGINT (ctrl-c) or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
	let ctrl_c = async {
		if let Err(e) = tokio::signal::ctrl_c().await {
			tracing::error!("Failed to listen for ctrl-c: {}", e);
			std::future::pending::<()>().await;
		}
	};

	#[cfg(unix)]
	let terminate = async {
		use tokio::signal::unix::{signal, SignalKind};
		match signal(SignalKind::terminate()) {
			Ok(mut sigterm) => {
				sigterm.recv().await;
			},
			Err(e) => {
				tracing::error!("Failed to listen for SIGTERM: {}", e);
				std::future::pending::<()>().await;
			},
		}
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => {},
		_ = terminate => {},
	}
	tracing::info!("Shutdown signal received");
}
