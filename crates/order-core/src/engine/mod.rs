//! Core engine for the order cache service.
//!
//! The engine owns the cache, the store connection and the stream
//! connection. It hydrates the cache, subscribes to the order channel and
//! runs one dispatch loop that hands every delivered message to its own
//! task, bounded by a semaphore of `max_in_flight` permits.

use crate::cache::CacheStore;
use crate::drain::DrainTracker;
use crate::handlers::EventHandler;
use crate::lookup::LookupService;
use order_config::Config;
use order_storage::StorageService;
use order_stream::{StreamMessage, StreamService};
use std::future::Future;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};

pub mod lifecycle;

pub use lifecycle::{shutdown_signal, LifecycleState};

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
	/// The engine could not start: the store or stream was unreachable, or
	/// hydration failed. The process must not serve.
	#[error("Startup error: {0}")]
	Startup(String),
	#[error("Service error: {0}")]
	Service(String),
}

/// Main engine that keeps the cache in sync with the order channel.
pub struct OrderEngine {
	config: Config,
	storage: Arc<StorageService>,
	stream: Arc<StreamService>,
	cache: Arc<CacheStore>,
	drain: DrainTracker,
	handler: Arc<EventHandler>,
	state: watch::Sender<LifecycleState>,
	hydrated: AtomicBool,
}

/// Result of waiting on the delivery channel.
enum Next {
	Message(StreamMessage),
	ChannelClosed,
	Shutdown,
}

impl OrderEngine {
	pub fn new(config: Config, storage: Arc<StorageService>, stream: Arc<StreamService>) -> Self {
		let cache = Arc::new(CacheStore::new());
		let handler = Arc::new(EventHandler::new(
			storage.clone(),
			cache.clone(),
			Arc::new(Mutex::new(())),
			config.service.table.clone(),
		));
		let (state, _) = watch::channel(LifecycleState::Starting);

		Self {
			config,
			storage,
			stream,
			cache,
			drain: DrainTracker::new(),
			handler,
			state,
			hydrated: AtomicBool::new(false),
		}
	}

	/// Runs the engine until SIGINT or SIGTERM, then shuts down.
	pub async fn run(&self) -> Result<(), EngineError> {
		self.run_until(shutdown_signal()).await
	}

	/// Hydrates the cache if needed, subscribes and dispatches messages
	/// until `shutdown` resolves, then drains and closes both connections.
	pub async fn run_until<F>(&self, shutdown: F) -> Result<(), EngineError>
	where
		F: Future<Output = ()>,
	{
		if self.state() != LifecycleState::Starting {
			return Err(EngineError::Service("Engine has already been started".into()));
		}

		if let Err(e) = self.start().await {
			tracing::error!(component = "engine", error = %e, "Startup failed");
			self.release_connections().await;
			self.set_state(LifecycleState::Closed);
			return Err(e);
		}

		let (tx, mut rx) = mpsc::channel(self.config.service.delivery_buffer);
		let stream_config = &self.config.stream;
		if let Err(e) = self
			.stream
			.subscribe(
				&stream_config.channel,
				&stream_config.durable_name,
				stream_config.deliver_policy,
				tx,
			)
			.await
		{
			self.release_connections().await;
			self.set_state(LifecycleState::Closed);
			return Err(EngineError::Startup(format!(
				"Failed to subscribe to '{}': {}",
				stream_config.channel, e
			)));
		}

		self.set_state(LifecycleState::Running);
		self.dispatch(&mut rx, shutdown).await;
		self.shutdown().await;
		Ok(())
	}

	/// Hands each delivered message to its own task until `shutdown`.
	///
	/// A drain unit is registered as soon as a message is taken from the
	/// channel. The loop then waits for a permit, so with every permit in use
	/// it stops reading, the bounded channel fills up and the stream pump
	/// blocks. The drain count therefore covers dispatched messages only.
	/// Up to `delivery_buffer` messages still queued in the channel at
	/// shutdown are dropped unacknowledged and come back on resubscribe.
	async fn dispatch<F>(&self, rx: &mut mpsc::Receiver<StreamMessage>, shutdown: F)
	where
		F: Future<Output = ()>,
	{
		let semaphore = Arc::new(Semaphore::new(self.config.service.max_in_flight));
		tokio::pin!(shutdown);

		loop {
			let next = tokio::select! {
				message = rx.recv() => message.map_or(Next::ChannelClosed, Next::Message),
				_ = &mut shutdown => Next::Shutdown,
			};

			let message = match next {
				Next::Message(message) => message,
				Next::ChannelClosed => {
					tracing::warn!(component = "engine", "Delivery stopped unexpectedly, waiting for shutdown");
					shutdown.as_mut().await;
					break;
				},
				Next::Shutdown => break,
			};

			let guard = self.drain.begin();
			let permit = tokio::select! {
				permit = semaphore.clone().acquire_owned() => permit,
				// Message and guard are dropped unacknowledged; redelivered later
				_ = &mut shutdown => break,
			};
			let permit = match permit {
				Ok(permit) => permit,
				Err(e) => {
					tracing::error!("Failed to acquire semaphore permit: {}", e);
					break;
				},
			};

			let handler = self.handler.clone();
			tokio::spawn(async move {
				let _permit = permit;
				let _guard = guard;
				if let Err(e) = handler.handle(message).await {
					tracing::error!("Handler error: {}", e);
				}
			});
		}
	}

	pub fn lookup_service(&self) -> LookupService {
		LookupService::new(self.cache.clone())
	}

	/// Returns a reference to the configuration.
	pub fn config(&self) -> &Config {
		&self.config
	}

	pub fn cache(&self) -> &Arc<CacheStore> {
		&self.cache
	}

	pub fn drain(&self) -> &DrainTracker {
		&self.drain
	}

	/// Returns a reference to the storage service.
	pub fn storage(&self) -> &Arc<StorageService> {
		&self.storage
	}

	pub fn stream(&self) -> &Arc<StreamService> {
		&self.stream
	}
}
