//! Shared harness for the engine integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use order_config::Config;
use order_core::{EngineError, LifecycleState, OrderEngine};
use order_storage::implementations::memory::MemoryStorage;
use order_storage::{StorageError, StorageInterface, StorageService};
use order_stream::implementations::memory::MemoryStream;
use order_stream::StreamService;
use order_types::ConfigSchema;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const CHANNEL: &str = "order-data";
pub const TABLE: &str = "order_data";

pub fn order_json(id: &str, track: &str) -> Vec<u8> {
	serde_json::to_vec(&serde_json::json!({
		"order_uid": id,
		"track_number": track,
		"entry": "WBIL",
		"delivery": { "name": "Test Testov", "city": "Kiryat Mozkin" },
		"payment": { "transaction": id, "currency": "USD", "amount": 1817 },
		"items": [{ "chrt_id": 9934930, "track_number": track, "price": 453 }],
		"locale": "en",
		"customer_id": "test",
		"date_created": "2021-11-26T06:22:19Z"
	}))
	.unwrap()
}

/// Storage double wrapping a memory connection. It can slow down or reject
/// upserts and records whether it was closed while an upsert was running.
pub struct ControlledStorage {
	inner: MemoryStorage,
	upsert_delay: Duration,
	failures_left: AtomicUsize,
	pub probe: StorageProbe,
}

#[derive(Clone, Default)]
pub struct StorageProbe {
	pub upsert_attempts: Arc<AtomicUsize>,
	pub upserts_in_flight: Arc<AtomicUsize>,
	pub peak_upserts_in_flight: Arc<AtomicUsize>,
	pub closed_during_upsert: Arc<AtomicBool>,
	pub closed: Arc<AtomicBool>,
}

impl ControlledStorage {
	pub fn new(inner: MemoryStorage) -> Self {
		Self {
			inner,
			upsert_delay: Duration::ZERO,
			failures_left: AtomicUsize::new(0),
			probe: StorageProbe::default(),
		}
	}

	pub fn with_delay(mut self, delay: Duration) -> Self {
		self.upsert_delay = delay;
		self
	}

	/// Rejects every upsert.
	pub fn failing(self) -> Self {
		self.failing_times(usize::MAX)
	}

	/// Rejects the next `times` upserts, then recovers.
	pub fn failing_times(self, times: usize) -> Self {
		self.failures_left.store(times, Ordering::SeqCst);
		self
	}
}

#[async_trait]
impl StorageInterface for ControlledStorage {
	async fn bulk_load(&self, table: &str) -> Result<Vec<u8>, StorageError> {
		self.inner.bulk_load(table).await
	}

	async fn upsert(&self, table: &str, value: Vec<u8>, id: &str) -> Result<(), StorageError> {
		self.probe.upsert_attempts.fetch_add(1, Ordering::SeqCst);
		let in_flight = self.probe.upserts_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
		self.probe
			.peak_upserts_in_flight
			.fetch_max(in_flight, Ordering::SeqCst);
		tokio::time::sleep(self.upsert_delay).await;

		let should_fail = self
			.failures_left
			.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
			.is_ok();
		let result = if should_fail {
			Err(StorageError::Backend("store unavailable".into()))
		} else {
			self.inner.upsert(table, value, id).await
		};
		self.probe.upserts_in_flight.fetch_sub(1, Ordering::SeqCst);
		result
	}

	async fn get_bytes(&self, table: &str, id: &str) -> Result<Vec<u8>, StorageError> {
		self.inner.get_bytes(table, id).await
	}

	async fn exists(&self, table: &str, id: &str) -> Result<bool, StorageError> {
		self.inner.exists(table, id).await
	}

	async fn count(&self, table: &str) -> Result<usize, StorageError> {
		self.inner.count(table).await
	}

	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		self.inner.config_schema()
	}

	async fn close(&self) -> Result<(), StorageError> {
		if self.probe.upserts_in_flight.load(Ordering::SeqCst) > 0 {
			self.probe.closed_during_upsert.store(true, Ordering::SeqCst);
		}
		self.probe.closed.store(true, Ordering::SeqCst);
		self.inner.close().await
	}
}

/// An engine running on a background task.
pub struct RunningEngine {
	pub engine: Arc<OrderEngine>,
	stop: Option<oneshot::Sender<()>>,
	handle: JoinHandle<Result<(), EngineError>>,
}

pub fn engine(
	config: Config,
	storage: Box<dyn StorageInterface>,
	stream: &MemoryStream,
) -> Arc<OrderEngine> {
	Arc::new(OrderEngine::new(
		config,
		Arc::new(StorageService::new(storage)),
		Arc::new(StreamService::new(Box::new(stream.connect()))),
	))
}

/// Starts `engine` and waits until it is subscribed.
pub async fn start(engine: Arc<OrderEngine>) -> RunningEngine {
	let (stop_tx, stop_rx) = oneshot::channel::<()>();
	let handle = {
		let engine = engine.clone();
		tokio::spawn(async move {
			engine
				.run_until(async {
					let _ = stop_rx.await;
				})
				.await
		})
	};

	let mut state = engine.subscribe_state();
	tokio::time::timeout(
		Duration::from_secs(5),
		state.wait_for(|state| *state >= LifecycleState::Running),
	)
	.await
	.expect("engine did not start in time")
	.expect("state channel closed");

	RunningEngine {
		engine,
		stop: Some(stop_tx),
		handle,
	}
}

impl RunningEngine {
	/// Signals shutdown and waits for the engine to finish.
	pub async fn stop(mut self) -> Result<(), EngineError> {
		if let Some(stop) = self.stop.take() {
			let _ = stop.send(());
		}
		tokio::time::timeout(Duration::from_secs(10), self.handle)
			.await
			.expect("engine did not stop in time")
			.expect("engine task panicked")
	}
}

/// Polls `check` until it holds, failing the test after five seconds.
pub async fn eventually<F, Fut>(mut check: F)
where
	F: FnMut() -> Fut,
	Fut: Future<Output = bool>,
{
	let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
	while !check().await {
		assert!(
			tokio::time::Instant::now() < deadline,
			"condition not met in time"
		);
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
}
