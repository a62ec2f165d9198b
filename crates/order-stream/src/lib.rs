//! Durable event stream module for the order cache service.
//!
//! Transports implement a small append-only log interface ([`StreamInterface`]):
//! append a payload to a channel, read entries after a sequence number and
//! persist per-durable cursors. [`StreamService`] layers a durable
//! subscription on top of it. Messages are pushed into a bounded channel and
//! stay pending until the consumer acknowledges them, and resubscribing under
//! the same durable name redelivers whatever was never acknowledged. A
//! negative acknowledgement gets a message delivered again without waiting
//! for a resubscribe.

use async_trait::async_trait;
use order_types::{ConfigSchema, DeliverPolicy, ImplementationRegistry};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Re-export implementations
pub mod implementations {
	pub mod file;
	pub mod memory;
}

/// Number of log entries fetched per read while pumping a subscription.
const READ_BATCH: usize = 128;

/// Fallback wait between polls for transports that cannot signal appends.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Pause after a failed read before the pump tries again.
const READ_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Wait before a negatively acknowledged message is delivered again.
pub const REDELIVERY_DELAY: Duration = Duration::from_secs(1);

/// Errors that can occur during stream operations.
#[derive(Debug, Error)]
pub enum StreamError {
	/// Error raised by the underlying transport.
	#[error("Backend error: {0}")]
	Backend(String),
	/// Error that occurs when a log entry or cursor cannot be encoded or decoded.
	#[error("Serialization error: {0}")]
	Serialization(String),
	/// Error that occurs during configuration validation.
	#[error("Configuration error: {0}")]
	Configuration(String),
	/// Error that occurs when subscribing while a subscription is active.
	#[error("Already subscribed")]
	AlreadySubscribed,
	/// Error that occurs when the transport connection has been released.
	#[error("Stream connection is closed")]
	Closed,
}

/// One entry of a channel log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
	/// Position in the channel, starting at 1.
	pub sequence: u64,
	pub payload: Vec<u8>,
}

/// Acknowledgement state of one durable identity on one channel.
///
/// Every sequence up to and including `ack_floor` is acknowledged. Sequences
/// above the floor that were acknowledged out of order are kept in `acked`
/// until the gap below them closes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurableCursor {
	pub ack_floor: u64,
	#[serde(default)]
	pub acked: BTreeSet<u64>,
}

impl DurableCursor {
	/// A cursor that treats everything up to `sequence` as already delivered.
	pub fn starting_after(sequence: u64) -> Self {
		Self {
			ack_floor: sequence,
			acked: BTreeSet::new(),
		}
	}

	pub fn is_acked(&self, sequence: u64) -> bool {
		sequence <= self.ack_floor || self.acked.contains(&sequence)
	}

	/// Records an acknowledgement. Returns false if it was already recorded.
	pub fn ack(&mut self, sequence: u64) -> bool {
		if self.is_acked(sequence) {
			return false;
		}
		self.acked.insert(sequence);
		while self.acked.remove(&(self.ack_floor + 1)) {
			self.ack_floor += 1;
		}
		true
	}
}

/// Trait defining the low-level interface for stream transports.
#[async_trait]
pub trait StreamInterface: Send + Sync {
	/// Appends `payload` to `channel` and returns its sequence number.
	async fn append(&self, channel: &str, payload: Vec<u8>) -> Result<u64, StreamError>;

	/// Returns up to `limit` entries with a sequence greater than `after`,
	/// in sequence order.
	async fn read_after(
		&self,
		channel: &str,
		after: u64,
		limit: usize,
	) -> Result<Vec<StoredMessage>, StreamError>;

	/// Sequence of the newest entry in `channel`, or 0 when it is empty.
	async fn last_sequence(&self, channel: &str) -> Result<u64, StreamError>;

	/// Loads the saved cursor of `durable`, if it ever subscribed.
	async fn load_cursor(
		&self,
		channel: &str,
		durable: &str,
	) -> Result<Option<DurableCursor>, StreamError>;

	/// Persists the cursor of `durable`.
	async fn store_cursor(
		&self,
		channel: &str,
		durable: &str,
		cursor: &DurableCursor,
	) -> Result<(), StreamError>;

	/// Resolves once entries after `after` may be available.
	///
	/// Spurious wakeups are allowed. The default implementation simply
	/// sleeps for a fixed poll interval.
	async fn wait_for_append(&self, _channel: &str, _after: u64) {
		tokio::time::sleep(DEFAULT_POLL_INTERVAL).await;
	}

	/// Returns the configuration schema for validation.
	fn config_schema(&self) -> Box<dyn ConfigSchema>;

	/// Releases the transport connection.
	async fn close(&self) -> Result<(), StreamError>;
}

/// Type alias for stream factory functions.
pub type StreamFactory = fn(&toml::Value) -> Result<Box<dyn StreamInterface>, StreamError>;

/// Registry trait for stream implementations.
pub trait StreamRegistry: ImplementationRegistry<Factory = StreamFactory> {}

/// Get all registered stream implementations.
///
/// Returns a vector of (name, factory) tuples for all available stream implementations.
pub fn get_all_implementations() -> Vec<(&'static str, StreamFactory)> {
	use implementations::{file, memory};

	vec![
		(file::Registry::NAME, file::Registry::factory()),
		(memory::Registry::NAME, memory::Registry::factory()),
	]
}

/// Shared acknowledgement path of one subscription.
#[derive(Clone)]
struct Acker {
	backend: Arc<dyn StreamInterface>,
	channel: Arc<str>,
	durable: Arc<str>,
	cursor: Arc<Mutex<DurableCursor>>,
	redeliver: mpsc::UnboundedSender<u64>,
}

impl Acker {
	async fn ack(&self, sequence: u64) -> Result<(), StreamError> {
		let mut cursor = self.cursor.lock().await;
		if cursor.ack(sequence) {
			self.backend
				.store_cursor(&self.channel, &self.durable, &cursor)
				.await?;
		}
		Ok(())
	}
}

/// A delivered message awaiting acknowledgement.
pub struct StreamMessage {
	pub sequence: u64,
	pub payload: Vec<u8>,
	acker: Acker,
}

impl StreamMessage {
	/// Acknowledges the message so it is never delivered to this durable
	/// identity again. Acknowledging twice is harmless.
	pub async fn ack(&self) -> Result<(), StreamError> {
		self.acker.ack(self.sequence).await
	}

	/// Asks for the message to be delivered again after [`REDELIVERY_DELAY`]
	/// while the subscription is still running. Once it has stopped, the
	/// message simply stays pending until the durable resubscribes.
	pub fn nak(&self) {
		if self.acker.redeliver.send(self.sequence).is_err() {
			tracing::debug!(
				component = "stream",
				sequence = self.sequence,
				"Subscription stopped, redelivery deferred to resubscribe"
			);
		}
	}
}

impl fmt::Debug for StreamMessage {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("StreamMessage")
			.field("sequence", &self.sequence)
			.field("channel", &self.acker.channel)
			.field("durable", &self.acker.durable)
			.field("payload_len", &self.payload.len())
			.finish()
	}
}

/// High-level stream service.
///
/// Owns one transport connection and at most one active subscription.
pub struct StreamService {
	backend: Arc<dyn StreamInterface>,
	is_subscribed: AtomicBool,
	/// Channel for signaling the pump task to stop.
	stop_signal: Mutex<Option<mpsc::Sender<()>>>,
	pump: Mutex<Option<JoinHandle<()>>>,
	closed: AtomicBool,
}

impl StreamService {
	pub fn new(backend: Box<dyn StreamInterface>) -> Self {
		Self {
			backend: Arc::from(backend),
			is_subscribed: AtomicBool::new(false),
			stop_signal: Mutex::new(None),
			pump: Mutex::new(None),
			closed: AtomicBool::new(false),
		}
	}

	/// Attaches to `channel` under the durable identity `durable` and starts
	/// pushing unacknowledged messages into `sender`.
	///
	/// `policy` only applies when `durable` has no saved cursor. The pump
	/// blocks while `sender` is full.
	pub async fn subscribe(
		&self,
		channel: &str,
		durable: &str,
		policy: DeliverPolicy,
		sender: mpsc::Sender<StreamMessage>,
	) -> Result<(), StreamError> {
		if self.closed.load(Ordering::SeqCst) {
			return Err(StreamError::Closed);
		}
		if self.is_subscribed.swap(true, Ordering::SeqCst) {
			return Err(StreamError::AlreadySubscribed);
		}

		let cursor = match self.resume_cursor(channel, durable, policy).await {
			Ok(cursor) => cursor,
			Err(e) => {
				self.is_subscribed.store(false, Ordering::SeqCst);
				return Err(e);
			},
		};

		tracing::info!(
			component = "stream",
			channel = %channel,
			durable = %durable,
			policy = %policy,
			ack_floor = cursor.ack_floor,
			pending_out_of_order = cursor.acked.len(),
			"Subscribed"
		);

		let (redeliver_tx, redeliver_rx) = mpsc::unbounded_channel();
		let acker = Acker {
			backend: self.backend.clone(),
			channel: Arc::from(channel),
			durable: Arc::from(durable),
			cursor: Arc::new(Mutex::new(cursor)),
			redeliver: redeliver_tx,
		};

		let (stop_tx, stop_rx) = mpsc::channel(1);
		*self.stop_signal.lock().await = Some(stop_tx);

		let handle = tokio::spawn(Self::pump(acker, sender, stop_rx, redeliver_rx));
		*self.pump.lock().await = Some(handle);
		Ok(())
	}

	async fn resume_cursor(
		&self,
		channel: &str,
		durable: &str,
		policy: DeliverPolicy,
	) -> Result<DurableCursor, StreamError> {
		if let Some(cursor) = self.backend.load_cursor(channel, durable).await? {
			return Ok(cursor);
		}

		let cursor = match policy {
			DeliverPolicy::All => DurableCursor::default(),
			DeliverPolicy::New => {
				DurableCursor::starting_after(self.backend.last_sequence(channel).await?)
			},
		};
		self.backend.store_cursor(channel, durable, &cursor).await?;
		Ok(cursor)
	}

	/// Reads the channel after the ack floor and forwards every message not
	/// yet acknowledged until told to stop or the receiver goes away.
	/// Negatively acknowledged sequences are read back and forwarded again
	/// once their redelivery delay has passed.
	async fn pump(
		acker: Acker,
		sender: mpsc::Sender<StreamMessage>,
		mut stop_rx: mpsc::Receiver<()>,
		mut redeliver_rx: mpsc::UnboundedReceiver<u64>,
	) {
		let backend = acker.backend.clone();
		let channel = acker.channel.clone();
		let mut position = acker.cursor.lock().await.ack_floor;
		let mut retries: VecDeque<(Instant, u64)> = VecDeque::new();

		'pump: loop {
			while let Ok(sequence) = redeliver_rx.try_recv() {
				retries.push_back((Instant::now() + REDELIVERY_DELAY, sequence));
			}

			let mut pending = Vec::new();
			while let Some(&(due, sequence)) = retries.front() {
				if due > Instant::now() {
					break;
				}
				retries.pop_front();
				pending.push(sequence);
			}
			for sequence in pending {
				let stored = match backend.read_after(&channel, sequence.saturating_sub(1), 1).await {
					Ok(mut entries) if entries.first().is_some_and(|e| e.sequence == sequence) => {
						entries.remove(0)
					},
					Ok(_) => continue,
					Err(e) => {
						tracing::error!(component = "stream", channel = %channel, sequence, "Failed to read message for redelivery: {}", e);
						retries.push_back((Instant::now() + REDELIVERY_DELAY, sequence));
						continue;
					},
				};
				if acker.cursor.lock().await.is_acked(sequence) {
					continue;
				}
				tracing::warn!(component = "stream", channel = %channel, sequence, "Redelivering unacknowledged message");
				if !Self::forward(&acker, &sender, &mut stop_rx, stored).await {
					break 'pump;
				}
			}

			let batch = tokio::select! {
				_ = stop_rx.recv() => break,
				batch = backend.read_after(&channel, position, READ_BATCH) => batch,
			};

			let batch = match batch {
				Ok(batch) => batch,
				Err(e) => {
					tracing::error!(component = "stream", channel = %channel, "Failed to read stream: {}", e);
					tokio::select! {
						_ = stop_rx.recv() => break,
						_ = tokio::time::sleep(READ_RETRY_DELAY) => continue,
					}
				},
			};

			if batch.is_empty() {
				let next_retry = retries.front().map(|(due, _)| *due);
				tokio::select! {
					_ = stop_rx.recv() => break,
					_ = backend.wait_for_append(&channel, position) => {},
					Some(sequence) = redeliver_rx.recv() => {
						retries.push_back((Instant::now() + REDELIVERY_DELAY, sequence));
					},
					_ = tokio::time::sleep_until(next_retry.unwrap_or_else(Instant::now)), if next_retry.is_some() => {},
				}
				continue;
			}

			for stored in batch {
				position = stored.sequence;
				if acker.cursor.lock().await.is_acked(stored.sequence) {
					continue;
				}
				if !Self::forward(&acker, &sender, &mut stop_rx, stored).await {
					break 'pump;
				}
			}
		}

		tracing::debug!(component = "stream", channel = %channel, position, "Delivery stopped");
	}

	/// Hands one entry to the consumer. Returns false when delivery must stop.
	async fn forward(
		acker: &Acker,
		sender: &mpsc::Sender<StreamMessage>,
		stop_rx: &mut mpsc::Receiver<()>,
		stored: StoredMessage,
	) -> bool {
		let message = StreamMessage {
			sequence: stored.sequence,
			payload: stored.payload,
			acker: acker.clone(),
		};
		tokio::select! {
			_ = stop_rx.recv() => false,
			sent = sender.send(message) => {
				if sent.is_err() {
					tracing::debug!(component = "stream", "Receiver dropped, stopping delivery");
				}
				sent.is_ok()
			}
		}
	}

	/// Stops delivering messages. Messages already handed out can still be
	/// acknowledged. Returns once the pump task has finished.
	pub async fn unsubscribe(&self) -> Result<(), StreamError> {
		if !self.is_subscribed.load(Ordering::SeqCst) {
			return Ok(());
		}

		if let Some(stop_tx) = self.stop_signal.lock().await.take() {
			let _ = stop_tx.send(()).await;
		}
		if let Some(handle) = self.pump.lock().await.take() {
			handle
				.await
				.map_err(|e| StreamError::Backend(format!("Delivery task failed: {}", e)))?;
		}

		self.is_subscribed.store(false, Ordering::SeqCst);
		tracing::info!(component = "stream", "Unsubscribed");
		Ok(())
	}

	pub fn is_subscribed(&self) -> bool {
		self.is_subscribed.load(Ordering::SeqCst)
	}

	/// Appends a payload to `channel`.
	pub async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<u64, StreamError> {
		if self.closed.load(Ordering::SeqCst) {
			return Err(StreamError::Closed);
		}
		self.backend.append(channel, payload).await
	}

	/// Stops any subscription and releases the transport. Calling it again
	/// is a no-op.
	pub async fn close(&self) -> Result<(), StreamError> {
		if self.closed.swap(true, Ordering::SeqCst) {
			tracing::debug!("Stream already closed");
			return Ok(());
		}
		self.unsubscribe().await?;
		self.backend.close().await
	}
}
