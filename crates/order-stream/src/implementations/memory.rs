//! In-memory stream transport.
//!
//! Channel logs and cursors live in process memory. Several connections can
//! share one log through [`MemoryStream::connect`], which is how tests model
//! a service restart against the same broker.

use crate::{
	DurableCursor, StoredMessage, StreamError, StreamFactory, StreamInterface, StreamRegistry,
};
use async_trait::async_trait;
use order_types::{ConfigSchema, ImplementationRegistry, Schema, SchemaError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};

#[derive(Default)]
struct Broker {
	channels: RwLock<HashMap<String, Vec<Vec<u8>>>>,
	cursors: RwLock<HashMap<(String, String), DurableCursor>>,
	appended: Notify,
}

/// In-memory stream implementation.
#[derive(Default)]
pub struct MemoryStream {
	broker: Arc<Broker>,
	closed: AtomicBool,
}

impl MemoryStream {
	pub fn new() -> Self {
		Self::default()
	}

	/// Opens another connection to the same broker.
	pub fn connect(&self) -> Self {
		Self {
			broker: self.broker.clone(),
			closed: AtomicBool::new(false),
		}
	}

	fn ensure_open(&self) -> Result<(), StreamError> {
		if self.closed.load(Ordering::SeqCst) {
			return Err(StreamError::Closed);
		}
		Ok(())
	}

	async fn len(&self, channel: &str) -> u64 {
		let channels = self.broker.channels.read().await;
		channels.get(channel).map_or(0, |log| log.len() as u64)
	}
}

#[async_trait]
impl StreamInterface for MemoryStream {
	async fn append(&self, channel: &str, payload: Vec<u8>) -> Result<u64, StreamError> {
		self.ensure_open()?;
		let sequence = {
			let mut channels = self.broker.channels.write().await;
			let log = channels.entry(channel.to_string()).or_default();
			log.push(payload);
			log.len() as u64
		};
		self.broker.appended.notify_waiters();
		Ok(sequence)
	}

	async fn read_after(
		&self,
		channel: &str,
		after: u64,
		limit: usize,
	) -> Result<Vec<StoredMessage>, StreamError> {
		self.ensure_open()?;
		let channels = self.broker.channels.read().await;
		let Some(log) = channels.get(channel) else {
			return Ok(Vec::new());
		};

		Ok(log
			.iter()
			.enumerate()
			.skip(after as usize)
			.take(limit)
			.map(|(index, payload)| StoredMessage {
				sequence: index as u64 + 1,
				payload: payload.clone(),
			})
			.collect())
	}

	async fn last_sequence(&self, channel: &str) -> Result<u64, StreamError> {
		self.ensure_open()?;
		Ok(self.len(channel).await)
	}

	async fn load_cursor(
		&self,
		channel: &str,
		durable: &str,
	) -> Result<Option<DurableCursor>, StreamError> {
		self.ensure_open()?;
		let cursors = self.broker.cursors.read().await;
		Ok(cursors
			.get(&(channel.to_string(), durable.to_string()))
			.cloned())
	}

	async fn store_cursor(
		&self,
		channel: &str,
		durable: &str,
		cursor: &DurableCursor,
	) -> Result<(), StreamError> {
		self.ensure_open()?;
		let mut cursors = self.broker.cursors.write().await;
		cursors.insert((channel.to_string(), durable.to_string()), cursor.clone());
		Ok(())
	}

	async fn wait_for_append(&self, channel: &str, after: u64) {
		let notified = self.broker.appended.notified();
		tokio::pin!(notified);
		// Register before checking so an append in between is not missed
		notified.as_mut().enable();
		if self.closed.load(Ordering::SeqCst) || self.len(channel).await > after {
			return;
		}
		notified.await;
	}

	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(MemoryStreamSchema)
	}

	async fn close(&self) -> Result<(), StreamError> {
		self.closed.store(true, Ordering::SeqCst);
		self.broker.appended.notify_waiters();
		Ok(())
	}
}

/// Configuration schema for MemoryStream.
pub struct MemoryStreamSchema;

impl ConfigSchema for MemoryStreamSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), SchemaError> {
		Schema::new(vec![], vec![]).validate(config)
	}
}

/// Factory function to create a memory stream transport from configuration.
pub fn create_stream(config: &toml::Value) -> Result<Box<dyn StreamInterface>, StreamError> {
	MemoryStreamSchema
		.validate(config)
		.map_err(|e| StreamError::Configuration(e.to_string()))?;
	Ok(Box::new(MemoryStream::new()))
}

/// Registry for the memory stream implementation.
pub struct Registry;

impl ImplementationRegistry for Registry {
	const NAME: &'static str = "memory";
	type Factory = StreamFactory;

	fn factory() -> Self::Factory {
		create_stream
	}
}

impl StreamRegistry for Registry {}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	#[tokio::test]
	async fn test_append_and_read_after() {
		let stream = MemoryStream::new();
		assert_eq!(stream.append("orders", b"a".to_vec()).await.unwrap(), 1);
		assert_eq!(stream.append("orders", b"b".to_vec()).await.unwrap(), 2);
		assert_eq!(stream.append("other", b"x".to_vec()).await.unwrap(), 1);

		let entries = stream.read_after("orders", 1, 10).await.unwrap();
		assert_eq!(
			entries,
			vec![StoredMessage {
				sequence: 2,
				payload: b"b".to_vec()
			}]
		);
		assert!(stream.read_after("missing", 0, 10).await.unwrap().is_empty());
		assert_eq!(stream.last_sequence("orders").await.unwrap(), 2);
	}

	#[tokio::test]
	async fn test_connections_share_broker() {
		let stream = MemoryStream::new();
		let other = stream.connect();

		let mut cursor = DurableCursor::default();
		cursor.ack(1);
		stream.store_cursor("orders", "cache", &cursor).await.unwrap();
		stream.close().await.unwrap();

		assert_eq!(
			other.load_cursor("orders", "cache").await.unwrap(),
			Some(cursor)
		);
		assert!(matches!(
			stream.load_cursor("orders", "cache").await,
			Err(StreamError::Closed)
		));
	}

	#[tokio::test]
	async fn test_wait_for_append_wakes_on_append() {
		let stream = Arc::new(MemoryStream::new());
		let waiter = {
			let stream = stream.clone();
			tokio::spawn(async move { stream.wait_for_append("orders", 0).await })
		};

		tokio::time::sleep(Duration::from_millis(50)).await;
		stream.append("orders", b"a".to_vec()).await.unwrap();

		tokio::time::timeout(Duration::from_secs(5), waiter)
			.await
			.unwrap()
			.unwrap();
	}

	#[tokio::test]
	async fn test_wait_returns_when_already_behind() {
		let stream = MemoryStream::new();
		stream.append("orders", b"a".to_vec()).await.unwrap();
		tokio::time::timeout(Duration::from_secs(1), stream.wait_for_append("orders", 0))
			.await
			.unwrap();
	}
}
