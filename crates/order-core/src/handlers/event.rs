//! Event handler for processing delivered order events.
//!
//! Responsible for validating the payload, committing the record to the
//! store and the cache as one unit, and acknowledging the delivery.

use crate::cache::CacheStore;
use order_storage::StorageService;
use order_stream::StreamMessage;
use order_types::{truncate_id, validate, OrderRecord};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::instrument;

/// Errors that can occur while processing one event.
#[derive(Debug, Error)]
pub enum HandlerError {
	/// The store rejected the upsert. The cache was left untouched and the
	/// message is scheduled for redelivery.
	#[error("Persistence error: {0}")]
	Persistence(String),
	#[error("Acknowledgement error: {0}")]
	Ack(String),
}

/// What happened to a message that was handled without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
	/// Stored, cached and acknowledged.
	Committed,
	/// Failed validation and was acknowledged without side effects.
	Discarded,
}

/// Handler for order update events.
///
/// All writers share one mutex. Inside it the raw payload is upserted into
/// the store first and the decoded record is written to the cache only once
/// the store accepted it, so the cache never holds a value that was not
/// durably committed.
pub struct EventHandler {
	storage: Arc<StorageService>,
	cache: Arc<CacheStore>,
	writer: Arc<Mutex<()>>,
	table: String,
}

impl EventHandler {
	pub fn new(
		storage: Arc<StorageService>,
		cache: Arc<CacheStore>,
		writer: Arc<Mutex<()>>,
		table: impl Into<String>,
	) -> Self {
		Self {
			storage,
			cache,
			writer,
			table: table.into(),
		}
	}

	/// Handles one delivered message.
	#[instrument(skip_all, fields(sequence = message.sequence))]
	pub async fn handle(&self, message: StreamMessage) -> Result<EventOutcome, HandlerError> {
		let record = match validate(&message.payload) {
			Ok(record) => record,
			Err(e) => {
				tracing::warn!(error = %e, "Discarding invalid order event");
				self.ack(&message).await?;
				return Ok(EventOutcome::Discarded);
			},
		};

		let id = record.order_uid.clone();
		if let Err(e) = self.commit(&id, &message.payload, record).await {
			message.nak();
			return Err(e);
		}
		self.ack(&message).await?;

		tracing::info!(order_uid = %truncate_id(&id), "Order cached");
		Ok(EventOutcome::Committed)
	}

	async fn commit(&self, id: &str, raw: &[u8], record: OrderRecord) -> Result<(), HandlerError> {
		let _writer = self.writer.lock().await;

		if let Err(e) = self.storage.upsert(&self.table, raw, id).await {
			tracing::error!(
				order_uid = %truncate_id(id),
				error = %e,
				"Failed to persist order, cache left unchanged"
			);
			return Err(HandlerError::Persistence(e.to_string()));
		}

		let replaced = self.cache.set(id.to_string(), record).await.is_some();
		tracing::debug!(order_uid = %truncate_id(id), replaced, "Committed order");
		Ok(())
	}

	async fn ack(&self, message: &StreamMessage) -> Result<(), HandlerError> {
		message
			.ack()
			.await
			.map_err(|e| HandlerError::Ack(e.to_string()))
	}
}
