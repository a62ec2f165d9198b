//! Persistence gateway for the order cache service.
//!
//! This module provides the narrow interface the service uses to reach its
//! durable store: one bulk load of a whole table at boot, and one
//! insert-or-replace per successfully validated event. Backends are
//! pluggable; in-memory and file-based implementations ship with the crate.

use async_trait::async_trait;
use order_types::{ConfigSchema, ImplementationRegistry, OrderRecord};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Re-export implementations
pub mod implementations {
	pub mod file;
	pub mod memory;
}

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
	/// Error that occurs when a requested row is not found.
	#[error("Not found")]
	NotFound,
	/// Error that occurs when stored bytes cannot be decoded.
	#[error("Serialization error: {0}")]
	Serialization(String),
	/// Error that occurs in the storage backend.
	#[error("Backend error: {0}")]
	Backend(String),
	/// Error that occurs during configuration validation.
	#[error("Configuration error: {0}")]
	Configuration(String),
	/// Error that occurs when the connection has already been released.
	#[error("Storage connection is closed")]
	Closed,
}

/// Trait defining the low-level interface for storage backends.
///
/// Rows are keyed by order identifier within a named table and hold the raw
/// event payload exactly as it arrived on the stream.
#[async_trait]
pub trait StorageInterface: Send + Sync {
	/// Returns every row of `table` serialized as one JSON object mapping
	/// identifier to stored payload.
	async fn bulk_load(&self, table: &str) -> Result<Vec<u8>, StorageError>;

	/// Inserts or replaces the row for `id`.
	async fn upsert(&self, table: &str, value: Vec<u8>, id: &str) -> Result<(), StorageError>;

	/// Retrieves the raw payload stored for `id`.
	async fn get_bytes(&self, table: &str, id: &str) -> Result<Vec<u8>, StorageError>;

	/// Checks if a row exists for `id`.
	async fn exists(&self, table: &str, id: &str) -> Result<bool, StorageError>;

	/// Number of rows in `table`.
	async fn count(&self, table: &str) -> Result<usize, StorageError>;

	/// Returns the configuration schema for validation.
	fn config_schema(&self) -> Box<dyn ConfigSchema>;

	/// Releases the underlying connection. Later operations fail with
	/// [`StorageError::Closed`].
	async fn close(&self) -> Result<(), StorageError>;
}

/// Type alias for storage factory functions.
pub type StorageFactory = fn(&toml::Value) -> Result<Box<dyn StorageInterface>, StorageError>;

/// Registry trait for storage implementations.
pub trait StorageRegistry: ImplementationRegistry<Factory = StorageFactory> {}

/// Get all registered storage implementations.
///
/// Returns a vector of (name, factory) tuples for all available storage implementations.
pub fn get_all_implementations() -> Vec<(&'static str, StorageFactory)> {
	use implementations::{file, memory};

	vec![
		(file::Registry::NAME, file::Registry::factory()),
		(memory::Registry::NAME, memory::Registry::factory()),
	]
}

/// Serializes table rows as a JSON object of `identifier: payload` pairs.
///
/// Payloads are embedded verbatim, so a corrupt row surfaces when the
/// mapping is decoded rather than being skipped here.
pub(crate) fn encode_table<'a, I>(rows: I) -> Result<Vec<u8>, StorageError>
where
	I: IntoIterator<Item = (&'a str, &'a [u8])>,
{
	let mut out = Vec::from(&b"{"[..]);
	for (i, (id, payload)) in rows.into_iter().enumerate() {
		if i > 0 {
			out.push(b',');
		}
		serde_json::to_writer(&mut out, id)
			.map_err(|e| StorageError::Serialization(e.to_string()))?;
		out.push(b':');
		out.extend_from_slice(payload);
	}
	out.push(b'}');
	Ok(out)
}

/// High-level storage service used by the engine.
///
/// Wraps a backend, decodes the bulk load into order records and makes sure
/// the connection is released only once.
pub struct StorageService {
	/// The underlying storage backend implementation.
	backend: Box<dyn StorageInterface>,
	closed: AtomicBool,
}

impl StorageService {
	pub fn new(backend: Box<dyn StorageInterface>) -> Self {
		Self {
			backend,
			closed: AtomicBool::new(false),
		}
	}

	/// Loads every row of `table` and decodes it into order records.
	///
	/// Any row that does not decode fails the whole load.
	pub async fn load_records(
		&self,
		table: &str,
	) -> Result<HashMap<String, OrderRecord>, StorageError> {
		let bytes = self.backend.bulk_load(table).await?;
		serde_json::from_slice(&bytes).map_err(|e| {
			StorageError::Serialization(format!("Failed to decode table '{}': {}", table, e))
		})
	}

	/// Inserts or replaces the raw payload stored under `id`.
	pub async fn upsert(&self, table: &str, raw: &[u8], id: &str) -> Result<(), StorageError> {
		self.backend.upsert(table, raw.to_vec(), id).await
	}

	/// Retrieves the raw payload stored under `id`.
	pub async fn get_bytes(&self, table: &str, id: &str) -> Result<Vec<u8>, StorageError> {
		self.backend.get_bytes(table, id).await
	}

	/// Retrieves and decodes the record stored under `id`.
	pub async fn retrieve(&self, table: &str, id: &str) -> Result<OrderRecord, StorageError> {
		let bytes = self.backend.get_bytes(table, id).await?;
		serde_json::from_slice(&bytes).map_err(|e| StorageError::Serialization(e.to_string()))
	}

	pub async fn exists(&self, table: &str, id: &str) -> Result<bool, StorageError> {
		self.backend.exists(table, id).await
	}

	pub async fn count(&self, table: &str) -> Result<usize, StorageError> {
		self.backend.count(table).await
	}

	/// Releases the backend connection. Calling it again is a no-op.
	pub async fn close(&self) -> Result<(), StorageError> {
		if self.closed.swap(true, Ordering::SeqCst) {
			tracing::debug!("Storage already closed");
			return Ok(());
		}
		self.backend.close().await
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}
}
