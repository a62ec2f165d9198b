//! In-memory storage backend implementation.
//!
//! Rows live in a map guarded by a read-write lock, so nothing survives a
//! restart. Useful for tests and local development.

use crate::{encode_table, StorageError, StorageFactory, StorageInterface, StorageRegistry};
use async_trait::async_trait;
use order_types::{ConfigSchema, ImplementationRegistry, Schema, SchemaError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

type Tables = HashMap<String, HashMap<String, Vec<u8>>>;

/// In-memory storage implementation.
#[derive(Default)]
pub struct MemoryStorage {
	tables: Arc<RwLock<Tables>>,
	closed: AtomicBool,
}

impl MemoryStorage {
	/// Creates a new MemoryStorage instance.
	pub fn new() -> Self {
		Self::default()
	}

	/// Opens another connection to the same tables. Each connection is
	/// closed independently, so a test can inspect rows after the engine
	/// released its own connection, or hydrate a second engine from them.
	pub fn connect(&self) -> Self {
		Self {
			tables: self.tables.clone(),
			closed: AtomicBool::new(false),
		}
	}

	fn ensure_open(&self) -> Result<(), StorageError> {
		if self.closed.load(Ordering::SeqCst) {
			return Err(StorageError::Closed);
		}
		Ok(())
	}
}

#[async_trait]
impl StorageInterface for MemoryStorage {
	async fn bulk_load(&self, table: &str) -> Result<Vec<u8>, StorageError> {
		self.ensure_open()?;
		let tables = self.tables.read().await;
		match tables.get(table) {
			Some(rows) => encode_table(rows.iter().map(|(id, v)| (id.as_str(), v.as_slice()))),
			None => encode_table(std::iter::empty()),
		}
	}

	async fn upsert(&self, table: &str, value: Vec<u8>, id: &str) -> Result<(), StorageError> {
		self.ensure_open()?;
		let mut tables = self.tables.write().await;
		tables
			.entry(table.to_string())
			.or_default()
			.insert(id.to_string(), value);
		Ok(())
	}

	async fn get_bytes(&self, table: &str, id: &str) -> Result<Vec<u8>, StorageError> {
		self.ensure_open()?;
		let tables = self.tables.read().await;
		tables
			.get(table)
			.and_then(|rows| rows.get(id))
			.cloned()
			.ok_or(StorageError::NotFound)
	}

	async fn exists(&self, table: &str, id: &str) -> Result<bool, StorageError> {
		self.ensure_open()?;
		let tables = self.tables.read().await;
		Ok(tables.get(table).is_some_and(|rows| rows.contains_key(id)))
	}

	async fn count(&self, table: &str) -> Result<usize, StorageError> {
		self.ensure_open()?;
		let tables = self.tables.read().await;
		Ok(tables.get(table).map_or(0, HashMap::len))
	}

	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(MemoryStorageSchema)
	}

	async fn close(&self) -> Result<(), StorageError> {
		self.closed.store(true, Ordering::SeqCst);
		Ok(())
	}
}

/// Configuration schema for MemoryStorage.
pub struct MemoryStorageSchema;

impl ConfigSchema for MemoryStorageSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), SchemaError> {
		// No settings
		Schema::new(vec![], vec![]).validate(config)
	}
}

/// Factory function to create a memory storage backend from configuration.
pub fn create_storage(config: &toml::Value) -> Result<Box<dyn StorageInterface>, StorageError> {
	MemoryStorageSchema
		.validate(config)
		.map_err(|e| StorageError::Configuration(e.to_string()))?;
	Ok(Box::new(MemoryStorage::new()))
}

/// Registry for the memory storage implementation.
pub struct Registry;

impl ImplementationRegistry for Registry {
	const NAME: &'static str = "memory";
	type Factory = StorageFactory;

	fn factory() -> Self::Factory {
		create_storage
	}
}

impl StorageRegistry for Registry {}
