//! File-based storage backend.
//!
//! Each table is a directory below the configured base path and each row is
//! one `<hex(id)>.json` file holding the raw payload. Writes go to a
//! temporary file that is renamed over the row, so a crash never leaves a
//! half-written row behind. An exclusive lock on `<base>/.lock` keeps two
//! service instances from sharing one directory.

use crate::{encode_table, StorageError, StorageFactory, StorageInterface, StorageRegistry};
use async_trait::async_trait;
use fs2::FileExt;
use order_types::{ConfigSchema, Field, FieldType, ImplementationRegistry, Schema, SchemaError};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs;

const ROW_EXTENSION: &str = "json";
const LOCK_FILE: &str = ".lock";

/// File-based storage implementation.
pub struct FileStorage {
	/// Base directory path holding one directory per table.
	base_path: PathBuf,
	/// Held lock file. `None` once the storage has been closed.
	lock: Mutex<Option<std::fs::File>>,
}

impl FileStorage {
	/// Opens the storage rooted at `base_path`, creating the directory and
	/// taking the exclusive lock.
	pub fn open(base_path: impl Into<PathBuf>) -> Result<Self, StorageError> {
		let base_path = base_path.into();
		std::fs::create_dir_all(&base_path).map_err(|e| {
			StorageError::Backend(format!(
				"Failed to create storage directory {}: {}",
				base_path.display(),
				e
			))
		})?;

		let lock_file = std::fs::OpenOptions::new()
			.create(true)
			.truncate(false)
			.write(true)
			.open(base_path.join(LOCK_FILE))
			.map_err(|e| StorageError::Backend(e.to_string()))?;
		lock_file.try_lock_exclusive().map_err(|e| {
			StorageError::Backend(format!(
				"Storage directory {} is locked by another process: {}",
				base_path.display(),
				e
			))
		})?;

		Ok(Self {
			base_path,
			lock: Mutex::new(Some(lock_file)),
		})
	}

	fn ensure_open(&self) -> Result<(), StorageError> {
		let guard = self
			.lock
			.lock()
			.map_err(|_| StorageError::Backend("Storage lock poisoned".into()))?;
		if guard.is_none() {
			return Err(StorageError::Closed);
		}
		Ok(())
	}

	fn table_path(&self, table: &str) -> PathBuf {
		self.base_path.join(table)
	}

	/// Identifiers are hex-encoded so any string maps to a safe file name.
	fn row_path(&self, table: &str, id: &str) -> PathBuf {
		self.table_path(table)
			.join(format!("{}.{}", hex::encode(id.as_bytes()), ROW_EXTENSION))
	}

	/// Recovers the identifier from a row file name, skipping foreign files.
	fn row_id(path: &Path) -> Option<String> {
		if path.extension()? != ROW_EXTENSION {
			return None;
		}
		let stem = path.file_stem()?.to_str()?;
		let bytes = hex::decode(stem).ok()?;
		String::from_utf8(bytes).ok()
	}

	async fn read_rows(&self, table: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
		let mut entries = match fs::read_dir(self.table_path(table)).await {
			Ok(entries) => entries,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
			Err(e) => return Err(StorageError::Backend(e.to_string())),
		};

		let mut rows = Vec::new();
		while let Some(entry) = entries
			.next_entry()
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))?
		{
			let path = entry.path();
			let Some(id) = Self::row_id(&path) else {
				tracing::debug!("Skipping non-row file {:?}", path);
				continue;
			};
			let data = fs::read(&path)
				.await
				.map_err(|e| StorageError::Backend(format!("Failed to read {:?}: {}", path, e)))?;
			rows.push((id, data));
		}
		Ok(rows)
	}
}

#[async_trait]
impl StorageInterface for FileStorage {
	async fn bulk_load(&self, table: &str) -> Result<Vec<u8>, StorageError> {
		self.ensure_open()?;
		let rows = self.read_rows(table).await?;
		encode_table(rows.iter().map(|(id, data)| (id.as_str(), data.as_slice())))
	}

	async fn upsert(&self, table: &str, value: Vec<u8>, id: &str) -> Result<(), StorageError> {
		self.ensure_open()?;
		let path = self.row_path(table, id);

		fs::create_dir_all(self.table_path(table))
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))?;

		let temp_path = path.with_extension("tmp");
		fs::write(&temp_path, value)
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))?;

		fs::rename(&temp_path, &path)
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))?;

		Ok(())
	}

	async fn get_bytes(&self, table: &str, id: &str) -> Result<Vec<u8>, StorageError> {
		self.ensure_open()?;
		match fs::read(self.row_path(table, id)).await {
			Ok(data) => Ok(data),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound),
			Err(e) => Err(StorageError::Backend(e.to_string())),
		}
	}

	async fn exists(&self, table: &str, id: &str) -> Result<bool, StorageError> {
		self.ensure_open()?;
		fs::try_exists(self.row_path(table, id))
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))
	}

	async fn count(&self, table: &str) -> Result<usize, StorageError> {
		self.ensure_open()?;
		let mut entries = match fs::read_dir(self.table_path(table)).await {
			Ok(entries) => entries,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
			Err(e) => return Err(StorageError::Backend(e.to_string())),
		};

		let mut count = 0;
		while let Some(entry) = entries
			.next_entry()
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))?
		{
			if Self::row_id(&entry.path()).is_some() {
				count += 1;
			}
		}
		Ok(count)
	}

	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(FileStorageSchema)
	}

	async fn close(&self) -> Result<(), StorageError> {
		let taken = self
			.lock
			.lock()
			.map_err(|_| StorageError::Backend("Storage lock poisoned".into()))?
			.take();
		if let Some(file) = taken {
			FileExt::unlock(&file).map_err(|e| StorageError::Backend(e.to_string()))?;
		}
		Ok(())
	}
}

/// Configuration schema for FileStorage.
pub struct FileStorageSchema;

impl ConfigSchema for FileStorageSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), SchemaError> {
		let schema = Schema::new(
			vec![],
			vec![Field::new("storage_path", FieldType::String)],
		);
		schema.validate(config)
	}
}

/// Factory function to create a file storage backend from configuration.
///
/// Configuration parameters:
/// - `storage_path`: Base directory for file storage (default: "./data/storage")
pub fn create_storage(config: &toml::Value) -> Result<Box<dyn StorageInterface>, StorageError> {
	FileStorageSchema
		.validate(config)
		.map_err(|e| StorageError::Configuration(e.to_string()))?;

	let storage_path = config
		.get("storage_path")
		.and_then(|v| v.as_str())
		.unwrap_or("./data/storage");

	Ok(Box::new(FileStorage::open(storage_path)?))
}

/// Registry for the file storage implementation.
pub struct Registry;

impl ImplementationRegistry for Registry {
	const NAME: &'static str = "file";
	type Factory = StorageFactory;

	fn factory() -> Self::Factory {
		create_storage
	}
}

impl StorageRegistry for Registry {}
