//! Builder pattern for constructing order engines.
//!
//! Composes an [`OrderEngine`] from the storage and stream implementations
//! named in the configuration, using factory functions keyed by
//! implementation name.

use crate::engine::OrderEngine;
use order_config::Config;
use order_storage::{StorageError, StorageInterface, StorageService};
use order_stream::{StreamError, StreamInterface, StreamService};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during engine construction.
#[derive(Debug, Error)]
pub enum BuilderError {
	#[error("Configuration error: {0}")]
	Config(String),
	#[error("Missing required component: {0}")]
	MissingComponent(String),
}

/// Container for the factory functions needed to build an OrderEngine.
pub struct OrderFactories<SF, STF> {
	pub storage_factories: HashMap<String, SF>,
	pub stream_factories: HashMap<String, STF>,
}

/// Builder for constructing an OrderEngine with pluggable implementations.
pub struct OrderEngineBuilder {
	config: Config,
}

impl OrderEngineBuilder {
	pub fn new(config: Config) -> Self {
		Self { config }
	}

	/// Builds the engine with the primary storage and stream implementations.
	///
	/// Only the primary of each section is constructed. The file storage
	/// takes an exclusive directory lock when created, so building secondary
	/// implementations would hold locks nobody uses.
	pub fn build<SF, STF>(self, factories: OrderFactories<SF, STF>) -> Result<OrderEngine, BuilderError>
	where
		SF: Fn(&toml::Value) -> Result<Box<dyn StorageInterface>, StorageError>,
		STF: Fn(&toml::Value) -> Result<Box<dyn StreamInterface>, StreamError>,
	{
		let storage_backend = create_primary(
			"storage",
			&self.config.storage.primary,
			&self.config.storage.implementations,
			&factories.storage_factories,
		)?;
		let stream_backend = create_primary(
			"stream",
			&self.config.stream.primary,
			&self.config.stream.implementations,
			&factories.stream_factories,
		)?;

		let storage = Arc::new(StorageService::new(storage_backend));
		let stream = Arc::new(StreamService::new(stream_backend));
		Ok(OrderEngine::new(self.config, storage, stream))
	}
}

fn create_primary<T: ?Sized, E, F>(
	component: &str,
	primary: &str,
	implementations: &HashMap<String, toml::Value>,
	factories: &HashMap<String, F>,
) -> Result<Box<T>, BuilderError>
where
	E: std::fmt::Display,
	F: Fn(&toml::Value) -> Result<Box<T>, E>,
{
	let config = implementations.get(primary).ok_or_else(|| {
		BuilderError::Config(format!(
			"Primary {} '{}' has no configuration table",
			component, primary
		))
	})?;
	let factory = factories.get(primary).ok_or_else(|| {
		BuilderError::MissingComponent(format!(
			"No {} implementation registered as '{}'",
			component, primary
		))
	})?;

	match factory(config) {
		Ok(implementation) => {
			tracing::info!(component = %component, implementation = %primary, "Loaded");
			Ok(implementation)
		},
		Err(e) => {
			tracing::error!(
				component = %component,
				implementation = %primary,
				error = %e,
				"Failed to create implementation"
			);
			Err(BuilderError::Config(format!(
				"Failed to create {} implementation '{}': {}",
				component, primary, e
			)))
		},
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use order_config::ConfigBuilder;

	fn factories() -> OrderFactories<order_storage::StorageFactory, order_stream::StreamFactory> {
		OrderFactories {
			storage_factories: order_storage::get_all_implementations()
				.into_iter()
				.map(|(name, factory)| (name.to_string(), factory))
				.collect(),
			stream_factories: order_stream::get_all_implementations()
				.into_iter()
				.map(|(name, factory)| (name.to_string(), factory))
				.collect(),
		}
	}

	#[test]
	fn test_build_with_memory_implementations() {
		let engine = OrderEngineBuilder::new(ConfigBuilder::new().build())
			.build(factories())
			.unwrap();
		assert_eq!(engine.config().service.table, "order_data");
	}

	#[test]
	fn test_unregistered_primary() {
		let mut config = ConfigBuilder::new().build();
		config.storage.primary = "redis".into();
		config
			.storage
			.implementations
			.insert("redis".into(), toml::Value::Table(Default::default()));

		let result = OrderEngineBuilder::new(config).build(factories());
		assert!(matches!(result, Err(BuilderError::MissingComponent(_))));
	}

	#[test]
	fn test_invalid_implementation_table() {
		let mut config = ConfigBuilder::new().build();
		let mut table = toml::map::Map::new();
		table.insert("poll_interval_ms".into(), toml::Value::Integer(0));
		config.stream.primary = "file".into();
		config
			.stream
			.implementations
			.insert("file".into(), toml::Value::Table(table));

		let result = OrderEngineBuilder::new(config).build(factories());
		assert!(matches!(result, Err(BuilderError::Config(_))));
	}
}
