//! Registry of every storage and stream implementation compiled into the
//! service, and the glue that turns a configuration into an engine.

use order_config::Config;
use order_core::{OrderEngine, OrderEngineBuilder, OrderFactories};
use order_storage::StorageFactory;
use order_stream::StreamFactory;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Global registry for all implementation factories.
pub struct FactoryRegistry {
	pub storage: HashMap<String, StorageFactory>,
	pub stream: HashMap<String, StreamFactory>,
}

impl FactoryRegistry {
	fn new() -> Self {
		Self {
			storage: HashMap::new(),
			stream: HashMap::new(),
		}
	}

	/// Register a storage implementation
	pub fn register_storage(&mut self, name: impl Into<String>, factory: StorageFactory) {
		self.storage.insert(name.into(), factory);
	}

	/// Register a stream implementation
	pub fn register_stream(&mut self, name: impl Into<String>, factory: StreamFactory) {
		self.stream.insert(name.into(), factory);
	}
}

static REGISTRY: OnceLock<FactoryRegistry> = OnceLock::new();

/// Initialize the global registry with all available implementations
pub fn initialize_registry() -> &'static FactoryRegistry {
	REGISTRY.get_or_init(|| {
		let mut registry = FactoryRegistry::new();

		for (name, factory) in order_storage::get_all_implementations() {
			tracing::debug!("Registering storage implementation: {}", name);
			registry.register_storage(name, factory);
		}

		for (name, factory) in order_stream::get_all_implementations() {
			tracing::debug!("Registering stream implementation: {}", name);
			registry.register_stream(name, factory);
		}

		registry
	})
}

/// Picks the factories for the implementations named in a config section.
fn select_factories<F: Copy>(
	available: &HashMap<String, F>,
	configured: &HashMap<String, toml::Value>,
	type_name: &str,
) -> Result<HashMap<String, F>, String> {
	let mut factories = HashMap::new();
	for name in configured.keys() {
		match available.get(name) {
			Some(factory) => {
				factories.insert(name.clone(), *factory);
			},
			None => {
				let mut known: Vec<_> = available.keys().cloned().collect();
				known.sort();
				return Err(format!(
					"Unknown {} implementation '{}'. Available: [{}]",
					type_name,
					name,
					known.join(", ")
				));
			},
		}
	}
	Ok(factories)
}

/// Builds the factory set for `config` from the global registry.
pub fn factories_for(
	config: &Config,
) -> Result<OrderFactories<StorageFactory, StreamFactory>, String> {
	let registry = initialize_registry();
	Ok(OrderFactories {
		storage_factories: select_factories(
			&registry.storage,
			&config.storage.implementations,
			"storage",
		)?,
		stream_factories: select_factories(
			&registry.stream,
			&config.stream.implementations,
			"stream",
		)?,
	})
}

/// Build an engine using the registry and config
pub fn build_engine_from_config(config: Config) -> Result<OrderEngine, Box<dyn std::error::Error>> {
	let factories = factories_for(&config)?;
	Ok(OrderEngineBuilder::new(config).build(factories)?)
}
