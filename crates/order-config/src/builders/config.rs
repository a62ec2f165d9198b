//! Configuration builder for creating test and development configurations.
//!
//! The built configuration registers both in-memory implementations with
//! empty tables, which is enough to run the whole pipeline without touching
//! the filesystem.

use crate::{ApiConfig, Config, DeliverPolicy, ServiceConfig, StorageConfig, StreamConfig};
use std::collections::HashMap;

/// Builder for creating `Config` instances with a fluent API.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
	service_id: String,
	table: String,
	max_in_flight: usize,
	delivery_buffer: usize,
	drain_timeout_seconds: Option<u64>,
	storage_primary: String,
	stream_primary: String,
	channel: String,
	durable_name: String,
	deliver_policy: DeliverPolicy,
	api: Option<ApiConfig>,
}

impl Default for ConfigBuilder {
	fn default() -> Self {
		Self::new()
	}
}

impl ConfigBuilder {
	/// Creates a new `ConfigBuilder` with default values suitable for testing.
	pub fn new() -> Self {
		Self {
			service_id: "test-order-cache".to_string(),
			table: "order_data".to_string(),
			max_in_flight: 16,
			delivery_buffer: 32,
			drain_timeout_seconds: None,
			storage_primary: "memory".to_string(),
			stream_primary: "memory".to_string(),
			channel: "order-data".to_string(),
			durable_name: "test-durable".to_string(),
			deliver_policy: DeliverPolicy::All,
			api: None,
		}
	}

	pub fn service_id(mut self, id: impl Into<String>) -> Self {
		self.service_id = id.into();
		self
	}

	pub fn table(mut self, table: impl Into<String>) -> Self {
		self.table = table.into();
		self
	}

	pub fn max_in_flight(mut self, max_in_flight: usize) -> Self {
		self.max_in_flight = max_in_flight;
		self
	}

	pub fn delivery_buffer(mut self, capacity: usize) -> Self {
		self.delivery_buffer = capacity;
		self
	}

	pub fn drain_timeout_seconds(mut self, timeout: Option<u64>) -> Self {
		self.drain_timeout_seconds = timeout;
		self
	}

	pub fn channel(mut self, channel: impl Into<String>) -> Self {
		self.channel = channel.into();
		self
	}

	pub fn durable_name(mut self, name: impl Into<String>) -> Self {
		self.durable_name = name.into();
		self
	}

	pub fn deliver_policy(mut self, policy: DeliverPolicy) -> Self {
		self.deliver_policy = policy;
		self
	}

	pub fn api(mut self, api: Option<ApiConfig>) -> Self {
		self.api = api;
		self
	}

	/// Builds the `Config` with the configured values.
	pub fn build(self) -> Config {
		let empty_table = || toml::Value::Table(toml::map::Map::new());

		Config {
			service: ServiceConfig {
				id: self.service_id,
				table: self.table,
				max_in_flight: self.max_in_flight,
				delivery_buffer: self.delivery_buffer,
				drain_timeout_seconds: self.drain_timeout_seconds,
			},
			storage: StorageConfig {
				implementations: HashMap::from([(self.storage_primary.clone(), empty_table())]),
				primary: self.storage_primary,
			},
			stream: StreamConfig {
				implementations: HashMap::from([(self.stream_primary.clone(), empty_table())]),
				primary: self.stream_primary,
				channel: self.channel,
				durable_name: self.durable_name,
				deliver_policy: self.deliver_policy,
			},
			api: self.api,
		}
	}
}
