//! Configuration module for the order cache service.
//!
//! This module provides structures and utilities for managing service
//! configuration. It supports loading configuration from TOML files and
//! validates that every referenced implementation is actually configured.
//!
//! ## Modular Configuration Support
//!
//! Configurations can be split into multiple files for better organization:
//! - Use `include = ["file1.toml", "file2.toml"]` to include other config files
//! - Each top-level section must be unique across all files (no duplicates allowed)

pub mod builders;
mod loader;

pub use builders::config::ConfigBuilder;
pub use order_types::DeliverPolicy;

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
	/// Error that occurs during file I/O operations.
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
	/// Error that occurs when parsing TOML configuration.
	#[error("Configuration error: {0}")]
	Parse(String),
	/// Error that occurs when configuration validation fails.
	#[error("Validation error: {0}")]
	Validation(String),
}

impl From<toml::de::Error> for ConfigError {
	fn from(err: toml::de::Error) -> Self {
		// Keep the message, drop the echoed input
		ConfigError::Parse(err.message().to_string())
	}
}

/// Main configuration structure for the order cache service.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
	/// Identity and pipeline tuning of this service instance.
	pub service: ServiceConfig,
	/// Persistence gateway backends.
	pub storage: StorageConfig,
	/// Event stream transport and subscription.
	pub stream: StreamConfig,
	/// Lookup HTTP endpoint.
	pub api: Option<ApiConfig>,
}

/// Configuration specific to the service instance.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
	/// Unique identifier for this service instance.
	pub id: String,
	/// Table the persistence gateway reads at boot and upserts into.
	#[serde(default = "default_table")]
	pub table: String,
	/// Upper bound on concurrently processed stream messages.
	#[serde(default = "default_max_in_flight")]
	pub max_in_flight: usize,
	/// Capacity of the channel between the stream transport and the engine.
	#[serde(default = "default_delivery_buffer")]
	pub delivery_buffer: usize,
	/// Bound on how long shutdown waits for in-flight messages.
	/// Waits indefinitely when unset.
	#[serde(default)]
	pub drain_timeout_seconds: Option<u64>,
}

fn default_table() -> String {
	"order_data".to_string()
}

fn default_max_in_flight() -> usize {
	64
}

fn default_delivery_buffer() -> usize {
	256
}

/// Configuration for the persistence gateway.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
	/// Which implementation to use as primary.
	pub primary: String,
	/// Map of storage implementation names to their configurations.
	pub implementations: HashMap<String, toml::Value>,
}

/// Configuration for the event stream subscription.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamConfig {
	/// Which transport implementation to use as primary.
	pub primary: String,
	/// Map of transport implementation names to their configurations.
	pub implementations: HashMap<String, toml::Value>,
	/// Channel carrying order events.
	#[serde(default = "default_channel")]
	pub channel: String,
	/// Durable identity under which the stream tracks this subscriber.
	/// Keep it stable across restarts so only unacknowledged events are redelivered.
	#[serde(default = "default_durable_name")]
	pub durable_name: String,
	/// Start position for a durable identity seen for the first time.
	#[serde(default)]
	pub deliver_policy: DeliverPolicy,
}

fn default_channel() -> String {
	"order-data".to_string()
}

fn default_durable_name() -> String {
	"order-cache".to_string()
}

/// Configuration for the HTTP lookup server.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
	/// Whether the API server is enabled.
	#[serde(default)]
	pub enabled: bool,
	/// Host address to bind the server to.
	#[serde(default = "default_api_host")]
	pub host: String,
	/// Port to bind the server to.
	#[serde(default = "default_api_port")]
	pub port: u16,
	/// Maximum request size in bytes.
	#[serde(default = "default_max_request_size")]
	pub max_request_size: usize,
}

fn default_api_host() -> String {
	"127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
	8080
}

fn default_max_request_size() -> usize {
	64 * 1024
}

/// Resolves environment variables in a string.
///
/// Replaces ${VAR_NAME} with the value of the environment variable VAR_NAME.
/// Supports default values with ${VAR_NAME:-default_value}.
///
/// Input strings are limited to 1MB.
pub(crate) fn resolve_env_vars(input: &str) -> Result<String, ConfigError> {
	const MAX_INPUT_SIZE: usize = 1024 * 1024;
	if input.len() > MAX_INPUT_SIZE {
		return Err(ConfigError::Validation(format!(
			"Configuration file too large: {} bytes (max: {} bytes)",
			input.len(),
			MAX_INPUT_SIZE
		)));
	}

	let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]{0,127})(?::-([^}]{0,256}))?\}")
		.map_err(|e| ConfigError::Parse(format!("Regex error: {}", e)))?;

	let mut result = String::with_capacity(input.len());
	let mut last_end = 0;

	for cap in re.captures_iter(input) {
		let (Some(full_match), Some(var_name)) = (cap.get(0), cap.get(1)) else {
			continue;
		};

		let value = match std::env::var(var_name.as_str()) {
			Ok(v) => v,
			Err(_) => match cap.get(2) {
				Some(default) => default.as_str().to_string(),
				None => {
					return Err(ConfigError::Validation(format!(
						"Environment variable '{}' not found",
						var_name.as_str()
					)))
				},
			},
		};

		result.push_str(&input[last_end..full_match.start()]);
		result.push_str(&value);
		last_end = full_match.end();
	}
	result.push_str(&input[last_end..]);

	Ok(result)
}

impl Config {
	/// Loads configuration from a file, following `include` directives.
	///
	/// Each top-level section must be unique across all configuration files.
	pub async fn from_file(path: &str) -> Result<Self, ConfigError> {
		let path_buf = Path::new(path);
		let base_dir = path_buf.parent().unwrap_or_else(|| Path::new("."));

		let mut loader = loader::ConfigLoader::new(base_dir);
		let file_name = path_buf
			.file_name()
			.ok_or_else(|| ConfigError::Validation(format!("Invalid path: {}", path)))?;
		loader.load_config(file_name).await
	}

	/// Checks cross-field constraints serde cannot express.
	fn validate(&self) -> Result<(), ConfigError> {
		if self.service.id.is_empty() {
			return Err(ConfigError::Validation("Service ID cannot be empty".into()));
		}
		if self.service.table.is_empty() {
			return Err(ConfigError::Validation("Storage table cannot be empty".into()));
		}
		if self.service.max_in_flight == 0 {
			return Err(ConfigError::Validation(
				"max_in_flight must be greater than zero".into(),
			));
		}
		if self.service.delivery_buffer == 0 {
			return Err(ConfigError::Validation(
				"delivery_buffer must be greater than zero".into(),
			));
		}

		if self.storage.implementations.is_empty() {
			return Err(ConfigError::Validation(
				"At least one storage implementation must be configured".into(),
			));
		}
		if !self.storage.implementations.contains_key(&self.storage.primary) {
			return Err(ConfigError::Validation(format!(
				"Primary storage '{}' has no entry in [storage.implementations]",
				self.storage.primary
			)));
		}

		if self.stream.implementations.is_empty() {
			return Err(ConfigError::Validation(
				"At least one stream implementation must be configured".into(),
			));
		}
		if !self.stream.implementations.contains_key(&self.stream.primary) {
			return Err(ConfigError::Validation(format!(
				"Primary stream '{}' has no entry in [stream.implementations]",
				self.stream.primary
			)));
		}
		if self.stream.channel.is_empty() {
			return Err(ConfigError::Validation("Stream channel cannot be empty".into()));
		}
		if self.stream.durable_name.is_empty() {
			return Err(ConfigError::Validation(
				"Stream durable_name cannot be empty".into(),
			));
		}

		Ok(())
	}
}

/// Parses TOML text, resolving environment variables and validating the result.
impl FromStr for Config {
	type Err = ConfigError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let resolved = resolve_env_vars(s)?;
		let config: Config = toml::from_str(&resolved)?;
		config.validate()?;
		Ok(config)
	}
}
