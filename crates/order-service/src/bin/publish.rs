//! Publishes order documents to the configured stream channel.
//!
//! Each file's bytes are sent unchanged as one event, so malformed
//! documents can be published too. Only the `file` stream backend outlives
//! this process.

use clap::Parser;
use futures::future::join_all;
use order_config::Config;
use order_service::factory_registry::initialize_registry;
use order_stream::StreamService;
use std::path::PathBuf;

/// Command-line arguments for the publisher.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
	/// Path to configuration file
	#[arg(short, long, default_value = "config.toml")]
	config: PathBuf,

	/// Log level (trace, debug, info, warn, error)
	#[arg(short, long, default_value = "info")]
	log_level: String,

	/// JSON files to publish, one event per file
	#[arg(required = true)]
	files: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	let args = Args::parse();

	use tracing_subscriber::{fmt, EnvFilter};

	let env_filter = EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| EnvFilter::new(args.log_level.to_string()));
	fmt().with_env_filter(env_filter).with_target(true).init();

	let config_path = args
		.config
		.to_str()
		.ok_or_else(|| format!("Config path is not valid UTF-8: {}", args.config.display()))?;
	let config = Config::from_file(config_path).await?;

	let primary = &config.stream.primary;
	let factory = initialize_registry()
		.stream
		.get(primary)
		.ok_or_else(|| format!("Unknown stream implementation '{}'", primary))?;
	let backend_config = config
		.stream
		.implementations
		.get(primary)
		.ok_or_else(|| format!("Stream '{}' has no configuration table", primary))?;
	let stream = StreamService::new(factory(backend_config)?);
	let channel = config.stream.channel.as_str();

	let results = join_all(args.files.iter().map(|path| {
		let stream = &stream;
		async move {
			let payload = tokio::fs::read(path)
				.await
				.map_err(|e| format!("failed to read: {}", e))?;
			stream
				.publish(channel, payload)
				.await
				.map_err(|e| format!("failed to publish: {}", e))
		}
	}))
	.await;

	let mut failures = 0;
	for (path, result) in args.files.iter().zip(results) {
		match result {
			Ok(sequence) => {
				tracing::info!(file = %path.display(), sequence, channel, "Published")
			},
			Err(e) => {
				failures += 1;
				tracing::error!(file = %path.display(), error = %e, "Publish failed");
			},
		}
	}

	stream.close().await?;

	if failures > 0 {
		return Err(format!("{} of {} files failed to publish", failures, args.files.len()).into());
	}
	Ok(())
}
