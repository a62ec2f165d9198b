//! Main entry point for the order cache service.
//!
//! Hydrates the in-memory cache from the durable store, consumes order
//! events from the stream, and answers lookups over HTTP until SIGINT or
//! SIGTERM, after which in-flight events are drained before exit.

use clap::Parser;
use order_config::Config;
use order_core::{shutdown_signal, LifecycleState};
use order_service::{factory_registry, server};
use std::path::PathBuf;
use tokio::sync::oneshot;

/// Command-line arguments for the order cache service.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
	/// Path to configuration file
	#[arg(short, long, default_value = "config.toml")]
	config: PathBuf,

	/// Log level (trace, debug, info, warn, error)
	#[arg(short, long, default_value = "info")]
	log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	let args = Args::parse();

	use tracing_subscriber::{fmt, EnvFilter};

	let default_directive = args.log_level.to_string();
	let env_filter =
		EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

	fmt()
		.with_env_filter(env_filter)
		.with_thread_ids(true)
		.with_target(true)
		.init();

	tracing::info!("Started order cache");

	let config_path = args
		.config
		.to_str()
		.ok_or_else(|| format!("Config path is not valid UTF-8: {}", args.config.display()))?;
	let config = Config::from_file(config_path).await?;
	tracing::info!("Loaded configuration [{}]", config.service.id);

	let api_config = config.api.clone().filter(|api| api.enabled);
	let engine = factory_registry::build_engine_from_config(config)?;

	// The API comes up once the cache is hydrated and goes down after the
	// engine has released its connections.
	let (api_failed_tx, mut api_failed_rx) = oneshot::channel::<()>();
	let api_task = api_config.map(|api_config| {
		let lookup = engine.lookup_service();
		let mut state = engine.subscribe_state();
		tokio::spawn(async move {
			let started = state
				.wait_for(|state| *state >= LifecycleState::Running)
				.await
				.is_ok_and(|state| *state == LifecycleState::Running);
			if !started {
				return;
			}

			let closed = async move {
				let _ = state.wait_for(|state| *state == LifecycleState::Closed).await;
			};
			if let Err(e) = server::start_server(api_config, lookup, closed).await {
				tracing::error!("API server failed: {}", e);
				let _ = api_failed_tx.send(());
			}
		})
	});
	if api_task.is_none() {
		tracing::info!("API server disabled");
	}

	engine
		.run_until(async {
			tokio::select! {
				_ = shutdown_signal() => {},
				Ok(()) = &mut api_failed_rx => {
					tracing::warn!("Stopping after API server failure");
				},
			}
		})
		.await?;

	if let Some(task) = api_task {
		if let Err(e) = task.await {
			tracing::error!("API server task panicked: {}", e);
		}
	}

	tracing::info!("Stopped order cache");
	Ok(())
}
