//! HTTP server for the order lookup API.
//!
//! Exposes one endpoint, `POST /getData`, which answers from the cache
//! only. A known order comes back as the full record, an unknown one as
//! `{}`, and a body that is not a lookup request as `400`.

use axum::{
	extract::{rejection::JsonRejection, DefaultBodyLimit, State},
	http::StatusCode,
	response::{IntoResponse, Json, Response},
	routing::post,
	Router,
};
use order_config::ApiConfig;
use order_core::LookupService;
use order_types::{truncate_id, ErrorResponse, LookupRequest};
use std::future::Future;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Shared application state for the API server.
#[derive(Clone)]
pub struct AppState {
	pub lookup: LookupService,
}

/// Builds the router with its middleware stack.
pub fn router(lookup: LookupService, max_request_size: usize) -> Router {
	Router::new()
		.route("/getData", post(handle_get_data))
		.layer(
			ServiceBuilder::new()
				.layer(TraceLayer::new_for_http())
				.layer(CorsLayer::permissive())
				.layer(DefaultBodyLimit::max(max_request_size)),
		)
		.with_state(AppState { lookup })
}

/// Starts the HTTP server and serves until `shutdown` resolves.
pub async fn start_server<F>(
	api_config: ApiConfig,
	lookup: LookupService,
	shutdown: F,
) -> Result<(), String>
where
	F: Future<Output = ()> + Send + 'static,
{
	let app = router(lookup, api_config.max_request_size);

	let bind_address = format!("{}:{}", api_config.host, api_config.port);
	let listener = TcpListener::bind(&bind_address)
		.await
		.map_err(|e| format!("Failed to bind address {}: {}", bind_address, e))?;

	tracing::info!("Order lookup API listening on {}", bind_address);

	axum::serve(listener, app)
		.with_graceful_shutdown(async move {
			shutdown.await;
			tracing::info!("Shutting down API server");
		})
		.await
		.map_err(|e| format!("Server error: {}", e))?;

	Ok(())
}

/// Handles POST /getData requests.
async fn handle_get_data(
	State(state): State<AppState>,
	payload: Result<Json<LookupRequest>, JsonRejection>,
) -> Response {
	let request = match payload {
		Ok(Json(request)) => request,
		Err(rejection) => {
			tracing::warn!("Rejected lookup request: {}", rejection.body_text());
			let status = match rejection.status() {
				StatusCode::PAYLOAD_TOO_LARGE => StatusCode::PAYLOAD_TOO_LARGE,
				_ => StatusCode::BAD_REQUEST,
			};
			let body = ErrorResponse {
				error: "INVALID_REQUEST".to_string(),
				message: rejection.body_text(),
			};
			return (status, Json(body)).into_response();
		},
	};

	let response = state.lookup.lookup(&request.order_uid).await;
	tracing::debug!(
		order_uid = %truncate_id(&request.order_uid),
		found = response.is_found(),
		"Lookup served"
	);
	Json(response).into_response()
}
