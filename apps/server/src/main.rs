use std::process::ExitCode;
use std::sync::Arc;

use cb_core::{Core, SyncConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod routes;
mod utils;

#[tokio::main]
async fn main() -> ExitCode {
	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| EnvFilter::new("cb_core=info,cb_server=info")),
		)
		.init();

	let config = match SyncConfig::from_env() {
		Ok(config) => config,
		Err(err) => {
			error!(%err, "invalid configuration");
			return ExitCode::from(2);
		}
	};
	if let Err(err) = config.validate() {
		error!(%err, "invalid configuration");
		return ExitCode::from(2);
	}

	let core = match Core::bootstrap(config).await {
		Ok(core) => Arc::new(core),
		Err(err) => {
			error!(%err, "startup failed");
			return ExitCode::from(1);
		}
	};
	if let Err(err) = core.start().await {
		error!(%err, "startup failed");
		return ExitCode::from(1);
	}

	let addr = core.config.http_addr.clone();
	let listener = match tokio::net::TcpListener::bind(&addr).await {
		Ok(listener) => listener,
		Err(err) => {
			error!(%err, %addr, "could not bind control surface");
			core.shutdown().await;
			return ExitCode::from(1);
		}
	};
	info!(%addr, "control surface listening");

	let app = routes::router(core.clone());
	if let Err(err) = axum::serve(listener, app)
		.with_graceful_shutdown(utils::shutdown_signal())
		.await
	{
		error!(%err, "http server failed");
		core.shutdown().await;
		return ExitCode::from(1);
	}

	core.shutdown().await;
	ExitCode::SUCCESS
}
