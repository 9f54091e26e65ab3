#[macro_use]
extern crate tracing;

use std::{net::SocketAddr, str::FromStr, time::Duration};

use anyhow::{Context, anyhow};
use tokio_util::sync::CancellationToken;

mod api;
mod compose;
mod config;
mod error;
mod fingerprint;
mod notify;
mod portainer;
mod recipe;
mod reconciler;
mod registry;

/// How long a cancelled cycle gets to unwind on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  dotenvy::dotenv().ok();
  let config =
    config::init_config().context("Invalid configuration")?;
  logger::init(&config.logging)?;

  info!(
    "Deployment Agent version: v{}",
    env!("CARGO_PKG_VERSION")
  );
  info!("{:?}", config.sanitized());

  std::fs::create_dir_all(config.repos_root())
    .context("Failed to create repos directory")?;
  std::fs::create_dir_all(config.work_root())
    .context("Failed to create work directory")?;

  let cancel = CancellationToken::new();
  let reconciler_handle =
    reconciler::Reconciler::new(config, cancel.clone())?.spawn();

  let addr =
    format!("{}:{}", config.main.host, config.main.port);
  let socket_addr = SocketAddr::from_str(&addr)
    .context("Failed to parse listen address")?;
  info!("Deployment Agent starting on http://{socket_addr}");
  let app = api::router(config).into_make_service();
  let mut server = tokio::spawn(async move {
    axum_server::bind(socket_addr)
      .serve(app)
      .await
      .context("Failed to start http server")
  });

  let mut term_signal = tokio::signal::unix::signal(
    tokio::signal::unix::SignalKind::terminate(),
  )?;
  tokio::select! {
    res = &mut server => {
      res.context("Http server task panicked")??;
      return Err(anyhow!("Http server exited unexpectedly"));
    }
    _ = term_signal.recv() => {}
    _ = tokio::signal::ctrl_c() => {}
  }

  info!("Received shutdown signal, cancelling current cycle");
  cancel.cancel();
  server.abort();
  if tokio::time::timeout(SHUTDOWN_GRACE, reconciler_handle)
    .await
    .is_err()
  {
    warn!("Reconciler did not unwind within the shutdown grace");
  }
  Ok(())
}
