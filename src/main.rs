// =============================================================================
// Trellis Matrix NextServer - Server Binary
// =============================================================================
//
// Project: Trellis - Matrix NextServer Federation Ingest Engine
// Contributors: Trellis Development Team
// Date: 2025-06-14
// Version: 0.4.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Development entry point: loads the configuration, assembles the ingest
//   core over the in-memory backend and the reqwest transport, runs until
//   interrupted, then shuts the core down.
//
// =============================================================================

mod clap;

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{prelude::*, EnvFilter};
use trellis::{
    database::MemoryDatabase,
    service::{globals, sending::ReqwestTransport, vm::PermitAll},
    Config, Services,
};

#[tokio::main]
async fn main() {
    let args = clap::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("cannot load {}: {e}", args.config.display());
            std::process::exit(1);
        }
    };

    let filter = EnvFilter::try_new(&config.log).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();

    if let Err(e) = run(config).await {
        error!("fatal: {e}");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> trellis::Result<()> {
    let keypair = globals::Service::generate_keypair()?;
    let transport = Arc::new(ReqwestTransport::new()?);
    let db = MemoryDatabase::new();

    let services = Services::build(config, keypair, db, transport, Arc::new(PermitAll))?;
    services.start();

    info!(
        server_name = %services.globals.server_name(),
        "trellis ingest core running"
    );

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for shutdown signal");

    info!("shutting down");
    services.shutdown().await;

    Ok(())
}
