// =============================================================================
// Trellis Matrix NextServer - Command Line Interface
// =============================================================================
//
// Project: Trellis - Matrix NextServer Federation Ingest Engine
// Contributors: Trellis Development Team
// Date: 2025-06-14
// Version: 0.4.0-alpha
// License: Apache 2.0 / MIT
//
// =============================================================================

use std::path::PathBuf;

use clap::Parser;

/// Trellis federation ingest engine
#[derive(Parser)]
#[command(name = "trellis", version, about)]
pub struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "trellis.toml")]
    pub config: PathBuf,
}

pub fn parse() -> Args {
    Args::parse()
}
