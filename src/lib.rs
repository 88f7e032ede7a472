// =============================================================================
// Trellis Matrix NextServer - Library Crate
// =============================================================================
//
// Project: Trellis - Matrix NextServer Federation Ingest Engine
// Contributors: Trellis Development Team
// Date: 2025-06-14
// Version: 0.4.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Core library of the Trellis federation ingest engine: outbound event
//   retrieval, the evaluation pipeline, event verification, and the
//   registries tying them together. Storage, wire transport and the Matrix
//   authorization rules are collaborators supplied by the embedder.
//
// =============================================================================

pub mod config;
pub mod database;
pub mod service;
pub mod utils;

pub use config::Config;
pub use service::{pdu::PduEvent, Services};
pub use utils::error::{Error, Result};

// Re-export the protocol stack for embedders.
pub use ruma;
