// =============================================================================
// Trellis Matrix NextServer - Rooms Services
// =============================================================================
//
// Project: Trellis - Matrix NextServer Federation Ingest Engine
// Contributors: Trellis Development Team
// Date: 2025-06-14
// Version: 0.4.0-alpha
// License: Apache 2.0 / MIT
//
// =============================================================================

pub mod outlier;
pub mod state_cache;
pub mod timeline;

use std::sync::Arc;

pub struct Service {
    pub state_cache: Arc<state_cache::Service>,
    pub timeline: Arc<timeline::Service>,
    pub outlier: Arc<outlier::Service>,
}
