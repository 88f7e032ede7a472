// =============================================================================
// Trellis Matrix NextServer - Outlier Store
// =============================================================================
//
// Project: Trellis - Matrix NextServer Federation Ingest Engine
// Contributors: Trellis Development Team
// Date: 2025-06-14
// Version: 0.4.0-alpha
// License: Apache 2.0 / MIT
//
// =============================================================================

mod data;

use std::sync::Arc;

pub use data::Data;
use ruma::{CanonicalJsonObject, EventId};

use crate::{service::pdu::PduEvent, Result};

pub struct Service {
    pub db: Arc<dyn Data>,
}

impl Service {
    /// An event validated and stored outside the timeline, by id.
    pub fn get_outlier_pdu(&self, event_id: &EventId) -> Result<Option<Arc<PduEvent>>> {
        self.db.get_outlier_pdu(event_id)
    }

    /// Persist an event as an outlier.
    pub fn add_pdu_outlier(&self, event_id: &EventId, json: &CanonicalJsonObject) -> Result<()> {
        self.db.add_pdu_outlier(event_id, json)
    }
}
