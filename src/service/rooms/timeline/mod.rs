// =============================================================================
// Trellis Matrix NextServer - Timeline Store
// =============================================================================
//
// Project: Trellis - Matrix NextServer Federation Ingest Engine
// Contributors: Trellis Development Team
// Date: 2025-06-14
// Version: 0.4.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Committed-event view over the storage collaborator: events keyed by id
//   plus the sequence-indexed transaction log the replication layer reads.
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
    pub fn get_pdu(&self, event_id: &EventId) -> Result<Option<Arc<PduEvent>>> {
        self.db.get_pdu(event_id)
    }

    pub fn get_pdu_json(&self, event_id: &EventId) -> Result<Option<CanonicalJsonObject>> {
        self.db.get_pdu_json(event_id)
    }

    pub fn pdu_exists(&self, event_id: &EventId) -> Result<bool> {
        self.db.pdu_exists(event_id)
    }

    pub fn append_pdu(&self, seq: u64, pdu: &PduEvent, json: &CanonicalJsonObject) -> Result<()> {
        self.db.append_pdu(seq, pdu, json)
    }

    pub fn pdus_since(&self, since: u64) -> Result<Vec<(u64, Arc<PduEvent>)>> {
        self.db.pdus_since(since)
    }

    pub fn last_seq(&self) -> Result<u64> {
        self.db.last_seq()
    }
}
