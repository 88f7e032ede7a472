use std::sync::Arc;

use ruma::{CanonicalJsonObject, EventId};

use crate::{service::pdu::PduEvent, Result};

pub trait Data: Send + Sync {
    /// A persisted timeline event by id.
    fn get_pdu(&self, event_id: &EventId) -> Result<Option<Arc<PduEvent>>>;

    /// The canonical JSON of a persisted timeline event.
    fn get_pdu_json(&self, event_id: &EventId) -> Result<Option<CanonicalJsonObject>>;

    fn pdu_exists(&self, event_id: &EventId) -> Result<bool>;

    /// Append a committed event under its sequence number. The sequence
    /// number is the replication-log key; it is assigned exactly once, after
    /// the event body has been accepted.
    fn append_pdu(&self, seq: u64, pdu: &PduEvent, json: &CanonicalJsonObject) -> Result<()>;

    /// Committed `(seq, event_id)` pairs with `seq > since`, in sequence
    /// order.
    fn pdus_since(&self, since: u64) -> Result<Vec<(u64, Arc<PduEvent>)>>;

    /// Highest sequence number committed so far, 0 when empty.
    fn last_seq(&self) -> Result<u64>;
}
