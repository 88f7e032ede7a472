use std::sync::Arc;

use ruma::{CanonicalJsonObject, EventId};

use crate::{service::pdu::PduEvent, Result};

pub trait Data: Send + Sync {
    fn get_outlier_pdu(&self, event_id: &EventId) -> Result<Option<Arc<PduEvent>>>;

    fn add_pdu_outlier(&self, event_id: &EventId, json: &CanonicalJsonObject) -> Result<()>;
}
