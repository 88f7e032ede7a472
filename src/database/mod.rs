// =============================================================================
// Trellis Matrix NextServer - Storage Backends
// =============================================================================
//
// Project: Trellis - Matrix NextServer Federation Ingest Engine
// Contributors: Trellis Development Team
// Date: 2025-06-14
// Version: 0.4.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   The ingest core consumes storage through the per-service `Data` traits;
//   deployments bring the key-value engine of their choice. This module
//   provides the in-memory backend used for development and tests: events
//   keyed by id, a sequence-indexed commit log, outliers, room membership
//   and cached server keys.
//
// =============================================================================

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, RwLock},
};

use ruma::{
    CanonicalJsonObject, EventId, OwnedEventId, OwnedRoomId, OwnedServerName, RoomId, ServerName,
};

use crate::{
    service::{
        keys::{self, SigningKeys},
        pdu::PduEvent,
        rooms,
    },
    Error, Result,
};

#[derive(Default)]
pub struct MemoryDatabase {
    signing_keys: RwLock<HashMap<OwnedServerName, SigningKeys>>,
    room_servers: RwLock<HashMap<OwnedRoomId, Vec<OwnedServerName>>>,
    pdus: RwLock<HashMap<OwnedEventId, (Arc<PduEvent>, CanonicalJsonObject)>>,
    log: RwLock<BTreeMap<u64, OwnedEventId>>,
    outliers: RwLock<HashMap<OwnedEventId, CanonicalJsonObject>>,
}

impl MemoryDatabase {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Seed the joined-server set of a room.
    pub fn set_room_servers(&self, room_id: &RoomId, servers: Vec<OwnedServerName>) {
        self.room_servers
            .write()
            .unwrap()
            .insert(room_id.to_owned(), servers);
    }
}

impl keys::Data for MemoryDatabase {
    fn signing_keys_for(&self, origin: &ServerName) -> Result<Option<SigningKeys>> {
        Ok(self.signing_keys.read().unwrap().get(origin).cloned())
    }

    fn put_signing_keys(&self, origin: &ServerName, keys: &SigningKeys) -> Result<()> {
        self.signing_keys
            .write()
            .unwrap()
            .insert(origin.to_owned(), keys.clone());
        Ok(())
    }
}

impl rooms::state_cache::Data for MemoryDatabase {
    fn room_servers(&self, room_id: &RoomId) -> Result<Vec<OwnedServerName>> {
        Ok(self
            .room_servers
            .read()
            .unwrap()
            .get(room_id)
            .cloned()
            .unwrap_or_default())
    }

    fn server_in_room(&self, server: &ServerName, room_id: &RoomId) -> Result<bool> {
        Ok(self
            .room_servers
            .read()
            .unwrap()
            .get(room_id)
            .map_or(false, |servers| servers.iter().any(|s| s == server)))
    }

    fn room_exists(&self, room_id: &RoomId) -> Result<bool> {
        Ok(self.room_servers.read().unwrap().contains_key(room_id))
    }
}

impl rooms::timeline::Data for MemoryDatabase {
    fn get_pdu(&self, event_id: &EventId) -> Result<Option<Arc<PduEvent>>> {
        Ok(self
            .pdus
            .read()
            .unwrap()
            .get(event_id)
            .map(|(pdu, _)| Arc::clone(pdu)))
    }

    fn get_pdu_json(&self, event_id: &EventId) -> Result<Option<CanonicalJsonObject>> {
        Ok(self
            .pdus
            .read()
            .unwrap()
            .get(event_id)
            .map(|(_, json)| json.clone()))
    }

    fn pdu_exists(&self, event_id: &EventId) -> Result<bool> {
        Ok(self.pdus.read().unwrap().contains_key(event_id))
    }

    fn append_pdu(&self, seq: u64, pdu: &PduEvent, json: &CanonicalJsonObject) -> Result<()> {
        let event_id: OwnedEventId = (*pdu.event_id).to_owned();

        let mut log = self.log.write().unwrap();
        if log.contains_key(&seq) {
            return Err(Error::bad_database(format!(
                "sequence {seq} already committed"
            )));
        }

        log.insert(seq, event_id.clone());
        drop(log);

        self.pdus
            .write()
            .unwrap()
            .insert(event_id, (Arc::new(pdu.clone()), json.clone()));

        Ok(())
    }

    fn pdus_since(&self, since: u64) -> Result<Vec<(u64, Arc<PduEvent>)>> {
        let log = self.log.read().unwrap();
        let pdus = self.pdus.read().unwrap();

        Ok(log
            .range(since + 1..)
            .filter_map(|(&seq, event_id)| {
                pdus.get(event_id).map(|(pdu, _)| (seq, Arc::clone(pdu)))
            })
            .collect())
    }

    fn last_seq(&self) -> Result<u64> {
        Ok(self
            .log
            .read()
            .unwrap()
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0))
    }
}

impl rooms::outlier::Data for MemoryDatabase {
    fn get_outlier_pdu(&self, event_id: &EventId) -> Result<Option<Arc<PduEvent>>> {
        self.outliers
            .read()
            .unwrap()
            .get(event_id)
            .map(|json| PduEvent::from_canonical_object(event_id, json.clone()).map(Arc::new))
            .transpose()
    }

    fn add_pdu_outlier(&self, event_id: &EventId, json: &CanonicalJsonObject) -> Result<()> {
        self.outliers
            .write()
            .unwrap()
            .insert(event_id.to_owned(), json.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::service::rooms::timeline::Data as _;

    fn pdu(event_id: &str) -> PduEvent {
        serde_json::from_value(json!({
            "event_id": event_id,
            "room_id": "!r:trellis.test",
            "sender": "@u:remote.test",
            "origin_server_ts": 1_700_000_000_000u64,
            "type": "m.room.message",
            "content": {},
            "prev_events": [],
            "depth": 1,
            "auth_events": [],
            "hashes": { "sha256": "aaaa" },
        }))
        .unwrap()
    }

    #[test]
    fn commit_log_iterates_in_sequence_order() {
        let db = MemoryDatabase::new();
        let json = CanonicalJsonObject::new();

        db.append_pdu(1, &pdu("$a:x"), &json).unwrap();
        db.append_pdu(2, &pdu("$b:x"), &json).unwrap();
        db.append_pdu(3, &pdu("$c:x"), &json).unwrap();

        let since_1: Vec<u64> = db.pdus_since(1).unwrap().iter().map(|(s, _)| *s).collect();
        assert_eq!(since_1, [2, 3]);
        assert_eq!(db.last_seq().unwrap(), 3);
    }

    #[test]
    fn duplicate_sequence_rejected() {
        let db = MemoryDatabase::new();
        let json = CanonicalJsonObject::new();

        db.append_pdu(1, &pdu("$a:x"), &json).unwrap();
        assert!(db.append_pdu(1, &pdu("$b:x"), &json).is_err());
    }
}
