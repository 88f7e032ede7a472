// =============================================================================
// Trellis Matrix NextServer - PDU Type
// =============================================================================
//
// Project: Trellis - Matrix NextServer Federation Ingest Engine
// Contributors: Trellis Development Team
// Date: 2025-06-14
// Version: 0.4.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   The persistent event shape flowing through fetch and evaluation, plus
//   the canonical-JSON helpers for event-id computation.
//
// =============================================================================

use std::{cmp::Ordering, collections::BTreeMap};

use ruma::{
    room_version_rules::RoomVersionRules, CanonicalJsonObject, CanonicalJsonValue, EventId,
    OwnedEventId, OwnedRoomId, OwnedServerName, OwnedUserId, ServerName, UInt,
};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue as RawJsonValue;

use crate::{Error, Result};

/// Content hashes of a PDU.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EventHash {
    /// The SHA-256 hash over the canonical form, unpadded base64.
    pub sha256: String,
}

/// Signatures of a PDU: server name to key id to unpadded-base64 signature.
pub type EventSignatures = BTreeMap<OwnedServerName, BTreeMap<String, String>>;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PduEvent {
    pub event_id: OwnedEventId,
    pub room_id: OwnedRoomId,
    pub sender: OwnedUserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<OwnedServerName>,
    pub origin_server_ts: UInt,
    #[serde(rename = "type")]
    pub kind: String,
    pub content: Box<RawJsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    pub prev_events: Vec<OwnedEventId>,
    pub depth: UInt,
    pub auth_events: Vec<OwnedEventId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redacts: Option<OwnedEventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsigned: Option<Box<RawJsonValue>>,
    pub hashes: EventHash,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signatures: Option<EventSignatures>,
}

impl PduEvent {
    /// The homeserver this event claims as its source: the `origin` field if
    /// set, else the host part of `sender`.
    pub fn origin_host(&self) -> &ServerName {
        self.origin
            .as_deref()
            .unwrap_or_else(|| self.sender.server_name())
    }

    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }

    /// Serialize back into the canonical object shape, `event_id` included.
    pub fn to_canonical_object(&self) -> Result<CanonicalJsonObject> {
        let value = serde_json::to_value(self)?;
        let object = ruma::canonical_json::try_from_json_map(
            value
                .as_object()
                .expect("pdu serializes to an object")
                .clone(),
        )
        .map_err(|_| Error::bad_database("PDU is not canonical JSON"))?;

        Ok(object)
    }

    pub fn from_canonical_object(
        event_id: &EventId,
        mut object: CanonicalJsonObject,
    ) -> Result<Self> {
        object.insert(
            "event_id".to_owned(),
            CanonicalJsonValue::String(event_id.as_str().to_owned()),
        );

        serde_json::from_value(
            serde_json::to_value(object).expect("canonical object is a valid JSON value"),
        )
        .map_err(|_| Error::InvalidEvent("response is not a valid PDU".to_owned()))
    }
}

// Events sort by depth, then event id. Lists of PDUs received over
// federation are evaluated in this order unless the caller asked for its
// own order to be preserved.
impl PartialEq for PduEvent {
    fn eq(&self, other: &Self) -> bool {
        self.event_id == other.event_id
    }
}

impl Eq for PduEvent {}

impl PartialOrd for PduEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PduEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.depth
            .cmp(&other.depth)
            .then_with(|| self.event_id.cmp(&other.event_id))
    }
}

/// Generates a correct event id for the incoming pdu and returns it together
/// with the parsed canonical object.
pub fn gen_event_id_canonical_json(
    pdu: &RawJsonValue,
    rules: &RoomVersionRules,
) -> Result<(OwnedEventId, CanonicalJsonObject)> {
    let value: CanonicalJsonObject = serde_json::from_str(pdu.get())
        .map_err(|_| Error::BadServerResponse("invalid PDU in server response".to_owned()))?;

    let event_id = gen_event_id(&value, rules)?;

    Ok((event_id, value))
}

/// Computes the reference-hash event id of an already-parsed object.
pub fn gen_event_id(
    value: &CanonicalJsonObject,
    rules: &RoomVersionRules,
) -> Result<OwnedEventId> {
    let hash = ruma::signatures::reference_hash(value, rules)
        .map_err(|_| Error::InvalidEvent("invalid PDU format".to_owned()))?;

    let event_id = format!("${hash}")
        .try_into()
        .expect("ruma's reference hashes are valid event ids");

    Ok(event_id)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn pdu(event_id: &str, depth: u64) -> PduEvent {
        serde_json::from_value(json!({
            "event_id": event_id,
            "room_id": "!r:trellis.test",
            "sender": "@u:remote.test",
            "origin_server_ts": 1_700_000_000_000u64,
            "type": "m.room.message",
            "content": { "body": "hi" },
            "prev_events": [],
            "depth": depth,
            "auth_events": [],
            "hashes": { "sha256": "aaaa" },
        }))
        .unwrap()
    }

    #[test]
    fn sorts_by_depth_then_id() {
        let mut events = vec![pdu("$c:x", 2), pdu("$a:x", 2), pdu("$b:x", 1)];
        events.sort_unstable();

        let ids: Vec<_> = events.iter().map(|e| e.event_id.as_str()).collect();
        assert_eq!(ids, ["$b:x", "$a:x", "$c:x"]);
    }

    #[test]
    fn origin_falls_back_to_sender_host() {
        let event = pdu("$a:x", 1);
        assert_eq!(event.origin_host().as_str(), "remote.test");

        let mut with_origin = pdu("$a:x", 1);
        with_origin.origin = Some("claimed.test".try_into().unwrap());
        assert_eq!(with_origin.origin_host().as_str(), "claimed.test");
    }

    #[test]
    fn canonical_form_roundtrips() {
        let event = pdu("$a:x", 3);
        let object = event.to_canonical_object().unwrap();

        let canonical =
            serde_json::to_string(&CanonicalJsonValue::Object(object.clone())).unwrap();
        let reparsed: CanonicalJsonObject = serde_json::from_str(&canonical).unwrap();

        assert_eq!(
            serde_json::to_string(&CanonicalJsonValue::Object(reparsed)).unwrap(),
            canonical
        );
    }

    #[test]
    fn event_id_ignores_unsigned() {
        let rules = ruma::RoomVersionId::V10.rules().unwrap();
        let raw = serde_json::value::to_raw_value(&json!({
            "room_id": "!r:trellis.test",
            "sender": "@u:remote.test",
            "origin_server_ts": 1_700_000_000_000u64,
            "type": "m.room.message",
            "content": { "body": "hi" },
            "prev_events": [],
            "depth": 1,
            "auth_events": [],
            "hashes": { "sha256": "aaaa" },
        }))
        .unwrap();

        let (plain_id, mut value) = gen_event_id_canonical_json(&raw, &rules).unwrap();
        assert!(plain_id.as_str().starts_with('$'));

        value.insert(
            "unsigned".to_owned(),
            CanonicalJsonValue::Object(Default::default()),
        );
        let with_unsigned = gen_event_id(&value, &rules).unwrap();
        assert_eq!(plain_id, with_unsigned);
    }
}
