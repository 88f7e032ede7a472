// =============================================================================
// Trellis Matrix NextServer - Event Conformance Checks
// =============================================================================
//
// Project: Trellis - Matrix NextServer Federation Ingest Engine
// Contributors: Trellis Development Team
// Date: 2025-06-14
// Version: 0.4.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Structural conformance checklist applied to received events, before any
//   cryptographic or authorization work. Each failed predicate sets one code
//   in the report; a non-clean report aborts the evaluation with the
//   concatenated code names.
//
// =============================================================================

use std::fmt;

use ruma::{CanonicalJsonObject, CanonicalJsonValue, EventId, RoomId, ServerName, UserId};

/// One structural defect of an event.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Code {
    InvalidOrMissingRoomId,
    InvalidOrMissingSenderId,
    MissingType,
    InvalidOrigin,
    MissingHashes,
    MissingSignatures,
    MissingOriginSignature,
    MismatchOriginSender,
    MissingContentMembership,
    MissingMemberStateKey,
    InvalidMemberStateKey,
    InvalidOrMissingRedactsId,
    SelfRedacts,
    MissingPrevEvents,
    MissingAuthEvents,
    DepthNegative,
    DepthZero,
    SelfPrevEvent,
    SelfAuthEvent,
    DupPrevEvent,
    DupAuthEvent,
}

const CODES: [Code; 21] = [
    Code::InvalidOrMissingRoomId,
    Code::InvalidOrMissingSenderId,
    Code::MissingType,
    Code::InvalidOrigin,
    Code::MissingHashes,
    Code::MissingSignatures,
    Code::MissingOriginSignature,
    Code::MismatchOriginSender,
    Code::MissingContentMembership,
    Code::MissingMemberStateKey,
    Code::InvalidMemberStateKey,
    Code::InvalidOrMissingRedactsId,
    Code::SelfRedacts,
    Code::MissingPrevEvents,
    Code::MissingAuthEvents,
    Code::DepthNegative,
    Code::DepthZero,
    Code::SelfPrevEvent,
    Code::SelfAuthEvent,
    Code::DupPrevEvent,
    Code::DupAuthEvent,
];

impl Code {
    pub fn name(self) -> &'static str {
        match self {
            Code::InvalidOrMissingRoomId => "INVALID_OR_MISSING_ROOM_ID",
            Code::InvalidOrMissingSenderId => "INVALID_OR_MISSING_SENDER_ID",
            Code::MissingType => "MISSING_TYPE",
            Code::InvalidOrigin => "INVALID_ORIGIN",
            Code::MissingHashes => "MISSING_HASHES",
            Code::MissingSignatures => "MISSING_SIGNATURES",
            Code::MissingOriginSignature => "MISSING_ORIGIN_SIGNATURE",
            Code::MismatchOriginSender => "MISMATCH_ORIGIN_SENDER",
            Code::MissingContentMembership => "MISSING_CONTENT_MEMBERSHIP",
            Code::MissingMemberStateKey => "MISSING_MEMBER_STATE_KEY",
            Code::InvalidMemberStateKey => "INVALID_MEMBER_STATE_KEY",
            Code::InvalidOrMissingRedactsId => "INVALID_OR_MISSING_REDACTS_ID",
            Code::SelfRedacts => "SELF_REDACTS",
            Code::MissingPrevEvents => "MISSING_PREV_EVENTS",
            Code::MissingAuthEvents => "MISSING_AUTH_EVENTS",
            Code::DepthNegative => "DEPTH_NEGATIVE",
            Code::DepthZero => "DEPTH_ZERO",
            Code::SelfPrevEvent => "SELF_PREV_EVENT",
            Code::SelfAuthEvent => "SELF_AUTH_EVENT",
            Code::DupPrevEvent => "DUP_PREV_EVENT",
            Code::DupAuthEvent => "DUP_AUTH_EVENT",
        }
    }
}

/// Bitmask of failed predicates.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Report(u64);

impl Report {
    /// Run the checklist over a received event object. `expected_event_id`
    /// is the reference-hash id of the event, when the caller knows it; the
    /// self-reference checks need it since modern PDUs carry no id field.
    pub fn check(event: &CanonicalJsonObject, expected_event_id: Option<&EventId>) -> Self {
        let mut report = Self::default();

        let room_id_ok = string_field(event, "room_id")
            .map(|s| <&RoomId>::try_from(s).is_ok())
            .unwrap_or(false);
        if !room_id_ok {
            report.set(Code::InvalidOrMissingRoomId);
        }

        let sender = string_field(event, "sender").and_then(|s| <&UserId>::try_from(s).ok());
        if sender.is_none() {
            report.set(Code::InvalidOrMissingSenderId);
        }

        let kind = string_field(event, "type").unwrap_or_default();
        if kind.is_empty() {
            report.set(Code::MissingType);
        }

        let origin = string_field(event, "origin");
        if let Some(origin) = origin {
            if <&ServerName>::try_from(origin).is_err() {
                report.set(Code::InvalidOrigin);
            } else if let Some(sender) = sender {
                if sender.server_name().as_str() != origin {
                    report.set(Code::MismatchOriginSender);
                }
            }
        }

        if object_field(event, "hashes").map_or(true, |o| o.is_empty()) {
            report.set(Code::MissingHashes);
        }

        let claimed_origin = origin
            .filter(|o| <&ServerName>::try_from(*o).is_ok())
            .or_else(|| sender.map(|s| s.server_name().as_str()));

        match object_field(event, "signatures") {
            None => report.set(Code::MissingSignatures),
            Some(signatures) if signatures.is_empty() => report.set(Code::MissingSignatures),
            Some(signatures) => {
                let signed_by_origin = claimed_origin
                    .and_then(|origin| signatures.get(origin))
                    .and_then(|v| v.as_object())
                    .map_or(false, |keys| !keys.is_empty());
                if !signed_by_origin {
                    report.set(Code::MissingOriginSignature);
                }
            }
        }

        if kind == "m.room.member" {
            let membership = object_field(event, "content")
                .and_then(|content| content.get("membership"))
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            if membership.is_empty() {
                report.set(Code::MissingContentMembership);
            }

            match string_field(event, "state_key") {
                None => report.set(Code::MissingMemberStateKey),
                Some(state_key) if <&UserId>::try_from(state_key).is_err() => {
                    report.set(Code::InvalidMemberStateKey)
                }
                Some(_) => {}
            }
        }

        if kind == "m.room.redaction" {
            let redacts_ok = string_field(event, "redacts")
                .map(|s| <&EventId>::try_from(s).is_ok())
                .unwrap_or(false);
            if !redacts_ok {
                report.set(Code::InvalidOrMissingRedactsId);
            }
        }

        if let (Some(redacts), Some(event_id)) = (string_field(event, "redacts"), expected_event_id)
        {
            if redacts == event_id.as_str() {
                report.set(Code::SelfRedacts);
            }
        }

        let prev_events = reference_ids(event, "prev_events");
        let auth_events = reference_ids(event, "auth_events");

        if kind != "m.room.create" {
            if prev_events.is_empty() {
                report.set(Code::MissingPrevEvents);
            }

            if auth_events.is_empty() {
                report.set(Code::MissingAuthEvents);
            }
        }

        match event.get("depth") {
            Some(CanonicalJsonValue::Integer(depth)) => {
                if i64::from(*depth) < 0 {
                    report.set(Code::DepthNegative);
                }

                if kind != "m.room.create" && i64::from(*depth) == 0 {
                    report.set(Code::DepthZero);
                }
            }
            _ => report.set(Code::DepthNegative),
        }

        if let Some(event_id) = expected_event_id {
            if prev_events.iter().any(|id| *id == event_id.as_str()) {
                report.set(Code::SelfPrevEvent);
            }

            if auth_events.iter().any(|id| *id == event_id.as_str()) {
                report.set(Code::SelfAuthEvent);
            }
        }

        if has_duplicates(&prev_events) {
            report.set(Code::DupPrevEvent);
        }

        if has_duplicates(&auth_events) {
            report.set(Code::DupAuthEvent);
        }

        report
    }

    pub fn set(&mut self, code: Code) {
        self.0 |= 1 << code as u8;
    }

    pub fn has(&self, code: Code) -> bool {
        self.0 & (1 << code as u8) != 0
    }

    pub fn clean(&self) -> bool {
        self.0 == 0
    }
}

// Space-separated names of every failed predicate.
impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for code in CODES {
            if !self.has(code) {
                continue;
            }

            if !first {
                write!(f, " ")?;
            }
            first = false;
            write!(f, "{}", code.name())?;
        }

        Ok(())
    }
}

fn string_field<'a>(event: &'a CanonicalJsonObject, field: &str) -> Option<&'a str> {
    event.get(field).and_then(|v| v.as_str())
}

fn object_field<'a>(event: &'a CanonicalJsonObject, field: &str) -> Option<&'a CanonicalJsonObject> {
    event.get(field).and_then(|v| v.as_object())
}

/// Referenced event ids of `prev_events`/`auth_events`. Both the modern
/// array-of-strings shape and the legacy array of `[id, hash]` pairs are
/// accepted.
fn reference_ids<'a>(event: &'a CanonicalJsonObject, field: &str) -> Vec<&'a str> {
    let Some(CanonicalJsonValue::Array(refs)) = event.get(field) else {
        return vec![];
    };

    refs.iter()
        .filter_map(|entry| match entry {
            CanonicalJsonValue::String(id) => Some(id.as_str()),
            CanonicalJsonValue::Array(pair) => pair.first().and_then(|v| v.as_str()),
            _ => None,
        })
        .collect()
}

fn has_duplicates(ids: &[&str]) -> bool {
    for (i, a) in ids.iter().enumerate() {
        if ids[..i].contains(a) {
            return true;
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn object(value: serde_json::Value) -> CanonicalJsonObject {
        serde_json::from_value(value).unwrap()
    }

    fn well_formed() -> CanonicalJsonObject {
        object(json!({
            "room_id": "!r:remote.test",
            "sender": "@u:remote.test",
            "origin": "remote.test",
            "origin_server_ts": 1_700_000_000_000u64,
            "type": "m.room.message",
            "content": { "body": "hi" },
            "prev_events": ["$p:remote.test"],
            "auth_events": ["$a:remote.test"],
            "depth": 7,
            "hashes": { "sha256": "aaaa" },
            "signatures": { "remote.test": { "ed25519:k": "c2ln" } },
        }))
    }

    #[test]
    fn clean_event_passes() {
        let report = Report::check(&well_formed(), None);
        assert!(report.clean(), "unexpected failures: {report}");
    }

    #[test]
    fn missing_fields_reported() {
        let mut event = well_formed();
        event.remove("type");
        event.remove("signatures");
        event.remove("prev_events");

        let report = Report::check(&event, None);
        assert!(report.has(Code::MissingType));
        assert!(report.has(Code::MissingSignatures));
        assert!(report.has(Code::MissingPrevEvents));
        assert!(!report.has(Code::MissingAuthEvents));
    }

    #[test]
    fn origin_sender_mismatch() {
        let mut event = well_formed();
        event.insert(
            "origin".to_owned(),
            CanonicalJsonValue::String("other.test".to_owned()),
        );

        let report = Report::check(&event, None);
        assert!(report.has(Code::MismatchOriginSender));
        // The origin signature check follows the claimed origin.
        assert!(report.has(Code::MissingOriginSignature));
    }

    #[test]
    fn negative_depth_and_dup_refs() {
        let mut event = well_formed();
        event.insert("depth".to_owned(), CanonicalJsonValue::Integer((-1).into()));
        event.insert(
            "prev_events".to_owned(),
            serde_json::from_value(json!(["$p:remote.test", "$p:remote.test"])).unwrap(),
        );

        let report = Report::check(&event, None);
        assert!(report.has(Code::DepthNegative));
        assert!(report.has(Code::DupPrevEvent));
    }

    #[test]
    fn self_reference_needs_expected_id() {
        let mut event = well_formed();
        event.insert(
            "auth_events".to_owned(),
            serde_json::from_value(json!(["$self:remote.test"])).unwrap(),
        );

        let expected: &EventId = "$self:remote.test".try_into().unwrap();
        let report = Report::check(&event, Some(expected));
        assert!(report.has(Code::SelfAuthEvent));

        let without = Report::check(&event, None);
        assert!(!without.has(Code::SelfAuthEvent));
    }

    #[test]
    fn legacy_pair_references_accepted() {
        let mut event = well_formed();
        event.insert(
            "prev_events".to_owned(),
            serde_json::from_value(json!([["$p:remote.test", { "sha256": "aaaa" }]])).unwrap(),
        );

        let report = Report::check(&event, None);
        assert!(!report.has(Code::MissingPrevEvents));
    }

    #[test]
    fn report_string_concatenates_names() {
        let mut report = Report::default();
        report.set(Code::MissingType);
        report.set(Code::DepthZero);
        assert_eq!(report.to_string(), "MISSING_TYPE DEPTH_ZERO");
    }
}
