// =============================================================================
// Trellis Matrix NextServer - Fetch Response Checks
// =============================================================================
//
// Project: Trellis - Matrix NextServer Federation Ingest Engine
// Contributors: Trellis Development Team
// Date: 2025-06-14
// Version: 0.4.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Validation of a fetched `/event/{id}` response before its promise is
//   resolved: event-id recomputation, structural conformance, and an
//   opportunistic signature check against already-cached keys. A failure
//   here sends the request to the next origin.
//
// =============================================================================

use ruma::{CanonicalJsonObject, CanonicalJsonValue, OwnedServerName, ServerName};

use super::{Fetched, Request, Service};
use crate::{service::pdu, service::vm::conforms, Error, Result};

/// What the fetch-time signature check concluded. The worker never blocks
/// on key retrieval, so a missing key leaves the response `Unchecked`
/// rather than `Verified`; full verification happens during evaluation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SigCheck {
    Verified,
    Unchecked,
}

impl Service {
    /// Validate a response for `request`. Returns the fetched event on
    /// success; any error is treated as an erroneous remote and retried on
    /// another origin.
    pub(super) fn check_response(
        &self,
        request: &Request,
        response: &http::Response<Vec<u8>>,
    ) -> Result<Fetched> {
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Transport(format!(
                "{} answered {status}",
                request.origin.as_deref().expect("origin selected")
            )));
        }

        let body: CanonicalJsonObject = serde_json::from_slice(response.body())
            .map_err(|_| Error::BadServerResponse("response is not a JSON object".to_owned()))?;

        // `GET /event/{id}` answers a mini transaction: the sought event is
        // the only element of `pdus`.
        let event = match body.get("pdus") {
            Some(CanonicalJsonValue::Array(pdus)) => pdus.first(),
            _ => None,
        }
        .and_then(|pdu| pdu.as_object())
        .cloned()
        .ok_or_else(|| Error::BadServerResponse("no pdus in response".to_owned()))?;

        let rules = self.globals.room_version_rules();

        if self.config.check_event_id {
            let claim = pdu::gen_event_id(&event, &rules)?;
            if claim != request.event_id {
                return Err(Error::InvalidEvent(format!(
                    "event id claim:{claim} != sought:{}",
                    request.event_id
                )));
            }
        }

        if self.config.check_conforms {
            let report = conforms::Report::check(&event, Some(&request.event_id));
            if !report.clean() {
                return Err(Error::InvalidEvent(format!(
                    "non-conforming event in response: {report}"
                )));
            }
        }

        let signature = if self.config.check_signature {
            self.check_signature(&event)?
        } else {
            SigCheck::Unchecked
        };

        Ok(Fetched {
            event,
            buf: response.body().clone(),
            signature,
        })
    }

    /// Verify the claimed origin's signature iff its key is already cached.
    /// The fetch worker must not block on further network I/O, so an
    /// unknown key skips verification.
    fn check_signature(&self, event: &CanonicalJsonObject) -> Result<SigCheck> {
        let origin = claimed_origin(event).ok_or_else(|| {
            Error::InvalidEvent("event has neither origin nor valid sender".to_owned())
        })?;

        let key_id = event
            .get("signatures")
            .and_then(|v| v.as_object())
            .and_then(|signatures| signatures.get(origin.as_str()))
            .and_then(|v| v.as_object())
            .and_then(|keys| keys.keys().next())
            .cloned()
            .ok_or_else(|| {
                Error::InvalidEvent(format!(
                    "cannot find any keys for '{origin}' in event.signatures"
                ))
            })?;

        if !self.keys.has(&origin, &key_id) {
            return Ok(SigCheck::Unchecked);
        }

        self.keys.verify_event(event, &origin)?;
        Ok(SigCheck::Verified)
    }
}

/// The homeserver an event claims as its source: the `origin` field when
/// set, else the host part of `sender`.
fn claimed_origin(event: &CanonicalJsonObject) -> Option<OwnedServerName> {
    if let Some(CanonicalJsonValue::String(origin)) = event.get("origin") {
        return ServerName::parse(origin).ok();
    }

    let sender = event.get("sender")?.as_str()?;
    if !sender.starts_with('@') {
        return None;
    }

    let (_, host) = sender.split_once(':')?;
    ServerName::parse(host).ok()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn object(value: serde_json::Value) -> CanonicalJsonObject {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn claimed_origin_prefers_origin_field() {
        let event = object(json!({
            "origin": "claimed.test",
            "sender": "@u:remote.test",
        }));
        assert_eq!(claimed_origin(&event).unwrap().as_str(), "claimed.test");
    }

    #[test]
    fn claimed_origin_falls_back_to_sender() {
        let event = object(json!({ "sender": "@u:remote.test" }));
        assert_eq!(claimed_origin(&event).unwrap().as_str(), "remote.test");
    }

    #[test]
    fn claimed_origin_handles_ports() {
        let event = object(json!({ "sender": "@u:remote.test:8448" }));
        assert_eq!(
            claimed_origin(&event).unwrap().as_str(),
            "remote.test:8448"
        );
    }

    #[test]
    fn garbage_sender_yields_none() {
        let event = object(json!({ "sender": "garbage" }));
        assert!(claimed_origin(&event).is_none());
    }
}
