//! Shared harness for the ingest-core integration tests: a programmable
//! mock transport, an assembled service set over the in-memory backend,
//! and event builders.

#![allow(dead_code)]

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, RwLock},
};

use async_trait::async_trait;
use ruma::{
    api::federation::discovery::VerifyKey, serde::Base64, signatures::Ed25519KeyPair,
    CanonicalJsonObject, MilliSecondsSinceUnixEpoch, OwnedEventId, OwnedServerName,
    RoomVersionId, UInt,
};
use serde_json::json;
use trellis::{
    database::MemoryDatabase,
    service::{globals, keys::SigningKeys, pdu, sending::Transport, vm::PermitAll},
    Config, Error, Services,
};

pub enum RouteResult {
    Response(u16, serde_json::Value),
    Hang,
    Error(String),
}

type Route = Box<dyn Fn(&http::Request<Vec<u8>>) -> RouteResult + Send + Sync>;

/// Wire collaborator double: per-destination behaviors plus a call log.
#[derive(Default)]
pub struct MockTransport {
    routes: RwLock<HashMap<OwnedServerName, Route>>,
    calls: Mutex<Vec<OwnedServerName>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn route<F>(&self, host: &str, behavior: F)
    where
        F: Fn(&http::Request<Vec<u8>>) -> RouteResult + Send + Sync + 'static,
    {
        self.routes
            .write()
            .unwrap()
            .insert(host.try_into().unwrap(), Box::new(behavior));
    }

    pub fn respond_json(&self, host: &str, status: u16, body: serde_json::Value) {
        self.route(host, move |_| RouteResult::Response(status, body.clone()));
    }

    pub fn hang(&self, host: &str) {
        self.route(host, |_| RouteResult::Hang);
    }

    pub fn calls(&self) -> Vec<OwnedServerName> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, host: &str) -> usize {
        let host: OwnedServerName = host.try_into().unwrap();
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| **c == host)
            .count()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(
        &self,
        destination: &ruma::ServerName,
        request: http::Request<Vec<u8>>,
    ) -> trellis::Result<http::Response<Vec<u8>>> {
        self.calls.lock().unwrap().push(destination.to_owned());

        let result = self
            .routes
            .read()
            .unwrap()
            .get(destination)
            .map(|route| route(&request));

        match result {
            None => Err(Error::Transport(format!("no route to {destination}"))),
            Some(RouteResult::Error(e)) => Err(Error::Transport(e)),
            Some(RouteResult::Hang) => {
                std::future::pending::<trellis::Result<http::Response<Vec<u8>>>>().await
            }
            Some(RouteResult::Response(status, body)) => Ok(http::Response::builder()
                .status(status)
                .header(http::header::CONTENT_TYPE, "application/json")
                .body(serde_json::to_vec(&body).unwrap())
                .unwrap()),
        }
    }
}

pub struct Harness {
    pub services: Arc<Services>,
    pub transport: Arc<MockTransport>,
    pub db: Arc<MemoryDatabase>,
}

/// Build and start an ingest core over mocks. The config string extends a
/// `server_name = "trellis.test"` base.
pub fn harness(config: &str) -> Harness {
    let config: Config = toml::from_str(config).expect("test config is valid");
    let keypair = globals::Service::generate_keypair().unwrap();
    let transport = MockTransport::new();
    let db = MemoryDatabase::new();

    let services = Services::build(
        config,
        keypair,
        Arc::clone(&db),
        transport.clone() as Arc<dyn Transport>,
        Arc::new(PermitAll),
    )
    .unwrap();
    services.start();

    Harness {
        services,
        transport,
        db,
    }
}

pub fn rules() -> ruma::room_version_rules::RoomVersionRules {
    RoomVersionId::V10.rules().unwrap()
}

pub fn keypair(version: &str) -> Ed25519KeyPair {
    let document = Ed25519KeyPair::generate().unwrap();
    Ed25519KeyPair::from_der(&document, version.to_owned()).unwrap()
}

/// A structurally complete message event. Carries placeholder hashes and
/// signatures; sign with `sign_event` when real ones are needed.
pub fn event_object(room: &str, depth: u64, prev_events: &[&str]) -> CanonicalJsonObject {
    serde_json::from_value(json!({
        "room_id": room,
        "sender": "@alice:remote.test",
        "origin": "remote.test",
        "origin_server_ts": 1_700_000_000_000u64,
        "type": "m.room.message",
        "content": { "body": format!("event at depth {depth}"), "msgtype": "m.text" },
        "prev_events": prev_events,
        "auth_events": ["$auth:remote.test"],
        "depth": depth,
        "hashes": { "sha256": "ThisIsNotARealHashButItIsPresent" },
        "signatures": { "remote.test": { "ed25519:1": "bm90IGEgcmVhbCBzaWduYXR1cmU" } },
    }))
    .unwrap()
}

/// Hash and sign `event` as `origin`, replacing the placeholders.
pub fn sign_event(event: &mut CanonicalJsonObject, origin: &str, keypair: &Ed25519KeyPair) {
    event.remove("hashes");
    event.remove("signatures");
    ruma::signatures::hash_and_sign_event(origin, keypair, event, &rules())
        .expect("test event is signable");
}

/// A cacheable `SigningKeys` entry exposing `keypair`'s public key as
/// `ed25519:<version>`, valid for another hour.
pub fn signing_keys(keypair: &Ed25519KeyPair) -> SigningKeys {
    let mut verify_keys = BTreeMap::new();
    verify_keys.insert(
        format!("ed25519:{}", keypair.version()),
        VerifyKey::new(Base64::new(keypair.public_key().to_vec())),
    );

    SigningKeys {
        verify_keys,
        old_verify_keys: BTreeMap::new(),
        valid_until_ts: MilliSecondsSinceUnixEpoch(
            MilliSecondsSinceUnixEpoch::now().get() + UInt::from(3_600_000u32),
        ),
    }
}

pub fn event_id_of(event: &CanonicalJsonObject) -> OwnedEventId {
    pdu::gen_event_id(event, &rules()).unwrap()
}

/// The body shape of `GET /_matrix/federation/v1/event/{id}`.
pub fn event_response(event: &CanonicalJsonObject) -> serde_json::Value {
    json!({
        "origin": "remote.test",
        "origin_server_ts": 1_700_000_000_000u64,
        "pdus": [serde_json::to_value(event).unwrap()],
    })
}
