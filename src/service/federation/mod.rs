// =============================================================================
// Trellis Matrix NextServer - Federation Queries
// =============================================================================
//
// Project: Trellis - Matrix NextServer Federation Ingest Engine
// Contributors: Trellis Development Team
// Date: 2025-06-14
// Version: 0.4.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Typed wrappers over the server-to-server endpoints the ingest core
//   consumes beyond the single-event fetch: room state at an event,
//   backfill, directory/profile queries, device lists and server version.
//
// =============================================================================

use std::sync::Arc;

use ruma::{
    api::federation::{
        backfill::get_backfill,
        device::get_devices,
        discovery::get_server_version,
        event::{get_room_state, get_room_state_ids},
        keys::get_keys,
        query::{get_profile_information, get_room_information},
    },
    EventId, OwnedDeviceId, OwnedEventId, OwnedUserId, RoomAliasId, RoomId, ServerName, UInt,
    UserId,
};
use tracing::debug;

use crate::{service::sending, Result};

pub struct Service {
    sending: Arc<sending::Service>,
}

impl Service {
    pub fn new(sending: Arc<sending::Service>) -> Self {
        Self { sending }
    }

    /// `GET /_matrix/federation/v1/state/{roomId}?event_id=…`: the room
    /// state and auth chain at an event, as full pdus.
    pub async fn room_state(
        &self,
        origin: &ServerName,
        room_id: &RoomId,
        event_id: &EventId,
    ) -> Result<get_room_state::v1::Response> {
        debug!(%origin, %room_id, %event_id, "requesting room state");
        self.sending
            .send_federation_request(
                origin,
                get_room_state::v1::Request::new(event_id.to_owned(), room_id.to_owned()),
            )
            .await
    }

    /// The `ids_only` variant of the state endpoint.
    pub async fn room_state_ids(
        &self,
        origin: &ServerName,
        room_id: &RoomId,
        event_id: &EventId,
    ) -> Result<get_room_state_ids::v1::Response> {
        debug!(%origin, %room_id, %event_id, "requesting room state ids");
        self.sending
            .send_federation_request(
                origin,
                get_room_state_ids::v1::Request::new(event_id.to_owned(), room_id.to_owned()),
            )
            .await
    }

    /// `GET /_matrix/federation/v1/backfill/{roomId}?v=&limit=`: events
    /// preceding the given extremities.
    pub async fn backfill(
        &self,
        origin: &ServerName,
        room_id: &RoomId,
        from: Vec<OwnedEventId>,
        limit: UInt,
    ) -> Result<get_backfill::v1::Response> {
        debug!(%origin, %room_id, extremities = from.len(), "requesting backfill");
        self.sending
            .send_federation_request(
                origin,
                get_backfill::v1::Request::new(room_id.to_owned(), from, limit),
            )
            .await
    }

    /// `GET /_matrix/federation/v1/query/profile`.
    pub async fn query_profile(
        &self,
        origin: &ServerName,
        user_id: &UserId,
    ) -> Result<get_profile_information::v1::Response> {
        self.sending
            .send_federation_request(
                origin,
                get_profile_information::v1::Request::new(user_id.to_owned()),
            )
            .await
    }

    /// `GET /_matrix/federation/v1/query/directory`.
    pub async fn query_directory(
        &self,
        origin: &ServerName,
        room_alias: &RoomAliasId,
    ) -> Result<get_room_information::v1::Response> {
        self.sending
            .send_federation_request(
                origin,
                get_room_information::v1::Request::new(room_alias.to_owned()),
            )
            .await
    }

    /// `GET /_matrix/federation/v1/user/devices/{userId}`.
    pub async fn user_devices(
        &self,
        origin: &ServerName,
        user_id: &UserId,
    ) -> Result<get_devices::v1::Response> {
        self.sending
            .send_federation_request(origin, get_devices::v1::Request::new(user_id.to_owned()))
            .await
    }

    /// `POST /_matrix/federation/v1/user/keys/query`.
    pub async fn query_user_keys(
        &self,
        origin: &ServerName,
        device_keys: std::collections::BTreeMap<OwnedUserId, Vec<OwnedDeviceId>>,
    ) -> Result<get_keys::v1::Response> {
        self.sending
            .send_federation_request(origin, get_keys::v1::Request::new(device_keys))
            .await
    }

    /// `GET /_matrix/federation/v1/version`.
    pub async fn server_version(
        &self,
        origin: &ServerName,
    ) -> Result<get_server_version::v1::Response> {
        self.sending
            .send_federation_request(origin, get_server_version::v1::Request::new())
            .await
    }
}
