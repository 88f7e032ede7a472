// =============================================================================
// Trellis Matrix NextServer - Room Membership Cache
// =============================================================================
//
// Project: Trellis - Matrix NextServer Federation Ingest Engine
// Contributors: Trellis Development Team
// Date: 2025-06-14
// Version: 0.4.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Read view over the joined-server set of each room, backed by the
//   storage collaborator. Fetch origin selection enumerates this set.
//
// =============================================================================

mod data;

use std::sync::Arc;

pub use data::Data;
use ruma::{OwnedServerName, RoomId, ServerName};

use crate::Result;

pub struct Service {
    pub db: Arc<dyn Data>,
}

impl Service {
    /// The homeservers participating in a room, local server included when
    /// joined.
    pub fn room_servers(&self, room_id: &RoomId) -> Result<Vec<OwnedServerName>> {
        self.db.room_servers(room_id)
    }

    pub fn server_in_room(&self, server: &ServerName, room_id: &RoomId) -> Result<bool> {
        self.db.server_in_room(server, room_id)
    }

    pub fn room_exists(&self, room_id: &RoomId) -> Result<bool> {
        self.db.room_exists(room_id)
    }
}
