use ruma::{OwnedServerName, RoomId, ServerName};

use crate::Result;

pub trait Data: Send + Sync {
    /// Every homeserver with at least one joined member in the room.
    fn room_servers(&self, room_id: &RoomId) -> Result<Vec<OwnedServerName>>;

    fn server_in_room(&self, server: &ServerName, room_id: &RoomId) -> Result<bool>;

    fn room_exists(&self, room_id: &RoomId) -> Result<bool>;
}
