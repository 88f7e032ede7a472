use ruma::ServerName;

use super::SigningKeys;
use crate::Result;

pub trait Data: Send + Sync {
    /// Verified signing keys cached for an origin, if any.
    fn signing_keys_for(&self, origin: &ServerName) -> Result<Option<SigningKeys>>;

    /// Replace the cached keys of an origin.
    fn put_signing_keys(&self, origin: &ServerName, keys: &SigningKeys) -> Result<()>;
}
