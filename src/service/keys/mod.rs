// =============================================================================
// Trellis Matrix NextServer - Server Key Cache
// =============================================================================
//
// Project: Trellis - Matrix NextServer Federation Ingest Engine
// Contributors: Trellis Development Team
// Date: 2025-06-14
// Version: 0.4.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Cache of remote server signing keys, keyed by (server, key id), with a
//   federated batch fetch for keys we have never seen. Keys remain cached
//   until their advertised expiry.
//
// =============================================================================

mod data;

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};

pub use data::Data;
use futures_util::{stream::FuturesUnordered, StreamExt};
use ruma::{
    api::federation::discovery::{get_server_keys, OldVerifyKey, ServerSigningKeys, VerifyKey},
    signatures::PublicKeyMap,
    MilliSecondsSinceUnixEpoch, OwnedServerName, ServerName,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    service::{globals, sending},
    utils, Error, Result,
};

/// One key identity: `(server_name, key_id)`.
pub type ServerKey = (OwnedServerName, String);

/// Similar to ServerSigningKeys, but drops a few unnecessary fields we don't
/// require post-validation.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SigningKeys {
    pub verify_keys: BTreeMap<String, VerifyKey>,
    pub old_verify_keys: BTreeMap<String, OldVerifyKey>,
    pub valid_until_ts: MilliSecondsSinceUnixEpoch,
}

impl From<ServerSigningKeys> for SigningKeys {
    fn from(value: ServerSigningKeys) -> Self {
        let ServerSigningKeys {
            verify_keys,
            old_verify_keys,
            valid_until_ts,
            ..
        } = value;

        Self {
            verify_keys: verify_keys
                .into_iter()
                .map(|(id, key)| (id.to_string(), key))
                .collect(),
            old_verify_keys: old_verify_keys
                .into_iter()
                .map(|(id, key)| (id.to_string(), key))
                .collect(),
            valid_until_ts,
        }
    }
}

impl SigningKeys {
    /// Whether `key_id` can verify signatures right now: a current key that
    /// has not expired, or a retired key kept for old events.
    pub fn usable(&self, key_id: &str) -> bool {
        (self.verify_keys.contains_key(key_id)
            && self.valid_until_ts > MilliSecondsSinceUnixEpoch::now())
            || self.old_verify_keys.contains_key(key_id)
    }
}

pub struct Service {
    pub db: Arc<dyn Data>,
    globals: Arc<globals::Service>,
    sending: Arc<sending::Service>,
}

impl Service {
    pub fn new(
        db: Arc<dyn Data>,
        globals: Arc<globals::Service>,
        sending: Arc<sending::Service>,
    ) -> Self {
        Self {
            db,
            globals,
            sending,
        }
    }

    /// Whether a usable key `(origin, key_id)` is cached. This is the only
    /// key query the fetch worker is allowed: it never blocks on network
    /// I/O.
    pub fn has(&self, origin: &ServerName, key_id: &str) -> bool {
        self.db
            .signing_keys_for(origin)
            .ok()
            .flatten()
            .map_or(false, |keys| keys.usable(key_id))
    }

    pub fn signing_keys_for(&self, origin: &ServerName) -> Result<Option<SigningKeys>> {
        self.db.signing_keys_for(origin)
    }

    /// The cached keys of `origin` in the shape `ruma::signatures` verifies
    /// with.
    pub fn public_key_map_for(&self, origin: &ServerName) -> Result<PublicKeyMap> {
        let mut map = PublicKeyMap::new();

        if let Some(keys) = self.db.signing_keys_for(origin)? {
            let mut key_set = BTreeMap::new();
            for (id, key) in keys.verify_keys {
                key_set.insert(id, key.key);
            }
            for (id, key) in keys.old_verify_keys {
                key_set.insert(id, key.key);
            }

            map.insert(origin.to_string(), key_set);
        }

        Ok(map)
    }

    /// Merge freshly fetched keys into the cache. Existing key ids are kept;
    /// the expiry advances to the later of the two.
    pub fn add_signing_keys(&self, origin: &ServerName, new_keys: SigningKeys) -> Result<SigningKeys> {
        let merged = match self.db.signing_keys_for(origin)? {
            None => new_keys,
            Some(mut current) => {
                current.verify_keys.extend(new_keys.verify_keys);
                current.old_verify_keys.extend(new_keys.old_verify_keys);
                current.valid_until_ts = current.valid_until_ts.max(new_keys.valid_until_ts);
                current
            }
        };

        self.db.put_signing_keys(origin, &merged)?;
        Ok(merged)
    }

    /// Resolve a deduplicated batch of missing keys with one
    /// `GET /_matrix/key/v2/server` round trip per distinct origin. Returns
    /// how many of the queried keys are now cached. Failures against
    /// individual origins are logged and skipped; the batch as a whole is
    /// bounded by the configured key-fetch timeout.
    pub async fn fetch(&self, queries: &[ServerKey]) -> Result<usize> {
        let origins: BTreeSet<&OwnedServerName> = queries.iter().map(|(origin, _)| origin).collect();

        let bound = Duration::from_secs(self.globals.config.keys.timeout);
        let mut futures: FuturesUnordered<_> = origins
            .into_iter()
            .map(|origin| async move {
                let response = tokio::time::timeout(
                    bound,
                    self.sending
                        .send_federation_request(origin, get_server_keys::v2::Request::new()),
                )
                .await
                .map_err(|_| Error::Timeout(format!("key fetch from {origin}")))
                .and_then(|r| r);

                (origin, response)
            })
            .collect();

        while let Some((origin, response)) = futures.next().await {
            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    warn!(%origin, "key fetch failed: {e}");
                    continue;
                }
            };

            let keys = match response.server_key.deserialize() {
                Ok(keys) => keys,
                Err(e) => {
                    warn!(%origin, "invalid server keys in response: {e}");
                    continue;
                }
            };

            if keys.server_name != *origin {
                warn!(
                    %origin,
                    claimed = %keys.server_name,
                    "server keys response for the wrong server name"
                );
                continue;
            }

            let merged = self.add_signing_keys(origin, keys.into())?;
            debug!(
                %origin,
                verify_keys = merged.verify_keys.len(),
                "cached signing keys"
            );
        }

        let cached = queries
            .iter()
            .filter(|(origin, key_id)| self.has(origin, key_id))
            .count();

        Ok(cached)
    }

    /// Verify the origin signature of an event object against the cached
    /// keys of `origin`.
    pub fn verify_event(
        &self,
        object: &ruma::CanonicalJsonObject,
        origin: &ServerName,
    ) -> Result<ruma::signatures::Verified> {
        let public_key_map = self.public_key_map_for(origin)?;

        ruma::signatures::verify_event(
            &public_key_map,
            object,
            &self.globals.room_version_rules(),
        )
        .map_err(|e| Error::InvalidEvent(format!("signature verification failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use ruma::serde::Base64;

    use super::*;

    fn keys(valid_until_in_secs: i64) -> SigningKeys {
        let now = MilliSecondsSinceUnixEpoch::now().get();
        let ts = (i64::from(now) + valid_until_in_secs * 1000).max(0) as u64;

        let mut verify_keys = BTreeMap::new();
        verify_keys.insert(
            "ed25519:k".to_owned(),
            VerifyKey::new(Base64::new(vec![0u8; 32])),
        );

        SigningKeys {
            verify_keys,
            old_verify_keys: BTreeMap::new(),
            valid_until_ts: MilliSecondsSinceUnixEpoch(ts.try_into().unwrap()),
        }
    }

    #[test]
    fn current_key_usable_until_expiry() {
        assert!(keys(3600).usable("ed25519:k"));
        assert!(!keys(-3600).usable("ed25519:k"));
        assert!(!keys(3600).usable("ed25519:other"));
    }

    #[test]
    fn old_key_usable_past_expiry() {
        let mut expired = keys(-3600);
        expired.old_verify_keys.insert(
            "ed25519:old".to_owned(),
            OldVerifyKey::new(
                MilliSecondsSinceUnixEpoch(1u64.try_into().unwrap()),
                Base64::new(vec![1u8; 32]),
            ),
        );

        assert!(expired.usable("ed25519:old"));
    }
}
