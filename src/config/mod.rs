// =============================================================================
// Trellis Matrix NextServer - Configuration
// =============================================================================
//
// Project: Trellis - Matrix NextServer Federation Ingest Engine
// Contributors: Trellis Development Team
// Date: 2025-06-14
// Version: 0.4.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Server configuration for the federation ingest core. Loaded from TOML by
//   the binary; every knob carries a serde default so a minimal file with
//   only `server_name` is a complete configuration.
//
// =============================================================================

use ruma::{OwnedServerName, RoomVersionId};
use serde::Deserialize;

use crate::{Error, Result};

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The name this homeserver federates under.
    pub server_name: OwnedServerName,

    /// Room version whose rules govern event-id computation and signature
    /// verification for events flowing through the ingest core.
    #[serde(default = "default_room_version")]
    pub default_room_version: RoomVersionId,

    #[serde(default = "default_log")]
    pub log: String,

    #[serde(default)]
    pub fetch: FetchConfig,

    #[serde(default)]
    pub keys: KeysConfig,
}

/// Knobs of the event fetch unit.
#[derive(Clone, Debug, Deserialize)]
pub struct FetchConfig {
    /// Master switch; when false, `submit` refuses with `Unavailable`.
    #[serde(default = "true_fn")]
    pub enable: bool,

    /// Per-attempt timeout in seconds, measured from the last attempt.
    #[serde(default = "default_fetch_timeout")]
    pub timeout: u64,

    /// Admission bound on the live request set; `submit` blocks while the
    /// set is at capacity.
    #[serde(default = "default_fetch_requests_max")]
    pub requests_max: usize,

    /// Recompute the event id of each response and compare to the id sought.
    #[serde(default = "true_fn")]
    pub check_event_id: bool,

    /// Run the structural conformance checklist on each response.
    #[serde(default)]
    pub check_conforms: bool,

    /// Verify the origin signature of each response, but only when the
    /// public key is already cached. The fetch worker never blocks on key
    /// retrieval; missing keys leave the response unchecked and the normal
    /// evaluation pipeline verifies later.
    #[serde(default = "true_fn")]
    pub check_signature: bool,
}

/// Knobs of the server signing-key cache.
#[derive(Clone, Debug, Deserialize)]
pub struct KeysConfig {
    /// Bound on one federated key fetch batch, in seconds.
    #[serde(default = "default_keys_timeout")]
    pub timeout: u64,
}

impl Config {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&raw)
            .map_err(|e| Error::bad_config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_name.as_str().is_empty() {
            return Err(Error::bad_config("server_name cannot be empty"));
        }

        if self.fetch.timeout == 0 {
            return Err(Error::bad_config("fetch.timeout must be at least 1 second"));
        }

        if self.keys.timeout == 0 {
            return Err(Error::bad_config("keys.timeout must be at least 1 second"));
        }

        Ok(())
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            enable: true,
            timeout: default_fetch_timeout(),
            requests_max: default_fetch_requests_max(),
            check_event_id: true,
            check_conforms: false,
            check_signature: true,
        }
    }
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            timeout: default_keys_timeout(),
        }
    }
}

fn true_fn() -> bool {
    true
}

fn default_room_version() -> RoomVersionId {
    RoomVersionId::V10
}

fn default_log() -> String {
    "info".to_owned()
}

fn default_fetch_timeout() -> u64 {
    5
}

fn default_fetch_requests_max() -> usize {
    256
}

fn default_keys_timeout() -> u64 {
    10
}
