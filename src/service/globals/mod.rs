// =============================================================================
// Trellis Matrix NextServer - Globals Service
// =============================================================================
//
// Project: Trellis - Matrix NextServer Federation Ingest Engine
// Contributors: Trellis Development Team
// Date: 2025-06-14
// Version: 0.4.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Server identity and process-wide state: configuration, the Ed25519
//   signing keypair used for outbound X-Matrix authorization, and the
//   runlevel lifecycle other services gate on.
//
// =============================================================================

use std::sync::Arc;

use ruma::{
    room_version_rules::RoomVersionRules, signatures::Ed25519KeyPair, ServerName,
};
use tokio::sync::watch;
use tracing::info;

use crate::{Config, Error, Result};

/// Process lifecycle. Fetch submission is refused outside `Run`; log
/// severity of transport failures is demoted during `Quit`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunLevel {
    Start,
    Run,
    Quit,
}

pub struct Service {
    pub config: Config,
    keypair: Arc<Ed25519KeyPair>,
    runlevel_tx: watch::Sender<RunLevel>,
    runlevel_rx: watch::Receiver<RunLevel>,
}

impl Service {
    pub fn load(config: Config, keypair: Ed25519KeyPair) -> Result<Self> {
        config.validate()?;

        let (runlevel_tx, runlevel_rx) = watch::channel(RunLevel::Start);

        Ok(Self {
            config,
            keypair: Arc::new(keypair),
            runlevel_tx,
            runlevel_rx,
        })
    }

    /// Generate a fresh, process-lifetime signing keypair. A deployed server
    /// loads a persisted keypair instead; the ingest core does not care
    /// which.
    pub fn generate_keypair() -> Result<Ed25519KeyPair> {
        let document = Ed25519KeyPair::generate()
            .map_err(|e| Error::BadConfig(format!("keypair generation failed: {e}")))?;

        Ed25519KeyPair::from_der(&document, "a_XRhW".to_owned())
            .map_err(|e| Error::BadConfig(format!("keypair invalid: {e}")))
    }

    pub fn server_name(&self) -> &ServerName {
        &self.config.server_name
    }

    pub fn keypair(&self) -> &Ed25519KeyPair {
        &self.keypair
    }

    /// Rules of the room version this deployment evaluates under.
    pub fn room_version_rules(&self) -> RoomVersionRules {
        self.config
            .default_room_version
            .rules()
            .expect("supported room version has rules")
    }

    pub fn runlevel(&self) -> RunLevel {
        *self.runlevel_rx.borrow()
    }

    /// A receiver on which runlevel transitions can be awaited.
    pub fn runlevel_watch(&self) -> watch::Receiver<RunLevel> {
        self.runlevel_rx.clone()
    }

    pub fn set_runlevel(&self, level: RunLevel) {
        if *self.runlevel_rx.borrow() != level {
            info!(?level, "runlevel transition");
            let _ = self.runlevel_tx.send(level);
        }
    }

    /// True once shutdown has begun. Consulted to demote log severity on
    /// cancelled in-flight requests.
    pub fn shutting_down(&self) -> bool {
        self.runlevel() == RunLevel::Quit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        toml::from_str("server_name = \"trellis.test\"").unwrap()
    }

    #[test]
    fn starts_in_start_runlevel() {
        let globals = Service::load(test_config(), Service::generate_keypair().unwrap()).unwrap();
        assert_eq!(globals.runlevel(), RunLevel::Start);
        assert!(!globals.shutting_down());
    }

    #[test]
    fn runlevel_transitions_observed() {
        let globals = Service::load(test_config(), Service::generate_keypair().unwrap()).unwrap();
        globals.set_runlevel(RunLevel::Run);
        assert_eq!(globals.runlevel(), RunLevel::Run);
        globals.set_runlevel(RunLevel::Quit);
        assert!(globals.shutting_down());
    }
}
