// =============================================================================
// Trellis Matrix NextServer - Service Container
// =============================================================================
//
// Project: Trellis - Matrix NextServer Federation Ingest Engine
// Contributors: Trellis Development Team
// Date: 2025-06-14
// Version: 0.4.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Wiring of the ingest core. `Services::build` threads the storage,
//   transport and authority collaborators through every service; there is
//   no process-global singleton, so tests and embedders assemble as many
//   independent cores as they like.
//
// =============================================================================

pub mod federation;
pub mod fetch;
pub mod globals;
pub mod keys;
pub mod pdu;
pub mod peers;
pub mod rooms;
pub mod sending;
pub mod vm;

use std::sync::Arc;

use ruma::signatures::Ed25519KeyPair;

use crate::{Config, Result};

pub struct Services {
    pub globals: Arc<globals::Service>,
    pub peers: Arc<peers::Service>,
    pub sending: Arc<sending::Service>,
    pub federation: Arc<federation::Service>,
    pub keys: Arc<keys::Service>,
    pub rooms: Arc<rooms::Service>,
    pub fetch: Arc<fetch::Service>,
    pub vm: Arc<vm::Service>,
}

impl Services {
    /// Assemble the core around a storage backend, a wire transport and an
    /// authorization-rules implementation.
    pub fn build<D>(
        config: Config,
        keypair: Ed25519KeyPair,
        db: Arc<D>,
        transport: Arc<dyn sending::Transport>,
        auth: Arc<dyn vm::Authority>,
    ) -> Result<Arc<Self>>
    where
        D: keys::Data
            + rooms::state_cache::Data
            + rooms::timeline::Data
            + rooms::outlier::Data
            + 'static,
    {
        let globals = Arc::new(globals::Service::load(config, keypair)?);
        let peers = Arc::new(peers::Service::new());

        let sending = Arc::new(sending::Service::new(
            Arc::clone(&globals),
            Arc::clone(&peers),
            transport,
        ));

        let federation = Arc::new(federation::Service::new(Arc::clone(&sending)));

        let keys = Arc::new(keys::Service::new(
            Arc::clone(&db) as Arc<dyn keys::Data>,
            Arc::clone(&globals),
            Arc::clone(&sending),
        ));

        let state_cache = Arc::new(rooms::state_cache::Service {
            db: Arc::clone(&db) as Arc<dyn rooms::state_cache::Data>,
        });
        let timeline = Arc::new(rooms::timeline::Service {
            db: Arc::clone(&db) as Arc<dyn rooms::timeline::Data>,
        });
        let outlier = Arc::new(rooms::outlier::Service {
            db: Arc::clone(&db) as Arc<dyn rooms::outlier::Data>,
        });
        let rooms = Arc::new(rooms::Service {
            state_cache: Arc::clone(&state_cache),
            timeline,
            outlier,
        });

        let fetch = Arc::new(fetch::Service::new(
            globals.config.fetch.clone(),
            Arc::clone(&globals),
            Arc::clone(&peers),
            Arc::clone(&keys),
            Arc::clone(&sending),
            state_cache,
        ));

        let vm = Arc::new(vm::Service::new(
            Arc::clone(&globals),
            Arc::clone(&fetch),
            Arc::clone(&keys),
            Arc::clone(&rooms),
            auth,
        ));

        Ok(Arc::new(Self {
            globals,
            peers,
            sending,
            federation,
            keys,
            rooms,
            fetch,
            vm,
        }))
    }

    /// Spawn the background workers and enter the RUN runlevel.
    pub fn start(&self) {
        self.fetch.init();
        self.globals.set_runlevel(globals::RunLevel::Run);
    }

    /// Enter QUIT, terminate workers and abandon in-flight work.
    pub async fn shutdown(&self) {
        self.globals.set_runlevel(globals::RunLevel::Quit);
        self.fetch.fini().await;
    }
}
