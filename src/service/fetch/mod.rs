// =============================================================================
// Trellis Matrix NextServer - Event Fetch Unit
// =============================================================================
//
// Project: Trellis - Matrix NextServer Federation Ingest Engine
// Contributors: Trellis Development Team
// Date: 2025-06-14
// Version: 0.4.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Outbound retrieval of individual events over federation. Requests are
//   deduplicated by event id, admitted against a bounded live set, and
//   driven by a single worker task that retries each request across
//   randomly selected origins until a response validates or the viable
//   origins are exhausted.
//
// =============================================================================

mod check;

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

pub use check::SigCheck;
use futures_util::FutureExt;
use ruma::{
    api::federation::event::get_event, CanonicalJsonObject, EventId, OwnedEventId, OwnedRoomId,
    OwnedServerName, RoomId,
};
use tokio::{
    sync::{oneshot, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, warn};

use crate::{
    config::FetchConfig,
    service::{globals, globals::RunLevel, keys, peers, rooms, sending},
    utils::{self, dock::Dock},
    Error, Result,
};

/// A successfully fetched event: the canonical object of the PDU, the raw
/// response body it was carved from, and what the signature check concluded.
#[derive(Debug)]
pub struct Fetched {
    pub event: CanonicalJsonObject,
    pub buf: Vec<u8>,
    pub signature: SigCheck,
}

/// Outcome of `submit`.
pub enum Submission {
    /// A new request was admitted; the receiver resolves exactly once with
    /// the fetched event or the last underlying error.
    Pending(oneshot::Receiver<Result<Fetched>>),
    /// A live request for this event id already exists; nothing to wait on.
    Duplicate,
}

impl Submission {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate)
    }
}

/// One outbound `/event/{id}` request. Identity is the event id; the set of
/// live requests is ordered by it.
pub struct Request {
    pub room_id: OwnedRoomId,
    pub event_id: OwnedEventId,
    /// Current target origin; present only while an attempt is underway.
    pub origin: Option<OwnedServerName>,
    /// Origins already tried. Strictly additive; an origin is recorded here
    /// before any I/O is issued towards it.
    pub attempted: BTreeSet<OwnedServerName>,
    /// Unix seconds of the first attempt; 0 means no I/O issued yet.
    pub started: u64,
    /// Unix seconds of the most recent attempt. The per-attempt timeout is
    /// measured from here, not from `started`.
    pub last: u64,
    /// Unix seconds of finalization; non-zero implies the promise has been
    /// resolved exactly once.
    pub finished: u64,

    promise: Option<oneshot::Sender<Result<Fetched>>>,
    response: Option<oneshot::Receiver<Result<http::Response<Vec<u8>>>>>,
    outcome: Option<Result<http::Response<Vec<u8>>>>,
    call: Option<JoinHandle<()>>,
    error: Option<Error>,
}

impl Request {
    fn new(
        room_id: OwnedRoomId,
        event_id: OwnedEventId,
        promise: oneshot::Sender<Result<Fetched>>,
    ) -> Self {
        Self {
            room_id,
            event_id,
            origin: None,
            attempted: BTreeSet::new(),
            started: 0,
            last: 0,
            finished: 0,
            promise: Some(promise),
            response: None,
            outcome: None,
            call: None,
            error: None,
        }
    }

    /// Move an arrived response from the channel into the request, if one is
    /// there. True when an outcome is available for `handle`.
    fn pump(&mut self) -> bool {
        if self.outcome.is_some() {
            return true;
        }

        let Some(response) = self.response.as_mut() else {
            return false;
        };

        match response.try_recv() {
            Ok(outcome) => {
                self.outcome = Some(outcome);
                self.response = None;
                true
            }
            Err(oneshot::error::TryRecvError::Empty) => false,
            Err(oneshot::error::TryRecvError::Closed) => {
                self.outcome = Some(Err(Error::Transport(
                    "request call vanished before completing".to_owned(),
                )));
                self.response = None;
                true
            }
        }
    }

    fn cancel_call(&mut self) {
        if let Some(call) = self.call.take() {
            call.abort();
        }

        self.response = None;
        self.outcome = None;
    }

    fn timedout(&self, timeout: u64, now: u64) -> bool {
        debug_assert!(self.started != 0 && self.last != 0);
        self.last + timeout < now
    }
}

pub struct Service {
    pub config: FetchConfig,
    globals: Arc<globals::Service>,
    peers: Arc<peers::Service>,
    keys: Arc<keys::Service>,
    sending: Arc<sending::Service>,
    state_cache: Arc<rooms::state_cache::Service>,

    requests: Mutex<BTreeMap<OwnedEventId, Request>>,
    /// Admission gate and worker activity dock.
    dock: Arc<Dock>,
    /// Signalled on every response arrival and finalization.
    responses: Arc<Dock>,
    worker: StdMutex<Option<JoinHandle<()>>>,
}

impl Service {
    pub fn new(
        config: FetchConfig,
        globals: Arc<globals::Service>,
        peers: Arc<peers::Service>,
        keys: Arc<keys::Service>,
        sending: Arc<sending::Service>,
        state_cache: Arc<rooms::state_cache::Service>,
    ) -> Self {
        Self {
            config,
            globals,
            peers,
            keys,
            sending,
            state_cache,
            requests: Mutex::new(BTreeMap::new()),
            dock: Arc::new(Dock::new()),
            responses: Arc::new(Dock::new()),
            worker: StdMutex::new(None),
        }
    }

    /// Spawn the request worker. Idempotent per service instance; meant to
    /// be called once during startup. A disabled fetch unit spawns nothing.
    pub fn init(self: &Arc<Self>) {
        if !self.config.enable {
            return;
        }

        let mut worker = self.worker.lock().unwrap();
        if worker.is_none() {
            let service = Arc::clone(self);
            *worker = Some(tokio::spawn(service.request_worker()));
        }
    }

    /// Terminate the worker and abandon every live request. In-flight
    /// promises are dropped unresolved.
    pub async fn fini(&self) {
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            worker.abort();
            let _ = worker.await;
        }

        let mut requests = self.requests.lock().await;
        for request in requests.values_mut() {
            request.cancel_call();
        }
        requests.clear();
        self.dock.notify_all();
    }

    /// Submit a fetch for `event_id` in `room_id`. Blocks cooperatively
    /// while the live set is at capacity; refuses outside the RUN runlevel.
    /// At most one request per event id is live at a time; a duplicate
    /// submission returns a no-op future and changes nothing.
    #[tracing::instrument(skip(self))]
    pub async fn submit(&self, room_id: &RoomId, event_id: &EventId) -> Result<Submission> {
        let mut runlevel = self.globals.runlevel_watch();
        loop {
            match *runlevel.borrow() {
                RunLevel::Run | RunLevel::Quit => break,
                RunLevel::Start => {}
            }

            if runlevel.changed().await.is_err() {
                break;
            }
        }

        if self.globals.runlevel() != RunLevel::Run || !self.config.enable {
            return Err(Error::Unavailable(format!(
                "cannot fetch {event_id} in {room_id}"
            )));
        }

        // Admission: strictly fewer than requests_max live requests. The
        // dock wakes us on every erase; the bounded wait re-checks under
        // the real lock either way.
        let mut requests = loop {
            {
                let requests = self.requests.lock().await;
                if requests.len() < self.config.requests_max {
                    break requests;
                }
            }

            self.dock
                .wait_for(Duration::from_millis(500), || {
                    self.requests
                        .try_lock()
                        .map(|requests| requests.len() < self.config.requests_max)
                        .unwrap_or(false)
                })
                .await;
        };

        if requests.contains_key(event_id) {
            return Ok(Submission::Duplicate);
        }

        let (promise, future) = oneshot::channel();
        let mut request = Request::new(room_id.to_owned(), event_id.to_owned(), promise);
        self.start(&mut request);
        requests.insert(event_id.to_owned(), request);
        drop(requests);

        self.dock.notify_all();
        Ok(Submission::Pending(future))
    }

    /// Size of the live request set, finalized-but-not-yet-erased entries
    /// included.
    pub async fn count(&self) -> usize {
        self.requests.lock().await.len()
    }

    pub async fn exists(&self, event_id: &EventId) -> bool {
        self.requests.lock().await.contains_key(event_id)
    }

    /// Visit every live request in event-id order; stop early when the
    /// closure returns false.
    pub async fn for_each<F>(&self, mut f: F) -> bool
    where
        F: FnMut(&Request) -> bool,
    {
        for request in self.requests.lock().await.values() {
            if !f(request) {
                return false;
            }
        }

        true
    }

    //
    // request worker
    //

    async fn request_worker(self: Arc<Self>) {
        loop {
            let iteration = std::panic::AssertUnwindSafe(self.worker_iteration())
                .catch_unwind()
                .await;

            if iteration.is_err() {
                // Self-healing: log loudly and re-enter the loop.
                error!("fetch request worker panicked; restarting");
            }
        }
    }

    async fn worker_iteration(&self) {
        self.dock
            .wait(|| {
                self.requests
                    .try_lock()
                    .map(|requests| {
                        requests
                            .values()
                            .any(|r| r.started != 0 || r.finished != 0)
                    })
                    .unwrap_or(false)
            })
            .await;

        self.request_handle().await;
    }

    async fn request_handle(&self) {
        let timeout = Duration::from_secs(self.config.timeout);

        // Bounded wait for the next completion among all in-flight
        // requests; the request mutex is not held while waiting.
        let completed = self
            .responses
            .wait_for(timeout, || {
                self.requests
                    .try_lock()
                    .map(|mut requests| {
                        requests.values_mut().any(|r| r.finished != 0 || r.pump())
                    })
                    .unwrap_or(false)
            })
            .await;

        if !completed {
            self.request_cleanup().await;
            return;
        }

        let mut requests = self.requests.lock().await;
        let mut found = None;
        for r in requests.values_mut() {
            if r.finished != 0 || r.pump() {
                found = Some(r.event_id.clone());
                break;
            }
        }
        let Some(event_id) = found else {
            return;
        };

        let request = requests.get_mut(&event_id).expect("request present");
        let finished = request.finished != 0 || self.handle(request);
        if finished {
            requests.remove(&event_id);
        }
        drop(requests);

        self.dock.notify_all();
    }

    /// Start pending requests, retry the timed out, erase the finished.
    /// Runs whenever a worker wait expires without a completion. Returns how
    /// many entries were erased.
    pub(crate) async fn request_cleanup(&self) -> usize {
        let now = utils::secs_since_unix_epoch();
        let mut requests = self.requests.lock().await;

        for request in requests.values_mut() {
            if request.finished != 0 {
                continue;
            }

            if request.started == 0 {
                self.start(request);
                continue;
            }

            if request.timedout(self.config.timeout, now) {
                debug!(
                    event_id = %request.event_id,
                    origin = ?request.origin,
                    "request attempt timed out"
                );

                request.error.get_or_insert_with(|| {
                    Error::Timeout(format!(
                        "no response for {} within {}s",
                        request.event_id, self.config.timeout
                    ))
                });

                self.retry(request);
            }
        }

        let before = requests.len();
        requests.retain(|_, request| request.finished == 0);
        let erased = before - requests.len();
        drop(requests);

        if erased > 0 {
            self.dock.notify_all();
        }

        erased
    }

    //
    // request state machine
    //

    /// Drive a request towards an in-flight attempt. Selects an origin when
    /// none is set and walks the viable origins until an attempt is issued;
    /// finalizes the request when none remains.
    fn start(&self, request: &mut Request) -> bool {
        debug_assert_eq!(request.finished, 0);
        if request.started == 0 {
            request.started = utils::secs_since_unix_epoch();
        }

        if request.origin.is_none() && !self.select_random_origin(request) {
            self.finish(request, None);
            return false;
        }

        while request.origin.is_some() {
            if self.start_call(request) {
                return true;
            }

            if !self.select_random_origin(request) {
                break;
            }
        }

        self.finish(request, None);
        false
    }

    /// Issue one HTTP attempt towards the selected origin. Request
    /// construction and signing happen synchronously; a failure there means
    /// the caller moves on to the next origin. The wire round trip runs as
    /// its own task feeding the worker.
    fn start_call(&self, request: &mut Request) -> bool {
        debug_assert_eq!(request.finished, 0);
        request.last = utils::secs_since_unix_epoch();

        let origin = request.origin.clone().expect("origin selected");

        let http_request = match self
            .sending
            .prepare(&origin, get_event::v1::Request::new(request.event_id.clone()))
        {
            Ok(http_request) => http_request,
            Err(e) => {
                // During shutdown this is expected noise.
                if self.globals.shutting_down() {
                    debug!(
                        event_id = %request.event_id,
                        room_id = %request.room_id,
                        %origin,
                        "starting request failed: {e}"
                    );
                } else {
                    error!(
                        event_id = %request.event_id,
                        room_id = %request.room_id,
                        %origin,
                        "starting request failed: {e}"
                    );
                }

                return false;
            }
        };

        let (tx, rx) = oneshot::channel();
        let sending = Arc::clone(&self.sending);
        let dock = Arc::clone(&self.dock);
        let responses = Arc::clone(&self.responses);

        let call = tokio::spawn(async move {
            let outcome = sending.dispatch(&origin, http_request).await;
            let _ = tx.send(outcome);
            responses.notify_all();
            dock.notify_all();
        });

        request.call = Some(call);
        request.response = Some(rx);

        debug!(
            event_id = %request.event_id,
            room_id = %request.room_id,
            origin = %request.origin.as_deref().expect("origin selected"),
            "starting request"
        );

        self.dock.notify_all();
        true
    }

    /// Process a request whose response has arrived. A validated response
    /// finalizes the request; anything else records the error and retries
    /// on the next origin. Returns whether the request finished.
    fn handle(&self, request: &mut Request) -> bool {
        let outcome = request.outcome.take().expect("response arrived");
        request.response = None;

        match outcome.and_then(|response| self.check_response(request, &response)) {
            Ok(fetched) => {
                debug!(
                    event_id = %request.event_id,
                    room_id = %request.room_id,
                    origin = %request.origin.as_deref().expect("origin selected"),
                    bytes = fetched.buf.len(),
                    "received good response"
                );

                self.finish(request, Some(fetched));
            }
            Err(e) => {
                debug!(
                    event_id = %request.event_id,
                    room_id = %request.room_id,
                    origin = ?request.origin,
                    "erroneous remote: {e}"
                );

                request.error = Some(e);
                self.retry(request);
            }
        }

        request.finished != 0
    }

    /// Abandon the current attempt and try the next origin. The recorded
    /// error is retained so that, should no origin remain, the promise
    /// resolves with the last underlying cause rather than a bare
    /// exhaustion notice.
    fn retry(&self, request: &mut Request) {
        debug_assert_eq!(request.finished, 0);
        debug_assert!(request.started != 0 && request.last != 0);

        request.cancel_call();
        request.origin = None;
        self.start(request);
    }

    /// Finalize: stamp `finished` and resolve the promise exactly once with
    /// the fetched event or the retained error. The entry itself is erased
    /// later by the worker.
    fn finish(&self, request: &mut Request, fetched: Option<Fetched>) {
        request.finished = utils::secs_since_unix_epoch().max(1);

        let outcome = match fetched {
            Some(fetched) => Ok(fetched),
            None => Err(request.error.take().unwrap_or_else(|| {
                Error::NotFound(format!(
                    "cannot find any server to fetch {} in {}",
                    request.event_id, request.room_id
                ))
            })),
        };

        if let Some(promise) = request.promise.take() {
            // A dropped receiver just means nobody is waiting anymore.
            let _ = promise.send(outcome);
        }

        self.responses.notify_all();
        self.dock.notify_all();
    }

    /// Pick a fresh origin uniformly at random from the room's joined
    /// servers, excluding ourselves, origins already attempted, and peers
    /// currently marked with an error. The pick is recorded in `attempted`
    /// before any I/O. False when no viable origin remains.
    fn select_random_origin(&self, request: &mut Request) -> bool {
        request.origin = None;

        let origins = match self.state_cache.room_servers(&request.room_id) {
            Ok(origins) => origins,
            Err(e) => {
                warn!(room_id = %request.room_id, "cannot enumerate room origins: {e}");
                request.error.get_or_insert(e);
                return false;
            }
        };

        let viable: Vec<OwnedServerName> = origins
            .into_iter()
            .filter(|origin| {
                // Don't want to request from myself.
                if origin == self.globals.server_name() {
                    return false;
                }

                // Don't want a peer we already tried and failed with.
                if request.attempted.contains(origin) {
                    return false;
                }

                // Don't want a peer marked with an error by the transport.
                if self.peers.errmsg(origin).is_some() {
                    return false;
                }

                true
            })
            .collect();

        match utils::random_element(&viable) {
            Some(origin) => {
                request.attempted.insert(origin.clone());
                request.origin = Some(origin.clone());
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> Request {
        let (promise, _future) = oneshot::channel();
        Request::new(
            "!r:trellis.test".try_into().unwrap(),
            "$e:remote.test".try_into().unwrap(),
            promise,
        )
    }

    #[test]
    fn fresh_request_has_no_io_state() {
        let request = request();
        assert_eq!(request.started, 0);
        assert_eq!(request.last, 0);
        assert_eq!(request.finished, 0);
        assert!(request.origin.is_none());
        assert!(request.attempted.is_empty());
    }

    #[test]
    fn timedout_measures_from_last_attempt() {
        let mut request = request();
        request.started = 100;
        request.last = 200;

        assert!(!request.timedout(5, 205));
        assert!(request.timedout(5, 206));
    }

    #[test]
    fn pump_without_call_is_inert() {
        let mut request = request();
        assert!(!request.pump());
        assert!(request.outcome.is_none());
    }
}
