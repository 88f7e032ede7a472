// =============================================================================
// Trellis Matrix NextServer - Evaluation Driver
// =============================================================================
//
// Project: Trellis - Matrix NextServer Federation Ingest Engine
// Contributors: Trellis Development Team
// Date: 2025-06-14
// Version: 0.4.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Processes any event from any place from any time and does whatever is
//   necessary to validate, reject, learn from new information, ignore old
//   information and advance the state of the server as best as possible.
//
//   Each eval runs its events sequentially: conformance, recovery of
//   unknown prev events through the fetch unit (evaluated in child
//   contexts), signature verification with batched key prefetch,
//   authorization, then persistence under a freshly assigned sequence
//   number. Commits are never re-ordered within an eval.
//
// =============================================================================

pub mod conforms;
pub mod eval;

use std::{
    collections::BTreeSet,
    future::Future,
    pin::Pin,
    sync::Arc,
};

pub use eval::{Eval, Opts, Registry, Shape};
use ruma::{CanonicalJsonObject, EventId, OwnedEventId};
use tracing::{debug, info, warn};

use crate::{
    service::{
        fetch::{self, Submission},
        globals, keys,
        pdu::{self, PduEvent},
        rooms,
    },
    Error, Result,
};

type AsyncRecursiveType<'a, T> = Pin<Box<dyn Future<Output = T> + 'a + Send>>;

/// The Matrix authorization-rules collaborator. The core invokes it with
/// the event under evaluation and the auth events it references that are
/// known locally; everything else about the rules is external.
pub trait Authority: Send + Sync {
    fn auth_check(&self, event: &PduEvent, auth_events: &[Arc<PduEvent>]) -> Result<()>;
}

/// Accept-everything authority for deployments wiring in their own rules
/// elsewhere, and for tests.
pub struct PermitAll;

impl Authority for PermitAll {
    fn auth_check(&self, _event: &PduEvent, _auth_events: &[Arc<PduEvent>]) -> Result<()> {
        Ok(())
    }
}

pub struct Service {
    globals: Arc<globals::Service>,
    fetch: Arc<fetch::Service>,
    keys: Arc<keys::Service>,
    rooms: Arc<rooms::Service>,
    auth: Arc<dyn Authority>,
    pub registry: Arc<Registry>,
}

impl Service {
    pub fn new(
        globals: Arc<globals::Service>,
        fetch: Arc<fetch::Service>,
        keys: Arc<keys::Service>,
        rooms: Arc<rooms::Service>,
        auth: Arc<dyn Authority>,
    ) -> Self {
        Self {
            globals,
            fetch,
            keys,
            rooms,
            auth,
            registry: Arc::new(Registry::new()),
        }
    }

    /// Open an evaluation context registered on the current task.
    pub fn eval(&self, opts: Opts) -> Eval {
        Eval::new(&self.registry, opts)
    }

    /// Evaluate a batch of received pdus under `eval`. The batch is
    /// truncated to `opts.limit` first and then value-sorted by
    /// `(depth, event_id)` unless the caller asked for its order to be
    /// kept. Returns the `(event_id, seq)` of every commit, in commit
    /// order.
    #[tracing::instrument(skip_all, fields(eval = eval.id()))]
    pub async fn execute_pdus(
        self: &Arc<Self>,
        eval: &Eval,
        pdus: Vec<CanonicalJsonObject>,
    ) -> Result<Vec<(OwnedEventId, u64)>> {
        let rules = self.globals.room_version_rules();

        let mut events = Vec::with_capacity(pdus.len().min(eval.opts().limit));
        for object in pdus.into_iter().take(eval.opts().limit) {
            let event_id = pdu::gen_event_id(&object, &rules)?;
            let event = PduEvent::from_canonical_object(&event_id, object)?;
            events.push(event);
        }

        // Sorting first keeps the evals simple; the events might be from
        // different rooms but that doesn't matter.
        if !eval.opts().ordered {
            events.sort_unstable();
        }

        eval.set_shape(Shape::Pdus(events));

        if eval.opts().verify {
            self.mfetch_keys(eval).await;
        }

        let mut commits = Vec::new();
        for index in 0..eval.pdu_count() {
            let event = eval.pdu_at(index).expect("index within batch");
            let committed = self.process_event(eval, event).await?;
            commits.extend(committed);
        }

        Ok(commits)
    }

    /// Evaluate one received event under `eval`.
    #[tracing::instrument(skip_all, fields(eval = eval.id(), event_id = %event.event_id))]
    pub async fn execute(
        self: &Arc<Self>,
        eval: &Eval,
        event: PduEvent,
    ) -> Result<Vec<(OwnedEventId, u64)>> {
        eval.set_shape(Shape::Event(event.clone()));

        if eval.opts().verify {
            self.mfetch_keys(eval).await;
        }

        self.process_event(eval, event).await
    }

    fn process_event<'a>(
        self: &'a Arc<Self>,
        eval: &'a Eval,
        event: PduEvent,
    ) -> AsyncRecursiveType<'a, Result<Vec<(OwnedEventId, u64)>>> {
        Box::pin(async move {
            let mut commits = Vec::new();

            // Old news: committed events are not evaluated twice.
            if self.rooms.timeline.pdu_exists(&event.event_id)? {
                debug!(event_id = %event.event_id, "already committed, skipping");
                return Ok(commits);
            }

            let object = event.to_canonical_object()?;

            let report = conforms::Report::check(&object, Some(&event.event_id));
            if eval.opts().conforming && !report.clean() {
                return Err(Error::InvalidEvent(format!(
                    "non-conforming event {}: {report}",
                    event.event_id
                )));
            }

            if eval.opts().fetch_prev {
                commits.extend(self.fetch_unknown_prevs(eval, &event).await);
            }

            if eval.opts().verify {
                self.verify_event(&event, &object)?;
            }

            let auth_events = self.known_auth_events(&event)?;
            self.auth.auth_check(&event, &auth_events)?;

            // Persist the body, then assign the sequence and append to the
            // replication log under it.
            let mut json = object;
            json.remove("event_id");
            self.rooms.outlier.add_pdu_outlier(&event.event_id, &json)?;

            let seq = self.registry.commit(eval);
            self.rooms.timeline.append_pdu(seq, &event, &json)?;

            debug!(event_id = %event.event_id, seq, "committed");
            commits.push(((*event.event_id).to_owned(), seq));
            Ok(commits)
        })
    }

    /// Recover referenced prev events we do not know, one child eval per
    /// arrival. The parent does not progress past the triggering prev until
    /// the child completed; a prev that cannot be recovered is logged and
    /// skipped rather than killing the eval.
    async fn fetch_unknown_prevs(
        self: &Arc<Self>,
        eval: &Eval,
        event: &PduEvent,
    ) -> Vec<(OwnedEventId, u64)> {
        let mut commits = Vec::new();

        for prev_id in &event.prev_events {
            let known = self
                .rooms
                .timeline
                .pdu_exists(prev_id)
                .unwrap_or(false)
                || self
                    .rooms
                    .outlier
                    .get_outlier_pdu(prev_id)
                    .map(|pdu| pdu.is_some())
                    .unwrap_or(false);

            if known {
                continue;
            }

            let submission = match self.fetch.submit(&event.room_id, prev_id).await {
                Ok(submission) => submission,
                Err(e) => {
                    warn!(%prev_id, "cannot fetch prev event: {e}");
                    continue;
                }
            };

            let future = match submission {
                Submission::Pending(future) => future,
                Submission::Duplicate => {
                    // Another eval is already pulling this one in.
                    debug!(%prev_id, "fetch already in flight");
                    continue;
                }
            };

            let fetched = match future.await {
                Ok(Ok(fetched)) => fetched,
                Ok(Err(e)) => {
                    warn!(%prev_id, "prev event failed: {e}");
                    continue;
                }
                Err(_) => {
                    warn!(%prev_id, "prev event fetch abandoned");
                    continue;
                }
            };

            let prev = match PduEvent::from_canonical_object(prev_id, fetched.event) {
                Ok(prev) => prev,
                Err(e) => {
                    warn!(%prev_id, "fetched prev event unusable: {e}");
                    continue;
                }
            };

            if prev.room_id != event.room_id {
                warn!(
                    %prev_id,
                    room_id = %prev.room_id,
                    "fetched prev event is in the wrong room"
                );
                continue;
            }

            // Child evaluation on this task, inheriting our toggles; linked
            // under us for its duration.
            let child = self.eval(eval.opts().clone());

            match self.execute(&child, prev).await {
                Ok(mut committed) => commits.append(&mut committed),
                Err(e) => warn!(%prev_id, "prev event evaluation failed: {e}"),
            }
        }

        commits
    }

    /// Verify the claimed origin's signature over the event. A signature
    /// that validates against a mismatched content hash is accepted as a
    /// redacted event, per the federation rules.
    fn verify_event(&self, event: &PduEvent, object: &CanonicalJsonObject) -> Result<()> {
        let origin = event.origin_host();

        let mut object = object.clone();
        object.remove("event_id");

        match self.keys.verify_event(&object, origin)? {
            ruma::signatures::Verified::All => Ok(()),
            ruma::signatures::Verified::Signatures => {
                warn!(
                    event_id = %event.event_id,
                    "content hash mismatch, event accepted as redacted"
                );
                Ok(())
            }
        }
    }

    /// Referenced auth events that are known locally.
    fn known_auth_events(&self, event: &PduEvent) -> Result<Vec<Arc<PduEvent>>> {
        let mut auth_events = Vec::with_capacity(event.auth_events.len());
        for auth_id in &event.auth_events {
            match self.rooms.timeline.get_pdu(auth_id)? {
                Some(auth_event) => auth_events.push(auth_event),
                None => debug!(%auth_id, "auth event not known locally"),
            }
        }

        Ok(auth_events)
    }

    /// Determine federation keys which we don't have and pull them in with
    /// one deduplicated batch query before per-event verification begins.
    async fn mfetch_keys(&self, eval: &Eval) {
        let mut miss: BTreeSet<keys::ServerKey> = BTreeSet::new();

        for index in 0..eval.pdu_count() {
            let Some(event) = eval.pdu_at(index) else {
                break;
            };

            let origin = event.origin_host().to_owned();

            // When node_id is set (eval on behalf of a remote) we only
            // prefetch keys for events from that node. This is to prevent
            // amplification; the other events are still evaluated and key
            // fetching may be attempted there, just not here.
            if let Some(node_id) = &eval.opts().node_id {
                if *node_id != origin {
                    continue;
                }
            }

            let Some(signatures) = &event.signatures else {
                continue;
            };

            for key_ids in signatures.values() {
                for key_id in key_ids.keys() {
                    if !self.keys.has(&origin, key_id) {
                        miss.insert((origin.clone(), key_id.clone()));
                    }
                }
            }
        }

        if miss.is_empty() {
            return;
        }

        debug!(
            eval = eval.id(),
            missing = miss.len(),
            events = eval.pdu_count(),
            "fetching new keys"
        );

        let queries: Vec<keys::ServerKey> = miss.into_iter().collect();
        match self.keys.fetch(&queries).await {
            Ok(0) => {}
            Ok(fetched) => info!(
                eval = eval.id(),
                fetched,
                queried = queries.len(),
                "fetched new keys"
            ),
            Err(e) => warn!(eval = eval.id(), "key fetch failed: {e}"),
        }
    }

    /// First live eval currently working on `event_id`, if any.
    pub fn find_by_event_id(&self, event_id: &EventId) -> Option<Arc<eval::EvalInner>> {
        self.registry.find_by_event_id(event_id)
    }
}
