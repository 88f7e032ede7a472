// =============================================================================
// Trellis Matrix NextServer - Evaluation Contexts
// =============================================================================
//
// Project: Trellis - Matrix NextServer Federation Ingest Engine
// Contributors: Trellis Development Team
// Date: 2025-06-14
// Version: 0.4.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   One `Eval` per in-flight evaluation, registered in a process-wide
//   registry for the lifetime of the scope that created it. A task
//   evaluates serially within its stack, so parent/child linkage is kept
//   as a per-task stack of eval ids: construction pushes, destruction
//   pops, ancestor queries walk the stack.
//
// =============================================================================

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
};

use ruma::{CanonicalJsonObject, CanonicalJsonValue, EventId, OwnedServerName};

use crate::service::pdu::PduEvent;

/// Identity of the owning task. Evals constructed outside any tokio task
/// (tests, synchronous callers) share the `None` stack.
pub type TaskId = Option<tokio::task::Id>;

/// Evaluation toggles, fixed per eval at construction.
#[derive(Clone, Debug)]
pub struct Opts {
    /// Upper bound on how many pdus one eval processes.
    pub limit: usize,
    /// Preserve the caller-supplied order instead of value-sorting.
    pub ordered: bool,
    /// Kill the eval on a non-clean conformance report.
    pub conforming: bool,
    /// Verify event signatures, fetching missing keys first.
    pub verify: bool,
    /// Fetch referenced but unknown prev events.
    pub fetch_prev: bool,
    /// When evaluating on behalf of a remote node, its name. Key prefetch
    /// is then restricted to events originating there, to prevent
    /// amplification.
    pub node_id: Option<OwnedServerName>,
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            limit: 128,
            ordered: false,
            conforming: true,
            verify: true,
            fetch_prev: true,
            node_id: None,
        }
    }
}

/// The event material an eval is working on. The three populated shapes are
/// mutually exclusive.
#[derive(Debug, Default)]
pub enum Shape {
    #[default]
    Empty,
    /// An event being issued locally, still unfinalized JSON.
    Issue(CanonicalJsonObject),
    /// One received event.
    Event(PduEvent),
    /// A batch of received pdus.
    Pdus(Vec<PduEvent>),
}

pub struct EvalInner {
    id: u64,
    seq: AtomicU64,
    task: TaskId,
    parent: Option<u64>,
    child: AtomicU64,
    opts: Opts,
    shape: RwLock<Shape>,
}

impl EvalInner {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Commit sequence number; zero until assigned at persist time.
    pub fn seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    pub fn task(&self) -> TaskId {
        self.task
    }

    pub fn parent_id(&self) -> Option<u64> {
        self.parent
    }

    pub fn child_id(&self) -> Option<u64> {
        match self.child.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    pub fn opts(&self) -> &Opts {
        &self.opts
    }

    /// Whether this eval's current material includes `event_id`, matching
    /// whichever of the three shapes is populated.
    pub fn evaluating(&self, event_id: &EventId) -> bool {
        match &*self.shape.read().unwrap() {
            Shape::Empty => false,
            Shape::Event(event) => event.event_id.as_ref() == event_id,
            Shape::Issue(issue) => matches!(
                issue.get("event_id"),
                Some(CanonicalJsonValue::String(id)) if id == event_id.as_str()
            ),
            Shape::Pdus(pdus) => pdus.iter().any(|pdu| pdu.event_id.as_ref() == event_id),
        }
    }

    pub fn pdu_count(&self) -> usize {
        match &*self.shape.read().unwrap() {
            Shape::Pdus(pdus) => pdus.len(),
            Shape::Event(_) => 1,
            _ => 0,
        }
    }

    pub fn pdu_at(&self, index: usize) -> Option<PduEvent> {
        match &*self.shape.read().unwrap() {
            Shape::Pdus(pdus) => pdus.get(index).cloned(),
            Shape::Event(event) if index == 0 => Some(event.clone()),
            _ => None,
        }
    }

    pub fn find_pdu(&self, event_id: &EventId) -> Option<PduEvent> {
        match &*self.shape.read().unwrap() {
            Shape::Pdus(pdus) => pdus
                .iter()
                .find(|pdu| pdu.event_id.as_ref() == event_id)
                .cloned(),
            Shape::Event(event) if event.event_id.as_ref() == event_id => Some(event.clone()),
            _ => None,
        }
    }

    pub fn set_shape(&self, shape: Shape) {
        *self.shape.write().unwrap() = shape;
    }
}

/// RAII registration of one evaluation. Holding an `Eval` keeps the context
/// visible to registry queries; dropping it unlinks from the parent and the
/// task stack.
pub struct Eval {
    inner: Arc<EvalInner>,
    registry: Arc<Registry>,
}

impl Eval {
    pub fn new(registry: &Arc<Registry>, opts: Opts) -> Self {
        let task = tokio::task::try_id();
        let id = registry.id_ctr.fetch_add(1, Ordering::AcqRel) + 1;

        let mut inner = registry.inner.write().unwrap();

        // The most recent eval on this task, if any, becomes the parent.
        let parent = inner
            .stacks
            .get(&task)
            .and_then(|stack| stack.last().copied());

        let eval = Arc::new(EvalInner {
            id,
            seq: AtomicU64::new(0),
            task,
            parent,
            child: AtomicU64::new(0),
            opts,
            shape: RwLock::new(Shape::Empty),
        });

        if let Some(parent_id) = parent {
            let parent = inner.evals.get(&parent_id).expect("parent is live");
            debug_assert_eq!(parent.child.load(Ordering::Acquire), 0);
            parent.child.store(id, Ordering::Release);
        }

        inner.evals.insert(id, Arc::clone(&eval));
        inner.stacks.entry(task).or_default().push(id);
        drop(inner);

        Self {
            inner: eval,
            registry: Arc::clone(registry),
        }
    }
}

impl std::ops::Deref for Eval {
    type Target = EvalInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl Drop for Eval {
    fn drop(&mut self) {
        let mut inner = self.registry.inner.write().unwrap();

        debug_assert_eq!(
            self.inner.child.load(Ordering::Acquire),
            0,
            "eval dropped while a child is still live"
        );

        if let Some(parent_id) = self.inner.parent {
            if let Some(parent) = inner.evals.get(&parent_id) {
                debug_assert_eq!(parent.child.load(Ordering::Acquire), self.inner.id);
                parent.child.store(0, Ordering::Release);
            }
        }

        if let Some(stack) = inner.stacks.get_mut(&self.inner.task) {
            debug_assert_eq!(stack.last().copied(), Some(self.inner.id));
            stack.retain(|&id| id != self.inner.id);
            if stack.is_empty() {
                inner.stacks.remove(&self.inner.task);
            }
        }

        inner.evals.remove(&self.inner.id);
    }
}

#[derive(Default)]
struct Inner {
    /// Live evals by id; iteration order is creation order.
    evals: BTreeMap<u64, Arc<EvalInner>>,
    /// Per-task stack of live eval ids, bottom (root) first.
    stacks: HashMap<TaskId, Vec<u64>>,
}

/// Process-wide collection of live evaluations.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<Inner>,
    id_ctr: AtomicU64,
    seq_ctr: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.inner.read().unwrap().evals.len()
    }

    /// Assign the next commit sequence number to an eval. Called exactly
    /// once per successful persist; numbers are strictly increasing across
    /// commits.
    pub fn commit(&self, eval: &EvalInner) -> u64 {
        let seq = self.seq_ctr.fetch_add(1, Ordering::AcqRel) + 1;
        eval.seq.store(seq, Ordering::Release);
        seq
    }

    /// Highest sequence number handed out so far.
    pub fn committed(&self) -> u64 {
        self.seq_ctr.load(Ordering::Acquire)
    }

    /// Smallest non-zero sequence among live evals.
    pub fn min_seq(&self) -> Option<u64> {
        self.inner
            .read()
            .unwrap()
            .evals
            .values()
            .map(|eval| eval.seq())
            .filter(|&seq| seq != 0)
            .min()
    }

    /// Largest non-zero sequence among live evals.
    pub fn max_seq(&self) -> Option<u64> {
        self.inner
            .read()
            .unwrap()
            .evals
            .values()
            .map(|eval| eval.seq())
            .filter(|&seq| seq != 0)
            .max()
    }

    /// Smallest sequence strictly greater than `after`.
    pub fn next_seq(&self, after: u64) -> Option<u64> {
        self.inner
            .read()
            .unwrap()
            .evals
            .values()
            .map(|eval| eval.seq())
            .filter(|&seq| seq > after)
            .min()
    }

    /// Whether exactly one live eval holds sequence `seq`.
    pub fn unique_seq(&self, seq: u64) -> bool {
        self.inner
            .read()
            .unwrap()
            .evals
            .values()
            .filter(|eval| eval.seq() == seq)
            .count()
            == 1
    }

    /// First live eval (in creation order) whose material includes
    /// `event_id`.
    pub fn find_by_event_id(&self, event_id: &EventId) -> Option<Arc<EvalInner>> {
        self.inner
            .read()
            .unwrap()
            .evals
            .values()
            .find(|eval| eval.evaluating(event_id))
            .cloned()
    }

    /// How many live evals include `event_id`.
    pub fn count_by_event_id(&self, event_id: &EventId) -> usize {
        self.inner
            .read()
            .unwrap()
            .evals
            .values()
            .filter(|eval| eval.evaluating(event_id))
            .count()
    }

    /// First matching pdu among all live evals' material.
    pub fn find_pdu(&self, event_id: &EventId) -> Option<PduEvent> {
        self.inner
            .read()
            .unwrap()
            .evals
            .values()
            .find_map(|eval| eval.find_pdu(event_id))
    }

    pub fn count_by_task(&self, task: TaskId) -> usize {
        self.inner
            .read()
            .unwrap()
            .stacks
            .get(&task)
            .map_or(0, Vec::len)
    }

    /// The eval directly beneath `eval` on `task`'s stack: its parent in
    /// the nesting order. An eval not on that stack gets the stack's most
    /// recent entry, the parent it would link under if pushed there now.
    pub fn find_parent(&self, eval: &EvalInner, task: TaskId) -> Option<Arc<EvalInner>> {
        let inner = self.inner.read().unwrap();
        let stack = inner.stacks.get(&task)?;

        let parent_id = match stack.iter().position(|&id| id == eval.id) {
            Some(0) => None,
            Some(pos) => Some(stack[pos - 1]),
            None => stack.last().copied().filter(|&id| id != eval.id),
        }?;

        inner.evals.get(&parent_id).cloned()
    }

    /// The bottom-most ancestor of `eval` on `task`, if it has any.
    pub fn find_root(&self, eval: &EvalInner, task: TaskId) -> Option<Arc<EvalInner>> {
        let inner = self.inner.read().unwrap();
        let stack = inner.stacks.get(&task)?;

        let root_id = match stack.iter().position(|&id| id == eval.id) {
            Some(0) => None,
            Some(_) => stack.first().copied(),
            None => stack.first().copied().filter(|&id| id != eval.id),
        }?;

        inner.evals.get(&root_id).cloned()
    }

    /// Visit every live eval in creation order; stop early on false.
    pub fn for_each<F>(&self, mut f: F) -> bool
    where
        F: FnMut(&EvalInner) -> bool,
    {
        for eval in self.inner.read().unwrap().evals.values() {
            if !f(eval) {
                return false;
            }
        }

        true
    }

    /// Visit every pdu of every live eval; stop early on false.
    pub fn for_each_pdu<F>(&self, mut f: F) -> bool
    where
        F: FnMut(&PduEvent) -> bool,
    {
        for eval in self.inner.read().unwrap().evals.values() {
            let proceed = match &*eval.shape.read().unwrap() {
                Shape::Pdus(pdus) => pdus.iter().all(&mut f),
                Shape::Event(event) => f(event),
                _ => true,
            };

            if !proceed {
                return false;
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn registry() -> Arc<Registry> {
        Arc::new(Registry::new())
    }

    fn pdu(event_id: &str) -> PduEvent {
        serde_json::from_value(json!({
            "event_id": event_id,
            "room_id": "!r:trellis.test",
            "sender": "@u:remote.test",
            "origin_server_ts": 1_700_000_000_000u64,
            "type": "m.room.message",
            "content": {},
            "prev_events": [],
            "depth": 1,
            "auth_events": [],
            "hashes": { "sha256": "aaaa" },
        }))
        .unwrap()
    }

    #[test]
    fn ids_strictly_increase_in_creation_order() {
        let registry = registry();
        let a = Eval::new(&registry, Opts::default());
        let b = Eval::new(&registry, Opts::default());
        let c = Eval::new(&registry, Opts::default());
        assert!(a.id() < b.id() && b.id() < c.id());
        assert_eq!(registry.count(), 3);
    }

    #[test]
    fn nested_evals_link_parent_and_child() {
        let registry = registry();
        let parent = Eval::new(&registry, Opts::default());
        assert!(parent.parent_id().is_none());

        {
            let child = Eval::new(&registry, Opts::default());
            assert_eq!(child.parent_id(), Some(parent.id()));
            assert_eq!(parent.child_id(), Some(child.id()));

            let found = registry.find_parent(&child, child.task()).unwrap();
            assert_eq!(found.id(), parent.id());
        }

        // Unlinked on drop.
        assert!(parent.child_id().is_none());
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn find_root_walks_to_the_bottom() {
        let registry = registry();
        let root = Eval::new(&registry, Opts::default());
        let mid = Eval::new(&registry, Opts::default());
        let leaf = Eval::new(&registry, Opts::default());

        let found = registry.find_root(&leaf, leaf.task()).unwrap();
        assert_eq!(found.id(), root.id());

        // Ancestry runs downwards only.
        let mid_parent = registry.find_parent(&mid, mid.task()).unwrap();
        assert_eq!(mid_parent.id(), root.id());
        assert!(registry.find_parent(&root, root.task()).is_none());
        assert!(registry.find_root(&root, root.task()).is_none());

        // A lone eval has no root but itself.
        let lone_registry = Arc::new(Registry::new());
        let lone = Eval::new(&lone_registry, Opts::default());
        assert!(lone_registry.find_root(&lone, lone.task()).is_none());
    }

    #[test]
    fn sequence_queries() {
        let registry = registry();
        let a = Eval::new(&registry, Opts::default());
        let b = Eval::new(&registry, Opts::default());
        let c = Eval::new(&registry, Opts::default());

        assert!(registry.min_seq().is_none());
        assert!(registry.max_seq().is_none());

        registry.commit(&a);
        registry.commit(&b);

        assert_eq!(registry.min_seq(), Some(1));
        assert_eq!(registry.max_seq(), Some(2));
        assert_eq!(registry.next_seq(1), Some(2));
        assert!(registry.next_seq(2).is_none());
        assert!(registry.unique_seq(1));
        assert!(registry.unique_seq(2));

        registry.commit(&c);
        assert_eq!(registry.max_seq(), Some(3));
        assert_eq!(registry.committed(), 3);
    }

    #[test]
    fn find_by_event_id_matches_all_shapes() {
        let registry = registry();

        let single = Eval::new(&registry, Opts::default());
        single.set_shape(Shape::Event(pdu("$single:x")));

        let batch = Eval::new(&registry, Opts::default());
        batch.set_shape(Shape::Pdus(vec![pdu("$batch1:x"), pdu("$batch2:x")]));

        let issue = Eval::new(&registry, Opts::default());
        let mut object = CanonicalJsonObject::new();
        object.insert(
            "event_id".to_owned(),
            CanonicalJsonValue::String("$issue:x".to_owned()),
        );
        issue.set_shape(Shape::Issue(object));

        let single_id: &EventId = "$single:x".try_into().unwrap();
        let batch_id: &EventId = "$batch2:x".try_into().unwrap();
        let issue_id: &EventId = "$issue:x".try_into().unwrap();
        let missing: &EventId = "$missing:x".try_into().unwrap();

        assert_eq!(registry.find_by_event_id(single_id).unwrap().id(), single.id());
        assert_eq!(registry.find_by_event_id(batch_id).unwrap().id(), batch.id());
        assert_eq!(registry.find_by_event_id(issue_id).unwrap().id(), issue.id());
        assert!(registry.find_by_event_id(missing).is_none());

        assert_eq!(registry.count_by_event_id(batch_id), 1);
        assert!(registry.find_pdu(batch_id).is_some());
    }

    #[tokio::test]
    async fn sibling_tasks_keep_separate_stacks() {
        let registry = registry();

        let (a, b) = tokio::join!(
            {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    let eval = Eval::new(&registry, Opts::default());
                    (eval.id(), eval.parent_id(), eval.task())
                })
            },
            {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    let eval = Eval::new(&registry, Opts::default());
                    (eval.id(), eval.parent_id(), eval.task())
                })
            },
        );

        let (_, a_parent, a_task) = a.unwrap();
        let (_, b_parent, b_task) = b.unwrap();

        // Spawned tasks have distinct identities and no cross-linkage.
        assert!(a_parent.is_none());
        assert!(b_parent.is_none());
        assert_ne!(a_task, b_task);
    }
}
