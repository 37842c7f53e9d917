use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::base::repl::{InstanceId, ReplicableRef};

// === Identity === //

/// Bus-scoped identity of a listener or signal target. Unlike an
/// `InstanceId`, it survives identity reconciliation.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ListenerId(u64);

// === Signals === //

/// Every signal the runtime exposes to hosts, with payload.
#[derive(Debug, Clone)]
pub enum Signal {
    Tick { delta: f32 },
    MapLoaded,
    PhysicsTick { delta: f32 },
    PhysicsSingleUpdate { delta: f32, target: InstanceId },
    PhysicsRewind { tick: u32 },
    UpdateColliders,
    ReplicableRegistered { replicable: ReplicableRef },
    ReplicableUnregistered { replicable: ReplicableRef },
    ReplicationNotify { replicable: ReplicableRef, attr: &'static str },
    ConnectionSuccess,
    ConnectionError,
    ConnectionDeleted,
    LatencyUpdated { latency: f32 },
}

#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq)]
pub enum SignalKind {
    Tick,
    MapLoaded,
    PhysicsTick,
    PhysicsSingleUpdate,
    PhysicsRewind,
    UpdateColliders,
    ReplicableRegistered,
    ReplicableUnregistered,
    ReplicationNotify,
    ConnectionSuccess,
    ConnectionError,
    ConnectionDeleted,
    LatencyUpdated,
    /// Root of the signal hierarchy; subscribers hear every firing.
    Any,
}

impl Signal {
    pub fn kind(&self) -> SignalKind {
        match self {
            Signal::Tick { .. } => SignalKind::Tick,
            Signal::MapLoaded => SignalKind::MapLoaded,
            Signal::PhysicsTick { .. } => SignalKind::PhysicsTick,
            Signal::PhysicsSingleUpdate { .. } => SignalKind::PhysicsSingleUpdate,
            Signal::PhysicsRewind { .. } => SignalKind::PhysicsRewind,
            Signal::UpdateColliders => SignalKind::UpdateColliders,
            Signal::ReplicableRegistered { .. } => SignalKind::ReplicableRegistered,
            Signal::ReplicableUnregistered { .. } => SignalKind::ReplicableUnregistered,
            Signal::ReplicationNotify { .. } => SignalKind::ReplicationNotify,
            Signal::ConnectionSuccess => SignalKind::ConnectionSuccess,
            Signal::ConnectionError => SignalKind::ConnectionError,
            Signal::ConnectionDeleted => SignalKind::ConnectionDeleted,
            Signal::LatencyUpdated { .. } => SignalKind::LatencyUpdated,
        }
    }
}

impl SignalKind {
    fn parent(self) -> Option<SignalKind> {
        match self {
            SignalKind::Any => None,
            _ => Some(SignalKind::Any),
        }
    }

    /// Cached kinds replay their full history to global subscribers that
    /// arrive late.
    fn is_cached(self) -> bool {
        matches!(self, SignalKind::ReplicableRegistered)
    }
}

// === Bus === //

pub type SignalFn = dyn FnMut(&Signal, Option<ListenerId>);

type Callback = Rc<RefCell<SignalFn>>;

#[derive(Default)]
struct KindTable {
    /// Subscription application order; delivery is deterministic.
    global: Vec<(ListenerId, Callback)>,
    targeted: FxHashMap<ListenerId, Callback>,
    children: FxHashMap<ListenerId, SmallVec<[ListenerId; 2]>>,
}

enum PendingOp {
    Subscribe {
        kind: SignalKind,
        listener: ListenerId,
        global: bool,
        callback: Callback,
    },
    Unsubscribe {
        kind: SignalKind,
        listener: ListenerId,
    },
    Link {
        kind: SignalKind,
        child: ListenerId,
        parent: ListenerId,
    },
    Unlink {
        kind: SignalKind,
        child: ListenerId,
        parent: ListenerId,
    },
}

/// In-process publish/subscribe dispatcher. Subscription, unsubscription
/// and child-linking are staged and applied at the next `update_graph`
/// barrier, so listeners may mutate the graph during delivery without
/// corrupting iteration.
#[derive(Default)]
pub struct SignalBus {
    tables: RefCell<FxHashMap<SignalKind, KindTable>>,
    pending: RefCell<Vec<PendingOp>>,
    cache: RefCell<Vec<(Signal, Option<ListenerId>)>>,
    next_listener: Cell<u64>,
}

impl SignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate_listener(&self) -> ListenerId {
        let id = self.next_listener.get();
        self.next_listener.set(id + 1);
        ListenerId(id)
    }

    /// Stage a global subscription: `callback` runs for every firing of
    /// `kind` once the next barrier applies it.
    pub fn subscribe(
        &self,
        kind: SignalKind,
        listener: ListenerId,
        callback: impl FnMut(&Signal, Option<ListenerId>) + 'static,
    ) {
        self.pending.borrow_mut().push(PendingOp::Subscribe {
            kind,
            listener,
            global: true,
            callback: Rc::new(RefCell::new(callback)),
        });
    }

    /// Stage a targeted subscription: `callback` runs only when a firing
    /// names `listener` (or an ancestor linked via `link_child`) as its
    /// target.
    pub fn subscribe_targeted(
        &self,
        kind: SignalKind,
        listener: ListenerId,
        callback: impl FnMut(&Signal, Option<ListenerId>) + 'static,
    ) {
        self.pending.borrow_mut().push(PendingOp::Subscribe {
            kind,
            listener,
            global: false,
            callback: Rc::new(RefCell::new(callback)),
        });
    }

    /// Stage removal of both subscription flavours and any child links of
    /// `listener` for `kind`.
    pub fn unsubscribe(&self, kind: SignalKind, listener: ListenerId) {
        self.pending
            .borrow_mut()
            .push(PendingOp::Unsubscribe { kind, listener });
    }

    /// Stage a parent/child link: firings of `kind` targeted at `parent`
    /// also reach `child`.
    pub fn link_child(&self, kind: SignalKind, child: ListenerId, parent: ListenerId) {
        self.pending
            .borrow_mut()
            .push(PendingOp::Link { kind, child, parent });
    }

    pub fn unlink_child(&self, kind: SignalKind, child: ListenerId, parent: ListenerId) {
        self.pending
            .borrow_mut()
            .push(PendingOp::Unlink { kind, child, parent });
    }

    /// Apply all staged mutations. Replayed cache deliveries may stage
    /// further mutations; the barrier drains until quiescent.
    pub fn update_graph(&self) {
        loop {
            let ops = std::mem::take(&mut *self.pending.borrow_mut());
            if ops.is_empty() {
                return;
            }

            for op in ops {
                self.apply(op);
            }
        }
    }

    fn apply(&self, op: PendingOp) {
        match op {
            PendingOp::Subscribe {
                kind,
                listener,
                global,
                callback,
            } => {
                {
                    let mut tables = self.tables.borrow_mut();
                    let table = tables.entry(kind).or_default();

                    if global {
                        table.global.retain(|(id, _)| *id != listener);
                        table.global.push((listener, Rc::clone(&callback)));
                    } else {
                        table.targeted.insert(listener, Rc::clone(&callback));
                    }
                }

                // Late global subscribers to a cached kind receive the
                // history, in firing order. Targeted listeners never do.
                if global && kind.is_cached() {
                    let history: Vec<_> = self
                        .cache
                        .borrow()
                        .iter()
                        .filter(|(signal, _)| signal.kind() == kind)
                        .cloned()
                        .collect();

                    for (signal, target) in history {
                        Self::invoke(&callback, &signal, target);
                    }
                }
            }
            PendingOp::Unsubscribe { kind, listener } => {
                let mut tables = self.tables.borrow_mut();
                let Some(table) = tables.get_mut(&kind) else {
                    return;
                };

                table.global.retain(|(id, _)| *id != listener);
                table.targeted.remove(&listener);
                table.children.remove(&listener);
                table.children.retain(|_, children| {
                    children.retain(|child| *child != listener);
                    !children.is_empty()
                });
            }
            PendingOp::Link { kind, child, parent } => {
                let mut tables = self.tables.borrow_mut();
                let children = tables
                    .entry(kind)
                    .or_default()
                    .children
                    .entry(parent)
                    .or_default();

                if !children.contains(&child) {
                    children.push(child);
                }
            }
            PendingOp::Unlink { kind, child, parent } => {
                let mut tables = self.tables.borrow_mut();
                let Some(table) = tables.get_mut(&kind) else {
                    return;
                };

                if let Some(children) = table.children.get_mut(&parent) {
                    children.retain(|c| *c != child);
                    if children.is_empty() {
                        table.children.remove(&parent);
                    }
                }
            }
        }
    }

    /// Deliver `signal`: targeted listeners of the named target and its
    /// descendants first, then global listeners, then the same for the
    /// root kind.
    pub fn fire(&self, signal: Signal, target: Option<ListenerId>) {
        let kind = signal.kind();

        if kind.is_cached() {
            self.cache.borrow_mut().push((signal.clone(), target));
        }

        let mut walk = Some(kind);
        while let Some(level) = walk {
            let mut callbacks = Vec::new();

            if let Some(target) = target {
                self.collect_targeted(level, target, &mut callbacks);
            }
            self.collect_global(level, &mut callbacks);

            for callback in callbacks {
                Self::invoke(&callback, &signal, target);
            }

            walk = level.parent();
        }
    }

    /// Drop the cached history addressed to `target`; late subscribers
    /// must not see objects that are already gone.
    pub fn forget_cached_target(&self, target: ListenerId) {
        self.cache
            .borrow_mut()
            .retain(|(_, cached)| *cached != Some(target));
    }

    fn collect_targeted(&self, kind: SignalKind, root: ListenerId, out: &mut Vec<Callback>) {
        let tables = self.tables.borrow();
        let Some(table) = tables.get(&kind) else {
            return;
        };

        let mut queue: SmallVec<[ListenerId; 4]> = SmallVec::new();
        let mut visited: SmallVec<[ListenerId; 8]> = SmallVec::new();
        queue.push(root);

        while let Some(addressee) = queue.pop() {
            if visited.contains(&addressee) {
                continue;
            }
            visited.push(addressee);

            if let Some(callback) = table.targeted.get(&addressee) {
                out.push(Rc::clone(callback));
            }
            if let Some(children) = table.children.get(&addressee) {
                queue.extend(children.iter().copied());
            }
        }
    }

    fn collect_global(&self, kind: SignalKind, out: &mut Vec<Callback>) {
        let tables = self.tables.borrow();
        if let Some(table) = tables.get(&kind) {
            out.extend(table.global.iter().map(|(_, cb)| Rc::clone(cb)));
        }
    }

    fn invoke(callback: &Callback, signal: &Signal, target: Option<ListenerId>) {
        // A listener that fires back into itself mid-delivery is skipped
        // rather than aborting the tick.
        match callback.try_borrow_mut() {
            Ok(mut callback) => callback(signal, target),
            Err(_) => tracing::warn!("skipping re-entrant delivery of {:?}", signal.kind()),
        }
    }
}

// === Tests === //
