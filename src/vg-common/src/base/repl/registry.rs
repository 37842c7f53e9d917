use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::base::signal::{Signal, SignalBus};

use super::{ClassDescriptor, InstanceId, ReplicableRef};

// === Class registry === //

/// A replicable class as the registry knows it: its static shape plus a
/// constructor for client-side adoption.
#[derive(Debug, Copy, Clone)]
pub struct ReplicableClass {
    pub descriptor: &'static ClassDescriptor,
    pub construct: fn() -> ReplicableRef,
}

/// Constructors keyed by wire type name. Populated explicitly at startup;
/// peers must agree on the name set out of band.
#[derive(Debug, Default)]
pub struct ClassRegistry {
    by_name: RefCell<FxHashMap<&'static str, ReplicableClass>>,
}

impl ClassRegistry {
    pub fn register(&self, class: ReplicableClass) {
        let previous = self
            .by_name
            .borrow_mut()
            .insert(class.descriptor.type_name, class);

        if previous.is_some() {
            panic!(
                "type name {:?} registered more than once",
                class.descriptor.type_name
            );
        }
    }

    pub fn get(&self, name: &str) -> Option<ReplicableClass> {
        self.by_name.borrow().get(name).copied()
    }
}

// === Errors === //

#[derive(Debug, Error)]
pub enum RegistryError {
    /// Authoritative claim on an id already held with authority. Fatal:
    /// the claimant's registration is rejected.
    #[error("identity conflict: id {0} is already held with authority")]
    IdentityConflict(InstanceId),
    #[error("instance is already registered as {0}")]
    AlreadyRegistered(InstanceId),
    #[error("instance is not registered")]
    NotRegistered,
    #[error("a retired instance cannot register again")]
    Retired,
    #[error("the id space is exhausted")]
    Exhausted,
}

// === Registry === //

const MAX_OWNER_DEPTH: usize = 64;

/// Process-wide graph of live replicables: id allocation, identity
/// reconciliation and lifecycle signals.
pub struct Registry {
    bus: Rc<SignalBus>,
    objects: RefCell<FxHashMap<InstanceId, ReplicableRef>>,
    next_id: Cell<u16>,
}

impl Registry {
    pub fn new(bus: Rc<SignalBus>) -> Self {
        Self {
            bus,
            objects: RefCell::new(FxHashMap::default()),
            next_id: Cell::new(1),
        }
    }

    /// Returns an id no live replicable holds.
    pub fn allocate_id(&self) -> Result<InstanceId, RegistryError> {
        let objects = self.objects.borrow();
        let start = self.next_id.get();
        let mut candidate = start;

        loop {
            if candidate != InstanceId::NULL_BITS
                && !objects.contains_key(&InstanceId(candidate))
            {
                self.next_id.set(candidate.wrapping_add(1));
                return Ok(InstanceId(candidate));
            }

            candidate = candidate.wrapping_add(1);
            if candidate == start {
                return Err(RegistryError::Exhausted);
            }
        }
    }

    /// Register `obj`. With `id` of `None` the graph allocates a dynamic
    /// id and the instance holds local authority over it; a caller-chosen
    /// id makes the identity static.
    pub fn register(
        &self,
        obj: &ReplicableRef,
        id: Option<InstanceId>,
    ) -> Result<InstanceId, RegistryError> {
        match id {
            Some(id) => self.register_as(obj, id, true, false),
            None => {
                let id = self.allocate_id()?;
                self.register_as(obj, id, false, true)
            }
        }
    }

    /// Client-side adoption on `replication_init`: returns the existing
    /// instance when the id is already remotely owned here, otherwise
    /// constructs `class` under `id`, displacing any locally-created
    /// occupant.
    pub fn create_or_return(
        &self,
        class: ReplicableClass,
        id: InstanceId,
    ) -> Result<ReplicableRef, RegistryError> {
        if let Some(existing) = self.lookup(id) {
            if !existing.borrow().core().has_local_authority() {
                return Ok(existing);
            }
        }

        let obj = (class.construct)();
        self.register_as(&obj, id, false, false)?;
        Ok(obj)
    }

    fn register_as(
        &self,
        obj: &ReplicableRef,
        id: InstanceId,
        is_static: bool,
        local_authority: bool,
    ) -> Result<InstanceId, RegistryError> {
        {
            let borrowed = obj.borrow();
            let core = borrowed.core();

            if core.is_retired() {
                return Err(RegistryError::Retired);
            }
            if core.is_registered() {
                return Err(RegistryError::AlreadyRegistered(
                    core.instance_id().expect("registered object has an id"),
                ));
            }
        }

        self.reconcile(id)?;

        let listener = self.bus.allocate_listener();
        obj.borrow_mut()
            .core_mut()
            .assign_identity(id, listener, is_static, local_authority);
        let listener = obj
            .borrow()
            .core()
            .listener()
            .expect("identity assignment sets a listener");

        self.objects.borrow_mut().insert(id, Rc::clone(obj));

        self.bus.fire(
            Signal::ReplicableRegistered {
                replicable: Rc::clone(obj),
            },
            Some(listener),
        );
        self.bus.update_graph();

        Ok(id)
    }

    /// Authority takeover: make `id` free to claim. A locally-created
    /// occupant is moved to a fresh dynamic id and re-announced; an
    /// occupant that holds authority makes the claim fail.
    pub fn reconcile(&self, id: InstanceId) -> Result<(), RegistryError> {
        if id.0 == InstanceId::NULL_BITS {
            return Err(RegistryError::IdentityConflict(id));
        }

        let occupant = self.objects.borrow().get(&id).cloned();
        let Some(occupant) = occupant else {
            return Ok(());
        };

        if !occupant.borrow().core().has_local_authority() {
            return Err(RegistryError::IdentityConflict(id));
        }

        let new_id = self.allocate_id()?;

        {
            let mut objects = self.objects.borrow_mut();
            objects.remove(&id);
            objects.insert(new_id, Rc::clone(&occupant));
        }
        occupant.borrow_mut().core_mut().reassign_identity(new_id);

        tracing::debug!("transferred authority of id {id}; occupant now lives at {new_id}");

        // Re-announce under the new identity so channels re-key; the stale
        // cache entry must not replay alongside it.
        if let Some(listener) = occupant.borrow().core().listener() {
            self.bus.forget_cached_target(listener);
            self.bus.fire(
                Signal::ReplicableRegistered {
                    replicable: Rc::clone(&occupant),
                },
                Some(listener),
            );
        }

        Ok(())
    }

    pub fn lookup(&self, id: InstanceId) -> Option<ReplicableRef> {
        self.objects.borrow().get(&id).cloned()
    }

    /// Remove `obj` from the graph. Irrevocable: the instance is retired
    /// and its id returns to the allocator.
    pub fn unregister(&self, obj: &ReplicableRef) -> Result<(), RegistryError> {
        let (id, listener) = {
            let borrowed = obj.borrow();
            let core = borrowed.core();

            if !core.is_registered() {
                return Err(RegistryError::NotRegistered);
            }
            (
                core.instance_id().expect("registered object has an id"),
                core.listener(),
            )
        };

        self.objects.borrow_mut().remove(&id);
        obj.borrow_mut().core_mut().mark_unregistered();

        if let Some(listener) = listener {
            self.bus.fire(
                Signal::ReplicableUnregistered {
                    replicable: Rc::clone(obj),
                },
                Some(listener),
            );
            self.bus.forget_cached_target(listener);
        }
        self.bus.update_graph();

        Ok(())
    }

    /// Root of the owner back-pointer chain, resolved through the graph.
    pub fn uppermost_owner(&self, id: InstanceId) -> Option<InstanceId> {
        let mut current = id;

        for _ in 0..MAX_OWNER_DEPTH {
            let obj = self.lookup(current)?;
            let owner = obj.borrow().core().owner();

            match owner {
                Some(next) if next != current => current = next,
                _ => return Some(current),
            }
        }

        tracing::warn!("ownership chain above {id} is too deep or cyclic");
        Some(current)
    }

    /// Live objects in id order; a stable order keeps the send sweep
    /// deterministic across ties.
    pub fn live(&self) -> Vec<ReplicableRef> {
        let objects = self.objects.borrow();
        let mut entries: Vec<(InstanceId, ReplicableRef)> = objects
            .iter()
            .map(|(id, obj)| (*id, Rc::clone(obj)))
            .collect();

        entries.sort_by_key(|(id, _)| *id);
        entries.into_iter().map(|(_, obj)| obj).collect()
    }

    pub fn len(&self) -> usize {
        self.objects.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.borrow().is_empty()
    }
}

// === Tests === //

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::super::testing::{new_player, probe};
    use super::*;
    use crate::base::signal::SignalKind;

    fn registry() -> (Rc<SignalBus>, Registry) {
        let bus = Rc::new(SignalBus::new());
        let registry = Registry::new(Rc::clone(&bus));
        (bus, registry)
    }

    #[test]
    fn ids_stay_unique_across_churn() {
        let (_bus, registry) = registry();
        let mut live = Vec::new();

        for round in 0..4 {
            for _ in 0..8 {
                let obj = new_player();
                registry.register(&obj, None).unwrap();
                live.push(obj);
            }
            // Retire every other object and keep registering.
            for obj in live.drain(..).skip(round % 2).step_by(2) {
                registry.unregister(&obj).unwrap();
            }

            let mut ids: Vec<_> = registry
                .live()
                .iter()
                .map(|obj| obj.borrow().core().instance_id().unwrap())
                .collect();
            let before = ids.len();
            ids.dedup();
            assert_eq!(ids.len(), before);
            assert_eq!(ids.len(), registry.len());
        }
    }

    #[test]
    fn static_claim_over_authoritative_occupant_fails() {
        let (_bus, registry) = registry();

        let holder = new_player();
        registry.register(&holder, Some(InstanceId(9))).unwrap();

        let claimant = new_player();
        let err = registry.register(&claimant, Some(InstanceId(9))).unwrap_err();
        assert!(matches!(err, RegistryError::IdentityConflict(InstanceId(9))));
        assert!(!claimant.borrow().core().is_registered());
    }

    #[test]
    fn reconciliation_displaces_local_occupant() {
        let (_bus, registry) = registry();

        let local = new_player();
        let id = registry.register(&local, None).unwrap();
        assert!(local.borrow().core().has_local_authority());

        let claimant = new_player();
        registry.register(&claimant, Some(id)).unwrap();

        let new_id = local.borrow().core().instance_id().unwrap();
        assert_ne!(new_id, id);
        assert!(Rc::ptr_eq(&registry.lookup(id).unwrap(), &claimant));
        assert!(Rc::ptr_eq(&registry.lookup(new_id).unwrap(), &local));
    }

    #[test]
    fn create_or_return_is_idempotent_for_remote_objects() {
        let (_bus, registry) = registry();
        let class = super::super::testing::player_class();

        let first = registry.create_or_return(class, InstanceId(7)).unwrap();
        let second = registry.create_or_return(class, InstanceId(7)).unwrap();

        assert!(Rc::ptr_eq(&first, &second));
        assert!(!first.borrow().core().has_local_authority());
        assert!(!first.borrow().core().is_static());
    }

    #[test]
    fn create_or_return_replaces_local_occupant() {
        let (_bus, registry) = registry();
        let class = super::super::testing::player_class();

        let local = new_player();
        let id = registry.register(&local, None).unwrap();

        let adopted = registry.create_or_return(class, id).unwrap();

        assert!(!Rc::ptr_eq(&adopted, &local));
        assert_ne!(local.borrow().core().instance_id(), Some(id));
        assert_eq!(adopted.borrow().core().instance_id(), Some(id));
    }

    #[test]
    fn lifecycle_signals_fire_in_order() {
        let (bus, registry) = registry();
        let listener = bus.allocate_listener();
        let events: Rc<RefCell<Vec<(SignalKind, Option<InstanceId>)>>> = Rc::default();

        {
            let events = Rc::clone(&events);
            bus.subscribe(SignalKind::Any, listener, move |signal, _| {
                let id = match signal {
                    Signal::ReplicableRegistered { replicable }
                    | Signal::ReplicableUnregistered { replicable } => {
                        replicable.borrow().core().instance_id()
                    }
                    _ => None,
                };
                events.borrow_mut().push((signal.kind(), id));
            });
        }
        bus.update_graph();

        let obj = probe("solo");
        let id = registry.register(&obj, None).unwrap();
        registry.unregister(&obj).unwrap();

        assert_eq!(
            *events.borrow(),
            [
                (SignalKind::ReplicableRegistered, Some(id)),
                (SignalKind::ReplicableUnregistered, Some(id)),
            ]
        );
    }

    #[test]
    fn retired_instances_never_return() {
        let (_bus, registry) = registry();

        let obj = new_player();
        registry.register(&obj, None).unwrap();
        registry.unregister(&obj).unwrap();

        assert!(matches!(
            registry.register(&obj, None),
            Err(RegistryError::Retired)
        ));
    }

    #[test]
    fn uppermost_owner_walks_the_chain() {
        let (_bus, registry) = registry();

        let pawn = new_player();
        let controller = new_player();
        let pawn_id = registry.register(&pawn, None).unwrap();
        let controller_id = registry.register(&controller, None).unwrap();

        pawn.borrow_mut().core_mut().set_owner(Some(controller_id));

        assert_eq!(registry.uppermost_owner(pawn_id), Some(controller_id));
        assert_eq!(registry.uppermost_owner(controller_id), Some(controller_id));

        // A cycle terminates at the hop bound instead of spinning.
        controller.borrow_mut().core_mut().set_owner(Some(pawn_id));
        assert!(registry.uppermost_owner(pawn_id).is_some());
    }

    #[test]
    fn allocate_skips_occupied_ids() {
        let (_bus, registry) = registry();

        let holder = new_player();
        registry.register(&holder, Some(InstanceId(2))).unwrap();

        let a = new_player();
        let b = new_player();
        assert_eq!(registry.register(&a, None).unwrap(), InstanceId(1));
        assert_eq!(registry.register(&b, None).unwrap(), InstanceId(3));
    }
}
