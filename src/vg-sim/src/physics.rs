use std::{cell::RefCell, rc::Rc};

use glam::Vec3;
use rustc_hash::FxHashMap;

use vg_common::base::{
    repl::InstanceId,
    signal::{Signal, SignalKind},
    world::World,
};

use crate::rewind::{RewindBuffer, RewindError};

// === State === //

/// Rigid body snapshot, captured per tick on the server and restored in
/// place on rewind.
#[derive(Debug, Copy, Clone, Default, PartialEq)]
pub struct RigidBodyState {
    pub position: Vec3,
    pub velocity: Vec3,
    pub angular: Vec3,
    pub rotation: Vec3,
    pub collision_group: u16,
    pub collision_mask: u16,
}

impl RigidBodyState {
    /// Field-for-field copy into an existing state holder; pointers held
    /// elsewhere stay valid.
    pub fn copy_from(&mut self, other: &RigidBodyState) {
        self.position = other.position;
        self.velocity = other.velocity;
        self.angular = other.angular;
        self.rotation = other.rotation;
        self.collision_group = other.collision_group;
        self.collision_mask = other.collision_mask;
    }
}

// === Adapter === //

/// Engine-side physics hooks. The runtime never touches the scene graph
/// directly; everything goes through this seam.
pub trait PhysicsHost {
    /// Advance the simulation by `delta` seconds.
    fn update(&mut self, delta: f32);

    /// Commit the stepped simulation back to the scene.
    fn apply(&mut self);

    fn suspend(&mut self, id: InstanceId);

    fn resume(&mut self, id: InstanceId);

    fn is_suspended(&self, id: InstanceId) -> bool;

    fn snapshot(&self, id: InstanceId) -> Option<RigidBodyState>;

    fn restore(&mut self, id: InstanceId, state: &RigidBodyState);

    /// Every body the simulation currently drives.
    fn bodies(&self) -> Vec<InstanceId>;
}

// === PhysicsSystem === //

/// Glue between the signal bus and the physics adapter: whole-world
/// ticks, single-object catch-up steps and (on the server) the rewind
/// history.
pub struct PhysicsSystem {
    world: Rc<World>,
    host: Box<dyn PhysicsHost>,
    rewind: Option<RewindBuffer>,
}

impl PhysicsSystem {
    /// Wire the system to its world's bus. Servers pass a rewind buffer;
    /// clients pass `None`.
    pub fn install(
        world: Rc<World>,
        host: Box<dyn PhysicsHost>,
        rewind: Option<RewindBuffer>,
    ) -> Rc<RefCell<PhysicsSystem>> {
        let listener = world.bus.allocate_listener();
        let system = Rc::new(RefCell::new(PhysicsSystem {
            world: Rc::clone(&world),
            host,
            rewind,
        }));

        {
            let system = Rc::clone(&system);
            world
                .bus
                .subscribe(SignalKind::PhysicsTick, listener, move |signal, _| {
                    let Signal::PhysicsTick { delta } = signal else {
                        return;
                    };
                    let Ok(mut system) = system.try_borrow_mut() else {
                        tracing::warn!("dropping re-entrant physics tick");
                        return;
                    };
                    system.tick(*delta);
                });
        }

        {
            let system = Rc::clone(&system);
            world.bus.subscribe(
                SignalKind::PhysicsSingleUpdate,
                listener,
                move |signal, _| {
                    let Signal::PhysicsSingleUpdate { delta, target } = signal else {
                        return;
                    };
                    let Ok(mut system) = system.try_borrow_mut() else {
                        tracing::warn!("dropping re-entrant single physics update");
                        return;
                    };
                    system.single_update(*delta, *target);
                },
            );
        }

        {
            let system = Rc::clone(&system);
            world
                .bus
                .subscribe(SignalKind::PhysicsRewind, listener, move |signal, _| {
                    let Signal::PhysicsRewind { tick } = signal else {
                        return;
                    };
                    let Ok(mut system) = system.try_borrow_mut() else {
                        tracing::warn!("dropping re-entrant rewind request");
                        return;
                    };
                    if let Err(err) = system.rewind_to(Some(*tick)) {
                        tracing::warn!("rewind failed: {err}");
                    }
                });
        }

        world.bus.update_graph();
        system
    }

    pub fn host(&self) -> &dyn PhysicsHost {
        &*self.host
    }

    pub fn host_mut(&mut self) -> &mut dyn PhysicsHost {
        &mut *self.host
    }

    pub fn rewind_buffer(&self) -> Option<&RewindBuffer> {
        self.rewind.as_ref()
    }

    /// Whole-world physics step: update, commit, let collider listeners
    /// run, then capture this tick into the rewind history.
    fn tick(&mut self, delta: f32) {
        self.host.update(delta);
        self.host.apply();
        self.world.bus.fire(Signal::UpdateColliders, None);

        if let Some(rewind) = &mut self.rewind {
            let mut states = FxHashMap::default();
            for id in self.host.bodies() {
                if let Some(state) = self.host.snapshot(id) {
                    states.insert(id, state);
                }
            }
            rewind.record(self.world.tick(), states);
        }
    }

    /// Step the simulation for a single body: everything else is
    /// suspended on entry and exactly the set we suspended is resumed on
    /// every exit path.
    fn single_update(&mut self, delta: f32, target: InstanceId) {
        let suspended: Vec<InstanceId> = self
            .host
            .bodies()
            .into_iter()
            .filter(|id| *id != target && !self.host.is_suspended(*id))
            .collect();

        for &id in &suspended {
            self.host.suspend(id);
        }

        {
            let mut host = scopeguard::guard(&mut self.host, |host| {
                for &id in &suspended {
                    host.resume(id);
                }
            });
            host.update(delta);
        }

        self.host.apply();
    }

    /// Restore every body recorded at `tick` (the latest recorded tick
    /// when `None`), copying state in place through the adapter.
    pub fn rewind_to(&mut self, tick: Option<u32>) -> Result<(), RewindError> {
        let Some(rewind) = &self.rewind else {
            return Err(RewindError::Disabled);
        };

        let tick = match tick {
            Some(tick) => tick,
            None => rewind.latest_tick().ok_or(RewindError::OutOfRange(0))?,
        };

        let states = rewind.states_at(tick)?;
        for (&id, state) in states {
            self.host.restore(id, state);
        }

        Ok(())
    }
}

// === Tests === //

#[cfg(test)]
mod tests {
    use rustc_hash::FxHashSet;
    use vg_common::base::repl::Netmode;

    use super::*;

    #[derive(Debug, Default)]
    struct TestHost {
        bodies: FxHashMap<InstanceId, RigidBodyState>,
        suspended: FxHashSet<InstanceId>,
        applied: u32,
    }

    impl TestHost {
        fn add_body(&mut self, id: InstanceId, position: Vec3, velocity: Vec3) {
            self.bodies.insert(
                id,
                RigidBodyState {
                    position,
                    velocity,
                    ..RigidBodyState::default()
                },
            );
        }
    }

    impl PhysicsHost for TestHost {
        fn update(&mut self, delta: f32) {
            for (id, body) in self.bodies.iter_mut() {
                if !self.suspended.contains(id) {
                    body.position += body.velocity * delta;
                }
            }
        }

        fn apply(&mut self) {
            self.applied += 1;
        }

        fn suspend(&mut self, id: InstanceId) {
            self.suspended.insert(id);
        }

        fn resume(&mut self, id: InstanceId) {
            self.suspended.remove(&id);
        }

        fn is_suspended(&self, id: InstanceId) -> bool {
            self.suspended.contains(&id)
        }

        fn snapshot(&self, id: InstanceId) -> Option<RigidBodyState> {
            self.bodies.get(&id).copied()
        }

        fn restore(&mut self, id: InstanceId, state: &RigidBodyState) {
            if let Some(body) = self.bodies.get_mut(&id) {
                body.copy_from(state);
            }
        }

        fn bodies(&self) -> Vec<InstanceId> {
            let mut ids: Vec<InstanceId> = self.bodies.keys().copied().collect();
            ids.sort();
            ids
        }
    }

    fn server_system(host: TestHost) -> (Rc<World>, Rc<RefCell<PhysicsSystem>>) {
        let world = World::new(Netmode::Server, 60);
        let system = PhysicsSystem::install(
            Rc::clone(&world),
            Box::new(host),
            Some(RewindBuffer::new(world.tick_rate, 1.0)),
        );
        (world, system)
    }

    fn tick(world: &World, delta: f32) {
        world.advance(delta);
        world.bus.fire(Signal::PhysicsTick { delta }, None);
    }

    #[test]
    fn rewind_restores_recorded_state() {
        // A pawn crossing x=5 at one tick and x=25 later; rewinding to the
        // early tick must restore x=5, and an evicted tick must fail.
        let mut host = TestHost::default();
        let pawn = InstanceId(1);
        host.add_body(pawn, Vec3::ZERO, Vec3::new(5.0, 0.0, 0.0));

        let (world, system) = server_system(host);

        let mut ticks = Vec::new();
        for _ in 0..5 {
            tick(&world, 1.0);
            ticks.push(world.tick());
        }

        let mut system = system.borrow_mut();
        let early = ticks[0];
        system.rewind_to(Some(early)).unwrap();

        let restored = system.host().snapshot(pawn).unwrap();
        assert_eq!(restored.position.x, 5.0);

        assert!(matches!(
            system.rewind_to(Some(9999)),
            Err(RewindError::OutOfRange(9999))
        ));
    }

    #[test]
    fn rewind_round_trips_back_to_now() {
        let mut host = TestHost::default();
        let pawn = InstanceId(1);
        host.add_body(pawn, Vec3::ZERO, Vec3::new(1.0, 0.0, 0.0));

        let (world, system) = server_system(host);
        for _ in 0..4 {
            tick(&world, 1.0);
        }

        let mut system = system.borrow_mut();
        let now_state = system.host().snapshot(pawn).unwrap();

        system.rewind_to(Some(world.tick() - 2)).unwrap();
        assert_ne!(system.host().snapshot(pawn).unwrap(), now_state);

        system.rewind_to(None).unwrap();
        assert_eq!(system.host().snapshot(pawn).unwrap(), now_state);
    }

    #[test]
    fn history_is_bounded_by_the_rewind_window() {
        let mut host = TestHost::default();
        host.add_body(InstanceId(1), Vec3::ZERO, Vec3::X);

        let world = World::new(Netmode::Server, 10);
        let system = PhysicsSystem::install(
            Rc::clone(&world),
            Box::new(host),
            Some(RewindBuffer::new(world.tick_rate, 1.0)),
        );

        for _ in 0..25 {
            tick(&world, 0.1);
        }

        let system = system.borrow();
        let buffer = system.rewind_buffer().unwrap();
        assert_eq!(buffer.len(), 10);
        assert_eq!(buffer.oldest_tick(), Some(16));
    }

    #[test]
    fn single_update_moves_only_the_target() {
        let mut host = TestHost::default();
        let target = InstanceId(1);
        let bystander = InstanceId(2);
        let parked = InstanceId(3);
        host.add_body(target, Vec3::ZERO, Vec3::X);
        host.add_body(bystander, Vec3::ZERO, Vec3::X);
        host.add_body(parked, Vec3::ZERO, Vec3::X);

        let (world, system) = server_system(host);

        // An already-suspended body must stay suspended afterwards.
        system.borrow_mut().host_mut().suspend(parked);

        world.bus.fire(
            Signal::PhysicsSingleUpdate { delta: 1.0, target },
            None,
        );

        let system = system.borrow();
        let host = system.host();
        assert_eq!(host.snapshot(target).unwrap().position.x, 1.0);
        assert_eq!(host.snapshot(bystander).unwrap().position.x, 0.0);
        assert!(!host.is_suspended(bystander));
        assert!(host.is_suspended(parked));
    }

    #[test]
    fn clients_have_no_rewind_history() {
        let world = World::new(Netmode::Client, 60);
        let system = PhysicsSystem::install(Rc::clone(&world), Box::new(TestHost::default()), None);

        tick(&world, 1.0);

        let mut system = system.borrow_mut();
        assert!(system.rewind_buffer().is_none());
        assert!(matches!(system.rewind_to(None), Err(RewindError::Disabled)));
    }
}
