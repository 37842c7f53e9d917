use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use crate::base::{
    repl::{ClassRegistry, InstanceId, Netmode, Registry, ReplicableRef},
    signal::SignalBus,
};

// === Rules === //

/// Game-defined policy consulted by the server connection.
pub trait GameRules {
    /// Whether `candidate` should replicate to the peer viewing through
    /// `viewer`. Owners bypass this check.
    fn is_relevant(&self, viewer: Option<&ReplicableRef>, candidate: &ReplicableRef) -> bool;

    /// Authoritative hit resolution, typically performed under a rewound
    /// tick.
    fn on_shoot(&self, _target: InstanceId, _instigator: Option<InstanceId>, _damage: f32) {}
}

// === World === //

/// Simulation context for one peer: netmode, clock, the object graph and
/// the signal bus. Handed to connections and physics at construction so
/// nothing in the runtime is a global.
pub struct World {
    pub netmode: Netmode,
    pub tick_rate: u32,
    pub bus: Rc<SignalBus>,
    pub registry: Registry,
    pub classes: ClassRegistry,
    elapsed: Cell<f64>,
    tick: Cell<u32>,
    rules: RefCell<Option<Box<dyn GameRules>>>,
}

impl World {
    pub fn new(netmode: Netmode, tick_rate: u32) -> Rc<World> {
        let bus = Rc::new(SignalBus::new());

        Rc::new(World {
            netmode,
            tick_rate,
            registry: Registry::new(Rc::clone(&bus)),
            classes: ClassRegistry::default(),
            bus,
            elapsed: Cell::new(0.0),
            tick: Cell::new(0),
            rules: RefCell::new(None),
        })
    }

    pub fn elapsed(&self) -> f64 {
        self.elapsed.get()
    }

    pub fn tick(&self) -> u32 {
        self.tick.get()
    }

    /// Step the clock by one tick of `delta` seconds.
    pub fn advance(&self, delta: f32) {
        self.elapsed.set(self.elapsed.get() + delta as f64);
        self.tick.set(self.tick.get() + 1);
    }

    pub fn set_rules(&self, rules: Box<dyn GameRules>) {
        *self.rules.borrow_mut() = Some(rules);
    }

    /// With no rules installed every candidate is relevant.
    pub fn is_relevant(&self, viewer: Option<&ReplicableRef>, candidate: &ReplicableRef) -> bool {
        match &*self.rules.borrow() {
            Some(rules) => rules.is_relevant(viewer, candidate),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_advances_per_tick() {
        let world = World::new(Netmode::Server, 60);

        assert_eq!(world.tick(), 0);
        world.advance(0.25);
        world.advance(0.25);

        assert_eq!(world.tick(), 2);
        assert!((world.elapsed() - 0.5).abs() < 1e-9);
    }
}
