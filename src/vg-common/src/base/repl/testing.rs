//! Shared fixtures for the unit tests: a pawn class with the full
//! attribute/rpc surface, a controller for ownership chains and a bare
//! probe object.

use std::{any::Any, cell::RefCell, rc::Rc};

use glam::Vec3;
use smallvec::SmallVec;

use crate::base::{
    net::{AttrKind, AttrValue},
    world::World,
};

use super::{
    AttributeDef, ClassDescriptor, Netmode, Replicable, ReplicableClass, ReplicableCore,
    ReplicableRef, Role, Roles, RpcDef,
};

// === Player === //

fn default_roles() -> AttrValue {
    AttrValue::Roles(Roles::new(Role::Authority, Role::AutonomousProxy))
}

fn default_health() -> AttrValue {
    AttrValue::U32(100)
}

fn default_position() -> AttrValue {
    AttrValue::Vec3(Vec3::new(0.0, 0.0, 3.0))
}

fn default_alias() -> AttrValue {
    AttrValue::Str("player".into())
}

fn default_empty_string() -> AttrValue {
    AttrValue::Str(String::new())
}

pub(crate) static PLAYER_CLASS: ClassDescriptor = ClassDescriptor {
    type_name: "Player",
    attributes: &[
        AttributeDef {
            name: "roles",
            kind: AttrKind::Roles,
            complain: true,
            notify: false,
            initial_only: false,
            default: default_roles,
        },
        AttributeDef {
            name: "health",
            kind: AttrKind::U32,
            complain: true,
            notify: true,
            initial_only: false,
            default: default_health,
        },
        AttributeDef {
            name: "position",
            kind: AttrKind::Vec3,
            complain: true,
            notify: false,
            initial_only: false,
            default: default_position,
        },
        AttributeDef {
            name: "alias",
            kind: AttrKind::Str,
            complain: false,
            notify: false,
            initial_only: true,
            default: default_alias,
        },
        AttributeDef {
            name: "motd",
            kind: AttrKind::Str,
            complain: true,
            notify: false,
            initial_only: false,
            default: default_empty_string,
        },
    ],
    rpcs: &[
        RpcDef {
            name: "server_perform_move",
            target: Netmode::Server,
            reliable: true,
            simulated: false,
            signature: &[AttrKind::F32, AttrKind::Vec3],
        },
        RpcDef {
            name: "client_play_sound",
            target: Netmode::Client,
            reliable: false,
            simulated: true,
            signature: &[AttrKind::Str],
        },
        RpcDef {
            name: "client_force_respawn",
            target: Netmode::Client,
            reliable: true,
            simulated: false,
            signature: &[],
        },
    ],
};

#[derive(Debug)]
pub(crate) struct Player {
    core: ReplicableCore,
    pub moves: Vec<(f32, Vec3)>,
    pub sounds: Vec<String>,
    pub respawns: u32,
    pub notified: Vec<&'static str>,
}

impl Player {
    fn new() -> Self {
        Self {
            core: ReplicableCore::new(&PLAYER_CLASS),
            moves: Vec::new(),
            sounds: Vec::new(),
            respawns: 0,
            notified: Vec::new(),
        }
    }
}

impl Replicable for Player {
    fn core(&self) -> &ReplicableCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ReplicableCore {
        &mut self.core
    }

    fn conditions(
        &self,
        _is_owner: bool,
        is_complaint: bool,
        is_initial: bool,
    ) -> SmallVec<[&'static str; 8]> {
        let mut names = SmallVec::new();
        if is_complaint || is_initial {
            names.extend(["roles", "health", "position", "motd"]);
        }
        if is_initial {
            names.push("alias");
        }
        names
    }

    fn on_notify(&mut self, attr: &'static str) {
        self.notified.push(attr);
    }

    fn invoke_rpc(&mut self, index: usize, args: &[AttrValue]) -> anyhow::Result<()> {
        match index {
            0 => {
                let (AttrValue::F32(timestamp), AttrValue::Vec3(position)) = (&args[0], &args[1])
                else {
                    anyhow::bail!("bad arguments for server_perform_move");
                };
                self.moves.push((*timestamp, *position));
            }
            1 => {
                let AttrValue::Str(sound) = &args[0] else {
                    anyhow::bail!("bad arguments for client_play_sound");
                };
                self.sounds.push(sound.clone());
            }
            2 => self.respawns += 1,
            other => anyhow::bail!("unknown rpc index {other}"),
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn construct_player() -> ReplicableRef {
    Rc::new(RefCell::new(Player::new()))
}

pub(crate) fn new_player() -> ReplicableRef {
    construct_player()
}

pub(crate) fn player_class() -> ReplicableClass {
    ReplicableClass {
        descriptor: &PLAYER_CLASS,
        construct: construct_player,
    }
}

pub(crate) fn player_moves(obj: &dyn Replicable) -> Vec<(f32, Vec3)> {
    obj.as_any().downcast_ref::<Player>().unwrap().moves.clone()
}

pub(crate) fn player_sounds(obj: &dyn Replicable) -> Vec<String> {
    obj.as_any().downcast_ref::<Player>().unwrap().sounds.clone()
}

pub(crate) fn player_respawns(obj: &dyn Replicable) -> u32 {
    obj.as_any().downcast_ref::<Player>().unwrap().respawns
}

pub(crate) fn player_notifications(obj: &dyn Replicable) -> Vec<&'static str> {
    obj.as_any()
        .downcast_ref::<Player>()
        .unwrap()
        .notified
        .clone()
}

// === Controller === //

fn default_pawn_ref() -> AttrValue {
    AttrValue::Ref(None)
}

pub(crate) static CONTROLLER_CLASS: ClassDescriptor = ClassDescriptor {
    type_name: "Controller",
    attributes: &[
        AttributeDef {
            name: "roles",
            kind: AttrKind::Roles,
            complain: true,
            notify: false,
            initial_only: false,
            default: default_roles,
        },
        AttributeDef {
            name: "pawn",
            kind: AttrKind::Ref,
            complain: true,
            notify: true,
            initial_only: false,
            default: default_pawn_ref,
        },
    ],
    rpcs: &[],
};

#[derive(Debug)]
pub(crate) struct Controller {
    core: ReplicableCore,
}

impl Replicable for Controller {
    fn core(&self) -> &ReplicableCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ReplicableCore {
        &mut self.core
    }

    fn conditions(
        &self,
        _is_owner: bool,
        is_complaint: bool,
        is_initial: bool,
    ) -> SmallVec<[&'static str; 8]> {
        let mut names = SmallVec::new();
        if is_complaint || is_initial {
            names.extend(["roles", "pawn"]);
        }
        names
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn construct_controller() -> ReplicableRef {
    Rc::new(RefCell::new(Controller {
        core: ReplicableCore::new(&CONTROLLER_CLASS),
    }))
}

pub(crate) fn new_controller() -> ReplicableRef {
    construct_controller()
}

pub(crate) fn controller_class() -> ReplicableClass {
    ReplicableClass {
        descriptor: &CONTROLLER_CLASS,
        construct: construct_controller,
    }
}

// === Probe === //

fn default_probe_alias() -> AttrValue {
    AttrValue::Str(String::new())
}

pub(crate) static PROBE_CLASS: ClassDescriptor = ClassDescriptor {
    type_name: "Probe",
    attributes: &[
        AttributeDef {
            name: "roles",
            kind: AttrKind::Roles,
            complain: true,
            notify: false,
            initial_only: false,
            default: default_roles,
        },
        AttributeDef {
            name: "alias",
            kind: AttrKind::Str,
            complain: false,
            notify: false,
            initial_only: false,
            default: default_probe_alias,
        },
    ],
    rpcs: &[],
};

#[derive(Debug)]
pub(crate) struct Probe {
    core: ReplicableCore,
}

impl Replicable for Probe {
    fn core(&self) -> &ReplicableCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ReplicableCore {
        &mut self.core
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub(crate) fn probe(alias: &str) -> ReplicableRef {
    let mut core = ReplicableCore::new(&PROBE_CLASS);
    core.set_attr_named("alias", AttrValue::Str(alias.into()));
    Rc::new(RefCell::new(Probe { core }))
}

// === Worlds === //

pub(crate) fn test_world(netmode: Netmode, tick_rate: u32) -> Rc<World> {
    let world = World::new(netmode, tick_rate);
    world.classes.register(player_class());
    world.classes.register(controller_class());
    world
}

pub(crate) fn server_world() -> Rc<World> {
    test_world(Netmode::Server, 60)
}

pub(crate) fn client_world() -> Rc<World> {
    test_world(Netmode::Client, 60)
}

pub(crate) fn paired_worlds() -> (Rc<World>, Rc<World>) {
    (server_world(), client_world())
}
