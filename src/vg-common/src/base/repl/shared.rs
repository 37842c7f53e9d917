use std::fmt;

use rustc_hash::FxHashMap;

use crate::base::world::World;

use super::{Channel, ReplicableRef};

// === Identity === //

/// Network identity of a replicable, unique within one process's graph.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct InstanceId(pub u16);

impl InstanceId {
    /// Wire encoding of a null replicable reference. Never allocated.
    pub const NULL_BITS: u16 = u16::MAX;
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// === Netmode === //

/// Role of the local process.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq)]
pub enum Netmode {
    Server,
    Client,
}

// === Roles === //

/// What one side of the wire may do to an object, in increasing order of
/// privilege.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum Role {
    None = 0,
    DumbProxy = 1,
    SimulatedProxy = 2,
    AutonomousProxy = 3,
    Authority = 4,
}

impl Role {
    pub fn from_u8(value: u8) -> Option<Role> {
        Some(match value {
            0 => Role::None,
            1 => Role::DumbProxy,
            2 => Role::SimulatedProxy,
            3 => Role::AutonomousProxy,
            4 => Role::Authority,
            _ => return None,
        })
    }
}

/// The `(local, remote)` role pair of a replicable. The pair is declared
/// from the authority's point of view; the receiving side stores the
/// swapped pair.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq)]
pub struct Roles {
    pub local: Role,
    pub remote: Role,
}

impl Roles {
    pub const fn new(local: Role, remote: Role) -> Self {
        Self { local, remote }
    }

    /// The same pair seen from the other end of the wire.
    pub const fn swapped(self) -> Self {
        Self {
            local: self.remote,
            remote: self.local,
        }
    }
}

// === Channel table === //

/// The channels of one connection, keyed by instance id. Shared between
/// the connection value and its signal subscriptions.
#[derive(Debug, Default)]
pub struct ChannelTable {
    map: FxHashMap<InstanceId, Channel>,
}

impl ChannelTable {
    pub fn insert(&mut self, channel: Channel) {
        self.map.insert(channel.instance_id(), channel);
    }

    pub fn remove(&mut self, id: InstanceId) -> Option<Channel> {
        self.map.remove(&id)
    }

    pub fn get(&self, id: InstanceId) -> Option<&Channel> {
        self.map.get(&id)
    }

    pub fn get_mut(&mut self, id: InstanceId) -> Option<&mut Channel> {
        self.map.get_mut(&id)
    }

    pub fn contains(&self, id: InstanceId) -> bool {
        self.map.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

// === Relevance sweep === //

/// One candidate of a connection's send sweep.
#[derive(Debug)]
pub(crate) struct SweepEntry {
    pub replicable: ReplicableRef,
    pub id: InstanceId,
    pub is_owner: bool,
}

/// Yield every live replicable the remote side may see, with ownership
/// resolved through the uppermost-owner chain. Objects whose remote role
/// is `None` never source outbound traffic.
pub(crate) fn relevant_replicables(world: &World, own: Option<InstanceId>) -> Vec<SweepEntry> {
    world
        .registry
        .live()
        .into_iter()
        .filter_map(|replicable| {
            let (id, is_owner) = {
                let borrowed = replicable.borrow();
                let core = borrowed.core();

                if core.roles().remote == Role::None {
                    return None;
                }

                let id = core.instance_id()?;
                let top = world.registry.uppermost_owner(id);
                let is_owner = match (top, own) {
                    (Some(top), Some(own)) => top == own,
                    _ => false,
                };

                (id, is_owner && core.relevant_to_owner)
            };

            Some(SweepEntry {
                replicable,
                id,
                is_owner,
            })
        })
        .collect()
}
