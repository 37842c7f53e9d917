use bytes::{Bytes, BytesMut};
use smallvec::SmallVec;

use crate::base::{
    net::{self, get_handler, get_varint, put_varint, AttrValue},
    signal::Signal,
    world::World,
};

use super::{InstanceId, ReplicableRef};

// === Channel === //

/// Replication state for one replicable on one connection: last-sent
/// snapshots for diffing, the initial-construction flag and the cached
/// packed id.
#[derive(Debug)]
pub struct Channel {
    replicable: ReplicableRef,
    instance_id: InstanceId,
    packed_id: Bytes,
    last_sent: Vec<Option<AttrValue>>,
    /// `f64::NEG_INFINITY` until the first successful replication, so new
    /// channels pass every staleness gate.
    pub(crate) last_replication_time: f64,
    pub(crate) is_initial: bool,
}

/// A diffed attribute payload that has not yet been applied to channel
/// state. An over-budget update is simply dropped and the complaint bits
/// survive for the next tick.
#[derive(Debug)]
pub struct PendingUpdate {
    payload: Bytes,
    considered: SmallVec<[usize; 8]>,
    changed: SmallVec<[usize; 8]>,
}

impl PendingUpdate {
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn wire_len(&self) -> usize {
        self.payload.len()
    }
}

impl Channel {
    pub fn new(replicable: ReplicableRef) -> Self {
        let (instance_id, attr_count) = {
            let borrowed = replicable.borrow();
            let core = borrowed.core();
            (
                core.instance_id()
                    .expect("cannot open a channel for an unregistered replicable"),
                core.class().attributes.len(),
            )
        };

        let mut packed_id = BytesMut::with_capacity(2);
        net::put_id(&mut packed_id, instance_id);

        Self {
            replicable,
            instance_id,
            packed_id: packed_id.freeze(),
            last_sent: vec![None; attr_count],
            last_replication_time: f64::NEG_INFINITY,
            is_initial: true,
        }
    }

    pub fn replicable(&self) -> &ReplicableRef {
        &self.replicable
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn packed_id(&self) -> Bytes {
        self.packed_id.clone()
    }

    pub fn is_initial(&self) -> bool {
        self.is_initial
    }

    // === Outbound === //

    /// Evaluate the condition set and diff each eligible attribute against
    /// the last-sent snapshot. Returns `None` when nothing changed.
    /// Channel state is untouched until `commit_update`.
    pub fn build_update(&self, is_owner: bool) -> Option<PendingUpdate> {
        let borrowed = self.replicable.borrow();
        let core = borrowed.core();
        let class = core.class();

        let names = borrowed.conditions(is_owner, core.has_complaints(), self.is_initial);

        let mut considered: SmallVec<[usize; 8]> = SmallVec::new();
        let mut changed: SmallVec<[usize; 8]> = SmallVec::new();

        for name in names {
            let Some(index) = class.attr_index(name) else {
                tracing::warn!(
                    "{} names unknown attribute {name:?} in its conditions",
                    class.type_name
                );
                continue;
            };
            if class.attributes[index].initial_only && !self.is_initial {
                continue;
            }
            if considered.contains(&index) {
                continue;
            }
            considered.push(index);

            if self.last_sent[index].as_ref() != Some(core.get_attr(index)) {
                changed.push(index);
            }
        }

        if changed.is_empty() {
            return None;
        }

        let mut payload = BytesMut::new();
        put_varint(&mut payload, changed.len() as u64);
        for &index in &changed {
            put_varint(&mut payload, index as u64);
            get_handler(class.attributes[index].kind).pack(core.get_attr(index), &mut payload);
        }

        Some(PendingUpdate {
            payload: payload.freeze(),
            considered,
            changed,
        })
    }

    /// Apply a sent update: snapshot the transmitted values, clear the
    /// complaint bits of everything considered, and leave the initial
    /// state.
    pub fn commit_update(&mut self, update: &PendingUpdate) {
        let mut borrowed = self.replicable.borrow_mut();
        let core = borrowed.core_mut();

        for &index in &update.changed {
            self.last_sent[index] = Some(core.get_attr(index).clone());
        }
        for &index in &update.considered {
            core.clear_complaint(index);
        }

        self.is_initial = false;
    }

    /// Leave the initial state without an attribute payload (the
    /// construction packet alone carried everything there was).
    pub fn mark_initialized(&mut self) {
        self.is_initial = false;
    }

    pub fn has_rpc_calls(&self) -> bool {
        self.replicable.borrow().core().has_rpc_calls()
    }

    /// Drain the queued outbound RPC calls as `(serialized, reliable)`
    /// pairs, oldest first.
    pub fn take_rpc_calls(&mut self) -> Vec<(Bytes, bool)> {
        self.replicable.borrow_mut().core_mut().drain_rpc_calls()
    }

    // === Inbound === //

    /// Write a decoded attribute payload through the descriptors, firing
    /// notifications for observed attributes.
    pub fn set_attributes(&self, world: &World, payload: Bytes) -> anyhow::Result<()> {
        apply_attributes(world, &self.replicable, payload)
    }

    /// Decode and run an inbound RPC. The caller has already established
    /// that the sending connection owns this object.
    pub fn invoke_rpc_call(&self, world: &World, payload: Bytes) -> anyhow::Result<()> {
        invoke_rpc_payload(world, &self.replicable, payload)
    }
}

// === Inbound helpers === //

/// `set_attributes` on a bare replicable reference; connections use this
/// so no channel-table borrow is held while listeners run.
pub(crate) fn apply_attributes(
    world: &World,
    replicable: &ReplicableRef,
    mut payload: Bytes,
) -> anyhow::Result<()> {
    let mut notified: SmallVec<[&'static str; 4]> = SmallVec::new();
    let listener;

    {
        let mut borrowed = replicable.borrow_mut();
        let class = borrowed.class();
        let count = get_varint(&mut payload)? as usize;

        for _ in 0..count {
            let index = get_varint(&mut payload)? as usize;
            let Some(def) = class.attributes.get(index) else {
                anyhow::bail!(
                    "attribute index {index} out of range for {}",
                    class.type_name
                );
            };

            let value = get_handler(def.kind).unpack(&mut payload)?;
            borrowed.core_mut().set_attr_from_net(index, value);

            if def.notify {
                notified.push(def.name);
            }
        }

        for &name in &notified {
            borrowed.on_notify(name);
        }

        listener = borrowed.core().listener();
    }

    for name in notified {
        world.bus.fire(
            Signal::ReplicationNotify {
                replicable: replicable.clone(),
                attr: name,
            },
            listener,
        );
    }

    Ok(())
}

/// `invoke_rpc_call` on a bare replicable reference.
pub(crate) fn invoke_rpc_payload(
    world: &World,
    replicable: &ReplicableRef,
    mut payload: Bytes,
) -> anyhow::Result<()> {
    let index = get_varint(&mut payload)? as usize;

    let mut borrowed = replicable.borrow_mut();
    let class = borrowed.class();

    let Some(def) = class.rpcs.get(index) else {
        anyhow::bail!("{} has no rpc at index {index}", class.type_name);
    };

    if def.target != world.netmode {
        tracing::warn!(
            "dropping rpc {}.{}: destined for {:?}, we are {:?}",
            class.type_name,
            def.name,
            def.target,
            world.netmode
        );
        return Ok(());
    }

    // The same role gate as local invocation; the owner check upstream
    // does not replace it.
    if !def.may_execute(borrowed.core().roles().local) {
        tracing::debug!(
            "dropping rpc {}.{}: insufficient local role",
            class.type_name,
            def.name
        );
        return Ok(());
    }

    let mut args = Vec::with_capacity(def.signature.len());
    for kind in def.signature {
        args.push(get_handler(*kind).unpack(&mut payload)?);
    }

    borrowed.invoke_rpc(index, &args)
}

// === Tests === //
