use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use bytes::{BufMut, Bytes, BytesMut};

use crate::base::{
    net::{self, Packet, PacketCollection, Protocol},
    signal::{ListenerId, Signal, SignalKind},
    world::World,
};

use super::{
    channel::invoke_rpc_payload, relevant_replicables, Channel, ChannelTable, InstanceId,
    SweepEntry,
};

// === ServerConnection === //

/// Server-side endpoint state for one remote peer: its channel table, the
/// peer's own controller object and the per-tick scheduler.
pub struct ServerConnection {
    world: Rc<World>,
    listener: ListenerId,
    channels: Rc<RefCell<ChannelTable>>,
    /// The peer's controller. Ownership checks resolve against it.
    replicable: Rc<Cell<Option<InstanceId>>>,
    /// Reliable teardown packets awaiting the next send pass.
    cached_packets: Rc<RefCell<Vec<Packet>>>,
}

impl ServerConnection {
    pub fn new(world: Rc<World>) -> Self {
        let listener = world.bus.allocate_listener();
        let channels: Rc<RefCell<ChannelTable>> = Rc::default();
        let replicable: Rc<Cell<Option<InstanceId>>> = Rc::default();
        let cached_packets: Rc<RefCell<Vec<Packet>>> = Rc::default();

        // One channel per live replicable; the cached registration signal
        // replays the graph that existed before this peer connected.
        {
            let channels = Rc::clone(&channels);
            world.bus.subscribe(
                SignalKind::ReplicableRegistered,
                listener,
                move |signal, _| {
                    let Signal::ReplicableRegistered { replicable } = signal else {
                        return;
                    };
                    channels.borrow_mut().insert(Channel::new(replicable.clone()));
                },
            );
        }

        {
            let channels = Rc::clone(&channels);
            let cached_packets = Rc::clone(&cached_packets);
            world.bus.subscribe(
                SignalKind::ReplicableUnregistered,
                listener,
                move |signal, _| {
                    let Signal::ReplicableUnregistered { replicable } = signal else {
                        return;
                    };
                    let Some(id) = replicable.borrow().core().instance_id() else {
                        return;
                    };
                    let Some(channel) = channels.borrow_mut().remove(id) else {
                        return;
                    };

                    // Teardown is always reliable.
                    cached_packets.borrow_mut().push(Packet::new(
                        Protocol::ReplicationDel,
                        channel.packed_id(),
                        true,
                    ));
                },
            );
        }

        // Peer teardown: the controller dies with its connection.
        {
            let world_handle = Rc::clone(&world);
            let replicable = Rc::clone(&replicable);
            world.bus.subscribe_targeted(
                SignalKind::ConnectionDeleted,
                listener,
                move |_, _| {
                    let Some(id) = replicable.take() else {
                        return;
                    };
                    if let Some(obj) = world_handle.registry.lookup(id) {
                        if let Err(err) = world_handle.registry.unregister(&obj) {
                            tracing::warn!("failed to drop controller {id}: {err}");
                        }
                    }
                },
            );
        }

        world.bus.update_graph();

        Self {
            world,
            listener,
            channels,
            replicable,
            cached_packets,
        }
    }

    pub fn listener(&self) -> ListenerId {
        self.listener
    }

    pub fn replicable(&self) -> Option<InstanceId> {
        self.replicable.get()
    }

    /// Assign the peer's controller object.
    pub fn set_replicable(&self, id: Option<InstanceId>) {
        self.replicable.set(id);
    }

    pub fn has_channel(&self, id: InstanceId) -> bool {
        self.channels.borrow().contains(id)
    }

    fn is_owner(&self, id: InstanceId) -> bool {
        match (self.world.registry.uppermost_owner(id), self.replicable.get()) {
            (Some(top), Some(own)) => top == own,
            _ => false,
        }
    }

    // === Send === //

    /// Produce this tick's packets: queued teardown first, then RPC
    /// drains, then — on a network tick — prioritised attribute
    /// replication under the bandwidth budget.
    pub fn send(&mut self, network_tick: bool, available_bandwidth: usize) -> PacketCollection {
        let world = Rc::clone(&self.world);
        let now = world.elapsed();
        let own = self.replicable.get();

        let mut collection = PacketCollection::new();
        for packet in self.cached_packets.borrow_mut().drain(..) {
            collection.push(packet);
        }

        // Stale channels climb above their base priority.
        let entries = relevant_replicables(&world, own);
        let mut keyed: Vec<(f64, SweepEntry)> = {
            let channels = self.channels.borrow();
            entries
                .into_iter()
                .filter_map(|entry| {
                    let Some(channel) = channels.get(entry.id) else {
                        tracing::warn!("no channel for live replicable {}", entry.id);
                        return None;
                    };

                    let core = entry.replicable.borrow();
                    let interval = now - channel.last_replication_time;
                    let period = core.core().replication_update_period.max(f64::EPSILON);
                    let priority =
                        core.core().replication_priority as f64 + (interval / period - 1.0);
                    drop(core);

                    Some((priority, entry))
                })
                .collect()
        };
        keyed.sort_by(|a, b| b.0.total_cmp(&a.0));

        // RPC calls flush first and are not gated by the budget.
        {
            let mut channels = self.channels.borrow_mut();
            for (_, entry) in &keyed {
                if !entry.is_owner {
                    continue;
                }
                let Some(channel) = channels.get_mut(entry.id) else {
                    continue;
                };
                if !channel.has_rpc_calls() {
                    continue;
                }

                let packed_id = channel.packed_id();
                for (call, reliable) in channel.take_rpc_calls() {
                    let mut payload = BytesMut::with_capacity(packed_id.len() + call.len());
                    payload.extend_from_slice(&packed_id);
                    payload.extend_from_slice(&call);
                    collection.push(Packet::new(Protocol::MethodInvoke, payload.freeze(), reliable));
                }
            }
        }

        if !network_tick {
            return collection;
        }

        let viewer = own.and_then(|id| world.registry.lookup(id));
        let mut used = collection.size();

        for (_, entry) in &keyed {
            if used >= available_bandwidth {
                // Budget exhausted; the rest keep their complaint and RPC
                // state and roll over to the next tick.
                break;
            }

            let (last_time, was_initial) = {
                let channels = self.channels.borrow();
                let Some(channel) = channels.get(entry.id) else {
                    continue;
                };
                (channel.last_replication_time, channel.is_initial())
            };

            let period = entry.replicable.borrow().core().replication_update_period;
            if now - last_time < period {
                continue;
            }

            if !entry.is_owner && !world.is_relevant(viewer.as_ref(), &entry.replicable) {
                continue;
            }

            let mut channels = self.channels.borrow_mut();
            let Some(channel) = channels.get_mut(entry.id) else {
                continue;
            };

            let update = channel.build_update(entry.is_owner);

            if was_initial {
                // Construction packet, front-inserted so references to this
                // object resolve anywhere in the collection. Never skipped
                // once this object's turn has started.
                let type_name = entry.replicable.borrow().class().type_name;
                let mut payload = BytesMut::new();
                payload.extend_from_slice(&channel.packed_id());
                net::put_string(&mut payload, type_name);
                payload.put_u8(u8::from(own == Some(entry.id)));

                let packet = Packet::new(Protocol::ReplicationInit, payload.freeze(), true);
                used += packet.size();
                collection.push_front(packet);
            }

            if let Some(update) = update {
                let mut payload =
                    BytesMut::with_capacity(2 + update.wire_len());
                payload.extend_from_slice(&channel.packed_id());
                payload.extend_from_slice(update.payload());

                let packet = Packet::new(Protocol::ReplicationUpdate, payload.freeze(), true);

                // The first update travels with its construction packet
                // regardless of budget; later ones must fit.
                if was_initial || used + packet.size() <= available_bandwidth {
                    used += packet.size();
                    channel.commit_update(&update);
                    channel.last_replication_time = now;
                    collection.push(packet);
                }
            } else if was_initial {
                channel.mark_initialized();
                channel.last_replication_time = now;
            }
        }

        collection
    }

    // === Receive === //

    /// Dispatch inbound packets. The server accepts only RPC invocations;
    /// unknown ids and non-owner calls are logged and dropped.
    pub fn receive(&mut self, packets: impl IntoIterator<Item = Packet>) -> anyhow::Result<()> {
        for packet in packets {
            match packet.protocol {
                Protocol::MethodInvoke => self.receive_invoke(packet.payload)?,
                other => {
                    tracing::warn!("dropping {other:?} packet: not accepted by the server");
                }
            }
        }

        self.world.bus.update_graph();
        Ok(())
    }

    fn receive_invoke(&mut self, mut payload: Bytes) -> anyhow::Result<()> {
        let id = net::get_id(&mut payload)?;

        let replicable = {
            let channels = self.channels.borrow();
            let Some(channel) = channels.get(id) else {
                tracing::warn!("dropping rpc for unknown instance {id}");
                return Ok(());
            };
            channel.replicable().clone()
        };

        // Only the owning peer may drive this object.
        if !self.is_owner(id) {
            tracing::warn!("dropping rpc for instance {id}: sender is not the owner");
            return Ok(());
        }

        invoke_rpc_payload(&self.world, &replicable, payload)
    }
}

// === Tests === //
