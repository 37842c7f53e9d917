use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use bytes::{Buf, Bytes, BytesMut};

use crate::base::{
    net::{self, Packet, PacketCollection, Protocol},
    signal::{ListenerId, Signal, SignalKind},
    world::World,
};

use super::{
    channel::{apply_attributes, invoke_rpc_payload},
    relevant_replicables, Channel, ChannelTable, InstanceId, SweepEntry,
};

// === ClientConnection === //

/// Client-side endpoint state for the connection to the server. Clients
/// flush RPC traffic only; construction, updates and teardown all arrive
/// from the authority.
pub struct ClientConnection {
    world: Rc<World>,
    listener: ListenerId,
    channels: Rc<RefCell<ChannelTable>>,
    /// Our own controller, as announced by the host flag.
    replicable: Rc<Cell<Option<InstanceId>>>,
}

impl ClientConnection {
    pub fn new(world: Rc<World>) -> Self {
        let listener = world.bus.allocate_listener();
        let channels: Rc<RefCell<ChannelTable>> = Rc::default();
        let replicable: Rc<Cell<Option<InstanceId>>> = Rc::default();

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
            world.bus.subscribe(
                SignalKind::ReplicableUnregistered,
                listener,
                move |signal, _| {
                    let Signal::ReplicableUnregistered { replicable } = signal else {
                        return;
                    };
                    if let Some(id) = replicable.borrow().core().instance_id() {
                        channels.borrow_mut().remove(id);
                    }
                },
            );
        }

        // Disconnect cleanup mirrors the server side.
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
        }
    }

    pub fn listener(&self) -> ListenerId {
        self.listener
    }

    /// The replicable the server marked as this connection's host object.
    pub fn replicable(&self) -> Option<InstanceId> {
        self.replicable.get()
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

    /// Flush queued RPC calls for objects this client owns, highest
    /// declared priority first. Clients never emit replication traffic.
    pub fn send(&mut self, _network_tick: bool, _available_bandwidth: usize) -> PacketCollection {
        let own = self.replicable.get();
        let mut collection = PacketCollection::new();

        let mut keyed: Vec<(f32, SweepEntry)> = relevant_replicables(&self.world, own)
            .into_iter()
            .map(|entry| {
                let priority = entry.replicable.borrow().core().replication_priority;
                (priority, entry)
            })
            .collect();
        keyed.sort_by(|a, b| b.0.total_cmp(&a.0));

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

        collection
    }

    // === Receive === //

    /// Dispatch inbound packets: construction, updates, teardown and RPC
    /// invocations. Unknown types and ids are logged and dropped, never
    /// fatal.
    pub fn receive(&mut self, packets: impl IntoIterator<Item = Packet>) -> anyhow::Result<()> {
        for packet in packets {
            match packet.protocol {
                Protocol::ReplicationInit => self.handle_init(packet.payload)?,
                Protocol::ReplicationUpdate => self.handle_update(packet.payload)?,
                Protocol::ReplicationDel => self.handle_del(packet.payload)?,
                Protocol::MethodInvoke => self.handle_invoke(packet.payload)?,
            }
        }

        self.world.bus.update_graph();
        Ok(())
    }

    fn handle_init(&mut self, mut payload: Bytes) -> anyhow::Result<()> {
        let id = net::get_id(&mut payload)?;
        let type_name = net::get_string(&mut payload)?;
        anyhow::ensure!(payload.remaining() >= 1, "truncated construction packet");
        let is_host = payload.get_u8() != 0;

        let Some(class) = self.world.classes.get(&type_name) else {
            tracing::warn!("dropping construction of unknown type {type_name:?}");
            return Ok(());
        };

        let replicable = self.world.registry.create_or_return(class, id)?;

        // The declared role pair swaps to the receiving side's view, once
        // per instance: redundant inits are idempotent.
        {
            let mut borrowed = replicable.borrow_mut();
            let core = borrowed.core_mut();
            if !core.is_net_initialized() {
                let roles = core.roles();
                core.set_roles(roles.swapped());
                core.mark_net_initialized();
            }
        }

        if is_host {
            self.replicable.set(Some(id));
        }

        Ok(())
    }

    fn handle_update(&mut self, mut payload: Bytes) -> anyhow::Result<()> {
        let id = net::get_id(&mut payload)?;

        let Some(replicable) = self.channel_replicable(id) else {
            tracing::warn!("dropping update for unknown instance {id}");
            return Ok(());
        };

        apply_attributes(&self.world, &replicable, payload)
    }

    fn handle_del(&mut self, mut payload: Bytes) -> anyhow::Result<()> {
        let id = net::get_id(&mut payload)?;

        let Some(replicable) = self.world.registry.lookup(id) else {
            tracing::debug!("teardown for unknown instance {id}");
            return Ok(());
        };

        if let Err(err) = self.world.registry.unregister(&replicable) {
            tracing::warn!("failed to tear down instance {id}: {err}");
        }
        Ok(())
    }

    fn handle_invoke(&mut self, mut payload: Bytes) -> anyhow::Result<()> {
        let id = net::get_id(&mut payload)?;

        let Some(replicable) = self.channel_replicable(id) else {
            tracing::warn!("dropping rpc for unknown instance {id}");
            return Ok(());
        };

        if !self.is_owner(id) {
            tracing::warn!("dropping rpc for instance {id}: we do not own it");
            return Ok(());
        }

        invoke_rpc_payload(&self.world, &replicable, payload)
    }

    /// Clone out the channel's replicable so no table borrow is held while
    /// listeners run.
    fn channel_replicable(&self, id: InstanceId) -> Option<super::ReplicableRef> {
        self.channels
            .borrow()
            .get(id)
            .map(|channel| channel.replicable().clone())
    }
}

// === Tests === //
