use std::{any::Any, cell::RefCell, collections::VecDeque, fmt, rc::Rc};

use bytes::{Bytes, BytesMut};
use smallvec::SmallVec;

use crate::base::{
    net::{get_handler, put_varint, AttrKind, AttrValue},
    signal::ListenerId,
};

use super::{InstanceId, Netmode, Role, Roles};

pub const DEFAULT_REPLICATION_PRIORITY: f32 = 1.0;
pub const DEFAULT_UPDATE_PERIOD: f64 = 1.0 / 20.0;

// === Class shape === //

/// One declared attribute. `complain` marks a sticky dirty bit that forces
/// reconsideration at the next eligible send; `notify` invokes the
/// observer on remote writes; `initial_only` attributes ride only the
/// first packet of a channel. `default` is evaluated per instance so no
/// state leaks between objects.
#[derive(Debug, Copy, Clone)]
pub struct AttributeDef {
    pub name: &'static str,
    pub kind: AttrKind,
    pub complain: bool,
    pub notify: bool,
    pub initial_only: bool,
    pub default: fn() -> AttrValue,
}

/// One declared remote procedure. `target` is the netmode the body runs
/// on; `simulated` additionally admits execution on simulated proxies.
#[derive(Debug, Copy, Clone)]
pub struct RpcDef {
    pub name: &'static str,
    pub target: Netmode,
    pub reliable: bool,
    pub simulated: bool,
    pub signature: &'static [AttrKind],
}

impl RpcDef {
    /// Role gate for running the body, whatever the call origin: roles
    /// above `SimulatedProxy` run anything, simulated proxies only
    /// simulated procedures.
    pub fn may_execute(&self, local: Role) -> bool {
        local > Role::SimulatedProxy || (self.simulated && local == Role::SimulatedProxy)
    }
}

/// Static shape of a replicable class. Attribute and RPC declaration
/// order is the canonical wire order; indices are positional.
#[derive(Debug)]
pub struct ClassDescriptor {
    pub type_name: &'static str,
    pub attributes: &'static [AttributeDef],
    pub rpcs: &'static [RpcDef],
}

impl ClassDescriptor {
    pub fn attr_index(&self, name: &str) -> Option<usize> {
        self.attributes.iter().position(|def| def.name == name)
    }

    pub fn rpc_index(&self, name: &str) -> Option<usize> {
        self.rpcs.iter().position(|def| def.name == name)
    }
}

// === Instance state === //

/// Per-instance replication state: identity, ownership, the attribute
/// store, complaint bits and the outbound RPC buffer. Every replicable
/// embeds one.
#[derive(Debug)]
pub struct ReplicableCore {
    class: &'static ClassDescriptor,
    roles_index: usize,

    instance_id: Option<InstanceId>,
    listener: Option<ListenerId>,
    is_static: bool,
    local_authority: bool,
    registered: bool,
    retired: bool,
    net_initialized: bool,

    owner: Option<InstanceId>,
    pub relevant_to_owner: bool,
    pub replication_priority: f32,
    pub replication_update_period: f64,

    attrs: Vec<AttrValue>,
    complaints: u64,
    rpc_calls: VecDeque<(Bytes, bool)>,
}

impl ReplicableCore {
    pub fn new(class: &'static ClassDescriptor) -> Self {
        assert!(
            class.attributes.len() <= 64,
            "{} declares more than 64 attributes",
            class.type_name
        );
        let roles_index = class
            .attr_index("roles")
            .unwrap_or_else(|| panic!("{} does not declare a roles attribute", class.type_name));

        let attrs: Vec<AttrValue> = class.attributes.iter().map(|def| (def.default)()).collect();
        for (def, value) in class.attributes.iter().zip(&attrs) {
            debug_assert_eq!(
                def.kind,
                value.kind(),
                "default for {}.{} has the wrong kind",
                class.type_name,
                def.name
            );
        }

        Self {
            class,
            roles_index,
            instance_id: None,
            listener: None,
            is_static: false,
            local_authority: false,
            registered: false,
            retired: false,
            net_initialized: false,
            owner: None,
            relevant_to_owner: true,
            replication_priority: DEFAULT_REPLICATION_PRIORITY,
            replication_update_period: DEFAULT_UPDATE_PERIOD,
            attrs,
            complaints: 0,
            rpc_calls: VecDeque::new(),
        }
    }

    pub fn class(&self) -> &'static ClassDescriptor {
        self.class
    }

    /// The last assigned network identity. Retained after unregistration
    /// so teardown paths can still name the object.
    pub fn instance_id(&self) -> Option<InstanceId> {
        self.instance_id
    }

    pub fn listener(&self) -> Option<ListenerId> {
        self.listener
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn is_retired(&self) -> bool {
        self.retired
    }

    /// Whether this instance was created with a caller-chosen id that
    /// survives authority transfer.
    pub fn is_static(&self) -> bool {
        self.is_static
    }

    /// Whether the id was allocated locally; such instances yield their id
    /// when a peer claims it with authority.
    pub fn has_local_authority(&self) -> bool {
        self.local_authority
    }

    /// Whether a construction packet has already been applied to this
    /// instance. Guards the one-time role swap against redundant inits.
    pub fn is_net_initialized(&self) -> bool {
        self.net_initialized
    }

    pub(crate) fn mark_net_initialized(&mut self) {
        self.net_initialized = true;
    }

    pub fn roles(&self) -> Roles {
        match &self.attrs[self.roles_index] {
            AttrValue::Roles(roles) => *roles,
            other => panic!("roles attribute holds {other:?}"),
        }
    }

    pub fn set_roles(&mut self, roles: Roles) {
        self.set_attr(self.roles_index, AttrValue::Roles(roles));
    }

    pub fn owner(&self) -> Option<InstanceId> {
        self.owner
    }

    /// Take or release possession. The back-edge is an id, resolved
    /// through the registry, so ownership cycles cannot leak.
    pub fn set_owner(&mut self, owner: Option<InstanceId>) {
        self.owner = owner;
    }

    pub fn get_attr(&self, index: usize) -> &AttrValue {
        &self.attrs[index]
    }

    pub fn attr(&self, name: &str) -> Option<&AttrValue> {
        self.class.attr_index(name).map(|index| &self.attrs[index])
    }

    /// Write through the descriptor: records the value and raises the
    /// complaint bit for complaining attributes.
    pub fn set_attr(&mut self, index: usize, value: AttrValue) {
        let def = &self.class.attributes[index];
        assert_eq!(
            def.kind,
            value.kind(),
            "wrong kind for {}.{}",
            self.class.type_name,
            def.name
        );

        self.attrs[index] = value;
        if def.complain {
            self.complaints |= 1 << index;
        }
    }

    pub fn set_attr_named(&mut self, name: &str, value: AttrValue) {
        let index = self
            .class
            .attr_index(name)
            .unwrap_or_else(|| panic!("{} has no attribute {name}", self.class.type_name));
        self.set_attr(index, value);
    }

    /// Network write: stores without complaining, so an echo of a remote
    /// value does not bounce back.
    pub(crate) fn set_attr_from_net(&mut self, index: usize, value: AttrValue) {
        let def = &self.class.attributes[index];
        debug_assert_eq!(def.kind, value.kind());
        self.attrs[index] = value;
    }

    pub fn has_complaints(&self) -> bool {
        self.complaints != 0
    }

    pub fn complains_about(&self, index: usize) -> bool {
        self.complaints & (1 << index) != 0
    }

    pub(crate) fn clear_complaint(&mut self, index: usize) {
        self.complaints &= !(1 << index);
    }

    pub(crate) fn queue_rpc(&mut self, call: Bytes, reliable: bool) {
        self.rpc_calls.push_back((call, reliable));
    }

    pub(crate) fn has_rpc_calls(&self) -> bool {
        !self.rpc_calls.is_empty()
    }

    pub(crate) fn drain_rpc_calls(&mut self) -> Vec<(Bytes, bool)> {
        self.rpc_calls.drain(..).collect()
    }

    pub(crate) fn assign_identity(
        &mut self,
        id: InstanceId,
        listener: ListenerId,
        is_static: bool,
        local_authority: bool,
    ) {
        self.instance_id = Some(id);
        self.listener.get_or_insert(listener);
        self.is_static = is_static;
        self.local_authority = local_authority;
        self.registered = true;
    }

    /// Identity reconciliation: the object keeps living under a fresh id.
    pub(crate) fn reassign_identity(&mut self, id: InstanceId) {
        self.instance_id = Some(id);
    }

    pub(crate) fn mark_unregistered(&mut self) {
        self.registered = false;
        self.retired = true;
    }
}

// === Replicable === //

/// A uniquely identified object that may expose attributes and RPCs.
pub trait Replicable: Any + fmt::Debug {
    fn core(&self) -> &ReplicableCore;

    fn core_mut(&mut self) -> &mut ReplicableCore;

    fn class(&self) -> &'static ClassDescriptor {
        self.core().class()
    }

    /// Attribute names eligible for this firing; the channel still diffs
    /// each against its last-sent snapshot. The base behaviour replicates
    /// the role pair whenever something complains or the channel is new.
    fn conditions(
        &self,
        _is_owner: bool,
        is_complaint: bool,
        is_initial: bool,
    ) -> SmallVec<[&'static str; 8]> {
        let mut names = SmallVec::new();
        if is_complaint || is_initial {
            names.push("roles");
        }
        names
    }

    /// Observer for notify-flagged attributes written by the network.
    fn on_notify(&mut self, _attr: &'static str) {}

    /// Run the body of the RPC at `index`. Only ever called on the
    /// declared destination netmode, after the owner check.
    fn invoke_rpc(&mut self, index: usize, _args: &[AttrValue]) -> anyhow::Result<()> {
        anyhow::bail!(
            "{} has no body bound for rpc index {index}",
            self.class().type_name
        )
    }

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

pub type ReplicableRef = Rc<RefCell<dyn Replicable>>;

// === Invocation === //

/// Invoke the RPC at `index` on `target`. On the declared destination
/// netmode the body runs immediately (role-gated); everywhere else the
/// bound arguments are serialized and queued for the owning connection.
pub fn call_rpc(
    target: &ReplicableRef,
    netmode: Netmode,
    index: usize,
    args: &[AttrValue],
) -> anyhow::Result<()> {
    let mut obj = target.borrow_mut();
    let class = obj.class();
    let Some(def) = class.rpcs.get(index) else {
        anyhow::bail!("{} has no rpc at index {index}", class.type_name);
    };

    anyhow::ensure!(
        args.len() == def.signature.len()
            && args.iter().zip(def.signature).all(|(a, k)| a.kind() == *k),
        "arguments do not match the signature of {}.{}",
        class.type_name,
        def.name
    );

    if netmode == def.target {
        if def.may_execute(obj.core().roles().local) {
            return obj.invoke_rpc(index, args);
        }
        // Insufficient role; the call is silently discarded, as for any
        // unprivileged proxy.
        return Ok(());
    }

    let mut payload = BytesMut::new();
    put_varint(&mut payload, index as u64);
    for (value, kind) in args.iter().zip(def.signature) {
        get_handler(*kind).pack(value, &mut payload);
    }

    obj.core_mut().queue_rpc(payload.freeze(), def.reliable);
    Ok(())
}

// === Tests === //
