use std::{
    rc::Rc,
    thread,
    time::{Duration, Instant},
};

use vg_common::base::{
    net::{Packet, PacketCollection, PacketSink, PacketSource},
    repl::{ClientConnection, ServerConnection},
    signal::Signal,
    world::World,
};

// === Endpoint === //

/// The connection surface the pump drives, implemented by both endpoint
/// variants.
pub trait Endpoint {
    fn send(&mut self, network_tick: bool, available_bandwidth: usize) -> PacketCollection;

    fn receive(&mut self, packets: Vec<Packet>) -> anyhow::Result<()>;
}

impl Endpoint for ServerConnection {
    fn send(&mut self, network_tick: bool, available_bandwidth: usize) -> PacketCollection {
        ServerConnection::send(self, network_tick, available_bandwidth)
    }

    fn receive(&mut self, packets: Vec<Packet>) -> anyhow::Result<()> {
        ServerConnection::receive(self, packets)
    }
}

impl Endpoint for ClientConnection {
    fn send(&mut self, network_tick: bool, available_bandwidth: usize) -> PacketCollection {
        ClientConnection::send(self, network_tick, available_bandwidth)
    }

    fn receive(&mut self, packets: Vec<Packet>) -> anyhow::Result<()> {
        ClientConnection::receive(self, packets)
    }
}

// === Ticker === //

/// Fixed-timestep pacing for a headless peer.
#[derive(Debug)]
pub struct Ticker {
    last: Instant,
    dt: Duration,
}

impl Ticker {
    pub fn new(dt: Duration) -> Self {
        Self {
            last: Instant::now(),
            dt,
        }
    }

    pub fn from_tick_rate(tick_rate: u32) -> Self {
        Self::new(Duration::from_secs_f64(1.0 / tick_rate.max(1) as f64))
    }

    pub fn dt(&self) -> Duration {
        self.dt
    }

    /// Sleep out the remainder of the current tick and return the actual
    /// elapsed time since the previous one.
    pub fn wait(&mut self) -> f32 {
        let target = self.last + self.dt;
        let now = Instant::now();
        if target > now {
            thread::sleep(target - now);
        }

        let now = Instant::now();
        let delta = now - self.last;
        self.last = now;
        delta.as_secs_f32()
    }
}

// === SimHost === //

/// One peer's per-tick pump: drain the transport into the connection, run
/// the graph barrier, fire the tick signals, then flush outbound packets.
pub struct SimHost<E> {
    world: Rc<World>,
    connection: E,
    available_bandwidth: usize,
}

impl<E: Endpoint> SimHost<E> {
    pub fn new(world: Rc<World>, connection: E, available_bandwidth: usize) -> Self {
        Self {
            world,
            connection,
            available_bandwidth,
        }
    }

    pub fn world(&self) -> &Rc<World> {
        &self.world
    }

    pub fn connection(&self) -> &E {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut E {
        &mut self.connection
    }

    pub fn pump(
        &mut self,
        transport: &mut (impl PacketSink + PacketSource),
        delta: f32,
        network_tick: bool,
    ) -> anyhow::Result<()> {
        let mut packets = Vec::new();
        while let Some((framed, reliable)) = transport.poll() {
            packets.push(Packet::decode(framed, reliable)?);
        }
        if !packets.is_empty() {
            self.connection.receive(packets)?;
        }
        self.world.bus.update_graph();

        self.world.advance(delta);
        self.world.bus.fire(Signal::Tick { delta }, None);
        self.world.bus.fire(Signal::PhysicsTick { delta }, None);

        let collection = self.connection.send(network_tick, self.available_bandwidth);
        for packet in collection.members {
            let framed = packet.encode();
            transport.send(framed, packet.reliable);
        }

        Ok(())
    }
}

// === Tests === //
