use anyhow::Context as _;
use bytes::{Buf, BufMut, Bytes, BytesMut};

// === Protocol === //

/// Wire protocol of a single packet.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq)]
pub enum Protocol {
    ReplicationInit = 1,
    ReplicationUpdate = 2,
    ReplicationDel = 3,
    MethodInvoke = 4,
}

impl Protocol {
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Protocol> {
        Some(match value {
            1 => Protocol::ReplicationInit,
            2 => Protocol::ReplicationUpdate,
            3 => Protocol::ReplicationDel,
            4 => Protocol::MethodInvoke,
            _ => return None,
        })
    }
}

// === Packet === //

/// One framed message: protocol tag, opaque payload and reliability flag.
/// The transport carries the reliability flag out of band.
#[derive(Debug, Clone)]
pub struct Packet {
    pub protocol: Protocol,
    pub payload: Bytes,
    pub reliable: bool,
}

impl Packet {
    pub fn new(protocol: Protocol, payload: Bytes, reliable: bool) -> Self {
        Self {
            protocol,
            payload,
            reliable,
        }
    }

    /// Size charged against the bandwidth budget: tag byte plus payload.
    pub fn size(&self) -> usize {
        1 + self.payload.len()
    }

    /// Frame for the transport: tag byte followed by the payload.
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.size());
        out.put_u8(self.protocol.code());
        out.extend_from_slice(&self.payload);
        out.freeze()
    }

    pub fn decode(mut framed: Bytes, reliable: bool) -> anyhow::Result<Packet> {
        anyhow::ensure!(!framed.is_empty(), "empty packet frame");

        let tag = framed.get_u8();
        let protocol =
            Protocol::from_u8(tag).with_context(|| format!("unknown protocol tag {tag}"))?;

        Ok(Packet {
            protocol,
            payload: framed,
            reliable,
        })
    }
}

// === PacketCollection === //

/// Packets emitted together by one send pass. Construction packets are
/// inserted at the front so every reference they introduce resolves before
/// the packets that use it.
#[derive(Debug, Default)]
pub struct PacketCollection {
    pub members: Vec<Packet>,
}

impl PacketCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, packet: Packet) {
        self.members.push(packet);
    }

    pub fn push_front(&mut self, packet: Packet) {
        self.members.insert(0, packet);
    }

    pub fn size(&self) -> usize {
        self.members.iter().map(Packet::size).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

// === Tests === //

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_round_trip() {
        let packet = Packet::new(
            Protocol::MethodInvoke,
            Bytes::from_static(&[1, 2, 3]),
            true,
        );

        let back = Packet::decode(packet.encode(), true).unwrap();

        assert_eq!(back.protocol, Protocol::MethodInvoke);
        assert_eq!(&back.payload[..], &[1, 2, 3]);
        assert!(back.reliable);
    }

    #[test]
    fn decode_rejects_unknown_tag() {
        assert!(Packet::decode(Bytes::from_static(&[99]), false).is_err());
        assert!(Packet::decode(Bytes::new(), false).is_err());
    }

    #[test]
    fn front_insertion_precedes_existing_members() {
        let mut collection = PacketCollection::new();
        collection.push(Packet::new(Protocol::ReplicationUpdate, Bytes::new(), true));
        collection.push_front(Packet::new(Protocol::ReplicationInit, Bytes::new(), true));

        assert_eq!(collection.members[0].protocol, Protocol::ReplicationInit);
        assert_eq!(collection.members[1].protocol, Protocol::ReplicationUpdate);
        assert_eq!(collection.size(), 2);
    }
}
