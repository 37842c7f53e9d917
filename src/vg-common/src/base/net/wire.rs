use anyhow::Context as _;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use glam::Vec3;
use varuint::{Deserializable as _, Serializable as _, Varint};

use crate::base::repl::{InstanceId, Role, Roles};

const MAX_VARINT_LEN: usize = 9;

// === Primitives === //

/// All integers on the wire are big-endian; variable quantities use
/// varints.
pub fn put_varint(out: &mut BytesMut, value: u64) {
    let mut buf = [0u8; MAX_VARINT_LEN];
    let len = Varint::<u64>(value)
        .serialize(&mut &mut buf[..])
        .expect("varint buffer too small");

    out.extend_from_slice(&buf[..len]);
}

pub fn get_varint(src: &mut Bytes) -> anyhow::Result<u64> {
    let mut cursor = &src[..];
    let Varint(value) = Varint::<u64>::deserialize(&mut cursor).context("truncated varint")?;

    let consumed = src.len() - cursor.len();
    src.advance(consumed);

    Ok(value)
}

pub fn put_id(out: &mut BytesMut, id: InstanceId) {
    out.put_u16(id.0);
}

pub fn get_id(src: &mut Bytes) -> anyhow::Result<InstanceId> {
    anyhow::ensure!(src.remaining() >= 2, "truncated instance id");
    Ok(InstanceId(src.get_u16()))
}

pub fn put_string(out: &mut BytesMut, value: &str) {
    put_varint(out, value.len() as u64);
    out.extend_from_slice(value.as_bytes());
}

pub fn get_string(src: &mut Bytes) -> anyhow::Result<String> {
    let len = get_varint(src)? as usize;
    anyhow::ensure!(src.remaining() >= len, "truncated string of length {len}");

    let raw = src.split_to(len);
    String::from_utf8(raw.to_vec()).context("string is not utf-8")
}

// === Values === //

/// Declared wire type of an attribute or RPC argument.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq)]
pub enum AttrKind {
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Str,
    Ref,
    Roles,
    Vec3,
}

/// A replicated value. Replicable references are held as instance ids and
/// resolved through the registry at use time, never as hard pointers.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Str(String),
    Ref(Option<InstanceId>),
    Roles(Roles),
    Vec3(Vec3),
}

impl AttrValue {
    pub fn kind(&self) -> AttrKind {
        match self {
            AttrValue::U8(_) => AttrKind::U8,
            AttrValue::U16(_) => AttrKind::U16,
            AttrValue::U32(_) => AttrKind::U32,
            AttrValue::U64(_) => AttrKind::U64,
            AttrValue::F32(_) => AttrKind::F32,
            AttrValue::F64(_) => AttrKind::F64,
            AttrValue::Str(_) => AttrKind::Str,
            AttrValue::Ref(_) => AttrKind::Ref,
            AttrValue::Roles(_) => AttrKind::Roles,
            AttrValue::Vec3(_) => AttrKind::Vec3,
        }
    }
}

// === Handlers === //

/// Serializer for one declared wire type. Handlers for variable-width
/// types are varint-aware; `unpack` consumes exactly the bytes it reads.
pub trait TypeHandler {
    fn pack(&self, value: &AttrValue, out: &mut BytesMut);

    fn unpack(&self, src: &mut Bytes) -> anyhow::Result<AttrValue>;
}

pub fn get_handler(kind: AttrKind) -> &'static dyn TypeHandler {
    match kind {
        AttrKind::U8 => &U8Handler,
        AttrKind::U16 => &U16Handler,
        AttrKind::U32 => &U32Handler,
        AttrKind::U64 => &U64Handler,
        AttrKind::F32 => &F32Handler,
        AttrKind::F64 => &F64Handler,
        AttrKind::Str => &StrHandler,
        AttrKind::Ref => &RefHandler,
        AttrKind::Roles => &RolesHandler,
        AttrKind::Vec3 => &Vec3Handler,
    }
}

fn kind_mismatch(expected: AttrKind, value: &AttrValue) -> ! {
    panic!("value {value:?} does not match declared kind {expected:?}");
}

macro_rules! fixed_width_handler {
    ($name:ident, $variant:ident, $width:expr, $put:ident, $get:ident) => {
        struct $name;

        impl TypeHandler for $name {
            fn pack(&self, value: &AttrValue, out: &mut BytesMut) {
                match value {
                    AttrValue::$variant(v) => out.$put(*v),
                    other => kind_mismatch(AttrKind::$variant, other),
                }
            }

            fn unpack(&self, src: &mut Bytes) -> anyhow::Result<AttrValue> {
                anyhow::ensure!(
                    src.remaining() >= $width,
                    concat!("truncated ", stringify!($variant), " value")
                );
                Ok(AttrValue::$variant(src.$get()))
            }
        }
    };
}

fixed_width_handler!(U8Handler, U8, 1, put_u8, get_u8);
fixed_width_handler!(U16Handler, U16, 2, put_u16, get_u16);
fixed_width_handler!(U32Handler, U32, 4, put_u32, get_u32);
fixed_width_handler!(U64Handler, U64, 8, put_u64, get_u64);
fixed_width_handler!(F32Handler, F32, 4, put_f32, get_f32);
fixed_width_handler!(F64Handler, F64, 8, put_f64, get_f64);

struct StrHandler;

impl TypeHandler for StrHandler {
    fn pack(&self, value: &AttrValue, out: &mut BytesMut) {
        match value {
            AttrValue::Str(v) => put_string(out, v),
            other => kind_mismatch(AttrKind::Str, other),
        }
    }

    fn unpack(&self, src: &mut Bytes) -> anyhow::Result<AttrValue> {
        Ok(AttrValue::Str(get_string(src)?))
    }
}

struct RefHandler;

impl TypeHandler for RefHandler {
    fn pack(&self, value: &AttrValue, out: &mut BytesMut) {
        match value {
            AttrValue::Ref(v) => out.put_u16(v.map_or(InstanceId::NULL_BITS, |id| id.0)),
            other => kind_mismatch(AttrKind::Ref, other),
        }
    }

    fn unpack(&self, src: &mut Bytes) -> anyhow::Result<AttrValue> {
        anyhow::ensure!(src.remaining() >= 2, "truncated replicable reference");

        let bits = src.get_u16();
        Ok(AttrValue::Ref(
            (bits != InstanceId::NULL_BITS).then_some(InstanceId(bits)),
        ))
    }
}

struct RolesHandler;

impl TypeHandler for RolesHandler {
    fn pack(&self, value: &AttrValue, out: &mut BytesMut) {
        match value {
            AttrValue::Roles(v) => {
                out.put_u8(v.local as u8);
                out.put_u8(v.remote as u8);
            }
            other => kind_mismatch(AttrKind::Roles, other),
        }
    }

    fn unpack(&self, src: &mut Bytes) -> anyhow::Result<AttrValue> {
        anyhow::ensure!(src.remaining() >= 2, "truncated role pair");

        let local = src.get_u8();
        let remote = src.get_u8();
        let local = Role::from_u8(local).with_context(|| format!("invalid role {local}"))?;
        let remote = Role::from_u8(remote).with_context(|| format!("invalid role {remote}"))?;

        Ok(AttrValue::Roles(Roles::new(local, remote)))
    }
}

struct Vec3Handler;

impl TypeHandler for Vec3Handler {
    fn pack(&self, value: &AttrValue, out: &mut BytesMut) {
        match value {
            AttrValue::Vec3(v) => {
                out.put_f32(v.x);
                out.put_f32(v.y);
                out.put_f32(v.z);
            }
            other => kind_mismatch(AttrKind::Vec3, other),
        }
    }

    fn unpack(&self, src: &mut Bytes) -> anyhow::Result<AttrValue> {
        anyhow::ensure!(src.remaining() >= 12, "truncated vector");
        Ok(AttrValue::Vec3(Vec3::new(
            src.get_f32(),
            src.get_f32(),
            src.get_f32(),
        )))
    }
}

// === Tests === //

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: AttrValue) {
        let mut out = BytesMut::new();
        get_handler(value.kind()).pack(&value, &mut out);

        let mut src = out.freeze();
        let back = get_handler(value.kind()).unpack(&mut src).unwrap();

        assert_eq!(back, value);
        assert!(src.is_empty(), "handler left {} trailing bytes", src.len());
    }

    #[test]
    fn handlers_round_trip() {
        round_trip(AttrValue::U8(0xAB));
        round_trip(AttrValue::U16(0xABCD));
        round_trip(AttrValue::U32(0xDEAD_BEEF));
        round_trip(AttrValue::U64(u64::MAX - 1));
        round_trip(AttrValue::F32(-1.5));
        round_trip(AttrValue::F64(std::f64::consts::PI));
        round_trip(AttrValue::Str("caught in the net".into()));
        round_trip(AttrValue::Str(String::new()));
        round_trip(AttrValue::Ref(Some(InstanceId(7))));
        round_trip(AttrValue::Ref(None));
        round_trip(AttrValue::Roles(Roles::new(
            Role::Authority,
            Role::AutonomousProxy,
        )));
        round_trip(AttrValue::Vec3(Vec3::new(0.0, 0.0, 3.0)));
    }

    #[test]
    fn integers_are_big_endian() {
        let mut out = BytesMut::new();
        get_handler(AttrKind::U16).pack(&AttrValue::U16(0x0102), &mut out);

        assert_eq!(&out[..], &[0x01, 0x02]);
    }

    #[test]
    fn varint_round_trip() {
        for value in [0, 1, 127, 128, 300, 70_000, u64::MAX] {
            let mut out = BytesMut::new();
            put_varint(&mut out, value);

            let mut src = out.freeze();
            assert_eq!(get_varint(&mut src).unwrap(), value);
            assert!(src.is_empty());
        }
    }

    #[test]
    fn unpack_rejects_truncation() {
        let mut src = Bytes::from_static(&[0x01]);
        assert!(get_handler(AttrKind::U32).unpack(&mut src).is_err());

        let mut out = BytesMut::new();
        put_varint(&mut out, 10);
        out.extend_from_slice(b"short");
        let mut src = out.freeze();
        assert!(get_handler(AttrKind::Str).unpack(&mut src).is_err());
    }

    #[test]
    fn unpack_rejects_invalid_role() {
        let mut src = Bytes::from_static(&[9, 0]);
        assert!(get_handler(AttrKind::Roles).unpack(&mut src).is_err());
    }

    #[test]
    fn null_reference_encodes_as_sentinel() {
        let mut out = BytesMut::new();
        get_handler(AttrKind::Ref).pack(&AttrValue::Ref(None), &mut out);

        assert_eq!(&out[..], &[0xFF, 0xFF]);
    }
}
