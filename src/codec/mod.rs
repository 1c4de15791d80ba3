//! Wire argument codec for RPC calls.
//!
//! Every RPC argument travels as a `(tag, bytes)` pair rather than a typed
//! value: the tag names the encoding so the far side, which has no shared
//! type information beyond the method signature convention, knows how to
//! decode the bytes. This mirrors the tag-prefixed argument encoding used by
//! the original mqrpc substrate (`ArgToData`/`DataToArg`) rather than
//! anything serde's own data model provides out of the box, so encode/decode
//! live here instead of behind `Serialize`/`Deserialize`.

mod primitive;

pub use primitive::{Tag, CONTEXT_TAG, MARSHAL_PREFIX, MSGPACK_PREFIX};

use crate::error::{MeshError, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;

/// One encoded RPC argument or return value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arg {
    pub tag: String,
    pub bytes: Vec<u8>,
}

impl Arg {
    pub fn new(tag: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self { tag: tag.into(), bytes }
    }
}

/// Types that can be turned into a wire `Arg` and reconstructed from one.
///
/// Primitive tags (`null`, `bool`, `int`, `long`, `float`, `double`, `bytes`,
/// `string`, `map`) get a fixed binary encoding matching the original
/// implementation's wire format. Anything else falls back to a
/// `msgpack@<type>` tag carrying an `rmp-serde` encoding of the value, the
/// same fallback the original took for arbitrary structs.
pub trait FromArg: Sized {
    fn to_arg(&self) -> Result<Arg>;
    fn from_arg(arg: &Arg) -> Result<Self>;
}

impl FromArg for () {
    fn to_arg(&self) -> Result<Arg> {
        Ok(Arg::new(Tag::Null.as_str(), Vec::new()))
    }

    fn from_arg(_arg: &Arg) -> Result<Self> {
        Ok(())
    }
}

impl FromArg for bool {
    fn to_arg(&self) -> Result<Arg> {
        Ok(Arg::new(Tag::Bool.as_str(), vec![if *self { 1 } else { 0 }]))
    }

    fn from_arg(arg: &Arg) -> Result<Self> {
        primitive::expect_tag(arg, Tag::Bool)?;
        Ok(arg.bytes.first().copied().unwrap_or(0) != 0)
    }
}

impl FromArg for i32 {
    fn to_arg(&self) -> Result<Arg> {
        Ok(Arg::new(Tag::Int.as_str(), self.to_be_bytes().to_vec()))
    }

    fn from_arg(arg: &Arg) -> Result<Self> {
        primitive::expect_tag(arg, Tag::Int)?;
        let bytes: [u8; 4] = arg
            .bytes
            .as_slice()
            .try_into()
            .map_err(|_| MeshError::codec("int argument is not 4 bytes"))?;
        Ok(i32::from_be_bytes(bytes))
    }
}

impl FromArg for i64 {
    fn to_arg(&self) -> Result<Arg> {
        Ok(Arg::new(Tag::Long.as_str(), self.to_be_bytes().to_vec()))
    }

    fn from_arg(arg: &Arg) -> Result<Self> {
        primitive::expect_tag(arg, Tag::Long)?;
        let bytes: [u8; 8] = arg
            .bytes
            .as_slice()
            .try_into()
            .map_err(|_| MeshError::codec("long argument is not 8 bytes"))?;
        Ok(i64::from_be_bytes(bytes))
    }
}

impl FromArg for f32 {
    fn to_arg(&self) -> Result<Arg> {
        Ok(Arg::new(Tag::Float.as_str(), self.to_le_bytes().to_vec()))
    }

    fn from_arg(arg: &Arg) -> Result<Self> {
        primitive::expect_tag(arg, Tag::Float)?;
        let bytes: [u8; 4] = arg
            .bytes
            .as_slice()
            .try_into()
            .map_err(|_| MeshError::codec("float argument is not 4 bytes"))?;
        Ok(f32::from_le_bytes(bytes))
    }
}

impl FromArg for f64 {
    fn to_arg(&self) -> Result<Arg> {
        Ok(Arg::new(Tag::Double.as_str(), self.to_le_bytes().to_vec()))
    }

    fn from_arg(arg: &Arg) -> Result<Self> {
        primitive::expect_tag(arg, Tag::Double)?;
        let bytes: [u8; 8] = arg
            .bytes
            .as_slice()
            .try_into()
            .map_err(|_| MeshError::codec("double argument is not 8 bytes"))?;
        Ok(f64::from_le_bytes(bytes))
    }
}

impl FromArg for String {
    fn to_arg(&self) -> Result<Arg> {
        Ok(Arg::new(Tag::Str.as_str(), self.as_bytes().to_vec()))
    }

    fn from_arg(arg: &Arg) -> Result<Self> {
        primitive::expect_tag(arg, Tag::Str)?;
        String::from_utf8(arg.bytes.clone()).map_err(|e| MeshError::codec(e.to_string()))
    }
}

impl FromArg for Vec<u8> {
    fn to_arg(&self) -> Result<Arg> {
        Ok(Arg::new(Tag::Bytes.as_str(), self.clone()))
    }

    fn from_arg(arg: &Arg) -> Result<Self> {
        primitive::expect_tag(arg, Tag::Bytes)?;
        Ok(arg.bytes.clone())
    }
}

/// A generic string-keyed map of JSON values, the `map` primitive tag's
/// carried type. Encoded as JSON rather than a fixed binary layout since a
/// map's value types aren't known ahead of the call, matching the original
/// substrate's untyped map argument.
impl FromArg for HashMap<String, serde_json::Value> {
    fn to_arg(&self) -> Result<Arg> {
        Ok(Arg::new(Tag::Map.as_str(), serde_json::to_vec(self)?))
    }

    fn from_arg(arg: &Arg) -> Result<Self> {
        primitive::expect_tag(arg, Tag::Map)?;
        Ok(serde_json::from_slice(&arg.bytes)?)
    }
}

/// Encode any serializable value via the `msgpack@<type>` fallback tag, the
/// same escape hatch the original codec used for arbitrary structs it didn't
/// have a primitive case for.
pub fn to_msgpack_arg<T: Serialize>(type_name: &str, value: &T) -> Result<Arg> {
    let bytes = rmp_serde::to_vec_named(value)?;
    Ok(Arg::new(format!("{MSGPACK_PREFIX}@{type_name}"), bytes))
}

/// Decode a value previously encoded with [`to_msgpack_arg`].
pub fn from_msgpack_arg<T: DeserializeOwned>(arg: &Arg) -> Result<T> {
    if !arg.tag.starts_with(MSGPACK_PREFIX) {
        return Err(MeshError::codec(format!(
            "expected msgpack-tagged argument, got '{}'",
            arg.tag
        )));
    }
    Ok(rmp_serde::from_slice(&arg.bytes)?)
}

/// Types with their own hand-written wire encoding, carried as a
/// `marshal@<type>` argument instead of the generic `msgpack@<type>`
/// fallback. Grounded in the original substrate's generated per-type
/// marshaler: a type that cares about its own wire layout (versioning,
/// non-serde-representable fields) implements this directly rather than
/// deriving `Serialize`/`Deserialize`.
pub trait Marshal: Sized {
    fn marshal(&self) -> Result<Vec<u8>>;
    fn unmarshal(bytes: &[u8]) -> Result<Self>;
}

/// Encode `value` via its own [`Marshal`] impl under the `marshal@<type>` tag.
pub fn to_marshal_arg<T: Marshal>(type_name: &str, value: &T) -> Result<Arg> {
    Ok(Arg::new(format!("{MARSHAL_PREFIX}@{type_name}"), value.marshal()?))
}

/// Decode a value previously encoded with [`to_marshal_arg`].
pub fn from_marshal_arg<T: Marshal>(arg: &Arg) -> Result<T> {
    if !arg.tag.starts_with(MARSHAL_PREFIX) {
        return Err(MeshError::codec(format!(
            "expected marshal-tagged argument, got '{}'",
            arg.tag
        )));
    }
    T::unmarshal(&arg.bytes)
}

/// Reject `tag` unless it's a primitive tag or a recognized composite
/// prefix (`msgpack@`, `marshal@`). Wired into [`crate::rpc::server::RpcServer`]'s
/// dispatch path so an unrecognized tag fails the call with
/// [`MeshError::UnsupportedTag`] instead of panicking deeper in a `FromArg`
/// impl.
pub fn validate_tag(tag: &str) -> Result<()> {
    primitive::check_recognized(tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_primitives() {
        assert_eq!(i64::from_arg(&42i64.to_arg().unwrap()).unwrap(), 42);
        assert_eq!(
            f64::from_arg(&3.5f64.to_arg().unwrap()).unwrap(),
            3.5
        );
        assert_eq!(
            String::from_arg(&"hello".to_string().to_arg().unwrap()).unwrap(),
            "hello"
        );
        assert!(bool::from_arg(&true.to_arg().unwrap()).unwrap());
    }

    #[test]
    fn long_is_big_endian() {
        let arg = 1i64.to_arg().unwrap();
        assert_eq!(arg.bytes, vec![0, 0, 0, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn double_is_little_endian() {
        let arg = 1.0f64.to_arg().unwrap();
        // IEEE-754 1.0 has its sign/exponent bits at the top; little-endian
        // byte order puts the mantissa's low bytes first.
        assert_eq!(arg.bytes.last().copied(), Some(0x3F));
    }

    #[test]
    fn msgpack_fallback_round_trips() {
        #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
        struct Point {
            x: i32,
            y: i32,
        }
        let p = Point { x: 1, y: 2 };
        let arg = to_msgpack_arg("Point", &p).unwrap();
        assert!(arg.tag.starts_with("msgpack@"));
        let back: Point = from_msgpack_arg(&arg).unwrap();
        assert_eq!(p, back);
    }

    #[test]
    fn wrong_tag_is_rejected() {
        let arg = Arg::new("bool", vec![1]);
        assert!(i64::from_arg(&arg).is_err());
    }

    #[test]
    fn map_round_trips() {
        let mut map = HashMap::new();
        map.insert("count".to_string(), serde_json::json!(3));
        map.insert("label".to_string(), serde_json::json!("x"));
        let arg = map.to_arg().unwrap();
        assert_eq!(arg.tag, "map");
        let back = HashMap::<String, serde_json::Value>::from_arg(&arg).unwrap();
        assert_eq!(back, map);
    }

    struct FixedWidth(u16);

    impl Marshal for FixedWidth {
        fn marshal(&self) -> Result<Vec<u8>> {
            Ok(self.0.to_be_bytes().to_vec())
        }

        fn unmarshal(bytes: &[u8]) -> Result<Self> {
            let bytes: [u8; 2] = bytes
                .try_into()
                .map_err(|_| MeshError::codec("FixedWidth is not 2 bytes"))?;
            Ok(Self(u16::from_be_bytes(bytes)))
        }
    }

    #[test]
    fn marshal_fallback_round_trips() {
        let value = FixedWidth(513);
        let arg = to_marshal_arg("FixedWidth", &value).unwrap();
        assert_eq!(arg.tag, "marshal@FixedWidth");
        let back: FixedWidth = from_marshal_arg(&arg).unwrap();
        assert_eq!(back.0, 513);
    }

    #[test]
    fn validate_tag_accepts_primitives_and_composite_prefixes() {
        assert!(validate_tag("int").is_ok());
        assert!(validate_tag("map").is_ok());
        assert!(validate_tag("msgpack@Point").is_ok());
        assert!(validate_tag("marshal@FixedWidth").is_ok());
    }

    #[test]
    fn validate_tag_rejects_unknown_tags() {
        let err = validate_tag("frobnicate@Widget").unwrap_err();
        assert!(matches!(err, MeshError::UnsupportedTag(_)));
    }
}
