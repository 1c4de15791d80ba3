use super::Arg;
use crate::error::{MeshError, Result};

/// Wire tags for primitive argument encodings, matching the original
/// substrate's `ArgToData` tag strings one-to-one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Null,
    Bool,
    Int,
    Long,
    Float,
    Double,
    Bytes,
    Str,
    Map,
}

impl Tag {
    pub const fn as_str(self) -> &'static str {
        match self {
            Tag::Null => "null",
            Tag::Bool => "bool",
            Tag::Int => "int",
            Tag::Long => "long",
            Tag::Float => "float",
            Tag::Double => "double",
            Tag::Bytes => "bytes",
            Tag::Str => "string",
            Tag::Map => "map",
        }
    }

    const ALL: [Tag; 9] = [
        Tag::Null,
        Tag::Bool,
        Tag::Int,
        Tag::Long,
        Tag::Float,
        Tag::Double,
        Tag::Bytes,
        Tag::Str,
        Tag::Map,
    ];
}

/// Tag carrying a propagated RPC context (trace id, span id, translatable
/// keys) rather than a plain argument.
pub const CONTEXT_TAG: &str = "context";

/// Prefix for tags encoding an arbitrary struct via a caller-supplied
/// `Marshal` impl, e.g. `marshal@UserProfile`, matching the original's
/// generated-marshaler escape hatch for types that don't want the generic
/// `msgpack@` encoding (see [`super::to_marshal_arg`]/[`super::from_marshal_arg`]).
pub const MARSHAL_PREFIX: &str = "marshal";

/// Prefix for tags encoding an arbitrary struct via MessagePack, e.g.
/// `msgpack@Point`.
pub const MSGPACK_PREFIX: &str = "msgpack";

pub(super) fn expect_tag(arg: &Arg, want: Tag) -> Result<()> {
    if arg.tag != want.as_str() {
        return Err(MeshError::codec(format!(
            "expected tag '{}', got '{}'",
            want.as_str(),
            arg.tag
        )));
    }
    Ok(())
}

/// Reject a tag that is neither a primitive tag nor a recognized composite
/// prefix (`msgpack@<type>`, `marshal@<type>`), matching the original
/// codec's `ArgToData`/`DataToArg` failing fast on an unknown prefix instead
/// of guessing at an encoding.
pub(super) fn check_recognized(tag: &str) -> Result<()> {
    let is_primitive = Tag::ALL.iter().any(|t| t.as_str() == tag);
    let is_composite = tag.starts_with(&format!("{}@", super::MSGPACK_PREFIX))
        || tag.starts_with(&format!("{}@", MARSHAL_PREFIX));
    let is_context = tag == CONTEXT_TAG;
    if is_primitive || is_composite || is_context {
        Ok(())
    } else {
        Err(MeshError::unsupported_tag(tag))
    }
}
