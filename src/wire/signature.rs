//! Type signature helpers.
//!
//! A signature is a sequence of complete types. Basic types are single
//! characters; containers nest: `a` prefixes one complete element type,
//! `(...)` wraps struct members and `{kv}` is a dictionary entry that may only
//! appear as an array element.

use crate::error::{BusError, BusResult};

/// Unsigned 8-bit integer
pub const BYTE: u8 = b'y';
/// Boolean, encoded as a 32-bit 0 or 1
pub const BOOLEAN: u8 = b'b';
/// Signed 16-bit integer
pub const INT16: u8 = b'n';
/// Unsigned 16-bit integer
pub const UINT16: u8 = b'q';
/// Signed 32-bit integer
pub const INT32: u8 = b'i';
/// Unsigned 32-bit integer
pub const UINT32: u8 = b'u';
/// Signed 64-bit integer
pub const INT64: u8 = b'x';
/// Unsigned 64-bit integer
pub const UINT64: u8 = b't';
/// IEEE 754 double
pub const DOUBLE: u8 = b'd';
/// UTF-8 string
pub const STRING: u8 = b's';
/// Object path
pub const OBJECT_PATH: u8 = b'o';
/// Type signature
pub const SIGNATURE: u8 = b'g';
/// Variant
pub const VARIANT: u8 = b'v';
/// Array prefix
pub const ARRAY: u8 = b'a';
/// Struct open
pub const STRUCT_OPEN: u8 = b'(';
/// Struct close
pub const STRUCT_CLOSE: u8 = b')';
/// Dictionary entry open
pub const DICT_OPEN: u8 = b'{';
/// Dictionary entry close
pub const DICT_CLOSE: u8 = b'}';

/// Longest signature the wire format can carry
pub const MAX_SIGNATURE_LEN: usize = 255;

/// Numeric scalar tags
pub fn is_scalar(tag: u8) -> bool {
    matches!(
        tag,
        BYTE | BOOLEAN | INT16 | UINT16 | INT32 | UINT32 | INT64 | UINT64 | DOUBLE
    )
}

/// Tags sharing the string representation
pub fn is_string_like(tag: u8) -> bool {
    matches!(tag, STRING | OBJECT_PATH | SIGNATURE)
}

/// Tags allowed as dictionary keys
pub fn is_basic(tag: u8) -> bool {
    is_scalar(tag) || is_string_like(tag)
}

/// Container tags
pub fn is_container(tag: u8) -> bool {
    matches!(tag, ARRAY | STRUCT_OPEN | DICT_OPEN)
}

/// Wire alignment of a value starting with `tag`
pub fn alignment(tag: u8) -> usize {
    match tag {
        BYTE | SIGNATURE | VARIANT => 1,
        INT16 | UINT16 => 2,
        BOOLEAN | INT32 | UINT32 | STRING | OBJECT_PATH | ARRAY => 4,
        INT64 | UINT64 | DOUBLE | STRUCT_OPEN | DICT_OPEN => 8,
        _ => 1,
    }
}

/// Length of the first complete type in `sig`
pub fn complete_type_len(sig: &[u8]) -> BusResult<usize> {
    let first = *sig
        .first()
        .ok_or_else(|| BusError::signature("empty signature"))?;
    match first {
        ARRAY => Ok(1 + complete_type_len(&sig[1..])?),
        STRUCT_OPEN | DICT_OPEN => {
            let close = if first == STRUCT_OPEN {
                STRUCT_CLOSE
            } else {
                DICT_CLOSE
            };
            let mut pos = 1;
            loop {
                match sig.get(pos) {
                    None => return Err(BusError::signature("unterminated container")),
                    Some(&c) if c == close => return Ok(pos + 1),
                    Some(_) => pos += complete_type_len(&sig[pos..])?,
                }
            }
        }
        VARIANT => Ok(1),
        tag if is_basic(tag) => Ok(1),
        tag => Err(BusError::signature(format!(
            "unknown type tag '{}'",
            tag as char
        ))),
    }
}

/// First complete type of `sig`
pub fn first_complete_type(sig: &str) -> BusResult<&str> {
    let len = complete_type_len(sig.as_bytes())?;
    Ok(&sig[..len])
}

/// Split a signature into its complete types
pub fn split(sig: &str) -> BusResult<Vec<&str>> {
    let mut types = Vec::new();
    let mut rest = sig;
    while !rest.is_empty() {
        let len = complete_type_len(rest.as_bytes())?;
        types.push(&rest[..len]);
        rest = &rest[len..];
    }
    Ok(types)
}

/// Deepest array nesting accepted in a signature or body
pub const MAX_ARRAY_DEPTH: usize = 32;

/// Deepest struct, dictionary entry and variant nesting accepted in a
/// signature or body
pub const MAX_STRUCT_DEPTH: usize = 32;

/// Check that `sig` is a single complete type
pub fn is_single_complete_type(sig: &str) -> bool {
    matches!(complete_type_len(sig.as_bytes()), Ok(len) if len == sig.len())
}

/// Validate a signature
///
/// Beyond scanning complete types this enforces the dictionary entry rules:
/// entries appear only as array elements, hold exactly two types and have a
/// basic key. Structs must not be empty, and nesting stays within
/// [`MAX_ARRAY_DEPTH`] and [`MAX_STRUCT_DEPTH`].
pub fn validate(sig: &str) -> BusResult<()> {
    if sig.len() > MAX_SIGNATURE_LEN {
        return Err(BusError::signature("signature too long"));
    }
    for ty in split(sig)? {
        validate_type(ty.as_bytes(), false, 0, 0)?;
    }
    Ok(())
}

fn validate_type(ty: &[u8], in_array: bool, arrays: usize, structs: usize) -> BusResult<()> {
    if arrays > MAX_ARRAY_DEPTH || structs > MAX_STRUCT_DEPTH {
        return Err(BusError::signature("signature nesting too deep"));
    }
    match ty[0] {
        ARRAY => validate_type(&ty[1..], true, arrays + 1, structs),
        STRUCT_OPEN => {
            let inner = &ty[1..ty.len() - 1];
            if inner.is_empty() {
                return Err(BusError::signature("empty struct"));
            }
            let mut pos = 0;
            while pos < inner.len() {
                let len = complete_type_len(&inner[pos..])?;
                validate_type(&inner[pos..pos + len], false, arrays, structs + 1)?;
                pos += len;
            }
            Ok(())
        }
        DICT_OPEN => {
            if !in_array {
                return Err(BusError::signature("dictionary entry outside an array"));
            }
            let inner = &ty[1..ty.len() - 1];
            if inner.is_empty() || !is_basic(inner[0]) {
                return Err(BusError::signature("dictionary key must be a basic type"));
            }
            let value_len = complete_type_len(&inner[1..])?;
            if 1 + value_len != inner.len() {
                return Err(BusError::signature("dictionary entry must hold two types"));
            }
            validate_type(&inner[1..], false, arrays, structs + 1)
        }
        _ => Ok(()),
    }
}
