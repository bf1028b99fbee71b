//! Wire to script value conversion.
//!
//! Values are read positionally from a [`BodyReader`]. Variants are stripped
//! before conversion, so a value wrapped in any number of variants produces
//! the same script value as the bare value.
//!
//! 64-bit integers are converted through `f64`. Magnitudes above 2^53 lose
//! precision.

use crate::error::{BusError, BusResult};
use crate::value::{ObjectMap, ScriptValue};
use crate::wire::signature as sig;
use crate::wire::BodyReader;

/// Unmarshal the next argument
///
/// Returns [`BusError::NoMore`] at the end of the current container or of
/// the message arguments.
pub fn unmarshal_arg(reader: &mut BodyReader<'_>) -> BusResult<ScriptValue> {
    let mut next = reader.next_arg_sig()?;
    while next.as_bytes()[0] == sig::VARIANT {
        next = reader.open_variant()?;
    }
    let tag = next.as_bytes()[0];
    let value = match tag {
        sig::BYTE => ScriptValue::Number(reader.get_byte()? as f64),
        sig::BOOLEAN => ScriptValue::Bool(reader.get_bool()?),
        sig::INT16 => ScriptValue::Number(reader.get_i16()? as f64),
        sig::UINT16 => ScriptValue::Number(reader.get_u16()? as f64),
        sig::INT32 => ScriptValue::Number(reader.get_i32()? as f64),
        sig::UINT32 => ScriptValue::Number(reader.get_u32()? as f64),
        sig::INT64 => ScriptValue::Number(reader.get_i64()? as f64),
        sig::UINT64 => ScriptValue::Number(reader.get_u64()? as f64),
        sig::DOUBLE => ScriptValue::Number(reader.get_double()?),
        sig::STRING | sig::OBJECT_PATH | sig::SIGNATURE => {
            ScriptValue::String(reader.get_string(tag)?.to_string())
        }
        sig::STRUCT_OPEN => ScriptValue::Array(unmarshal_sequence(reader, sig::STRUCT_OPEN)?),
        sig::ARRAY => match next.as_bytes().get(1) {
            Some(&sig::DICT_OPEN) => ScriptValue::Object(unmarshal_dict(reader)?),
            Some(&sig::BYTE) => ScriptValue::Buffer(reader.get_byte_array()?.to_vec()),
            _ => ScriptValue::Array(unmarshal_sequence(reader, sig::ARRAY)?),
        },
        other => {
            return Err(BusError::signature(format!(
                "cannot unmarshal type '{}'",
                other as char
            )))
        }
    };
    Ok(value)
}

/// Unmarshal every remaining argument of a message
pub fn unmarshal_args(reader: &mut BodyReader<'_>) -> BusResult<Vec<ScriptValue>> {
    let mut args = Vec::new();
    loop {
        match unmarshal_arg(reader) {
            Ok(value) => args.push(value),
            Err(BusError::NoMore) => return Ok(args),
            Err(e) => return Err(e),
        }
    }
}

fn unmarshal_sequence(reader: &mut BodyReader<'_>, tag: u8) -> BusResult<Vec<ScriptValue>> {
    reader.open_container(tag)?;
    let items = unmarshal_args(reader)?;
    if tag == sig::STRUCT_OPEN && items.is_empty() {
        return Err(BusError::signature("struct with no members"));
    }
    reader.close_container()?;
    Ok(items)
}

/// A dictionary entry always holds a key and a value
fn unmarshal_member(reader: &mut BodyReader<'_>) -> BusResult<ScriptValue> {
    match unmarshal_arg(reader) {
        Err(BusError::NoMore) => Err(BusError::signature("dictionary entry missing a member")),
        other => other,
    }
}

fn unmarshal_dict(reader: &mut BodyReader<'_>) -> BusResult<ObjectMap> {
    reader.open_container(sig::ARRAY)?;
    let mut map = ObjectMap::new();
    loop {
        match reader.open_container(sig::DICT_OPEN) {
            Ok(()) => {}
            Err(BusError::NoMore) => break,
            Err(e) => return Err(e),
        }
        let key = unmarshal_member(reader)?;
        let value = unmarshal_member(reader)?;
        reader.close_container()?;
        // later entries overwrite earlier ones with the same key
        map.insert(key.to_key_string(), value);
    }
    reader.close_container()?;
    Ok(map)
}
