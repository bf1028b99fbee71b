//! Script to wire value conversion.
//!
//! The target type of each value comes from the signature the
//! [`BodyWriter`] is walking, so callers only supply values in order.
//! Scalars are coerced with script number rules, and booleans travel as
//! 0/1 numbers. A variant must be given as a single-key object mapping its
//! signature to its payload, because a variant's type is never inferred.

use crate::error::{BusError, BusResult};
use crate::interface::{InterfaceDescription, ObjectTable, PropertyInfo};
use crate::value::ScriptValue;
use crate::wire::signature as sig;
use crate::wire::BodyWriter;

/// Marshal one value against the next expected type
pub fn marshal_arg(writer: &mut BodyWriter, value: &ScriptValue) -> BusResult<()> {
    let next = writer
        .next_arg_sig()
        .ok_or_else(|| BusError::signature("too many arguments"))?
        .to_string();
    marshal_typed(writer, &next, value)
}

/// Marshal values positionally
pub fn marshal_args(writer: &mut BodyWriter, values: &[ScriptValue]) -> BusResult<()> {
    values.iter().try_for_each(|v| marshal_arg(writer, v))
}

/// Marshal a value as a variant holding `prop_sig`
pub fn marshal_prop(writer: &mut BodyWriter, prop_sig: &str, value: &ScriptValue) -> BusResult<()> {
    writer.open_variant(prop_sig)?;
    marshal_typed(writer, prop_sig, value)
}

/// Marshal the `a{sv}` body of a `GetAll` reply
///
/// Readable properties of `iface` that have a value in `values` become
/// dictionary entries; absent properties are left out. An undefined result
/// or an unknown interface produces an empty dictionary.
pub fn marshal_properties(
    writer: &mut BodyWriter,
    iface: Option<&InterfaceDescription>,
    values: &ScriptValue,
) -> BusResult<()> {
    writer.open_container(sig::ARRAY)?;
    if !values.is_undefined() {
        let obj = values.as_object().ok_or_else(|| {
            BusError::invalid("Requires object with values for each property to be returned")
        })?;
        if let Some(desc) = iface {
            for (member, access) in desc.properties_iter() {
                if !access.readable() {
                    continue;
                }
                match obj.get(&member.name) {
                    Some(value) if !value.is_undefined() => {
                        writer.open_container(sig::DICT_OPEN)?;
                        writer.put_string(sig::STRING, &member.name)?;
                        marshal_prop(writer, &member.out_sig, value)?;
                        writer.close_container()?;
                    }
                    _ => {}
                }
            }
        }
    }
    writer.close_container()
}

/// Marshal the `ssv` body of a `Properties.Set` call
///
/// The value is marshaled with the property's declared signature. The
/// returned info tells the caller whether the message must be encrypted.
pub fn marshal_prop_set(
    writer: &mut BodyWriter,
    objects: &ObjectTable,
    args: &[ScriptValue],
) -> BusResult<PropertyInfo> {
    let iface = args
        .first()
        .and_then(ScriptValue::as_str)
        .ok_or_else(|| BusError::invalid("interface name must be a string"))?;
    let prop = args
        .get(1)
        .and_then(ScriptValue::as_str)
        .ok_or_else(|| BusError::invalid("property name must be a string"))?;
    writer.put_string(sig::STRING, iface)?;
    writer.put_string(sig::STRING, prop)?;
    let info = objects.identify_property(iface, prop)?;
    let value = args.get(2).cloned().unwrap_or_default();
    marshal_prop(writer, &info.signature, &value)?;
    Ok(info)
}

fn marshal_typed(writer: &mut BodyWriter, type_sig: &str, value: &ScriptValue) -> BusResult<()> {
    let bytes = type_sig.as_bytes();
    let tag = *bytes
        .first()
        .ok_or_else(|| BusError::signature("empty signature"))?;
    if sig::is_scalar(tag) {
        return marshal_scalar(writer, tag, value.to_number());
    }
    if sig::is_string_like(tag) {
        let s = value.as_str().ok_or_else(|| {
            BusError::signature(format!("'{}' requires a string value", tag as char))
        })?;
        return writer.put_string(tag, s);
    }
    match tag {
        sig::VARIANT => marshal_variant(writer, value),
        sig::STRUCT_OPEN => {
            let items = value
                .as_array()
                .ok_or_else(|| BusError::signature("struct requires an array value"))?;
            marshal_sequence(writer, sig::STRUCT_OPEN, items)
        }
        sig::ARRAY => {
            let elem = bytes.get(1).copied().unwrap_or(0);
            if let Some(items) = value.as_array() {
                marshal_sequence(writer, sig::ARRAY, items)
            } else if let Some(buf) = value.as_buffer() {
                if elem != sig::BYTE {
                    return Err(BusError::signature(format!(
                        "buffer cannot be marshaled as '{}'",
                        type_sig
                    )));
                }
                writer.put_byte_array(buf)
            } else if elem == sig::DICT_OPEN {
                marshal_dict(writer, value)
            } else {
                Err(BusError::signature(format!(
                    "'{}' requires an array value",
                    type_sig
                )))
            }
        }
        other => Err(BusError::signature(format!(
            "cannot marshal type '{}'",
            other as char
        ))),
    }
}

fn marshal_scalar(writer: &mut BodyWriter, tag: u8, n: f64) -> BusResult<()> {
    // narrow integers wrap through i64 the way a C cast does on the target
    match tag {
        sig::BYTE => writer.put_byte(n as i64 as u8),
        sig::BOOLEAN => writer.put_bool(n as i64 != 0),
        sig::INT16 => writer.put_i16(n as i64 as i16),
        sig::UINT16 => writer.put_u16(n as i64 as u16),
        sig::INT32 => writer.put_i32(n as i64 as i32),
        sig::UINT32 => writer.put_u32(n as i64 as u32),
        sig::INT64 => writer.put_i64(n as i64),
        sig::UINT64 => writer.put_u64(n as u64),
        sig::DOUBLE => writer.put_double(n),
        other => Err(BusError::signature(format!(
            "'{}' is not a scalar type",
            other as char
        ))),
    }
}

fn marshal_variant(writer: &mut BodyWriter, value: &ScriptValue) -> BusResult<()> {
    let obj = value
        .as_object()
        .filter(|o| o.len() == 1)
        .ok_or_else(|| BusError::signature("Variant must have a single signature"))?;
    let (value_sig, payload) = obj
        .iter()
        .next()
        .ok_or_else(|| BusError::signature("Variant must have a single signature"))?;
    writer.open_variant(value_sig)?;
    marshal_typed(writer, value_sig, payload)
}

fn marshal_sequence(writer: &mut BodyWriter, tag: u8, items: &[ScriptValue]) -> BusResult<()> {
    writer.open_container(tag)?;
    for item in items {
        // sequences end at the first hole
        if item.is_undefined() {
            break;
        }
        marshal_arg(writer, item)?;
    }
    writer.close_container()
}

fn marshal_dict(writer: &mut BodyWriter, value: &ScriptValue) -> BusResult<()> {
    let map = value
        .as_object()
        .ok_or_else(|| BusError::signature("dictionary requires an object value"))?;
    writer.open_container(sig::ARRAY)?;
    for (key, val) in map.iter() {
        writer.open_container(sig::DICT_OPEN)?;
        marshal_arg(writer, &ScriptValue::String(key.clone()))?;
        marshal_arg(writer, val)?;
        writer.close_container()?;
    }
    writer.close_container()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::InterfaceDescription;
    use crate::unmarshal::{unmarshal_arg, unmarshal_args};
    use crate::value::ObjectMap;
    use crate::wire::BodyReader;

    fn create_body(signature: &str, values: &[ScriptValue]) -> BusResult<Vec<u8>> {
        let mut writer = BodyWriter::new(signature);
        marshal_args(&mut writer, values)?;
        writer.finish()
    }

    fn roundtrip(signature: &str, value: ScriptValue) -> ScriptValue {
        let body = create_body(signature, &[value]).unwrap();
        let mut reader = BodyReader::new(&body, signature);
        unmarshal_arg(&mut reader).unwrap()
    }

    #[test]
    fn test_scalar_roundtrip() {
        let cases: [(&str, f64); 8] = [
            ("y", 200.0),
            ("n", -1234.0),
            ("q", 65535.0),
            ("i", -2_000_000.0),
            ("u", 4_000_000_000.0),
            ("x", -9_007_199_254_740_991.0),
            ("t", 9_007_199_254_740_991.0),
            ("d", 3.25),
        ];
        for (signature, n) in cases {
            assert_eq!(
                roundtrip(signature, n.into()),
                ScriptValue::Number(n),
                "type {}",
                signature
            );
        }
    }

    #[test]
    fn test_bool_is_numeric() {
        assert_eq!(roundtrip("b", ScriptValue::Bool(true)), ScriptValue::Bool(true));
        assert_eq!(roundtrip("b", 0.into()), ScriptValue::Bool(false));
        assert_eq!(roundtrip("b", 2.into()), ScriptValue::Bool(true));
    }

    #[test]
    fn test_u64_precision_loss_above_2_53() {
        // 2^53 + 1 is not representable; the value arriving is 2^53
        let big = 9_007_199_254_740_993u64;
        let mut writer = BodyWriter::new("t");
        writer.put_u64(big).unwrap();
        let body = writer.finish().unwrap();
        let value = unmarshal_arg(&mut BodyReader::new(&body, "t")).unwrap();
        assert_ne!(value.as_number().unwrap() as u64, big);
        assert_eq!(value.as_number().unwrap(), 9_007_199_254_740_992.0);
    }

    #[test]
    fn test_string_required() {
        let err = create_body("s", &[5.into()]).unwrap_err();
        assert!(matches!(err, BusError::Signature(_)));
        assert_eq!(roundtrip("g", "a{sv}".into()), ScriptValue::from("a{sv}"));
    }

    #[test]
    fn test_variant_requires_single_key() {
        let empty = ScriptValue::Object(ObjectMap::new());
        let two = ObjectMap::new().with("i", 1).with("s", "x");
        assert!(create_body("v", &[empty]).is_err());
        assert!(create_body("v", &[two.into()]).is_err());
        assert!(create_body("v", &[5.into()]).is_err());
    }

    #[test]
    fn test_variant_transparency() {
        let payload = ScriptValue::from(vec![1, 2, 3]);
        let mut wrapped: ScriptValue = ObjectMap::new().with("ai", payload.clone()).into();
        assert_eq!(roundtrip("ai", payload.clone()), payload);
        assert_eq!(roundtrip("v", wrapped.clone()), payload);
        for _ in 0..2 {
            wrapped = ObjectMap::new().with("v", wrapped).into();
        }
        assert_eq!(roundtrip("v", wrapped), payload);
    }

    #[test]
    fn test_array_stops_at_undefined() {
        let items = ScriptValue::Array(vec![1.into(), 2.into(), ScriptValue::Undefined, 4.into()]);
        assert_eq!(roundtrip("ai", items), ScriptValue::from(vec![1, 2]));
    }

    #[test]
    fn test_struct_positional() {
        let value = ScriptValue::from(vec![ScriptValue::from(7), ScriptValue::from("seven")]);
        assert_eq!(roundtrip("(is)", value.clone()), value);
        assert!(create_body("(is)", &[ScriptValue::from(vec![7])]).is_err());
    }

    #[test]
    fn test_dict_from_object() {
        let map = ObjectMap::new().with("1", "one").with("2", "two");
        let value = roundtrip("a{us}", map.into());
        assert_eq!(value.get("2").as_str(), Some("two"));
        assert!(create_body("a{us}", &[5.into()]).is_err());
    }

    #[test]
    fn test_byte_array_fast_path_matches_generic() {
        let bytes: Vec<u8> = (0..=40).collect();
        let fast = create_body("ay", &[ScriptValue::Buffer(bytes.clone())]).unwrap();
        let generic = create_body(
            "ay",
            &[ScriptValue::Array(bytes.iter().map(|b| (*b as u32).into()).collect())],
        )
        .unwrap();
        assert_eq!(fast, generic);
        assert!(create_body("ai", &[ScriptValue::Buffer(bytes)]).is_err());
    }

    #[test]
    fn test_argument_count_checked() {
        assert!(matches!(
            create_body("i", &[1.into(), 2.into()]),
            Err(BusError::Signature(_))
        ));
        assert!(matches!(create_body("ii", &[1.into()]), Err(BusError::Signature(_))));
    }

    #[test]
    fn test_get_all_skips_write_only_and_absent() {
        let desc = InterfaceDescription::parse(&[
            "org.example.Dev",
            "@Name=s",
            "@Level>u",
            "@Secret<s",
            "@Missing>s",
        ])
        .unwrap();
        let values = ObjectMap::new()
            .with("Name", "lamp")
            .with("Level", 3)
            .with("Secret", "hidden");
        let mut writer = BodyWriter::new("a{sv}");
        marshal_properties(&mut writer, Some(&desc), &ScriptValue::from(values)).unwrap();
        let body = writer.finish().unwrap();
        let result = unmarshal_args(&mut BodyReader::new(&body, "a{sv}")).unwrap();
        let map = result[0].as_object().unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("Level"), Some(&ScriptValue::Number(3.0)));
        assert!(!map.contains_key("Secret"));
    }

    #[test]
    fn test_get_all_undefined_is_empty() {
        let mut writer = BodyWriter::new("a{sv}");
        marshal_properties(&mut writer, None, &ScriptValue::Undefined).unwrap();
        // length word plus padding to the dict entry alignment
        assert_eq!(writer.finish().unwrap(), vec![0u8; 8]);

        let mut writer = BodyWriter::new("a{sv}");
        assert!(marshal_properties(&mut writer, None, &ScriptValue::from(5)).is_err());
    }

    #[test]
    fn test_prop_set_uses_declared_signature() {
        let mut table = ObjectTable::new();
        table
            .add_interface(InterfaceDescription::parse(&["$org.example.Lock", "@Code=q"]).unwrap())
            .unwrap();
        let mut writer = BodyWriter::new("ssv");
        let info = marshal_prop_set(
            &mut writer,
            &table,
            &["org.example.Lock".into(), "Code".into(), 42.into()],
        )
        .unwrap();
        assert!(info.secure);
        let body = writer.finish().unwrap();
        let mut reader = BodyReader::new(&body, "ssv");
        reader.get_string(sig::STRING).unwrap();
        reader.get_string(sig::STRING).unwrap();
        assert_eq!(reader.open_variant().unwrap(), "q");
        assert_eq!(reader.get_u16().unwrap(), 42);
    }
}
