//! Script message objects and outgoing message builders.
//!
//! An inbound message becomes a plain script object. Method calls also get a
//! reply context stored in [`BusContext::replies`], reachable from script
//! only through the bound `reply` and `errorReply` natives.

use crate::context::BusContext;
use crate::correlator::{ReplyContext, ReplyHandle};
use crate::error::{BusError, BusResult};
use crate::natives::NativeFn;
use crate::unmarshal::{unmarshal_arg, unmarshal_args};
use crate::value::{ObjectMap, ScriptValue};
use crate::wire::signature as sig;
use crate::wire::{accessor, flags, ids, reply_id, BodyWriter, MsgType, WireMessage};

/// Error name sent when a call is rejected
pub const ERR_REJECTED: &str = "org.alljoyn.Bus.ErRejected";

/// Error name sent when a secure member is reached without encryption
pub const ERR_SECURITY_VIOLATION: &str = "org.alljoyn.Bus.SecurityViolation";

/// Well-known name of the bus controller
pub const BUS_NAME: &str = "org.alljoyn.Bus";

/// Well-known name of the message bus daemon
pub const DBUS_NAME: &str = "org.freedesktop.DBus";

/// JoinSession reply status for success
pub const JOIN_SESSION_SUCCESS: u32 = 1;

/// Build the script message object for `msg`
///
/// For method calls the reply context is stored and its handle returned;
/// the object's `reply` and `errorReply` are bound to it.
pub fn message_object(
    ctx: &mut BusContext,
    msg: &WireMessage,
    accessor: Option<u8>,
) -> (ScriptValue, Option<ReplyHandle>) {
    let mut obj = ObjectMap::new().with("sender", msg.sender.as_str());
    let mut handle = None;
    match msg.msg_type {
        MsgType::MethodCall | MsgType::Signal => {
            obj.insert("member", msg.member.as_str().into());
            obj.insert("iface", msg.iface.as_str().into());
            obj.insert("path", msg.path.as_str().into());
            let from_self = ctx.unique_name() == Some(msg.sender.as_str());
            obj.insert("fromSelf", from_self.into());
            if msg.msg_type == MsgType::MethodCall {
                let h = ctx.replies.insert(ReplyContext::from_call(msg, accessor));
                obj.insert("reply", NativeFn::Reply(h).into());
                obj.insert("errorReply", NativeFn::ErrorReply(h).into());
                handle = Some(h);
            }
        }
        MsgType::Reply | MsgType::Error => {
            obj.insert("replySerial", msg.reply_serial.into());
            let is_error = msg.msg_type == MsgType::Error;
            if is_error {
                obj.insert("error", msg.error_name.as_str().into());
            }
            obj.insert("isErrorReply", is_error.into());
        }
    }
    (ScriptValue::Object(obj), handle)
}

/// Unmarshal the handler arguments of an application message
///
/// Property accessors are unpacked here: `Get` and `Set` push the interface
/// and property names, `Set` also the new value, and `GetAll` the interface
/// name. A secure property reached over an unencrypted channel fails with
/// [`BusError::Security`] before any value is converted.
pub fn unmarshal_message_args(
    ctx: &mut BusContext,
    msg: &WireMessage,
    accessor_kind: Option<u8>,
    handle: Option<ReplyHandle>,
) -> BusResult<Vec<ScriptValue>> {
    let mut reader = msg.reader();
    let Some(kind) = accessor_kind else {
        return unmarshal_args(&mut reader);
    };
    let iface = reader.get_string(sig::STRING)?.to_string();
    if kind == accessor::GET_ALL {
        if let Some(rc) = handle.and_then(|h| ctx.replies.get_mut(h)) {
            rc.prop_iface = Some(iface.clone());
        }
        return Ok(vec![iface.into()]);
    }
    let prop = reader.get_string(sig::STRING)?.to_string();
    let info = ctx.objects.identify_property(&iface, &prop)?;
    if info.secure && !msg.is_encrypted() {
        return Err(BusError::Security(format!("{}.{}", iface, prop)));
    }
    let mut args: Vec<ScriptValue> = vec![iface.into(), prop.into()];
    match kind {
        accessor::GET => {
            if let Some(rc) = handle.and_then(|h| ctx.replies.get_mut(h)) {
                rc.prop_sig = Some(info.signature);
            }
        }
        accessor::SET => args.push(unmarshal_arg(&mut reader)?),
        other => return Err(BusError::invalid(format!("unknown property accessor {}", other))),
    }
    Ok(args)
}

/// Reply addressed back to the caller of a method call
pub fn method_reply(rc: &ReplyContext) -> WireMessage {
    WireMessage::new(MsgType::Reply, reply_id(rc.msg_id))
        .with_reply_serial(rc.serial)
        .with_destination(rc.sender.as_str())
        .with_session(rc.session_id)
        .with_flags(rc.flags & flags::ENCRYPTED)
}

/// Error reply to a method call, with an optional `s` info argument
pub fn error_reply(rc: &ReplyContext, error_name: &str, info: Option<&str>) -> BusResult<WireMessage> {
    let mut msg = WireMessage::new(MsgType::Error, reply_id(rc.msg_id))
        .with_reply_serial(rc.serial)
        .with_destination(rc.sender.as_str())
        .with_session(rc.session_id)
        .with_error_name(error_name)
        .with_flags(rc.flags & flags::ENCRYPTED);
    if let Some(text) = info {
        let mut writer = BodyWriter::new("s");
        writer.put_string(sig::STRING, text)?;
        msg = msg.with_body("s", writer.finish()?);
    }
    Ok(msg)
}

fn bus_call(msg_id: u32, destination: &str, signature: &str, body: Vec<u8>) -> WireMessage {
    WireMessage::new(MsgType::MethodCall, msg_id)
        .with_destination(destination)
        .with_body(signature, body)
}

/// `AddMatch` or `RemoveMatch` call carrying a signal match rule
pub fn match_rule_call(rule: &str, add: bool) -> BusResult<WireMessage> {
    let mut writer = BodyWriter::new("s");
    writer.put_string(sig::STRING, rule)?;
    let id = if add {
        ids::METHOD_ADD_MATCH
    } else {
        ids::METHOD_REMOVE_MATCH
    };
    Ok(bus_call(id, DBUS_NAME, "s", writer.finish()?))
}

/// `FindAdvertisedName`, or `FindAdvertisedNameByTransport` when a
/// transport mask is given
pub fn find_name_call(prefix: &str, transport: Option<u16>) -> BusResult<WireMessage> {
    match transport {
        None => {
            let mut writer = BodyWriter::new("s");
            writer.put_string(sig::STRING, prefix)?;
            Ok(bus_call(ids::METHOD_FIND_NAME, BUS_NAME, "s", writer.finish()?))
        }
        Some(mask) => {
            let mut writer = BodyWriter::new("sq");
            writer.put_string(sig::STRING, prefix)?;
            writer.put_u16(mask)?;
            Ok(bus_call(
                ids::METHOD_FIND_NAME_BY_TRANSPORT,
                BUS_NAME,
                "sq",
                writer.finish()?,
            ))
        }
    }
}

/// Do not queue for a name that is already owned
pub const NAME_REQ_DO_NOT_QUEUE: u32 = 0x04;

/// Transport mask selecting every transport
pub const TRANSPORT_ANY: u16 = 0xFFFF;

/// `RequestName` for a well-known name
pub fn request_name_call(name: &str) -> BusResult<WireMessage> {
    let mut writer = BodyWriter::new("su");
    writer.put_string(sig::STRING, name)?;
    writer.put_u32(NAME_REQ_DO_NOT_QUEUE)?;
    Ok(bus_call(ids::METHOD_REQUEST_NAME, DBUS_NAME, "su", writer.finish()?))
}

/// `AdvertiseName` on every transport, or `CancelAdvertiseName` to stop
pub fn advertise_name_call(name: &str, start: bool) -> BusResult<WireMessage> {
    let mut writer = BodyWriter::new("sq");
    writer.put_string(sig::STRING, name)?;
    writer.put_u16(TRANSPORT_ANY)?;
    let id = if start {
        ids::METHOD_ADVERTISE_NAME
    } else {
        ids::METHOD_CANCEL_ADVERTISE_NAME
    };
    Ok(bus_call(id, BUS_NAME, "sq", writer.finish()?))
}

/// `CancelSessionlessMessage` withdrawing a sessionless signal by serial
pub fn cancel_sessionless_call(serial: u32) -> BusResult<WireMessage> {
    let mut writer = BodyWriter::new("u");
    writer.put_u32(serial)?;
    Ok(bus_call(ids::METHOD_CANCEL_SESSIONLESS, BUS_NAME, "u", writer.finish()?))
}

/// `JoinSession` call with default session options
pub fn join_session_call(peer: &str, port: u16) -> BusResult<WireMessage> {
    let signature = "sqa{sv}";
    let mut writer = BodyWriter::new(signature);
    writer.put_string(sig::STRING, peer)?;
    writer.put_u16(port)?;
    writer.open_container(sig::ARRAY)?;
    session_opt(&mut writer, "traf", "y", |w| w.put_byte(0x01))?;
    session_opt(&mut writer, "multi", "b", |w| w.put_bool(false))?;
    session_opt(&mut writer, "prox", "y", |w| w.put_byte(0xFF))?;
    session_opt(&mut writer, "trans", "q", |w| w.put_u16(0xFFFF))?;
    writer.close_container()?;
    Ok(bus_call(ids::METHOD_JOIN_SESSION, BUS_NAME, signature, writer.finish()?))
}

fn session_opt(
    writer: &mut BodyWriter,
    key: &str,
    value_sig: &str,
    put: impl FnOnce(&mut BodyWriter) -> BusResult<()>,
) -> BusResult<()> {
    writer.open_container(sig::DICT_OPEN)?;
    writer.put_string(sig::STRING, key)?;
    writer.open_variant(value_sig)?;
    put(writer)?;
    writer.close_container()
}

/// `LeaveSession` call
pub fn leave_session_call(session_id: u32) -> BusResult<WireMessage> {
    let mut writer = BodyWriter::new("u");
    writer.put_u32(session_id)?;
    Ok(bus_call(ids::METHOD_LEAVE_SESSION, BUS_NAME, "u", writer.finish()?))
}

/// Reply to an `AcceptSession` call
pub fn accept_session_reply(call: &WireMessage, accept: bool) -> BusResult<WireMessage> {
    let mut writer = BodyWriter::new("b");
    writer.put_bool(accept)?;
    Ok(method_reply(&ReplyContext::from_call(call, None)).with_body("b", writer.finish()?))
}
