//! Method calls, signals and replies issued from script code.
//!
//! `service.method(member)` and `service.signal(path, member)` resolve the
//! message id once and return an info object; its `call` and `send` natives
//! do the marshaling. The info object doubles as the place where script code
//! sets per-message options (`timeout`, `noReply`, `timeToLive`,
//! `sessionless`) before sending.

use super::{require_str, NativeFn, NativeOp, NativeScope};
use crate::correlator::{ReplyContext, ReplyHandle};
use crate::error::{BusError, BusResult, ScriptError};
use crate::interface::ObjectTable;
use crate::marshal::{marshal_args, marshal_prop, marshal_prop_set, marshal_properties};
use crate::message::{self, ERR_REJECTED};
use crate::value::{ObjectMap, ScriptValue};
use crate::wire::{accessor, flags, reply_id, BodyWriter, MsgType, WireMessage, PROPERTIES_IFACE};

/// Pending-call reply object returned by every native that sends a method call
pub fn reply_object(serial: u32) -> ScriptValue {
    ScriptValue::Object(
        ObjectMap::new()
            .with("replySerial", serial)
            .with("onReply", NativeFn::OnReply(serial)),
    )
}

/// Build the info object for calling `member` of `iface` on a remote object
///
/// Returns `None` when the interface or member is unknown.
pub fn service_method_info(
    objects: &ObjectTable,
    dest: &str,
    path: &str,
    iface: &str,
    member: &str,
    session: u32,
) -> Option<ScriptValue> {
    let msg_id = objects.proxy_message_id(iface, member)?;
    let info = MessageInfo {
        msg_id,
        dest: dest.to_string(),
        path: path.to_string(),
        iface: iface.to_string(),
        member: member.to_string(),
        session,
        secure: objects.is_secure(msg_id),
    };
    Some(info.to_script(NativeOp::MethodCall))
}

#[derive(Debug, Clone)]
struct MessageInfo {
    msg_id: u32,
    dest: String,
    path: String,
    iface: String,
    member: String,
    session: u32,
    secure: bool,
}

impl MessageInfo {
    fn to_script(&self, send: NativeOp) -> ScriptValue {
        ScriptValue::Object(
            ObjectMap::new()
                .with("msgId", self.msg_id)
                .with("dest", self.dest.as_str())
                .with("path", self.path.as_str())
                .with("iface", self.iface.as_str())
                .with("member", self.member.as_str())
                .with("session", self.session)
                .with("secure", self.secure)
                .with(send.name(), send),
        )
    }

    fn from_script(value: &ScriptValue) -> Result<Self, ScriptError> {
        let msg_id = value
            .get("msgId")
            .as_number()
            .ok_or_else(|| ScriptError::internal_error("message info is missing"))?;
        let text = |key: &str| value.get(key).as_str().unwrap_or_default().to_string();
        Ok(Self {
            msg_id: msg_id as u32,
            dest: text("dest"),
            path: text("path"),
            iface: text("iface"),
            member: text("member"),
            session: value.get("session").as_number().unwrap_or(0.0) as u32,
            secure: value.get("secure").truthy(),
        })
    }

    fn header(&self, msg_type: MsgType) -> WireMessage {
        WireMessage::new(msg_type, self.msg_id)
            .with_destination(self.dest.as_str())
            .with_member(self.path.as_str(), self.iface.as_str(), self.member.as_str())
            .with_session(self.session)
    }
}

/// Service object fields needed to address a message
struct Endpoint {
    dest: String,
    path: String,
    session: u32,
    interfaces: Vec<String>,
}

impl Endpoint {
    fn from_service(this: &ScriptValue) -> Self {
        let interfaces = this
            .get("interfaces")
            .as_array()
            .unwrap_or_default()
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();
        Self {
            dest: this.get("dest").as_str().unwrap_or_default().to_string(),
            path: this.get("path").as_str().unwrap_or("/").to_string(),
            session: this.get("session").as_number().unwrap_or(0.0) as u32,
            interfaces,
        }
    }
}

fn check_peer(scope: &NativeScope<'_>, dest: &str) -> Result<(), ScriptError> {
    if !dest.is_empty() && scope.ctx.discovery.session(dest).is_none() {
        return Err(ScriptError::type_error("Peer has disconnected"));
    }
    Ok(())
}

/// Resolve a member argument, either `"member"` or `{ member: "iface" }`,
/// against the interfaces of an endpoint
fn find_interface(
    objects: &ObjectTable,
    endpoint: &Endpoint,
    arg: Option<&ScriptValue>,
) -> Result<(String, String), ScriptError> {
    match arg {
        Some(ScriptValue::Object(map)) if !map.is_empty() => {
            let (member, iface) = map.iter().next().ok_or_else(|| {
                ScriptError::type_error("Require object of form { 'member-name':'interface-name' }")
            })?;
            let iface = iface.as_str().ok_or_else(|| {
                ScriptError::type_error("Require object of form { 'member-name':'interface-name' }")
            })?;
            let desc = objects
                .interface(iface)
                .ok_or_else(|| ScriptError::type_error(format!("Unknown interface: '{}'", iface)))?;
            if desc.member(member).is_none() {
                return Err(ScriptError::type_error(format!("Unknown member: '{}'", member)));
            }
            Ok((iface.to_string(), member.clone()))
        }
        Some(ScriptValue::String(member)) => objects
            .find_interface_for_member(endpoint.interfaces.iter().map(String::as_str), member)
            .map(|desc| (desc.name.clone(), member.clone()))
            .ok_or_else(|| ScriptError::type_error(format!("Unknown member: '{}'", member))),
        _ => Err(ScriptError::type_error("member must be a string")),
    }
}

fn method_info(
    scope: &NativeScope<'_>,
    endpoint: &Endpoint,
    iface: &str,
    member: &str,
) -> Result<MessageInfo, ScriptError> {
    check_peer(scope, &endpoint.dest)?;
    let objects = &scope.ctx.objects;
    let msg_id = objects
        .proxy_message_id(iface, member)
        .ok_or_else(|| ScriptError::type_error(format!("Unknown METHOD {}", member)))?;
    Ok(MessageInfo {
        msg_id,
        dest: endpoint.dest.clone(),
        path: endpoint.path.clone(),
        iface: iface.to_string(),
        member: member.to_string(),
        session: endpoint.session,
        secure: objects.is_secure(msg_id),
    })
}

fn signal_info(
    scope: &NativeScope<'_>,
    endpoint: &Endpoint,
    member_arg: Option<&ScriptValue>,
) -> Result<MessageInfo, ScriptError> {
    check_peer(scope, &endpoint.dest)?;
    let objects = &scope.ctx.objects;
    let (iface, member) = find_interface(objects, endpoint, member_arg)?;
    let msg_id = objects
        .local_message_id(&endpoint.path, &iface, &member)
        .or_else(|| objects.proxy_message_id(&iface, &member))
        .ok_or_else(|| ScriptError::type_error(format!("Unknown SIGNAL {}", member)))?;
    Ok(MessageInfo {
        msg_id,
        dest: endpoint.dest.clone(),
        path: endpoint.path.clone(),
        iface,
        member,
        session: endpoint.session,
        secure: objects.is_secure(msg_id),
    })
}

/// `service.method(member)`
pub(super) fn service_method(
    scope: &mut NativeScope<'_>,
    this: &ScriptValue,
    args: &[ScriptValue],
) -> Result<ScriptValue, ScriptError> {
    let endpoint = Endpoint::from_service(this);
    let (iface, member) = find_interface(&scope.ctx.objects, &endpoint, args.first())?;
    tracing::debug!(member = %member, iface = %iface, "Method object");
    let info = method_info(scope, &endpoint, &iface, &member)?;
    Ok(info.to_script(NativeOp::MethodCall))
}

/// `service.signal(path, member)`
pub(super) fn service_signal(
    scope: &mut NativeScope<'_>,
    this: &ScriptValue,
    args: &[ScriptValue],
) -> Result<ScriptValue, ScriptError> {
    let path = require_str(args, 0, "object path")?;
    let mut endpoint = Endpoint::from_service(this);
    endpoint.path = path.to_string();
    endpoint.interfaces = local_interfaces(&scope.ctx.objects, path)?;
    let info = signal_info(scope, &endpoint, args.get(1))?;
    Ok(info.to_script(NativeOp::SendSignal))
}

/// `AJ.signal(path, member)`: a signal with no destination and no session
pub(super) fn broadcast_signal(
    scope: &mut NativeScope<'_>,
    args: &[ScriptValue],
) -> Result<ScriptValue, ScriptError> {
    let path = require_str(args, 0, "object path")?;
    let endpoint = Endpoint {
        dest: String::new(),
        path: path.to_string(),
        session: 0,
        interfaces: local_interfaces(&scope.ctx.objects, path)?,
    };
    let info = signal_info(scope, &endpoint, args.get(1))?;
    Ok(info.to_script(NativeOp::SendSignal))
}

fn local_interfaces(objects: &ObjectTable, path: &str) -> Result<Vec<String>, ScriptError> {
    let obj = objects
        .objects()
        .iter()
        .find(|o| o.path == path)
        .ok_or_else(|| ScriptError::type_error(format!("Unknown object path '{}'", path)))?;
    Ok(obj
        .interfaces
        .iter()
        .skip(1)
        .map(|&i| objects.interfaces()[i].name.clone())
        .collect())
}

/// `service.getProp(prop)`
pub(super) fn get_prop(
    scope: &mut NativeScope<'_>,
    this: &ScriptValue,
    args: &[ScriptValue],
) -> Result<ScriptValue, ScriptError> {
    if args.first().and_then(ScriptValue::as_str).is_none() {
        return Err(ScriptError::type_error("Lone argument must be the property name"));
    }
    let endpoint = Endpoint::from_service(this);
    let (iface, prop) = find_interface(&scope.ctx.objects, &endpoint, args.first())?;
    let info = method_info(scope, &endpoint, PROPERTIES_IFACE, "Get")?;
    method_call(
        scope,
        &info.to_script(NativeOp::MethodCall),
        &[iface.into(), prop.into()],
    )
}

/// `service.setProp(prop, value)`
pub(super) fn set_prop(
    scope: &mut NativeScope<'_>,
    this: &ScriptValue,
    args: &[ScriptValue],
) -> Result<ScriptValue, ScriptError> {
    if args.first().and_then(ScriptValue::as_str).is_none() {
        return Err(ScriptError::type_error("First argument must be the property name"));
    }
    let endpoint = Endpoint::from_service(this);
    let (iface, prop) = find_interface(&scope.ctx.objects, &endpoint, args.first())?;
    let info = method_info(scope, &endpoint, PROPERTIES_IFACE, "Set")?;
    let value = args.get(1).cloned().unwrap_or_default();
    method_call(
        scope,
        &info.to_script(NativeOp::MethodCall),
        &[iface.into(), prop.into(), value],
    )
}

/// `service.getAllProps(iface)`
pub(super) fn get_all_props(
    scope: &mut NativeScope<'_>,
    this: &ScriptValue,
    args: &[ScriptValue],
) -> Result<ScriptValue, ScriptError> {
    let iface = args
        .first()
        .and_then(ScriptValue::as_str)
        .ok_or_else(|| ScriptError::type_error("First argument must be the interface name"))?
        .to_string();
    let endpoint = Endpoint::from_service(this);
    let info = method_info(scope, &endpoint, PROPERTIES_IFACE, "GetAll")?;
    method_call(scope, &info.to_script(NativeOp::MethodCall), &[iface.into()])
}

fn build_call(
    objects: &ObjectTable,
    info: &MessageInfo,
    args: &[ScriptValue],
    mut msg_flags: u8,
) -> BusResult<WireMessage> {
    let (signature, body) = if objects.accessor(info.msg_id) == Some(accessor::SET) {
        let mut writer = BodyWriter::new("ssv");
        let prop = marshal_prop_set(&mut writer, objects, args)?;
        if prop.secure {
            msg_flags |= flags::ENCRYPTED;
        }
        ("ssv".to_string(), writer.finish()?)
    } else {
        let signature = objects.signature(info.msg_id)?.to_string();
        let mut writer = BodyWriter::new(signature.as_str());
        marshal_args(&mut writer, args)?;
        (signature, writer.finish()?)
    };
    Ok(info
        .header(MsgType::MethodCall)
        .with_flags(msg_flags)
        .with_body(signature, body))
}

/// `method.call(args...)`
pub(super) fn method_call(
    scope: &mut NativeScope<'_>,
    this: &ScriptValue,
    args: &[ScriptValue],
) -> Result<ScriptValue, ScriptError> {
    if !scope.ctx.is_attached() {
        return Err(ScriptError::not_attached("method.call"));
    }
    let info = MessageInfo::from_script(this)?;
    let timeout = this
        .get("timeout")
        .as_number()
        .map(|t| t as u32)
        .unwrap_or(scope.ctx.config.call_timeout_ms);
    let mut msg_flags = 0;
    let no_reply = this.get("noReply").truthy();
    if no_reply {
        msg_flags |= flags::NO_REPLY_EXPECTED;
    }
    if info.secure {
        msg_flags |= flags::ENCRYPTED;
    }
    let mut msg = build_call(&scope.ctx.objects, &info, args, msg_flags)
        .map_err(|e| ScriptError::from_bus("method.call", &e))?;
    msg.timeout_ms = timeout;
    let serial = scope
        .ctx
        .deliver(scope.transport, msg)
        .map_err(|e| ScriptError::from_bus("method.call", &e))?;
    if no_reply {
        Ok(ScriptValue::Undefined)
    } else {
        Ok(reply_object(serial))
    }
}

/// `signal.send(args...)`
pub(super) fn send_signal(
    scope: &mut NativeScope<'_>,
    this: &ScriptValue,
    args: &[ScriptValue],
) -> Result<ScriptValue, ScriptError> {
    if !scope.ctx.is_attached() {
        return Err(ScriptError::not_attached("signal.send"));
    }
    let info = MessageInfo::from_script(this)?;
    let mut ttl = match this.get("timeToLive") {
        ScriptValue::Undefined => 0,
        other => other
            .as_number()
            .ok_or_else(|| ScriptError::type_error("timeToLive must be a number"))? as u32,
    };
    let mut msg_flags = 0;
    if this.get("sessionless").truthy() {
        msg_flags |= flags::SESSIONLESS;
        if ttl == 0 {
            ttl = u32::from(scope.ctx.config.sessionless_ttl_secs);
        }
    }
    if info.secure {
        msg_flags |= flags::ENCRYPTED;
    }
    if info.dest.is_empty() && info.session == 0 {
        msg_flags |= flags::GLOBAL_BROADCAST;
    }
    let result = (|| -> BusResult<WireMessage> {
        let signature = scope.ctx.objects.signature(info.msg_id)?.to_string();
        let mut writer = BodyWriter::new(signature.as_str());
        marshal_args(&mut writer, args)?;
        let mut msg = info
            .header(MsgType::Signal)
            .with_flags(msg_flags)
            .with_body(signature, writer.finish()?);
        msg.ttl = ttl;
        Ok(msg)
    })();
    let msg = result.map_err(|e| ScriptError::from_bus("signal.send", &e))?;
    scope
        .ctx
        .deliver(scope.transport, msg)
        .map_err(|e| ScriptError::from_bus("signal.send", &e))?;
    Ok(ScriptValue::Undefined)
}

fn build_reply(objects: &ObjectTable, rc: &ReplyContext, args: &[ScriptValue]) -> BusResult<WireMessage> {
    let first = args.first().cloned().unwrap_or_default();
    let (signature, body) = match rc.accessor {
        Some(accessor::GET) => {
            let prop_sig = rc.prop_sig.as_deref().ok_or(BusError::NoMatch)?;
            let mut writer = BodyWriter::new("v");
            marshal_prop(&mut writer, prop_sig, &first)?;
            ("v".to_string(), writer.finish()?)
        }
        Some(accessor::GET_ALL) => {
            let iface = rc.prop_iface.as_deref().and_then(|name| objects.interface(name));
            let mut writer = BodyWriter::new("a{sv}");
            marshal_properties(&mut writer, iface, &first)?;
            ("a{sv}".to_string(), writer.finish()?)
        }
        _ => {
            let signature = match objects.signature(reply_id(rc.msg_id)) {
                Ok(sig) => sig.to_string(),
                Err(BusError::NoMatch) if args.is_empty() => String::new(),
                Err(e) => return Err(e),
            };
            let mut writer = BodyWriter::new(signature.as_str());
            marshal_args(&mut writer, args)?;
            (signature, writer.finish()?)
        }
    };
    Ok(message::method_reply(rc).with_body(signature, body))
}

/// `msg.reply(args...)`
pub(super) fn reply(
    scope: &mut NativeScope<'_>,
    handle: ReplyHandle,
    args: &[ScriptValue],
) -> Result<ScriptValue, ScriptError> {
    let rc = scope.ctx.replies.take(handle)?;
    tracing::debug!(serial = rc.serial, sender = %rc.sender, "Reply for serial");
    let msg = build_reply(&scope.ctx.objects, &rc, args)
        .map_err(|e| ScriptError::from_bus("method reply", &e))?;
    scope
        .ctx
        .deliver(scope.transport, msg)
        .map_err(|e| ScriptError::from_bus("method reply", &e))?;
    scope.ctx.metrics.record_reply_sent();
    Ok(ScriptValue::Undefined)
}

/// `msg.errorReply(text)`
pub(super) fn error_reply(
    scope: &mut NativeScope<'_>,
    handle: ReplyHandle,
    args: &[ScriptValue],
) -> Result<ScriptValue, ScriptError> {
    let text = require_str(args, 0, "error")?;
    let rc = scope.ctx.replies.take(handle)?;
    let msg = message::error_reply(&rc, ERR_REJECTED, Some(text))
        .map_err(|e| ScriptError::from_bus("method reply", &e))?;
    scope
        .ctx
        .deliver(scope.transport, msg)
        .map_err(|e| ScriptError::from_bus("method reply", &e))?;
    scope.ctx.metrics.record_reply_sent();
    Ok(ScriptValue::Undefined)
}

/// `reply.onReply(callback)`
pub(super) fn on_reply(
    scope: &mut NativeScope<'_>,
    serial: u32,
    args: &[ScriptValue],
) -> Result<ScriptValue, ScriptError> {
    let callback = args
        .first()
        .and_then(ScriptValue::as_callable)
        .ok_or_else(|| ScriptError::type_error("onReply requires a function"))?;
    if scope.ctx.correlator.register(serial, callback).is_some() {
        tracing::debug!(serial, "Replaced reply callback");
    }
    Ok(ScriptValue::Undefined)
}
