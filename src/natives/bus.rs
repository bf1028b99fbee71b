//! Bus-level natives of the `AJ` object: match rules, discovery and name
//! advertisement.

use super::call::reply_object;
use super::{require_str, NativeScope};
use crate::discovery::FindNameRegistration;
use crate::error::{BusError, ScriptError};
use crate::message;
use crate::value::{Callable, ScriptValue};

pub(super) fn get_unique_name(scope: &mut NativeScope<'_>) -> Result<ScriptValue, ScriptError> {
    Ok(scope
        .ctx
        .unique_name()
        .map(ScriptValue::from)
        .unwrap_or_default())
}

/// Match rule for a signal, sessionless or session-based
pub fn signal_rule(iface: &str, signal: &str, sessionless: bool) -> String {
    if sessionless {
        format!(
            "type='signal',sessionless='t',interface='{}',member='{}'",
            iface, signal
        )
    } else {
        format!("type='signal',interface='{}',member='{}'", iface, signal)
    }
}

/// Match rule for About announcements of objects implementing `iface`
pub fn announce_rule(iface: &str) -> String {
    format!(
        "type='signal',sessionless='t',implements='{}',interface='org.alljoyn.About',member='Announce'",
        iface
    )
}

fn send_rule(scope: &mut NativeScope<'_>, operation: &str, rule: &str, add: bool) -> Result<u32, ScriptError> {
    if !scope.ctx.is_attached() {
        return Err(ScriptError::not_attached(operation));
    }
    let msg = message::match_rule_call(rule, add).map_err(|e| ScriptError::from_bus(operation, &e))?;
    scope
        .ctx
        .deliver(scope.transport, msg)
        .map_err(|e| ScriptError::from_bus(operation, &e))
}

pub(super) fn match_rule(
    scope: &mut NativeScope<'_>,
    args: &[ScriptValue],
    add: bool,
) -> Result<ScriptValue, ScriptError> {
    let iface = require_str(args, 0, "interface name")?;
    let signal = require_str(args, 1, "signal name")?;
    let sessionless = args.get(2).map(ScriptValue::truthy).unwrap_or(false);
    let rule = signal_rule(iface, signal, sessionless);
    let serial = send_rule(scope, "MatchRule", &rule, add)?;
    Ok(reply_object(serial))
}

pub(super) fn find_service(
    scope: &mut NativeScope<'_>,
    args: &[ScriptValue],
) -> Result<ScriptValue, ScriptError> {
    let iface = require_str(args, 0, "interface name")?;
    let callback = callback_arg(args.get(1), "findService requires a callback function")?;
    let serial = send_rule(scope, "findService", &announce_rule(iface), callback.is_some())?;
    scope.ctx.discovery.set_service_callback(iface, callback);
    Ok(reply_object(serial))
}

/// `findServiceByName(name, {interfaces, path, port}, cb)`; with a transport
/// mask this is `findServiceByTransport` with the mask argument removed
pub(super) fn find_service_by_name(
    scope: &mut NativeScope<'_>,
    args: &[ScriptValue],
    transport: Option<u16>,
) -> Result<ScriptValue, ScriptError> {
    let name = require_str(args, 0, "name")?;
    tracing::info!(name, "findServiceByName");
    let callback = match args.get(2) {
        Some(ScriptValue::Function(cb)) => Some(*cb),
        _ if args.get(1).map_or(true, ScriptValue::is_undefined) => None,
        _ => {
            return Err(ScriptError::type_error(
                "findServiceByName requires a callback function",
            ))
        }
    };
    let registration = match callback {
        Some(cb) => Some(parse_registration(args.get(1), cb, transport)?),
        None => None,
    };
    if !scope.ctx.is_attached() {
        return Err(ScriptError::not_attached("findServiceByName"));
    }
    let serial = message::find_name_call(name, transport)
        .and_then(|msg| scope.ctx.deliver(scope.transport, msg))
        .map_err(|e| ScriptError::from_bus("findServiceByName", &e))?;
    scope.ctx.discovery.set_find_name(name, registration);
    Ok(reply_object(serial))
}

/// `advertiseName(name)` requests the name and advertises it on every
/// transport; `advertiseName(name, false)` cancels the advertisement
pub(super) fn advertise_name(
    scope: &mut NativeScope<'_>,
    args: &[ScriptValue],
) -> Result<ScriptValue, ScriptError> {
    let name = require_str(args, 0, "name")?;
    let start = args.get(1).map_or(true, |v| v.as_bool() == Some(true));
    if !scope.ctx.is_attached() {
        return Err(ScriptError::not_attached("advertiseName"));
    }
    let bus_error = |e: BusError| ScriptError::from_bus("advertiseName", &e);
    if start {
        let request = message::request_name_call(name).map_err(bus_error)?;
        scope.ctx.deliver(scope.transport, request).map_err(bus_error)?;
    }
    let serial = message::advertise_name_call(name, start)
        .and_then(|msg| scope.ctx.deliver(scope.transport, msg))
        .map_err(bus_error)?;
    tracing::info!(name, start, "advertiseName");
    Ok(reply_object(serial))
}

fn parse_registration(
    target: Option<&ScriptValue>,
    callback: Callable,
    transport: Option<u16>,
) -> Result<FindNameRegistration, ScriptError> {
    let target = target.filter(|v| v.is_object()).ok_or_else(|| {
        ScriptError::type_error(
            "Second arg must be an object with properties 'interfaces', 'path', and 'port'",
        )
    })?;
    let interfaces = target
        .get("interfaces")
        .as_array()
        .and_then(|list| {
            list.iter()
                .map(|v| v.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
        })
        .ok_or_else(|| {
            ScriptError::type_error("Property 'interfaces' is required and must be an array of strings")
        })?;
    let path = target
        .get("path")
        .as_str()
        .ok_or_else(|| ScriptError::type_error("Property 'path' is required and must be a string"))?;
    let port = target
        .get("port")
        .as_number()
        .ok_or_else(|| ScriptError::type_error("Property 'port' is required and must be an integer"))?;
    Ok(FindNameRegistration {
        interfaces,
        path: path.to_string(),
        port: port as u16,
        transport,
        callback,
    })
}

fn callback_arg(arg: Option<&ScriptValue>, message: &str) -> Result<Option<Callable>, ScriptError> {
    match arg {
        Some(ScriptValue::Function(cb)) => Ok(Some(*cb)),
        None | Some(ScriptValue::Undefined) => Ok(None),
        Some(_) => Err(ScriptError::type_error(message)),
    }
}
