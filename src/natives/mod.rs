//! Native functions exposed to script code.
//!
//! Script code reaches the bus through a fixed set of natives. Their script
//! names are resolved once into [`NativeOp`] when the `AJ` object is built;
//! natives that carry per-call state (a reply context, a call serial) are
//! bound into [`NativeFn`] variants instead of hidden object properties.

mod bus;
mod call;
mod notify;
mod store;
mod timer;

pub use call::{reply_object, service_method_info};

use crate::context::BusContext;
use crate::correlator::ReplyHandle;
use crate::engine::NativeHost;
use crate::error::ScriptError;
use crate::value::{Callable, ObjectMap, ScriptValue};
use crate::wire::BusTransport;

/// Named native operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeOp {
    /// `AJ.getUniqueName()`
    GetUniqueName,
    /// `AJ.addMatch(iface, signal, sessionless)`
    AddMatch,
    /// `AJ.removeMatch(iface, signal, sessionless)`
    RemoveMatch,
    /// `AJ.findService(iface, callback)`
    FindService,
    /// `AJ.findServiceByName(name, {interfaces, path, port}, callback)`
    FindServiceByName,
    /// `AJ.findServiceByTransport(name, transport, {interfaces, path, port}, callback)`
    FindServiceByTransport,
    /// `AJ.load(name)`
    Load,
    /// `AJ.store(name, value)`
    Store,
    /// `print(...)`
    Print,
    /// `alert(...)`
    Alert,
    /// `AJ.signal(path, member)`, a broadcast signal from a local object
    Signal,
    /// `service.method(member)`
    Method,
    /// `service.signal(path, member)`
    ServiceSignal,
    /// `service.getProp(prop)`
    GetProp,
    /// `service.setProp(prop, value)`
    SetProp,
    /// `service.getAllProps(iface)`
    GetAllProps,
    /// `method.call(...)`
    MethodCall,
    /// `signal.send(...)`
    SendSignal,
    /// `AJ.advertiseName(name, start)`
    AdvertiseName,
    /// `AJ.notification(type, text, lang)`
    Notification,
    /// `notification.send(ttl)`
    SendNotification,
    /// `notification.cancel()`
    CancelNotification,
    /// `setTimeout(callback, ms)`
    SetTimeout,
    /// `setInterval(callback, ms)`
    SetInterval,
    /// `clearTimeout(id)`
    ClearTimeout,
    /// `clearInterval(id)`
    ClearInterval,
    /// `resetTimeout(id, ms)`
    ResetTimeout,
    /// `resetInterval(id, ms)`
    ResetInterval,
}

impl NativeOp {
    /// Members of the `AJ` object, by script name
    pub const AJ_FUNCTIONS: [NativeOp; 13] = [
        NativeOp::GetUniqueName,
        NativeOp::AdvertiseName,
        NativeOp::Notification,
        NativeOp::AddMatch,
        NativeOp::RemoveMatch,
        NativeOp::FindService,
        NativeOp::FindServiceByName,
        NativeOp::FindServiceByTransport,
        NativeOp::Load,
        NativeOp::Store,
        NativeOp::Signal,
        NativeOp::Print,
        NativeOp::Alert,
    ];

    /// Global timer functions, by script name
    pub const TIMER_FUNCTIONS: [NativeOp; 6] = [
        NativeOp::SetTimeout,
        NativeOp::SetInterval,
        NativeOp::ClearTimeout,
        NativeOp::ClearInterval,
        NativeOp::ResetTimeout,
        NativeOp::ResetInterval,
    ];

    /// Script name of the operation
    pub fn name(self) -> &'static str {
        match self {
            NativeOp::GetUniqueName => "getUniqueName",
            NativeOp::AddMatch => "addMatch",
            NativeOp::RemoveMatch => "removeMatch",
            NativeOp::FindService => "findService",
            NativeOp::FindServiceByName => "findServiceByName",
            NativeOp::FindServiceByTransport => "findServiceByTransport",
            NativeOp::Load => "load",
            NativeOp::Store => "store",
            NativeOp::Print => "print",
            NativeOp::Alert => "alert",
            NativeOp::Signal => "signal",
            NativeOp::Method => "method",
            NativeOp::ServiceSignal => "signal",
            NativeOp::GetProp => "getProp",
            NativeOp::SetProp => "setProp",
            NativeOp::GetAllProps => "getAllProps",
            NativeOp::MethodCall => "call",
            NativeOp::SendSignal => "send",
            NativeOp::AdvertiseName => "advertiseName",
            NativeOp::Notification => "notification",
            NativeOp::SendNotification => "send",
            NativeOp::CancelNotification => "cancel",
            NativeOp::SetTimeout => "setTimeout",
            NativeOp::SetInterval => "setInterval",
            NativeOp::ClearTimeout => "clearTimeout",
            NativeOp::ClearInterval => "clearInterval",
            NativeOp::ResetTimeout => "resetTimeout",
            NativeOp::ResetInterval => "resetInterval",
        }
    }

    /// Resolve a member name of the `AJ` object
    pub fn from_name(name: &str) -> Option<Self> {
        Self::AJ_FUNCTIONS.into_iter().find(|op| op.name() == name)
    }
}

/// A native function value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeFn {
    /// Named operation
    Op(NativeOp),
    /// `msg.reply(...)` bound to a pending reply context
    Reply(ReplyHandle),
    /// `msg.errorReply(text)` bound to a pending reply context
    ErrorReply(ReplyHandle),
    /// `reply.onReply(callback)` bound to a call serial
    OnReply(u32),
}

impl NativeFn {
    /// Name used in logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            NativeFn::Op(op) => op.name(),
            NativeFn::Reply(_) => "reply",
            NativeFn::ErrorReply(_) => "errorReply",
            NativeFn::OnReply(_) => "onReply",
        }
    }
}

impl From<NativeOp> for ScriptValue {
    fn from(op: NativeOp) -> Self {
        ScriptValue::Function(Callable::Native(NativeFn::Op(op)))
    }
}

impl From<NativeFn> for ScriptValue {
    fn from(native: NativeFn) -> Self {
        ScriptValue::Function(Callable::Native(native))
    }
}

/// Build the `AJ` object holding every named bus native
pub fn aj_object() -> ScriptValue {
    let mut obj = ObjectMap::new();
    for op in NativeOp::AJ_FUNCTIONS {
        obj.insert(op.name(), op.into());
    }
    ScriptValue::Object(obj)
}

/// Build the object holding the global timer functions
pub fn global_object() -> ScriptValue {
    let mut obj = ObjectMap::new();
    for op in NativeOp::TIMER_FUNCTIONS {
        obj.insert(op.name(), op.into());
    }
    ScriptValue::Object(obj)
}

/// Native call receiver with access to the bus
pub struct NativeScope<'a> {
    /// Bridge state
    pub ctx: &'a mut BusContext,
    /// Transport used for outgoing messages
    pub transport: &'a mut dyn BusTransport,
}

impl<'a> NativeScope<'a> {
    /// Create a scope over the context and transport
    pub fn new(ctx: &'a mut BusContext, transport: &'a mut dyn BusTransport) -> Self {
        Self { ctx, transport }
    }

    fn call_op(
        &mut self,
        op: NativeOp,
        this: &ScriptValue,
        args: &[ScriptValue],
    ) -> Result<ScriptValue, ScriptError> {
        match op {
            NativeOp::GetUniqueName => bus::get_unique_name(self),
            NativeOp::AddMatch => bus::match_rule(self, args, true),
            NativeOp::RemoveMatch => bus::match_rule(self, args, false),
            NativeOp::FindService => bus::find_service(self, args),
            NativeOp::FindServiceByName => bus::find_service_by_name(self, args, None),
            NativeOp::FindServiceByTransport => {
                let transport = args.get(1).map(ScriptValue::to_number).unwrap_or(f64::NAN);
                if transport.is_nan() {
                    return Err(ScriptError::type_error("transport mask must be a number"));
                }
                let rest: Vec<ScriptValue> = args
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i != 1)
                    .map(|(_, v)| v.clone())
                    .collect();
                bus::find_service_by_name(self, &rest, Some(transport as u16))
            }
            NativeOp::Load => store::load(self, args),
            NativeOp::Store => store::store(self, args),
            NativeOp::Print => {
                tracing::info!(target: "ajs::script", "{}", join_args(args));
                Ok(ScriptValue::Undefined)
            }
            NativeOp::Alert => {
                tracing::warn!(target: "ajs::script", "{}", join_args(args));
                Ok(ScriptValue::Undefined)
            }
            NativeOp::Signal => call::broadcast_signal(self, args),
            NativeOp::Method => call::service_method(self, this, args),
            NativeOp::ServiceSignal => call::service_signal(self, this, args),
            NativeOp::GetProp => call::get_prop(self, this, args),
            NativeOp::SetProp => call::set_prop(self, this, args),
            NativeOp::GetAllProps => call::get_all_props(self, this, args),
            NativeOp::MethodCall => call::method_call(self, this, args),
            NativeOp::SendSignal => call::send_signal(self, this, args),
            NativeOp::AdvertiseName => bus::advertise_name(self, args),
            NativeOp::Notification => notify::notification(self, args),
            NativeOp::SendNotification => notify::send(self, this, args),
            NativeOp::CancelNotification => notify::cancel(self, this),
            NativeOp::SetTimeout => timer::set_timer(self, args, false),
            NativeOp::SetInterval => timer::set_timer(self, args, true),
            NativeOp::ClearTimeout => timer::clear_timer(self, args, false),
            NativeOp::ClearInterval => timer::clear_timer(self, args, true),
            NativeOp::ResetTimeout => timer::reset_timer(self, args, false),
            NativeOp::ResetInterval => timer::reset_timer(self, args, true),
        }
    }
}

impl NativeHost for NativeScope<'_> {
    fn call_native(
        &mut self,
        native: NativeFn,
        this: &ScriptValue,
        args: &[ScriptValue],
    ) -> Result<ScriptValue, ScriptError> {
        self.ctx.metrics.record_native(native.name());
        match native {
            NativeFn::Op(op) => self.call_op(op, this, args),
            NativeFn::Reply(handle) => call::reply(self, handle, args),
            NativeFn::ErrorReply(handle) => call::error_reply(self, handle, args),
            NativeFn::OnReply(serial) => call::on_reply(self, serial, args),
        }
    }
}

fn join_args(args: &[ScriptValue]) -> String {
    args.iter()
        .map(ScriptValue::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Require a string argument
pub(crate) fn require_str<'v>(
    args: &'v [ScriptValue],
    idx: usize,
    what: &str,
) -> Result<&'v str, ScriptError> {
    args.get(idx)
        .and_then(ScriptValue::as_str)
        .ok_or_else(|| ScriptError::type_error(format!("{} must be a string", what)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_name_covers_aj_functions() {
        for op in NativeOp::AJ_FUNCTIONS {
            assert_eq!(NativeOp::from_name(op.name()), Some(op));
        }
        assert_eq!(NativeOp::from_name("call"), None);
        assert_eq!(NativeOp::from_name("nope"), None);
    }

    #[test]
    fn test_aj_object_members_are_natives() {
        let aj = aj_object();
        let obj = aj.as_object().unwrap();
        assert_eq!(obj.len(), NativeOp::AJ_FUNCTIONS.len());
        assert_eq!(
            aj.get("findService").as_callable(),
            Some(Callable::Native(NativeFn::Op(NativeOp::FindService)))
        );
    }

    #[test]
    fn test_global_object_holds_timer_functions() {
        let globals = global_object();
        assert_eq!(globals.as_object().unwrap().len(), 6);
        assert_eq!(
            globals.get("resetInterval").as_callable(),
            Some(Callable::Native(NativeFn::Op(NativeOp::ResetInterval)))
        );
        assert_eq!(NativeOp::from_name("setTimeout"), None);
        assert_eq!(NativeOp::from_name("advertiseName"), Some(NativeOp::AdvertiseName));
    }

    #[test]
    fn test_bound_native_names() {
        assert_eq!(NativeFn::Reply(3).name(), "reply");
        assert_eq!(NativeFn::ErrorReply(3).name(), "errorReply");
        assert_eq!(NativeFn::OnReply(9).name(), "onReply");
        assert_eq!(NativeFn::Op(NativeOp::MethodCall).name(), "call");
    }
}
