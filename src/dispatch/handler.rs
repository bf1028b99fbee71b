//! Application-path dispatch to script handlers.

use super::session;
use crate::context::{BusContext, HandlerKind};
use crate::correlator::{ReplyContext, ReplyHandle};
use crate::discovery::PendingCallback;
use crate::engine::ScriptEngine;
use crate::error::{BusError, BusResult, ScriptError};
use crate::message::{self, ERR_REJECTED, ERR_SECURITY_VIOLATION};
use crate::metrics::HandlerTimer;
use crate::natives::NativeScope;
use crate::services::ServiceRegistry;
use crate::value::{Callable, ScriptValue};
use crate::wire::{accessor, ids, BusTransport, MsgType, WireMessage};

/// Everything one dispatch turn needs to run script code
pub(crate) struct Turn<'a> {
    pub engine: &'a mut dyn ScriptEngine,
    pub ctx: &'a mut BusContext,
    pub transport: &'a mut dyn BusTransport,
}

impl<'a> Turn<'a> {
    pub fn new(
        engine: &'a mut dyn ScriptEngine,
        ctx: &'a mut BusContext,
        transport: &'a mut dyn BusTransport,
    ) -> Self {
        Self {
            engine,
            ctx,
            transport,
        }
    }

    /// Call a script function in protected mode, timing it
    pub fn call(
        &mut self,
        func: Callable,
        this: ScriptValue,
        args: Vec<ScriptValue>,
    ) -> Result<ScriptValue, ScriptError> {
        let timer = HandlerTimer::start();
        let result = {
            let mut scope = NativeScope::new(&mut *self.ctx, &mut *self.transport);
            self.engine.call(func, this, args, &mut scope)
        };
        timer.finish(&self.ctx.metrics, result.is_ok());
        result
    }

    /// Run service-object callbacks, logging failures
    pub fn run_callbacks(&mut self, pending: Vec<PendingCallback>) {
        for cb in pending {
            let svc = cb.service.to_script();
            if let Err(e) = self.call(cb.callback, ScriptValue::Undefined, vec![svc]) {
                tracing::error!(peer = %cb.service.dest, error = %e, "Service callback failed");
            }
        }
    }

    pub fn deliver(&mut self, msg: WireMessage) -> BusResult<u32> {
        self.ctx.deliver(&mut *self.transport, msg)
    }
}

/// Handle a message on the application path
pub(crate) fn handle_app_message(
    turn: &mut Turn<'_>,
    services: &mut ServiceRegistry,
    msg: &WireMessage,
) -> BusResult<()> {
    if msg.msg_id == ids::REPLY_JOIN_SESSION {
        return session::on_join_reply(turn, msg);
    }
    match services.handle_message(msg, turn.ctx, &mut *turn.transport) {
        Err(BusError::NoMatch) => {}
        handled => return handled,
    }
    match msg.msg_type {
        MsgType::Signal => match msg.msg_id {
            ids::SIGNAL_ABOUT_ANNOUNCE => session::on_announcement(turn, msg),
            ids::SIGNAL_FOUND_ADV_NAME => session::on_found_name(turn, msg),
            ids::SIGNAL_SESSION_LOST | ids::SIGNAL_SESSION_LOST_WITH_REASON => {
                session::on_session_lost(turn, msg)
            }
            _ => invoke_handler(turn, msg, HandlerKind::Signal, None),
        },
        MsgType::MethodCall => {
            let accessor = turn.ctx.objects.accessor(msg.msg_id);
            let kind = match accessor {
                None => HandlerKind::MethodCall,
                Some(accessor::GET) => HandlerKind::PropGet,
                Some(accessor::SET) => HandlerKind::PropSet,
                Some(accessor::GET_ALL) => HandlerKind::PropGetAll,
                Some(other) => {
                    tracing::warn!(accessor = other, "Unknown property accessor");
                    return reject(turn, msg, None);
                }
            };
            invoke_handler(turn, msg, kind, accessor)
        }
        MsgType::Reply | MsgType::Error => dispatch_reply(turn, msg),
    }
}

fn invoke_handler(
    turn: &mut Turn<'_>,
    msg: &WireMessage,
    kind: HandlerKind,
    accessor: Option<u8>,
) -> BusResult<()> {
    let Some(func) = turn.ctx.handler(kind) else {
        if msg.msg_type == MsgType::MethodCall {
            tracing::warn!(handler = kind.script_name(), member = %msg.member, "No handler registered - rejecting call");
            return reject(turn, msg, None);
        }
        tracing::debug!(handler = kind.script_name(), member = %msg.member, "No handler registered - ignoring signal");
        return Ok(());
    };

    let (this, handle) = message::message_object(turn.ctx, msg, accessor);
    let args = match message::unmarshal_message_args(turn.ctx, msg, accessor, handle) {
        Ok(args) => args,
        Err(e) => {
            if let Some(h) = handle {
                fail_call(turn, h, &e)?;
            }
            return Err(e);
        }
    };

    if let Err(e) = turn.call(func, this, args) {
        tracing::error!(handler = kind.script_name(), error = %e, "Script handler failed");
        if let Some(h) = handle {
            // the handler may have replied before throwing
            if let Ok(rc) = turn.ctx.replies.take(h) {
                let reply = message::error_reply(&rc, ERR_REJECTED, Some(&e.message))?;
                turn.deliver(reply)?;
            }
        }
    }
    Ok(())
}

fn dispatch_reply(turn: &mut Turn<'_>, msg: &WireMessage) -> BusResult<()> {
    let Some(callback) = turn.ctx.correlator.take(msg.reply_serial) else {
        turn.ctx.metrics.record_unmatched_reply();
        tracing::debug!(reply_serial = msg.reply_serial, "Dropping reply with no callback");
        return Ok(());
    };
    let (this, _) = message::message_object(turn.ctx, msg, None);
    let args = message::unmarshal_message_args(turn.ctx, msg, None, None)?;
    if let Err(e) = turn.call(callback, this, args) {
        tracing::error!(reply_serial = msg.reply_serial, error = %e, "Reply callback failed");
    }
    Ok(())
}

/// Answer a call nobody handles with a rejection
fn reject(turn: &mut Turn<'_>, msg: &WireMessage, info: Option<&str>) -> BusResult<()> {
    turn.ctx.metrics.record_rejected_call();
    let reply = message::error_reply(&ReplyContext::from_call(msg, None), ERR_REJECTED, info)?;
    turn.deliver(reply).map(|_| ())
}

fn fail_call(turn: &mut Turn<'_>, handle: ReplyHandle, err: &BusError) -> BusResult<()> {
    let Ok(rc) = turn.ctx.replies.take(handle) else {
        return Ok(());
    };
    let reply = match err {
        BusError::Security(_) => message::error_reply(&rc, ERR_SECURITY_VIOLATION, None)?,
        other => message::error_reply(&rc, ERR_REJECTED, Some(other.status_text()))?,
    };
    turn.deliver(reply).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::engine::ClosureEngine;
    use crate::interface::{InterfaceDescription, ObjectTable};
    use crate::propstore::{MemoryStorage, PropertyStore};
    use crate::wire::signature as sig;
    use crate::wire::{encode_id, flags, BodyWriter, MemoryTransport, APP_LIST};
    use std::sync::{Arc, Mutex};

    const ADD: u32 = encode_id(APP_LIST, 0, 1, 0);
    const LEVEL_GET: u32 = encode_id(APP_LIST, 0, 0, accessor::GET);

    fn create_context() -> BusContext {
        let mut objects = ObjectTable::new();
        objects
            .add_interface(InterfaceDescription::parse(&["org.example.Calc", "?add a<i b<i sum>i"]).unwrap())
            .unwrap();
        objects
            .add_interface(InterfaceDescription::parse(&["$org.example.Vault", "@Pin=u"]).unwrap())
            .unwrap();
        objects.add_object("/calc", &["org.example.Calc", "org.example.Vault"]).unwrap();
        let properties = PropertyStore::open(Box::new(MemoryStorage::new()), None).unwrap();
        let mut ctx = BusContext::new(BridgeConfig::default(), objects, properties);
        ctx.attach(":1.1");
        ctx
    }

    fn create_add_call(a: i32, b: i32) -> WireMessage {
        let mut writer = BodyWriter::new("ii");
        writer.put_i32(a).unwrap();
        writer.put_i32(b).unwrap();
        WireMessage::new(MsgType::MethodCall, ADD)
            .with_serial(42)
            .with_sender(":1.7")
            .with_member("/calc", "org.example.Calc", "add")
            .with_body("ii", writer.finish().unwrap())
    }

    fn dispatch(
        engine: &mut ClosureEngine,
        ctx: &mut BusContext,
        transport: &mut MemoryTransport,
        msg: &WireMessage,
    ) -> BusResult<()> {
        let mut services = ServiceRegistry::new();
        let mut turn = Turn::new(engine, ctx, transport);
        handle_app_message(&mut turn, &mut services, msg)
    }

    #[test]
    fn test_method_call_reply() {
        let mut engine = ClosureEngine::new();
        let mut ctx = create_context();
        let mut transport = MemoryTransport::new();
        let handler = engine.register(|this, args, host| {
            let sum = args[0].to_number() + args[1].to_number();
            host.call_method(this, "reply", &[sum.into()])
        });
        ctx.set_handler(HandlerKind::MethodCall, Some(handler));

        dispatch(&mut engine, &mut ctx, &mut transport, &create_add_call(2, 3)).unwrap();

        assert_eq!(transport.sent.len(), 1);
        let reply = &transport.sent[0];
        assert_eq!(reply.msg_type, MsgType::Reply);
        assert_eq!(reply.reply_serial, 42);
        assert_eq!(reply.reader().get_i32().unwrap(), 5);
        assert!(ctx.replies.is_empty());
    }

    #[test]
    fn test_call_without_handler_is_rejected() {
        let mut engine = ClosureEngine::new();
        let mut ctx = create_context();
        let mut transport = MemoryTransport::new();

        dispatch(&mut engine, &mut ctx, &mut transport, &create_add_call(1, 1)).unwrap();

        let reply = &transport.sent[0];
        assert_eq!(reply.msg_type, MsgType::Error);
        assert_eq!(reply.error_name, ERR_REJECTED);
        assert_eq!(ctx.metrics.snapshot().rejected_calls, 1);
    }

    #[test]
    fn test_throwing_handler_sends_error_reply() {
        let mut engine = ClosureEngine::new();
        let mut ctx = create_context();
        let mut transport = MemoryTransport::new();
        let handler = engine.register(|_, _, _| Err(ScriptError::type_error("boom")));
        ctx.set_handler(HandlerKind::MethodCall, Some(handler));

        dispatch(&mut engine, &mut ctx, &mut transport, &create_add_call(1, 1)).unwrap();

        let reply = &transport.sent[0];
        assert_eq!(reply.msg_type, MsgType::Error);
        assert_eq!(reply.reader().get_string(sig::STRING).unwrap(), "boom");
        assert_eq!(ctx.metrics.snapshot().handler_failures, 1);
    }

    #[test]
    fn test_secure_property_requires_encryption() {
        let mut engine = ClosureEngine::new();
        let mut ctx = create_context();
        let mut transport = MemoryTransport::new();
        let calls = Arc::new(Mutex::new(0));
        let seen = calls.clone();
        let handler = engine.register(move |_, _, _| {
            *seen.lock().unwrap() += 1;
            Ok(ScriptValue::Undefined)
        });
        ctx.set_handler(HandlerKind::PropGet, Some(handler));

        let mut writer = BodyWriter::new("ss");
        writer.put_string(sig::STRING, "org.example.Vault").unwrap();
        writer.put_string(sig::STRING, "Pin").unwrap();
        let get = WireMessage::new(MsgType::MethodCall, LEVEL_GET)
            .with_serial(9)
            .with_sender(":1.7")
            .with_body("ss", writer.finish().unwrap());

        let result = dispatch(&mut engine, &mut ctx, &mut transport, &get);
        assert!(matches!(result, Err(BusError::Security(_))));
        assert_eq!(*calls.lock().unwrap(), 0);
        assert_eq!(transport.sent[0].error_name, ERR_SECURITY_VIOLATION);

        let encrypted = get.clone().with_flags(flags::ENCRYPTED);
        dispatch(&mut engine, &mut ctx, &mut transport, &encrypted).unwrap();
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[test]
    fn test_reply_callback_runs_once() {
        let mut engine = ClosureEngine::new();
        let mut ctx = create_context();
        let mut transport = MemoryTransport::new();
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();
        let callback = engine.register(move |_, args, _| {
            sink.lock().unwrap().push(args[0].to_number());
            Ok(ScriptValue::Undefined)
        });
        ctx.correlator.register(77, callback);

        let mut writer = BodyWriter::new("i");
        writer.put_i32(12).unwrap();
        let reply = WireMessage::new(MsgType::Reply, crate::wire::reply_id(ADD))
            .with_reply_serial(77)
            .with_body("i", writer.finish().unwrap());

        dispatch(&mut engine, &mut ctx, &mut transport, &reply).unwrap();
        dispatch(&mut engine, &mut ctx, &mut transport, &reply).unwrap();

        assert_eq!(*results.lock().unwrap(), vec![12.0]);
        assert_eq!(ctx.metrics.snapshot().unmatched_replies, 1);
    }

    #[test]
    fn test_signal_handler_gets_message_object() {
        let mut engine = ClosureEngine::new();
        let mut ctx = create_context();
        let mut transport = MemoryTransport::new();
        let members = Arc::new(Mutex::new(Vec::new()));
        let sink = members.clone();
        let handler = engine.register(move |this, _, _| {
            sink.lock().unwrap().push(this.get("member").as_str().unwrap_or_default().to_string());
            Ok(ScriptValue::Undefined)
        });
        ctx.set_handler(HandlerKind::Signal, Some(handler));

        let signal = WireMessage::new(MsgType::Signal, encode_id(APP_LIST, 0, 1, 1))
            .with_sender(":1.9")
            .with_member("/calc", "org.example.Calc", "changed");
        dispatch(&mut engine, &mut ctx, &mut transport, &signal).unwrap();

        assert_eq!(*members.lock().unwrap(), vec!["changed".to_string()]);
        assert!(transport.sent.is_empty());
    }
}
