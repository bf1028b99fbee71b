//! The message loop.
//!
//! One iteration checks the script stack, services I/O, timers and
//! announcements, then receives at most one message and routes it:
//!
//! - bus traffic goes to the transport's generic handler
//! - `AcceptSession` requests and `BindSessionPort` replies are session
//!   bookkeeping
//! - everything else is offered to the built-in services and then to the
//!   script handlers
//!
//! Statuses other than the fatal ones are logged and the loop continues.

pub mod announce;
pub mod classify;
mod handler;
mod session;
pub mod timers;

pub use announce::{AboutAnnouncer, Announcer};
pub use classify::{classify, MessageClass};
pub use session::BIND_SESSION_SUCCESS;
pub use timers::{ScriptTimers, SharedTimers, TimerService};

use crate::context::{BusContext, DeferredOp};
use crate::engine::ScriptEngine;
use crate::error::{BusError, BusResult};
use crate::services::{ServiceHandler, ServiceRegistry};
use crate::value::ScriptValue;
use crate::wire::{BusTransport, WireMessage};
use handler::Turn;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::instrument;

/// Peripheral I/O polled once per loop iteration
pub trait IoService: Send {
    /// Service pending I/O; only a fatal status ends the loop
    fn service(&mut self, ctx: &mut BusContext) -> BusResult<()>;
}

/// Host without peripheral I/O
#[derive(Debug, Default, Clone, Copy)]
pub struct NoIo;

impl IoService for NoIo {
    fn service(&mut self, _ctx: &mut BusContext) -> BusResult<()> {
        Ok(())
    }
}

/// Dispatch loop over a script engine and a bus transport
pub struct MessageLoop<E, T> {
    engine: E,
    transport: T,
    ctx: BusContext,
    services: ServiceRegistry,
    timers: Box<dyn TimerService>,
    io: Box<dyn IoService>,
    announcer: Box<dyn Announcer>,
    baseline: Option<usize>,
    wait_ms: u32,
    stop: Arc<AtomicBool>,
}

impl<E: ScriptEngine, T: BusTransport> MessageLoop<E, T> {
    /// Create a loop with the default services, timers and announcer
    pub fn new(engine: E, transport: T, ctx: BusContext) -> Self {
        let wait_ms = ctx.config.max_wait_ms;
        let timers = ctx.timers.clone();
        Self {
            engine,
            transport,
            ctx,
            services: ServiceRegistry::with_defaults(),
            timers: Box::new(timers),
            io: Box::new(NoIo),
            announcer: Box::new(AboutAnnouncer::new()),
            baseline: None,
            wait_ms,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Replace the service registry
    pub fn with_services(mut self, services: ServiceRegistry) -> Self {
        self.services = services;
        self
    }

    /// Add a service after the existing ones
    pub fn with_service(mut self, service: Box<dyn ServiceHandler>) -> Self {
        self.services.register(service);
        self
    }

    /// Replace the timer service
    pub fn with_timers(mut self, timers: impl TimerService + 'static) -> Self {
        self.timers = Box::new(timers);
        self
    }

    /// Replace the I/O service
    pub fn with_io(mut self, io: impl IoService + 'static) -> Self {
        self.io = Box::new(io);
        self
    }

    /// Replace the announcer
    pub fn with_announcer(mut self, announcer: impl Announcer + 'static) -> Self {
        self.announcer = Box::new(announcer);
        self
    }

    /// Bridge state
    pub fn context(&self) -> &BusContext {
        &self.ctx
    }

    /// Mutable bridge state
    pub fn context_mut(&mut self) -> &mut BusContext {
        &mut self.ctx
    }

    /// Script engine
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Mutable script engine
    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    /// Bus transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Mutable bus transport
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Flag that stops [`MessageLoop::run`] at the next iteration
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Take the loop apart
    pub fn into_parts(self) -> (E, T, BusContext) {
        (self.engine, self.transport, self.ctx)
    }

    /// Run until a fatal status or a stop request
    ///
    /// Returns `Ok` when stopped, otherwise the status that ended the loop:
    /// a transport failure, or [`BusError::Restart`] /
    /// [`BusError::RestartApp`] when a restart was requested.
    #[instrument(skip(self), fields(unique_name = ?self.ctx.unique_name()))]
    pub fn run(&mut self) -> BusResult<()> {
        tracing::info!(app_port = self.ctx.config.app_port, "Message loop starting");
        self.transport.set_link_timeout(self.ctx.config.link_timeout_secs);
        self.baseline = Some(self.engine.stack().depth());

        let status = loop {
            if self.stop.load(Ordering::Relaxed) {
                break Ok(());
            }
            if let Err(e) = self.run_once() {
                break Err(e);
            }
        };

        {
            let mut turn = Turn::new(&mut self.engine, &mut self.ctx, &mut self.transport);
            session::end_sessions(&mut turn);
        }
        self.engine.clear_pinned();
        match &status {
            Ok(()) => tracing::info!("Message loop stopped"),
            Err(e) => tracing::warn!(status = e.status_text(), error = %e, "Message loop exiting"),
        }
        status
    }

    /// Run one loop iteration
    ///
    /// Returns an error only for statuses that end the loop.
    pub fn run_once(&mut self) -> BusResult<()> {
        self.check_stack();
        self.engine.clear_pinned();
        continue_unless_fatal("I/O service", self.io.service(&mut self.ctx))?;
        self.run_timers();
        continue_unless_fatal(
            "Announcement",
            self.announcer.service(&mut self.ctx, &mut self.transport),
        )?;

        let msg = match self.transport.receive(self.wait_ms) {
            Ok(msg) => msg,
            Err(e) if e.is_idle() => {
                self.ctx.metrics.record_idle();
                return Ok(());
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                tracing::warn!(status = e.status_text(), "Receive failed");
                return Ok(());
            }
        };

        let status = self.dispatch(&msg);
        self.transport.close(msg);
        continue_unless_fatal("Dispatch", status)?;
        self.transport.notify_link_active();
        self.run_deferred()
    }

    fn dispatch(&mut self, msg: &WireMessage) -> BusResult<()> {
        let class = classify(msg);
        self.ctx.metrics.record_message(class);
        tracing::debug!(
            msg_id = format_args!("{:08x}", msg.msg_id),
            serial = msg.serial,
            sender = %msg.sender,
            ?class,
            "Received message"
        );
        let mut turn = Turn::new(&mut self.engine, &mut self.ctx, &mut self.transport);
        match class {
            MessageClass::Bus => turn.transport.handle_bus_message(msg),
            MessageClass::AcceptSession => session::accept_session(&mut turn, &mut self.services, msg),
            MessageClass::BindReply => {
                session::on_bind_reply(&mut turn, &mut self.services, self.announcer.as_mut(), msg)
            }
            MessageClass::App => handler::handle_app_message(&mut turn, &mut self.services, msg),
        }
    }

    fn check_stack(&mut self) {
        let depth = self.engine.stack().depth();
        let Some(baseline) = self.baseline else {
            self.baseline = Some(depth);
            return;
        };
        if depth != baseline && self.ctx.config.check_stack_balance {
            tracing::error!(depth, expected = baseline, "Script stack is unbalanced");
            self.engine.stack_mut().truncate(baseline);
        }
    }

    fn run_timers(&mut self) {
        let due = self.timers.take_due(Instant::now());
        if !due.is_empty() {
            let mut turn = Turn::new(&mut self.engine, &mut self.ctx, &mut self.transport);
            for callback in due {
                if let Err(e) = turn.call(callback, ScriptValue::Undefined, Vec::new()) {
                    tracing::error!(error = %e, "Timer callback failed");
                }
            }
        }
        self.wait_ms = self
            .timers
            .next_wait_ms(Instant::now(), self.ctx.config.max_wait_ms);
    }

    fn run_deferred(&mut self) -> BusResult<()> {
        match self.ctx.take_deferred() {
            None => Ok(()),
            Some(DeferredOp::FactoryReset) => {
                tracing::warn!("Factory reset");
                if let Err(e) = self.ctx.properties.factory_reset() {
                    tracing::error!(error = %e, "Factory reset failed");
                }
                Err(BusError::Restart)
            }
            Some(DeferredOp::Restart) => {
                tracing::info!("Restart requested");
                Err(BusError::RestartApp)
            }
        }
    }
}

/// Pass fatal statuses through; log anything else and carry on
fn continue_unless_fatal(step: &str, result: BusResult<()>) -> BusResult<()> {
    match result {
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            tracing::warn!(step, status = e.status_text(), error = %e, "Got error - continuing anyway");
            Ok(())
        }
        Ok(()) => Ok(()),
    }
}

impl<E, T> std::fmt::Debug for MessageLoop<E, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageLoop")
            .field("ctx", &self.ctx)
            .field("services", &self.services)
            .field("baseline", &self.baseline)
            .field("wait_ms", &self.wait_ms)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::context::HandlerKind;
    use crate::engine::ClosureEngine;
    use crate::interface::ObjectTable;
    use crate::propstore::{MemoryStorage, PropertyStore};
    use crate::wire::{ids, MemoryTransport, MsgType};
    use parking_lot::Mutex;
    use std::time::Duration;

    fn create_loop() -> MessageLoop<ClosureEngine, MemoryTransport> {
        let properties = PropertyStore::open(Box::new(MemoryStorage::new()), None).unwrap();
        let mut ctx = BusContext::new(BridgeConfig::default(), ObjectTable::new(), properties);
        ctx.attach(":1.1");
        MessageLoop::new(ClosureEngine::new(), MemoryTransport::new(), ctx)
    }

    #[test]
    fn test_idle_iteration() {
        let mut ml = create_loop();
        ml.run_once().unwrap();
        assert_eq!(ml.context().metrics.snapshot().idle_ticks, 1);
        assert_eq!(ml.engine().pin_clears(), 1);
    }

    #[test]
    fn test_bus_messages_go_to_transport() {
        let mut ml = create_loop();
        ml.transport_mut()
            .push(WireMessage::new(MsgType::Reply, ids::REPLY_ADD_MATCH));
        ml.run_once().unwrap();

        assert_eq!(ml.transport().bus_handled, vec![ids::REPLY_ADD_MATCH]);
        assert_eq!(ml.transport().closed, 1);
        assert_eq!(ml.transport().link_notifications, 1);
    }

    #[test]
    fn test_fatal_receive_ends_run() {
        let mut ml = create_loop();
        ml.transport_mut().push_status(BusError::Read);
        assert_eq!(ml.run(), Err(BusError::Read));
        assert_eq!(ml.transport().link_timeout, Some(ml.context().config.link_timeout_secs));
    }

    struct FailingAnnouncer {
        status: BusError,
        calls: Arc<Mutex<u32>>,
    }

    impl Announcer for FailingAnnouncer {
        fn port_bound(&mut self) {}

        fn service(&mut self, _ctx: &mut BusContext, _transport: &mut dyn BusTransport) -> BusResult<()> {
            *self.calls.lock() += 1;
            Err(self.status.clone())
        }
    }

    struct FailingIo;

    impl IoService for FailingIo {
        fn service(&mut self, _ctx: &mut BusContext) -> BusResult<()> {
            Err(BusError::Resources)
        }
    }

    #[test]
    fn test_announcer_failure_is_not_fatal() {
        let calls = Arc::new(Mutex::new(0));
        let mut ml = create_loop().with_announcer(FailingAnnouncer {
            status: BusError::signature("too many arguments"),
            calls: calls.clone(),
        });
        ml.transport_mut()
            .push(WireMessage::new(MsgType::Reply, ids::REPLY_ADD_MATCH));
        ml.transport_mut().push_status(BusError::Read);

        assert_eq!(ml.run(), Err(BusError::Read));
        assert_eq!(*calls.lock(), 2);
        assert_eq!(ml.transport().bus_handled, vec![ids::REPLY_ADD_MATCH]);
    }

    #[test]
    fn test_fatal_announcer_failure_ends_loop() {
        let mut ml = create_loop().with_announcer(FailingAnnouncer {
            status: BusError::Write,
            calls: Arc::new(Mutex::new(0)),
        });
        ml.transport_mut()
            .push(WireMessage::new(MsgType::Reply, ids::REPLY_ADD_MATCH));
        assert_eq!(ml.run(), Err(BusError::Write));
        assert!(ml.transport().bus_handled.is_empty());
    }

    #[test]
    fn test_io_failure_is_not_fatal() {
        let mut ml = create_loop().with_io(FailingIo);
        ml.transport_mut()
            .push(WireMessage::new(MsgType::Reply, ids::REPLY_ADD_MATCH));
        ml.run_once().unwrap();
        assert_eq!(ml.transport().closed, 1);
    }

    #[test]
    fn test_stop_handle() {
        let mut ml = create_loop();
        ml.stop_handle().store(true, Ordering::Relaxed);
        assert_eq!(ml.run(), Ok(()));
    }

    #[test]
    fn test_deferred_restart() {
        let mut ml = create_loop();
        ml.context_mut().defer(DeferredOp::Restart);
        ml.transport_mut()
            .push(WireMessage::new(MsgType::Reply, ids::REPLY_ADD_MATCH));
        assert_eq!(ml.run_once(), Err(BusError::RestartApp));

        ml.context_mut().properties.set("DeviceName", "custom").unwrap();
        ml.context_mut().defer(DeferredOp::FactoryReset);
        ml.transport_mut()
            .push(WireMessage::new(MsgType::Reply, ids::REPLY_ADD_MATCH));
        assert_eq!(ml.run_once(), Err(BusError::Restart));
        assert_ne!(ml.context().properties.get("DeviceName"), Some("custom"));
    }

    #[test]
    fn test_unbalanced_stack_is_restored() {
        let mut ml = create_loop();
        ml.run_once().unwrap();
        ml.engine_mut().stack_mut().push(1);
        ml.engine_mut().stack_mut().push(2);
        ml.run_once().unwrap();
        assert_eq!(ml.engine().stack().depth(), 0);
    }

    #[test]
    fn test_timers_run_before_receive() {
        let fired = Arc::new(Mutex::new(0));
        let sink = fired.clone();
        let mut ml = create_loop();
        let callback = ml.engine_mut().register(move |_, _, _| {
            *sink.lock() += 1;
            Ok(ScriptValue::Undefined)
        });
        let timers: SharedTimers = Arc::new(Mutex::new(ScriptTimers::new()));
        timers.lock().set_timeout(callback, Duration::ZERO);
        let mut ml = ml.with_timers(timers.clone());

        ml.run_once().unwrap();
        ml.run_once().unwrap();
        assert_eq!(*fired.lock(), 1);
        assert!(timers.lock().is_empty());
    }

    #[test]
    fn test_context_timers_drive_default_loop() {
        let fired = Arc::new(Mutex::new(0));
        let sink = fired.clone();
        let mut ml = create_loop();
        let callback = ml.engine_mut().register(move |_, _, _| {
            *sink.lock() += 1;
            Ok(ScriptValue::Undefined)
        });
        ml.context()
            .timers
            .lock()
            .set_timeout(callback, Duration::ZERO);

        ml.run_once().unwrap();
        assert_eq!(*fired.lock(), 1);
        assert!(ml.context().timers.lock().is_empty());
    }

    #[test]
    fn test_method_call_without_handler_rejected() {
        let mut ml = create_loop();
        ml.context_mut().set_handler(HandlerKind::MethodCall, None);
        let call = WireMessage::new(MsgType::MethodCall, crate::wire::encode_id(1, 0, 1, 0))
            .with_serial(5)
            .with_sender(":1.9");
        ml.transport_mut().push(call);
        ml.run_once().unwrap();

        let sent = ml.transport_mut().take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].msg_type, MsgType::Error);
        assert_eq!(sent[0].reply_serial, 5);
        assert_eq!(ml.context().metrics.snapshot().app_messages, 1);
    }
}
