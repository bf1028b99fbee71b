//! Built-in service pre-handlers.
//!
//! Every application-path message is offered to the registered services
//! before script code sees it. A service that does not recognise a message
//! declines with [`BusError::NoMatch`] and the next one is tried.

pub mod config;
pub mod notification;

pub use config::ConfigService;
pub use notification::NotificationService;

use crate::context::BusContext;
use crate::correlator::ReplyContext;
use crate::error::{BusError, BusResult};
use crate::message;
use crate::wire::{BusTransport, BodyWriter, WireMessage};

/// Object list holding the objects of built-in services
pub const SERVICE_LIST: u8 = 3;

/// A built-in service that may consume messages before script handlers
pub trait ServiceHandler: Send {
    /// Service name for logging
    fn name(&self) -> &'static str;

    /// Handle a message, or decline it with [`BusError::NoMatch`]
    fn handle_message(
        &mut self,
        msg: &WireMessage,
        ctx: &mut BusContext,
        transport: &mut dyn BusTransport,
    ) -> BusResult<()>;

    /// Whether the service accepts a session on a port it bound itself
    fn check_session_accepted(&mut self, _port: u16, _session_id: u32, _joiner: &str) -> bool {
        false
    }
}

fn send_reply(
    ctx: &mut BusContext,
    transport: &mut dyn BusTransport,
    msg: &WireMessage,
    body: Option<(&str, Vec<u8>)>,
) -> BusResult<()> {
    let mut reply = message::method_reply(&ReplyContext::from_call(msg, None));
    if let Some((signature, bytes)) = body {
        reply = reply.with_body(signature, bytes);
    }
    ctx.deliver(transport, reply).map(|_| ())
}

/// Reply to a `Version` property get
fn version_reply(
    ctx: &mut BusContext,
    transport: &mut dyn BusTransport,
    msg: &WireMessage,
    version: u16,
) -> BusResult<()> {
    let mut writer = BodyWriter::new("v");
    writer.open_variant("q")?;
    writer.put_u16(version)?;
    send_reply(ctx, transport, msg, Some(("v", writer.finish()?)))
}

/// Ordered list of service pre-handlers
#[derive(Default)]
pub struct ServiceRegistry {
    services: Vec<Box<dyn ServiceHandler>>,
}

impl ServiceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the services every bridge runs
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(ConfigService::new()));
        registry.register(Box::new(NotificationService::new()));
        registry
    }

    /// Append a service; earlier services get first refusal
    pub fn register(&mut self, service: Box<dyn ServiceHandler>) {
        tracing::debug!(service = service.name(), "Registered service handler");
        self.services.push(service);
    }

    /// Number of registered services
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether no services are registered
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Offer a message to each service in turn
    ///
    /// Returns [`BusError::NoMatch`] when every service declined.
    pub fn handle_message(
        &mut self,
        msg: &WireMessage,
        ctx: &mut BusContext,
        transport: &mut dyn BusTransport,
    ) -> BusResult<()> {
        for service in &mut self.services {
            match service.handle_message(msg, ctx, transport) {
                Err(BusError::NoMatch) => continue,
                Err(e) => {
                    tracing::warn!(service = service.name(), error = %e, "Service handler failed");
                    return Err(e);
                }
                Ok(()) => return Ok(()),
            }
        }
        Err(BusError::NoMatch)
    }

    /// Whether any service accepts the session
    pub fn check_session_accepted(&mut self, port: u16, session_id: u32, joiner: &str) -> bool {
        self.services
            .iter_mut()
            .any(|s| s.check_session_accepted(port, session_id, joiner))
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.services.iter().map(|s| s.name()).collect();
        f.debug_struct("ServiceRegistry").field("services", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::interface::ObjectTable;
    use crate::propstore::{MemoryStorage, PropertyStore};
    use crate::wire::{MemoryTransport, MsgType};

    struct PortService {
        port: u16,
        handled: usize,
    }

    impl ServiceHandler for PortService {
        fn name(&self) -> &'static str {
            "port"
        }

        fn handle_message(
            &mut self,
            msg: &WireMessage,
            _ctx: &mut BusContext,
            _transport: &mut dyn BusTransport,
        ) -> BusResult<()> {
            if msg.msg_id == self.port as u32 {
                self.handled += 1;
                Ok(())
            } else {
                Err(BusError::NoMatch)
            }
        }

        fn check_session_accepted(&mut self, port: u16, _session_id: u32, _joiner: &str) -> bool {
            port == self.port
        }
    }

    fn create_context() -> BusContext {
        let properties = PropertyStore::open(Box::new(MemoryStorage::new()), None).unwrap();
        BusContext::new(BridgeConfig::default(), ObjectTable::new(), properties)
    }

    #[test]
    fn test_declined_messages_fall_through() {
        let mut registry = ServiceRegistry::new();
        registry.register(Box::new(PortService { port: 7, handled: 0 }));
        registry.register(Box::new(PortService { port: 9, handled: 0 }));
        let mut ctx = create_context();
        let mut transport = MemoryTransport::new();

        let msg = WireMessage::new(MsgType::MethodCall, 9);
        assert!(registry.handle_message(&msg, &mut ctx, &mut transport).is_ok());

        let msg = WireMessage::new(MsgType::MethodCall, 11);
        assert_eq!(
            registry.handle_message(&msg, &mut ctx, &mut transport),
            Err(BusError::NoMatch)
        );
    }

    #[test]
    fn test_session_check() {
        let mut registry = ServiceRegistry::new();
        registry.register(Box::new(PortService { port: 1000, handled: 0 }));
        assert!(registry.check_session_accepted(1000, 5, ":1.4"));
        assert!(!registry.check_session_accepted(1001, 5, ":1.4"));
    }

    #[test]
    fn test_defaults_include_config_and_notification() {
        let mut registry = ServiceRegistry::with_defaults();
        assert_eq!(registry.len(), 2);
        let debug = format!("{:?}", registry);
        assert!(debug.contains("config"));
        assert!(debug.contains("notification"));
        assert!(registry.check_session_accepted(notification::PRODUCER_PORT, 3, ":1.4"));
    }
}
