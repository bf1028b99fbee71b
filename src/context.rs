//! Bridge state shared by the dispatch loop and the natives.
//!
//! [`BusContext`] holds everything that would otherwise be ambient: the
//! attachment identity, the serial counter, both reply tables, discovery
//! state, script handler slots, script timers, notification state and the
//! property store. It is passed explicitly to every component that needs it.

use crate::config::BridgeConfig;
use crate::correlator::{ReplyContexts, ReplyCorrelator};
use crate::discovery::Discovery;
use crate::dispatch::{ScriptTimers, SharedTimers};
use crate::error::BusResult;
use crate::interface::ObjectTable;
use crate::metrics::LoopMetrics;
use crate::propstore::PropertyStore;
use crate::services::notification::NotificationProducer;
use crate::value::{Callable, ScriptValue};
use crate::wire::{BusTransport, WireMessage};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Script callback slots on the `AJ` object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    /// `onSignal`
    Signal,
    /// `onMethodCall`
    MethodCall,
    /// `onPropGet`
    PropGet,
    /// `onPropSet`
    PropSet,
    /// `onPropGetAll`
    PropGetAll,
    /// `onPeerConnected`
    PeerConnected,
    /// `onPeerDisconnected`
    PeerDisconnected,
}

impl HandlerKind {
    /// Every handler slot
    pub const ALL: [HandlerKind; 7] = [
        HandlerKind::Signal,
        HandlerKind::MethodCall,
        HandlerKind::PropGet,
        HandlerKind::PropSet,
        HandlerKind::PropGetAll,
        HandlerKind::PeerConnected,
        HandlerKind::PeerDisconnected,
    ];

    /// Property name on the `AJ` object
    pub fn script_name(self) -> &'static str {
        match self {
            HandlerKind::Signal => "onSignal",
            HandlerKind::MethodCall => "onMethodCall",
            HandlerKind::PropGet => "onPropGet",
            HandlerKind::PropSet => "onPropSet",
            HandlerKind::PropGetAll => "onPropGetAll",
            HandlerKind::PeerConnected => "onPeerConnected",
            HandlerKind::PeerDisconnected => "onPeerDisconnected",
        }
    }
}

/// Operations that cannot run while a message is being handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredOp {
    /// Wipe the property store, then restart the attachment
    FactoryReset,
    /// Restart the attachment
    Restart,
}

/// Bridge state
pub struct BusContext {
    /// Configuration
    pub config: BridgeConfig,
    /// Interface and object tables
    pub objects: ObjectTable,
    /// Pending reply contexts of inbound calls
    pub replies: ReplyContexts,
    /// Reply callbacks of outbound calls
    pub correlator: ReplyCorrelator,
    /// Sessions and service discovery
    pub discovery: Discovery,
    /// Built-in and script-defined persistent properties
    pub properties: PropertyStore,
    /// Loop metrics
    pub metrics: Arc<LoopMetrics>,
    /// Timers created by `setTimeout` and `setInterval`
    pub timers: SharedTimers,
    /// Notifications sent by script code
    pub notifications: NotificationProducer,
    unique_name: Option<String>,
    serial: u32,
    handlers: HashMap<HandlerKind, Callable>,
    deferred: Option<DeferredOp>,
}

impl BusContext {
    /// Create a detached context
    pub fn new(config: BridgeConfig, objects: ObjectTable, properties: PropertyStore) -> Self {
        let replies = ReplyContexts::new(config.max_pending_reply_contexts);
        Self {
            config,
            objects,
            replies,
            correlator: ReplyCorrelator::new(),
            discovery: Discovery::new(),
            properties,
            metrics: Arc::new(LoopMetrics::new()),
            timers: Arc::new(Mutex::new(ScriptTimers::new())),
            notifications: NotificationProducer::new(),
            unique_name: None,
            serial: 0,
            handlers: HashMap::new(),
            deferred: None,
        }
    }

    /// Share a metrics collector with the host
    pub fn with_metrics(mut self, metrics: Arc<LoopMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Record the unique name assigned by the bus
    pub fn attach(&mut self, unique_name: impl Into<String>) {
        let name = unique_name.into();
        tracing::info!(unique_name = %name, "Attached to bus");
        self.unique_name = Some(name);
    }

    /// Forget the bus identity and every per-attachment table
    pub fn detach(&mut self) {
        self.unique_name = None;
        self.replies.clear();
        self.correlator.clear();
        self.discovery.clear();
    }

    /// Unique name, `None` while detached
    pub fn unique_name(&self) -> Option<&str> {
        self.unique_name.as_deref()
    }

    /// Whether a bus attachment exists
    pub fn is_attached(&self) -> bool {
        self.unique_name.is_some()
    }

    /// Next outgoing serial number; zero is never used
    pub fn next_serial(&mut self) -> u32 {
        self.serial = self.serial.wrapping_add(1);
        if self.serial == 0 {
            self.serial = 1;
        }
        self.serial
    }

    /// Stamp serial and sender on a message and deliver it
    pub fn deliver(&mut self, transport: &mut dyn BusTransport, mut msg: WireMessage) -> BusResult<u32> {
        let serial = self.next_serial();
        msg.serial = serial;
        if let Some(name) = &self.unique_name {
            msg.sender = name.clone();
        }
        tracing::debug!(
            msg_id = format_args!("{:08x}", msg.msg_id),
            serial,
            destination = %msg.destination,
            "Delivering message"
        );
        transport.deliver(msg)?;
        Ok(serial)
    }

    /// Set or clear a script handler
    pub fn set_handler(&mut self, kind: HandlerKind, callback: Option<Callable>) {
        match callback {
            Some(cb) => {
                self.handlers.insert(kind, cb);
            }
            None => {
                self.handlers.remove(&kind);
            }
        }
    }

    /// Registered script handler
    pub fn handler(&self, kind: HandlerKind) -> Option<Callable> {
        self.handlers.get(&kind).copied()
    }

    /// Pick up every `on*` handler assigned on the script `AJ` object
    pub fn install_handlers(&mut self, aj: &ScriptValue) {
        for kind in HandlerKind::ALL {
            self.set_handler(kind, aj.get(kind.script_name()).as_callable());
        }
    }

    /// Schedule an operation to run after the current message
    pub fn defer(&mut self, op: DeferredOp) {
        self.deferred = Some(op);
    }

    /// Take the scheduled operation
    pub fn take_deferred(&mut self) -> Option<DeferredOp> {
        self.deferred.take()
    }
}

impl std::fmt::Debug for BusContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusContext")
            .field("unique_name", &self.unique_name)
            .field("serial", &self.serial)
            .field("pending_replies", &self.replies.len())
            .field("pending_callbacks", &self.correlator.len())
            .field("handlers", &self.handlers.len())
            .finish()
    }
}
