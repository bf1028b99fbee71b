//! Reply correlation.
//!
//! Two side tables live here:
//!
//! - [`ReplyCorrelator`] maps the serial of an outgoing method call to the
//!   script callback registered through the call's `onReply`. An entry is
//!   removed at the moment the matching reply is dispatched, so each
//!   callback runs at most once.
//! - [`ReplyContexts`] holds what is needed to answer an inbound method call,
//!   keyed by a handle bound into the message object's `reply` and
//!   `errorReply` natives. Taking the context consumes it, which is what makes
//!   a second reply fail with "reply already sent".

use crate::error::ScriptError;
use crate::value::Callable;
use crate::wire::WireMessage;
use std::collections::{BTreeMap, HashMap};

/// Stable handle of a pending reply context
pub type ReplyHandle = u64;

/// Everything needed to compose the reply to an inbound method call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyContext {
    /// Message id of the call
    pub msg_id: u32,
    /// Header flags of the call
    pub flags: u8,
    /// Serial of the call
    pub serial: u32,
    /// Session the call arrived on
    pub session_id: u32,
    /// Caller's bus name
    pub sender: String,
    /// Property accessor kind, `None` for plain method calls
    pub accessor: Option<u8>,
    /// Property signature saved for `Get` replies
    pub prop_sig: Option<String>,
    /// Interface name saved for `GetAll` replies
    pub prop_iface: Option<String>,
}

impl ReplyContext {
    /// Capture the reply context of a method call
    pub fn from_call(msg: &WireMessage, accessor: Option<u8>) -> Self {
        Self {
            msg_id: msg.msg_id,
            flags: msg.flags,
            serial: msg.serial,
            session_id: msg.session_id,
            sender: msg.sender.clone(),
            accessor,
            prop_sig: None,
            prop_iface: None,
        }
    }
}

/// Pending reply contexts of inbound method calls
///
/// The table is bounded; when full, the oldest context is dropped and a late
/// reply to it fails as already sent.
#[derive(Debug)]
pub struct ReplyContexts {
    entries: BTreeMap<ReplyHandle, ReplyContext>,
    next_handle: ReplyHandle,
    capacity: usize,
}

impl ReplyContexts {
    /// Create a table holding at most `capacity` contexts
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            next_handle: 1,
            capacity: capacity.max(1),
        }
    }

    /// Store a context and return its handle
    pub fn insert(&mut self, context: ReplyContext) -> ReplyHandle {
        while self.entries.len() >= self.capacity {
            if let Some((handle, evicted)) = self.entries.pop_first() {
                tracing::warn!(
                    handle,
                    serial = evicted.serial,
                    sender = %evicted.sender,
                    "Dropping unanswered method call context"
                );
            }
        }
        let handle = self.next_handle;
        self.next_handle += 1;
        self.entries.insert(handle, context);
        handle
    }

    /// Look at a pending context
    pub fn get(&self, handle: ReplyHandle) -> Option<&ReplyContext> {
        self.entries.get(&handle)
    }

    /// Modify a pending context
    pub fn get_mut(&mut self, handle: ReplyHandle) -> Option<&mut ReplyContext> {
        self.entries.get_mut(&handle)
    }

    /// Consume a context; fails if the reply was already sent
    pub fn take(&mut self, handle: ReplyHandle) -> Result<ReplyContext, ScriptError> {
        self.entries
            .remove(&handle)
            .ok_or_else(ScriptError::reply_already_sent)
    }

    /// Number of pending contexts
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no contexts are pending
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every pending context
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Serial to callback table for outgoing method calls
#[derive(Debug, Default)]
pub struct ReplyCorrelator {
    pending: HashMap<u32, Callable>,
}

impl ReplyCorrelator {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the callback for replies to `serial`, returning a callback
    /// it replaces
    pub fn register(&mut self, serial: u32, callback: Callable) -> Option<Callable> {
        self.pending.insert(serial, callback)
    }

    /// Remove and return the callback for `serial`
    pub fn take(&mut self, serial: u32) -> Option<Callable> {
        self.pending.remove(&serial)
    }

    /// Whether a callback is waiting for `serial`
    pub fn is_pending(&self, serial: u32) -> bool {
        self.pending.contains_key(&serial)
    }

    /// Number of registered callbacks
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no callbacks are registered
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Forget every registration
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
