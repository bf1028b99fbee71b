//! Bus transport boundary.

use super::{MsgType, WireMessage};
use crate::error::{BusError, BusResult};
use std::collections::VecDeque;

/// Message receive/send API of the bus attachment
pub trait BusTransport {
    /// Block for the next message for at most `timeout_ms`
    ///
    /// Returns [`BusError::Timeout`] or [`BusError::Interrupted`] when nothing
    /// arrived.
    fn receive(&mut self, timeout_ms: u32) -> BusResult<WireMessage>;

    /// Transmit a fully marshaled message
    fn deliver(&mut self, msg: WireMessage) -> BusResult<()>;

    /// Generic handling for introspection, authentication and other bus
    /// traffic that script code never sees
    fn handle_bus_message(&mut self, msg: &WireMessage) -> BusResult<()>;

    /// Release a received message
    fn close(&mut self, msg: WireMessage) {
        drop(msg);
    }

    /// Tell the link monitor that traffic was seen
    fn notify_link_active(&mut self) {}

    /// Configure the link timeout
    fn set_link_timeout(&mut self, _secs: u32) {}
}

/// In-memory transport
///
/// Inbound messages are queued by the caller; everything the bridge sends is
/// recorded. Useful for driving the dispatch loop without a bus.
#[derive(Debug)]
pub struct MemoryTransport {
    inbound: VecDeque<BusResult<WireMessage>>,
    when_empty: BusError,
    /// Messages delivered by the bridge
    pub sent: Vec<WireMessage>,
    /// Ids of messages passed to the generic bus handler
    pub bus_handled: Vec<u32>,
    /// Number of received messages released
    pub closed: usize,
    /// Number of received messages handed out
    pub received: usize,
    /// Number of link activity notifications
    pub link_notifications: usize,
    /// Last configured link timeout
    pub link_timeout: Option<u32>,
    /// Fail every delivery with this status
    pub fail_deliver: Option<BusError>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    /// Create an empty transport that times out when idle
    pub fn new() -> Self {
        Self {
            inbound: VecDeque::new(),
            when_empty: BusError::Timeout,
            sent: Vec::new(),
            bus_handled: Vec::new(),
            closed: 0,
            received: 0,
            link_notifications: 0,
            link_timeout: None,
            fail_deliver: None,
        }
    }

    /// Status returned by `receive` once the queue is drained
    pub fn when_empty(mut self, status: BusError) -> Self {
        self.when_empty = status;
        self
    }

    /// Queue an inbound message
    pub fn push(&mut self, msg: WireMessage) {
        self.inbound.push_back(Ok(msg));
    }

    /// Queue an inbound receive failure
    pub fn push_status(&mut self, status: BusError) {
        self.inbound.push_back(Err(status));
    }

    /// Number of inbound messages still queued
    pub fn pending(&self) -> usize {
        self.inbound.len()
    }

    /// Remove and return everything sent so far
    pub fn take_sent(&mut self) -> Vec<WireMessage> {
        std::mem::take(&mut self.sent)
    }

    /// Sent messages of one type
    pub fn sent_of(&self, msg_type: MsgType) -> impl Iterator<Item = &WireMessage> {
        self.sent.iter().filter(move |m| m.msg_type == msg_type)
    }
}

impl BusTransport for MemoryTransport {
    fn receive(&mut self, _timeout_ms: u32) -> BusResult<WireMessage> {
        match self.inbound.pop_front() {
            Some(Ok(msg)) => {
                self.received += 1;
                Ok(msg)
            }
            Some(Err(status)) => Err(status),
            None => Err(self.when_empty.clone()),
        }
    }

    fn deliver(&mut self, msg: WireMessage) -> BusResult<()> {
        if let Some(status) = &self.fail_deliver {
            return Err(status.clone());
        }
        self.sent.push(msg);
        Ok(())
    }

    fn handle_bus_message(&mut self, msg: &WireMessage) -> BusResult<()> {
        self.bus_handled.push(msg.msg_id);
        Ok(())
    }

    fn close(&mut self, _msg: WireMessage) {
        self.closed += 1;
    }

    fn notify_link_active(&mut self) {
        self.link_notifications += 1;
    }

    fn set_link_timeout(&mut self, secs: u32) {
        self.link_timeout = Some(secs);
    }
}
