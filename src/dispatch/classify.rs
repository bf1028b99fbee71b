//! Routing of received messages.

use crate::wire::{ids, MessageId, WireMessage, BUS_LIST};
use serde::Serialize;

/// Path a received message takes through the loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageClass {
    /// Bus traffic handled by the transport
    Bus,
    /// `AcceptSession` request from a joining peer
    AcceptSession,
    /// Reply to `BindSessionPort`
    BindReply,
    /// Application path: services first, then script handlers
    App,
}

/// Classify a message by id
///
/// Session bookkeeping signals and the `JoinSession` reply live in the bus
/// list but are handled on the application path.
pub fn classify(msg: &WireMessage) -> MessageClass {
    match msg.msg_id {
        ids::METHOD_ACCEPT_SESSION => MessageClass::AcceptSession,
        ids::REPLY_BIND_SESSION_PORT => MessageClass::BindReply,
        ids::REPLY_JOIN_SESSION
        | ids::SIGNAL_ABOUT_ANNOUNCE
        | ids::SIGNAL_FOUND_ADV_NAME
        | ids::SIGNAL_SESSION_LOST
        | ids::SIGNAL_SESSION_LOST_WITH_REASON => MessageClass::App,
        id if MessageId::decode(id).list == BUS_LIST => MessageClass::Bus,
        _ => MessageClass::App,
    }
}
