//! Wire message model.
//!
//! The bus transport itself is an external collaborator; this module defines
//! the message envelope it hands to the bridge, the numeric message-id
//! encoding, and the body cursors the marshalers drive.

pub mod body;
pub mod signature;
pub mod transport;

pub use body::{BodyReader, BodyWriter};
pub use transport::{BusTransport, MemoryTransport};

use serde::{Deserialize, Serialize};

/// Message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MsgType {
    /// Method call
    MethodCall,
    /// Method reply
    Reply,
    /// Error reply
    Error,
    /// Signal
    Signal,
}

/// Header flags
pub mod flags {
    /// No reply is expected for this method call
    pub const NO_REPLY_EXPECTED: u8 = 0x01;
    /// Signal is delivered to every session-less listener
    pub const SESSIONLESS: u8 = 0x10;
    /// Signal is forwarded beyond the local daemon
    pub const GLOBAL_BROADCAST: u8 = 0x20;
    /// Body is encrypted
    pub const ENCRYPTED: u8 = 0x80;
}

/// Bit set on the message id of replies
pub const REPLY_FLAG: u32 = 0x8000_0000;

/// Object list holding bus-internal objects
pub const BUS_LIST: u8 = 0;
/// Object list holding objects the application implements
pub const APP_LIST: u8 = 1;
/// Object list holding proxies for remote objects
pub const PROXY_LIST: u8 = 2;

/// Member indices of `org.freedesktop.DBus.Properties`, interface 0 of
/// every object
pub mod accessor {
    /// `Get`
    pub const GET: u8 = 0;
    /// `Set`
    pub const SET: u8 = 1;
    /// `GetAll`
    pub const GET_ALL: u8 = 2;
}

/// Name of the standard properties interface
pub const PROPERTIES_IFACE: &str = "org.freedesktop.DBus.Properties";

/// Encode a message id from its list, object, interface and member indices
pub const fn encode_id(list: u8, obj: u8, iface: u8, member: u8) -> u32 {
    ((list as u32) << 24) | ((obj as u32) << 16) | ((iface as u32) << 8) | member as u32
}

/// Message id of the reply to `id`
pub const fn reply_id(id: u32) -> u32 {
    id | REPLY_FLAG
}

const fn bus_id(obj: u8, iface: u8, member: u8) -> u32 {
    encode_id(BUS_LIST, obj, iface, member)
}

/// Decoded message id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageId {
    /// Object list
    pub list: u8,
    /// Object index within the list
    pub obj: u8,
    /// Interface index within the object
    pub iface: u8,
    /// Member index within the interface
    pub member: u8,
    /// Whether this is a reply id
    pub is_reply: bool,
}

impl MessageId {
    /// Decode a numeric message id
    pub fn decode(id: u32) -> Self {
        let raw = id & !REPLY_FLAG;
        Self {
            list: (raw >> 24) as u8,
            obj: (raw >> 16) as u8,
            iface: (raw >> 8) as u8,
            member: raw as u8,
            is_reply: id & REPLY_FLAG != 0,
        }
    }
}

/// Well-known message ids of the bus objects
pub mod ids {
    use super::{bus_id, reply_id};

    /// `org.freedesktop.DBus.Hello`
    pub const METHOD_HELLO: u32 = bus_id(0, 0, 0);
    /// `org.freedesktop.DBus.AddMatch`
    pub const METHOD_ADD_MATCH: u32 = bus_id(0, 0, 1);
    /// `org.freedesktop.DBus.RemoveMatch`
    pub const METHOD_REMOVE_MATCH: u32 = bus_id(0, 0, 2);
    /// `org.freedesktop.DBus.NameOwnerChanged`
    pub const SIGNAL_NAME_OWNER_CHANGED: u32 = bus_id(0, 0, 3);
    /// `org.freedesktop.DBus.RequestName`
    pub const METHOD_REQUEST_NAME: u32 = bus_id(0, 0, 4);
    /// `org.freedesktop.DBus.Peer.Ping`
    pub const METHOD_PING: u32 = bus_id(0, 1, 0);
    /// `org.freedesktop.DBus.Peer.GetMachineId`
    pub const METHOD_GET_MACHINE_ID: u32 = bus_id(0, 1, 1);
    /// `org.freedesktop.DBus.Introspectable.Introspect`
    pub const METHOD_INTROSPECT: u32 = bus_id(0, 2, 0);
    /// `org.allseen.Introspectable.GetDescriptionLanguages`
    pub const METHOD_GET_DESCRIPTION_LANG: u32 = bus_id(0, 3, 0);
    /// `org.allseen.Introspectable.IntrospectWithDescription`
    pub const METHOD_INTROSPECT_WITH_DESC: u32 = bus_id(0, 3, 1);

    /// `org.alljoyn.Bus.BindSessionPort`
    pub const METHOD_BIND_SESSION_PORT: u32 = bus_id(1, 0, 0);
    /// `org.alljoyn.Bus.JoinSession`
    pub const METHOD_JOIN_SESSION: u32 = bus_id(1, 0, 1);
    /// `org.alljoyn.Bus.LeaveSession`
    pub const METHOD_LEAVE_SESSION: u32 = bus_id(1, 0, 2);
    /// `org.alljoyn.Bus.FindAdvertisedName`
    pub const METHOD_FIND_NAME: u32 = bus_id(1, 0, 3);
    /// `org.alljoyn.Bus.FindAdvertisedNameByTransport`
    pub const METHOD_FIND_NAME_BY_TRANSPORT: u32 = bus_id(1, 0, 4);
    /// `org.alljoyn.Bus.FoundAdvertisedName`
    pub const SIGNAL_FOUND_ADV_NAME: u32 = bus_id(1, 0, 5);
    /// `org.alljoyn.Bus.LostAdvertisedName`
    pub const SIGNAL_LOST_ADV_NAME: u32 = bus_id(1, 0, 6);
    /// `org.alljoyn.Bus.SessionLost`
    pub const SIGNAL_SESSION_LOST: u32 = bus_id(1, 0, 7);
    /// `org.alljoyn.Bus.SessionLostWithReason`
    pub const SIGNAL_SESSION_LOST_WITH_REASON: u32 = bus_id(1, 0, 8);
    /// `org.alljoyn.Bus.Ping`
    pub const METHOD_BUS_PING: u32 = bus_id(1, 0, 9);
    /// `org.alljoyn.Bus.AdvertiseName`
    pub const METHOD_ADVERTISE_NAME: u32 = bus_id(1, 0, 10);
    /// `org.alljoyn.Bus.CancelAdvertiseName`
    pub const METHOD_CANCEL_ADVERTISE_NAME: u32 = bus_id(1, 0, 11);
    /// `org.alljoyn.Bus.CancelSessionlessMessage`
    pub const METHOD_CANCEL_SESSIONLESS: u32 = bus_id(1, 0, 12);
    /// `org.alljoyn.Daemon.ProbeReq`
    pub const SIGNAL_PROBE_REQ: u32 = bus_id(1, 1, 0);
    /// `org.alljoyn.Daemon.ProbeAck`
    pub const SIGNAL_PROBE_ACK: u32 = bus_id(1, 1, 1);

    /// `org.alljoyn.Bus.Peer.Session.AcceptSession`
    pub const METHOD_ACCEPT_SESSION: u32 = bus_id(2, 0, 0);

    /// `org.alljoyn.Bus.Peer.Authentication.ExchangeGuids`
    pub const METHOD_EXCHANGE_GUIDS: u32 = bus_id(3, 0, 0);
    /// `org.alljoyn.Bus.Peer.Authentication.ExchangeSuites`
    pub const METHOD_EXCHANGE_SUITES: u32 = bus_id(3, 0, 1);
    /// `org.alljoyn.Bus.Peer.Authentication.AuthChallenge`
    pub const METHOD_AUTH_CHALLENGE: u32 = bus_id(3, 0, 2);
    /// `org.alljoyn.Bus.Peer.Authentication.GenSessionKey`
    pub const METHOD_GEN_SESSION_KEY: u32 = bus_id(3, 0, 3);
    /// `org.alljoyn.Bus.Peer.Authentication.ExchangeGroupKeys`
    pub const METHOD_EXCHANGE_GROUP_KEYS: u32 = bus_id(3, 0, 4);
    /// `org.alljoyn.Bus.Peer.Authentication.KeyExchange`
    pub const METHOD_KEY_EXCHANGE: u32 = bus_id(3, 0, 5);
    /// `org.alljoyn.Bus.Peer.Authentication.KeyAuthentication`
    pub const METHOD_KEY_AUTHENTICATION: u32 = bus_id(3, 0, 6);

    /// `org.alljoyn.About` property get
    pub const METHOD_ABOUT_GET_PROP: u32 = bus_id(4, 0, 0);
    /// `org.alljoyn.About` property set
    pub const METHOD_ABOUT_SET_PROP: u32 = bus_id(4, 0, 1);
    /// `org.alljoyn.About.GetAboutData`
    pub const METHOD_ABOUT_GET_ABOUT_DATA: u32 = bus_id(4, 1, 1);
    /// `org.alljoyn.About.GetObjectDescription`
    pub const METHOD_ABOUT_GET_OBJECT_DESCRIPTION: u32 = bus_id(4, 1, 2);
    /// `org.alljoyn.About.Announce`
    pub const SIGNAL_ABOUT_ANNOUNCE: u32 = bus_id(4, 1, 3);
    /// `org.alljoyn.Icon` property get
    pub const METHOD_ABOUT_ICON_GET_PROP: u32 = bus_id(5, 0, 0);
    /// `org.alljoyn.Icon` property set
    pub const METHOD_ABOUT_ICON_SET_PROP: u32 = bus_id(5, 0, 1);
    /// `org.alljoyn.Icon.GetUrl`
    pub const METHOD_ABOUT_ICON_GET_URL: u32 = bus_id(5, 1, 1);
    /// `org.alljoyn.Icon.GetContent`
    pub const METHOD_ABOUT_ICON_GET_CONTENT: u32 = bus_id(5, 1, 2);

    /// Reply to `AddMatch`
    pub const REPLY_ADD_MATCH: u32 = reply_id(METHOD_ADD_MATCH);
    /// Reply to `RemoveMatch`
    pub const REPLY_REMOVE_MATCH: u32 = reply_id(METHOD_REMOVE_MATCH);
    /// Reply to `BindSessionPort`
    pub const REPLY_BIND_SESSION_PORT: u32 = reply_id(METHOD_BIND_SESSION_PORT);
    /// Reply to `JoinSession`
    pub const REPLY_JOIN_SESSION: u32 = reply_id(METHOD_JOIN_SESSION);
}

/// A bus message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    /// Message type
    pub msg_type: MsgType,
    /// Numeric message id resolved from path, interface and member
    pub msg_id: u32,
    /// Serial number assigned by the sender
    pub serial: u32,
    /// Serial of the call this message replies to
    pub reply_serial: u32,
    /// Unique name of the sender
    pub sender: String,
    /// Destination bus name, empty for broadcast
    pub destination: String,
    /// Object path
    pub path: String,
    /// Interface name
    pub iface: String,
    /// Member name
    pub member: String,
    /// Error name for error replies
    pub error_name: String,
    /// Session id, zero when not in a session
    pub session_id: u32,
    /// Header flags
    pub flags: u8,
    /// Time-to-live in seconds, zero for none
    pub ttl: u32,
    /// Method call timeout in milliseconds
    pub timeout_ms: u32,
    /// Body signature
    pub signature: String,
    /// Marshaled body
    pub body: Vec<u8>,
}

impl WireMessage {
    /// Create an empty message of the given type and id
    pub fn new(msg_type: MsgType, msg_id: u32) -> Self {
        Self {
            msg_type,
            msg_id,
            serial: 0,
            reply_serial: 0,
            sender: String::new(),
            destination: String::new(),
            path: String::new(),
            iface: String::new(),
            member: String::new(),
            error_name: String::new(),
            session_id: 0,
            flags: 0,
            ttl: 0,
            timeout_ms: 0,
            signature: String::new(),
            body: Vec::new(),
        }
    }

    /// Set the serial number
    pub fn with_serial(mut self, serial: u32) -> Self {
        self.serial = serial;
        self
    }

    /// Set the reply serial
    pub fn with_reply_serial(mut self, serial: u32) -> Self {
        self.reply_serial = serial;
        self
    }

    /// Set the sender
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = sender.into();
        self
    }

    /// Set the destination
    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = destination.into();
        self
    }

    /// Set path, interface and member
    pub fn with_member(
        mut self,
        path: impl Into<String>,
        iface: impl Into<String>,
        member: impl Into<String>,
    ) -> Self {
        self.path = path.into();
        self.iface = iface.into();
        self.member = member.into();
        self
    }

    /// Set the error name
    pub fn with_error_name(mut self, name: impl Into<String>) -> Self {
        self.error_name = name.into();
        self
    }

    /// Set the session id
    pub fn with_session(mut self, session_id: u32) -> Self {
        self.session_id = session_id;
        self
    }

    /// Add header flags
    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags |= flags;
        self
    }

    /// Set signature and body
    pub fn with_body(mut self, signature: impl Into<String>, body: Vec<u8>) -> Self {
        self.signature = signature.into();
        self.body = body;
        self
    }

    /// Whether the body was received encrypted
    pub fn is_encrypted(&self) -> bool {
        self.flags & flags::ENCRYPTED != 0
    }

    /// Whether the sender expects no reply
    pub fn no_reply_expected(&self) -> bool {
        self.flags & flags::NO_REPLY_EXPECTED != 0
    }

    /// Whether this is a reply or error reply
    pub fn is_reply(&self) -> bool {
        matches!(self.msg_type, MsgType::Reply | MsgType::Error)
    }

    /// Reader positioned at the first body argument
    ///
    /// Every call starts from the beginning, which is how handlers that
    /// decline a message leave it intact for the next one.
    pub fn reader(&self) -> BodyReader<'_> {
        BodyReader::new(&self.body, &self.signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_encoding() {
        let id = encode_id(APP_LIST, 2, 1, 5);
        assert_eq!(id, 0x0102_0105);
        let decoded = MessageId::decode(reply_id(id));
        assert_eq!(decoded.list, APP_LIST);
        assert_eq!(decoded.obj, 2);
        assert_eq!(decoded.iface, 1);
        assert_eq!(decoded.member, 5);
        assert!(decoded.is_reply);
    }

    #[test]
    fn test_bus_ids_are_distinct() {
        let all = [
            ids::METHOD_HELLO,
            ids::METHOD_ADD_MATCH,
            ids::METHOD_PING,
            ids::METHOD_ACCEPT_SESSION,
            ids::METHOD_BIND_SESSION_PORT,
            ids::METHOD_JOIN_SESSION,
            ids::SIGNAL_ABOUT_ANNOUNCE,
            ids::SIGNAL_FOUND_ADV_NAME,
            ids::SIGNAL_SESSION_LOST,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_message_builder() {
        let msg = WireMessage::new(MsgType::Signal, 7)
            .with_sender(":1.5")
            .with_flags(flags::SESSIONLESS)
            .with_flags(flags::ENCRYPTED);
        assert!(msg.is_encrypted());
        assert!(!msg.no_reply_expected());
        assert!(!msg.is_reply());
        assert_eq!(msg.flags, flags::SESSIONLESS | flags::ENCRYPTED);
    }
}
