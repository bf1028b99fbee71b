//! Sessions and service discovery.
//!
//! Peers are tracked by bus name. A peer entry exists while a session with it
//! is joined, being joined, or being offered by the peer. Service objects
//! discovered from About announcements or found advertised names collect on
//! the peer entry until a session exists, then the registered callbacks are
//! handed back to the dispatcher to run.
//!
//! Everything here is plain state. Sending the JoinSession call and running
//! script callbacks is left to the caller.

use crate::natives::NativeOp;
use crate::value::{Callable, ObjectMap, ScriptValue};
use std::collections::BTreeMap;

/// A remote object offered by a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceObject {
    /// Peer bus name
    pub dest: String,
    /// Object path on the peer
    pub path: String,
    /// Interfaces the object implements
    pub interfaces: Vec<String>,
    /// Session with the peer, zero until joined
    pub session: u32,
}

impl ServiceObject {
    /// Script form with the `method`, `signal` and property natives attached
    pub fn to_script(&self) -> ScriptValue {
        let interfaces: Vec<ScriptValue> = self
            .interfaces
            .iter()
            .map(|i| ScriptValue::from(i.as_str()))
            .collect();
        ScriptValue::Object(
            ObjectMap::new()
                .with("dest", self.dest.as_str())
                .with("path", self.path.as_str())
                .with("interfaces", interfaces)
                .with("session", self.session)
                .with("method", NativeOp::Method)
                .with("signal", NativeOp::ServiceSignal)
                .with("getProp", NativeOp::GetProp)
                .with("setProp", NativeOp::SetProp)
                .with("getAllProps", NativeOp::GetAllProps),
        )
    }

    /// Read a service object back from its script form
    pub fn from_script(value: &ScriptValue) -> Option<Self> {
        let interfaces = value
            .get("interfaces")
            .as_array()?
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();
        Some(Self {
            dest: value.get("dest").as_str()?.to_string(),
            path: value.get("path").as_str().unwrap_or("/").to_string(),
            interfaces,
            session: value.get("session").as_number().unwrap_or(0.0) as u32,
        })
    }
}

/// State kept per peer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerSession {
    /// Session port
    pub port: u16,
    /// Session id, zero until the session is established
    pub session_id: u32,
    /// Serial of the outstanding JoinSession call, zero when none
    pub join_serial: u32,
    /// Number of service objects referring to this session
    pub ref_count: u32,
    /// Service objects waiting for the session
    pub announcements: Vec<ServiceObject>,
}

/// A `findServiceByName` registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindNameRegistration {
    /// Interfaces of the expected service object
    pub interfaces: Vec<String>,
    /// Path of the expected service object
    pub path: String,
    /// Session port to join
    pub port: u16,
    /// Transport mask for `findServiceByTransport`
    pub transport: Option<u16>,
    /// Script callback
    pub callback: Callable,
}

/// A script callback due to run with a service object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCallback {
    /// Callback
    pub callback: Callable,
    /// Argument
    pub service: ServiceObject,
}

/// What the dispatcher must do after an About announcement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnnounceOutcome {
    /// Nothing of interest, or a join is already in progress
    Nothing,
    /// Session exists; run these callbacks
    Callbacks(Vec<PendingCallback>),
    /// Join a session with the peer, then report the serial through
    /// [`Discovery::join_started`]
    Join {
        /// Peer bus name
        peer: String,
        /// Session port
        port: u16,
    },
}

/// Session and discovery tables
#[derive(Debug, Default)]
pub struct Discovery {
    sessions: BTreeMap<String, PeerSession>,
    service_callbacks: BTreeMap<String, Callable>,
    find_names: BTreeMap<String, FindNameRegistration>,
}

impl Discovery {
    /// Create empty tables
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every session and registration
    pub fn clear(&mut self) {
        self.sessions.clear();
        self.service_callbacks.clear();
        self.find_names.clear();
    }

    /// Register or remove the `findService` callback for an interface
    pub fn set_service_callback(&mut self, iface: &str, callback: Option<Callable>) {
        match callback {
            Some(cb) => {
                self.service_callbacks.insert(iface.to_string(), cb);
            }
            None => {
                self.service_callbacks.remove(iface);
            }
        }
    }

    /// The `findService` callback for an interface
    pub fn service_callback(&self, iface: &str) -> Option<Callable> {
        self.service_callbacks.get(iface).copied()
    }

    /// Register or remove a find-name registration; registering a name
    /// again replaces the previous entry
    pub fn set_find_name(&mut self, prefix: &str, registration: Option<FindNameRegistration>) {
        match registration {
            Some(reg) => {
                self.find_names.insert(prefix.to_string(), reg);
            }
            None => {
                self.find_names.remove(prefix);
            }
        }
    }

    /// Find-name registration for a prefix
    pub fn find_name(&self, prefix: &str) -> Option<&FindNameRegistration> {
        self.find_names.get(prefix)
    }

    /// Session state for a peer
    pub fn session(&self, peer: &str) -> Option<&PeerSession> {
        self.sessions.get(peer)
    }

    /// Number of tracked peers
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Get or create the entry for a peer
    pub fn allocate(&mut self, peer: &str) -> &mut PeerSession {
        self.sessions.entry(peer.to_string()).or_default()
    }

    /// Forget a peer
    pub fn remove(&mut self, peer: &str) -> Option<PeerSession> {
        self.sessions.remove(peer)
    }

    /// Record a session accepted from `peer` on `port`
    pub fn peer_accepted(&mut self, peer: &str, port: u16, session_id: u32) {
        let session = self.allocate(peer);
        session.ref_count += 1;
        session.port = port;
        session.session_id = session_id;
    }

    /// Undo the allocation made for a rejected joiner
    pub fn peer_rejected(&mut self, peer: &str) {
        if self.sessions.get(peer).map(|s| s.ref_count == 0).unwrap_or(false) {
            self.sessions.remove(peer);
        }
    }

    /// Process an About announcement from `sender`
    ///
    /// `objects` is the announced object description: path and implemented
    /// interfaces per object. Objects implementing any interface with a
    /// `findService` callback are queued for the callbacks.
    pub fn on_announcement(
        &mut self,
        sender: &str,
        port: u16,
        objects: &[(String, Vec<String>)],
    ) -> AnnounceOutcome {
        let callbacks = &self.service_callbacks;
        let session = self.sessions.entry(sender.to_string()).or_default();
        session.port = port;
        for (path, interfaces) in objects {
            if interfaces.iter().any(|i| callbacks.contains_key(i)) {
                session.announcements.push(ServiceObject {
                    dest: sender.to_string(),
                    path: path.clone(),
                    interfaces: interfaces.clone(),
                    session: 0,
                });
                session.ref_count += 1;
            }
        }
        if session.session_id != 0 {
            return AnnounceOutcome::Callbacks(self.take_callbacks(sender));
        }
        if session.join_serial != 0 {
            return AnnounceOutcome::Nothing;
        }
        if session.ref_count != 0 {
            return AnnounceOutcome::Join {
                peer: sender.to_string(),
                port,
            };
        }
        self.sessions.remove(sender);
        AnnounceOutcome::Nothing
    }

    /// Record the serial of a JoinSession call sent to `peer`
    pub fn join_started(&mut self, peer: &str, serial: u32) {
        if let Some(session) = self.sessions.get_mut(peer) {
            session.join_serial = serial;
        }
    }

    /// Process a JoinSession reply
    ///
    /// Returns the callbacks to run when the join succeeded. A failed join
    /// drops the peer entry together with its queued service objects.
    pub fn on_join_reply(
        &mut self,
        reply_serial: u32,
        result: Option<(u32, u32)>,
    ) -> Vec<PendingCallback> {
        let Some(peer) = self
            .sessions
            .iter()
            .find(|(_, s)| s.join_serial == reply_serial)
            .map(|(name, _)| name.clone())
        else {
            return Vec::new();
        };
        match result {
            Some((crate::message::JOIN_SESSION_SUCCESS, session_id)) => {
                if let Some(session) = self.sessions.get_mut(&peer) {
                    session.join_serial = 0;
                    session.session_id = session_id;
                }
                self.take_callbacks(&peer)
            }
            other => {
                tracing::warn!(peer = %peer, result = ?other.map(|r| r.0), "JoinSession failed");
                self.sessions.remove(&peer);
                Vec::new()
            }
        }
    }

    /// Take queued service objects of `peer` paired with their callbacks
    ///
    /// Each distinct callback runs once per service object, even when it was
    /// registered for several of the object's interfaces.
    pub fn take_callbacks(&mut self, peer: &str) -> Vec<PendingCallback> {
        let Some(session) = self.sessions.get_mut(peer) else {
            return Vec::new();
        };
        let session_id = session.session_id;
        let mut pending = Vec::new();
        for mut service in session.announcements.drain(..) {
            service.session = session_id;
            service.dest = peer.to_string();
            let mut seen: Vec<Callable> = Vec::new();
            for iface in &service.interfaces {
                if let Some(cb) = self.service_callbacks.get(iface) {
                    if !seen.contains(cb) {
                        seen.push(*cb);
                    }
                }
            }
            pending.extend(seen.into_iter().map(|callback| PendingCallback {
                callback,
                service: service.clone(),
            }));
        }
        pending
    }

    /// Port to join for a found advertised name, if it is wanted
    pub fn on_found_name(&self, name: &str, prefix: &str) -> Option<u16> {
        if self.sessions.contains_key(name) {
            return None;
        }
        self.find_names.get(prefix).map(|reg| reg.port)
    }

    /// Record a JoinSession sent for a found advertised name
    pub fn found_name_joined(&mut self, name: &str, prefix: &str, serial: u32) {
        let Some(reg) = self.find_names.get(prefix).cloned() else {
            return;
        };
        if let Some(first) = reg.interfaces.first() {
            self.service_callbacks.insert(first.clone(), reg.callback);
        }
        let session = self.allocate(name);
        session.port = reg.port;
        session.join_serial = serial;
        session.announcements.push(ServiceObject {
            dest: name.to_string(),
            path: reg.path,
            interfaces: reg.interfaces,
            session: 0,
        });
        session.ref_count += 1;
    }

    /// Remove the peer whose session was lost, returning its name
    pub fn on_session_lost(&mut self, session_id: u32) -> Option<String> {
        let peer = self
            .sessions
            .iter()
            .find(|(_, s)| s.session_id == session_id)
            .map(|(name, _)| name.clone())?;
        self.sessions.remove(&peer);
        Some(peer)
    }

    /// Drop every session, returning the established session ids
    pub fn end_sessions(&mut self) -> Vec<u32> {
        let ids = self
            .sessions
            .values()
            .map(|s| s.session_id)
            .filter(|id| *id != 0)
            .collect();
        self.sessions.clear();
        ids
    }
}
