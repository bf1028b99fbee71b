//! Session accept, bind, join and loss handling.

use super::announce::Announcer;
use super::handler::Turn;
use crate::context::HandlerKind;
use crate::discovery::{AnnounceOutcome, ServiceObject};
use crate::error::{BusError, BusResult};
use crate::message;
use crate::services::ServiceRegistry;
use crate::unmarshal::unmarshal_args;
use crate::value::ScriptValue;
use crate::wire::signature as sig;
use crate::wire::{MsgType, WireMessage};

/// `BindSessionPort` reply disposition for success
pub const BIND_SESSION_SUCCESS: u32 = 1;

/// Answer an `AcceptSession` request
pub(crate) fn accept_session(
    turn: &mut Turn<'_>,
    services: &mut ServiceRegistry,
    msg: &WireMessage,
) -> BusResult<()> {
    let mut reader = msg.reader();
    let port = reader.get_u16()?;
    let session_id = reader.get_u32()?;
    let joiner = reader.get_string(sig::STRING)?;

    let accept = if port == turn.ctx.config.app_port {
        accept_peer(turn, port, session_id, joiner)
    } else if services.check_session_accepted(port, session_id, joiner) {
        true
    } else {
        match services.handle_message(msg, turn.ctx, &mut *turn.transport) {
            Ok(()) => return Ok(()),
            Err(BusError::NoMatch) => {
                tracing::warn!(port, joiner, "Rejecting attempt to join unbound port");
                false
            }
            Err(e) => return Err(e),
        }
    };
    tracing::info!(port, session_id, joiner, accept, "Session request");
    let reply = message::accept_session_reply(msg, accept)?;
    turn.deliver(reply).map(|_| ())
}

fn accept_peer(turn: &mut Turn<'_>, port: u16, session_id: u32, joiner: &str) -> bool {
    turn.ctx.discovery.allocate(joiner);
    let accept = match turn.ctx.handler(HandlerKind::PeerConnected) {
        None => true,
        Some(callback) => {
            let svc = ServiceObject {
                dest: joiner.to_string(),
                path: "/".to_string(),
                interfaces: Vec::new(),
                session: session_id,
            };
            match turn.call(callback, ScriptValue::Undefined, vec![svc.to_script()]) {
                Ok(result) => result.as_bool() != Some(false),
                Err(e) => {
                    tracing::error!(joiner, error = %e, "onPeerConnected failed");
                    false
                }
            }
        }
    };
    if accept {
        turn.ctx.discovery.peer_accepted(joiner, port, session_id);
    } else {
        turn.ctx.discovery.peer_rejected(joiner);
    }
    accept
}

/// Handle the reply to `BindSessionPort`
pub(crate) fn on_bind_reply(
    turn: &mut Turn<'_>,
    services: &mut ServiceRegistry,
    announcer: &mut dyn Announcer,
    msg: &WireMessage,
) -> BusResult<()> {
    if msg.msg_type == MsgType::Error {
        tracing::error!(error = %msg.error_name, "BindSessionPort failed");
        return Ok(());
    }
    let mut reader = msg.reader();
    let disposition = reader.get_u32()?;
    let port = reader.get_u16()?;
    if port != turn.ctx.config.app_port {
        return match services.handle_message(msg, turn.ctx, &mut *turn.transport) {
            Err(BusError::NoMatch) => Ok(()),
            other => other,
        };
    }
    if disposition == BIND_SESSION_SUCCESS {
        tracing::info!(port, "Bound session port");
        announcer.port_bound();
    } else {
        tracing::error!(port, disposition, "Failed to bind session port");
    }
    Ok(())
}

/// Handle an About announcement from a peer
pub(crate) fn on_announcement(turn: &mut Turn<'_>, msg: &WireMessage) -> BusResult<()> {
    if turn.ctx.unique_name() == Some(msg.sender.as_str()) {
        return Ok(());
    }
    let args = unmarshal_args(&mut msg.reader())?;
    let port = args
        .get(1)
        .and_then(ScriptValue::as_number)
        .ok_or_else(|| BusError::signature("announcement has no session port"))? as u16;
    let objects = object_description(args.get(2))?;

    match turn.ctx.discovery.on_announcement(&msg.sender, port, &objects) {
        AnnounceOutcome::Nothing => Ok(()),
        AnnounceOutcome::Callbacks(pending) => {
            turn.run_callbacks(pending);
            Ok(())
        }
        AnnounceOutcome::Join { peer, port } => {
            tracing::info!(peer = %peer, port, "Joining session with announcing peer");
            let serial = turn.deliver(message::join_session_call(&peer, port)?)?;
            turn.ctx.discovery.join_started(&peer, serial);
            Ok(())
        }
    }
}

fn object_description(value: Option<&ScriptValue>) -> BusResult<Vec<(String, Vec<String>)>> {
    let entries = value
        .and_then(ScriptValue::as_array)
        .ok_or_else(|| BusError::signature("announcement has no object description"))?;
    entries
        .iter()
        .map(|entry| {
            let path = entry
                .index(0)
                .as_str()
                .ok_or_else(|| BusError::signature("object description has no path"))?;
            let interfaces = entry
                .index(1)
                .as_array()
                .unwrap_or_default()
                .iter()
                .filter_map(ScriptValue::as_str)
                .map(str::to_string)
                .collect();
            Ok((path.to_string(), interfaces))
        })
        .collect()
}

/// Handle a `FoundAdvertisedName` signal
pub(crate) fn on_found_name(turn: &mut Turn<'_>, msg: &WireMessage) -> BusResult<()> {
    let mut reader = msg.reader();
    let name = reader.get_string(sig::STRING)?;
    let _transport = reader.get_u16()?;
    let prefix = reader.get_string(sig::STRING)?;

    let Some(port) = turn.ctx.discovery.on_found_name(name, prefix) else {
        return Ok(());
    };
    tracing::info!(name, prefix, port, "Found advertised name");
    let serial = turn.deliver(message::join_session_call(name, port)?)?;
    turn.ctx.discovery.found_name_joined(name, prefix, serial);
    Ok(())
}

/// Handle the reply to a `JoinSession` we sent
pub(crate) fn on_join_reply(turn: &mut Turn<'_>, msg: &WireMessage) -> BusResult<()> {
    let result = match msg.msg_type {
        MsgType::Reply => {
            let mut reader = msg.reader();
            Some((reader.get_u32()?, reader.get_u32()?))
        }
        _ => None,
    };
    let pending = turn.ctx.discovery.on_join_reply(msg.reply_serial, result);
    turn.run_callbacks(pending);
    Ok(())
}

/// Handle `SessionLost`
pub(crate) fn on_session_lost(turn: &mut Turn<'_>, msg: &WireMessage) -> BusResult<()> {
    let session_id = msg.reader().get_u32()?;
    let Some(peer) = turn.ctx.discovery.on_session_lost(session_id) else {
        return Ok(());
    };
    tracing::info!(session_id, peer = %peer, "Session lost");
    turn.deliver(message::leave_session_call(session_id)?)?;
    if let Some(callback) = turn.ctx.handler(HandlerKind::PeerDisconnected) {
        if let Err(e) = turn.call(callback, ScriptValue::Undefined, vec![peer.into()]) {
            tracing::error!(error = %e, "onPeerDisconnected failed");
        }
    }
    Ok(())
}

/// Leave every open session
pub(crate) fn end_sessions(turn: &mut Turn<'_>) {
    for session_id in turn.ctx.discovery.end_sessions() {
        let sent = message::leave_session_call(session_id).and_then(|msg| turn.deliver(msg));
        if let Err(e) = sent {
            tracing::debug!(session_id, error = %e, "LeaveSession not sent");
        }
    }
}
