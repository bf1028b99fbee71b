//! Notification producer service.
//!
//! Scripts build notifications with `AJ.notification(type, text)` and send
//! them as sessionless `notify` signals from one object per notification
//! type. Only the last notification of each type can be withdrawn. The
//! service answers consumers' `Dismiss` calls and the `Version` property of
//! its objects, and accepts sessions on [`PRODUCER_PORT`].

use super::{send_reply, version_reply, ServiceHandler, SERVICE_LIST};
use crate::context::BusContext;
use crate::error::{BusError, BusResult, ScriptError};
use crate::message;
use crate::unmarshal::unmarshal_args;
use crate::value::ScriptValue;
use crate::wire::signature as sig;
use crate::wire::{accessor, encode_id, flags, BodyWriter, BusTransport, MessageId, MsgType, WireMessage};

/// Interface of the `notify` signal
pub const NOTIFICATION_IFACE: &str = "org.alljoyn.Notification";

/// Interface consumers call to dismiss a notification
pub const PRODUCER_IFACE: &str = "org.alljoyn.Notification.Producer";

/// Interface of the `Dismiss` signal
pub const DISMISSER_IFACE: &str = "org.alljoyn.Notification.Dismisser";

/// Version carried in every notification and reported by `Version`
pub const NOTIFICATION_VERSION: u16 = 2;

/// `Version` property of the producer interface
pub const PRODUCER_VERSION: u16 = 1;

/// Session port consumers join to dismiss notifications
pub const PRODUCER_PORT: u16 = 1010;

/// Signature of the `notify` signal
pub const NOTIFY_SIGNATURE: &str = "qiqssaysa{iv}a{ss}a(ss)";

/// Object path of the producer interface
pub const PRODUCER_PATH: &str = "/notificationProducer";

/// Object path the `Dismiss` signal is sent from
pub const DISMISSER_PATH: &str = "/notificationDismisser";

/// Most entries in one of the notification dictionaries
pub const MAX_ENTRIES: usize = 127;

const PRODUCER_OBJECT: u8 = 4;
const DISMISSER_OBJECT: u8 = 5;

/// `Dismiss` method of the producer object
pub const DISMISS: u32 = encode_id(SERVICE_LIST, PRODUCER_OBJECT, 1, 0);
/// `Dismiss` signal of the dismisser object
pub const DISMISS_SIGNAL: u32 = encode_id(SERVICE_LIST, DISMISSER_OBJECT, 1, 0);

/// Keys of the well-known notification attributes
pub mod attribute {
    /// Rich content icon URL
    pub const ICON_URL: i32 = 1;
    /// Rich content audio URLs
    pub const AUDIO_URL: i32 = 2;
    /// Object path serving the icon
    pub const ICON_PATH: i32 = 3;
    /// Object path serving the audio
    pub const AUDIO_PATH: i32 = 4;
    /// Object path of a control panel for the notification
    pub const CONTROL_PANEL_PATH: i32 = 5;
}

/// Notification message type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationType {
    /// Emergency
    Emergency = 0,
    /// Warning
    Warning = 1,
    /// Informational
    Info = 2,
}

impl NotificationType {
    /// Every type, in code order
    pub const ALL: [NotificationType; 3] = [
        NotificationType::Emergency,
        NotificationType::Warning,
        NotificationType::Info,
    ];

    /// Type with the numeric code used on the wire and in script
    pub fn from_code(code: f64) -> Option<Self> {
        Self::ALL.into_iter().find(|t| *t as u8 as f64 == code)
    }

    /// Object path the type's signals are sent from
    pub fn path(self) -> &'static str {
        match self {
            NotificationType::Emergency => "/emergency",
            NotificationType::Warning => "/warning",
            NotificationType::Info => "/info",
        }
    }

    /// Message id of the type's `notify` signal
    pub fn notify_id(self) -> u32 {
        encode_id(SERVICE_LIST, 1 + self as u8, 1, 0)
    }
}

/// Everything a notification carries besides its type
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotificationContent {
    /// Text per language tag
    pub texts: Vec<(String, String)>,
    /// Custom attributes
    pub attributes: Vec<(String, String)>,
    /// Audio URL per language tag
    pub audio_urls: Vec<(String, String)>,
    /// Icon URL
    pub icon_url: Option<String>,
    /// Object path serving the icon
    pub icon_path: Option<String>,
    /// Object path serving the audio
    pub audio_path: Option<String>,
    /// Object path of a control panel
    pub control_panel_path: Option<String>,
}

impl NotificationContent {
    /// Read the content of a script notification object
    pub fn from_script(obj: &ScriptValue) -> Result<Self, ScriptError> {
        Ok(Self {
            texts: string_pairs(obj, "text")?,
            attributes: string_pairs(obj, "attributes")?,
            audio_urls: string_pairs(obj, "audioUrls")?,
            icon_url: optional_string(obj, "iconUrl"),
            icon_path: optional_string(obj, "iconPath"),
            audio_path: optional_string(obj, "audioPath"),
            control_panel_path: optional_string(obj, "controlPanelPath"),
        })
    }
}

fn string_pairs(obj: &ScriptValue, prop: &str) -> Result<Vec<(String, String)>, ScriptError> {
    let Some(map) = obj.get(prop).as_object() else {
        return Ok(Vec::new());
    };
    if map.len() > MAX_ENTRIES {
        return Err(ScriptError::range_error("Too many entries"));
    }
    map.iter()
        .map(|(key, value)| {
            value
                .as_str()
                .map(|v| (key.clone(), v.to_string()))
                .ok_or_else(|| ScriptError::type_error(format!("{} values must be strings", prop)))
        })
        .collect()
}

fn optional_string(obj: &ScriptValue, prop: &str) -> Option<String> {
    obj.get(prop).as_str().map(str::to_string)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Sent {
    message_id: i32,
    serial: u32,
}

/// Message ids and the last live notification of each type
#[derive(Debug, Default)]
pub struct NotificationProducer {
    next_id: i32,
    last: [Option<Sent>; 3],
}

impl NotificationProducer {
    /// Create a producer with nothing sent
    pub fn new() -> Self {
        Self::default()
    }

    /// Message id of the last live notification of `kind`
    pub fn last_message_id(&self, kind: NotificationType) -> Option<i32> {
        self.last[kind as usize].map(|s| s.message_id)
    }

    fn next_message_id(&mut self) -> i32 {
        self.next_id = self.next_id.wrapping_add(1);
        self.next_id
    }

    fn take_message(&mut self, message_id: i32) -> Option<Sent> {
        self.last
            .iter_mut()
            .find(|s| s.map_or(false, |s| s.message_id == message_id))
            .and_then(Option::take)
    }
}

fn put_attribute(writer: &mut BodyWriter, key: i32, tag: u8, value: &str) -> BusResult<()> {
    writer.open_container(sig::DICT_OPEN)?;
    writer.put_i32(key)?;
    writer.open_variant(&(tag as char).to_string())?;
    writer.put_string(tag, value)?;
    writer.close_container()
}

fn put_pairs(writer: &mut BodyWriter, tag: u8, pairs: &[(String, String)]) -> BusResult<()> {
    writer.open_container(sig::ARRAY)?;
    for (key, value) in pairs {
        writer.open_container(tag)?;
        writer.put_string(sig::STRING, key)?;
        writer.put_string(sig::STRING, value)?;
        writer.close_container()?;
    }
    writer.close_container()
}

fn app_id(ctx: &BusContext) -> Vec<u8> {
    ctx.properties
        .get("AppId")
        .and_then(|id| hex::decode(id).ok())
        .unwrap_or_default()
}

fn notify_body(
    ctx: &BusContext,
    content: &NotificationContent,
    kind: NotificationType,
    message_id: i32,
) -> BusResult<Vec<u8>> {
    let mut writer = BodyWriter::new(NOTIFY_SIGNATURE);
    writer.put_u16(NOTIFICATION_VERSION)?;
    writer.put_i32(message_id)?;
    writer.put_u16(kind as u16)?;
    writer.put_string(sig::STRING, ctx.properties.get("DeviceId").unwrap_or_default())?;
    writer.put_string(sig::STRING, ctx.properties.get("DeviceName").unwrap_or_default())?;
    writer.put_byte_array(&app_id(ctx))?;
    writer.put_string(sig::STRING, ctx.properties.get("AppName").unwrap_or_default())?;

    writer.open_container(sig::ARRAY)?;
    if let Some(url) = &content.icon_url {
        put_attribute(&mut writer, attribute::ICON_URL, sig::STRING, url)?;
    }
    if !content.audio_urls.is_empty() {
        writer.open_container(sig::DICT_OPEN)?;
        writer.put_i32(attribute::AUDIO_URL)?;
        writer.open_variant("a(ss)")?;
        put_pairs(&mut writer, sig::STRUCT_OPEN, &content.audio_urls)?;
        writer.close_container()?;
    }
    let paths = [
        (attribute::ICON_PATH, &content.icon_path),
        (attribute::AUDIO_PATH, &content.audio_path),
        (attribute::CONTROL_PANEL_PATH, &content.control_panel_path),
    ];
    for (key, path) in paths {
        if let Some(path) = path {
            put_attribute(&mut writer, key, sig::OBJECT_PATH, path)?;
        }
    }
    writer.close_container()?;

    put_pairs(&mut writer, sig::DICT_OPEN, &content.attributes)?;
    put_pairs(&mut writer, sig::STRUCT_OPEN, &content.texts)?;
    writer.finish()
}

/// Send a notification as a sessionless signal, returning its message id
///
/// The notification replaces the previous one of the same type as the one
/// [`cancel_notification`] withdraws.
pub fn send_notification(
    ctx: &mut BusContext,
    transport: &mut dyn BusTransport,
    content: &NotificationContent,
    kind: NotificationType,
    ttl_secs: u16,
) -> BusResult<i32> {
    let message_id = ctx.notifications.next_message_id();
    let body = notify_body(ctx, content, kind, message_id)?;
    let mut msg = WireMessage::new(MsgType::Signal, kind.notify_id())
        .with_member(kind.path(), NOTIFICATION_IFACE, "notify")
        .with_flags(flags::SESSIONLESS)
        .with_body(NOTIFY_SIGNATURE, body);
    msg.ttl = u32::from(ttl_secs);
    let serial = ctx.deliver(transport, msg)?;
    ctx.notifications.last[kind as usize] = Some(Sent { message_id, serial });
    tracing::info!(kind = ?kind, message_id, serial, ttl_secs, "Notification sent");
    Ok(message_id)
}

/// Withdraw the last notification of `kind`; a no-op when none is live
pub fn cancel_notification(
    ctx: &mut BusContext,
    transport: &mut dyn BusTransport,
    kind: NotificationType,
) -> BusResult<()> {
    let Some(sent) = ctx.notifications.last[kind as usize].take() else {
        return Ok(());
    };
    tracing::info!(kind = ?kind, message_id = sent.message_id, "Notification cancelled");
    ctx.deliver(transport, message::cancel_sessionless_call(sent.serial)?)
        .map(|_| ())
}

fn dismiss_signal(ctx: &BusContext, message_id: i32) -> BusResult<WireMessage> {
    let mut writer = BodyWriter::new("iay");
    writer.put_i32(message_id)?;
    writer.put_byte_array(&app_id(ctx))?;
    let mut msg = WireMessage::new(MsgType::Signal, DISMISS_SIGNAL)
        .with_member(DISMISSER_PATH, DISMISSER_IFACE, "Dismiss")
        .with_flags(flags::SESSIONLESS)
        .with_body("iay", writer.finish()?);
    msg.ttl = u32::from(ctx.config.sessionless_ttl_secs);
    Ok(msg)
}

/// Notification producer pre-handler
#[derive(Debug, Default)]
pub struct NotificationService;

impl NotificationService {
    /// Create the service
    pub fn new() -> Self {
        Self
    }
}

impl ServiceHandler for NotificationService {
    fn name(&self) -> &'static str {
        "notification"
    }

    fn handle_message(
        &mut self,
        msg: &WireMessage,
        ctx: &mut BusContext,
        transport: &mut dyn BusTransport,
    ) -> BusResult<()> {
        let id = MessageId::decode(msg.msg_id);
        if id.list != SERVICE_LIST
            || !(1..=PRODUCER_OBJECT).contains(&id.obj)
            || id.is_reply
            || msg.msg_type != MsgType::MethodCall
        {
            return Err(BusError::NoMatch);
        }

        if id.iface == 0 && id.member == accessor::GET {
            let args = unmarshal_args(&mut msg.reader())?;
            let (iface, version) = if id.obj == PRODUCER_OBJECT {
                (PRODUCER_IFACE, PRODUCER_VERSION)
            } else {
                (NOTIFICATION_IFACE, NOTIFICATION_VERSION)
            };
            if args.first().and_then(ScriptValue::as_str) != Some(iface)
                || args.get(1).and_then(ScriptValue::as_str) != Some("Version")
            {
                return Err(BusError::NoMatch);
            }
            return version_reply(ctx, transport, msg, version);
        }

        if msg.msg_id != DISMISS {
            return Err(BusError::NoMatch);
        }
        let args = unmarshal_args(&mut msg.reader())?;
        let message_id = args
            .first()
            .and_then(ScriptValue::as_number)
            .ok_or_else(|| BusError::signature("Dismiss requires a message id"))? as i32;
        send_reply(ctx, transport, msg, None)?;
        if let Some(sent) = ctx.notifications.take_message(message_id) {
            ctx.deliver(transport, message::cancel_sessionless_call(sent.serial)?)?;
        }
        tracing::info!(message_id, sender = %msg.sender, "Notification dismissed");
        let signal = dismiss_signal(ctx, message_id)?;
        ctx.deliver(transport, signal).map(|_| ())
    }

    fn check_session_accepted(&mut self, port: u16, session_id: u32, joiner: &str) -> bool {
        if port != PRODUCER_PORT {
            return false;
        }
        tracing::debug!(session_id, joiner, "Accepted notification producer session");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::interface::ObjectTable;
    use crate::propstore::{MemoryStorage, PropertyStore};
    use crate::value::ObjectMap;
    use crate::wire::{ids, MemoryTransport};

    fn create_context() -> BusContext {
        let properties = PropertyStore::open(Box::new(MemoryStorage::new()), Some("oven")).unwrap();
        let mut ctx = BusContext::new(BridgeConfig::default(), ObjectTable::new(), properties);
        ctx.attach(":1.1");
        ctx
    }

    fn create_content() -> NotificationContent {
        NotificationContent {
            texts: vec![("en".into(), "Preheated".into())],
            icon_url: Some("http://example.org/oven.png".into()),
            control_panel_path: Some("/ControlPanel/oven".into()),
            ..Default::default()
        }
    }

    fn create_dismiss(message_id: i32) -> WireMessage {
        let mut writer = BodyWriter::new("i");
        writer.put_i32(message_id).unwrap();
        WireMessage::new(MsgType::MethodCall, DISMISS)
            .with_serial(40)
            .with_sender(":1.6")
            .with_member(PRODUCER_PATH, PRODUCER_IFACE, "Dismiss")
            .with_body("i", writer.finish().unwrap())
    }

    #[test]
    fn test_send_builds_notify_signal() {
        let mut ctx = create_context();
        let mut transport = MemoryTransport::new();
        let id = send_notification(
            &mut ctx,
            &mut transport,
            &create_content(),
            NotificationType::Warning,
            60,
        )
        .unwrap();

        let sent = &transport.sent[0];
        assert_eq!(sent.msg_type, MsgType::Signal);
        assert_eq!(sent.msg_id, NotificationType::Warning.notify_id());
        assert_eq!(sent.path, "/warning");
        assert_eq!(sent.signature, NOTIFY_SIGNATURE);
        assert_ne!(sent.flags & flags::SESSIONLESS, 0);
        assert_eq!(sent.ttl, 60);

        let args = unmarshal_args(&mut sent.reader()).unwrap();
        assert_eq!(args[0], ScriptValue::Number(2.0));
        assert_eq!(args[1], ScriptValue::Number(id as f64));
        assert_eq!(args[2], ScriptValue::Number(1.0));
        assert_eq!(args[4].as_str(), Some("oven"));
        assert_eq!(args[5].as_buffer().map(<[u8]>::len), Some(16));
        assert_eq!(args[7].get("1").as_str(), Some("http://example.org/oven.png"));
        assert_eq!(args[7].get("5").as_str(), Some("/ControlPanel/oven"));
        assert_eq!(
            args[9],
            ScriptValue::from(vec![ScriptValue::from(vec![
                ScriptValue::from("en"),
                ScriptValue::from("Preheated"),
            ])])
        );
        assert_eq!(
            ctx.notifications.last_message_id(NotificationType::Warning),
            Some(id)
        );
    }

    #[test]
    fn test_cancel_withdraws_last_of_type() {
        let mut ctx = create_context();
        let mut transport = MemoryTransport::new();
        let content = create_content();
        send_notification(&mut ctx, &mut transport, &content, NotificationType::Info, 30).unwrap();
        send_notification(&mut ctx, &mut transport, &content, NotificationType::Info, 30).unwrap();
        let last_serial = transport.sent[1].serial;

        cancel_notification(&mut ctx, &mut transport, NotificationType::Info).unwrap();
        let cancel = &transport.sent[2];
        assert_eq!(cancel.msg_id, ids::METHOD_CANCEL_SESSIONLESS);
        assert_eq!(
            unmarshal_args(&mut cancel.reader()).unwrap(),
            vec![ScriptValue::Number(last_serial as f64)]
        );

        cancel_notification(&mut ctx, &mut transport, NotificationType::Info).unwrap();
        assert_eq!(transport.sent.len(), 3);
    }

    #[test]
    fn test_dismiss_replies_cancels_and_signals() {
        let mut ctx = create_context();
        let mut transport = MemoryTransport::new();
        let id = send_notification(
            &mut ctx,
            &mut transport,
            &create_content(),
            NotificationType::Emergency,
            30,
        )
        .unwrap();

        NotificationService::new()
            .handle_message(&create_dismiss(id), &mut ctx, &mut transport)
            .unwrap();
        let kinds: Vec<(MsgType, u32)> = transport.sent[1..]
            .iter()
            .map(|m| (m.msg_type, m.msg_id))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (MsgType::Reply, crate::wire::reply_id(DISMISS)),
                (MsgType::MethodCall, ids::METHOD_CANCEL_SESSIONLESS),
                (MsgType::Signal, DISMISS_SIGNAL),
            ]
        );
        assert_eq!(transport.sent[1].reply_serial, 40);
        assert_eq!(ctx.notifications.last_message_id(NotificationType::Emergency), None);
    }

    #[test]
    fn test_dismiss_of_unknown_id_still_signals() {
        let mut ctx = create_context();
        let mut transport = MemoryTransport::new();
        NotificationService::new()
            .handle_message(&create_dismiss(99), &mut ctx, &mut transport)
            .unwrap();
        assert_eq!(transport.sent.len(), 2);
        assert_eq!(transport.sent[1].msg_id, DISMISS_SIGNAL);
    }

    #[test]
    fn test_version_properties() {
        let mut ctx = create_context();
        let mut transport = MemoryTransport::new();
        let mut service = NotificationService::new();
        for (obj, iface, version) in [
            (1, NOTIFICATION_IFACE, 2.0),
            (PRODUCER_OBJECT, PRODUCER_IFACE, 1.0),
        ] {
            let mut writer = BodyWriter::new("ss");
            writer.put_string(sig::STRING, iface).unwrap();
            writer.put_string(sig::STRING, "Version").unwrap();
            let msg = WireMessage::new(MsgType::MethodCall, encode_id(SERVICE_LIST, obj, 0, accessor::GET))
                .with_serial(3)
                .with_sender(":1.6")
                .with_body("ss", writer.finish().unwrap());
            service.handle_message(&msg, &mut ctx, &mut transport).unwrap();
            let reply = transport.sent.last().unwrap();
            assert_eq!(
                unmarshal_args(&mut reply.reader()).unwrap(),
                vec![ScriptValue::Number(version)]
            );
        }
    }

    #[test]
    fn test_declines_config_and_app_messages() {
        let mut ctx = create_context();
        let mut transport = MemoryTransport::new();
        let mut service = NotificationService::new();
        for msg_id in [encode_id(SERVICE_LIST, 0, 1, 1), encode_id(1, 0, 1, 0)] {
            let msg = WireMessage::new(MsgType::MethodCall, msg_id);
            assert_eq!(
                service.handle_message(&msg, &mut ctx, &mut transport),
                Err(BusError::NoMatch)
            );
        }
        assert!(transport.sent.is_empty());
    }

    #[test]
    fn test_content_from_script() {
        let obj = ScriptValue::Object(
            ObjectMap::new()
                .with("type", 2)
                .with("text", ObjectMap::new().with("en", "hi"))
                .with("attributes", ObjectMap::new())
                .with("iconPath", "/icon")
                .with("iconUrl", ScriptValue::Null),
        );
        let content = NotificationContent::from_script(&obj).unwrap();
        assert_eq!(content.texts, vec![("en".to_string(), "hi".to_string())]);
        assert_eq!(content.icon_path.as_deref(), Some("/icon"));
        assert_eq!(content.icon_url, None);

        let bad = ScriptValue::Object(ObjectMap::new().with("text", ObjectMap::new().with("en", 5)));
        let err = NotificationContent::from_script(&bad).unwrap_err();
        assert_eq!(err.message, "text values must be strings");
    }

    #[test]
    fn test_type_codes() {
        assert_eq!(NotificationType::from_code(0.0), Some(NotificationType::Emergency));
        assert_eq!(NotificationType::from_code(2.0), Some(NotificationType::Info));
        assert_eq!(NotificationType::from_code(3.0), None);
        assert_ne!(
            NotificationType::Info.notify_id(),
            NotificationType::Warning.notify_id()
        );
    }
}
