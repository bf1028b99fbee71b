//! `org.alljoyn.Config` service over the property store.
//!
//! The interface is secure: calls that did not arrive encrypted are refused
//! with a security violation error before any argument is read.

use super::{send_reply, version_reply, ServiceHandler, SERVICE_LIST};
use crate::context::{BusContext, DeferredOp};
use crate::correlator::ReplyContext;
use crate::error::{BusError, BusResult};
use crate::interface::InterfaceDescription;
use crate::message::{self, ERR_SECURITY_VIOLATION};
use crate::propstore::{PropertyStore, ReadFilter, MAX_PROP_LENGTH};
use crate::unmarshal::unmarshal_args;
use crate::value::ScriptValue;
use crate::wire::signature as sig;
use crate::wire::{accessor, encode_id, BodyWriter, BusTransport, MessageId, MsgType, WireMessage};

/// Object path of the config service
pub const OBJECT_PATH: &str = "/Config";

/// Interface name
pub const INTERFACE_NAME: &str = "org.alljoyn.Config";

/// Interface version reported by the `Version` property
pub const VERSION: u16 = 1;

const CONFIG_OBJECT: u8 = 0;

/// `Properties.Get` on the config object
pub const GET_PROPERTY: u32 = encode_id(SERVICE_LIST, CONFIG_OBJECT, 0, accessor::GET);
/// `FactoryReset`
pub const FACTORY_RESET: u32 = encode_id(SERVICE_LIST, CONFIG_OBJECT, 1, 1);
/// `Restart`
pub const RESTART: u32 = encode_id(SERVICE_LIST, CONFIG_OBJECT, 1, 2);
/// `SetPasscode`
pub const SET_PASSCODE: u32 = encode_id(SERVICE_LIST, CONFIG_OBJECT, 1, 3);
/// `GetConfigurations`
pub const GET_CONFIGURATIONS: u32 = encode_id(SERVICE_LIST, CONFIG_OBJECT, 1, 4);
/// `UpdateConfigurations`
pub const UPDATE_CONFIGURATIONS: u32 = encode_id(SERVICE_LIST, CONFIG_OBJECT, 1, 5);
/// `ResetConfigurations`
pub const RESET_CONFIGURATIONS: u32 = encode_id(SERVICE_LIST, CONFIG_OBJECT, 1, 6);

/// Error names returned by the service
pub mod errors {
    /// Requested language is not the default language
    pub const LANGUAGE_NOT_SUPPORTED: &str = "org.alljoyn.Error.LanguageNotSupported";
    /// Field is unknown or read-only
    pub const UPDATE_NOT_ALLOWED: &str = "org.alljoyn.Error.UpdateNotAllowed";
    /// Value has the wrong type or length
    pub const INVALID_VALUE: &str = "org.alljoyn.Error.InvalidValue";
}

/// Member declarations of the config interface, in id order
pub fn interface() -> BusResult<InterfaceDescription> {
    InterfaceDescription::parse(&[
        "$org.alljoyn.Config",
        "@Version>q",
        "?FactoryReset",
        "?Restart",
        "?SetPasscode daemonRealm<s newPasscode<ay",
        "?GetConfigurations languageTag<s languages>a{sv}",
        "?UpdateConfigurations languageTag<s configMap<a{sv}",
        "?ResetConfigurations languageTag<s fieldList<as",
    ])
}

/// Config service pre-handler
#[derive(Debug, Default)]
pub struct ConfigService;

impl ConfigService {
    /// Create the service
    pub fn new() -> Self {
        Self
    }
}

fn send_error(
    ctx: &mut BusContext,
    transport: &mut dyn BusTransport,
    msg: &WireMessage,
    name: &str,
) -> BusResult<()> {
    tracing::debug!(serial = msg.serial, error = name, "Config call refused");
    let reply = message::error_reply(&ReplyContext::from_call(msg, None), name, None)?;
    ctx.deliver(transport, reply).map(|_| ())
}

fn language_supported(store: &PropertyStore, tag: &str) -> bool {
    tag.is_empty()
        || store
            .get("DefaultLanguage")
            .map_or(false, |lang| lang.eq_ignore_ascii_case(tag))
}

fn store_error(e: crate::error::BridgeError) -> BusError {
    BusError::invalid(e.to_string())
}

fn get_configurations(store: &PropertyStore) -> BusResult<Vec<u8>> {
    let mut writer = BodyWriter::new("a{sv}");
    writer.open_container(sig::ARRAY)?;
    for (name, value) in store.read_all(ReadFilter::Config) {
        writer.open_container(sig::DICT_OPEN)?;
        writer.put_string(sig::STRING, name)?;
        writer.open_variant("s")?;
        writer.put_string(sig::STRING, value)?;
        writer.close_container()?;
    }
    writer.close_container()?;
    writer.finish()
}

/// Check every update before applying any of them
fn validate_updates(updates: &ScriptValue) -> Result<Vec<(String, String)>, &'static str> {
    let Some(map) = updates.as_object() else {
        return Err(errors::INVALID_VALUE);
    };
    let mut checked = Vec::with_capacity(map.len());
    for (name, value) in map.iter() {
        if !PropertyStore::is_built_in(name) || PropertyStore::is_read_only(name) {
            return Err(errors::UPDATE_NOT_ALLOWED);
        }
        let text = value.as_str().ok_or(errors::INVALID_VALUE)?;
        if text.is_empty() || text.len() > MAX_PROP_LENGTH {
            return Err(errors::INVALID_VALUE);
        }
        checked.push((name.clone(), text.to_string()));
    }
    Ok(checked)
}

impl ServiceHandler for ConfigService {
    fn name(&self) -> &'static str {
        "config"
    }

    fn handle_message(
        &mut self,
        msg: &WireMessage,
        ctx: &mut BusContext,
        transport: &mut dyn BusTransport,
    ) -> BusResult<()> {
        let id = MessageId::decode(msg.msg_id);
        if id.list != SERVICE_LIST
            || id.obj != CONFIG_OBJECT
            || id.is_reply
            || msg.msg_type != MsgType::MethodCall
        {
            return Err(BusError::NoMatch);
        }
        if !msg.is_encrypted() {
            tracing::warn!(sender = %msg.sender, member = %msg.member, "Unencrypted config call");
            return send_error(ctx, transport, msg, ERR_SECURITY_VIOLATION);
        }
        let args = unmarshal_args(&mut msg.reader())?;
        let lang = args.first().and_then(ScriptValue::as_str).unwrap_or("");

        match msg.msg_id {
            GET_PROPERTY => {
                let prop = args.get(1).and_then(ScriptValue::as_str);
                if args.first().and_then(ScriptValue::as_str) != Some(INTERFACE_NAME)
                    || prop != Some("Version")
                {
                    return Err(BusError::NoMatch);
                }
                version_reply(ctx, transport, msg, VERSION)
            }
            FACTORY_RESET => {
                send_reply(ctx, transport, msg, None)?;
                ctx.defer(DeferredOp::FactoryReset);
                Ok(())
            }
            RESTART => {
                send_reply(ctx, transport, msg, None)?;
                ctx.defer(DeferredOp::Restart);
                Ok(())
            }
            SET_PASSCODE => {
                let realm = lang;
                let passcode = args.get(1).and_then(ScriptValue::as_buffer).unwrap_or(&[]);
                if passcode.is_empty() {
                    return send_error(ctx, transport, msg, errors::INVALID_VALUE);
                }
                ctx.properties.set("RealmName", realm).map_err(store_error)?;
                ctx.properties.set_passcode(passcode).map_err(store_error)?;
                send_reply(ctx, transport, msg, None)
            }
            GET_CONFIGURATIONS => {
                if !language_supported(&ctx.properties, lang) {
                    return send_error(ctx, transport, msg, errors::LANGUAGE_NOT_SUPPORTED);
                }
                let body = get_configurations(&ctx.properties)?;
                send_reply(ctx, transport, msg, Some(("a{sv}", body)))
            }
            UPDATE_CONFIGURATIONS => {
                if !language_supported(&ctx.properties, lang) {
                    return send_error(ctx, transport, msg, errors::LANGUAGE_NOT_SUPPORTED);
                }
                let updates = match validate_updates(args.get(1).unwrap_or(&ScriptValue::Undefined)) {
                    Ok(updates) => updates,
                    Err(name) => return send_error(ctx, transport, msg, name),
                };
                for (name, value) in &updates {
                    ctx.properties.set(name, value).map_err(store_error)?;
                }
                tracing::info!(fields = updates.len(), "Configuration updated");
                send_reply(ctx, transport, msg, None)
            }
            RESET_CONFIGURATIONS => {
                if !language_supported(&ctx.properties, lang) {
                    return send_error(ctx, transport, msg, errors::LANGUAGE_NOT_SUPPORTED);
                }
                let fields: Vec<&str> = args
                    .get(1)
                    .and_then(ScriptValue::as_array)
                    .map(|list| list.iter().filter_map(ScriptValue::as_str).collect())
                    .unwrap_or_default();
                if fields
                    .iter()
                    .any(|f| !PropertyStore::is_built_in(f) || PropertyStore::is_read_only(f))
                {
                    return send_error(ctx, transport, msg, errors::UPDATE_NOT_ALLOWED);
                }
                for field in fields {
                    ctx.properties.reset(field).map_err(store_error)?;
                }
                send_reply(ctx, transport, msg, None)
            }
            _ => Err(BusError::NoMatch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::interface::ObjectTable;
    use crate::propstore::MemoryStorage;
    use crate::value::ObjectMap;
    use crate::wire::{flags, MemoryTransport};

    fn create_context() -> BusContext {
        let properties = PropertyStore::open(Box::new(MemoryStorage::new()), Some("lamp")).unwrap();
        let mut ctx = BusContext::new(BridgeConfig::default(), ObjectTable::new(), properties);
        ctx.attach(":1.1");
        ctx
    }

    fn create_call(msg_id: u32, signature: &str, build: impl FnOnce(&mut BodyWriter)) -> WireMessage {
        let mut writer = BodyWriter::new(signature);
        build(&mut writer);
        WireMessage::new(MsgType::MethodCall, msg_id)
            .with_serial(21)
            .with_sender(":1.8")
            .with_member(OBJECT_PATH, INTERFACE_NAME, "x")
            .with_flags(flags::ENCRYPTED)
            .with_body(signature, writer.finish().unwrap())
    }

    fn lang_call(msg_id: u32) -> WireMessage {
        create_call(msg_id, "s", |w| w.put_string(sig::STRING, "en").unwrap())
    }

    fn handle(ctx: &mut BusContext, msg: &WireMessage) -> (BusResult<()>, MemoryTransport) {
        let mut transport = MemoryTransport::new();
        let result = ConfigService::new().handle_message(msg, ctx, &mut transport);
        (result, transport)
    }

    #[test]
    fn test_interface_ids_match_declaration() {
        let desc = interface().unwrap();
        assert!(desc.secure);
        assert_eq!(desc.member("FactoryReset").unwrap().0, 1);
        assert_eq!(desc.member("ResetConfigurations").unwrap().0, 6);
    }

    #[test]
    fn test_declines_other_messages() {
        let mut ctx = create_context();
        let msg = WireMessage::new(MsgType::MethodCall, encode_id(1, 0, 1, 0));
        let (result, transport) = handle(&mut ctx, &msg);
        assert_eq!(result, Err(BusError::NoMatch));
        assert!(transport.sent.is_empty());
    }

    #[test]
    fn test_unencrypted_call_refused() {
        let mut ctx = create_context();
        let mut msg = lang_call(GET_CONFIGURATIONS);
        msg.flags = 0;
        let (result, transport) = handle(&mut ctx, &msg);
        assert!(result.is_ok());
        assert_eq!(transport.sent[0].msg_type, MsgType::Error);
        assert_eq!(transport.sent[0].error_name, ERR_SECURITY_VIOLATION);
    }

    #[test]
    fn test_get_configurations() {
        let mut ctx = create_context();
        let (result, transport) = handle(&mut ctx, &lang_call(GET_CONFIGURATIONS));
        assert!(result.is_ok());
        let reply = &transport.sent[0];
        assert_eq!(reply.msg_type, MsgType::Reply);
        assert_eq!(reply.reply_serial, 21);
        let args = unmarshal_args(&mut reply.reader()).unwrap();
        assert_eq!(args[0].get("DeviceName").as_str(), Some("lamp"));
        assert!(args[0].get("DeviceId").is_undefined());
        assert!(args[0].get("Passcode").is_undefined());
    }

    #[test]
    fn test_unsupported_language() {
        let mut ctx = create_context();
        let msg = create_call(GET_CONFIGURATIONS, "s", |w| w.put_string(sig::STRING, "fr").unwrap());
        let (_, transport) = handle(&mut ctx, &msg);
        assert_eq!(transport.sent[0].error_name, errors::LANGUAGE_NOT_SUPPORTED);
    }

    #[test]
    fn test_update_configurations() {
        let mut ctx = create_context();
        let msg = create_call(UPDATE_CONFIGURATIONS, "sa{sv}", |w| {
            w.put_string(sig::STRING, "en").unwrap();
            w.open_container(sig::ARRAY).unwrap();
            w.open_container(sig::DICT_OPEN).unwrap();
            w.put_string(sig::STRING, "DeviceName").unwrap();
            w.open_variant("s").unwrap();
            w.put_string(sig::STRING, "kitchen").unwrap();
            w.close_container().unwrap();
            w.close_container().unwrap();
        });
        let (result, transport) = handle(&mut ctx, &msg);
        assert!(result.is_ok());
        assert_eq!(transport.sent[0].msg_type, MsgType::Reply);
        assert_eq!(ctx.properties.get("DeviceName"), Some("kitchen"));
    }

    #[test]
    fn test_update_read_only_refused() {
        let mut ctx = create_context();
        let before = ctx.properties.get("DeviceId").map(str::to_string);
        let msg = create_call(UPDATE_CONFIGURATIONS, "sa{sv}", |w| {
            w.put_string(sig::STRING, "").unwrap();
            w.open_container(sig::ARRAY).unwrap();
            w.open_container(sig::DICT_OPEN).unwrap();
            w.put_string(sig::STRING, "DeviceId").unwrap();
            w.open_variant("s").unwrap();
            w.put_string(sig::STRING, "abc").unwrap();
            w.close_container().unwrap();
            w.close_container().unwrap();
        });
        let (_, transport) = handle(&mut ctx, &msg);
        assert_eq!(transport.sent[0].error_name, errors::UPDATE_NOT_ALLOWED);
        assert_eq!(ctx.properties.get("DeviceId").map(str::to_string), before);
    }

    #[test]
    fn test_validate_updates_length() {
        let long = "x".repeat(MAX_PROP_LENGTH + 1);
        let updates = ScriptValue::Object(ObjectMap::new().with("AppName", long.as_str()));
        assert_eq!(validate_updates(&updates), Err(errors::INVALID_VALUE));
        let updates = ScriptValue::Object(ObjectMap::new().with("AppName", "lights"));
        assert_eq!(
            validate_updates(&updates),
            Ok(vec![("AppName".to_string(), "lights".to_string())])
        );
    }

    #[test]
    fn test_reset_configurations() {
        let mut ctx = create_context();
        ctx.properties.set("AppName", "custom").unwrap();
        let msg = create_call(RESET_CONFIGURATIONS, "sas", |w| {
            w.put_string(sig::STRING, "en").unwrap();
            w.open_container(sig::ARRAY).unwrap();
            w.put_string(sig::STRING, "AppName").unwrap();
            w.close_container().unwrap();
        });
        let (result, _) = handle(&mut ctx, &msg);
        assert!(result.is_ok());
        assert_eq!(ctx.properties.get("AppName"), Some("AllJoyn.js"));
    }

    #[test]
    fn test_factory_reset_and_restart_are_deferred() {
        let mut ctx = create_context();
        let (_, transport) = handle(&mut ctx, &create_call(FACTORY_RESET, "", |_| {}));
        assert_eq!(transport.sent[0].msg_type, MsgType::Reply);
        assert_eq!(ctx.take_deferred(), Some(DeferredOp::FactoryReset));

        handle(&mut ctx, &create_call(RESTART, "", |_| {}));
        assert_eq!(ctx.take_deferred(), Some(DeferredOp::Restart));
    }

    #[test]
    fn test_set_passcode() {
        let mut ctx = create_context();
        let msg = create_call(SET_PASSCODE, "say", |w| {
            w.put_string(sig::STRING, "home").unwrap();
            w.put_byte_array(&[0x12, 0x34]).unwrap();
        });
        let (result, _) = handle(&mut ctx, &msg);
        assert!(result.is_ok());
        assert_eq!(ctx.properties.get("Passcode"), Some("1234"));
        assert_eq!(ctx.properties.get("RealmName"), Some("home"));
    }

    #[test]
    fn test_version_property() {
        let mut ctx = create_context();
        let msg = create_call(GET_PROPERTY, "ss", |w| {
            w.put_string(sig::STRING, INTERFACE_NAME).unwrap();
            w.put_string(sig::STRING, "Version").unwrap();
        });
        let (_, transport) = handle(&mut ctx, &msg);
        let args = unmarshal_args(&mut transport.sent[0].reader()).unwrap();
        assert_eq!(args, vec![ScriptValue::Number(1.0)]);
    }
}
