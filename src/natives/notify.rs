//! `AJ.notification` and the `send` and `cancel` natives of the objects it
//! builds.

use super::{NativeOp, NativeScope};
use crate::error::ScriptError;
use crate::services::notification::{
    cancel_notification, send_notification, NotificationContent, NotificationType,
};
use crate::value::{ObjectMap, ScriptValue};

fn notification_type(value: &ScriptValue) -> Result<NotificationType, ScriptError> {
    let code = value
        .as_number()
        .ok_or_else(|| ScriptError::type_error("notification: requires type"))?;
    NotificationType::from_code(code)
        .ok_or_else(|| ScriptError::range_error(format!("notification: invalid type {}", code)))
}

pub(super) fn notification(
    scope: &mut NativeScope<'_>,
    args: &[ScriptValue],
) -> Result<ScriptValue, ScriptError> {
    let kind = notification_type(args.first().unwrap_or(&ScriptValue::Undefined))?;
    let text = match args.get(1) {
        None => None,
        Some(ScriptValue::String(text)) => Some(text.as_str()),
        Some(_) => return Err(ScriptError::type_error("notification text must be a string")),
    };
    let lang = match args.get(2) {
        None => scope
            .ctx
            .properties
            .get("DefaultLanguage")
            .unwrap_or("en")
            .to_string(),
        Some(ScriptValue::String(lang)) => lang.clone(),
        Some(_) => return Err(ScriptError::type_error("language must be a string")),
    };
    let mut texts = ObjectMap::new();
    if let Some(text) = text {
        texts.insert(lang, ScriptValue::from(text));
    }
    Ok(ScriptValue::Object(
        ObjectMap::new()
            .with("type", kind as u32)
            .with("text", texts)
            .with("attributes", ObjectMap::new())
            .with("audioUrls", ObjectMap::new())
            .with("iconUrl", ScriptValue::Null)
            .with("iconPath", ScriptValue::Null)
            .with("audioPath", ScriptValue::Null)
            .with("controlPanelPath", ScriptValue::Null)
            .with("send", NativeOp::SendNotification)
            .with("cancel", NativeOp::CancelNotification),
    ))
}

/// `notification.send(ttl)`, returning the notification's message id
pub(super) fn send(
    scope: &mut NativeScope<'_>,
    this: &ScriptValue,
    args: &[ScriptValue],
) -> Result<ScriptValue, ScriptError> {
    if !scope.ctx.is_attached() {
        return Err(ScriptError::not_attached("notification.send"));
    }
    let kind = notification_type(this.get("type"))?;
    let content = NotificationContent::from_script(this)?;
    let ttl = match args.first().and_then(ScriptValue::as_number) {
        Some(ttl) => ttl.clamp(0.0, u16::MAX as f64) as u16,
        None => scope.ctx.config.sessionless_ttl_secs,
    };
    let message_id = send_notification(scope.ctx, scope.transport, &content, kind, ttl)
        .map_err(|e| ScriptError::from_bus("notification.send", &e))?;
    Ok(ScriptValue::from(message_id as f64))
}

pub(super) fn cancel(scope: &mut NativeScope<'_>, this: &ScriptValue) -> Result<ScriptValue, ScriptError> {
    if !scope.ctx.is_attached() {
        return Err(ScriptError::not_attached("notification.cancel"));
    }
    let kind = notification_type(this.get("type"))?;
    cancel_notification(scope.ctx, scope.transport, kind)
        .map_err(|e| ScriptError::from_bus("notification.cancel", &e))?;
    Ok(ScriptValue::Undefined)
}
