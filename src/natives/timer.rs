//! Global timer natives: `setTimeout`, `setInterval` and their clear and
//! reset counterparts.
//!
//! Timers live in the context's shared [`ScriptTimers`](crate::dispatch::ScriptTimers),
//! which the message loop drains before every receive. Clearing or resetting
//! a timer through the wrong family (`clearTimeout` on an interval) is a type
//! error.

use super::NativeScope;
use crate::dispatch::timers::MAX_TIMERS;
use crate::error::{ErrorCode, ScriptError};
use crate::value::ScriptValue;
use std::time::Duration;

fn kind(interval: bool) -> &'static str {
    if interval {
        "Interval"
    } else {
        "Timeout"
    }
}

fn millis_arg(args: &[ScriptValue], interval: bool) -> Result<Duration, ScriptError> {
    let ms = args
        .get(1)
        .and_then(ScriptValue::as_number)
        .map(f64::trunc)
        .ok_or_else(|| ScriptError::type_error(format!("{} must be a number", kind(interval))))?;
    if ms < 1.0 {
        return Err(ScriptError::range_error(format!(
            "{} must be greater than zero",
            kind(interval)
        )));
    }
    Ok(Duration::from_millis(ms.min(u32::MAX as f64) as u64))
}

fn timer_id(scope: &NativeScope<'_>, args: &[ScriptValue], interval: bool) -> Result<u32, ScriptError> {
    let id = args
        .first()
        .and_then(ScriptValue::as_number)
        .ok_or_else(|| ScriptError::type_error("timer id must be a number"))? as u32;
    match scope.ctx.timers.lock().is_interval(id) {
        None => Err(ScriptError::range_error("No such timer")),
        Some(is_interval) if is_interval != interval => Err(ScriptError::type_error(
            "Timer has wrong type for this operation",
        )),
        Some(_) => Ok(id),
    }
}

pub(super) fn set_timer(
    scope: &mut NativeScope<'_>,
    args: &[ScriptValue],
    interval: bool,
) -> Result<ScriptValue, ScriptError> {
    let callback = match args.first() {
        Some(ScriptValue::Function(cb)) => *cb,
        _ => return Err(ScriptError::type_error("First argument must be a function")),
    };
    let delay = millis_arg(args, interval)?;
    let mut timers = scope.ctx.timers.lock();
    if timers.len() >= MAX_TIMERS {
        return Err(ScriptError::new(ErrorCode::ResourceExhausted, "Too many timers"));
    }
    let id = if interval {
        timers.set_interval(callback, delay)
    } else {
        timers.set_timeout(callback, delay)
    };
    tracing::info!(id, ms = delay.as_millis() as u64, "set{}", kind(interval));
    Ok(ScriptValue::from(id))
}

pub(super) fn clear_timer(
    scope: &mut NativeScope<'_>,
    args: &[ScriptValue],
    interval: bool,
) -> Result<ScriptValue, ScriptError> {
    let id = timer_id(scope, args, interval)?;
    scope.ctx.timers.lock().clear(id);
    Ok(ScriptValue::Undefined)
}

pub(super) fn reset_timer(
    scope: &mut NativeScope<'_>,
    args: &[ScriptValue],
    interval: bool,
) -> Result<ScriptValue, ScriptError> {
    let delay = millis_arg(args, interval)?;
    let id = timer_id(scope, args, interval)?;
    scope.ctx.timers.lock().reset(id, delay);
    Ok(ScriptValue::from(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::context::BusContext;
    use crate::dispatch::TimerService;
    use crate::engine::NativeHost;
    use crate::interface::ObjectTable;
    use crate::natives::global_object;
    use crate::propstore::{MemoryStorage, PropertyStore};
    use crate::value::Callable;
    use crate::wire::MemoryTransport;
    use std::time::Instant;

    fn create_context() -> BusContext {
        let properties = PropertyStore::open(Box::new(MemoryStorage::new()), None).unwrap();
        BusContext::new(BridgeConfig::default(), ObjectTable::new(), properties)
    }

    fn create_timer(scope: &mut NativeScope<'_>, name: &str, script: u32, ms: i32) -> ScriptValue {
        scope
            .call_method(
                &global_object(),
                name,
                &[Callable::Script(script).into(), ms.into()],
            )
            .unwrap()
    }

    #[test]
    fn test_set_timeout_fires_through_context_timers() {
        let mut ctx = create_context();
        let mut transport = MemoryTransport::new();
        let mut scope = NativeScope::new(&mut ctx, &mut transport);
        let id = create_timer(&mut scope, "setTimeout", 4, 10);
        assert!(id.as_number().unwrap() > 0.0);

        let mut timers = ctx.timers.clone();
        let due = timers.take_due(Instant::now() + Duration::from_secs(1));
        assert_eq!(due, vec![Callable::Script(4)]);
        assert!(ctx.timers.lock().is_empty());
    }

    #[test]
    fn test_clear_checks_timer_family() {
        let mut ctx = create_context();
        let mut transport = MemoryTransport::new();
        let mut scope = NativeScope::new(&mut ctx, &mut transport);
        let globals = global_object();
        let id = create_timer(&mut scope, "setInterval", 1, 50);

        let err = scope
            .call_method(&globals, "clearTimeout", &[id.clone()])
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::TypeError);

        scope.call_method(&globals, "clearInterval", &[id.clone()]).unwrap();
        let err = scope.call_method(&globals, "clearInterval", &[id]).unwrap_err();
        assert_eq!(err.code, ErrorCode::RangeError);
        assert_eq!(err.message, "No such timer");
    }

    #[test]
    fn test_reset_returns_id_and_postpones() {
        let mut ctx = create_context();
        let mut transport = MemoryTransport::new();
        let mut scope = NativeScope::new(&mut ctx, &mut transport);
        let id = create_timer(&mut scope, "setTimeout", 2, 1);
        let again = scope
            .call_method(&global_object(), "resetTimeout", &[id.clone(), 3_600_000.into()])
            .unwrap();
        assert_eq!(again, id);

        let mut timers = ctx.timers.clone();
        assert!(timers.take_due(Instant::now() + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn test_argument_validation() {
        let mut ctx = create_context();
        let mut transport = MemoryTransport::new();
        let mut scope = NativeScope::new(&mut ctx, &mut transport);
        let globals = global_object();

        let err = scope
            .call_method(&globals, "setTimeout", &[1.into(), 10.into()])
            .unwrap_err();
        assert_eq!(err.message, "First argument must be a function");

        let err = scope
            .call_method(&globals, "setInterval", &[Callable::Script(1).into(), 0.into()])
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::RangeError);
        assert!(scope.ctx.timers.lock().is_empty());
    }

    #[test]
    fn test_timer_limit() {
        let mut ctx = create_context();
        let mut transport = MemoryTransport::new();
        let mut scope = NativeScope::new(&mut ctx, &mut transport);
        for i in 0..MAX_TIMERS as u32 {
            create_timer(&mut scope, "setTimeout", i, 1000);
        }
        let err = scope
            .call_method(
                &global_object(),
                "setTimeout",
                &[Callable::Script(0).into(), 1000.into()],
            )
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ResourceExhausted);
    }
}
