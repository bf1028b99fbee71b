//! `AJ.load` and `AJ.store` over the property store.

use super::{require_str, NativeScope};
use crate::error::ScriptError;
use crate::value::ScriptValue;

pub(super) fn load(scope: &mut NativeScope<'_>, args: &[ScriptValue]) -> Result<ScriptValue, ScriptError> {
    let name = require_str(args, 0, "property name")?;
    scope
        .ctx
        .properties
        .load(name)
        .map_err(|e| e.to_script_error())
}

pub(super) fn store(scope: &mut NativeScope<'_>, args: &[ScriptValue]) -> Result<ScriptValue, ScriptError> {
    let name = require_str(args, 0, "property name")?;
    let value = args.get(1).cloned().unwrap_or_default();
    scope
        .ctx
        .properties
        .store(name, &value)
        .map_err(|e| e.to_script_error())?;
    Ok(ScriptValue::Undefined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::context::BusContext;
    use crate::engine::NativeHost;
    use crate::interface::ObjectTable;
    use crate::natives::aj_object;
    use crate::propstore::{MemoryStorage, PropertyStore};
    use crate::wire::MemoryTransport;

    fn create_context() -> BusContext {
        let properties = PropertyStore::open(Box::new(MemoryStorage::new()), Some("dev")).unwrap();
        BusContext::new(BridgeConfig::default(), ObjectTable::new(), properties)
    }

    #[test]
    fn test_load_built_in_and_script_values() {
        let mut ctx = create_context();
        let mut transport = MemoryTransport::new();
        let mut scope = NativeScope::new(&mut ctx, &mut transport);
        let aj = aj_object();

        let name = scope.call_method(&aj, "load", &["DeviceName".into()]).unwrap();
        assert_eq!(name.as_str(), Some("dev"));

        scope
            .call_method(&aj, "store", &["threshold".into(), 42.into()])
            .unwrap();
        let value = scope.call_method(&aj, "load", &["threshold".into()]).unwrap();
        assert_eq!(value, ScriptValue::Number(42.0));
    }

    #[test]
    fn test_store_requires_name() {
        let mut ctx = create_context();
        let mut transport = MemoryTransport::new();
        let mut scope = NativeScope::new(&mut ctx, &mut transport);
        let err = scope.call_method(&aj_object(), "store", &[1.into()]).unwrap_err();
        assert_eq!(err.message, "property name must be a string");
    }

    #[test]
    fn test_store_built_in_needs_string() {
        let mut ctx = create_context();
        let mut transport = MemoryTransport::new();
        let mut scope = NativeScope::new(&mut ctx, &mut transport);
        let err = scope
            .call_method(&aj_object(), "store", &["DeviceName".into(), 5.into()])
            .unwrap_err();
        assert_eq!(err.message, "value must be a string");
    }
}
