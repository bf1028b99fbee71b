//! Script engine boundary.
//!
//! The bridge talks to the engine through a value stack: callers push a
//! function, its `this` value and the arguments, then
//! [`ScriptEngine::pcall_method`] replaces them with a single result. Native
//! functions reached from script code are routed back through a
//! [`NativeHost`], so the engine never needs to know about the bus.

use crate::error::ScriptError;
use crate::natives::NativeFn;
use crate::value::{Callable, ScriptFnId, ScriptValue};

/// Stack used to exchange values with the engine
#[derive(Debug, Default, Clone)]
pub struct ValueStack {
    values: Vec<ScriptValue>,
}

impl ValueStack {
    /// Create an empty stack
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a value
    pub fn push(&mut self, value: impl Into<ScriptValue>) {
        self.values.push(value.into());
    }

    /// Pop the top value, undefined when empty
    pub fn pop(&mut self) -> ScriptValue {
        self.values.pop().unwrap_or_default()
    }

    /// Pop the top `n` values in push order
    pub fn pop_n(&mut self, n: usize) -> Vec<ScriptValue> {
        let at = self.values.len().saturating_sub(n);
        self.values.split_off(at)
    }

    /// Value at the top
    pub fn top(&self) -> Option<&ScriptValue> {
        self.values.last()
    }

    /// Number of values on the stack
    pub fn depth(&self) -> usize {
        self.values.len()
    }

    /// Drop values above `depth`
    pub fn truncate(&mut self, depth: usize) {
        self.values.truncate(depth);
    }
}

/// Receiver for native calls made by script code
pub trait NativeHost {
    /// Invoke a native function
    fn call_native(
        &mut self,
        native: NativeFn,
        this: &ScriptValue,
        args: &[ScriptValue],
    ) -> Result<ScriptValue, ScriptError>;

    /// Call the native bound to property `name` of `this`, as `this.name(args)`
    fn call_method(
        &mut self,
        this: &ScriptValue,
        name: &str,
        args: &[ScriptValue],
    ) -> Result<ScriptValue, ScriptError> {
        match this.get(name) {
            ScriptValue::Function(Callable::Native(native)) => self.call_native(*native, this, args),
            other => Err(ScriptError::type_error(format!(
                "{} is not a native function ({})",
                name,
                other.to_key_string()
            ))),
        }
    }
}

/// Capability interface of the embedded script engine
pub trait ScriptEngine {
    /// Value exchange stack
    fn stack(&self) -> &ValueStack;

    /// Mutable value exchange stack
    fn stack_mut(&mut self) -> &mut ValueStack;

    /// Run a script-defined function
    fn invoke(
        &mut self,
        func: ScriptFnId,
        this: &ScriptValue,
        args: &[ScriptValue],
        host: &mut dyn NativeHost,
    ) -> Result<ScriptValue, ScriptError>;

    /// Compile and run source text
    fn eval(&mut self, source: &str, host: &mut dyn NativeHost) -> Result<ScriptValue, ScriptError> {
        let _ = (source, host);
        Err(ScriptError::internal_error("eval is not supported by this engine"))
    }

    /// Release strings and buffers pinned during the previous dispatch turn
    fn clear_pinned(&mut self) {}

    /// Call `[func, this, args...]` from the stack in protected mode
    ///
    /// The `argc + 2` values are replaced by exactly one value: the result on
    /// success, the error text on failure.
    fn pcall_method(&mut self, argc: usize, host: &mut dyn NativeHost) -> Result<(), ScriptError> {
        let stack = self.stack_mut();
        let args = stack.pop_n(argc);
        let this = stack.pop();
        let func = stack.pop();
        let outcome = match func {
            ScriptValue::Function(Callable::Native(native)) => host.call_native(native, &this, &args),
            ScriptValue::Function(Callable::Script(id)) => self.invoke(id, &this, &args, host),
            other => Err(ScriptError::type_error(format!(
                "{} is not callable",
                other.to_key_string()
            ))),
        };
        match outcome {
            Ok(value) => {
                self.stack_mut().push(value);
                Ok(())
            }
            Err(err) => {
                self.stack_mut().push(err.to_string());
                Err(err)
            }
        }
    }

    /// Call a function with the given receiver and arguments, returning its result
    ///
    /// Stack depth is unchanged on return.
    fn call(
        &mut self,
        func: Callable,
        this: ScriptValue,
        args: Vec<ScriptValue>,
        host: &mut dyn NativeHost,
    ) -> Result<ScriptValue, ScriptError> {
        let argc = args.len();
        let stack = self.stack_mut();
        stack.push(func);
        stack.push(this);
        for arg in args {
            stack.push(arg);
        }
        let status = self.pcall_method(argc, host);
        let result = self.stack_mut().pop();
        status.map(|_| result)
    }
}

/// Signature of a function registered with [`ClosureEngine`]
pub type ClosureFn = Box<
    dyn FnMut(&ScriptValue, &[ScriptValue], &mut dyn NativeHost) -> Result<ScriptValue, ScriptError>
        + Send,
>;

/// Engine whose "script" functions are Rust closures
///
/// Hosts use it to implement handlers natively; tests use it to script the
/// bridge deterministically.
#[derive(Default)]
pub struct ClosureEngine {
    stack: ValueStack,
    functions: Vec<ClosureFn>,
    pinned: usize,
}

impl ClosureEngine {
    /// Create an engine with no functions
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function and return a callable for it
    pub fn register<F>(&mut self, f: F) -> Callable
    where
        F: FnMut(&ScriptValue, &[ScriptValue], &mut dyn NativeHost) -> Result<ScriptValue, ScriptError>
            + Send
            + 'static,
    {
        self.functions.push(Box::new(f));
        Callable::Script((self.functions.len() - 1) as ScriptFnId)
    }

    /// Number of times pinned values were released
    pub fn pin_clears(&self) -> usize {
        self.pinned
    }
}

impl std::fmt::Debug for ClosureEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClosureEngine")
            .field("stack_depth", &self.stack.depth())
            .field("functions", &self.functions.len())
            .finish()
    }
}

impl ScriptEngine for ClosureEngine {
    fn stack(&self) -> &ValueStack {
        &self.stack
    }

    fn stack_mut(&mut self) -> &mut ValueStack {
        &mut self.stack
    }

    fn invoke(
        &mut self,
        func: ScriptFnId,
        this: &ScriptValue,
        args: &[ScriptValue],
        host: &mut dyn NativeHost,
    ) -> Result<ScriptValue, ScriptError> {
        let f = self
            .functions
            .get_mut(func as usize)
            .ok_or_else(|| ScriptError::internal_error(format!("no function {}", func)))?;
        f(this, args, host)
    }

    fn clear_pinned(&mut self) {
        self.pinned += 1;
    }
}
