//! # AllJoyn.js Bridge
//!
//! This library connects an embedded script engine to an AllJoyn bus. It
//! converts signature-typed wire messages into script values and back,
//! correlates replies with script callbacks, and drives the blocking message
//! loop that interleaves bus I/O, timers and script handlers.
//!
//! ## Architecture
//!
//! ```text
//! Script engine (ScriptEngine)
//!     │
//!     │ value stack + natives
//!     ▼
//! MessageLoop (this crate)
//!     │
//!     │ marshal / unmarshal
//!     ▼
//! Bus transport (BusTransport)
//! ```
//!
//! ## Features
//!
//! - **Value marshaling**: scalars, strings, variants, structs, arrays,
//!   dictionaries, byte-array fast path
//! - **Reply correlation**: exactly-once reply callbacks and reply contexts
//! - **Sessions and discovery**: accept policy, About announcements,
//!   advertised names
//! - **Built-in services**: `org.alljoyn.Config` over the property store and
//!   a notification producer
//! - **Script timers**: `setTimeout` and `setInterval` driven by the loop
//! - **Console binding**: async client and server for remote eval

#![deny(missing_docs)]

pub mod binding;
pub mod config;
pub mod context;
pub mod correlator;
pub mod discovery;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod interface;
pub mod logging;
pub mod marshal;
pub mod message;
pub mod metrics;
pub mod natives;
pub mod propstore;
pub mod services;
pub mod unmarshal;
pub mod value;
pub mod wire;

// Re-export commonly used types
pub use binding::{ConsoleClient, ConsoleHost, EvalStatus, SharedEngine};
pub use config::{BridgeConfig, ConfigError};
pub use context::{BusContext, DeferredOp, HandlerKind};
pub use dispatch::{MessageClass, MessageLoop};
pub use engine::{ClosureEngine, NativeHost, ScriptEngine, ValueStack};
pub use error::{BridgeError, BusError, BusResult, ErrorCode, Result, ScriptError};
pub use interface::{InterfaceDescription, ObjectTable};
pub use metrics::{LoopMetrics, LoopStats};
pub use propstore::{FileStorage, MemoryStorage, PropertyStore, Storage};
pub use value::{Callable, ObjectMap, ScriptValue};
pub use wire::{BusTransport, MemoryTransport, MsgType, WireMessage};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
