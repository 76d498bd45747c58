//! QuickJS bridge – isolated JavaScript engines behind a method channel.
//!
//! Each engine lives on its own worker thread and is addressed by an opaque
//! handle. Hosts talk to the [`Dispatcher`] with named operations and
//! bincode payloads, or to the [`MethodChannel`] with plain JSON. Nothing
//! here depends on a particular host runtime, so the same crate backs the
//! CLI harness and embedding hosts.

pub mod channel;
pub mod codec;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod doctor;
pub mod quickjs;
pub mod scenario;
pub mod traits;
pub mod types;
pub mod value;
pub mod worker;

#[cfg(test)]
mod testing;

// Re-exports for convenience
pub use channel::{ChannelResponse, MethodCall, MethodChannel};
pub use config::{get_config, BridgeConfig};
pub use context::BridgeContext;
pub use dispatcher::{DispatchError, Dispatcher, Operation};
pub use types::{CallResult, EngineHandle, ErrorCode, ErrorInfo, Status};
pub use value::{EngineValue, FunctionRef};
