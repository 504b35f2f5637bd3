//! Session orchestration: serialized generations per session, streaming
//! tool steps, context summarization, revert and the event bus that
//! reports all of it.

pub mod bus;
pub mod config;
pub mod context;
pub mod error;
pub mod invoker;
pub mod journal;
pub mod permission;
pub mod processor;
pub mod prompt;
pub mod registry;
pub mod serializer;
pub mod sessions;
pub mod share;
pub mod snapshot;

#[cfg(test)]
mod testing;

pub use bus::{EventBus, EventFilter, Subscription};
pub use config::EngineConfig;
pub use context::{ContextConfig, ContextManager};
pub use error::{ChatError, ChatResult, EngineError};
pub use invoker::ToolInvoker;
pub use permission::{AllowAll, ToolRules};
pub use processor::GenerationConfig;
pub use registry::{ToolFilter, ToolRegistry};
pub use serializer::{GenerationPhase, ReplyHandle};
pub use sessions::{EngineBuilder, SessionRegistry, SessionState};
pub use share::{LocalShare, NoShare, ShareService};
pub use snapshot::{GitSnapshots, NoSnapshots};
