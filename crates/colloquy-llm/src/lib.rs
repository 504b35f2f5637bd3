//! Model backend support: provider capability table, model catalog,
//! retry policy and in-process backends for tests and offline use.

pub mod echo;
pub mod mock;
pub mod models;
pub mod retry;

pub use echo::EchoBackend;
pub use mock::{MockBackend, MockResponse};
pub use models::{find_model, Capabilities, ModelInfo, ProviderKind};
pub use retry::RetryPolicy;
