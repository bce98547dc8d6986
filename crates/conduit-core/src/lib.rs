pub mod authorization;
pub mod backends;
pub mod call_history;
pub mod config;
pub mod dispatch;
pub mod event_bus;
pub mod failure;
pub mod followup;
pub mod orchestrator;
pub mod prompt;
pub mod runtime;

pub use authorization::*;
pub use backends::{
    BackendRouter, CallGuards, ExecutionBackend, ExecutionContext, McpBackend, WebBackend,
};
pub use call_history::*;
pub use config::*;
pub use dispatch::*;
pub use event_bus::*;
pub use failure::*;
pub use followup::{ResultClass, ToolExchange};
pub use orchestrator::*;
pub use runtime::*;
