//! Managed tools: per-tool HTTP client, registry, and on-demand lifecycle.

pub mod client;
pub mod lifecycle;
pub mod registry;

pub use client::{ActionError, ToolClient};
pub use lifecycle::{EnsureOutcome, LifecycleError, LifecycleManager, STDERR_TAIL_LINES};
pub use registry::{RegistryError, ToolRegistry};
