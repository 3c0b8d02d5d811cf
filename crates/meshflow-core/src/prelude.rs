/*!
 * Prelude module for MeshFlow Core.
 *
 * This module re-exports commonly used types and functions from the MeshFlow Core crate
 * to make them easier to import.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export core types
pub use crate::types::{Eui64, Metadata, SharedMetadata};

// Re-export config types
pub use crate::config::{Config, ConfigBuilder, SharedConfig};

// Re-export scheduling types
pub use crate::scheduler::{DelayedTaskScheduler, ScheduledTask, TaskHandle, TokioTaskScheduler};

// Re-export utility functions
pub use crate::utils::{spawn_and_log, with_timeout};

// Re-export logging macros
pub use tracing::{debug, error, info, trace, warn};

// Re-export core initialization
pub use crate::init;
