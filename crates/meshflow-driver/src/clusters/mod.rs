/*!
 * Cluster implementations for MeshFlow.
 *
 * This module contains clusters shared by concrete drivers.
 */

// Export cluster implementations
pub mod on_off;
pub mod poll_control;

// Re-export specific cluster implementations for convenience
pub use on_off::{OnOffCluster, IS_ON_RESOURCE};
pub use poll_control::{PollControlCluster, CHECK_IN_INTERVAL_KEY};
