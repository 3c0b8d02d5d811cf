/*!
 * MeshFlow Driver
 *
 * This crate provides the generic driver framework for Zigbee-class mesh
 * devices: clusters and their registry, request/response correlation,
 * discovery and claim, the firmware upgrade pipeline and the driver
 * instance that ties them together.
 */

#![warn(missing_docs)]

// Re-export core types
pub use meshflow_core::prelude;

pub mod cluster;
pub mod clusters;
pub mod device;
pub mod discovery;
pub mod driver;
pub mod drivers;
pub mod error;
pub mod firmware;
pub mod protocol;
pub mod registry;
pub mod synchronizer;

#[cfg(feature = "http")]
pub mod fetch;

#[cfg(test)]
mod mock;

// Re-export the driver and its building blocks
pub use cluster::{Cluster, ClusterPriority, DeviceConfigurationContext, ResponseType};
pub use driver::{Collaborators, DriverHooks, DriverSettings, DriverState, ZigbeeDriver};
pub use error::{DriverError, Result};
pub use synchronizer::{AsyncResponse, RequestResponseSynchronizer, SynchronizerRegistry};

#[cfg(feature = "http")]
pub use fetch::HttpFirmwareFetcher;

/// MeshFlow driver crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the driver framework
pub fn init() -> std::result::Result<(), meshflow_core::error::Error> {
    tracing::info!("MeshFlow Driver {} initialized", VERSION);
    Ok(())
}

/// Features compiled into this build
pub fn available_features() -> Vec<&'static str> {
    let mut features = Vec::new();

    #[cfg(feature = "http")]
    features.push("http");

    features
}
