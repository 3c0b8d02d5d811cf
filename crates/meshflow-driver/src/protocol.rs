/*!
 * Collaborator interfaces.
 *
 * The driver framework talks to the radio stack, the device registry, the
 * descriptor catalog, the comm-fail watchdog and the firmware server only
 * through the traits in this module. Sends on the mesh complete when the
 * message has been accepted for sending, never when the device answers.
 */
use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use meshflow_core::types::Eui64;

use crate::cluster::{AttributeReport, AttributeWrite, ClusterCommand, OutboundCommand, ReportingConfig};
use crate::device::{DeviceDescriptor, DeviceFoundDetails, DeviceRecord, DiscoveredDeviceDetails};
use crate::error::Result;

/// The mesh radio stack
#[async_trait]
pub trait MeshNetwork: Send + Sync + Debug {
    /// Send a cluster command
    async fn send_command(&self, eui64: Eui64, endpoint_id: u8, command: &OutboundCommand) -> Result<()>;

    /// Write an attribute
    async fn write_attribute(&self, eui64: Eui64, endpoint_id: u8, write: &AttributeWrite) -> Result<()>;

    /// Read an attribute
    async fn read_attribute(
        &self,
        eui64: Eui64,
        endpoint_id: u8,
        cluster_id: u16,
        attribute_id: u16,
    ) -> Result<Bytes>;

    /// Bind a cluster on the device to this hub
    async fn set_binding(&self, eui64: Eui64, endpoint_id: u8, cluster_id: u16) -> Result<()>;

    /// Configure attribute reporting
    async fn set_attribute_reporting(
        &self,
        eui64: Eui64,
        endpoint_id: u8,
        cluster_id: u16,
        configs: &[ReportingConfig],
    ) -> Result<()>;

    /// Ask the device to leave the mesh
    async fn request_leave(&self, eui64: Eui64) -> Result<()>;

    /// Tell the device a new OTA image is available
    async fn send_image_notify(&self, eui64: Eui64, endpoint_id: u8) -> Result<()>;

    /// Route inbound messages from a device to a handler
    fn register_listener(&self, eui64: Eui64, handler: Arc<dyn MeshEventHandler>);

    /// Stop routing inbound messages from a device
    fn unregister_listener(&self, eui64: Eui64);

    /// Offer newly discovered devices to a handler
    fn register_discovery_handler(&self, driver_name: &str, handler: Arc<dyn DiscoveryHandler>);

    /// Stop offering discovered devices to a handler
    fn unregister_discovery_handler(&self, driver_name: &str);
}

/// Receives inbound messages for the devices a driver owns
#[async_trait]
pub trait MeshEventHandler: Send + Sync {
    /// An attribute report arrived
    async fn attribute_report_received(&self, report: AttributeReport);

    /// A cluster command arrived
    async fn cluster_command_received(&self, command: ClusterCommand);

    /// The device rejoined the mesh
    async fn device_rejoined(&self, eui64: Eui64, secure: bool);

    /// The device left the mesh
    async fn device_left(&self, eui64: Eui64);
}

/// Receives newly discovered devices
#[async_trait]
pub trait DiscoveryHandler: Send + Sync {
    /// A device was discovered; returns whether it was claimed
    async fn device_discovered(&self, details: &DiscoveredDeviceDetails, migrating: bool) -> bool;
}

/// The device registry and its persistence
#[async_trait]
pub trait DeviceService: Send + Sync + Debug {
    /// Present a claimed device; returns whether it was accepted
    async fn device_found(&self, details: &DeviceFoundDetails, never_reject: bool) -> bool;

    /// Update a resource value
    async fn update_resource(
        &self,
        uuid: &str,
        endpoint_id: Option<u8>,
        name: &str,
        value: &str,
    ) -> Result<()>;

    /// Get a resource value
    async fn get_resource(&self, uuid: &str, endpoint_id: Option<u8>, name: &str) -> Option<String>;

    /// Get a metadata value
    async fn get_metadata(&self, uuid: &str, key: &str) -> Option<String>;

    /// Set a metadata value
    async fn set_metadata(&self, uuid: &str, key: &str, value: &str) -> Result<()>;

    /// Remove a device
    async fn remove_device(&self, uuid: &str) -> Result<()>;

    /// Every persisted device owned by a driver
    async fn devices_by_driver(&self, driver_name: &str) -> Vec<DeviceRecord>;
}

/// Resolves catalog descriptors
pub trait DescriptorCatalog: Send + Sync + Debug {
    /// Find the descriptor for a device
    fn resolve(
        &self,
        manufacturer: &str,
        model: &str,
        hardware_version: &str,
        firmware_version: &str,
    ) -> Option<DeviceDescriptor>;
}

/// Declares devices failed after a period of silence
pub trait CommFailWatchdog: Send + Sync + Debug {
    /// Start monitoring a device
    fn monitor_device(&self, uuid: &str, timeout: Duration, initially_failed: bool);

    /// Stop monitoring a device
    fn stop_monitoring_device(&self, uuid: &str);
}

/// Downloads firmware files
#[async_trait]
pub trait FirmwareFetcher: Send + Sync + Debug {
    /// Fetch one file to the given destination path
    async fn fetch(&self, filename: &str, destination: &Path) -> anyhow::Result<()>;
}
