/*!
 * Device data model.
 *
 * This module defines what the driver framework knows about a device at each
 * stage of its life: the details captured during discovery, the catalog
 * descriptor resolved for it, the summary presented to the device registry
 * and the record the registry hands back after a restart.
 */
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use meshflow_core::types::{Eui64, Metadata};

use crate::error::DriverError;

/// Names of the resources every device gets from the common driver
pub mod resources {
    /// Current firmware version, rendered as `0x%08x`
    pub const FIRMWARE_VERSION: &str = "firmwareVersion";
    /// Progress of the firmware upgrade pipeline
    pub const FIRMWARE_UPDATE_STATUS: &str = "firmwareUpdateStatus";
    /// Whether the comm-fail watchdog considers the device failed
    pub const COMMUNICATION_FAILURE: &str = "communicationFailure";
    /// Near-end received signal strength
    pub const NE_RSSI: &str = "neRssi";
    /// Near-end link quality indicator
    pub const NE_LQI: &str = "neLqi";
    /// Manufacturer reported by the Basic cluster
    pub const MANUFACTURER: &str = "manufacturer";
    /// Model reported by the Basic cluster
    pub const MODEL: &str = "model";
    /// Hardware version reported by the Basic cluster
    pub const HARDWARE_VERSION: &str = "hardwareVersion";
    /// Whether the device has a backup battery
    pub const BATTERY_BACKED_UP: &str = "batteryBackedUp";
}

/// How a device is powered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PowerSource {
    /// Not reported
    #[default]
    Unknown,
    /// Mains powered
    Mains,
    /// Battery powered
    Battery,
}

/// One endpoint of a discovered device
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointDetails {
    /// Endpoint id
    pub endpoint_id: u8,
    /// Application profile id
    pub profile_id: u16,
    /// Device type id
    pub device_type_id: u16,
    /// Device version
    pub device_version: u8,
    /// Server cluster ids
    pub server_cluster_ids: Vec<u16>,
    /// Client cluster ids
    pub client_cluster_ids: Vec<u16>,
    /// Attribute ids per cluster, filled in lazily as they are discovered
    #[serde(default)]
    pub attribute_ids: HashMap<u16, Vec<u16>>,
}

impl EndpointDetails {
    /// Create an endpoint with no clusters
    pub fn new(endpoint_id: u8, profile_id: u16, device_type_id: u16) -> Self {
        Self {
            endpoint_id,
            profile_id,
            device_type_id,
            ..Default::default()
        }
    }

    /// Add server clusters
    pub fn with_server_clusters<I: IntoIterator<Item = u16>>(mut self, ids: I) -> Self {
        self.server_cluster_ids.extend(ids);
        self
    }

    /// Add client clusters
    pub fn with_client_clusters<I: IntoIterator<Item = u16>>(mut self, ids: I) -> Self {
        self.client_cluster_ids.extend(ids);
        self
    }

    /// Whether the endpoint lists the cluster on either side
    pub fn has_cluster(&self, cluster_id: u16) -> bool {
        self.server_cluster_ids.contains(&cluster_id) || self.client_cluster_ids.contains(&cluster_id)
    }

    /// Record the attribute ids discovered for a cluster
    pub fn set_attribute_ids(&mut self, cluster_id: u16, ids: Vec<u16>) {
        self.attribute_ids.insert(cluster_id, ids);
    }
}

/// Everything learned about a device while it was being discovered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredDeviceDetails {
    /// Device address
    pub eui64: Eui64,
    /// Manufacturer name
    pub manufacturer: String,
    /// Model name
    pub model: String,
    /// Hardware version
    pub hardware_version: u64,
    /// Firmware version
    pub firmware_version: u64,
    /// Application version
    pub app_version: u64,
    /// Power source
    #[serde(default)]
    pub power_source: PowerSource,
    /// Endpoints in the order the device reported them
    pub endpoints: Vec<EndpointDetails>,
}

impl DiscoveredDeviceDetails {
    /// Create details with no versions and no endpoints
    pub fn new<M: Into<String>, N: Into<String>>(eui64: Eui64, manufacturer: M, model: N) -> Self {
        Self {
            eui64,
            manufacturer: manufacturer.into(),
            model: model.into(),
            hardware_version: 0,
            firmware_version: 0,
            app_version: 0,
            power_source: PowerSource::Unknown,
            endpoints: Vec::new(),
        }
    }

    /// Set the firmware version
    pub fn with_firmware_version(mut self, version: u64) -> Self {
        self.firmware_version = version;
        self
    }

    /// Set the hardware version
    pub fn with_hardware_version(mut self, version: u64) -> Self {
        self.hardware_version = version;
        self
    }

    /// Append an endpoint
    pub fn with_endpoint(mut self, endpoint: EndpointDetails) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    /// Device uuid derived from the address
    pub fn uuid(&self) -> String {
        self.eui64.to_uuid()
    }

    /// Look up an endpoint by id
    pub fn endpoint(&self, endpoint_id: u8) -> Option<&EndpointDetails> {
        self.endpoints.iter().find(|e| e.endpoint_id == endpoint_id)
    }

    /// The first endpoint the device reported
    pub fn first_endpoint(&self) -> Option<&EndpointDetails> {
        self.endpoints.first()
    }

    /// Firmware version as the string stored in the `firmwareVersion` resource
    pub fn firmware_version_string(&self) -> String {
        format!("0x{:08x}", self.firmware_version)
    }

    /// Hardware version as a decimal string
    pub fn hardware_version_string(&self) -> String {
        self.hardware_version.to_string()
    }
}

/// Kind of firmware image, which decides the directory it is stored in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FirmwareType {
    /// Standard OTA image
    #[default]
    Zigbee,
    /// Legacy image flashed by a driver-specific procedure
    Legacy,
}

impl FirmwareType {
    /// Directory name below the firmware directory
    pub fn dir_name(&self) -> &'static str {
        match self {
            FirmwareType::Zigbee => "zigbee",
            FirmwareType::Legacy => "legacy",
        }
    }
}

/// The newest firmware the catalog knows for a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirmwareInfo {
    /// Version string
    pub version: String,
    /// Image type
    #[serde(default, rename = "type")]
    pub firmware_type: FirmwareType,
    /// Files making up the image
    #[serde(default)]
    pub filenames: Vec<String>,
}

/// Catalog entry describing a device model
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    /// Manufacturer name
    pub manufacturer: String,
    /// Model name
    pub model: String,
    /// Latest firmware, if any
    #[serde(default)]
    pub latest_firmware: Option<FirmwareInfo>,
    /// Free-form metadata used to seed configuration
    #[serde(default)]
    pub metadata: Metadata,
}

/// A persisted endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointRecord {
    /// Endpoint id
    pub endpoint_id: u8,
    /// Endpoint profile
    pub profile: String,
}

/// A device as the registry remembers it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    /// Device uuid
    pub uuid: String,
    /// Device class
    pub device_class: String,
    /// Name of the driver owning the device
    pub device_driver: String,
    /// Persisted endpoints
    #[serde(default)]
    pub endpoints: Vec<EndpointRecord>,
}

/// Summary of a newly claimed device presented to the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFoundDetails {
    /// Claiming driver
    pub device_driver: String,
    /// Device class
    pub device_class: String,
    /// Device class version
    pub device_class_version: u8,
    /// Device uuid
    pub uuid: String,
    /// Manufacturer name
    pub manufacturer: String,
    /// Model name
    pub model: String,
    /// Hardware version string
    pub hardware_version: String,
    /// Firmware version string
    pub firmware_version: String,
    /// Profile of each endpoint
    pub endpoint_profiles: BTreeMap<u8, String>,
}

/// Value of the `firmwareUpdateStatus` resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FirmwareUpdateStatus {
    /// Nothing to do
    UpToDate,
    /// An upgrade is scheduled
    Pending,
    /// The image has been downloaded and the upgrade is under way
    Started,
    /// The device reported a successful upgrade
    Completed,
    /// The upgrade failed
    Failed,
}

impl FirmwareUpdateStatus {
    /// Resource value
    pub fn as_str(&self) -> &'static str {
        match self {
            FirmwareUpdateStatus::UpToDate => "upToDate",
            FirmwareUpdateStatus::Pending => "pending",
            FirmwareUpdateStatus::Started => "started",
            FirmwareUpdateStatus::Completed => "completed",
            FirmwareUpdateStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for FirmwareUpdateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FirmwareUpdateStatus {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upToDate" => Ok(FirmwareUpdateStatus::UpToDate),
            "pending" => Ok(FirmwareUpdateStatus::Pending),
            "started" => Ok(FirmwareUpdateStatus::Started),
            "completed" => Ok(FirmwareUpdateStatus::Completed),
            "failed" => Ok(FirmwareUpdateStatus::Failed),
            other => Err(DriverError::malformed(format!(
                "Unknown firmware update status '{}'",
                other
            ))),
        }
    }
}

/// Initial resource values produced while a device is being paired
///
/// Device-level values use no endpoint; a `None` value means the resource
/// exists but its value is not known yet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitialResourceValues {
    values: BTreeMap<(Option<u8>, String), Option<String>>,
}

impl InitialResourceValues {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a device-level value
    pub fn put_device<N: Into<String>>(&mut self, name: N, value: Option<String>) {
        self.values.insert((None, name.into()), value);
    }

    /// Set an endpoint value
    pub fn put_endpoint<N: Into<String>>(&mut self, endpoint_id: u8, name: N, value: Option<String>) {
        self.values.insert((Some(endpoint_id), name.into()), value);
    }

    /// Get a device-level value
    pub fn device(&self, name: &str) -> Option<Option<&str>> {
        self.values
            .get(&(None, name.to_string()))
            .map(|v| v.as_deref())
    }

    /// Get an endpoint value
    pub fn endpoint(&self, endpoint_id: u8, name: &str) -> Option<Option<&str>> {
        self.values
            .get(&(Some(endpoint_id), name.to_string()))
            .map(|v| v.as_deref())
    }

    /// Iterate over every value
    pub fn iter(&self) -> impl Iterator<Item = (Option<u8>, &str, Option<&str>)> {
        self.values
            .iter()
            .map(|((ep, name), value)| (*ep, name.as_str(), value.as_deref()))
    }

    /// Number of values
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether there are no values
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
