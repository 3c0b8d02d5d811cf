/*!
 * Cluster abstraction.
 *
 * A cluster is the unit of configuration and event dispatch. Every cluster
 * has an id and a priority; everything else it can do is an optional role
 * reached through an accessor that returns `None` when the cluster does not
 * play that role.
 */
use std::fmt::{self, Debug};

use async_trait::async_trait;
use bytes::Bytes;

use meshflow_core::types::{Eui64, Metadata};

use crate::device::{DeviceDescriptor, DiscoveredDeviceDetails};
use crate::error::Result;
use crate::protocol::MeshNetwork;

/// Well-known cluster, command and attribute ids
pub mod zcl {
    /// Basic cluster
    pub const BASIC_CLUSTER_ID: u16 = 0x0000;
    /// Basic cluster reset-to-factory-defaults command
    pub const BASIC_RESET_TO_FACTORY_COMMAND_ID: u8 = 0x00;

    /// On/Off cluster
    pub const ON_OFF_CLUSTER_ID: u16 = 0x0006;
    /// On/Off `OnOff` attribute
    pub const ON_OFF_ATTRIBUTE_ID: u16 = 0x0000;
    /// On/Off `Off` command
    pub const ON_OFF_OFF_COMMAND_ID: u8 = 0x00;
    /// On/Off `On` command
    pub const ON_OFF_ON_COMMAND_ID: u8 = 0x01;

    /// Alarms cluster
    pub const ALARMS_CLUSTER_ID: u16 = 0x0009;
    /// Alarms cluster alarm command (server to client)
    pub const ALARMS_ALARM_COMMAND_ID: u8 = 0x00;

    /// OTA Upgrade cluster
    pub const OTA_UPGRADE_CLUSTER_ID: u16 = 0x0019;
    /// OTA Upgrade-End request
    pub const OTA_UPGRADE_END_REQUEST_COMMAND_ID: u8 = 0x06;

    /// Poll Control cluster
    pub const POLL_CONTROL_CLUSTER_ID: u16 = 0x0020;
    /// Poll Control check-in command (server to client)
    pub const POLL_CONTROL_CHECK_IN_COMMAND_ID: u8 = 0x00;
    /// Poll Control check-in response (client to server)
    pub const POLL_CONTROL_CHECK_IN_RESPONSE_COMMAND_ID: u8 = 0x00;
    /// Poll Control check-in interval attribute
    pub const POLL_CONTROL_CHECK_IN_INTERVAL_ATTRIBUTE_ID: u16 = 0x0000;

    /// Profile-wide default response
    pub const DEFAULT_RESPONSE_COMMAND_ID: u8 = 0x0b;

    /// Boolean data type
    pub const DATA_TYPE_BOOLEAN: u8 = 0x10;
    /// Unsigned 32-bit integer data type
    pub const DATA_TYPE_UINT32: u8 = 0x23;

    /// Success status
    pub const STATUS_SUCCESS: u8 = 0x00;
}

/// Configuration priority of a cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum ClusterPriority {
    /// Configured before every default-priority cluster
    Highest,
    /// Configured in registration order
    #[default]
    Default,
}

/// Identifies a response a caller can wait for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResponseType {
    /// Cluster the response belongs to
    pub cluster_id: u16,
    /// Command id of the response
    pub command_id: u8,
}

impl ResponseType {
    /// Create a response type
    pub const fn new(cluster_id: u16, command_id: u8) -> Self {
        Self {
            cluster_id,
            command_id,
        }
    }

    /// The profile-wide default response for a cluster
    pub const fn default_response(cluster_id: u16) -> Self {
        Self::new(cluster_id, zcl::DEFAULT_RESPONSE_COMMAND_ID)
    }
}

impl fmt::Display for ResponseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cluster 0x{:04x} command 0x{:02x}",
            self.cluster_id, self.command_id
        )
    }
}

/// Signal quality carried by every inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkQuality {
    /// Received signal strength in dBm
    pub rssi: i8,
    /// Link quality indicator
    pub lqi: u8,
}

/// One attribute value carried by a report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeValue {
    /// Attribute id
    pub attribute_id: u16,
    /// Data type
    pub data_type: u8,
    /// Raw value bytes
    pub value: Bytes,
}

/// An unsolicited attribute report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeReport {
    /// Reporting device
    pub eui64: Eui64,
    /// Source endpoint
    pub endpoint_id: u8,
    /// Cluster the attributes belong to
    pub cluster_id: u16,
    /// Reported values
    pub attributes: Vec<AttributeValue>,
    /// Signal quality of the message
    pub link: LinkQuality,
}

impl AttributeReport {
    /// Find a reported attribute
    pub fn attribute(&self, attribute_id: u16) -> Option<&AttributeValue> {
        self.attributes.iter().find(|a| a.attribute_id == attribute_id)
    }
}

/// An inbound cluster command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterCommand {
    /// Sending device
    pub eui64: Eui64,
    /// Source endpoint
    pub endpoint_id: u8,
    /// Cluster id
    pub cluster_id: u16,
    /// Command id
    pub command_id: u8,
    /// Whether the command is cluster specific rather than profile wide
    pub cluster_specific: bool,
    /// Manufacturer code for manufacturer specific commands
    pub mfg_code: Option<u16>,
    /// Whether the command was sent by the server side of the cluster
    pub from_server: bool,
    /// Command payload
    pub payload: Bytes,
    /// Signal quality of the message
    pub link: LinkQuality,
}

impl ClusterCommand {
    /// Create a cluster specific command sent by the server side
    pub fn new(eui64: Eui64, endpoint_id: u8, cluster_id: u16, command_id: u8) -> Self {
        Self {
            eui64,
            endpoint_id,
            cluster_id,
            command_id,
            cluster_specific: true,
            mfg_code: None,
            from_server: true,
            payload: Bytes::new(),
            link: LinkQuality::default(),
        }
    }

    /// Mark the command as profile wide
    pub fn profile_wide(mut self) -> Self {
        self.cluster_specific = false;
        self
    }

    /// Set the payload
    pub fn with_payload<P: Into<Bytes>>(mut self, payload: P) -> Self {
        self.payload = payload.into();
        self
    }

    /// Set the signal quality
    pub fn with_link(mut self, rssi: i8, lqi: u8) -> Self {
        self.link = LinkQuality { rssi, lqi };
        self
    }

    /// The response type this command answers as
    pub fn response_type(&self) -> ResponseType {
        ResponseType::new(self.cluster_id, self.command_id)
    }
}

/// A command to send to a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundCommand {
    /// Cluster id
    pub cluster_id: u16,
    /// Command id
    pub command_id: u8,
    /// Whether the command is cluster specific rather than profile wide
    pub cluster_specific: bool,
    /// Whether the command targets the server side of the cluster
    pub to_server: bool,
    /// Manufacturer code for manufacturer specific commands
    pub mfg_code: Option<u16>,
    /// Command payload
    pub payload: Bytes,
}

impl OutboundCommand {
    /// Create a cluster specific command to the server side with no payload
    pub fn new(cluster_id: u16, command_id: u8) -> Self {
        Self {
            cluster_id,
            command_id,
            cluster_specific: true,
            to_server: true,
            mfg_code: None,
            payload: Bytes::new(),
        }
    }

    /// Address the client side of the cluster
    pub fn to_client(mut self) -> Self {
        self.to_server = false;
        self
    }

    /// Set the payload
    pub fn with_payload<P: Into<Bytes>>(mut self, payload: P) -> Self {
        self.payload = payload.into();
        self
    }

    /// Set the manufacturer code
    pub fn with_mfg_code(mut self, mfg_code: u16) -> Self {
        self.mfg_code = Some(mfg_code);
        self
    }
}

/// An attribute write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeWrite {
    /// Cluster id
    pub cluster_id: u16,
    /// Attribute id
    pub attribute_id: u16,
    /// Data type
    pub data_type: u8,
    /// Raw value bytes
    pub value: Bytes,
}

/// Attribute reporting configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportingConfig {
    /// Attribute id
    pub attribute_id: u16,
    /// Data type
    pub data_type: u8,
    /// Minimum interval between reports in seconds
    pub min_interval_secs: u16,
    /// Maximum interval between reports in seconds
    pub max_interval_secs: u16,
    /// Change that triggers a report, empty for discrete types
    pub reportable_change: Bytes,
}

/// An alarm raised through the Alarms cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlarmEntry {
    /// Alarm code, meaning depends on the alarmed cluster
    pub alarm_code: u8,
    /// Cluster that raised the alarm
    pub cluster_id: u16,
}

impl AlarmEntry {
    /// Parse the payload of an Alarms cluster alarm command
    pub fn parse(payload: &[u8]) -> Option<Self> {
        match payload {
            [alarm_code, lo, hi, ..] => Some(Self {
                alarm_code: *alarm_code,
                cluster_id: u16::from_le_bytes([*lo, *hi]),
            }),
            _ => None,
        }
    }
}

/// State for configuring one endpoint of a device
pub struct DeviceConfigurationContext<'a> {
    /// Device being configured
    pub eui64: Eui64,
    /// Endpoint being configured
    pub endpoint_id: u8,
    /// What discovery learned about the device
    pub details: &'a DiscoveredDeviceDetails,
    /// Catalog descriptor, if one was resolved
    pub descriptor: Option<&'a DeviceDescriptor>,
    /// Network to configure the device through
    pub mesh: &'a dyn MeshNetwork,
    /// Values shared between the configure steps of this endpoint
    pub metadata: Metadata,
}

impl<'a> DeviceConfigurationContext<'a> {
    /// Create a context seeded with the descriptor's metadata
    pub fn new(
        endpoint_id: u8,
        details: &'a DiscoveredDeviceDetails,
        descriptor: Option<&'a DeviceDescriptor>,
        mesh: &'a dyn MeshNetwork,
    ) -> Self {
        let metadata = descriptor.map(|d| d.metadata.clone()).unwrap_or_default();
        Self {
            eui64: details.eui64,
            endpoint_id,
            details,
            descriptor,
            mesh,
            metadata,
        }
    }

    /// Look up a configuration value
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

impl Debug for DeviceConfigurationContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConfigurationContext")
            .field("eui64", &self.eui64)
            .field("endpoint_id", &self.endpoint_id)
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// A cluster known to a driver
pub trait Cluster: Send + Sync + Debug {
    /// Cluster id
    fn cluster_id(&self) -> u16;

    /// Configuration priority
    fn priority(&self) -> ClusterPriority {
        ClusterPriority::Default
    }

    /// Configure role
    fn configurator(&self) -> Option<&dyn ClusterConfigurator> {
        None
    }

    /// Attribute report role
    fn report_handler(&self) -> Option<&dyn AttributeReportHandler> {
        None
    }

    /// Cluster command role
    fn command_handler(&self) -> Option<&dyn ClusterCommandHandler> {
        None
    }

    /// Alarm role
    fn alarm_handler(&self) -> Option<&dyn AlarmHandler> {
        None
    }

    /// Poll check-in role
    fn poll_checkin_handler(&self) -> Option<&dyn PollCheckInHandler> {
        None
    }
}

/// Configures a cluster on one endpoint during pairing
#[async_trait]
pub trait ClusterConfigurator: Send + Sync {
    /// Configure the cluster
    async fn configure(&self, ctx: &mut DeviceConfigurationContext<'_>) -> Result<()>;
}

/// Handles attribute reports
#[async_trait]
pub trait AttributeReportHandler: Send + Sync {
    /// Handle a report
    async fn handle_attribute_report(&self, report: &AttributeReport) -> Result<()>;
}

/// Handles cluster commands
#[async_trait]
pub trait ClusterCommandHandler: Send + Sync {
    /// Handle a command
    async fn handle_cluster_command(&self, command: &ClusterCommand) -> Result<()>;
}

/// Handles alarms raised against a cluster
#[async_trait]
pub trait AlarmHandler: Send + Sync {
    /// Handle an alarm
    async fn handle_alarm(&self, eui64: Eui64, endpoint_id: u8, alarm: &AlarmEntry) -> Result<()>;
}

/// Handles Poll Control check-ins
#[async_trait]
pub trait PollCheckInHandler: Send + Sync {
    /// Handle a check-in
    async fn handle_poll_checkin(&self, eui64: Eui64, endpoint_id: u8) -> Result<()>;
}
