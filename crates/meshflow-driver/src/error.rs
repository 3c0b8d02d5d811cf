/*!
 * Error types for the MeshFlow driver crate.
 */
use std::time::Duration;

use thiserror::Error;

use meshflow_core::types::Eui64;

use crate::cluster::ResponseType;

/// Error type for driver operations
#[derive(Error, Debug)]
pub enum DriverError {
    /// A command could not be handed to the mesh network for sending
    #[error("Failed to send to {eui64}: {reason}")]
    ProtocolSendFailure {
        /// The target device
        eui64: Eui64,
        /// Why the send failed
        reason: String,
    },

    /// No correlated response arrived in time
    #[error("No response from {eui64} within {timeout:?}")]
    ResponseTimeout {
        /// The device that did not answer
        eui64: Eui64,
        /// How long the caller waited
        timeout: Duration,
    },

    /// A response arrived but it was not the one being waited for
    #[error("Unexpected response from {eui64}: expected {expected}, got {received}")]
    UnexpectedResponse {
        /// The device that answered
        eui64: Eui64,
        /// The response type the caller waited for
        expected: ResponseType,
        /// The response type that arrived
        received: ResponseType,
    },

    /// The device answered with a failure status
    #[error("Device {eui64} rejected {response}")]
    CommandRejected {
        /// The device that answered
        eui64: Eui64,
        /// The rejected exchange
        response: ResponseType,
    },

    /// A cluster's configure step failed
    #[error("Failed to configure cluster 0x{cluster_id:04x} on {eui64} endpoint {endpoint_id}: {reason}")]
    ConfigurationFailure {
        /// The device being configured
        eui64: Eui64,
        /// The endpoint being configured
        endpoint_id: u8,
        /// The cluster whose configure step failed
        cluster_id: u16,
        /// Why it failed
        reason: String,
    },

    /// The device registry declined a claimed device
    #[error("Device {0} was rejected by the device registry")]
    ClaimRejected(Eui64),

    /// A firmware file could not be fetched
    #[error("Firmware download failed: {0}")]
    DownloadFailure(String),

    /// A resource write or execute payload could not be interpreted
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// A cluster id was registered twice
    #[error("Cluster 0x{0:04x} is already registered")]
    DuplicateCluster(u16),

    /// A device, endpoint or resource is unknown
    #[error("Not found: {0}")]
    NotFound(String),

    /// The operation is not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] meshflow_core::error::Error),
}

/// Result type for driver operations
pub type Result<T> = std::result::Result<T, DriverError>;

impl DriverError {
    /// Create a new send failure
    pub fn send_failure<S: AsRef<str>>(eui64: Eui64, reason: S) -> Self {
        DriverError::ProtocolSendFailure {
            eui64,
            reason: reason.as_ref().to_string(),
        }
    }

    /// Create a new malformed input error
    pub fn malformed<S: AsRef<str>>(msg: S) -> Self {
        DriverError::MalformedInput(msg.as_ref().to_string())
    }

    /// Create a new not found error
    pub fn not_found<S: AsRef<str>>(msg: S) -> Self {
        DriverError::NotFound(msg.as_ref().to_string())
    }

    /// Create a new invalid state error
    pub fn invalid_state<S: AsRef<str>>(msg: S) -> Self {
        DriverError::InvalidState(msg.as_ref().to_string())
    }

    /// Create a new download failure
    pub fn download<S: AsRef<str>>(msg: S) -> Self {
        DriverError::DownloadFailure(msg.as_ref().to_string())
    }

    /// Whether this error is a response timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, DriverError::ResponseTimeout { .. })
    }
}
