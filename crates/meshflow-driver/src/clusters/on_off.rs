/*!
 * On/Off cluster.
 *
 * Binds the cluster, keeps the `isOn` resource in step with attribute
 * reports and hands default responses to the device's synchronizer so a
 * driver can wait for the answer to an On or Off command.
 */
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::cluster::{
    zcl, AttributeReport, AttributeReportHandler, Cluster, ClusterCommand, ClusterCommandHandler,
    ClusterConfigurator, DeviceConfigurationContext, ReportingConfig, ResponseType,
};
use crate::error::Result;
use crate::protocol::DeviceService;
use crate::synchronizer::{AsyncResponse, SynchronizerRegistry};

/// Endpoint resource mirroring the `OnOff` attribute
pub const IS_ON_RESOURCE: &str = "isOn";

/// On/Off cluster
#[derive(Debug)]
pub struct OnOffCluster {
    devices: Arc<dyn DeviceService>,
    synchronizers: Arc<SynchronizerRegistry>,
    reporting: ReportingConfig,
}

impl OnOffCluster {
    /// Create the cluster with reports every 1 to 3600 seconds
    pub fn new(devices: Arc<dyn DeviceService>, synchronizers: Arc<SynchronizerRegistry>) -> Self {
        Self {
            devices,
            synchronizers,
            reporting: ReportingConfig {
                attribute_id: zcl::ON_OFF_ATTRIBUTE_ID,
                data_type: zcl::DATA_TYPE_BOOLEAN,
                min_interval_secs: 1,
                max_interval_secs: 3600,
                reportable_change: Bytes::new(),
            },
        }
    }

    /// Change the reporting interval
    pub fn with_reporting_interval(mut self, min_secs: u16, max_secs: u16) -> Self {
        self.reporting.min_interval_secs = min_secs;
        self.reporting.max_interval_secs = max_secs;
        self
    }

    /// The response an On or Off command is answered with
    pub fn command_response() -> ResponseType {
        ResponseType::default_response(zcl::ON_OFF_CLUSTER_ID)
    }
}

impl Cluster for OnOffCluster {
    fn cluster_id(&self) -> u16 {
        zcl::ON_OFF_CLUSTER_ID
    }

    fn configurator(&self) -> Option<&dyn ClusterConfigurator> {
        Some(self)
    }

    fn report_handler(&self) -> Option<&dyn AttributeReportHandler> {
        Some(self)
    }

    fn command_handler(&self) -> Option<&dyn ClusterCommandHandler> {
        Some(self)
    }
}

#[async_trait]
impl ClusterConfigurator for OnOffCluster {
    async fn configure(&self, ctx: &mut DeviceConfigurationContext<'_>) -> Result<()> {
        ctx.mesh
            .set_binding(ctx.eui64, ctx.endpoint_id, zcl::ON_OFF_CLUSTER_ID)
            .await?;
        ctx.mesh
            .set_attribute_reporting(
                ctx.eui64,
                ctx.endpoint_id,
                zcl::ON_OFF_CLUSTER_ID,
                std::slice::from_ref(&self.reporting),
            )
            .await
    }
}

#[async_trait]
impl AttributeReportHandler for OnOffCluster {
    async fn handle_attribute_report(&self, report: &AttributeReport) -> Result<()> {
        let Some(attribute) = report.attribute(zcl::ON_OFF_ATTRIBUTE_ID) else {
            return Ok(());
        };

        let is_on = attribute.value.first().map(|v| *v != 0).unwrap_or(false);
        self.devices
            .update_resource(
                &report.eui64.to_uuid(),
                Some(report.endpoint_id),
                IS_ON_RESOURCE,
                if is_on { "true" } else { "false" },
            )
            .await
    }
}

#[async_trait]
impl ClusterCommandHandler for OnOffCluster {
    async fn handle_cluster_command(&self, command: &ClusterCommand) -> Result<()> {
        if command.cluster_specific || command.command_id != zcl::DEFAULT_RESPONSE_COMMAND_ID {
            return Ok(());
        }

        // Default response payload: command id, status
        let success = command.payload.get(1) == Some(&zcl::STATUS_SUCCESS);
        let response = AsyncResponse::new(Self::command_response(), success)
            .with_payload(command.payload.clone());

        if !self.synchronizers.deliver(command.eui64, response) {
            debug!("{}: default response with nobody waiting", command.eui64);
        }
        Ok(())
    }
}
