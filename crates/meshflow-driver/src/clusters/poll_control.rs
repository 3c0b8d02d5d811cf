/*!
 * Poll Control cluster.
 *
 * Sleepy devices check in periodically; each check-in is answered so the
 * device goes back to sleep. The check-in interval can be set per model
 * through descriptor metadata.
 */
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tracing::debug;

use meshflow_core::types::Eui64;

use crate::cluster::{
    zcl, AttributeWrite, Cluster, ClusterConfigurator, ClusterPriority, DeviceConfigurationContext,
    OutboundCommand, PollCheckInHandler,
};
use crate::error::{DriverError, Result};
use crate::protocol::MeshNetwork;

/// Descriptor metadata key holding the check-in interval in seconds
pub const CHECK_IN_INTERVAL_KEY: &str = "pollControl.checkInInterval";

/// Poll Control cluster
#[derive(Debug)]
pub struct PollControlCluster {
    mesh: Arc<dyn MeshNetwork>,
    fast_poll_timeout_qs: u16,
}

impl PollControlCluster {
    /// Create the cluster; check-ins are answered without fast polling
    pub fn new(mesh: Arc<dyn MeshNetwork>) -> Self {
        Self {
            mesh,
            fast_poll_timeout_qs: 0,
        }
    }
}

impl Cluster for PollControlCluster {
    fn cluster_id(&self) -> u16 {
        zcl::POLL_CONTROL_CLUSTER_ID
    }

    fn priority(&self) -> ClusterPriority {
        ClusterPriority::Highest
    }

    fn configurator(&self) -> Option<&dyn ClusterConfigurator> {
        Some(self)
    }

    fn poll_checkin_handler(&self) -> Option<&dyn PollCheckInHandler> {
        Some(self)
    }
}

#[async_trait]
impl ClusterConfigurator for PollControlCluster {
    async fn configure(&self, ctx: &mut DeviceConfigurationContext<'_>) -> Result<()> {
        ctx.mesh
            .set_binding(ctx.eui64, ctx.endpoint_id, zcl::POLL_CONTROL_CLUSTER_ID)
            .await?;

        let Some(interval) = ctx.metadata_value(CHECK_IN_INTERVAL_KEY) else {
            return Ok(());
        };
        let secs: u32 = interval.trim().parse().map_err(|_| {
            DriverError::malformed(format!("{} '{}'", CHECK_IN_INTERVAL_KEY, interval))
        })?;

        // The attribute counts quarter seconds.
        let quarter_secs = secs.saturating_mul(4);
        let write = AttributeWrite {
            cluster_id: zcl::POLL_CONTROL_CLUSTER_ID,
            attribute_id: zcl::POLL_CONTROL_CHECK_IN_INTERVAL_ATTRIBUTE_ID,
            data_type: zcl::DATA_TYPE_UINT32,
            value: quarter_secs.to_le_bytes().to_vec().into(),
        };
        ctx.mesh.write_attribute(ctx.eui64, ctx.endpoint_id, &write).await
    }
}

#[async_trait]
impl PollCheckInHandler for PollControlCluster {
    async fn handle_poll_checkin(&self, eui64: Eui64, endpoint_id: u8) -> Result<()> {
        let mut payload = BytesMut::with_capacity(3);
        payload.put_u8(0);
        payload.put_u16_le(self.fast_poll_timeout_qs);

        let response = OutboundCommand::new(
            zcl::POLL_CONTROL_CLUSTER_ID,
            zcl::POLL_CONTROL_CHECK_IN_RESPONSE_COMMAND_ID,
        )
        .with_payload(payload.freeze());

        debug!("{}: answering check-in", eui64);
        self.mesh.send_command(eui64, endpoint_id, &response).await
    }
}
