/*!
 * Light driver.
 *
 * Claims On/Off and dimmable lights, exposes an `isOn` resource on each
 * light endpoint and switches the light by sending On or Off and waiting for
 * the default response.
 */
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use meshflow_core::config::Config;

use crate::cluster::{zcl, OutboundCommand};
use crate::clusters::{OnOffCluster, PollControlCluster, IS_ON_RESOURCE};
use crate::device::{DiscoveredDeviceDetails, InitialResourceValues};
use crate::driver::{Collaborators, DriverHooks, DriverSettings, ResourceRequest, ZigbeeDriver};
use crate::error::{DriverError, Result};
use crate::synchronizer::SynchronizerRegistry;

/// Driver name
pub const LIGHT_DRIVER_NAME: &str = "zigbeeLight";

/// Device class and endpoint profile
pub const LIGHT_DEVICE_CLASS: &str = "light";

/// On/Off light device type
pub const ON_OFF_LIGHT_DEVICE_ID: u16 = 0x0100;

/// Dimmable light device type
pub const DIMMABLE_LIGHT_DEVICE_ID: u16 = 0x0101;

/// Parse an `isOn` value
fn parse_on_off(value: &str) -> Result<bool> {
    match value.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(DriverError::malformed(format!(
            "{} must be true or false, got '{}'",
            IS_ON_RESOURCE, other
        ))),
    }
}

/// Hooks for the light driver
#[derive(Debug, Default)]
pub struct LightHooks;

#[async_trait]
impl DriverHooks for LightHooks {
    fn endpoint_profile(&self, _details: &DiscoveredDeviceDetails, _endpoint_id: u8) -> Option<String> {
        Some(LIGHT_DEVICE_CLASS.to_string())
    }

    async fn fetch_initial_endpoint_values(
        &self,
        driver: &ZigbeeDriver,
        details: &DiscoveredDeviceDetails,
        endpoint_id: u8,
        values: &mut InitialResourceValues,
    ) -> Result<()> {
        let has_on_off = details
            .endpoint(endpoint_id)
            .map(|e| e.server_cluster_ids.contains(&zcl::ON_OFF_CLUSTER_ID))
            .unwrap_or(false);
        if !has_on_off {
            return Ok(());
        }

        let is_on = match driver
            .mesh()
            .read_attribute(
                details.eui64,
                endpoint_id,
                zcl::ON_OFF_CLUSTER_ID,
                zcl::ON_OFF_ATTRIBUTE_ID,
            )
            .await
        {
            Ok(value) => value.first().map(|v| (*v != 0).to_string()),
            Err(e) => {
                debug!("{}: could not read OnOff: {}", details.eui64, e);
                None
            }
        };

        values.put_endpoint(endpoint_id, IS_ON_RESOURCE, is_on);
        Ok(())
    }

    async fn write_resource(
        &self,
        driver: &ZigbeeDriver,
        request: &ResourceRequest<'_>,
        value: &str,
    ) -> Result<()> {
        if request.name != IS_ON_RESOURCE {
            return Err(DriverError::not_found(format!("writable resource {}", request.name)));
        }
        let endpoint_id = request
            .endpoint_id
            .ok_or_else(|| DriverError::not_found(format!("{} without an endpoint", request.name)))?;

        let on = parse_on_off(value)?;
        let command_id = if on {
            zcl::ON_OFF_ON_COMMAND_ID
        } else {
            zcl::ON_OFF_OFF_COMMAND_ID
        };

        driver
            .send_and_wait(
                request.eui64,
                endpoint_id,
                OutboundCommand::new(zcl::ON_OFF_CLUSTER_ID, command_id),
                OnOffCluster::command_response(),
            )
            .await?;
        Ok(())
    }
}

/// Build the light driver
pub fn light_driver(config: &Config, collaborators: Collaborators) -> Result<Arc<ZigbeeDriver>> {
    let settings = DriverSettings::new(LIGHT_DRIVER_NAME, LIGHT_DEVICE_CLASS)
        .with_config(config)
        .with_supported_device_ids([ON_OFF_LIGHT_DEVICE_ID, DIMMABLE_LIGHT_DEVICE_ID]);

    let synchronizers = Arc::new(SynchronizerRegistry::new());
    let on_off = OnOffCluster::new(collaborators.devices.clone(), synchronizers.clone());
    let poll_control = PollControlCluster::new(collaborators.mesh.clone());

    let driver = ZigbeeDriver::builder(settings)
        .hooks(Arc::new(LightHooks))
        .synchronizers(synchronizers)
        .cluster(Arc::new(on_off))?
        .cluster(Arc::new(poll_control))?
        .build(collaborators);

    Ok(driver)
}
