/*!
 * Driver instance.
 *
 * A [`ZigbeeDriver`] composes the cluster registry, the discovery engine,
 * the synchronizer registry and the firmware pipeline for one concrete
 * driver, and exposes the lifecycle the device service drives: startup,
 * pairing callbacks, resource operations and shutdown. What makes a driver
 * concrete is its [`DriverHooks`] implementation and the clusters it
 * registers.
 */
use std::collections::HashSet;
use std::fmt::{self, Debug};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn, Instrument};

use meshflow_core::config::{Config, DriverConfig};
use meshflow_core::logging::{component_span, operation_span};
use meshflow_core::scheduler::DelayedTaskScheduler;
use meshflow_core::types::Eui64;

use crate::cluster::{
    zcl, AttributeReport, AttributeReportHandler, Cluster, ClusterCommand, ClusterCommandHandler,
    DeviceConfigurationContext, LinkQuality, OutboundCommand, ResponseType,
};
use crate::device::{
    resources, DeviceDescriptor, DeviceRecord, DiscoveredDeviceDetails, FirmwareUpdateStatus,
    InitialResourceValues,
};
use crate::discovery::{ClaimOutcome, DiscoveryEngine};
use crate::error::{DriverError, Result};
use crate::firmware::{FirmwarePipeline, FirmwareSettings, FirmwareUpgradeContext, UpgradeInitiator};
use crate::protocol::{
    CommFailWatchdog, DescriptorCatalog, DeviceService, DiscoveryHandler, FirmwareFetcher,
    MeshEventHandler, MeshNetwork,
};
use crate::registry::ClusterRegistry;
use crate::synchronizer::{AsyncResponse, SynchronizerRegistry};

/// Static description of a driver
#[derive(Debug, Clone)]
pub struct DriverSettings {
    /// Driver name, used as the owner of its devices
    pub driver_name: String,
    /// Device class of the devices it creates
    pub device_class: String,
    /// Version of the device class
    pub device_class_version: u8,
    /// Device type ids claimed without asking the claim hook
    pub supported_device_ids: HashSet<u16>,
    /// Comm-fail timeout, `None` when monitoring is disabled
    pub comm_fail_timeout: Option<Duration>,
    /// How long to wait for a correlated response
    pub response_timeout: Duration,
    /// Skip cluster configuration while pairing
    pub skip_configuration: bool,
    /// Devices have a backup battery
    pub battery_backed_up: bool,
    /// Ask the registry never to reject claimed devices
    pub never_reject: bool,
    /// Stop discovering after the first accepted device
    pub single_target_discovery: bool,
    /// Firmware pipeline settings
    pub firmware: FirmwareSettings,
}

impl DriverSettings {
    /// Create settings with default timeouts and no supported device ids
    pub fn new<N: Into<String>, C: Into<String>>(driver_name: N, device_class: C) -> Self {
        let driver = DriverConfig::default();
        Self {
            driver_name: driver_name.into(),
            device_class: device_class.into(),
            device_class_version: 1,
            supported_device_ids: HashSet::new(),
            comm_fail_timeout: driver.comm_fail_timeout(),
            response_timeout: driver.response_timeout(),
            skip_configuration: false,
            battery_backed_up: false,
            never_reject: false,
            single_target_discovery: false,
            firmware: FirmwareSettings::default(),
        }
    }

    /// Take timeouts and firmware settings from a configuration
    pub fn with_config(mut self, config: &Config) -> Self {
        self.comm_fail_timeout = config.driver.comm_fail_timeout();
        self.response_timeout = config.driver.response_timeout();
        self.firmware = FirmwareSettings::from(&config.firmware);
        self
    }

    /// Set the device class version
    pub fn with_device_class_version(mut self, version: u8) -> Self {
        self.device_class_version = version;
        self
    }

    /// Add supported device type ids
    pub fn with_supported_device_ids<I: IntoIterator<Item = u16>>(mut self, ids: I) -> Self {
        self.supported_device_ids.extend(ids);
        self
    }

    /// Set the comm-fail timeout
    pub fn with_comm_fail_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.comm_fail_timeout = timeout;
        self
    }

    /// Set the response timeout
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Set the skip-configuration flag
    pub fn with_skip_configuration(mut self, skip: bool) -> Self {
        self.skip_configuration = skip;
        self
    }

    /// Set the battery-backed-up flag
    pub fn with_battery_backed_up(mut self, backed_up: bool) -> Self {
        self.battery_backed_up = backed_up;
        self
    }

    /// Set the never-reject flag
    pub fn with_never_reject(mut self, never_reject: bool) -> Self {
        self.never_reject = never_reject;
        self
    }

    /// Set the single-target-discovery flag
    pub fn with_single_target_discovery(mut self, single: bool) -> Self {
        self.single_target_discovery = single;
        self
    }

    /// Set the firmware settings
    pub fn with_firmware(mut self, firmware: FirmwareSettings) -> Self {
        self.firmware = firmware;
        self
    }
}

/// Identifies the resource a read, write or execute targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceRequest<'a> {
    /// Device uuid
    pub uuid: &'a str,
    /// Device address
    pub eui64: Eui64,
    /// Endpoint, `None` for device-level resources
    pub endpoint_id: Option<u8>,
    /// Resource name
    pub name: &'a str,
}

/// What a concrete driver adds to the common driver
///
/// Every method has a default, so a driver only implements what it needs.
/// Role accessors return `None` when the driver does not play the role.
#[async_trait]
pub trait DriverHooks: Send + Sync + Debug {
    /// Claim a device the supported id table does not cover
    async fn claim_device(&self, _details: &DiscoveredDeviceDetails) -> bool {
        false
    }

    /// Profile of an endpoint; the device class is used when `None`
    fn endpoint_profile(&self, _details: &DiscoveredDeviceDetails, _endpoint_id: u8) -> Option<String> {
        None
    }

    /// Veto or adjust the configuration of one cluster; `false` skips it
    async fn pre_configure_cluster(
        &self,
        _cluster_id: u16,
        _ctx: &mut DeviceConfigurationContext<'_>,
    ) -> bool {
        true
    }

    /// Add endpoint resources while a device is being paired
    async fn fetch_initial_endpoint_values(
        &self,
        _driver: &ZigbeeDriver,
        _details: &DiscoveredDeviceDetails,
        _endpoint_id: u8,
        _values: &mut InitialResourceValues,
    ) -> Result<()> {
        Ok(())
    }

    /// Persisted devices were loaded at startup
    async fn devices_loaded(&self, _driver: &ZigbeeDriver, _devices: &[DeviceRecord]) {}

    /// A device was persisted
    async fn device_persisted(&self, _driver: &ZigbeeDriver, _uuid: &str) {}

    /// A device was removed
    async fn device_removed(&self, _driver: &ZigbeeDriver, _uuid: &str) {}

    /// A device rejoined the mesh
    async fn device_rejoined(&self, _driver: &ZigbeeDriver, _eui64: Eui64, _secure: bool) {}

    /// A device left the mesh
    async fn device_left(&self, _driver: &ZigbeeDriver, _eui64: Eui64) {}

    /// Read a resource; the stored value is returned by default
    async fn read_resource(
        &self,
        driver: &ZigbeeDriver,
        request: &ResourceRequest<'_>,
    ) -> Result<Option<String>> {
        Ok(driver
            .devices()
            .get_resource(request.uuid, request.endpoint_id, request.name)
            .await)
    }

    /// Apply a resource write to the device
    async fn write_resource(
        &self,
        _driver: &ZigbeeDriver,
        request: &ResourceRequest<'_>,
        _value: &str,
    ) -> Result<()> {
        Err(DriverError::not_found(format!("writable resource {}", request.name)))
    }

    /// Execute a resource
    async fn execute_resource(
        &self,
        _driver: &ZigbeeDriver,
        request: &ResourceRequest<'_>,
        _argument: Option<&str>,
    ) -> Result<Option<String>> {
        Err(DriverError::not_found(format!("executable resource {}", request.name)))
    }

    /// Override the firmware version comparison
    fn firmware_upgrade_required(&self, _current: &str, _descriptor: &DeviceDescriptor) -> Option<bool> {
        None
    }

    /// Receives every attribute report after its cluster
    fn report_fallback(&self) -> Option<&dyn AttributeReportHandler> {
        None
    }

    /// Receives every cluster command after its cluster
    fn command_fallback(&self) -> Option<&dyn ClusterCommandHandler> {
        None
    }

    /// Starts upgrades instead of the OTA image notify
    fn upgrade_initiator(&self) -> Option<&dyn UpgradeInitiator> {
        None
    }
}

/// Hooks that add nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHooks;

impl DriverHooks for DefaultHooks {}

/// The services a driver talks to
#[derive(Debug, Clone)]
pub struct Collaborators {
    /// Mesh radio stack
    pub mesh: Arc<dyn MeshNetwork>,
    /// Device registry
    pub devices: Arc<dyn DeviceService>,
    /// Descriptor catalog
    pub catalog: Arc<dyn DescriptorCatalog>,
    /// Comm-fail watchdog
    pub watchdog: Arc<dyn CommFailWatchdog>,
    /// Delayed task scheduler
    pub scheduler: Arc<dyn DelayedTaskScheduler>,
    /// Firmware downloader
    pub fetcher: Arc<dyn FirmwareFetcher>,
}

/// Lifecycle state of a driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    /// Built but not started
    Created,
    /// Started
    Running,
    /// Shutdown in progress
    ShuttingDown,
    /// Shut down
    Destroyed,
}

/// Builds a [`ZigbeeDriver`]
#[derive(Debug)]
pub struct ZigbeeDriverBuilder {
    settings: DriverSettings,
    hooks: Arc<dyn DriverHooks>,
    clusters: ClusterRegistry,
    synchronizers: Arc<SynchronizerRegistry>,
}

impl ZigbeeDriverBuilder {
    /// Start building a driver with default hooks and no clusters
    pub fn new(settings: DriverSettings) -> Self {
        Self {
            settings,
            hooks: Arc::new(DefaultHooks),
            clusters: ClusterRegistry::new(),
            synchronizers: Arc::new(SynchronizerRegistry::new()),
        }
    }

    /// Set the driver hooks
    pub fn hooks(mut self, hooks: Arc<dyn DriverHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Share a synchronizer registry with the clusters that deliver responses
    pub fn synchronizers(mut self, synchronizers: Arc<SynchronizerRegistry>) -> Self {
        self.synchronizers = synchronizers;
        self
    }

    /// Register a cluster
    pub fn cluster(mut self, cluster: Arc<dyn Cluster>) -> Result<Self> {
        self.clusters.register(cluster)?;
        Ok(self)
    }

    /// Build the driver
    pub fn build(self, collaborators: Collaborators) -> Arc<ZigbeeDriver> {
        let settings = Arc::new(self.settings);

        let discovery = DiscoveryEngine::new(
            settings.clone(),
            self.hooks.clone(),
            collaborators.devices.clone(),
            collaborators.mesh.clone(),
        );

        let firmware = FirmwarePipeline::new(
            settings.firmware.clone(),
            collaborators.scheduler.clone(),
            collaborators.fetcher.clone(),
            collaborators.devices.clone(),
            collaborators.mesh.clone(),
            self.hooks.clone(),
        );

        Arc::new_cyclic(|weak_self| ZigbeeDriver {
            settings,
            hooks: self.hooks,
            clusters: self.clusters,
            collaborators,
            discovery,
            synchronizers: self.synchronizers,
            firmware,
            state: Mutex::new(DriverState::Created),
            listeners: Mutex::new(HashSet::new()),
            weak_self: weak_self.clone(),
        })
    }
}

/// The common driver shared by every concrete driver
pub struct ZigbeeDriver {
    settings: Arc<DriverSettings>,
    hooks: Arc<dyn DriverHooks>,
    clusters: ClusterRegistry,
    collaborators: Collaborators,
    discovery: DiscoveryEngine,
    synchronizers: Arc<SynchronizerRegistry>,
    firmware: Arc<FirmwarePipeline>,
    state: Mutex<DriverState>,
    listeners: Mutex<HashSet<Eui64>>,
    weak_self: Weak<ZigbeeDriver>,
}

impl Debug for ZigbeeDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZigbeeDriver")
            .field("driver_name", &self.settings.driver_name)
            .field("state", &self.state())
            .field("clusters", &self.clusters.len())
            .field("firmware", &self.firmware)
            .finish()
    }
}

impl ZigbeeDriver {
    /// Start building a driver
    pub fn builder(settings: DriverSettings) -> ZigbeeDriverBuilder {
        ZigbeeDriverBuilder::new(settings)
    }

    /// Driver settings
    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    /// Driver name
    pub fn name(&self) -> &str {
        &self.settings.driver_name
    }

    /// Registered clusters
    pub fn clusters(&self) -> &ClusterRegistry {
        &self.clusters
    }

    /// Discovery engine
    pub fn discovery(&self) -> &DiscoveryEngine {
        &self.discovery
    }

    /// Synchronizer registry
    pub fn synchronizers(&self) -> &Arc<SynchronizerRegistry> {
        &self.synchronizers
    }

    /// Firmware pipeline
    pub fn firmware(&self) -> &Arc<FirmwarePipeline> {
        &self.firmware
    }

    /// Mesh radio stack
    pub fn mesh(&self) -> &Arc<dyn MeshNetwork> {
        &self.collaborators.mesh
    }

    /// Device registry
    pub fn devices(&self) -> &Arc<dyn DeviceService> {
        &self.collaborators.devices
    }

    /// Current lifecycle state
    pub fn state(&self) -> DriverState {
        *self.state_guard()
    }

    fn state_guard(&self) -> MutexGuard<'_, DriverState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn transition(&self, from: DriverState, to: DriverState) -> Result<()> {
        let mut state = self.state_guard();
        if *state != from {
            return Err(DriverError::invalid_state(format!(
                "{} is {:?}, expected {:?}",
                self.settings.driver_name, *state, from
            )));
        }
        *state = to;
        Ok(())
    }

    fn listeners(&self) -> MutexGuard<'_, HashSet<Eui64>> {
        match self.listeners.lock() {
            Ok(listeners) => listeners,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn shared(&self) -> Result<Arc<ZigbeeDriver>> {
        self.weak_self
            .upgrade()
            .ok_or_else(|| DriverError::invalid_state("driver is being dropped"))
    }

    fn register_listener(&self, eui64: Eui64) -> Result<()> {
        let handler: Arc<dyn MeshEventHandler> = self.shared()?;
        self.collaborators.mesh.register_listener(eui64, handler);
        self.listeners().insert(eui64);
        Ok(())
    }

    /// Load persisted devices and start listening for new ones
    pub async fn startup(&self) -> Result<()> {
        self.transition(DriverState::Created, DriverState::Running)?;
        let span = component_span("driver", Some(self.settings.driver_name.as_str()));

        async {
            let records = self
                .collaborators
                .devices
                .devices_by_driver(&self.settings.driver_name)
                .await;

            for record in &records {
                let eui64 = match Eui64::from_uuid(&record.uuid) {
                    Ok(eui64) => eui64,
                    Err(e) => {
                        warn!("Skipping device {}: {}", record.uuid, e);
                        continue;
                    }
                };

                self.register_listener(eui64)?;

                if let Some(timeout) = self.settings.comm_fail_timeout {
                    let failed = self
                        .collaborators
                        .devices
                        .get_resource(&record.uuid, None, resources::COMMUNICATION_FAILURE)
                        .await
                        .map(|v| v == "true")
                        .unwrap_or(false);
                    self.collaborators
                        .watchdog
                        .monitor_device(&record.uuid, timeout, failed);
                }
            }

            self.hooks.devices_loaded(self, &records).await;

            let handler: Arc<dyn DiscoveryHandler> = self.shared()?;
            self.collaborators
                .mesh
                .register_discovery_handler(&self.settings.driver_name, handler);

            info!("Started with {} device(s)", records.len());
            Ok::<_, DriverError>(())
        }
        .instrument(span)
        .await
    }

    /// Stop listening, cancel pending upgrades and wait for blocking ones
    pub async fn shutdown(&self) -> Result<()> {
        self.transition(DriverState::Running, DriverState::ShuttingDown)?;
        let span = component_span("driver", Some(self.settings.driver_name.as_str()));

        async {
            self.discovery.stop();
            self.collaborators
                .mesh
                .unregister_discovery_handler(&self.settings.driver_name);

            let listeners: Vec<Eui64> = self.listeners().drain().collect();
            for eui64 in listeners {
                self.collaborators.mesh.unregister_listener(eui64);
                if self.settings.comm_fail_timeout.is_some() {
                    self.collaborators
                        .watchdog
                        .stop_monitoring_device(&eui64.to_uuid());
                }
            }

            self.firmware.shutdown().await;

            self.discovery.cache().clear();
            self.synchronizers.clear();
            info!("Shut down");
        }
        .instrument(span)
        .await;

        self.transition(DriverState::ShuttingDown, DriverState::Destroyed)
    }

    /// Start accepting new devices
    pub fn discover_start(&self) {
        self.discovery.start();
    }

    /// Stop accepting new devices
    pub fn discover_stop(&self) {
        self.discovery.stop();
    }

    fn cached_details(&self, uuid: &str) -> Result<(Eui64, DiscoveredDeviceDetails)> {
        let eui64 = Eui64::from_uuid(uuid)?;
        let details = self
            .discovery
            .cache()
            .get(eui64)
            .ok_or_else(|| DriverError::not_found(format!("discovered device {}", uuid)))?;
        Ok((eui64, details))
    }

    fn resolve_descriptor(&self, details: &DiscoveredDeviceDetails) -> Option<DeviceDescriptor> {
        self.collaborators.catalog.resolve(
            &details.manufacturer,
            &details.model,
            &details.hardware_version_string(),
            &details.firmware_version_string(),
        )
    }

    /// Configure every endpoint of a claimed device
    ///
    /// A failure evicts the device from the discovered details cache.
    pub async fn configure_device(&self, uuid: &str) -> Result<()> {
        let (eui64, details) = self.cached_details(uuid)?;

        if self.settings.skip_configuration {
            debug!("{}: configuration skipped", uuid);
            return Ok(());
        }

        let descriptor = self.resolve_descriptor(&details);

        let result = async {
            for endpoint in &details.endpoints {
                let mut ctx = DeviceConfigurationContext::new(
                    endpoint.endpoint_id,
                    &details,
                    descriptor.as_ref(),
                    self.collaborators.mesh.as_ref(),
                );
                self.clusters
                    .configure_endpoint(&mut ctx, self.hooks.as_ref())
                    .await?;
            }
            Ok::<_, DriverError>(())
        }
        .instrument(operation_span("configure", uuid))
        .await;

        if let Err(e) = &result {
            warn!("{}: configuration failed: {}", uuid, e);
            self.discovery.cache().remove(eui64);
        }
        result
    }

    /// Resource values for a device that is being paired
    pub async fn fetch_initial_resource_values(&self, uuid: &str) -> Result<InitialResourceValues> {
        let (_, details) = self.cached_details(uuid)?;
        let mut values = InitialResourceValues::new();

        values.put_device(resources::MANUFACTURER, Some(details.manufacturer.clone()));
        values.put_device(resources::MODEL, Some(details.model.clone()));
        values.put_device(resources::HARDWARE_VERSION, Some(details.hardware_version_string()));
        values.put_device(resources::FIRMWARE_VERSION, Some(details.firmware_version_string()));
        values.put_device(resources::COMMUNICATION_FAILURE, Some("false".to_string()));
        values.put_device(
            resources::BATTERY_BACKED_UP,
            Some(self.settings.battery_backed_up.to_string()),
        );
        values.put_device(
            resources::FIRMWARE_UPDATE_STATUS,
            Some(FirmwareUpdateStatus::UpToDate.to_string()),
        );
        values.put_device(resources::NE_RSSI, None);
        values.put_device(resources::NE_LQI, None);

        for endpoint in &details.endpoints {
            self.hooks
                .fetch_initial_endpoint_values(self, &details, endpoint.endpoint_id, &mut values)
                .await?;
        }

        Ok(values)
    }

    /// A paired device has been persisted
    ///
    /// Inbound messages and comm-fail monitoring start only now, then the
    /// firmware check runs.
    pub async fn device_persisted(&self, uuid: &str) -> Result<()> {
        let eui64 = Eui64::from_uuid(uuid)?;

        self.register_listener(eui64)?;
        if let Some(timeout) = self.settings.comm_fail_timeout {
            self.collaborators.watchdog.monitor_device(uuid, timeout, false);
        }

        self.hooks.device_persisted(self, uuid).await;

        let Some(details) = self.discovery.cache().get(eui64) else {
            return Ok(());
        };
        if let Some(descriptor) = self.resolve_descriptor(&details) {
            self.process_device_descriptor(uuid, ota_endpoint(&details), descriptor)
                .await?;
        }
        Ok(())
    }

    /// Check a device's firmware against its descriptor
    ///
    /// Schedules an upgrade when the descriptor names newer firmware,
    /// otherwise marks the device up to date.
    pub async fn process_device_descriptor(
        &self,
        uuid: &str,
        endpoint_id: u8,
        descriptor: DeviceDescriptor,
    ) -> Result<()> {
        let eui64 = Eui64::from_uuid(uuid)?;
        let Some(current) = self
            .collaborators
            .devices
            .get_resource(uuid, None, resources::FIRMWARE_VERSION)
            .await
        else {
            debug!("{}: no firmware version yet", uuid);
            return Ok(());
        };

        if self.firmware.upgrade_required(&current, &descriptor) {
            let ctx = FirmwareUpgradeContext::new(eui64, endpoint_id, descriptor);
            self.firmware.request_upgrade(ctx).await;
        } else if !self.firmware.is_pending(eui64) {
            self.collaborators
                .devices
                .update_resource(
                    uuid,
                    None,
                    resources::FIRMWARE_UPDATE_STATUS,
                    FirmwareUpdateStatus::UpToDate.as_str(),
                )
                .await?;
        }
        Ok(())
    }

    /// A device was removed from the registry
    pub async fn device_removed(&self, uuid: &str) -> Result<()> {
        let eui64 = Eui64::from_uuid(uuid)?;

        self.collaborators.mesh.unregister_listener(eui64);
        self.listeners().remove(&eui64);
        if self.settings.comm_fail_timeout.is_some() {
            self.collaborators.watchdog.stop_monitoring_device(uuid);
        }
        if let Some(ctx) = self.firmware.cancel_for_device(uuid) {
            debug!("{}: cancelled pending upgrade after {} attempt(s)", uuid, ctx.attempts);
        }
        self.discovery.cache().remove(eui64);
        self.synchronizers.remove(eui64);

        self.hooks.device_removed(self, uuid).await;

        if let Err(e) = self.collaborators.mesh.request_leave(eui64).await {
            warn!("{}: leave request failed: {}", uuid, e);
        }
        info!("{}: removed", uuid);
        Ok(())
    }

    /// Mark or clear a device whose upgrade must finish before shutdown
    pub fn set_blocking_upgrade(&self, eui64: Eui64, blocking: bool) {
        self.firmware.blocking().set(eui64, blocking);
    }

    fn resource_request<'a>(
        &self,
        uuid: &'a str,
        endpoint_id: Option<u8>,
        name: &'a str,
    ) -> Result<ResourceRequest<'a>> {
        Ok(ResourceRequest {
            uuid,
            eui64: Eui64::from_uuid(uuid)?,
            endpoint_id,
            name,
        })
    }

    /// Read a resource
    pub async fn read_resource(
        &self,
        uuid: &str,
        endpoint_id: Option<u8>,
        name: &str,
    ) -> Result<Option<String>> {
        let request = self.resource_request(uuid, endpoint_id, name)?;
        self.hooks.read_resource(self, &request).await
    }

    /// Write a resource
    ///
    /// The stored value changes only after the driver applied the write.
    pub async fn write_resource(
        &self,
        uuid: &str,
        endpoint_id: Option<u8>,
        name: &str,
        value: &str,
    ) -> Result<()> {
        let request = self.resource_request(uuid, endpoint_id, name)?;
        let written = self
            .hooks
            .write_resource(self, &request, value)
            .instrument(operation_span("write", uuid))
            .await;
        if let Err(e) = written {
            if e.is_timeout() {
                warn!("{}: write of {} was not acknowledged", uuid, name);
            }
            return Err(e);
        }
        self.collaborators
            .devices
            .update_resource(uuid, endpoint_id, name, value)
            .await
    }

    /// Execute a resource
    pub async fn execute_resource(
        &self,
        uuid: &str,
        endpoint_id: Option<u8>,
        name: &str,
        argument: Option<&str>,
    ) -> Result<Option<String>> {
        let request = self.resource_request(uuid, endpoint_id, name)?;
        self.hooks
            .execute_resource(self, &request, argument)
            .instrument(operation_span("execute", uuid))
            .await
    }

    /// Send a command and wait for the expected response
    pub async fn send_and_wait(
        &self,
        eui64: Eui64,
        endpoint_id: u8,
        command: OutboundCommand,
        expected: ResponseType,
    ) -> Result<AsyncResponse> {
        let synchronizer = self.synchronizers.get_or_create(eui64);
        let mesh = self.collaborators.mesh.clone();

        synchronizer
            .exchange(expected, self.settings.response_timeout, async move {
                mesh.send_command(eui64, endpoint_id, &command).await
            })
            .await
    }

    /// Deliver a response to whoever is waiting on the device
    pub fn on_async_response(&self, eui64: Eui64, response: AsyncResponse) -> bool {
        self.synchronizers.deliver(eui64, response)
    }

    async fn update_link_quality(&self, eui64: Eui64, link: LinkQuality) {
        let uuid = eui64.to_uuid();
        let updates = [
            (resources::NE_RSSI, link.rssi.to_string()),
            (resources::NE_LQI, link.lqi.to_string()),
        ];

        for (name, value) in updates {
            if let Err(e) = self
                .collaborators
                .devices
                .update_resource(&uuid, None, name, &value)
                .await
            {
                debug!("{}: failed to update {}: {}", uuid, name, e);
            }
        }
    }

    async fn handle_upgrade_end(&self, command: &ClusterCommand) {
        let uuid = command.eui64.to_uuid();
        let status = match command.payload.first() {
            Some(&zcl::STATUS_SUCCESS) => FirmwareUpdateStatus::Completed,
            _ => FirmwareUpdateStatus::Failed,
        };

        info!("{}: firmware upgrade {}", uuid, status);
        if let Err(e) = self
            .collaborators
            .devices
            .update_resource(&uuid, None, resources::FIRMWARE_UPDATE_STATUS, status.as_str())
            .await
        {
            warn!("{}: failed to set firmware status: {}", uuid, e);
        }
        self.set_blocking_upgrade(command.eui64, false);
    }
}

/// Endpoint hosting the OTA client, falling back to the first endpoint
fn ota_endpoint(details: &DiscoveredDeviceDetails) -> u8 {
    details
        .endpoints
        .iter()
        .find(|e| e.client_cluster_ids.contains(&zcl::OTA_UPGRADE_CLUSTER_ID))
        .or_else(|| details.first_endpoint())
        .map(|e| e.endpoint_id)
        .unwrap_or(1)
}

#[async_trait]
impl MeshEventHandler for ZigbeeDriver {
    async fn attribute_report_received(&self, report: AttributeReport) {
        self.update_link_quality(report.eui64, report.link).await;
        self.clusters
            .dispatch_attribute_report(&report, self.hooks.as_ref())
            .await;
    }

    async fn cluster_command_received(&self, command: ClusterCommand) {
        self.update_link_quality(command.eui64, command.link).await;

        if command.cluster_specific
            && command.cluster_id == zcl::OTA_UPGRADE_CLUSTER_ID
            && command.command_id == zcl::OTA_UPGRADE_END_REQUEST_COMMAND_ID
        {
            self.handle_upgrade_end(&command).await;
        }

        self.clusters
            .dispatch_cluster_command(&command, self.hooks.as_ref())
            .await;
    }

    async fn device_rejoined(&self, eui64: Eui64, secure: bool) {
        debug!("{}: rejoined (secure: {})", eui64, secure);
        self.hooks.device_rejoined(self, eui64, secure).await;
    }

    async fn device_left(&self, eui64: Eui64) {
        info!("{}: left the mesh", eui64);
        self.hooks.device_left(self, eui64).await;
    }
}

#[async_trait]
impl DiscoveryHandler for ZigbeeDriver {
    async fn device_discovered(&self, details: &DiscoveredDeviceDetails, migrating: bool) -> bool {
        let outcome = self.discovery.on_device_discovered(details, migrating).await;
        if outcome == ClaimOutcome::Rejected {
            debug!("{}: claimed but rejected", details.eui64);
        }
        outcome.claimed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio_test::{assert_err, assert_ok};

    use crate::clusters::OnOffCluster;
    use crate::device::{EndpointDetails, EndpointRecord, FirmwareInfo, FirmwareType};
    use crate::mock::{
        ManualScheduler, MockCatalog, MockDeviceService, MockFetcher, MockMesh, MockWatchdog,
        SentMessage,
    };

    const UUID: &str = "0000000000000abc";

    #[derive(Debug, Default)]
    struct RecordingHooks {
        loaded: AtomicUsize,
        persisted: Mutex<Vec<String>>,
        removed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DriverHooks for RecordingHooks {
        async fn devices_loaded(&self, _driver: &ZigbeeDriver, devices: &[DeviceRecord]) {
            self.loaded.store(devices.len(), Ordering::SeqCst);
        }

        async fn device_persisted(&self, _driver: &ZigbeeDriver, uuid: &str) {
            self.persisted.lock().unwrap().push(uuid.to_string());
        }

        async fn device_removed(&self, _driver: &ZigbeeDriver, uuid: &str) {
            self.removed.lock().unwrap().push(uuid.to_string());
        }
    }

    struct Fixture {
        driver: Arc<ZigbeeDriver>,
        hooks: Arc<RecordingHooks>,
        mesh: Arc<MockMesh>,
        devices: Arc<MockDeviceService>,
        catalog: Arc<MockCatalog>,
        watchdog: Arc<MockWatchdog>,
        scheduler: Arc<ManualScheduler>,
    }

    fn settings() -> DriverSettings {
        DriverSettings::new("testLight", "light")
            .with_supported_device_ids([0x0100])
            .with_comm_fail_timeout(Some(Duration::from_secs(3600)))
    }

    fn fixture(settings: DriverSettings, devices: MockDeviceService) -> Fixture {
        let hooks = Arc::new(RecordingHooks::default());
        let mesh = Arc::new(MockMesh::default());
        let devices = Arc::new(devices);
        let catalog = Arc::new(MockCatalog::default());
        let watchdog = Arc::new(MockWatchdog::default());
        let scheduler = Arc::new(ManualScheduler::default());
        let synchronizers = Arc::new(SynchronizerRegistry::new());

        let driver = ZigbeeDriver::builder(settings)
            .hooks(hooks.clone())
            .synchronizers(synchronizers.clone())
            .cluster(Arc::new(OnOffCluster::new(devices.clone(), synchronizers)))
            .unwrap()
            .build(Collaborators {
                mesh: mesh.clone(),
                devices: devices.clone(),
                catalog: catalog.clone(),
                watchdog: watchdog.clone(),
                scheduler: scheduler.clone(),
                fetcher: Arc::new(MockFetcher::default()),
            });

        Fixture {
            driver,
            hooks,
            mesh,
            devices,
            catalog,
            watchdog,
            scheduler,
        }
    }

    fn lamp() -> DiscoveredDeviceDetails {
        DiscoveredDeviceDetails::new(Eui64::new(0xabc), "Acme", "Lamp")
            .with_firmware_version(1)
            .with_endpoint(
                EndpointDetails::new(1, 0x0104, 0x0100)
                    .with_server_clusters([zcl::ON_OFF_CLUSTER_ID])
                    .with_client_clusters([zcl::OTA_UPGRADE_CLUSTER_ID]),
            )
    }

    fn record(uuid: &str, driver: &str) -> DeviceRecord {
        DeviceRecord {
            uuid: uuid.to_string(),
            device_class: "light".to_string(),
            device_driver: driver.to_string(),
            endpoints: vec![EndpointRecord {
                endpoint_id: 1,
                profile: "light".to_string(),
            }],
        }
    }

    fn newer_firmware() -> DeviceDescriptor {
        DeviceDescriptor {
            manufacturer: "Acme".to_string(),
            model: "Lamp".to_string(),
            latest_firmware: Some(FirmwareInfo {
                version: "0x00000002".to_string(),
                firmware_type: FirmwareType::Zigbee,
                filenames: vec!["lamp-2.ota".to_string()],
            }),
            metadata: Default::default(),
        }
    }

    async fn claim(f: &Fixture) {
        f.driver.discover_start();
        assert!(f.driver.device_discovered(&lamp(), false).await);
    }

    #[test]
    fn test_duplicate_cluster_rejected_by_builder() {
        let devices: Arc<dyn DeviceService> = Arc::new(MockDeviceService::default());
        let synchronizers = Arc::new(SynchronizerRegistry::new());

        let result = ZigbeeDriver::builder(settings())
            .cluster(Arc::new(OnOffCluster::new(devices.clone(), synchronizers.clone())))
            .unwrap()
            .cluster(Arc::new(OnOffCluster::new(devices, synchronizers)));

        assert!(matches!(result, Err(DriverError::DuplicateCluster(0x0006))));
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = Config::default();
        config.driver.comm_fail_timeout_secs = 120;
        config.driver.response_timeout_ms = 250;

        let settings = DriverSettings::new("d", "c").with_config(&config);
        assert_eq!(settings.comm_fail_timeout, Some(Duration::from_secs(120)));
        assert_eq!(settings.response_timeout, Duration::from_millis(250));
        assert_eq!(settings.firmware.upgrade_delay, Duration::from_secs(7200));
    }

    #[test_log::test(tokio::test)]
    async fn test_startup_rearms_watchdog_from_comm_fail_resource() {
        let devices = MockDeviceService::default();
        devices.add_record(record("0000000000000001", "testLight"));
        devices.add_record(record("0000000000000002", "testLight"));
        devices.add_record(record("0000000000000003", "otherDriver"));
        devices.set_resource("0000000000000002", None, resources::COMMUNICATION_FAILURE, "true");

        let f = fixture(settings(), devices);
        assert_ok!(f.driver.startup().await);

        assert_eq!(f.driver.state(), DriverState::Running);
        assert_eq!(f.hooks.loaded.load(Ordering::SeqCst), 2);
        assert_eq!(f.mesh.listener_count(), 2);
        assert!(f.mesh.discovery_handler("testLight").is_some());

        let monitored = f.watchdog.monitored();
        assert_eq!(monitored.len(), 2);
        assert_eq!(monitored["0000000000000001"], (Duration::from_secs(3600), false));
        assert_eq!(monitored["0000000000000002"], (Duration::from_secs(3600), true));

        let second = assert_err!(f.driver.startup().await);
        assert!(matches!(second, DriverError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_startup_without_comm_fail_monitoring() {
        let devices = MockDeviceService::default();
        devices.add_record(record("0000000000000001", "testLight"));

        let f = fixture(settings().with_comm_fail_timeout(None), devices);
        f.driver.startup().await.unwrap();

        assert_eq!(f.mesh.listener_count(), 1);
        assert!(f.watchdog.monitored().is_empty());
    }

    #[tokio::test]
    async fn test_pairing_flow() {
        let f = fixture(settings(), MockDeviceService::default());
        f.catalog.insert(newer_firmware());
        claim(&f).await;

        f.driver.configure_device(UUID).await.unwrap();
        assert!(f.mesh.sent().contains(&SentMessage::Binding {
            eui64: Eui64::new(0xabc),
            endpoint_id: 1,
            cluster_id: zcl::ON_OFF_CLUSTER_ID,
        }));

        let values = f.driver.fetch_initial_resource_values(UUID).await.unwrap();
        assert_eq!(values.device(resources::MANUFACTURER), Some(Some("Acme")));
        assert_eq!(values.device(resources::FIRMWARE_VERSION), Some(Some("0x00000001")));
        assert_eq!(values.device(resources::COMMUNICATION_FAILURE), Some(Some("false")));
        assert_eq!(values.device(resources::BATTERY_BACKED_UP), Some(Some("false")));
        assert_eq!(values.device(resources::NE_RSSI), Some(None));

        // Persist the values the way the device service would.
        for (endpoint_id, name, value) in values.iter() {
            if let Some(value) = value {
                f.devices.set_resource(UUID, endpoint_id, name, value);
            }
        }

        assert_eq!(f.mesh.listener_count(), 0);
        f.driver.device_persisted(UUID).await.unwrap();

        assert!(f.mesh.listener(Eui64::new(0xabc)).is_some());
        assert_eq!(f.watchdog.monitored()[UUID], (Duration::from_secs(3600), false));
        assert_eq!(*f.hooks.persisted.lock().unwrap(), vec![UUID.to_string()]);
        assert!(f.driver.firmware().is_pending(Eui64::new(0xabc)));
        assert_eq!(
            f.devices.resource(UUID, None, resources::FIRMWARE_UPDATE_STATUS),
            Some("pending".to_string())
        );
        assert_eq!(f.scheduler.pending(), 1);
    }

    #[tokio::test]
    async fn test_up_to_date_firmware() {
        let f = fixture(settings(), MockDeviceService::default());
        f.devices.set_resource(UUID, None, resources::FIRMWARE_VERSION, "0x00000002");

        f.driver
            .process_device_descriptor(UUID, 1, newer_firmware())
            .await
            .unwrap();

        assert_eq!(f.driver.firmware().pending_count(), 0);
        assert_eq!(
            f.devices.resource(UUID, None, resources::FIRMWARE_UPDATE_STATUS),
            Some("upToDate".to_string())
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_configuration_failure_evicts_device() {
        let f = fixture(settings(), MockDeviceService::default());
        claim(&f).await;
        f.mesh.fail_sends(true);

        let result = f.driver.configure_device(UUID).await;

        assert!(matches!(result, Err(DriverError::ConfigurationFailure { .. })));
        assert!(!f.driver.discovery().cache().contains(Eui64::new(0xabc)));
        assert!(matches!(
            f.driver.fetch_initial_resource_values(UUID).await,
            Err(DriverError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_skip_configuration() {
        let f = fixture(settings().with_skip_configuration(true), MockDeviceService::default());
        claim(&f).await;

        f.driver.configure_device(UUID).await.unwrap();
        assert!(f.mesh.sent().is_empty());
    }

    #[tokio::test]
    async fn test_inbound_command_updates_signal_quality_and_upgrade_end() {
        let f = fixture(settings(), MockDeviceService::default());
        let eui64 = Eui64::new(0xabc);
        f.driver.set_blocking_upgrade(eui64, true);

        let upgrade_end = ClusterCommand::new(
            eui64,
            1,
            zcl::OTA_UPGRADE_CLUSTER_ID,
            zcl::OTA_UPGRADE_END_REQUEST_COMMAND_ID,
        )
        .with_payload(vec![zcl::STATUS_SUCCESS])
        .with_link(-40, 200);
        f.driver.cluster_command_received(upgrade_end).await;

        assert_eq!(f.devices.resource(UUID, None, resources::NE_RSSI), Some("-40".to_string()));
        assert_eq!(f.devices.resource(UUID, None, resources::NE_LQI), Some("200".to_string()));
        assert_eq!(
            f.devices.resource(UUID, None, resources::FIRMWARE_UPDATE_STATUS),
            Some("completed".to_string())
        );
        assert!(f.driver.firmware().blocking().is_empty());
    }

    #[tokio::test]
    async fn test_failed_upgrade_end() {
        let f = fixture(settings(), MockDeviceService::default());
        let upgrade_end = ClusterCommand::new(
            Eui64::new(0xabc),
            1,
            zcl::OTA_UPGRADE_CLUSTER_ID,
            zcl::OTA_UPGRADE_END_REQUEST_COMMAND_ID,
        )
        .with_payload(vec![0x96]);
        f.driver.cluster_command_received(upgrade_end).await;

        assert_eq!(
            f.devices.resource(UUID, None, resources::FIRMWARE_UPDATE_STATUS),
            Some("failed".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_and_wait() {
        let f = fixture(settings(), MockDeviceService::default());
        let eui64 = Eui64::new(0xabc);
        let expected = OnOffCluster::command_response();

        let driver = f.driver.clone();
        let exchange = tokio::spawn(async move {
            driver
                .send_and_wait(eui64, 1, OutboundCommand::new(zcl::ON_OFF_CLUSTER_ID, 0x01), expected)
                .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(f.driver.on_async_response(eui64, AsyncResponse::new(expected, true)));

        let response = exchange.await.unwrap().unwrap();
        assert_eq!(response.response_type, expected);

        // Nothing is waiting any more.
        assert!(!f.driver.on_async_response(eui64, AsyncResponse::new(expected, true)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_and_wait_times_out() {
        let f = fixture(settings(), MockDeviceService::default());
        let result = f
            .driver
            .send_and_wait(
                Eui64::new(0xabc),
                1,
                OutboundCommand::new(zcl::ON_OFF_CLUSTER_ID, 0x01),
                OnOffCluster::command_response(),
            )
            .await;

        let error = assert_err!(result);
        assert!(error.is_timeout());
        assert!(matches!(
            error,
            DriverError::ResponseTimeout { timeout, .. } if timeout == Duration::from_millis(5000)
        ));
    }

    #[tokio::test]
    async fn test_send_failure_is_reported() {
        let f = fixture(settings(), MockDeviceService::default());
        f.mesh.fail_sends(true);

        let result = f
            .driver
            .send_and_wait(
                Eui64::new(0xabc),
                1,
                OutboundCommand::new(zcl::ON_OFF_CLUSTER_ID, 0x01),
                OnOffCluster::command_response(),
            )
            .await;
        assert!(matches!(result, Err(DriverError::ProtocolSendFailure { .. })));
    }

    #[tokio::test]
    async fn test_device_removed() {
        let f = fixture(settings(), MockDeviceService::default());
        f.catalog.insert(newer_firmware());
        f.devices.set_resource(UUID, None, resources::FIRMWARE_VERSION, "0x00000001");
        claim(&f).await;
        f.driver.device_persisted(UUID).await.unwrap();
        assert_eq!(f.driver.firmware().pending_count(), 1);

        f.driver.device_removed(UUID).await.unwrap();

        assert_eq!(f.driver.firmware().pending_count(), 0);
        assert_eq!(f.scheduler.pending(), 0);
        assert_eq!(f.mesh.listener_count(), 0);
        assert!(f.watchdog.monitored().is_empty());
        assert_eq!(f.watchdog.stopped(), vec![UUID.to_string()]);
        assert!(!f.driver.discovery().cache().contains(Eui64::new(0xabc)));
        assert_eq!(*f.hooks.removed.lock().unwrap(), vec![UUID.to_string()]);
        assert_eq!(
            f.mesh.sent().last(),
            Some(&SentMessage::Leave {
                eui64: Eui64::new(0xabc)
            })
        );
    }

    #[tokio::test]
    async fn test_device_removed_without_comm_fail_monitoring() {
        let f = fixture(settings().with_comm_fail_timeout(None), MockDeviceService::default());
        claim(&f).await;
        f.driver.device_persisted(UUID).await.unwrap();

        f.driver.device_removed(UUID).await.unwrap();

        assert!(f.watchdog.stopped().is_empty());
        assert!(f.watchdog.monitored().is_empty());
        assert_eq!(f.mesh.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_default_hooks_reject_writes() {
        let f = fixture(settings(), MockDeviceService::default());
        let result = f.driver.write_resource(UUID, None, "anything", "1").await;
        assert!(matches!(result, Err(DriverError::NotFound(_))));

        f.devices.set_resource(UUID, None, resources::MODEL, "Lamp");
        assert_eq!(
            f.driver.read_resource(UUID, None, resources::MODEL).await.unwrap(),
            Some("Lamp".to_string())
        );
        assert!(f.driver.read_resource("not-a-uuid", None, resources::MODEL).await.is_err());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_shutdown_waits_for_blocking_upgrade() {
        let devices = MockDeviceService::default();
        devices.add_record(record(UUID, "testLight"));
        let f = fixture(settings(), devices);
        f.driver.startup().await.unwrap();
        claim(&f).await;

        let eui64 = Eui64::new(0xabc);
        f.driver.set_blocking_upgrade(eui64, true);

        let driver = f.driver.clone();
        let shutdown = tokio::spawn(async move { driver.shutdown().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!shutdown.is_finished());
        assert_eq!(f.driver.state(), DriverState::ShuttingDown);
        assert!(f.mesh.discovery_handler("testLight").is_none());
        assert_eq!(f.mesh.listener_count(), 0);
        assert!(f.watchdog.monitored().is_empty());

        f.driver.set_blocking_upgrade(eui64, false);
        assert_ok!(shutdown.await.unwrap());

        assert_eq!(f.driver.state(), DriverState::Destroyed);
        assert!(f.driver.discovery().cache().is_empty());
        assert!(f.driver.synchronizers().is_empty());
    }
}
