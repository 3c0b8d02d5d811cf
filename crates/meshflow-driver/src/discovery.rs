/*!
 * Device discovery for MeshFlow.
 *
 * This module decides whether a newly seen device belongs to a driver,
 * presents claimed devices to the device registry and evicts the ones the
 * registry turns down.
 */
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use meshflow_core::types::Eui64;
use meshflow_core::utils::spawn_and_log;

use crate::cluster::{zcl, OutboundCommand};
use crate::device::{DeviceFoundDetails, DiscoveredDeviceDetails};
use crate::driver::{DriverHooks, DriverSettings};
use crate::error::{DriverError, Result};
use crate::protocol::{DeviceService, MeshNetwork};

/// Whether a driver is accepting new devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiscoveryState {
    /// New devices are ignored
    #[default]
    Idle,
    /// New devices are offered for claiming
    Discovering,
}

/// What happened to a discovered device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The driver was not discovering
    Ignored,
    /// The device does not belong to the driver
    NotClaimed,
    /// The driver claimed the device and the registry accepted it
    Accepted,
    /// The driver claimed the device but the registry turned it down
    Rejected,
}

impl ClaimOutcome {
    /// Whether the driver took ownership of the device, accepted or not
    pub fn claimed(&self) -> bool {
        matches!(self, ClaimOutcome::Accepted | ClaimOutcome::Rejected)
    }
}

/// Discovered details keyed by address
#[derive(Debug, Default)]
pub struct DetailsCache {
    entries: Mutex<HashMap<Eui64, DiscoveredDeviceDetails>>,
}

impl DetailsCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<Eui64, DiscoveredDeviceDetails>> {
        match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Insert or replace a device's details in one step
    pub fn upsert(&self, details: DiscoveredDeviceDetails) {
        self.entries().insert(details.eui64, details);
    }

    /// A copy of a device's details
    pub fn get(&self, eui64: Eui64) -> Option<DiscoveredDeviceDetails> {
        self.entries().get(&eui64).cloned()
    }

    /// Whether a device is cached
    pub fn contains(&self, eui64: Eui64) -> bool {
        self.entries().contains_key(&eui64)
    }

    /// Evict a device
    pub fn remove(&self, eui64: Eui64) -> Option<DiscoveredDeviceDetails> {
        self.entries().remove(&eui64)
    }

    /// Evict every device
    pub fn clear(&self) {
        self.entries().clear();
    }

    /// Number of cached devices
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

/// Claims discovered devices on behalf of one driver
#[derive(Debug)]
pub struct DiscoveryEngine {
    settings: Arc<DriverSettings>,
    hooks: Arc<dyn DriverHooks>,
    devices: Arc<dyn DeviceService>,
    mesh: Arc<dyn MeshNetwork>,
    state: Mutex<DiscoveryState>,
    cache: DetailsCache,
}

impl DiscoveryEngine {
    /// Create an idle engine
    pub fn new(
        settings: Arc<DriverSettings>,
        hooks: Arc<dyn DriverHooks>,
        devices: Arc<dyn DeviceService>,
        mesh: Arc<dyn MeshNetwork>,
    ) -> Self {
        Self {
            settings,
            hooks,
            devices,
            mesh,
            state: Mutex::new(DiscoveryState::Idle),
            cache: DetailsCache::new(),
        }
    }

    fn set_state(&self, new_state: DiscoveryState) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        *state = new_state;
    }

    /// Current state
    pub fn state(&self) -> DiscoveryState {
        match self.state.lock() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Start accepting new devices
    pub fn start(&self) {
        self.set_state(DiscoveryState::Discovering);
        info!("{}: discovery started", self.settings.driver_name);
    }

    /// Stop accepting new devices
    pub fn stop(&self) {
        self.set_state(DiscoveryState::Idle);
        info!("{}: discovery stopped", self.settings.driver_name);
    }

    /// The discovered details cache
    pub fn cache(&self) -> &DetailsCache {
        &self.cache
    }

    /// Whether the device belongs to this driver
    pub async fn claims(&self, details: &DiscoveredDeviceDetails) -> bool {
        if self.hooks.claim_device(details).await {
            return true;
        }

        details
            .first_endpoint()
            .map(|e| self.settings.supported_device_ids.contains(&e.device_type_id))
            .unwrap_or(false)
    }

    /// Handle a newly seen device
    ///
    /// Migrating devices are handled even when discovery is idle and are
    /// never evicted from the mesh when the registry turns them down.
    pub async fn on_device_discovered(
        &self,
        details: &DiscoveredDeviceDetails,
        migrating: bool,
    ) -> ClaimOutcome {
        if !migrating && self.state() != DiscoveryState::Discovering {
            return ClaimOutcome::Ignored;
        }

        if !self.claims(details).await {
            return ClaimOutcome::NotClaimed;
        }

        self.cache.upsert(details.clone());

        match self.present(details).await {
            Ok(()) => {
                if self.settings.single_target_discovery {
                    self.set_state(DiscoveryState::Idle);
                }
                info!("{}: {} accepted", self.settings.driver_name, details.uuid());
                ClaimOutcome::Accepted
            }
            Err(e) => {
                warn!("{}: {}", self.settings.driver_name, e);
                self.cache.remove(details.eui64);
                if !migrating {
                    self.evict(details);
                }
                ClaimOutcome::Rejected
            }
        }
    }

    /// Offer a claimed device to the device registry
    async fn present(&self, details: &DiscoveredDeviceDetails) -> Result<()> {
        let found = self.found_details(details);
        debug!(
            "{}: claimed {} ({} {})",
            self.settings.driver_name, found.uuid, found.manufacturer, found.model
        );

        if self.devices.device_found(&found, self.settings.never_reject).await {
            Ok(())
        } else {
            Err(DriverError::ClaimRejected(details.eui64))
        }
    }

    fn found_details(&self, details: &DiscoveredDeviceDetails) -> DeviceFoundDetails {
        let endpoint_profiles: BTreeMap<u8, String> = details
            .endpoints
            .iter()
            .map(|e| {
                let profile = self
                    .hooks
                    .endpoint_profile(details, e.endpoint_id)
                    .unwrap_or_else(|| self.settings.device_class.clone());
                (e.endpoint_id, profile)
            })
            .collect();

        DeviceFoundDetails {
            device_driver: self.settings.driver_name.clone(),
            device_class: self.settings.device_class.clone(),
            device_class_version: self.settings.device_class_version,
            uuid: details.uuid(),
            manufacturer: details.manufacturer.clone(),
            model: details.model.clone(),
            hardware_version: details.hardware_version_string(),
            firmware_version: details.firmware_version_string(),
            endpoint_profiles,
        }
    }

    /// Reset a rejected device to factory defaults and ask it to leave
    fn evict(&self, details: &DiscoveredDeviceDetails) {
        let eui64 = details.eui64;
        let endpoint_id = details.first_endpoint().map(|e| e.endpoint_id);
        let mesh = self.mesh.clone();

        spawn_and_log(&format!("evict {}", eui64), async move {
            match endpoint_id {
                Some(endpoint_id) => {
                    let reset = OutboundCommand::new(
                        zcl::BASIC_CLUSTER_ID,
                        zcl::BASIC_RESET_TO_FACTORY_COMMAND_ID,
                    );
                    if let Err(e) = mesh.send_command(eui64, endpoint_id, &reset).await {
                        warn!("{}: factory reset failed: {}", eui64, e);
                    }
                }
                None => debug!("{}: no endpoint to reset", eui64),
            }
            mesh.request_leave(eui64).await?;
            Ok::<_, DriverError>(())
        });
    }
}
