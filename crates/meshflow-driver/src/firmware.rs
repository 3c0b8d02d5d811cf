/*!
 * Firmware upgrade pipeline.
 *
 * An upgrade is scheduled after a delay, downloads its files and then hands
 * over to the driver's upgrade initiator (or notifies the device that a new
 * OTA image is available). Failed downloads are retried forever after the
 * retry delay.
 *
 * Every scheduled upgrade lives in a pending map keyed by its task handle.
 * Both the task body and cancellation start by removing the entry; whichever
 * gets it proceeds and the other does nothing. From then until it finishes or
 * reschedules itself the device is in flight: it still counts as pending, and
 * cancelling it only marks it so that no retry or upgrade start follows.
 */
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use meshflow_core::config::FirmwareConfig;
use meshflow_core::scheduler::{DelayedTaskScheduler, TaskHandle};
use meshflow_core::types::Eui64;

use crate::device::{resources, DeviceDescriptor, FirmwareUpdateStatus};
use crate::driver::DriverHooks;
use crate::error::{DriverError, Result};
use crate::protocol::{DeviceService, FirmwareFetcher, MeshNetwork};

/// Where firmware goes and how long to wait before and between attempts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareSettings {
    /// Root of the firmware directory
    pub directory: PathBuf,
    /// Delay before the first attempt
    pub upgrade_delay: Duration,
    /// Delay before each retry
    pub retry_delay: Duration,
}

impl Default for FirmwareSettings {
    fn default() -> Self {
        Self::from(&FirmwareConfig::default())
    }
}

impl From<&FirmwareConfig> for FirmwareSettings {
    fn from(config: &FirmwareConfig) -> Self {
        Self {
            directory: PathBuf::from(&config.directory),
            upgrade_delay: config.upgrade_delay(),
            retry_delay: config.retry_delay(),
        }
    }
}

/// Compare two firmware version strings
///
/// Versions are either `0x` prefixed hex integers or dotted numbers. Returns
/// `None` when either side cannot be parsed.
pub fn compare_versions(a: &str, b: &str) -> Option<Ordering> {
    let a = parse_version(a)?;
    let b = parse_version(b)?;
    let len = a.len().max(b.len());

    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return Some(other),
        }
    }
    Some(Ordering::Equal)
}

fn parse_version(version: &str) -> Option<Vec<u64>> {
    let version = version.trim();
    if let Some(hex) = version.strip_prefix("0x").or_else(|| version.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16).ok().map(|v| vec![v]);
    }

    version
        .split('.')
        .map(|part| part.parse::<u64>().ok())
        .collect()
}

/// Whether `latest` is strictly newer than `current`
pub fn is_newer(current: &str, latest: &str) -> bool {
    compare_versions(latest, current) == Some(Ordering::Greater)
}

/// Everything needed to run one device's upgrade
#[derive(Debug, Clone)]
pub struct FirmwareUpgradeContext {
    /// Device uuid
    pub device_uuid: String,
    /// Device address
    pub eui64: Eui64,
    /// Endpoint hosting the OTA client
    pub endpoint_id: u8,
    /// Descriptor naming the firmware
    pub descriptor: DeviceDescriptor,
    /// Handle of the task that will run this upgrade
    pub handle: Option<TaskHandle>,
    /// Download attempts so far
    pub attempts: u32,
    /// When the current task was scheduled
    pub scheduled_at: DateTime<Utc>,
}

impl FirmwareUpgradeContext {
    /// Create a context for a device
    pub fn new(eui64: Eui64, endpoint_id: u8, descriptor: DeviceDescriptor) -> Self {
        Self {
            device_uuid: eui64.to_uuid(),
            eui64,
            endpoint_id,
            descriptor,
            handle: None,
            attempts: 0,
            scheduled_at: Utc::now(),
        }
    }
}

/// Starts an upgrade once its files are downloaded
#[async_trait]
pub trait UpgradeInitiator: Send + Sync {
    /// Start the upgrade
    async fn initiate_upgrade(&self, ctx: &FirmwareUpgradeContext) -> Result<()>;
}

/// Devices in the middle of an upgrade that must not be interrupted
#[derive(Debug, Default)]
pub struct BlockingUpgradeSet {
    devices: Mutex<HashSet<Eui64>>,
    signal: Notify,
}

impl BlockingUpgradeSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    fn devices(&self) -> MutexGuard<'_, HashSet<Eui64>> {
        match self.devices.lock() {
            Ok(devices) => devices,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Mark or clear a device
    pub fn set(&self, eui64: Eui64, blocking: bool) {
        if blocking {
            self.devices().insert(eui64);
            debug!("{}: upgrade is blocking", eui64);
        } else {
            let removed = self.devices().remove(&eui64);
            if removed {
                debug!("{}: upgrade no longer blocking", eui64);
            }
            self.signal.notify_waiters();
        }
    }

    /// Whether a device is marked
    pub fn contains(&self, eui64: Eui64) -> bool {
        self.devices().contains(&eui64)
    }

    /// Whether no device is marked
    pub fn is_empty(&self) -> bool {
        self.devices().is_empty()
    }

    /// Number of marked devices
    pub fn len(&self) -> usize {
        self.devices().len()
    }

    /// Wait until no device is marked
    pub async fn wait_until_empty(&self) {
        loop {
            let notified = self.signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let remaining = self.len();
            if remaining == 0 {
                return;
            }
            info!("Waiting for {} blocking firmware upgrade(s)", remaining);
            notified.await;
        }
    }
}

#[derive(Debug, Default)]
struct Upgrades {
    scheduled: HashMap<TaskHandle, FirmwareUpgradeContext>,
    in_flight: HashSet<Eui64>,
    cancelled: HashSet<Eui64>,
    shutting_down: bool,
}

impl Upgrades {
    fn contains(&self, eui64: Eui64) -> bool {
        self.in_flight.contains(&eui64) || self.scheduled.values().any(|ctx| ctx.eui64 == eui64)
    }

    /// Ends a device's in-flight stage; `false` when it was cancelled meanwhile
    fn land(&mut self, eui64: Eui64) -> bool {
        self.in_flight.remove(&eui64);
        let cancelled = self.cancelled.remove(&eui64);
        !cancelled && !self.shutting_down
    }
}

/// Schedules, downloads and starts firmware upgrades
pub struct FirmwarePipeline {
    settings: FirmwareSettings,
    scheduler: Arc<dyn DelayedTaskScheduler>,
    fetcher: Arc<dyn FirmwareFetcher>,
    devices: Arc<dyn DeviceService>,
    mesh: Arc<dyn MeshNetwork>,
    hooks: Arc<dyn DriverHooks>,
    upgrades: Mutex<Upgrades>,
    blocking: BlockingUpgradeSet,
    weak_self: Weak<FirmwarePipeline>,
}

impl fmt::Debug for FirmwarePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FirmwarePipeline")
            .field("settings", &self.settings)
            .field("pending", &self.pending_count())
            .field("blocking", &self.blocking.len())
            .finish()
    }
}

impl FirmwarePipeline {
    /// Create a pipeline
    pub fn new(
        settings: FirmwareSettings,
        scheduler: Arc<dyn DelayedTaskScheduler>,
        fetcher: Arc<dyn FirmwareFetcher>,
        devices: Arc<dyn DeviceService>,
        mesh: Arc<dyn MeshNetwork>,
        hooks: Arc<dyn DriverHooks>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            settings,
            scheduler,
            fetcher,
            devices,
            mesh,
            hooks,
            upgrades: Mutex::new(Upgrades::default()),
            blocking: BlockingUpgradeSet::new(),
            weak_self: weak_self.clone(),
        })
    }

    fn upgrades(&self) -> MutexGuard<'_, Upgrades> {
        match self.upgrades.lock() {
            Ok(upgrades) => upgrades,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// The pipeline settings
    pub fn settings(&self) -> &FirmwareSettings {
        &self.settings
    }

    /// The blocking-upgrade set
    pub fn blocking(&self) -> &BlockingUpgradeSet {
        &self.blocking
    }

    /// Number of scheduled upgrades
    pub fn pending_count(&self) -> usize {
        self.upgrades().scheduled.len()
    }

    /// Whether an upgrade is scheduled or running for a device
    pub fn is_pending(&self, eui64: Eui64) -> bool {
        self.upgrades().contains(eui64)
    }

    /// Whether a device's upgrade is downloading or starting right now
    pub fn is_in_flight(&self, eui64: Eui64) -> bool {
        self.upgrades().in_flight.contains(&eui64)
    }

    /// Whether the descriptor names firmware newer than `current`
    pub fn upgrade_required(&self, current: &str, descriptor: &DeviceDescriptor) -> bool {
        if let Some(required) = self.hooks.firmware_upgrade_required(current, descriptor) {
            return required;
        }

        match &descriptor.latest_firmware {
            Some(latest) => is_newer(current, &latest.version),
            None => false,
        }
    }

    /// Schedule an upgrade after the upgrade delay
    ///
    /// Returns `None` when the device already has one scheduled or running,
    /// or when the pipeline is shutting down.
    pub async fn request_upgrade(&self, ctx: FirmwareUpgradeContext) -> Option<TaskHandle> {
        {
            let upgrades = self.upgrades();
            if upgrades.shutting_down {
                debug!("{}: not scheduling an upgrade during shutdown", ctx.eui64);
                return None;
            }
            if upgrades.contains(ctx.eui64) {
                debug!("{}: upgrade already pending", ctx.eui64);
                return None;
            }
        }

        self.set_status(&ctx.device_uuid, FirmwareUpdateStatus::Pending).await;
        let handle = self.schedule(ctx, self.settings.upgrade_delay);
        if let Some(handle) = handle {
            info!("Firmware upgrade scheduled as {}", handle);
        }
        handle
    }

    fn schedule(&self, mut ctx: FirmwareUpgradeContext, delay: Duration) -> Option<TaskHandle> {
        let mut upgrades = self.upgrades();
        if upgrades.shutting_down || upgrades.contains(ctx.eui64) {
            return None;
        }

        let weak_self = self.weak_self.clone();
        let handle = self.scheduler.schedule(
            delay,
            Box::new(move |handle| {
                Box::pin(async move {
                    if let Some(pipeline) = weak_self.upgrade() {
                        pipeline.fire(handle).await;
                    }
                })
            }),
        );

        ctx.handle = Some(handle);
        ctx.scheduled_at = Utc::now();
        upgrades.scheduled.insert(handle, ctx);
        Some(handle)
    }

    /// Schedule a retry unless the device was cancelled while in flight
    fn reschedule(&self, ctx: FirmwareUpgradeContext) -> Option<TaskHandle> {
        if !self.upgrades().land(ctx.eui64) {
            debug!("{}: upgrade cancelled, not retrying", ctx.eui64);
            return None;
        }
        self.schedule(ctx, self.settings.retry_delay)
    }

    /// Run the upgrade scheduled as `handle`
    ///
    /// Does nothing when the upgrade was cancelled.
    pub async fn fire(&self, handle: TaskHandle) {
        let removed = {
            let mut upgrades = self.upgrades();
            let removed = upgrades.scheduled.remove(&handle);
            if let Some(ctx) = &removed {
                upgrades.in_flight.insert(ctx.eui64);
            }
            removed
        };
        let Some(mut ctx) = removed else {
            debug!("{} was cancelled", handle);
            return;
        };

        ctx.attempts += 1;
        debug!("{}: firmware attempt {}", ctx.eui64, ctx.attempts);

        if let Err(e) = self.download(&ctx).await {
            warn!(
                "{}: {} (attempt {}), retrying in {:?}",
                ctx.eui64, e, ctx.attempts, self.settings.retry_delay
            );
            self.reschedule(ctx);
            return;
        }

        if !self.upgrades().land(ctx.eui64) {
            debug!("{}: upgrade cancelled after download", ctx.eui64);
            return;
        }

        self.set_status(&ctx.device_uuid, FirmwareUpdateStatus::Started).await;

        match self.hooks.upgrade_initiator() {
            Some(initiator) => {
                if let Err(e) = initiator.initiate_upgrade(&ctx).await {
                    warn!("{}: failed to start upgrade: {}", ctx.eui64, e);
                    self.set_status(&ctx.device_uuid, FirmwareUpdateStatus::Failed).await;
                }
            }
            None => {
                if let Err(e) = self.mesh.send_image_notify(ctx.eui64, ctx.endpoint_id).await {
                    warn!("{}: image notify failed: {}", ctx.eui64, e);
                }
            }
        }
    }

    async fn download(&self, ctx: &FirmwareUpgradeContext) -> Result<()> {
        let firmware = ctx
            .descriptor
            .latest_firmware
            .as_ref()
            .ok_or_else(|| DriverError::download("descriptor names no firmware"))?;

        let directory = self.settings.directory.join(firmware.firmware_type.dir_name());
        tokio::fs::create_dir_all(&directory).await?;

        for filename in &firmware.filenames {
            let destination = directory.join(filename);
            if file_exists(&destination).await {
                debug!("{} already downloaded", destination.display());
                continue;
            }

            self.fetcher
                .fetch(filename, &destination)
                .await
                .map_err(|e| DriverError::download(format!("{}: {:#}", filename, e)))?;
            info!("Downloaded {}", destination.display());
        }

        Ok(())
    }

    async fn set_status(&self, uuid: &str, status: FirmwareUpdateStatus) {
        if let Err(e) = self
            .devices
            .update_resource(uuid, None, resources::FIRMWARE_UPDATE_STATUS, status.as_str())
            .await
        {
            warn!("{}: failed to set firmware status {}: {}", uuid, status, e);
        }
    }

    /// Cancel one upgrade; returns its context if it had not fired
    pub fn cancel(&self, handle: TaskHandle) -> Option<FirmwareUpgradeContext> {
        let ctx = self.upgrades().scheduled.remove(&handle)?;
        self.scheduler.cancel(handle);
        debug!("Cancelled {} for {}", handle, ctx.eui64);
        Some(ctx)
    }

    /// Cancel the upgrade of a device
    ///
    /// Returns the context of an upgrade that had not fired yet. An upgrade
    /// that is downloading is marked instead, so it neither retries nor
    /// starts; `None` is returned for it.
    pub fn cancel_for_device(&self, uuid: &str) -> Option<FirmwareUpgradeContext> {
        let handle = {
            let mut upgrades = self.upgrades();
            let scheduled = upgrades
                .scheduled
                .iter()
                .find(|(_, ctx)| ctx.device_uuid == uuid)
                .map(|(handle, _)| *handle);

            if scheduled.is_none() {
                if let Some(eui64) = upgrades
                    .in_flight
                    .iter()
                    .copied()
                    .find(|eui64| eui64.to_uuid() == uuid)
                {
                    upgrades.cancelled.insert(eui64);
                    debug!("{}: in-flight upgrade marked cancelled", uuid);
                }
            }
            scheduled
        }?;
        self.cancel(handle)
    }

    /// Cancel every upgrade, scheduled or in flight
    ///
    /// Returns how many scheduled upgrades were cancelled.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<_> = {
            let mut upgrades = self.upgrades();
            let in_flight: Vec<Eui64> = upgrades.in_flight.iter().copied().collect();
            upgrades.cancelled.extend(in_flight);
            upgrades.scheduled.drain().collect()
        };
        for (handle, _) in &drained {
            self.scheduler.cancel(*handle);
        }
        drained.len()
    }

    /// Cancel every upgrade, then wait for blocking ones to finish
    ///
    /// Nothing can be scheduled once this has started.
    pub async fn shutdown(&self) {
        self.upgrades().shutting_down = true;
        let cancelled = self.cancel_all();
        if cancelled > 0 {
            info!("Cancelled {} pending firmware upgrade(s)", cancelled);
        }
        self.blocking.wait_until_empty().await;
    }
}

async fn file_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}
