/*!
 * Recording collaborator doubles for tests.
 */
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Notify, Semaphore};

use meshflow_core::scheduler::{DelayedTaskScheduler, ScheduledTask, TaskHandle};
use meshflow_core::types::Eui64;

use crate::cluster::{AttributeWrite, OutboundCommand, ReportingConfig};
use crate::device::{DeviceDescriptor, DeviceFoundDetails, DeviceRecord};
use crate::error::{DriverError, Result};
use crate::protocol::{
    CommFailWatchdog, DescriptorCatalog, DeviceService, DiscoveryHandler, FirmwareFetcher,
    MeshEventHandler, MeshNetwork,
};

/// Something the mock mesh was asked to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentMessage {
    Command {
        eui64: Eui64,
        endpoint_id: u8,
        cluster_id: u16,
        command_id: u8,
    },
    WriteAttribute {
        eui64: Eui64,
        endpoint_id: u8,
        cluster_id: u16,
        attribute_id: u16,
        value: Bytes,
    },
    Binding {
        eui64: Eui64,
        endpoint_id: u8,
        cluster_id: u16,
    },
    Reporting {
        eui64: Eui64,
        endpoint_id: u8,
        cluster_id: u16,
        attribute_ids: Vec<u16>,
    },
    Leave {
        eui64: Eui64,
    },
    ImageNotify {
        eui64: Eui64,
        endpoint_id: u8,
    },
}

#[derive(Default)]
pub struct MockMesh {
    sent: Mutex<Vec<SentMessage>>,
    payloads: Mutex<Vec<Bytes>>,
    attributes: Mutex<HashMap<(Eui64, u16, u16), Bytes>>,
    fail_sends: AtomicBool,
    listeners: Mutex<HashMap<Eui64, Arc<dyn MeshEventHandler>>>,
    discovery: Mutex<HashMap<String, Arc<dyn DiscoveryHandler>>>,
}

impl fmt::Debug for MockMesh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockMesh").field("sent", &self.sent()).finish()
    }
}

impl MockMesh {
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn payloads(&self) -> Vec<Bytes> {
        self.payloads.lock().unwrap().clone()
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn set_attribute(&self, eui64: Eui64, cluster_id: u16, attribute_id: u16, value: Vec<u8>) {
        self.attributes
            .lock()
            .unwrap()
            .insert((eui64, cluster_id, attribute_id), Bytes::from(value));
    }

    pub fn listener(&self, eui64: Eui64) -> Option<Arc<dyn MeshEventHandler>> {
        self.listeners.lock().unwrap().get(&eui64).cloned()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }

    pub fn discovery_handler(&self, driver_name: &str) -> Option<Arc<dyn DiscoveryHandler>> {
        self.discovery.lock().unwrap().get(driver_name).cloned()
    }

    fn record(&self, eui64: Eui64, message: SentMessage) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(DriverError::send_failure(eui64, "mock send failure"));
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }
}

#[async_trait]
impl MeshNetwork for MockMesh {
    async fn send_command(&self, eui64: Eui64, endpoint_id: u8, command: &OutboundCommand) -> Result<()> {
        self.record(
            eui64,
            SentMessage::Command {
                eui64,
                endpoint_id,
                cluster_id: command.cluster_id,
                command_id: command.command_id,
            },
        )?;
        self.payloads.lock().unwrap().push(command.payload.clone());
        Ok(())
    }

    async fn write_attribute(&self, eui64: Eui64, endpoint_id: u8, write: &AttributeWrite) -> Result<()> {
        self.record(
            eui64,
            SentMessage::WriteAttribute {
                eui64,
                endpoint_id,
                cluster_id: write.cluster_id,
                attribute_id: write.attribute_id,
                value: write.value.clone(),
            },
        )
    }

    async fn read_attribute(
        &self,
        eui64: Eui64,
        _endpoint_id: u8,
        cluster_id: u16,
        attribute_id: u16,
    ) -> Result<Bytes> {
        self.attributes
            .lock()
            .unwrap()
            .get(&(eui64, cluster_id, attribute_id))
            .cloned()
            .ok_or_else(|| DriverError::not_found(format!("attribute 0x{:04x}", attribute_id)))
    }

    async fn set_binding(&self, eui64: Eui64, endpoint_id: u8, cluster_id: u16) -> Result<()> {
        self.record(
            eui64,
            SentMessage::Binding {
                eui64,
                endpoint_id,
                cluster_id,
            },
        )
    }

    async fn set_attribute_reporting(
        &self,
        eui64: Eui64,
        endpoint_id: u8,
        cluster_id: u16,
        configs: &[ReportingConfig],
    ) -> Result<()> {
        self.record(
            eui64,
            SentMessage::Reporting {
                eui64,
                endpoint_id,
                cluster_id,
                attribute_ids: configs.iter().map(|c| c.attribute_id).collect(),
            },
        )
    }

    async fn request_leave(&self, eui64: Eui64) -> Result<()> {
        self.record(eui64, SentMessage::Leave { eui64 })
    }

    async fn send_image_notify(&self, eui64: Eui64, endpoint_id: u8) -> Result<()> {
        self.record(eui64, SentMessage::ImageNotify { eui64, endpoint_id })
    }

    fn register_listener(&self, eui64: Eui64, handler: Arc<dyn MeshEventHandler>) {
        self.listeners.lock().unwrap().insert(eui64, handler);
    }

    fn unregister_listener(&self, eui64: Eui64) {
        self.listeners.lock().unwrap().remove(&eui64);
    }

    fn register_discovery_handler(&self, driver_name: &str, handler: Arc<dyn DiscoveryHandler>) {
        self.discovery
            .lock()
            .unwrap()
            .insert(driver_name.to_string(), handler);
    }

    fn unregister_discovery_handler(&self, driver_name: &str) {
        self.discovery.lock().unwrap().remove(driver_name);
    }
}

type ResourceKey = (String, Option<u8>, String);

#[derive(Debug, Default)]
pub struct MockDeviceService {
    reject: AtomicBool,
    found: Mutex<Vec<DeviceFoundDetails>>,
    resources: Mutex<BTreeMap<ResourceKey, String>>,
    metadata: Mutex<HashMap<(String, String), String>>,
    records: Mutex<Vec<DeviceRecord>>,
    removed: Mutex<Vec<String>>,
}

impl MockDeviceService {
    pub fn reject_all(&self) {
        self.reject.store(true, Ordering::SeqCst);
    }

    pub fn found(&self) -> Vec<DeviceFoundDetails> {
        self.found.lock().unwrap().clone()
    }

    pub fn resource(&self, uuid: &str, endpoint_id: Option<u8>, name: &str) -> Option<String> {
        self.resources
            .lock()
            .unwrap()
            .get(&(uuid.to_string(), endpoint_id, name.to_string()))
            .cloned()
    }

    pub fn set_resource(&self, uuid: &str, endpoint_id: Option<u8>, name: &str, value: &str) {
        self.resources
            .lock()
            .unwrap()
            .insert((uuid.to_string(), endpoint_id, name.to_string()), value.to_string());
    }

    pub fn add_record(&self, record: DeviceRecord) {
        self.records.lock().unwrap().push(record);
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeviceService for MockDeviceService {
    async fn device_found(&self, details: &DeviceFoundDetails, never_reject: bool) -> bool {
        self.found.lock().unwrap().push(details.clone());
        never_reject || !self.reject.load(Ordering::SeqCst)
    }

    async fn update_resource(
        &self,
        uuid: &str,
        endpoint_id: Option<u8>,
        name: &str,
        value: &str,
    ) -> Result<()> {
        self.set_resource(uuid, endpoint_id, name, value);
        Ok(())
    }

    async fn get_resource(&self, uuid: &str, endpoint_id: Option<u8>, name: &str) -> Option<String> {
        self.resource(uuid, endpoint_id, name)
    }

    async fn get_metadata(&self, uuid: &str, key: &str) -> Option<String> {
        self.metadata
            .lock()
            .unwrap()
            .get(&(uuid.to_string(), key.to_string()))
            .cloned()
    }

    async fn set_metadata(&self, uuid: &str, key: &str, value: &str) -> Result<()> {
        self.metadata
            .lock()
            .unwrap()
            .insert((uuid.to_string(), key.to_string()), value.to_string());
        Ok(())
    }

    async fn remove_device(&self, uuid: &str) -> Result<()> {
        self.removed.lock().unwrap().push(uuid.to_string());
        Ok(())
    }

    async fn devices_by_driver(&self, driver_name: &str) -> Vec<DeviceRecord> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.device_driver == driver_name)
            .cloned()
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct MockCatalog {
    descriptors: Mutex<HashMap<(String, String), DeviceDescriptor>>,
}

impl MockCatalog {
    pub fn insert(&self, descriptor: DeviceDescriptor) {
        self.descriptors.lock().unwrap().insert(
            (descriptor.manufacturer.clone(), descriptor.model.clone()),
            descriptor,
        );
    }
}

impl DescriptorCatalog for MockCatalog {
    fn resolve(
        &self,
        manufacturer: &str,
        model: &str,
        _hardware_version: &str,
        _firmware_version: &str,
    ) -> Option<DeviceDescriptor> {
        self.descriptors
            .lock()
            .unwrap()
            .get(&(manufacturer.to_string(), model.to_string()))
            .cloned()
    }
}

#[derive(Debug, Default)]
pub struct MockWatchdog {
    monitored: Mutex<BTreeMap<String, (Duration, bool)>>,
    stopped: Mutex<Vec<String>>,
}

impl MockWatchdog {
    pub fn monitored(&self) -> BTreeMap<String, (Duration, bool)> {
        self.monitored.lock().unwrap().clone()
    }

    /// Every uuid monitoring was stopped for, in call order
    pub fn stopped(&self) -> Vec<String> {
        self.stopped.lock().unwrap().clone()
    }
}

impl CommFailWatchdog for MockWatchdog {
    fn monitor_device(&self, uuid: &str, timeout: Duration, initially_failed: bool) {
        self.monitored
            .lock()
            .unwrap()
            .insert(uuid.to_string(), (timeout, initially_failed));
    }

    fn stop_monitoring_device(&self, uuid: &str) {
        self.stopped.lock().unwrap().push(uuid.to_string());
        self.monitored.lock().unwrap().remove(uuid);
    }
}

/// Fails the first `failures` fetches, then writes a small file
///
/// A gated fetcher holds every fetch until the test releases it.
#[derive(Debug, Default)]
pub struct MockFetcher {
    failures: usize,
    calls: AtomicUsize,
    gate: Option<Semaphore>,
    entered: Notify,
}

impl MockFetcher {
    pub fn failing(failures: usize) -> Self {
        Self {
            failures,
            ..Self::default()
        }
    }

    pub fn gated(failures: usize) -> Self {
        Self {
            failures,
            gate: Some(Semaphore::new(0)),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Wait until a fetch has started
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    /// Let one held fetch finish
    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }
    }
}

#[async_trait]
impl FirmwareFetcher for MockFetcher {
    async fn fetch(&self, filename: &str, destination: &Path) -> anyhow::Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        if let Some(gate) = &self.gate {
            gate.acquire().await?.forget();
        }
        if call < self.failures {
            anyhow::bail!("{} unavailable", filename);
        }
        tokio::fs::write(destination, b"image").await?;
        Ok(())
    }
}

/// A scheduler whose tasks only run when a test fires them
#[derive(Default)]
pub struct ManualScheduler {
    next: AtomicU64,
    tasks: Mutex<BTreeMap<TaskHandle, ScheduledTask>>,
    delays: Mutex<Vec<Duration>>,
}

impl fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualScheduler")
            .field("pending", &self.pending())
            .finish()
    }
}

impl ManualScheduler {
    /// Delays of every task ever scheduled
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().unwrap().clone()
    }

    /// Tasks that have neither fired nor been cancelled
    pub fn pending(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    /// Run the oldest task
    pub async fn fire_next(&self) -> Option<TaskHandle> {
        let next = {
            let mut tasks = self.tasks.lock().unwrap();
            let handle = *tasks.keys().next()?;
            tasks.remove(&handle).map(|task| (handle, task))
        };

        let (handle, task) = next?;
        task(handle).await;
        Some(handle)
    }
}

impl DelayedTaskScheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: ScheduledTask) -> TaskHandle {
        let handle = TaskHandle::new(self.next.fetch_add(1, Ordering::SeqCst) + 1);
        self.tasks.lock().unwrap().insert(handle, task);
        self.delays.lock().unwrap().push(delay);
        handle
    }

    fn cancel(&self, handle: TaskHandle) -> bool {
        self.tasks.lock().unwrap().remove(&handle).is_some()
    }
}
