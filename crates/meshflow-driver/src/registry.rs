/*!
 * Cluster registry for MeshFlow drivers.
 *
 * This module provides the set of clusters a driver owns, the ordered
 * per-endpoint configuration pass and the routing of inbound reports and
 * commands to cluster handlers.
 */
use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::cluster::{
    zcl, AlarmEntry, AttributeReport, Cluster, ClusterCommand, DeviceConfigurationContext,
};
use crate::driver::DriverHooks;
use crate::error::{DriverError, Result};

/// Clusters owned by one driver
///
/// Clusters are registered while the driver is being built and never change
/// afterwards.
#[derive(Debug, Default)]
pub struct ClusterRegistry {
    /// Clusters in registration order
    clusters: Vec<Arc<dyn Cluster>>,
    /// Index into `clusters` by cluster id
    by_id: HashMap<u16, usize>,
}

impl ClusterRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cluster
    pub fn register(&mut self, cluster: Arc<dyn Cluster>) -> Result<()> {
        let id = cluster.cluster_id();
        if self.by_id.contains_key(&id) {
            return Err(DriverError::DuplicateCluster(id));
        }

        self.by_id.insert(id, self.clusters.len());
        self.clusters.push(cluster);
        debug!("Registered cluster 0x{:04x}", id);

        Ok(())
    }

    /// Get a cluster by id
    pub fn get(&self, cluster_id: u16) -> Option<&Arc<dyn Cluster>> {
        self.by_id.get(&cluster_id).map(|&i| &self.clusters[i])
    }

    /// Whether a cluster is registered
    pub fn contains(&self, cluster_id: u16) -> bool {
        self.by_id.contains_key(&cluster_id)
    }

    /// Every cluster in registration order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Cluster>> {
        self.clusters.iter()
    }

    /// Number of registered clusters
    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    /// Whether no clusters are registered
    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    /// The clusters to configure on an endpoint, in configuration order
    ///
    /// Only clusters the endpoint lists as server or client are included.
    /// Highest-priority clusters come first; ties keep registration order.
    pub fn configuration_order(&self, server: &[u16], client: &[u16]) -> Vec<Arc<dyn Cluster>> {
        let mut ordered: Vec<_> = self
            .clusters
            .iter()
            .filter(|c| {
                let id = c.cluster_id();
                server.contains(&id) || client.contains(&id)
            })
            .cloned()
            .collect();

        ordered.sort_by_key(|c| c.priority());
        ordered
    }

    /// Configure every relevant cluster on the context's endpoint
    ///
    /// The driver may skip a cluster through its pre-configure hook. The pass
    /// stops at the first cluster that fails.
    pub async fn configure_endpoint(
        &self,
        ctx: &mut DeviceConfigurationContext<'_>,
        hooks: &dyn DriverHooks,
    ) -> Result<()> {
        let endpoint = ctx.details.endpoint(ctx.endpoint_id).ok_or_else(|| {
            DriverError::not_found(format!(
                "endpoint {} on {}",
                ctx.endpoint_id, ctx.eui64
            ))
        })?;

        let ordered = self.configuration_order(&endpoint.server_cluster_ids, &endpoint.client_cluster_ids);

        for cluster in ordered {
            let cluster_id = cluster.cluster_id();

            if !hooks.pre_configure_cluster(cluster_id, ctx).await {
                debug!(
                    "{} endpoint {}: skipping cluster 0x{:04x}",
                    ctx.eui64, ctx.endpoint_id, cluster_id
                );
                continue;
            }

            let Some(configurator) = cluster.configurator() else {
                continue;
            };

            configurator.configure(ctx).await.map_err(|e| {
                warn!(
                    "{} endpoint {}: cluster 0x{:04x} failed to configure: {}",
                    ctx.eui64, ctx.endpoint_id, cluster_id, e
                );
                DriverError::ConfigurationFailure {
                    eui64: ctx.eui64,
                    endpoint_id: ctx.endpoint_id,
                    cluster_id,
                    reason: e.to_string(),
                }
            })?;
        }

        Ok(())
    }

    /// Route an attribute report to its cluster and the driver fallback
    pub async fn dispatch_attribute_report(&self, report: &AttributeReport, hooks: &dyn DriverHooks) {
        match self.get(report.cluster_id) {
            Some(cluster) => {
                if let Some(handler) = cluster.report_handler() {
                    if let Err(e) = handler.handle_attribute_report(report).await {
                        warn!(
                            "{}: cluster 0x{:04x} failed to handle report: {}",
                            report.eui64, report.cluster_id, e
                        );
                    }
                }
            }
            None => {
                debug!(
                    "{}: report for unregistered cluster 0x{:04x}",
                    report.eui64, report.cluster_id
                );
            }
        }

        if let Some(fallback) = hooks.report_fallback() {
            if let Err(e) = fallback.handle_attribute_report(report).await {
                warn!("{}: driver failed to handle report: {}", report.eui64, e);
            }
        }
    }

    /// Route a cluster command to its cluster and the driver fallback
    ///
    /// Alarms are routed to the alarmed cluster and Poll Control check-ins
    /// to every cluster that handles them.
    pub async fn dispatch_cluster_command(&self, command: &ClusterCommand, hooks: &dyn DriverHooks) {
        let routed = if command.cluster_specific && command.from_server {
            match (command.cluster_id, command.command_id) {
                (zcl::ALARMS_CLUSTER_ID, zcl::ALARMS_ALARM_COMMAND_ID) => {
                    self.dispatch_alarm(command).await;
                    true
                }
                (zcl::POLL_CONTROL_CLUSTER_ID, zcl::POLL_CONTROL_CHECK_IN_COMMAND_ID) => {
                    self.dispatch_poll_checkin(command).await;
                    true
                }
                _ => false,
            }
        } else {
            false
        };

        match self.get(command.cluster_id) {
            Some(cluster) => {
                if let Some(handler) = cluster.command_handler() {
                    if let Err(e) = handler.handle_cluster_command(command).await {
                        warn!(
                            "{}: cluster 0x{:04x} failed to handle command 0x{:02x}: {}",
                            command.eui64, command.cluster_id, command.command_id, e
                        );
                    }
                }
            }
            None if !routed => {
                debug!(
                    "{}: command 0x{:02x} for unregistered cluster 0x{:04x}",
                    command.eui64, command.command_id, command.cluster_id
                );
            }
            None => {}
        }

        if let Some(fallback) = hooks.command_fallback() {
            if let Err(e) = fallback.handle_cluster_command(command).await {
                warn!("{}: driver failed to handle command: {}", command.eui64, e);
            }
        }
    }

    async fn dispatch_alarm(&self, command: &ClusterCommand) {
        let Some(alarm) = AlarmEntry::parse(&command.payload) else {
            warn!("{}: malformed alarm payload", command.eui64);
            return;
        };

        let handler = self.get(alarm.cluster_id).and_then(|c| c.alarm_handler());
        match handler {
            Some(handler) => {
                if let Err(e) = handler
                    .handle_alarm(command.eui64, command.endpoint_id, &alarm)
                    .await
                {
                    warn!(
                        "{}: cluster 0x{:04x} failed to handle alarm {}: {}",
                        command.eui64, alarm.cluster_id, alarm.alarm_code, e
                    );
                }
            }
            None => {
                debug!(
                    "{}: no alarm handler for cluster 0x{:04x}",
                    command.eui64, alarm.cluster_id
                );
            }
        }
    }

    async fn dispatch_poll_checkin(&self, command: &ClusterCommand) {
        for cluster in &self.clusters {
            if let Some(handler) = cluster.poll_checkin_handler() {
                if let Err(e) = handler
                    .handle_poll_checkin(command.eui64, command.endpoint_id)
                    .await
                {
                    warn!(
                        "{}: cluster 0x{:04x} failed to handle check-in: {}",
                        command.eui64,
                        cluster.cluster_id(),
                        e
                    );
                }
            }
        }
    }
}
