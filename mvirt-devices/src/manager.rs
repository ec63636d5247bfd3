//! Device set management.
//!
//! [`DeviceManager`] owns the set of devices the datapath attaches to. It
//! detects the initial set once ([`DeviceManager::detect`]) and then keeps it
//! in sync with the host ([`DeviceManager::listen`]): devices that appear,
//! vanish, lose their TC programs or change their primary address are
//! reported as a new device list.

use crate::config::{AddressFamilies, DeviceConfig, STATIC_DEVICES_CHECK_INTERVAL_SECS};
use crate::dynamic::read_dynamic_devices;
use crate::error::{DeviceError, Result};
use crate::filter::{DeviceFilter, expand_device_wildcards};
use crate::kernel::{AddrFamily, KernelState, Link, RT_TABLE_LOCAL, Route, is_global_unicast};
use crate::node::NodeAddressing;
use crate::probe::{FeatureProbe, L3_DEV_HELPER, L3_DEV_PROG_TYPE};
use crate::tc::tc_hooks_lost;
use crate::viability::{ViabilityClassifier, excluded_prefix};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// The datapath's host device. It may share the node's IPv6 address.
pub const HOST_DEVICE: &str = "cilium_host";

/// Outcome of a detection pass, to be applied to the agent configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct DetectionResult {
    /// Sorted device names.
    pub devices: Vec<String>,
    pub direct_routing_device: Option<String>,
    pub ipv6_mcast_device: Option<String>,
}

#[derive(Debug, Default, Clone, Copy)]
struct LinkInfo {
    has_default_route: bool,
}

struct State {
    devices: BTreeSet<String>,
    config: DeviceConfig,
}

impl State {
    fn device_list(&self) -> Vec<String> {
        self.devices.iter().cloned().collect()
    }
}

/// Detects and tracks the devices datapath programs are attached to.
pub struct DeviceManager {
    state: Mutex<State>,
    /// Device patterns as configured, before wildcard expansion.
    user_devices: Vec<String>,
    filter: DeviceFilter,
    families: AddressFamilies,
    dynamic_devices_dir: PathBuf,
    check_interval: Duration,
    kernel: Arc<dyn KernelState>,
    probe: Arc<dyn FeatureProbe>,
    node: Arc<dyn NodeAddressing>,
}

impl DeviceManager {
    pub fn new(
        config: DeviceConfig,
        kernel: Arc<dyn KernelState>,
        probe: Arc<dyn FeatureProbe>,
        node: Arc<dyn NodeAddressing>,
    ) -> Self {
        let mut check_interval = config.static_devices_check_interval();
        if check_interval.is_zero() {
            check_interval = Duration::from_secs(STATIC_DEVICES_CHECK_INTERVAL_SECS);
        }

        Self {
            user_devices: config.devices.clone(),
            filter: DeviceFilter::new(config.devices.clone()),
            families: config.families(),
            dynamic_devices_dir: config.dynamic_devices_dir.clone(),
            check_interval,
            state: Mutex::new(State {
                devices: BTreeSet::new(),
                config,
            }),
            kernel,
            probe,
            node,
        }
    }

    /// Current sorted device list.
    pub async fn devices(&self) -> Vec<String> {
        self.state.lock().await.device_list()
    }

    /// Configuration as rewritten by the last successful detection.
    pub async fn config(&self) -> DeviceConfig {
        self.state.lock().await.config.clone()
    }

    /// Detect the devices to attach datapath programs to.
    ///
    /// Without an explicit device list, devices are derived from the links
    /// that carry global unicast routes. Wildcards in the configured devices
    /// and direct routing device are expanded, and the direct routing and
    /// IPv6 multicast devices are resolved when features need them.
    ///
    /// On error neither the device set nor the configuration is changed.
    pub async fn detect(&self) -> Result<DetectionResult> {
        let mut state = self.state.lock().await;

        let kernel = self.kernel.as_ref();
        let mut config = state.config.clone();
        let mut devices = BTreeSet::new();

        config.devices =
            expand_device_wildcards(kernel, &config.devices, "devices", self.families).await?;

        config.direct_routing_device = config.direct_routing_device.filter(|d| !d.is_empty());
        config.ipv6_mcast_device = config.ipv6_mcast_device.filter(|d| !d.is_empty());

        if let Some(pattern) = config.direct_routing_device.clone() {
            let expanded =
                expand_device_wildcards(kernel, &[pattern], "direct-routing-device", self.families)
                    .await?;
            config.direct_routing_device = expanded.into_iter().next();
        }

        // The probe needs root and is only relevant for BPF host routing.
        let l3_dev_ok = config.enable_host_legacy_routing
            || self.probe.has_helper(L3_DEV_PROG_TYPE, L3_DEV_HELPER).await;

        if config.devices.is_empty() && config.are_devices_required() {
            let routes = kernel
                .routes(self.families.route_family())
                .await
                .map_err(DeviceError::RouteList)?;
            self.update_devices_from_routes(&mut devices, l3_dev_ok, &routes)
                .await;
        } else {
            devices.extend(config.devices.iter().cloned());
        }

        let mut detect_direct_routing_dev = config.direct_routing_device_required();
        if detect_direct_routing_dev && let Some(device) = &config.direct_routing_device {
            devices.insert(device.clone());
            detect_direct_routing_dev = false;
        }

        let mut detect_mcast_dev = config.enable_ipv6_ndp;
        if let Some(device) = &config.ipv6_mcast_device {
            devices.insert(device.clone());
            detect_mcast_dev = false;
        }

        if detect_direct_routing_dev || detect_mcast_dev {
            let node_link = match self.find_node_ip_link().await {
                Ok(link) => {
                    devices.insert(link.name.clone());
                    Some(link)
                }
                Err(e) if config.k8s_enabled => return Err(DeviceError::K8sNodeIp(Box::new(e))),
                Err(e) => {
                    debug!(error = %e, "Node IP device not found");
                    None
                }
            };

            if detect_direct_routing_dev {
                // A single device is the obvious choice, otherwise use the node IP device.
                let device = if devices.len() == 1 {
                    devices.first().cloned()
                } else {
                    node_link.as_ref().map(|l| l.name.clone())
                };
                let device = device.ok_or(DeviceError::DirectRoutingDevice)?;
                info!(direct_routing_device = %device, "Direct routing device detected");
                config.direct_routing_device = Some(device);
            }

            if detect_mcast_dev {
                let link = node_link
                    .filter(|l| l.has_flags(libc::IFF_MULTICAST as u32))
                    .ok_or(DeviceError::MulticastDevice)?;
                info!(ipv6_mcast_device = %link.name, "IPv6 multicast device detected");
                config.ipv6_mcast_device = Some(link.name);
            }
        }

        let device_list: Vec<String> = devices.iter().cloned().collect();
        config.devices = device_list.clone();
        info!(devices = ?device_list, "Detected devices");

        let result = DetectionResult {
            devices: device_list,
            direct_routing_device: config.direct_routing_device.clone(),
            ipv6_mcast_device: config.ipv6_mcast_device.clone(),
        };
        state.devices = devices;
        state.config = config;
        Ok(result)
    }

    /// Add the viable links that global unicast routes point at.
    async fn update_devices_from_routes(
        &self,
        devices: &mut BTreeSet<String>,
        l3_dev_ok: bool,
        routes: &[Route],
    ) {
        let mut link_infos: BTreeMap<u32, LinkInfo> = BTreeMap::new();
        for route in routes {
            // Skip loopback, multicast and link-local routes.
            if let Some(dst) = &route.destination
                && !is_global_unicast(dst)
            {
                continue;
            }
            if route.table == RT_TABLE_LOCAL {
                continue;
            }
            let info = link_infos.entry(route.link_index).or_default();
            info.has_default_route |= route.is_default();
        }

        let classifier = ViabilityClassifier::new(self.kernel.as_ref(), &self.filter, self.families);
        for (index, info) in link_infos {
            let link = match self.kernel.link_by_index(index).await {
                Ok(link) => link,
                Err(e) => {
                    warn!(link_index = index, error = %e, "Failed to get link by index");
                    continue;
                }
            };

            if devices.contains(&link.name) {
                continue;
            }

            if classifier
                .is_viable(l3_dev_ok, info.has_default_route, &link)
                .await
            {
                devices.insert(link.name);
            } else {
                debug!(device = %link.name, "Skipping unviable device");
            }
        }
    }

    /// Find the link holding the node's Kubernetes IP.
    async fn find_node_ip_link(&self) -> Result<Link> {
        let node_ip = self.node.k8s_node_ip().ok_or(DeviceError::NodeIpUnknown)?;

        let addrs = match self.kernel.addresses(None, AddrFamily::of(&node_ip)).await {
            Ok(addrs) => addrs,
            Err(e) => {
                warn!(error = %e, "Failed to list addresses for node IP lookup");
                return Err(DeviceError::NodeDeviceNotFound);
            }
        };

        for addr in addrs.iter().filter(|a| a.ip == node_ip) {
            let link = self.kernel.link_by_index(addr.link_index).await?;
            if link.name == HOST_DEVICE {
                continue;
            }
            return Ok(link);
        }
        Err(DeviceError::NodeDeviceNotFound)
    }

    /// Start watching the host for device changes.
    ///
    /// Devices removed since [`detect`](Self::detect) are dropped right away.
    /// Afterwards the static device check runs on every interval until a
    /// message arrives on `shutdown` or its sender is dropped. Every change
    /// publishes the full sorted device list; only the latest list is kept.
    pub async fn listen(self: &Arc<Self>, shutdown: mpsc::Receiver<()>) -> DeviceWatcher {
        let links = self.kernel.links().await;

        let mut state = self.state.lock().await;
        let (updates_tx, updates_rx) = watch::channel(state.device_list());

        match links {
            Ok(links) => {
                let on_host: HashSet<&str> = links.iter().map(|l| l.name.as_str()).collect();
                let before = state.devices.len();
                state.devices.retain(|name| on_host.contains(name.as_str()));
                if state.devices.len() != before {
                    let devices = state.device_list();
                    info!(devices = ?devices, "Devices changed");
                    updates_tx.send_replace(devices);
                }
            }
            Err(e) => warn!(error = %e, "Failed to list links, skip removed device check"),
        }
        drop(state);

        let manager = Arc::clone(self);
        let task = tokio::spawn(async move {
            manager.watch_loop(updates_tx, shutdown).await;
        });

        DeviceWatcher {
            updates: updates_rx,
            task,
        }
    }

    async fn watch_loop(
        self: Arc<Self>,
        updates: watch::Sender<Vec<String>>,
        mut shutdown: mpsc::Receiver<()>,
    ) {
        info!(interval = ?self.check_interval, "Listening for device changes");
        let mut ticker = time::interval_at(Instant::now() + self.check_interval, self.check_interval);
        // A slow tick postpones the next one instead of triggering a burst.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("Shutdown requested, stop listening for device changes");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let (changed, devices) = {
                let mut state = self.state.lock().await;
                let changed = self.reconcile(&mut state.devices).await;
                (changed, state.device_list())
            };

            if changed {
                info!(devices = ?devices, "Devices changed");
                updates.send_replace(devices);
            }
        }
    }

    /// Run one static device check. Returns whether the device set changed
    /// or a tracked device needs its programs re-attached.
    pub async fn check_static_devices(&self) -> bool {
        let mut state = self.state.lock().await;
        self.reconcile(&mut state.devices).await
    }

    async fn reconcile(&self, devices: &mut BTreeSet<String>) -> bool {
        let kernel = self.kernel.as_ref();

        let mut patterns: BTreeSet<String> = self.user_devices.iter().cloned().collect();
        match read_dynamic_devices(&self.dynamic_devices_dir) {
            Ok(dynamic) => patterns.extend(dynamic),
            Err(e) => error!(error = %e, "Failed to read dynamic devices, skip"),
        }
        let filter = DeviceFilter::new(patterns.into_iter().collect());
        if filter.is_empty() {
            return false;
        }

        let links = match kernel.links().await {
            Ok(links) => links,
            Err(e) => {
                error!(error = %e, "Static device check failed, skip");
                return false;
            }
        };

        let mut changed = false;
        let mut on_host: HashMap<String, Link> = HashMap::new();

        for link in links {
            let name = link.name.clone();
            if excluded_prefix(&name).is_some()
                || !filter.matches(&name, kernel, self.families).await
            {
                if devices.remove(&name) {
                    info!(device = %name, "Device no longer matches device filter, removed");
                    changed = true;
                }
                continue;
            }

            if !devices.contains(&name) {
                info!(device = %name, "Static device config lost, load again");
                devices.insert(name.clone());
                changed = true;
            } else if tc_hooks_lost(kernel, &link).await {
                info!(device = %name, "Static device tc filter lost, load again");
                changed = true;
            }
            on_host.insert(name, link);
        }

        let before = devices.len();
        devices.retain(|name| {
            let exists = on_host.contains_key(name);
            if !exists {
                info!(device = %name, "Static device lost on host, removed");
            }
            exists
        });
        changed |= devices.len() != before;

        // Only the primary IPv4 address is compared.
        let recorded = self.node.masquerade_ipv4_addrs();
        for name in devices.iter() {
            let Some(old) = recorded.get(name) else {
                warn!(device = %name, "Can't get old address, skip");
                continue;
            };
            let Some(link) = on_host.get(name) else {
                continue;
            };
            let addrs = match kernel.addresses(Some(link.index), AddrFamily::V4).await {
                Ok(addrs) => addrs,
                Err(e) => {
                    warn!(device = %name, error = %e, "Can't list address");
                    continue;
                }
            };

            let unchanged = addrs
                .iter()
                .filter(|a| a.is_primary())
                .any(|a| a.ip == IpAddr::V4(*old));
            if !unchanged {
                let current: Vec<IpAddr> = addrs.iter().map(|a| a.ip).collect();
                warn!(device = %name, old = %old, current = ?current, "Address changed");
                changed = true;
            }
        }

        changed
    }
}

/// Handle to a running device watch.
pub struct DeviceWatcher {
    updates: watch::Receiver<Vec<String>>,
    task: JoinHandle<()>,
}

impl DeviceWatcher {
    /// Receiver of device list updates. Holds the latest list only.
    pub fn updates(&self) -> watch::Receiver<Vec<String>> {
        self.updates.clone()
    }

    /// Wait for the next device list. Returns `None` once the watch stopped.
    pub async fn next(&mut self) -> Option<Vec<String>> {
        self.updates.changed().await.ok()?;
        Some(self.updates.borrow_and_update().clone())
    }

    /// Wait for the watch task to finish.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!(error = %e, "Device watch task failed");
        }
    }
}
