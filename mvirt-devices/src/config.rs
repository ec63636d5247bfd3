//! Device detection configuration.

use crate::error::{DeviceError, Result};
use crate::kernel::IpFamily;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory whose entries name additional wildcard device patterns.
pub const DYNAMIC_DEVICES_DIR: &str = "/etc/dynamic-devices";

/// Default interval of the static device check.
pub const STATIC_DEVICES_CHECK_INTERVAL_SECS: u64 = 30;

/// Settings consumed and rewritten by device detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DeviceConfig {
    /// Device names or `prefix+` wildcards. Empty means auto-detect.
    pub devices: Vec<String>,
    pub direct_routing_device: Option<String>,
    pub ipv6_mcast_device: Option<String>,

    pub enable_ipv4: bool,
    pub enable_ipv6: bool,
    pub enable_node_port: bool,
    pub enable_host_firewall: bool,
    pub enable_bandwidth_manager: bool,
    pub enable_host_legacy_routing: bool,
    pub enable_ipv6_ndp: bool,
    pub tunneling_enabled: bool,
    pub k8s_enabled: bool,

    pub dynamic_devices_dir: PathBuf,
    pub static_devices_check_interval_secs: u64,

    pub node: NodeConfig,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            direct_routing_device: None,
            ipv6_mcast_device: None,
            enable_ipv4: true,
            enable_ipv6: false,
            enable_node_port: false,
            enable_host_firewall: false,
            enable_bandwidth_manager: false,
            enable_host_legacy_routing: false,
            enable_ipv6_ndp: false,
            tunneling_enabled: true,
            k8s_enabled: false,
            dynamic_devices_dir: PathBuf::from(DYNAMIC_DEVICES_DIR),
            static_devices_check_interval_secs: STATIC_DEVICES_CHECK_INTERVAL_SECS,
            node: NodeConfig::default(),
        }
    }
}

/// Addresses of this node, as recorded by the node subsystem.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct NodeConfig {
    pub k8s_node_ip: Option<IpAddr>,
    /// Masquerade IPv4 address per device.
    pub masquerade_ipv4: HashMap<String, Ipv4Addr>,
}

/// Enabled address families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressFamilies {
    pub ipv4: bool,
    pub ipv6: bool,
}

impl AddressFamilies {
    /// Route family to list during detection.
    pub fn route_family(&self) -> IpFamily {
        match (self.ipv4, self.ipv6) {
            (true, false) => IpFamily::V4,
            (false, true) => IpFamily::V6,
            _ => IpFamily::All,
        }
    }
}

impl DeviceConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DeviceError::ConfigRead(path.to_path_buf(), e))?;
        serde_json::from_str(&content).map_err(|e| DeviceError::ConfigParse(path.to_path_buf(), e))
    }

    pub fn families(&self) -> AddressFamilies {
        AddressFamilies {
            ipv4: self.enable_ipv4,
            ipv6: self.enable_ipv6,
        }
    }

    /// Whether any enabled feature needs the device list.
    pub fn are_devices_required(&self) -> bool {
        self.enable_node_port || self.enable_host_firewall || self.enable_bandwidth_manager
    }

    /// Whether a direct routing device must be known.
    ///
    /// BPF NodePort and BPF host routing redirect to it. With tunneling,
    /// node-to-node traffic goes through the tunnel instead.
    pub fn direct_routing_device_required(&self) -> bool {
        (self.enable_node_port || !self.enable_host_legacy_routing) && !self.tunneling_enabled
    }

    pub fn static_devices_check_interval(&self) -> Duration {
        Duration::from_secs(self.static_devices_check_interval_secs)
    }
}
