//! Node address lookup.

use crate::config::NodeConfig;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};

/// Addresses the node subsystem knows about this host.
pub trait NodeAddressing: Send + Sync {
    /// The node's primary IP as registered with Kubernetes.
    fn k8s_node_ip(&self) -> Option<IpAddr>;

    /// Masquerade IPv4 address recorded per device.
    fn masquerade_ipv4_addrs(&self) -> HashMap<String, Ipv4Addr>;
}

/// Node addresses taken from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticNodeAddressing {
    node_ip: Option<IpAddr>,
    masquerade: HashMap<String, Ipv4Addr>,
}

impl StaticNodeAddressing {
    pub fn new(node_ip: Option<IpAddr>) -> Self {
        Self {
            node_ip,
            masquerade: HashMap::new(),
        }
    }

    pub fn with_masquerade(mut self, device: &str, addr: Ipv4Addr) -> Self {
        self.masquerade.insert(device.to_string(), addr);
        self
    }
}

impl From<&NodeConfig> for StaticNodeAddressing {
    fn from(config: &NodeConfig) -> Self {
        Self {
            node_ip: config.k8s_node_ip,
            masquerade: config.masquerade_ipv4.clone(),
        }
    }
}

impl NodeAddressing for StaticNodeAddressing {
    fn k8s_node_ip(&self) -> Option<IpAddr> {
        self.node_ip
    }

    fn masquerade_ipv4_addrs(&self) -> HashMap<String, Ipv4Addr> {
        self.masquerade.clone()
    }
}
