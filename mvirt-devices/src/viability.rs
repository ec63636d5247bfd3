//! Device viability rules.
//!
//! Auto-detection has to be conservative: attaching datapath programs to an
//! interface that never carries cluster traffic breaks connectivity.

use crate::config::AddressFamilies;
use crate::filter::DeviceFilter;
use crate::kernel::{KernelState, Link, LinkKind};
use tracing::{debug, info};

/// Name prefixes of devices that are never selected: loopback, the
/// datapath's own devices and devices owned by container runtimes.
pub const EXCLUDED_DEVICE_PREFIXES: [&str; 5] = ["cilium_", "lo", "lxc", "cni", "docker"];

/// Devices with any of these flags are never selected.
pub const EXCLUDED_IF_FLAGS: u32 = (libc::IFF_SLAVE | libc::IFF_LOOPBACK) as u32;

/// Returns the excluded prefix `name` starts with, if any.
pub fn excluded_prefix(name: &str) -> Option<&'static str> {
    EXCLUDED_DEVICE_PREFIXES
        .iter()
        .copied()
        .find(|p| name.starts_with(*p))
}

/// Decides whether a link is eligible for datapath attachment.
pub struct ViabilityClassifier<'a> {
    kernel: &'a dyn KernelState,
    filter: &'a DeviceFilter,
    families: AddressFamilies,
}

impl<'a> ViabilityClassifier<'a> {
    pub fn new(
        kernel: &'a dyn KernelState,
        filter: &'a DeviceFilter,
        families: AddressFamilies,
    ) -> Self {
        Self {
            kernel,
            filter,
            families,
        }
    }

    /// Whether programs should be attached to `link`.
    ///
    /// `l3_dev_ok` tells whether the kernel can handle devices without a MAC
    /// address; `has_default_route` whether a default route points at `link`.
    pub async fn is_viable(&self, l3_dev_ok: bool, has_default_route: bool, link: &Link) -> bool {
        let name = link.name.as_str();

        if let Some(prefix) = excluded_prefix(name) {
            debug!(device = name, prefix, "Skipping device as it has excluded prefix");
            return false;
        }

        if link.has_flags(EXCLUDED_IF_FLAGS) {
            debug!(
                device = name,
                flags = %format!("{:#x}", link.flags),
                "Skipping device as it has excluded flag"
            );
            return false;
        }

        if !l3_dev_ok && !link.has_mac_addr() {
            info!(device = name, "Ignoring L3 device; >= 5.8 kernel is required.");
            return false;
        }

        if !self.filter.matches(name, self.kernel, self.families).await {
            return false;
        }

        match link.kind {
            // Leftovers of other CNIs, unless they carry the default route
            // (e.g. kubernetes-in-docker).
            LinkKind::Veth if !has_default_route => {
                debug!(device = name, "Ignoring veth device as it has no default route");
                return false;
            }
            LinkKind::Bridge | LinkKind::OpenVSwitch => {
                debug!(device = name, "Ignoring bridge-like device");
                return false;
            }
            _ => {}
        }

        if let Some(master_index) = link.master_index.filter(|i| *i > 0)
            && let Ok(master) = self.kernel.link_by_index(master_index).await
        {
            if master.kind.is_bridge_like() {
                debug!(device = name, master = %master.name, "Ignoring device attached to bridge");
                return false;
            }
            if master.kind.is_aggregate() {
                debug!(device = name, master = %master.name, "Ignoring bonded device");
                return false;
            }
        }

        true
    }
}
