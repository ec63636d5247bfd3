//! Device name filtering and wildcard expansion.
//!
//! A pattern is either an exact device name or a prefix followed by `+`
//! (e.g. `eth+`). Wildcards only match devices that carry an address in
//! every enabled address family.

use crate::config::AddressFamilies;
use crate::error::{DeviceError, Result};
use crate::kernel::{AddrFamily, KernelState, Link};
use std::collections::BTreeSet;
use tracing::{error, info, warn};

/// Wildcard suffix of a device pattern.
pub const WILDCARD_SUFFIX: char = '+';

/// Returns the prefix of a wildcard pattern, or `None` for exact names.
pub fn wildcard_prefix(pattern: &str) -> Option<&str> {
    if pattern.ends_with(WILDCARD_SUFFIX) {
        Some(pattern.trim_end_matches(WILDCARD_SUFFIX))
    } else {
        None
    }
}

/// User-supplied device name patterns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceFilter(Vec<String>);

impl DeviceFilter {
    pub fn new(patterns: Vec<String>) -> Self {
        Self(patterns)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether `name` matches any pattern. An empty filter matches everything.
    pub async fn matches(
        &self,
        name: &str,
        kernel: &dyn KernelState,
        families: AddressFamilies,
    ) -> bool {
        if self.0.is_empty() {
            return true;
        }
        for pattern in &self.0 {
            if let Some(prefix) = wildcard_prefix(pattern) {
                if name.starts_with(prefix) && device_has_ip(kernel, name, families).await {
                    return true;
                }
                continue;
            }
            if name == pattern.trim() {
                return true;
            }
        }
        false
    }
}

/// Whether the device has at least one address in every enabled family.
pub async fn device_has_ip(kernel: &dyn KernelState, name: &str, families: AddressFamilies) -> bool {
    let link = match kernel.link_by_name(name).await {
        Ok(link) => link,
        Err(e) => {
            info!(device = name, error = %e, "Device lookup failed, skip");
            return false;
        }
    };

    if families.ipv4 && !link_has_addrs(kernel, &link, AddrFamily::V4).await {
        return false;
    }
    if families.ipv6 && !link_has_addrs(kernel, &link, AddrFamily::V6).await {
        return false;
    }
    true
}

async fn link_has_addrs(kernel: &dyn KernelState, link: &Link, family: AddrFamily) -> bool {
    match kernel.addresses(Some(link.index), family).await {
        Ok(addrs) if addrs.is_empty() => {
            warn!(device = %link.name, ?family, "No IP configured on device, skip");
            false
        }
        Ok(_) => true,
        Err(e) => {
            error!(device = %link.name, error = %e, "Failed to list device addresses, skip");
            false
        }
    }
}

/// Expand wildcard patterns into the sorted names of matching live devices.
///
/// Exact names pass through unchanged. `option` names the setting the
/// patterns came from and is used in the error when nothing matched.
pub async fn expand_device_wildcards(
    kernel: &dyn KernelState,
    devices: &[String],
    option: &str,
    families: AddressFamilies,
) -> Result<Vec<String>> {
    let links = kernel.links().await.map_err(DeviceError::WildcardLinkList)?;

    let mut expanded = BTreeSet::new();
    for pattern in devices {
        match wildcard_prefix(pattern) {
            Some(prefix) => {
                for link in &links {
                    if link.name.starts_with(prefix)
                        && device_has_ip(kernel, &link.name, families).await
                    {
                        expanded.insert(link.name.clone());
                    }
                }
            }
            None => {
                expanded.insert(pattern.clone());
            }
        }
    }

    // Fail rather than silently falling back to auto-detection.
    if !devices.is_empty() && expanded.is_empty() {
        return Err(DeviceError::WildcardNoMatch(option.to_string()));
    }

    Ok(expanded.into_iter().collect())
}
