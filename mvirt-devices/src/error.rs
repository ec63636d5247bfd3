//! Error types for device detection.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by a [`KernelState`](crate::kernel::KernelState) implementation.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("Netlink request failed: {0}")]
    Netlink(String),

    #[error("Link not found: {0}")]
    LinkNotFound(String),

    #[error("Failed to open network namespace {}: {1}", .0.display())]
    Netns(PathBuf, io::Error),

    #[error("Failed to execute {0}: {1}")]
    Command(&'static str, io::Error),

    #[error("{0} failed: {1}")]
    CommandFailed(&'static str, String),

    #[error("{0} did not finish within {1:?}")]
    CommandTimeout(&'static str, Duration),

    #[error("Malformed {0} output: {1}")]
    Output(&'static str, serde_json::Error),
}

impl KernelError {
    pub(crate) fn netlink(e: impl std::fmt::Display) -> Self {
        KernelError::Netlink(e.to_string())
    }
}

/// Device detection errors.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Cannot retrieve routes for device detection: {0}")]
    RouteList(#[source] KernelError),

    #[error("Device wildcard expansion failed to fetch devices: {0}")]
    WildcardLinkList(#[source] KernelError),

    #[error("Device wildcard expansion failed to detect devices. Please verify --{0} option.")]
    WildcardNoMatch(String),

    #[error("Failed to find K8s node device as node IP is not known")]
    NodeIpUnknown,

    #[error("K8s node device not found")]
    NodeDeviceNotFound,

    #[error("K8s is enabled, but still failed to find node IP: {0}")]
    K8sNodeIp(#[source] Box<DeviceError>),

    #[error("Unable to determine direct routing device. Use --direct-routing-device to specify it")]
    DirectRoutingDevice,

    #[error("Unable to determine multicast device. Use --ipv6-mcast-device to specify it")]
    MulticastDevice,

    #[error(transparent)]
    Kernel(#[from] KernelError),

    #[error("Failed to read config {}: {1}", .0.display())]
    ConfigRead(PathBuf, io::Error),

    #[error("Failed to parse config {}: {1}", .0.display())]
    ConfigParse(PathBuf, serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DeviceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_are_capitalized() {
        let kernel = || KernelError::Netlink("dump interrupted".into());
        let errors = [
            DeviceError::RouteList(kernel()),
            DeviceError::WildcardLinkList(kernel()),
            DeviceError::WildcardNoMatch("devices".into()),
            DeviceError::NodeIpUnknown,
            DeviceError::NodeDeviceNotFound,
            DeviceError::K8sNodeIp(Box::new(DeviceError::NodeIpUnknown)),
            DeviceError::DirectRoutingDevice,
            DeviceError::MulticastDevice,
            DeviceError::ConfigRead(PathBuf::from("/etc/devices.json"), io::ErrorKind::NotFound.into()),
        ];

        for err in errors {
            let msg = err.to_string();
            assert!(msg.starts_with(char::is_uppercase), "{msg}");
        }
    }

    #[test]
    fn test_messages_name_the_option() {
        assert!(
            DeviceError::WildcardNoMatch("direct-routing-device".into())
                .to_string()
                .contains("--direct-routing-device")
        );
        assert!(DeviceError::MulticastDevice.to_string().contains("--ipv6-mcast-device"));
        assert_eq!(
            KernelError::CommandTimeout("tc", Duration::from_secs(10)).to_string(),
            "tc did not finish within 10s"
        );
    }
}
