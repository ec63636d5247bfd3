//! mvirt-devices: host network device detection for the mvirt datapath.
//!
//! Decides which host interfaces datapath programs attach to and keeps that
//! set in sync with the host.
//!
//! # Architecture
//!
//! ```text
//! DeviceConfig --> DeviceManager::detect() --> DetectionResult
//!                        |
//!                        +--> KernelState (links, routes, addresses, TC filters)
//!                        +--> FeatureProbe (bpftool)
//!                        +--> NodeAddressing (node IP, masquerade addresses)
//!
//! DeviceManager::listen() --> every interval: static device check
//!                        |
//!                        +--> watch channel of sorted device lists
//! ```

pub mod command;
pub mod config;
pub mod dynamic;
pub mod error;
pub mod filter;
pub mod kernel;
pub mod manager;
pub mod netlink;
pub mod node;
pub mod probe;
pub mod tc;
pub mod viability;

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

// Re-export commonly used types
pub use config::{AddressFamilies, DeviceConfig, NodeConfig};
pub use error::{DeviceError, KernelError};
pub use kernel::KernelState;
pub use manager::{DetectionResult, DeviceManager, DeviceWatcher};
pub use netlink::NetlinkState;
pub use node::{NodeAddressing, StaticNodeAddressing};
pub use probe::{BpftoolProbe, FeatureProbe};
