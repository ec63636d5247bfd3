//! Kernel network state as seen by device detection.
//!
//! [`KernelState`] is the narrow view the detector needs: links, routes,
//! addresses and TC filters of one network namespace. The production
//! implementation lives in [`crate::netlink`].

use crate::error::KernelError;
use async_trait::async_trait;
use std::net::IpAddr;

/// Kernel local routing table (`RT_TABLE_LOCAL`).
pub const RT_TABLE_LOCAL: u32 = 255;

pub type Result<T> = std::result::Result<T, KernelError>;

/// Link type as reported by the kernel's `IFLA_INFO_KIND`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkKind {
    Veth,
    Bridge,
    OpenVSwitch,
    Bond,
    Team,
    /// Any other kind, or no kind at all (physical NICs).
    Other(String),
}

impl LinkKind {
    pub fn from_kind(kind: &str) -> Self {
        match kind {
            "veth" => LinkKind::Veth,
            "bridge" => LinkKind::Bridge,
            "openvswitch" => LinkKind::OpenVSwitch,
            "bond" => LinkKind::Bond,
            "team" => LinkKind::Team,
            other => LinkKind::Other(other.to_string()),
        }
    }

    /// Bridges and virtual switches.
    pub fn is_bridge_like(&self) -> bool {
        matches!(self, LinkKind::Bridge | LinkKind::OpenVSwitch)
    }

    /// Bonded or team aggregation devices.
    pub fn is_aggregate(&self) -> bool {
        matches!(self, LinkKind::Bond | LinkKind::Team)
    }
}

/// A network link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub index: u32,
    pub name: String,
    /// Raw `IFF_*` flags.
    pub flags: u32,
    pub kind: LinkKind,
    /// Index of the master device, if enslaved.
    pub master_index: Option<u32>,
    /// Hardware address; empty for L3-only devices.
    pub hardware_addr: Vec<u8>,
}

impl Link {
    pub fn has_flags(&self, mask: u32) -> bool {
        self.flags & mask != 0
    }

    pub fn has_mac_addr(&self) -> bool {
        !self.hardware_addr.is_empty()
    }
}

/// A route from any routing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// `None` for a default route.
    pub destination: Option<IpAddr>,
    pub table: u32,
    /// Output interface index.
    pub link_index: u32,
}

impl Route {
    pub fn is_default(&self) -> bool {
        self.destination.is_none()
    }
}

/// An interface address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub link_index: u32,
    pub ip: IpAddr,
    /// Raw `IFA_F_*` flags.
    pub flags: u32,
}

impl Address {
    /// Whether this is the primary address, i.e. neither secondary nor deprecated.
    pub fn is_primary(&self) -> bool {
        self.flags & (libc::IFA_F_SECONDARY | libc::IFA_F_DEPRECATED) == 0
    }
}

/// A traffic-control filter attached to a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcFilter {
    /// Classifier kind, e.g. "bpf" or "u32".
    pub kind: String,
    /// Attached program name for bpf filters.
    pub name: String,
}

/// Route listing family selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    All,
    V4,
    V6,
}

/// Address family for address listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrFamily {
    V4,
    V6,
}

impl AddrFamily {
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => AddrFamily::V4,
            IpAddr::V6(_) => AddrFamily::V6,
        }
    }
}

/// Read access to the kernel's network state of one namespace.
#[async_trait]
pub trait KernelState: Send + Sync {
    /// List all links.
    async fn links(&self) -> Result<Vec<Link>>;

    /// Resolve a link by interface index.
    async fn link_by_index(&self, index: u32) -> Result<Link>;

    /// Resolve a link by name.
    async fn link_by_name(&self, name: &str) -> Result<Link>;

    /// List routes of all routing tables.
    async fn routes(&self, family: IpFamily) -> Result<Vec<Route>>;

    /// List addresses of one link, or of all links if `link_index` is `None`.
    async fn addresses(&self, link_index: Option<u32>, family: AddrFamily) -> Result<Vec<Address>>;

    /// List TC filters of a link under the given parent handle.
    async fn tc_filters(&self, link: &Link, parent: u32) -> Result<Vec<TcFilter>>;
}

/// Whether `ip` is a global unicast address: not unspecified, loopback,
/// multicast, link-local or the IPv4 limited broadcast address.
pub fn is_global_unicast(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_unspecified()
                || v4.is_loopback()
                || v4.is_multicast()
                || v4.is_link_local()
                || v4.is_broadcast())
        }
        IpAddr::V6(v6) => {
            !(v6.is_unspecified()
                || v6.is_loopback()
                || v6.is_multicast()
                || (v6.segments()[0] & 0xffc0) == 0xfe80)
        }
    }
}
