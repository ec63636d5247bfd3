//! Test utilities for mvirt-devices integration tests.
//!
//! Provides an in-memory host whose links, routes, addresses and TC filters
//! can be changed while a [`DeviceManager`](crate::DeviceManager) watches it.

use crate::error::KernelError;
use crate::kernel::{
    AddrFamily, Address, IpFamily, KernelState, Link, LinkKind, Result, Route, TcFilter,
};
use crate::probe::FeatureProbe;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Create an up, multicast-capable Ethernet link.
pub fn test_link(index: u32, name: &str) -> Link {
    Link {
        index,
        name: name.to_string(),
        flags: (libc::IFF_UP | libc::IFF_BROADCAST | libc::IFF_MULTICAST) as u32,
        kind: LinkKind::Other(String::new()),
        master_index: None,
        hardware_addr: vec![0x52, 0x54, 0x00, 0x12, 0x34, index as u8],
    }
}

/// A bpf TC filter carrying a datapath program.
pub fn datapath_filter(program: &str) -> TcFilter {
    TcFilter {
        kind: "bpf".to_string(),
        name: format!("{program}.o:[from-netdev]"),
    }
}

#[derive(Default)]
struct FakeHost {
    links: Vec<Link>,
    routes: Vec<Route>,
    addresses: Vec<Address>,
    tc_filters: HashMap<(u32, u32), Vec<TcFilter>>,
    fail_link_list: bool,
    fail_route_list: bool,
    fail_tc_list: bool,
    link_list_delay: Option<Duration>,
}

/// In-memory [`KernelState`].
#[derive(Default)]
pub struct FakeKernel {
    host: Mutex<FakeHost>,
    route_list_calls: AtomicUsize,
    link_list_calls: AtomicUsize,
}

impl FakeKernel {
    pub fn new() -> Self {
        Self::default()
    }

    fn host(&self) -> std::sync::MutexGuard<'_, FakeHost> {
        self.host.lock().unwrap()
    }

    pub fn add_link(&self, link: Link) {
        self.host().links.push(link);
    }

    /// Remove a link together with its routes, addresses and filters.
    pub fn remove_link(&self, name: &str) {
        let mut host = self.host();
        let Some(pos) = host.links.iter().position(|l| l.name == name) else {
            return;
        };
        let index = host.links.remove(pos).index;
        host.routes.retain(|r| r.link_index != index);
        host.addresses.retain(|a| a.link_index != index);
        host.tc_filters.retain(|(i, _), _| *i != index);
    }

    pub fn add_address(&self, link_index: u32, ip: IpAddr) {
        self.add_address_with_flags(link_index, ip, 0);
    }

    pub fn add_address_with_flags(&self, link_index: u32, ip: IpAddr, flags: u32) {
        self.host().addresses.push(Address {
            link_index,
            ip,
            flags,
        });
    }

    pub fn clear_addresses(&self, link_index: u32) {
        self.host().addresses.retain(|a| a.link_index != link_index);
    }

    pub fn add_route(&self, destination: Option<IpAddr>, table: u32, link_index: u32) {
        self.host().routes.push(Route {
            destination,
            table,
            link_index,
        });
    }

    pub fn set_tc_filters(&self, link_index: u32, parent: u32, filters: Vec<TcFilter>) {
        self.host().tc_filters.insert((link_index, parent), filters);
    }

    pub fn fail_link_list(&self, fail: bool) {
        self.host().fail_link_list = fail;
    }

    pub fn fail_route_list(&self, fail: bool) {
        self.host().fail_route_list = fail;
    }

    pub fn fail_tc_list(&self, fail: bool) {
        self.host().fail_tc_list = fail;
    }

    /// Make the next link listing take `delay`.
    pub fn delay_next_link_list(&self, delay: Duration) {
        self.host().link_list_delay = Some(delay);
    }

    /// Number of link listings performed so far.
    pub fn link_list_calls(&self) -> usize {
        self.link_list_calls.load(Ordering::SeqCst)
    }

    /// Number of route listings performed so far.
    pub fn route_list_calls(&self) -> usize {
        self.route_list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KernelState for FakeKernel {
    async fn links(&self) -> Result<Vec<Link>> {
        self.link_list_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.host().link_list_delay.take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let host = self.host();
        if host.fail_link_list {
            return Err(KernelError::Netlink("link dump failed".into()));
        }
        Ok(host.links.clone())
    }

    async fn link_by_index(&self, index: u32) -> Result<Link> {
        self.host()
            .links
            .iter()
            .find(|l| l.index == index)
            .cloned()
            .ok_or_else(|| KernelError::LinkNotFound(index.to_string()))
    }

    async fn link_by_name(&self, name: &str) -> Result<Link> {
        self.host()
            .links
            .iter()
            .find(|l| l.name == name)
            .cloned()
            .ok_or_else(|| KernelError::LinkNotFound(name.to_string()))
    }

    async fn routes(&self, family: IpFamily) -> Result<Vec<Route>> {
        self.route_list_calls.fetch_add(1, Ordering::SeqCst);
        let host = self.host();
        if host.fail_route_list {
            return Err(KernelError::Netlink("route dump failed".into()));
        }
        Ok(host
            .routes
            .iter()
            .filter(|r| match (family, r.destination) {
                (IpFamily::All, _) | (_, None) => true,
                (IpFamily::V4, Some(ip)) => ip.is_ipv4(),
                (IpFamily::V6, Some(ip)) => ip.is_ipv6(),
            })
            .cloned()
            .collect())
    }

    async fn addresses(&self, link_index: Option<u32>, family: AddrFamily) -> Result<Vec<Address>> {
        Ok(self
            .host()
            .addresses
            .iter()
            .filter(|a| link_index.is_none_or(|i| a.link_index == i))
            .filter(|a| AddrFamily::of(&a.ip) == family)
            .cloned()
            .collect())
    }

    async fn tc_filters(&self, link: &Link, parent: u32) -> Result<Vec<TcFilter>> {
        let host = self.host();
        if host.fail_tc_list {
            return Err(KernelError::CommandFailed("tc", "Cannot find device".into()));
        }
        Ok(host
            .tc_filters
            .get(&(link.index, parent))
            .cloned()
            .unwrap_or_default())
    }
}

/// [`FeatureProbe`] with a fixed answer.
pub struct StaticProbe(pub bool);

#[async_trait]
impl FeatureProbe for StaticProbe {
    async fn has_helper(&self, _prog_type: &str, _helper: &str) -> bool {
        self.0
    }
}
