//! Netlink-backed kernel state.
//!
//! Links, routes and addresses are read via rtnetlink. TC filters are read
//! from `tc -j filter show`, entering the target namespace with `nsenter`.

use crate::command::{self, COMMAND_TIMEOUT};
use crate::error::KernelError;
use crate::kernel::{
    AddrFamily, Address, IpFamily, KernelState, Link, LinkKind, Result, Route, TcFilter,
};
use crate::tc::{format_handle, parse_tc_filters};
use async_trait::async_trait;
use futures::TryStreamExt;
use netlink_packet_route::address::{AddressAttribute, AddressFlag, AddressMessage};
use netlink_packet_route::link::{InfoKind, LinkAttribute, LinkFlag, LinkInfo, LinkMessage};
use netlink_packet_route::route::{RouteAddress, RouteAttribute, RouteMessage};
use nix::sched::{CloneFlags, setns};
use rtnetlink::{Handle, IpVersion};
use std::fs::File;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

/// Kernel state of the current, or a given, network namespace.
pub struct NetlinkState {
    handle: Handle,
    netns: Option<PathBuf>,
}

impl NetlinkState {
    /// Connect to the network namespace of the calling process.
    pub fn new() -> Result<Self> {
        let (connection, handle, _) = rtnetlink::new_connection().map_err(KernelError::netlink)?;
        tokio::spawn(connection);

        Ok(Self {
            handle,
            netns: None,
        })
    }

    /// Connect to the network namespace at `path`, e.g. `/var/run/netns/foo`.
    ///
    /// The netlink socket is opened from a helper thread that joined the
    /// namespace; the calling thread's namespace is left untouched.
    pub fn in_netns(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| KernelError::Netns(path.to_path_buf(), e))?;
        let runtime = tokio::runtime::Handle::current();
        let ns_path = path.to_path_buf();

        let (connection, handle) = std::thread::spawn(move || {
            let _guard = runtime.enter();
            setns(&file, CloneFlags::CLONE_NEWNET)
                .map_err(|e| KernelError::Netns(ns_path, e.into()))?;
            let (connection, handle, _) =
                rtnetlink::new_connection().map_err(KernelError::netlink)?;
            Ok::<_, KernelError>((connection, handle))
        })
        .join()
        .map_err(|_| KernelError::Netlink("netns helper thread panicked".to_string()))??;
        tokio::spawn(connection);

        debug!(netns = %path.display(), "Connected to network namespace");
        Ok(Self {
            handle,
            netns: Some(path.to_path_buf()),
        })
    }

    async fn routes_of(&self, version: IpVersion) -> Result<Vec<Route>> {
        let mut stream = self.handle.route().get(version).execute();
        let mut routes = Vec::new();
        while let Some(msg) = stream.try_next().await.map_err(KernelError::netlink)? {
            if let Some(route) = route_from_message(&msg) {
                routes.push(route);
            }
        }
        Ok(routes)
    }

    async fn tc(&self, args: &[String]) -> Result<Vec<u8>> {
        let mut cmd = match &self.netns {
            Some(path) => {
                let mut cmd = Command::new("nsenter");
                cmd.arg(format!("--net={}", path.display())).arg("tc");
                cmd
            }
            None => Command::new("tc"),
        };

        cmd.args(args);
        command::run(cmd, "tc", COMMAND_TIMEOUT).await
    }
}

#[async_trait]
impl KernelState for NetlinkState {
    async fn links(&self) -> Result<Vec<Link>> {
        let mut stream = self.handle.link().get().execute();
        let mut links = Vec::new();
        while let Some(msg) = stream.try_next().await.map_err(KernelError::netlink)? {
            links.push(link_from_message(&msg));
        }
        Ok(links)
    }

    async fn link_by_index(&self, index: u32) -> Result<Link> {
        let mut stream = self.handle.link().get().match_index(index).execute();
        match stream.try_next().await {
            Ok(Some(msg)) => Ok(link_from_message(&msg)),
            Ok(None) => Err(KernelError::LinkNotFound(index.to_string())),
            Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -libc::ENODEV => {
                Err(KernelError::LinkNotFound(index.to_string()))
            }
            Err(e) => Err(KernelError::netlink(e)),
        }
    }

    async fn link_by_name(&self, name: &str) -> Result<Link> {
        let mut stream = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match stream.try_next().await {
            Ok(Some(msg)) => Ok(link_from_message(&msg)),
            Ok(None) => Err(KernelError::LinkNotFound(name.to_string())),
            Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -libc::ENODEV => {
                Err(KernelError::LinkNotFound(name.to_string()))
            }
            Err(e) => Err(KernelError::netlink(e)),
        }
    }

    async fn routes(&self, family: IpFamily) -> Result<Vec<Route>> {
        match family {
            IpFamily::V4 => self.routes_of(IpVersion::V4).await,
            IpFamily::V6 => self.routes_of(IpVersion::V6).await,
            IpFamily::All => {
                let mut routes = self.routes_of(IpVersion::V4).await?;
                routes.extend(self.routes_of(IpVersion::V6).await?);
                Ok(routes)
            }
        }
    }

    async fn addresses(&self, link_index: Option<u32>, family: AddrFamily) -> Result<Vec<Address>> {
        let mut request = self.handle.address().get();
        if let Some(index) = link_index {
            request = request.set_link_index_filter(index);
        }

        let mut stream = request.execute();
        let mut addrs = Vec::new();
        while let Some(msg) = stream.try_next().await.map_err(KernelError::netlink)? {
            if let Some(addr) = address_from_message(&msg)
                && AddrFamily::of(&addr.ip) == family
            {
                addrs.push(addr);
            }
        }
        Ok(addrs)
    }

    async fn tc_filters(&self, link: &Link, parent: u32) -> Result<Vec<TcFilter>> {
        let args = [
            "-j".to_string(),
            "filter".to_string(),
            "show".to_string(),
            "dev".to_string(),
            link.name.clone(),
            "parent".to_string(),
            format_handle(parent),
        ];
        let output = self.tc(&args).await?;
        parse_tc_filters(&output)
    }
}

fn link_flag_bits(flag: &LinkFlag) -> u32 {
    let bits = match flag {
        LinkFlag::Up => libc::IFF_UP,
        LinkFlag::Broadcast => libc::IFF_BROADCAST,
        LinkFlag::Loopback => libc::IFF_LOOPBACK,
        LinkFlag::Controller => libc::IFF_MASTER,
        LinkFlag::Port => libc::IFF_SLAVE,
        LinkFlag::Multicast => libc::IFF_MULTICAST,
        LinkFlag::Other(bits) => return *bits,
        _ => 0,
    };
    bits as u32
}

fn link_kind(info: &[LinkInfo]) -> LinkKind {
    for item in info {
        if let LinkInfo::Kind(kind) = item {
            return match kind {
                InfoKind::Veth => LinkKind::Veth,
                InfoKind::Bridge => LinkKind::Bridge,
                InfoKind::Bond => LinkKind::Bond,
                InfoKind::Other(name) => LinkKind::from_kind(name),
                other => LinkKind::from_kind(&format!("{other:?}").to_lowercase()),
            };
        }
    }
    LinkKind::Other(String::new())
}

fn link_from_message(msg: &LinkMessage) -> Link {
    let mut link = Link {
        index: msg.header.index,
        name: String::new(),
        flags: msg.header.flags.iter().map(link_flag_bits).fold(0, |acc, b| acc | b),
        kind: LinkKind::Other(String::new()),
        master_index: None,
        hardware_addr: Vec::new(),
    };

    for attr in &msg.attributes {
        match attr {
            LinkAttribute::IfName(name) => link.name = name.clone(),
            LinkAttribute::Address(addr) => link.hardware_addr = addr.clone(),
            LinkAttribute::Controller(index) => link.master_index = Some(*index),
            LinkAttribute::LinkInfo(info) => link.kind = link_kind(info),
            _ => {}
        }
    }
    link
}

fn route_from_message(msg: &RouteMessage) -> Option<Route> {
    let mut destination = None;
    let mut table = u32::from(msg.header.table);
    let mut link_index = None;

    for attr in &msg.attributes {
        match attr {
            RouteAttribute::Destination(RouteAddress::Inet(ip)) => {
                destination = Some(IpAddr::V4(*ip))
            }
            RouteAttribute::Destination(RouteAddress::Inet6(ip)) => {
                destination = Some(IpAddr::V6(*ip))
            }
            RouteAttribute::Oif(index) => link_index = Some(*index),
            RouteAttribute::Table(id) => table = *id,
            _ => {}
        }
    }

    if msg.header.destination_prefix_length == 0 {
        destination = None;
    }

    Some(Route {
        destination,
        table,
        link_index: link_index?,
    })
}

fn address_from_message(msg: &AddressMessage) -> Option<Address> {
    let mut local = None;
    let mut address = None;
    let mut flags = 0;

    for attr in &msg.attributes {
        match attr {
            AddressAttribute::Local(ip) => local = Some(*ip),
            AddressAttribute::Address(ip) => address = Some(*ip),
            AddressAttribute::Flags(list) => {
                for flag in list {
                    match flag {
                        AddressFlag::Secondary => flags |= libc::IFA_F_SECONDARY,
                        AddressFlag::Deprecated => flags |= libc::IFA_F_DEPRECATED,
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    Some(Address {
        link_index: msg.header.index,
        ip: local.or(address)?,
        flags,
    })
}
