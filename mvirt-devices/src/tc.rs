//! TC filter auditing.
//!
//! The datapath attaches its programs as bpf filters on the clsact ingress
//! and egress hooks of every device. Interface restarts or driver resets can
//! drop them silently; [`tc_hooks_lost`] detects that.

use crate::error::KernelError;
use crate::kernel::{KernelState, Link, TcFilter};
use serde::Deserialize;
use tracing::error;

/// clsact ingress pseudo-parent (`TC_H_CLSACT | TC_H_MIN_INGRESS`).
pub const TC_FILTER_PARENT_INGRESS: u32 = 0xffff_fff2;

/// clsact egress pseudo-parent (`TC_H_CLSACT | TC_H_MIN_EGRESS`).
pub const TC_FILTER_PARENT_EGRESS: u32 = 0xffff_fff3;

/// Name fragments of the datapath's attachable programs.
pub const DATAPATH_PROGRAMS: [&str; 5] = [
    "bpf_netdev",
    "bpf_network",
    "bpf_host",
    "bpf_lxc",
    "bpf_overlay",
];

/// TC attach direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcDirection {
    Ingress,
    Egress,
}

impl TcDirection {
    pub const ALL: [TcDirection; 2] = [TcDirection::Ingress, TcDirection::Egress];

    pub fn parent(self) -> u32 {
        match self {
            TcDirection::Ingress => TC_FILTER_PARENT_INGRESS,
            TcDirection::Egress => TC_FILTER_PARENT_EGRESS,
        }
    }
}

/// Format a TC handle the way `tc` expects it, e.g. `ffff:fff2`.
pub fn format_handle(handle: u32) -> String {
    format!("{:x}:{:x}", handle >> 16, handle & 0xffff)
}

/// Whether the filter is a bpf filter running one of the datapath programs.
pub fn is_datapath_filter(filter: &TcFilter) -> bool {
    filter.kind == "bpf" && DATAPATH_PROGRAMS.iter().any(|p| filter.name.contains(p))
}

/// Whether the datapath's TC programs are missing on both hooks of `link`.
///
/// A listing error counts as "not lost" so that transient failures do not
/// trigger re-attachment.
pub async fn tc_hooks_lost(kernel: &dyn KernelState, link: &Link) -> bool {
    let mut found = 0;
    for direction in TcDirection::ALL {
        match kernel.tc_filters(link, direction.parent()).await {
            Ok(filters) => found += filters.iter().filter(|f| is_datapath_filter(f)).count(),
            Err(e) => {
                error!(device = %link.name, ?direction, error = %e, "Check TC filter lost");
                return false;
            }
        }
    }
    found == 0
}

#[derive(Debug, Deserialize)]
struct TcFilterEntry {
    kind: String,
    #[serde(default)]
    options: Option<TcFilterOptions>,
}

#[derive(Debug, Deserialize)]
struct TcFilterOptions {
    #[serde(default)]
    bpf_name: Option<String>,
}

/// Parse `tc -j filter show` output.
///
/// `tc` prints one entry per priority without options, followed by one
/// entry per filter instance. Only instances are returned.
pub fn parse_tc_filters(output: &[u8]) -> Result<Vec<TcFilter>, KernelError> {
    if output.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    let entries: Vec<TcFilterEntry> =
        serde_json::from_slice(output).map_err(|e| KernelError::Output("tc", e))?;

    Ok(entries
        .into_iter()
        .filter_map(|entry| {
            let options = entry.options?;
            Some(TcFilter {
                kind: entry.kind,
                name: options.bpf_name.unwrap_or_default(),
            })
        })
        .collect())
}
