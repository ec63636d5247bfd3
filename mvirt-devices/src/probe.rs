//! BPF helper availability probing via bpftool.

use crate::command::{self, COMMAND_TIMEOUT};
use crate::error::KernelError;
use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, warn};

/// Program type probed for L3 device support.
pub const L3_DEV_PROG_TYPE: &str = "sched_cls";

/// Helper required to handle packets from devices without a MAC address.
pub const L3_DEV_HELPER: &str = "bpf_skb_change_head";

/// Kernel BPF capability probe.
#[async_trait]
pub trait FeatureProbe: Send + Sync {
    /// Whether `helper` can be called from programs of `prog_type`.
    async fn has_helper(&self, prog_type: &str, helper: &str) -> bool;
}

/// Probe backed by `bpftool feature probe`. Requires root.
#[derive(Debug, Default)]
pub struct BpftoolProbe;

impl BpftoolProbe {
    async fn probe(&self) -> Result<Value, KernelError> {
        let mut cmd = Command::new("bpftool");
        cmd.args(["-j", "feature", "probe"]);
        let stdout = command::run(cmd, "bpftool", COMMAND_TIMEOUT).await?;

        serde_json::from_slice(&stdout).map_err(|e| KernelError::Output("bpftool", e))
    }
}

#[async_trait]
impl FeatureProbe for BpftoolProbe {
    async fn has_helper(&self, prog_type: &str, helper: &str) -> bool {
        match self.probe().await {
            Ok(features) => helper_available(&features, prog_type, helper),
            Err(e) => {
                warn!(error = %e, "BPF feature probe failed");
                false
            }
        }
    }
}

/// Look up `helper` in the `helpers` section of `bpftool -j feature probe` output.
fn helper_available(features: &Value, prog_type: &str, helper: &str) -> bool {
    let key = format!("{prog_type}_available_helpers");
    let Some(helpers) = features["helpers"][key.as_str()].as_array() else {
        debug!(prog_type, "No helpers reported for program type");
        return false;
    };
    helpers.iter().any(|h| h.as_str() == Some(helper))
}
