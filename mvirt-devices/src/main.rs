//! mvirt-devices daemon: detects the host devices for the datapath and
//! reports changes to them.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mvirt_devices::{
    BpftoolProbe, DeviceConfig, DeviceManager, FeatureProbe, KernelState, NetlinkState,
    NodeAddressing, StaticNodeAddressing,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Host device detection for the mvirt datapath
#[derive(Parser, Debug)]
#[command(name = "mvirt-devices", version, about)]
struct Args {
    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Devices to use, comma separated. `prefix+` matches all devices with that prefix
    #[arg(long, value_delimiter = ',')]
    devices: Option<Vec<String>>,

    /// Device used for direct routing between nodes
    #[arg(long)]
    direct_routing_device: Option<String>,

    /// Device used for IPv6 NDP multicast
    #[arg(long)]
    ipv6_mcast_device: Option<String>,

    /// Network namespace to inspect (e.g. /var/run/netns/foo)
    #[arg(long)]
    netns: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Detect devices once and print the result
    Detect,
    /// Detect devices, then print every change of the device list
    Watch,
}

impl Args {
    fn load_config(&self) -> Result<DeviceConfig> {
        let mut config = match &self.config {
            Some(path) => DeviceConfig::load(path)?,
            None => DeviceConfig::default(),
        };

        if let Some(devices) = &self.devices {
            config.devices = devices
                .iter()
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty())
                .collect();
        }
        if let Some(device) = &self.direct_routing_device {
            config.direct_routing_device = Some(device.clone());
        }
        if let Some(device) = &self.ipv6_mcast_device {
            config.ipv6_mcast_device = Some(device.clone());
        }
        Ok(config)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(Args::parse()).await {
        error!(error = %format!("{e:#}"), "mvirt-devices failed");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let config = args.load_config()?;

    let kernel: Arc<dyn KernelState> = match &args.netns {
        Some(path) => Arc::new(NetlinkState::in_netns(path)?),
        None => Arc::new(NetlinkState::new()?),
    };
    let probe: Arc<dyn FeatureProbe> = Arc::new(BpftoolProbe);
    let node: Arc<dyn NodeAddressing> = Arc::new(StaticNodeAddressing::from(&config.node));

    let manager = Arc::new(DeviceManager::new(config, kernel, probe, node));
    let result = manager.detect().await.context("device detection failed")?;

    if args.command == Some(Command::Detect) {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }
    println!("{}", serde_json::to_string(&result.devices)?);

    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to register SIGTERM handler")?;

    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let mut watcher = manager.listen(shutdown_rx).await;

    loop {
        tokio::select! {
            _ = sigint.recv() => { info!("Received SIGINT"); break; }
            _ = sigterm.recv() => { info!("Received SIGTERM"); break; }
            update = watcher.next() => match update {
                Some(devices) => println!("{}", serde_json::to_string(&devices)?),
                None => break,
            },
        }
    }

    let _ = shutdown_tx.send(()).await;
    watcher.join().await;
    info!("mvirt-devices stopped");
    Ok(())
}
