//! Device reconciliation integration tests.
//!
//! Drives the static device check and the watch loop against an in-memory
//! host. Tick-driven tests run on a paused clock.

use mvirt_devices::kernel::KernelState;
use mvirt_devices::tc::{TC_FILTER_PARENT_EGRESS, TC_FILTER_PARENT_INGRESS};
use mvirt_devices::test_util::{FakeKernel, StaticProbe, datapath_filter, test_link};
use mvirt_devices::{DeviceConfig, DeviceManager, StaticNodeAddressing};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until, timeout};

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(a, b, c, d))
}

fn test_config(devices: &[&str]) -> DeviceConfig {
    DeviceConfig {
        devices: devices.iter().map(|d| d.to_string()).collect(),
        dynamic_devices_dir: PathBuf::from("/nonexistent/dynamic-devices"),
        ..Default::default()
    }
}

/// Add a link with the datapath programs attached on ingress.
fn add_attached_link(kernel: &FakeKernel, index: u32, name: &str) {
    kernel.add_link(test_link(index, name));
    kernel.set_tc_filters(index, TC_FILTER_PARENT_INGRESS, vec![datapath_filter("bpf_netdev")]);
}

async fn detected_manager(
    config: DeviceConfig,
    kernel: &Arc<FakeKernel>,
    node: StaticNodeAddressing,
) -> Arc<DeviceManager> {
    let kernel: Arc<dyn KernelState> = kernel.clone();
    let manager = Arc::new(DeviceManager::new(
        config,
        kernel,
        Arc::new(StaticProbe(true)),
        Arc::new(node),
    ));
    manager.detect().await.expect("detection failed");
    manager
}

#[tokio::test]
async fn test_listen_drops_devices_removed_after_detect() {
    let kernel = Arc::new(FakeKernel::new());
    add_attached_link(&kernel, 2, "eth0");
    add_attached_link(&kernel, 3, "eth1");
    let manager = detected_manager(
        test_config(&["eth0", "eth1"]),
        &kernel,
        StaticNodeAddressing::default(),
    )
    .await;

    kernel.remove_link("eth1");

    let (_shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let mut watcher = manager.listen(shutdown_rx).await;

    assert_eq!(watcher.next().await, Some(vec!["eth0".to_string()]));
    assert_eq!(manager.devices().await, vec!["eth0"]);
}

#[tokio::test]
async fn test_listen_without_removed_devices_publishes_nothing() {
    let kernel = Arc::new(FakeKernel::new());
    add_attached_link(&kernel, 2, "eth0");
    let manager =
        detected_manager(test_config(&["eth0"]), &kernel, StaticNodeAddressing::default()).await;

    let (_shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let watcher = manager.listen(shutdown_rx).await;

    let updates = watcher.updates();
    assert!(!updates.has_changed().unwrap());
    assert_eq!(*updates.borrow(), vec!["eth0".to_string()]);
}

#[tokio::test]
async fn test_check_with_empty_filter() {
    let kernel = Arc::new(FakeKernel::new());
    add_attached_link(&kernel, 2, "eth0");
    kernel.add_route(None, 254, 2);
    let config = DeviceConfig {
        enable_node_port: true,
        ..test_config(&[])
    };
    let manager = detected_manager(config, &kernel, StaticNodeAddressing::default()).await;
    assert_eq!(manager.devices().await, vec!["eth0"]);

    kernel.remove_link("eth0");

    // Auto-detected devices are not reconciled.
    assert!(!manager.check_static_devices().await);
    assert_eq!(manager.devices().await, vec!["eth0"]);
}

#[tokio::test]
async fn test_check_unchanged() {
    let kernel = Arc::new(FakeKernel::new());
    add_attached_link(&kernel, 2, "eth0");
    add_attached_link(&kernel, 3, "eth1");
    kernel.add_link(test_link(4, "eth2"));
    let manager = detected_manager(
        test_config(&["eth0", "eth1"]),
        &kernel,
        StaticNodeAddressing::default(),
    )
    .await;

    assert!(!manager.check_static_devices().await);
    assert_eq!(manager.devices().await, vec!["eth0", "eth1"]);
}

#[tokio::test]
async fn test_check_removes_vanished_device() {
    let kernel = Arc::new(FakeKernel::new());
    add_attached_link(&kernel, 2, "eth0");
    add_attached_link(&kernel, 3, "eth1");
    let manager = detected_manager(
        test_config(&["eth0", "eth1"]),
        &kernel,
        StaticNodeAddressing::default(),
    )
    .await;

    kernel.remove_link("eth1");

    assert!(manager.check_static_devices().await);
    assert_eq!(manager.devices().await, vec!["eth0"]);
    assert!(!manager.check_static_devices().await);
}

#[tokio::test]
async fn test_check_restores_lost_device() {
    let kernel = Arc::new(FakeKernel::new());
    add_attached_link(&kernel, 2, "eth0");
    add_attached_link(&kernel, 3, "eth1");
    let manager = detected_manager(
        test_config(&["eth0", "eth1"]),
        &kernel,
        StaticNodeAddressing::default(),
    )
    .await;

    kernel.remove_link("eth1");
    assert!(manager.check_static_devices().await);

    // The interface comes back, e.g. after a driver reload.
    add_attached_link(&kernel, 5, "eth1");
    assert!(manager.check_static_devices().await);
    assert_eq!(manager.devices().await, vec!["eth0", "eth1"]);
}

#[tokio::test]
async fn test_check_lost_tc_hooks() {
    let kernel = Arc::new(FakeKernel::new());
    add_attached_link(&kernel, 2, "eth0");
    add_attached_link(&kernel, 3, "eth1");
    let manager = detected_manager(
        test_config(&["eth0", "eth1"]),
        &kernel,
        StaticNodeAddressing::default(),
    )
    .await;

    // Egress only still counts as attached.
    kernel.set_tc_filters(3, TC_FILTER_PARENT_INGRESS, vec![]);
    kernel.set_tc_filters(3, TC_FILTER_PARENT_EGRESS, vec![datapath_filter("bpf_host")]);
    assert!(!manager.check_static_devices().await);

    kernel.set_tc_filters(3, TC_FILTER_PARENT_EGRESS, vec![]);
    assert!(manager.check_static_devices().await);
    // The device stays tracked so its programs get attached again.
    assert_eq!(manager.devices().await, vec!["eth0", "eth1"]);
}

#[tokio::test]
async fn test_check_tc_listing_error_is_not_a_change() {
    let kernel = Arc::new(FakeKernel::new());
    kernel.add_link(test_link(2, "eth0"));
    let manager =
        detected_manager(test_config(&["eth0"]), &kernel, StaticNodeAddressing::default()).await;

    kernel.fail_tc_list(true);
    assert!(!manager.check_static_devices().await);
}

#[tokio::test]
async fn test_check_link_listing_error() {
    let kernel = Arc::new(FakeKernel::new());
    add_attached_link(&kernel, 2, "eth0");
    let manager =
        detected_manager(test_config(&["eth0"]), &kernel, StaticNodeAddressing::default()).await;

    kernel.remove_link("eth0");
    kernel.fail_link_list(true);
    assert!(!manager.check_static_devices().await);
    assert_eq!(manager.devices().await, vec!["eth0"]);
}

#[tokio::test]
async fn test_check_address_change() {
    let kernel = Arc::new(FakeKernel::new());
    add_attached_link(&kernel, 2, "eth0");
    add_attached_link(&kernel, 3, "eth1");
    kernel.add_address(2, v4(10, 0, 0, 2));
    let node = StaticNodeAddressing::default().with_masquerade("eth0", Ipv4Addr::new(10, 0, 0, 2));
    // eth1 has no recorded address and is not checked.
    let manager = detected_manager(test_config(&["eth0", "eth1"]), &kernel, node).await;

    assert!(!manager.check_static_devices().await);

    kernel.clear_addresses(2);
    kernel.add_address(2, v4(10, 0, 0, 9));
    assert!(manager.check_static_devices().await);
    assert_eq!(manager.devices().await, vec!["eth0", "eth1"]);

    // A secondary address does not count.
    kernel.add_address_with_flags(2, v4(10, 0, 0, 2), libc::IFA_F_SECONDARY);
    assert!(manager.check_static_devices().await);

    kernel.add_address(2, v4(10, 0, 0, 2));
    assert!(!manager.check_static_devices().await);
}

#[tokio::test]
async fn test_check_wildcard_devices() {
    let kernel = Arc::new(FakeKernel::new());
    add_attached_link(&kernel, 2, "eth0");
    kernel.add_address(2, v4(10, 0, 0, 2));
    let manager =
        detected_manager(test_config(&["eth+"]), &kernel, StaticNodeAddressing::default()).await;
    assert_eq!(manager.devices().await, vec!["eth0"]);

    // Wildcard devices are only picked up once they carry an address.
    add_attached_link(&kernel, 3, "eth1");
    assert!(!manager.check_static_devices().await);

    kernel.add_address(3, v4(10, 0, 1, 2));
    assert!(manager.check_static_devices().await);
    assert_eq!(manager.devices().await, vec!["eth0", "eth1"]);

    // Losing the address drops the device.
    kernel.clear_addresses(2);
    assert!(manager.check_static_devices().await);
    assert_eq!(manager.devices().await, vec!["eth1"]);
}

#[tokio::test]
async fn test_check_dynamic_devices() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = Arc::new(FakeKernel::new());
    add_attached_link(&kernel, 2, "eth0");
    add_attached_link(&kernel, 3, "ens3");
    add_attached_link(&kernel, 4, "lxc12");
    kernel.add_address(3, v4(10, 0, 1, 2));
    kernel.add_address(4, v4(10, 0, 2, 2));

    let config = DeviceConfig {
        dynamic_devices_dir: dir.path().to_path_buf(),
        ..test_config(&["eth0"])
    };
    let manager = detected_manager(config, &kernel, StaticNodeAddressing::default()).await;
    assert!(!manager.check_static_devices().await);

    std::fs::write(dir.path().join("ens"), b"").unwrap();
    std::fs::write(dir.path().join("lxc"), b"").unwrap();
    assert!(manager.check_static_devices().await);
    // Excluded prefixes stay excluded.
    assert_eq!(manager.devices().await, vec!["ens3", "eth0"]);

    std::fs::remove_file(dir.path().join("ens")).unwrap();
    assert!(manager.check_static_devices().await);
    assert_eq!(manager.devices().await, vec!["eth0"]);
}

#[tokio::test(start_paused = true)]
async fn test_watch_publishes_on_tick() {
    let kernel = Arc::new(FakeKernel::new());
    add_attached_link(&kernel, 2, "eth0");
    add_attached_link(&kernel, 3, "eth1");
    let manager = detected_manager(
        test_config(&["eth0", "eth1"]),
        &kernel,
        StaticNodeAddressing::default(),
    )
    .await;

    let (_shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let mut watcher = manager.listen(shutdown_rx).await;
    let start = Instant::now();

    kernel.remove_link("eth1");

    // No check before the first interval has passed.
    assert!(
        timeout(CHECK_INTERVAL - Duration::from_secs(1), watcher.next())
            .await
            .is_err()
    );

    assert_eq!(watcher.next().await, Some(vec!["eth0".to_string()]));
    assert!(start.elapsed() >= CHECK_INTERVAL);

    // Restored on a later tick.
    add_attached_link(&kernel, 4, "eth1");
    assert_eq!(
        watcher.next().await,
        Some(vec!["eth0".to_string(), "eth1".to_string()])
    );
    assert!(start.elapsed() >= CHECK_INTERVAL * 2);
}

#[tokio::test(start_paused = true)]
async fn test_watch_custom_interval() {
    let kernel = Arc::new(FakeKernel::new());
    add_attached_link(&kernel, 2, "eth0");
    add_attached_link(&kernel, 3, "eth1");
    let config = DeviceConfig {
        static_devices_check_interval_secs: 5,
        ..test_config(&["eth0", "eth1"])
    };
    let manager = detected_manager(config, &kernel, StaticNodeAddressing::default()).await;

    let (_shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let mut watcher = manager.listen(shutdown_rx).await;
    let start = Instant::now();

    kernel.remove_link("eth0");
    assert_eq!(watcher.next().await, Some(vec!["eth1".to_string()]));
    assert!(start.elapsed() >= Duration::from_secs(5));
    assert!(start.elapsed() < CHECK_INTERVAL);
}

#[tokio::test(start_paused = true)]
async fn test_watch_slow_tick_delays_next_tick() {
    let kernel = Arc::new(FakeKernel::new());
    add_attached_link(&kernel, 2, "eth0");
    let manager =
        detected_manager(test_config(&["eth0"]), &kernel, StaticNodeAddressing::default()).await;

    let (_shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let _watcher = manager.listen(shutdown_rx).await;
    let start = Instant::now();
    let calls = kernel.link_list_calls();

    // The first tick at 30s runs until 100s.
    kernel.delay_next_link_list(Duration::from_secs(70));

    // The overdue tick fires once when the slow one finishes.
    sleep_until(start + Duration::from_secs(101)).await;
    assert_eq!(kernel.link_list_calls(), calls + 2);

    // Missed ticks are not replayed; the schedule restarts from 100s.
    sleep_until(start + Duration::from_secs(129)).await;
    assert_eq!(kernel.link_list_calls(), calls + 2);

    sleep_until(start + Duration::from_secs(131)).await;
    assert_eq!(kernel.link_list_calls(), calls + 3);
}

#[tokio::test(start_paused = true)]
async fn test_watch_stops_on_shutdown() {
    let kernel = Arc::new(FakeKernel::new());
    add_attached_link(&kernel, 2, "eth0");
    let manager =
        detected_manager(test_config(&["eth0"]), &kernel, StaticNodeAddressing::default()).await;

    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let mut watcher = manager.listen(shutdown_rx).await;

    shutdown_tx.send(()).await.unwrap();
    assert_eq!(watcher.next().await, None);
    watcher.join().await;
}

#[tokio::test(start_paused = true)]
async fn test_watch_stops_when_shutdown_sender_dropped() {
    let kernel = Arc::new(FakeKernel::new());
    add_attached_link(&kernel, 2, "eth0");
    let manager =
        detected_manager(test_config(&["eth0"]), &kernel, StaticNodeAddressing::default()).await;

    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    let watcher = manager.listen(shutdown_rx).await;

    drop(shutdown_tx);
    watcher.join().await;
}
