//! Discovery fault isolation, address resolution and the live-update pipeline
//! exercised through the device manager

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use scout::core::channels::{DeviceManager, SignalUpdate, UpdateHub};
use scout::core::iec61850::adapter::{Iec61850Device, Iec61850Settings};
use scout::core::iec61850::client::IedErrorCode;
use scout::core::iec61850::discovery::BranchLevel;
use scout::core::iec61850::reference::resolve_control_object;
use scout::core::iec61850::simulator::SimulatedIed;
use scout::core::model::signal::{Quality, SignalValue};

fn three_ld_ied() -> SimulatedIed {
    SimulatedIed::new("IED1")
        .with_measurement("LD1", "MMXU1", "TotW", 10.0)
        .with_measurement("LD2", "MMXU1", "TotW", 20.0)
        .with_measurement("LD3", "MMXU1", "TotW", 30.0)
}

async fn managed(ied: &SimulatedIed) -> Arc<DeviceManager> {
    let manager = DeviceManager::new(UpdateHub::new(64));
    let device = Iec61850Device::new("IED1", Arc::new(ied.clone()), Iec61850Settings::default());
    manager.add_device(device.into()).unwrap();
    manager.connect("IED1").await.unwrap();
    manager
}

#[tokio::test]
async fn test_failing_logical_device_is_skipped() {
    let ied = three_ld_ied();
    ied.fail_logical_node_listing("LD2");
    let manager = managed(&ied).await;

    let report = manager.discover("IED1").await.unwrap();
    assert_eq!(report.skipped_count(), 1);
    assert_eq!(report.skipped[0].level, BranchLevel::LogicalDevice);
    assert_eq!(report.skipped[0].name, "LD2");

    let tree = manager.tree("IED1").unwrap();
    assert!(tree.find_signal("LD1/MMXU1.TotW.mag.f").is_some());
    assert!(tree.find_signal("LD3/MMXU1.TotW.mag.f").is_some());
    assert!(tree.find_signal("LD2/MMXU1.TotW.mag.f").is_none());
    assert_eq!(tree.signal_count(), report.signal_count());

    manager.shutdown().await;
}

#[test]
fn test_resolution_strips_prefix_and_suffix_once() {
    for suffix in ["", ".Oper.ctlVal", ".Oper", ".SBOw", ".SBO", ".stVal", ".ctlVal"] {
        let address = format!("Bay1::LD0/CSWI1.Pos{suffix}");
        assert_eq!(resolve_control_object(&address).as_deref(), Some("LD0/CSWI1.Pos"));
    }
    assert_eq!(
        resolve_control_object("Bay1::LD0/CSWI1.Pos.Oper.Oper").as_deref(),
        Some("LD0/CSWI1.Pos.Oper")
    );
    assert_eq!(resolve_control_object(""), None);
    assert_eq!(resolve_control_object("Bay1::"), None);
}

#[tokio::test]
async fn test_every_read_attempt_fires_exactly_once() {
    let ied = three_ld_ied();
    let manager = managed(&ied).await;
    manager.discover("IED1").await.unwrap();

    let seen: Arc<Mutex<Vec<SignalUpdate>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    manager
        .hub()
        .subscribe(Arc::new(move |update| sink.lock().push(update.clone())));

    let address = "IED1::LD1/MMXU1.TotW.mag.f";

    let good = manager.read(address).await.unwrap();
    assert_eq!(good.quality, Quality::Good);
    assert_eq!(good.value, Some(SignalValue::Float(10.0)));
    assert_eq!(seen.lock().len(), 1);

    ied.fail_read("LD1/MMXU1.TotW.mag.f", IedErrorCode::AccessDenied);
    let failed = manager.read(address).await.unwrap();
    assert_eq!(failed.quality, Quality::Invalid);
    assert_eq!(failed.value, Some(SignalValue::Float(10.0)));
    assert_eq!(seen.lock().len(), 2);
    assert_eq!(seen.lock()[1].signal.quality, Quality::Invalid);

    // Unknown addresses are rejected before any attempt
    assert!(manager.read("IED1::LD1/MMXU1.Nothing").await.is_err());
    assert_eq!(seen.lock().len(), 2);

    let latest = manager.hub().latest(address).unwrap();
    assert_eq!(latest.signal.quality, Quality::Invalid);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_marks_stale_then_reads_not_connected() {
    let ied = three_ld_ied();
    let manager = managed(&ied).await;
    manager.discover("IED1").await.unwrap();

    let address = "IED1::LD3/MMXU1.TotW.mag.f";
    manager.read(address).await.unwrap();

    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    manager.hub().subscribe(Arc::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    manager.disconnect("IED1").await.unwrap();
    assert_eq!(manager.hub().latest(address).unwrap().signal.quality, Quality::Stale);
    let after_disconnect = count.load(Ordering::SeqCst);

    let signal = manager.read(address).await.unwrap();
    assert_eq!(signal.quality, Quality::NotConnected);
    assert_eq!(signal.value, Some(SignalValue::Float(30.0)));
    assert_eq!(count.load(Ordering::SeqCst), after_disconnect + 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_unresponsive_read_is_invalid_after_timeout() {
    let ied = three_ld_ied();
    let manager = DeviceManager::new(UpdateHub::new(16));
    let mut settings = Iec61850Settings::default();
    settings.discovery.call_timeout = Duration::from_millis(200);
    settings.control.call_timeout = Duration::from_millis(200);
    manager
        .add_device(Iec61850Device::new("IED1", Arc::new(ied.clone()), settings).into())
        .unwrap();
    manager.connect("IED1").await.unwrap();
    manager.discover("IED1").await.unwrap();

    let mut feed = manager.hub().feed();
    ied.set_unresponsive(true);
    let signal = manager.read("IED1::LD2/MMXU1.TotW.mag.f").await.unwrap();
    assert_eq!(signal.quality, Quality::Invalid);

    let update = feed.recv().await.unwrap();
    assert_eq!(update.key(), "IED1::LD2/MMXU1.TotW.mag.f");
    assert_eq!(update.signal.quality, Quality::Invalid);
}
