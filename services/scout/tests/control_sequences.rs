//! Select-before-operate sequences against the simulated IED
//!
//! Covers the SELECT -> wait -> OPERATE scenario, control-number progression,
//! local refusal of an unselected OPERATE and the raw-write fallback.

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::sync::Arc;
use std::time::Duration;

use scout::core::iec61850::adapter::{Iec61850Device, Iec61850Settings};
use scout::core::iec61850::client::{IedErrorCode, MmsValue};
use scout::core::iec61850::control::{CommandOptions, ControlModel, ControlPath, ControlState};
use scout::core::iec61850::simulator::{Packet, SimulatedIed};
use scout::core::model::signal::SignalValue;
use scout::error::ControlError;
use tracing_test::traced_test;

const POS: &str = "TestIED::LD0/CSWI1.Pos";
const OBJECT: &str = "LD0/CSWI1.Pos";

async fn test_ied(model: ControlModel) -> (SimulatedIed, Iec61850Device) {
    let ied = SimulatedIed::new("TestIED").with_control_point("LD0", "CSWI1", "Pos", model);
    let mut device = Iec61850Device::new("TestIED", Arc::new(ied.clone()), Iec61850Settings::default());
    device.connect().await.unwrap();
    device.discover().await.unwrap();
    ied.clear_packets();
    (ied, device)
}

#[tokio::test]
async fn test_select_wait_operate_scenario() {
    let (ied, mut device) = test_ied(ControlModel::SboNormal).await;

    let outcome = device
        .send_command(POS, &SignalValue::Bool(true), &CommandOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.object_reference, OBJECT);
    assert!(outcome.selected);
    assert_eq!(outcome.ctl_num, 0);

    let timed: Vec<_> = ied
        .timed_packets()
        .into_iter()
        .filter(|(_, p)| p.is_select() || p.is_operate())
        .collect();
    assert_eq!(timed.len(), 2);
    let (select_at, select) = &timed[0];
    let (operate_at, operate) = &timed[1];
    assert!(matches!(select, Packet::Select { object, .. } if object == OBJECT));
    assert!(matches!(
        operate,
        Packet::Operate { object, value: MmsValue::Boolean(true), .. } if object == OBJECT
    ));
    let gap = operate_at.saturating_duration_since(*select_at);
    assert!(gap >= Duration::from_millis(100), "operate followed select after {gap:?}");

    let ctx = device.engine().context(OBJECT).unwrap();
    assert_eq!(ctx.ctl_num, 1);
    assert_eq!(device.control_state(POS), ControlState::Complete);
}

#[tokio::test]
async fn test_control_number_strictly_increases() {
    let (ied, mut device) = test_ied(ControlModel::DirectNormal).await;
    let options = CommandOptions::default();

    let mut seen = Vec::new();
    for i in 0..5 {
        let value = SignalValue::Bool(i % 2 == 0);
        seen.push(device.send_command(POS, &value, &options).await.unwrap().ctl_num);
    }
    assert_eq!(seen, vec![0, 1, 2, 3, 4]);

    let wire: Vec<u8> = ied
        .control_packets()
        .iter()
        .filter_map(|p| match p {
            Packet::Operate { ctl_num, .. } => Some(*ctl_num),
            _ => None,
        })
        .collect();
    assert_eq!(wire, seen);
}

#[tokio::test]
async fn test_sbo_ctl_num_shared_by_select_and_operate() {
    let (ied, mut device) = test_ied(ControlModel::SboNormal).await;
    let options = CommandOptions {
        sbo_timeout_ms: Some(0),
        ..Default::default()
    };
    for _ in 0..3 {
        device.send_command(POS, &SignalValue::Bool(true), &options).await.unwrap();
    }
    let pairs: Vec<(u8, u8)> = ied
        .control_packets()
        .chunks(2)
        .map(|pair| match (&pair[0], &pair[1]) {
            (Packet::Select { ctl_num: s, .. }, Packet::Operate { ctl_num: o, .. }) => (*s, *o),
            other => panic!("unexpected packets {other:?}"),
        })
        .collect();
    assert_eq!(pairs, vec![(0, 0), (1, 1), (2, 2)]);
}

#[tokio::test]
async fn test_operate_while_idle_sends_nothing() {
    let (ied, mut device) = test_ied(ControlModel::SboNormal).await;
    let err = device
        .operate(POS, &SignalValue::Bool(true), &CommandOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err, ControlError::NotSelected);
    assert!(!ied.packets().iter().any(Packet::is_operate));
}

#[tokio::test]
async fn test_unconvertible_value_is_refused_before_select() {
    let (ied, mut device) = test_ied(ControlModel::SboNormal).await;
    for entered in ["close", "yes", "1.0x", "2"] {
        let err = device
            .send_command(POS, &SignalValue::parse(entered), &CommandOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::InvalidValue(_)), "{entered}: {err:?}");
    }
    assert!(ied.control_packets().is_empty());
    assert_eq!(device.control_state(POS), ControlState::Idle);

    let outcome = device
        .send_command(POS, &SignalValue::parse("1"), &CommandOptions::default())
        .await
        .unwrap();
    assert!(matches!(
        ied.control_packets().last(),
        Some(Packet::Operate { value: MmsValue::Boolean(true), .. })
    ));
    assert_eq!(outcome.ctl_num, 0);
}

#[tokio::test]
async fn test_explicit_select_then_operate() {
    let (ied, mut device) = test_ied(ControlModel::SboNormal).await;
    let options = CommandOptions::default();

    let path = device.select(POS, &SignalValue::Bool(false), &options).await.unwrap();
    assert_eq!(path, ControlPath::Primary);
    assert_eq!(device.control_state(POS), ControlState::Selected);
    assert!(ied.is_selected(OBJECT));

    let err = device
        .send_command(POS, &SignalValue::Bool(false), &options)
        .await
        .unwrap_err();
    assert_eq!(err, ControlError::AlreadySelected);

    let outcome = device.operate(POS, &SignalValue::Bool(false), &options).await.unwrap();
    assert!(outcome.selected);
    assert_eq!(ied.control_packets().len(), 2);
}

#[tokio::test]
async fn test_select_rejection_is_not_retried_direct() {
    let (ied, mut device) = test_ied(ControlModel::SboNormal).await;
    ied.reject_select(Some(IedErrorCode::AccessDenied));

    let err = device
        .send_command(POS, &SignalValue::Bool(true), &CommandOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err, ControlError::SelectRejected(IedErrorCode::AccessDenied));
    assert_eq!(ied.control_packets().len(), 1);

    assert!(!ied.control_packets().iter().any(Packet::is_operate));
    assert_eq!(device.control_state(POS), ControlState::Failed);
}

#[tokio::test]
#[traced_test]
async fn test_fallback_used_when_control_object_unavailable() {
    let (ied, mut device) = test_ied(ControlModel::SboNormal).await;
    ied.set_control_object_unavailable(true);

    let outcome = device
        .send_command(POS, &SignalValue::Bool(true), &CommandOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.path, ControlPath::Fallback);
    assert_eq!(outcome.ctl_num, 0);

    let packets = ied.control_packets();
    assert_eq!(packets.len(), 2);
    assert!(matches!(
        &packets[0],
        Packet::Select { object, path: ControlPath::Fallback, .. } if object == OBJECT
    ));
    assert!(matches!(
        &packets[1],
        Packet::Operate { object, path: ControlPath::Fallback, .. } if object == OBJECT
    ));

    assert!(logs_contain("switching to fallback raw write"));
    assert!(logs_contain("Writing SELECT structure"));
    assert!(logs_contain("Operate accepted"));
}

#[tokio::test]
#[traced_test]
async fn test_primary_path_logged_distinctly() {
    let (_ied, mut device) = test_ied(ControlModel::SboNormal).await;
    let outcome = device
        .send_command(POS, &SignalValue::Bool(true), &CommandOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.path, ControlPath::Primary);

    assert!(logs_contain("Sending SELECT"));
    assert!(logs_contain("Sending OPERATE"));
    assert!(!logs_contain("switching to fallback"));
}

#[tokio::test]
async fn test_fallback_outcome_reflects_device_answer() {
    let (ied, mut device) = test_ied(ControlModel::SboNormal).await;
    ied.set_control_object_unavailable(true);
    ied.reject_operate(Some(IedErrorCode::TemporarilyUnavailable));

    let err = device
        .send_command(POS, &SignalValue::Bool(true), &CommandOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err, ControlError::OperateRejected(IedErrorCode::TemporarilyUnavailable));
    assert!(matches!(
        ied.control_packets().last(),
        Some(Packet::Operate { path: ControlPath::Fallback, .. })
    ));
}
