//! IEC 61850 device
//!
//! Ties one MMS association to its discovery pass, signal tree, control
//! engine and update slot. The control cache lives and dies with the
//! association: it is dropped on every connect and disconnect.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::client::{Fc, IedError, MmsClient, MmsType};
use super::control::{CommandOptions, ControlState};
use super::discovery::{DiscoveryEngine, DiscoveryReport, DiscoverySettings};
use super::reference::{collapse_duplicate_ld, resolve_control_object, strip_device_prefix};
use super::sbo::{CommandOutcome, ControlEngine, ControlSettings};
use super::vendor::VendorProfile;
use crate::core::iec61850::control::ControlPath;
use crate::core::model::node::{Node, NodeKind};
use crate::core::model::signal::{ReadFailure, Signal, SignalType, SignalValue};
use crate::core::model::update::UpdateSlot;
use crate::error::{ControlError, Result, ScoutSrvError};

#[derive(Debug, Clone, Default)]
pub struct Iec61850Settings {
    pub discovery: DiscoverySettings,
    pub control: ControlSettings,
    pub vendor: VendorProfile,
}

pub struct Iec61850Device {
    name: String,
    vendor: VendorProfile,
    client: Arc<dyn MmsClient>,
    engine: ControlEngine,
    discovery: DiscoverySettings,
    tree: Arc<RwLock<Arc<Node>>>,
    live: HashMap<String, Signal>,
    updates: UpdateSlot,
}

impl std::fmt::Debug for Iec61850Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Iec61850Device")
            .field("name", &self.name)
            .field("vendor", &self.vendor)
            .field("connected", &self.client.is_connected())
            .finish()
    }
}

fn read_failure(err: &IedError) -> ReadFailure {
    if err.code.is_connection_error() {
        ReadFailure::NotConnected
    } else {
        ReadFailure::Invalid
    }
}

impl Iec61850Device {
    /// Vendor quirks are resolved here, before any connection attempt
    pub fn new(name: impl Into<String>, client: Arc<dyn MmsClient>, settings: Iec61850Settings) -> Self {
        let name = name.into();
        let vendor = settings.vendor.resolve(&name);
        let mut control = settings.control;
        vendor.apply(&mut control);
        debug!(
            device = %name,
            vendor = %vendor,
            select_operate_delay_ms = control.select_operate_delay.as_millis() as u64,
            "Vendor profile applied"
        );

        Self {
            engine: ControlEngine::new(name.clone(), client.clone(), control),
            tree: Arc::new(RwLock::new(Arc::new(Node::new(name.clone(), NodeKind::Device)))),
            name,
            vendor,
            client,
            discovery: settings.discovery,
            live: HashMap::new(),
            updates: UpdateSlot::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vendor(&self) -> VendorProfile {
        self.vendor
    }

    pub fn engine(&self) -> &ControlEngine {
        &self.engine
    }

    pub fn updates(&self) -> &UpdateSlot {
        &self.updates
    }

    pub fn tree(&self) -> Arc<Node> {
        self.tree.read().clone()
    }

    pub fn tree_handle(&self) -> Arc<RwLock<Arc<Node>>> {
        self.tree.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    fn call_timeout(&self) -> Duration {
        self.discovery.call_timeout
    }

    pub async fn connect(&mut self) -> Result<()> {
        info!(device = %self.name, vendor = %self.vendor, "Connecting");
        let timeout = self.call_timeout();
        match tokio::time::timeout(timeout, self.client.connect()).await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => {
                warn!(device = %self.name, error_code = e.code.code(), "Connect failed: {}", e);
                return Err(ScoutSrvError::connection(format!("{}: {e}", self.name)));
            },
            Err(_) => {
                warn!(device = %self.name, "Connect timed out");
                return Err(ScoutSrvError::timeout(format!(
                    "{}: no association within {} ms",
                    self.name,
                    timeout.as_millis()
                )));
            },
        }
        self.engine.invalidate();
        info!(device = %self.name, "Connected");
        Ok(())
    }

    pub async fn disconnect(&mut self) {
        self.client.disconnect().await;
        self.engine.invalidate();
        for signal in self.live.values_mut() {
            signal.mark_stale();
        }
        info!(device = %self.name, "Disconnected");
    }

    /// Walk the device and replace the tree wholesale
    pub async fn discover(&mut self) -> Result<DiscoveryReport> {
        if !self.client.is_connected() {
            return Err(ScoutSrvError::not_connected());
        }
        let report = DiscoveryEngine::new(&self.name, self.client.as_ref(), self.discovery.clone())
            .discover()
            .await;
        *self.tree.write() = Arc::new(report.root.clone());
        self.live.clear();
        if report.is_partial() {
            warn!(
                device = %self.name,
                skipped = report.skipped_count(),
                "Partial discovery"
            );
        }
        Ok(report)
    }

    /// Read one discovered attribute
    ///
    /// A completed attempt always emits exactly one update, success or not.
    /// Only an address missing from the tree fails without an update.
    pub async fn read_signal(&mut self, address: &str) -> Result<Signal> {
        let path = collapse_duplicate_ld(strip_device_prefix(address));
        let mut signal = match self.live.remove(&path) {
            Some(s) => s,
            None => self
                .tree
                .read()
                .find_signal(&path)
                .cloned()
                .ok_or_else(|| ScoutSrvError::signal_not_found(&path))?,
        };
        let fc = signal.fc().unwrap_or(Fc::St);

        let outcome = if !self.client.is_connected() {
            Err(ReadFailure::NotConnected)
        } else {
            let timeout = self.call_timeout();
            let result = tokio::time::timeout(timeout, self.client.read_value(&path, fc))
                .await
                .unwrap_or_else(|_| {
                    Err(IedError::timeout(format!("no response within {} ms", timeout.as_millis())))
                });
            result.map(|v| SignalValue::from(&v)).map_err(|e| {
                warn!(
                    device = %self.name,
                    address = %path,
                    fc = %fc,
                    error_code = e.code.code(),
                    "Read failed: {}",
                    e
                );
                read_failure(&e)
            })
        };

        signal.apply_read(outcome);
        self.updates.emit(&self.name, &signal);
        self.live.insert(path, signal.clone());
        Ok(signal)
    }

    /// Resolve an address to a control object and check it against the tree
    ///
    /// Before the first discovery there is nothing to check against and the
    /// resolved reference is passed through.
    pub fn control_object(&self, address: &str) -> std::result::Result<String, ControlError> {
        let object = resolve_control_object(address)
            .ok_or_else(|| ControlError::InvalidReference(address.to_string()))?;
        let tree = self.tree.read();
        if tree.signal_count() > 0 && !tree.contains_reference(&object) {
            return Err(ControlError::InvalidReference(object));
        }
        Ok(object)
    }

    fn control_value(
        &self,
        object: &str,
        value: &SignalValue,
    ) -> std::result::Result<super::client::MmsValue, ControlError> {
        let ctl_type = self
            .tree
            .read()
            .find_signal(&format!("{object}.Oper.ctlVal"))
            .and_then(|s| match s.signal_type {
                SignalType::Iec61850 { mms_type, .. } => Some(mms_type),
                SignalType::Modbus { .. } => None,
            });
        value
            .to_mms(ctl_type.or(match value {
                SignalValue::Bool(_) => Some(MmsType::Boolean),
                _ => None,
            }))
            .inspect_err(|e| warn!(device = %self.name, object, error = %e, "Command value refused"))
    }

    /// Full control command on the object `address` resolves to
    pub async fn send_command(
        &mut self,
        address: &str,
        value: &SignalValue,
        options: &CommandOptions,
    ) -> std::result::Result<CommandOutcome, ControlError> {
        let object = self.control_object(address)?;
        let mms = self.control_value(&object, value)?;
        self.engine.send_command(&object, &mms, options).await
    }

    pub async fn select(
        &mut self,
        address: &str,
        value: &SignalValue,
        options: &CommandOptions,
    ) -> std::result::Result<ControlPath, ControlError> {
        let object = self.control_object(address)?;
        let mms = self.control_value(&object, value)?;
        self.engine.select(&object, &mms, options).await
    }

    pub async fn operate(
        &mut self,
        address: &str,
        value: &SignalValue,
        options: &CommandOptions,
    ) -> std::result::Result<CommandOutcome, ControlError> {
        let object = self.control_object(address)?;
        let mms = self.control_value(&object, value)?;
        self.engine.operate(&object, &mms, options).await
    }

    pub async fn cancel(&mut self, address: &str) -> std::result::Result<(), ControlError> {
        let object = self.control_object(address)?;
        self.engine.cancel(&object).await
    }

    pub fn control_state(&self, address: &str) -> ControlState {
        match resolve_control_object(address) {
            Some(object) => self.engine.state(&object),
            None => ControlState::Idle,
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::core::iec61850::client::{IedErrorCode, MmsValue};
    use crate::core::iec61850::control::ControlModel;
    use crate::core::iec61850::simulator::{Packet, SimulatedIed};
    use crate::core::model::signal::Quality;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ied() -> SimulatedIed {
        SimulatedIed::new("TestIED")
            .with_measurement("LD0", "MMXU1", "TotW", 12.5)
            .with_control_point("LD0", "CSWI1", "Pos", ControlModel::SboNormal)
    }

    fn device(ied: &SimulatedIed) -> Iec61850Device {
        let settings = Iec61850Settings {
            control: ControlSettings {
                select_operate_delay: Duration::from_millis(5),
                ..Default::default()
            },
            ..Default::default()
        };
        Iec61850Device::new("TestIED", Arc::new(ied.clone()), settings)
    }

    #[tokio::test]
    async fn test_read_emits_once_per_attempt() {
        let ied = ied();
        let mut dev = device(&ied);
        dev.connect().await.unwrap();
        dev.discover().await.unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        dev.updates().install(Arc::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let ok = dev.read_signal("TestIED::LD0/MMXU1.TotW.mag.f").await.unwrap();
        assert_eq!(ok.quality, Quality::Good);
        assert_eq!(ok.value, Some(SignalValue::Float(12.5)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        ied.fail_read("LD0/MMXU1.TotW.mag.f", IedErrorCode::AccessDenied);
        let failed = dev.read_signal("LD0/MMXU1.TotW.mag.f").await.unwrap();
        assert_eq!(failed.quality, Quality::Invalid);
        assert_eq!(failed.value, Some(SignalValue::Float(12.5)));
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        assert!(dev.read_signal("LD0/MMXU1.Missing").await.is_err());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_disconnected_read_reports_not_connected() {
        let ied = ied();
        let mut dev = device(&ied);
        dev.connect().await.unwrap();
        dev.discover().await.unwrap();
        dev.read_signal("LD0/MMXU1.TotW.mag.f").await.unwrap();
        dev.disconnect().await;

        let signal = dev.read_signal("LD0/MMXU1.TotW.mag.f").await.unwrap();
        assert_eq!(signal.quality, Quality::NotConnected);
        assert!(dev.discover().await.is_err());
    }

    #[tokio::test]
    async fn test_command_checked_against_tree() {
        let ied = ied();
        let mut dev = device(&ied);
        dev.connect().await.unwrap();
        dev.discover().await.unwrap();

        let err = dev
            .send_command("TestIED::LD0/XCBR9.Pos", &SignalValue::Bool(true), &CommandOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::InvalidReference(_)));
        assert!(ied.control_packets().is_empty());

        let outcome = dev
            .send_command(
                "TestIED::LD0/LD0/CSWI1.Pos.Oper.ctlVal",
                &SignalValue::Bool(true),
                &CommandOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.object_reference, "LD0/CSWI1.Pos");
        assert!(outcome.selected);
    }

    #[tokio::test]
    async fn test_reconnect_drops_control_cache() {
        let ied = ied();
        let mut dev = device(&ied);
        dev.connect().await.unwrap();
        dev.send_command("LD0/CSWI1.Pos", &SignalValue::Bool(true), &CommandOptions::default())
            .await
            .unwrap();
        assert!(dev.engine().context("LD0/CSWI1.Pos").is_some());

        dev.disconnect().await;
        assert!(dev.engine().context("LD0/CSWI1.Pos").is_none());
        dev.connect().await.unwrap();

        ied.clear_packets();
        let outcome = dev
            .send_command("LD0/CSWI1.Pos", &SignalValue::Bool(false), &CommandOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.ctl_num, 0);
        assert!(ied
            .packets()
            .iter()
            .any(|p| matches!(p, Packet::Read { reference } if reference == "LD0/CSWI1.Pos.ctlModel")));
        assert_eq!(
            ied.value("LD0/CSWI1.Pos.stVal"),
            Some(MmsValue::Integer(1))
        );
    }

    #[test]
    fn test_vendor_applied_before_connect() {
        let ied = SimulatedIed::new("ABB_REF615");
        let dev = Iec61850Device::new("ABB_REF615", Arc::new(ied), Iec61850Settings::default());
        assert_eq!(dev.vendor(), VendorProfile::Abb);
        assert_eq!(dev.engine().settings().select_operate_delay, Duration::from_millis(150));
    }
}
