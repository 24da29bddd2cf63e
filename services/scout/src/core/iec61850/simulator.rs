//! In-memory IED
//!
//! Implements the MMS client seam over a scripted data model. Used by the
//! `demo` command and by tests: failures can be injected per branch or per
//! control step, and every control-relevant packet is recorded.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::client::{
    ControlObjectClient, ControlParameters, DataAttributeInfo, Fc, IedError, IedErrorCode,
    MmsClient, MmsType, MmsValue,
};
use super::control::{ControlModel, ControlPath};

/// Attribute of a simulated data object
#[derive(Debug, Clone, PartialEq)]
pub struct SimAttribute {
    pub name: String,
    pub fc: Fc,
    pub value: MmsValue,
    pub children: Vec<SimAttribute>,
}

impl SimAttribute {
    pub fn leaf(name: impl Into<String>, fc: Fc, value: MmsValue) -> Self {
        Self {
            name: name.into(),
            fc,
            value,
            children: Vec::new(),
        }
    }

    pub fn structure(name: impl Into<String>, fc: Fc, children: Vec<SimAttribute>) -> Self {
        Self {
            name: name.into(),
            fc,
            value: MmsValue::Structure(Vec::new()),
            children,
        }
    }

    fn mms_type(&self) -> MmsType {
        if self.children.is_empty() {
            self.value.mms_type()
        } else {
            MmsType::Structure
        }
    }

    fn current_value(&self) -> MmsValue {
        if self.children.is_empty() {
            self.value.clone()
        } else {
            MmsValue::Structure(self.children.iter().map(|c| c.current_value()).collect())
        }
    }

    fn find(&self, path: &[&str]) -> Option<&SimAttribute> {
        match path.split_first() {
            None => Some(self),
            Some((head, rest)) => self
                .children
                .iter()
                .find(|c| c.name == *head)
                .and_then(|c| c.find(rest)),
        }
    }

    fn find_mut(&mut self, path: &[&str]) -> Option<&mut SimAttribute> {
        match path.split_first() {
            None => Some(self),
            Some((head, rest)) => self
                .children
                .iter_mut()
                .find(|c| c.name == *head)
                .and_then(|c| c.find_mut(rest)),
        }
    }
}

/// Packet observed by the simulated device
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Read {
        reference: String,
    },
    Write {
        reference: String,
        value: MmsValue,
    },
    CreateControlObject {
        object: String,
    },
    Select {
        object: String,
        path: ControlPath,
        ctl_num: u8,
        with_value: bool,
    },
    Operate {
        object: String,
        path: ControlPath,
        ctl_num: u8,
        value: MmsValue,
    },
    Cancel {
        object: String,
        path: ControlPath,
    },
}

impl Packet {
    pub fn is_operate(&self) -> bool {
        matches!(self, Packet::Operate { .. })
    }

    pub fn is_select(&self) -> bool {
        matches!(self, Packet::Select { .. })
    }
}

type DataObjects = BTreeMap<String, Vec<SimAttribute>>;
type LogicalNodes = BTreeMap<String, DataObjects>;

#[derive(Debug, Default)]
struct Faults {
    refuse_connect: bool,
    unresponsive: bool,
    ln_listing: HashSet<String>,
    do_listing: HashSet<String>,
    directory: HashSet<String>,
    reads: HashMap<String, IedErrorCode>,
    control_object_unavailable: bool,
    select: Option<IedErrorCode>,
    operate: Option<IedErrorCode>,
    cancel: Option<IedErrorCode>,
    prefixed_logical_nodes: bool,
}

#[derive(Debug)]
struct SimState {
    connected: bool,
    model: BTreeMap<String, LogicalNodes>,
    faults: Faults,
    selected: HashSet<String>,
    packets: Vec<(Instant, Packet)>,
}

/// Simulated IED implementing [`MmsClient`]
#[derive(Clone)]
pub struct SimulatedIed {
    name: Arc<str>,
    state: Arc<Mutex<SimState>>,
}

impl std::fmt::Debug for SimulatedIed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedIed")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Split `LD/LN.DO[.DA...]` into its segments
fn parse_reference(reference: &str) -> Option<(&str, &str, Option<&str>, Vec<&str>)> {
    let (ld, rest) = reference.split_once('/')?;
    let mut parts = rest.split('.');
    let ln = parts.next()?;
    let data_object = parts.next();
    Some((ld, ln, data_object, parts.collect()))
}

fn operate_value(payload: &MmsValue) -> Result<(MmsValue, u8), IedError> {
    match payload {
        MmsValue::Structure(items) if items.len() == 7 => {
            let ctl_num = items[3].as_i64().unwrap_or(0) as u8;
            Ok((items[0].clone(), ctl_num))
        },
        _ => Err(IedError::new(
            IedErrorCode::TypeInconsistent,
            "control structure must carry 7 elements",
        )),
    }
}

impl SimulatedIed {
    pub fn new(name: impl Into<String>) -> Self {
        let name: String = name.into();
        Self {
            name: Arc::from(name.as_str()),
            state: Arc::new(Mutex::new(SimState {
                connected: true,
                model: BTreeMap::new(),
                faults: Faults::default(),
                selected: HashSet::new(),
                packets: Vec::new(),
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // ------------------------------------------------------------------------
    // Model building
    // ------------------------------------------------------------------------

    /// Add an attribute (leaf or structure) to `LD/LN.DO`
    pub fn with_data_attribute(
        self,
        ld: &str,
        ln: &str,
        data_object: &str,
        attribute: SimAttribute,
    ) -> Self {
        {
            let mut state = self.state.lock();
            state
                .model
                .entry(ld.to_string())
                .or_default()
                .entry(ln.to_string())
                .or_default()
                .entry(data_object.to_string())
                .or_default()
                .push(attribute);
        }
        self
    }

    /// Add a leaf attribute
    pub fn with_attribute(
        self,
        ld: &str,
        ln: &str,
        data_object: &str,
        name: &str,
        fc: Fc,
        value: MmsValue,
    ) -> Self {
        self.with_data_attribute(ld, ln, data_object, SimAttribute::leaf(name, fc, value))
    }

    /// Add a measured value `mag.f` with quality and timestamp
    pub fn with_measurement(self, ld: &str, ln: &str, data_object: &str, value: f64) -> Self {
        self.with_data_attribute(
            ld,
            ln,
            data_object,
            SimAttribute::structure(
                "mag",
                Fc::Mx,
                vec![SimAttribute::leaf("f", Fc::Mx, MmsValue::Float(value))],
            ),
        )
        .with_attribute(ld, ln, data_object, "q", Fc::Mx, MmsValue::BitString { bits: 0, size: 13 })
        .with_attribute(ld, ln, data_object, "t", Fc::Mx, MmsValue::UtcTime(Utc::now()))
    }

    /// Add a controllable data object with the given control model
    pub fn with_control_point(self, ld: &str, ln: &str, data_object: &str, model: ControlModel) -> Self {
        let mut ied = self
            .with_attribute(ld, ln, data_object, "stVal", Fc::St, MmsValue::Integer(1))
            .with_attribute(ld, ln, data_object, "q", Fc::St, MmsValue::BitString { bits: 0, size: 13 })
            .with_attribute(ld, ln, data_object, "t", Fc::St, MmsValue::UtcTime(Utc::now()))
            .with_attribute(ld, ln, data_object, "ctlModel", Fc::Cf, MmsValue::Integer(model.value()));

        if model.is_controllable() {
            ied = ied
                .with_data_attribute(ld, ln, data_object, control_attribute("Oper", 7))
                .with_data_attribute(ld, ln, data_object, control_attribute("Cancel", 6));
        }
        match model {
            ControlModel::SboNormal => ied.with_attribute(
                ld,
                ln,
                data_object,
                "SBO",
                Fc::Co,
                MmsValue::VisibleString(String::new()),
            ),
            ControlModel::SboEnhanced => {
                ied.with_data_attribute(ld, ln, data_object, control_attribute("SBOw", 7))
            },
            _ => ied,
        }
    }

    /// Small bay model used by the CLI when a device is marked `simulated`
    ///
    /// `LD0` carries a breaker (`CSWI1.Pos`, SBO normal), an enhanced-security
    /// switch (`CSWI2.Pos`), a direct-control output (`GGIO1.SPCSO1`) and two
    /// measurements on `MMXU1`.
    pub fn with_demo_model(self) -> Self {
        self.with_control_point("LD0", "CSWI1", "Pos", ControlModel::SboNormal)
            .with_control_point("LD0", "CSWI2", "Pos", ControlModel::SboEnhanced)
            .with_control_point("LD0", "GGIO1", "SPCSO1", ControlModel::DirectNormal)
            .with_measurement("LD0", "MMXU1", "TotW", 1250.0)
            .with_measurement("LD0", "MMXU1", "TotVAr", -80.5)
    }

    // ------------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------------

    pub fn fail_logical_node_listing(&self, ld: &str) {
        self.state.lock().faults.ln_listing.insert(ld.to_string());
    }

    pub fn fail_data_object_listing(&self, ln_ref: &str) {
        self.state.lock().faults.do_listing.insert(ln_ref.to_string());
    }

    pub fn fail_directory(&self, reference: &str) {
        self.state.lock().faults.directory.insert(reference.to_string());
    }

    pub fn fail_read(&self, reference: &str, code: IedErrorCode) {
        self.state
            .lock()
            .faults
            .reads
            .insert(reference.to_string(), code);
    }

    pub fn clear_read_failure(&self, reference: &str) {
        self.state.lock().faults.reads.remove(reference);
    }

    /// Make control-object instantiation fail (forces the fallback path)
    pub fn set_control_object_unavailable(&self, unavailable: bool) {
        self.state.lock().faults.control_object_unavailable = unavailable;
    }

    pub fn reject_select(&self, code: Option<IedErrorCode>) {
        self.state.lock().faults.select = code;
    }

    pub fn reject_operate(&self, code: Option<IedErrorCode>) {
        self.state.lock().faults.operate = code;
    }

    pub fn reject_cancel(&self, code: Option<IedErrorCode>) {
        self.state.lock().faults.cancel = code;
    }

    /// Every call hangs until the caller's timeout fires
    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.state.lock().faults.unresponsive = unresponsive;
    }

    pub fn set_refuse_connect(&self, refuse: bool) {
        self.state.lock().faults.refuse_connect = refuse;
    }

    /// Return logical-node names already prefixed with `LD/` (firmware quirk)
    pub fn with_prefixed_logical_nodes(self, prefixed: bool) -> Self {
        self.state.lock().faults.prefixed_logical_nodes = prefixed;
        self
    }

    /// Drop the association from the device side
    pub fn disconnect_now(&self) {
        let mut state = self.state.lock();
        state.connected = false;
        state.selected.clear();
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    pub fn packets(&self) -> Vec<Packet> {
        self.state.lock().packets.iter().map(|(_, p)| p.clone()).collect()
    }

    pub fn timed_packets(&self) -> Vec<(Instant, Packet)> {
        self.state.lock().packets.clone()
    }

    /// Control packets only (select, operate, cancel)
    pub fn control_packets(&self) -> Vec<Packet> {
        self.packets()
            .into_iter()
            .filter(|p| {
                matches!(
                    p,
                    Packet::Select { .. } | Packet::Operate { .. } | Packet::Cancel { .. }
                )
            })
            .collect()
    }

    pub fn clear_packets(&self) {
        self.state.lock().packets.clear();
    }

    /// Current value of an attribute, bypassing the wire
    pub fn value(&self, reference: &str) -> Option<MmsValue> {
        let state = self.state.lock();
        Self::lookup(&state, reference).map(|a| a.current_value())
    }

    pub fn set_value(&self, reference: &str, value: MmsValue) -> bool {
        let mut state = self.state.lock();
        match Self::lookup_mut(&mut state, reference) {
            Some(attr) => {
                attr.value = value;
                true
            },
            None => false,
        }
    }

    pub fn is_selected(&self, object: &str) -> bool {
        self.state.lock().selected.contains(object)
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn lookup<'a>(state: &'a SimState, reference: &str) -> Option<&'a SimAttribute> {
        let (ld, ln, data_object, path) = parse_reference(reference)?;
        let attrs = state.model.get(ld)?.get(ln)?.get(data_object?)?;
        let (head, rest) = path.split_first()?;
        attrs.iter().find(|a| a.name == *head)?.find(rest)
    }

    fn lookup_mut<'a>(state: &'a mut SimState, reference: &str) -> Option<&'a mut SimAttribute> {
        let (ld, ln, data_object, path) = parse_reference(reference)?;
        let attrs = state
            .model
            .get_mut(ld)?
            .get_mut(ln)?
            .get_mut(data_object?)?;
        let (head, rest) = path.split_first()?;
        attrs.iter_mut().find(|a| a.name == *head)?.find_mut(rest)
    }

    fn model_of(state: &SimState, object: &str) -> ControlModel {
        Self::lookup(state, &format!("{object}.ctlModel"))
            .and_then(|a| a.value.as_i64())
            .map(ControlModel::from_value)
            .unwrap_or(ControlModel::StatusOnly)
    }

    fn record(state: &mut SimState, packet: Packet) {
        state.packets.push((Instant::now(), packet));
    }

    /// Common entry: connection check and optional hang
    async fn gate(&self) -> Result<(), IedError> {
        let (connected, unresponsive) = {
            let state = self.state.lock();
            (state.connected, state.faults.unresponsive)
        };
        if !connected {
            return Err(IedError::not_connected());
        }
        if unresponsive {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    fn select_locked(
        state: &mut SimState,
        object: &str,
        path: ControlPath,
        ctl_num: u8,
        with_value: bool,
    ) -> Result<(), IedError> {
        Self::record(
            state,
            Packet::Select {
                object: object.to_string(),
                path,
                ctl_num,
                with_value,
            },
        );
        if let Some(code) = state.faults.select {
            return Err(IedError::new(code, format!("select {object} refused")));
        }
        if !Self::model_of(state, object).is_sbo() {
            return Err(IedError::new(
                IedErrorCode::ObjectAccessUnsupported,
                format!("{object} has no select service"),
            ));
        }
        state.selected.insert(object.to_string());
        Ok(())
    }

    fn operate_locked(
        state: &mut SimState,
        object: &str,
        path: ControlPath,
        ctl_num: u8,
        value: &MmsValue,
    ) -> Result<(), IedError> {
        Self::record(
            state,
            Packet::Operate {
                object: object.to_string(),
                path,
                ctl_num,
                value: value.clone(),
            },
        );
        if let Some(code) = state.faults.operate {
            return Err(IedError::new(code, format!("operate {object} refused")));
        }
        let model = Self::model_of(state, object);
        if !model.is_controllable() {
            return Err(IedError::new(
                IedErrorCode::ObjectAccessUnsupported,
                format!("{object} is status-only"),
            ));
        }
        if model.is_sbo() && !state.selected.remove(object) {
            return Err(IedError::new(
                IedErrorCode::AccessDenied,
                format!("{object} not selected"),
            ));
        }

        if let Some(st_val) = Self::lookup_mut(state, &format!("{object}.stVal")) {
            st_val.value = match (&st_val.value, value) {
                (MmsValue::Integer(_), MmsValue::Boolean(on)) => {
                    MmsValue::Integer(if *on { 2 } else { 1 })
                },
                _ => value.clone(),
            };
        }
        Ok(())
    }

    fn cancel_locked(state: &mut SimState, object: &str, path: ControlPath) -> Result<(), IedError> {
        Self::record(
            state,
            Packet::Cancel {
                object: object.to_string(),
                path,
            },
        );
        if let Some(code) = state.faults.cancel {
            return Err(IedError::new(code, format!("cancel {object} refused")));
        }
        state.selected.remove(object);
        Ok(())
    }
}

fn control_attribute(name: &str, elements: usize) -> SimAttribute {
    let mut children = vec![
        SimAttribute::leaf("ctlVal", Fc::Co, MmsValue::Boolean(false)),
        SimAttribute::leaf("operTm", Fc::Co, MmsValue::UtcTime(DateTime::<Utc>::default())),
        SimAttribute::structure(
            "origin",
            Fc::Co,
            vec![
                SimAttribute::leaf("orCat", Fc::Co, MmsValue::Integer(0)),
                SimAttribute::leaf("orIdent", Fc::Co, MmsValue::VisibleString(String::new())),
            ],
        ),
        SimAttribute::leaf("ctlNum", Fc::Co, MmsValue::Unsigned(0)),
        SimAttribute::leaf("T", Fc::Co, MmsValue::UtcTime(DateTime::<Utc>::default())),
        SimAttribute::leaf("Test", Fc::Co, MmsValue::Boolean(false)),
        SimAttribute::leaf("Check", Fc::Co, MmsValue::BitString { bits: 0, size: 2 }),
    ];
    children.truncate(elements);
    SimAttribute::structure(name, Fc::Co, children)
}

#[async_trait]
impl MmsClient for SimulatedIed {
    async fn connect(&self) -> Result<(), IedError> {
        let mut state = self.state.lock();
        if state.faults.refuse_connect {
            return Err(IedError::new(
                IedErrorCode::ConnectionRejected,
                format!("{} refused association", self.name),
            ));
        }
        state.connected = true;
        Ok(())
    }

    async fn disconnect(&self) {
        self.disconnect_now();
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    async fn logical_devices(&self) -> Result<Vec<String>, IedError> {
        self.gate().await?;
        Ok(self.state.lock().model.keys().cloned().collect())
    }

    async fn logical_nodes(&self, logical_device: &str) -> Result<Vec<String>, IedError> {
        self.gate().await?;
        let state = self.state.lock();
        if state.faults.ln_listing.contains(logical_device) {
            return Err(IedError::new(
                IedErrorCode::ObjectAccessUnsupported,
                format!("{logical_device}: directory service failed"),
            ));
        }
        let lns = state
            .model
            .get(logical_device)
            .ok_or_else(|| IedError::object_not_found(logical_device))?;
        Ok(lns
            .keys()
            .map(|ln| {
                if state.faults.prefixed_logical_nodes {
                    format!("{logical_device}/{ln}")
                } else {
                    ln.clone()
                }
            })
            .collect())
    }

    async fn data_objects(&self, logical_node_ref: &str) -> Result<Vec<String>, IedError> {
        self.gate().await?;
        let state = self.state.lock();
        if state.faults.do_listing.contains(logical_node_ref) {
            return Err(IedError::new(
                IedErrorCode::Timeout,
                format!("{logical_node_ref}: no response"),
            ));
        }
        let (ld, ln) = logical_node_ref
            .split_once('/')
            .ok_or_else(|| IedError::new(IedErrorCode::ObjectReferenceInvalid, logical_node_ref))?;
        let dos = state
            .model
            .get(ld)
            .and_then(|lns| lns.get(ln))
            .ok_or_else(|| IedError::object_not_found(logical_node_ref))?;
        Ok(dos.keys().cloned().collect())
    }

    async fn data_directory(&self, reference: &str) -> Result<Vec<DataAttributeInfo>, IedError> {
        self.gate().await?;
        let state = self.state.lock();
        if state.faults.directory.contains(reference) {
            return Err(IedError::new(
                IedErrorCode::ObjectAccessUnsupported,
                format!("{reference}: directory service failed"),
            ));
        }
        let (ld, ln, data_object, path) = parse_reference(reference)
            .ok_or_else(|| IedError::new(IedErrorCode::ObjectReferenceInvalid, reference))?;
        let attrs = data_object
            .and_then(|d| state.model.get(ld)?.get(ln)?.get(d))
            .ok_or_else(|| IedError::object_not_found(reference))?;

        if path.is_empty() {
            return Ok(attrs
                .iter()
                .map(|a| DataAttributeInfo::new(a.name.clone(), Some(a.fc), a.mms_type()))
                .collect());
        }

        let attr = path
            .split_first()
            .and_then(|(head, rest)| attrs.iter().find(|a| a.name == *head)?.find(rest))
            .filter(|a| !a.children.is_empty())
            .ok_or_else(|| IedError::object_not_found(reference))?;
        Ok(attr
            .children
            .iter()
            .map(|c| DataAttributeInfo::new(c.name.clone(), None, c.mms_type()))
            .collect())
    }

    async fn read_value(&self, reference: &str, _fc: Fc) -> Result<MmsValue, IedError> {
        self.gate().await?;
        let mut state = self.state.lock();
        Self::record(
            &mut state,
            Packet::Read {
                reference: reference.to_string(),
            },
        );
        if let Some(code) = state.faults.reads.get(reference) {
            return Err(IedError::new(*code, reference));
        }
        Self::lookup(&state, reference)
            .map(|a| a.current_value())
            .ok_or_else(|| IedError::object_not_found(reference))
    }

    async fn write_value(&self, reference: &str, _fc: Fc, value: MmsValue) -> Result<(), IedError> {
        self.gate().await?;
        let mut state = self.state.lock();

        let control = [".SBOw", ".SBO", ".Oper", ".Cancel"]
            .iter()
            .find_map(|suffix| reference.strip_suffix(suffix).map(|obj| (*suffix, obj)));

        match control {
            Some((".SBOw" | ".SBO", object)) => {
                let (_, ctl_num) = operate_value(&value)?;
                Self::select_locked(&mut state, object, ControlPath::Fallback, ctl_num, true)
            },
            Some((".Oper", object)) => {
                let (ctl_val, ctl_num) = operate_value(&value)?;
                Self::operate_locked(&mut state, object, ControlPath::Fallback, ctl_num, &ctl_val)
            },
            Some((_, object)) => Self::cancel_locked(&mut state, object, ControlPath::Fallback),
            None => {
                Self::record(
                    &mut state,
                    Packet::Write {
                        reference: reference.to_string(),
                        value: value.clone(),
                    },
                );
                let attr = Self::lookup_mut(&mut state, reference)
                    .ok_or_else(|| IedError::object_not_found(reference))?;
                if !attr.children.is_empty() || attr.value.mms_type() != value.mms_type() {
                    return Err(IedError::new(IedErrorCode::TypeInconsistent, reference));
                }
                attr.value = value;
                Ok(())
            },
        }
    }

    async fn create_control_object(
        &self,
        object_ref: &str,
    ) -> Result<Box<dyn ControlObjectClient>, IedError> {
        self.gate().await?;
        let mut state = self.state.lock();
        Self::record(
            &mut state,
            Packet::CreateControlObject {
                object: object_ref.to_string(),
            },
        );
        if state.faults.control_object_unavailable {
            return Err(IedError::new(
                IedErrorCode::Unknown,
                format!("control object client for {object_ref} could not be created"),
            ));
        }
        if Self::lookup(&state, &format!("{object_ref}.ctlModel")).is_none() {
            return Err(IedError::object_not_found(object_ref));
        }
        let model = Self::model_of(&state, object_ref);
        Ok(Box::new(SimControlObject {
            object: object_ref.to_string(),
            model,
            params: None,
            ied: self.clone(),
        }))
    }
}

/// Control object client bound to one simulated data object
struct SimControlObject {
    object: String,
    model: ControlModel,
    params: Option<ControlParameters>,
    ied: SimulatedIed,
}

impl SimControlObject {
    fn ctl_num(&self) -> u8 {
        self.params.as_ref().map(|p| p.ctl_num).unwrap_or(0)
    }
}

#[async_trait]
impl ControlObjectClient for SimControlObject {
    fn object_reference(&self) -> &str {
        &self.object
    }

    fn control_model(&self) -> ControlModel {
        self.model
    }

    fn set_parameters(&mut self, params: &ControlParameters) {
        self.params = Some(params.clone());
    }

    async fn select(&mut self) -> Result<(), IedError> {
        self.ied.gate().await?;
        let mut state = self.ied.state.lock();
        SimulatedIed::select_locked(&mut state, &self.object, ControlPath::Primary, self.ctl_num(), false)
    }

    async fn select_with_value(&mut self, _value: &MmsValue) -> Result<(), IedError> {
        self.ied.gate().await?;
        let mut state = self.ied.state.lock();
        SimulatedIed::select_locked(&mut state, &self.object, ControlPath::Primary, self.ctl_num(), true)
    }

    async fn operate(&mut self, value: &MmsValue) -> Result<(), IedError> {
        self.ied.gate().await?;
        let mut state = self.ied.state.lock();
        SimulatedIed::operate_locked(&mut state, &self.object, ControlPath::Primary, self.ctl_num(), value)
    }

    async fn cancel(&mut self) -> Result<(), IedError> {
        self.ied.gate().await?;
        let mut state = self.ied.state.lock();
        SimulatedIed::cancel_locked(&mut state, &self.object, ControlPath::Primary)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_directory_and_reads() {
        let ied = SimulatedIed::new("IED1").with_control_point("LD0", "CSWI1", "Pos", ControlModel::SboEnhanced);
        let dir = ied.data_directory("LD0/CSWI1.Pos").await.unwrap();
        let names: Vec<_> = dir.iter().map(|d| d.name.as_str()).collect();
        assert!(names.contains(&"SBOw"));
        assert!(names.contains(&"Oper"));

        let oper = ied.data_directory("LD0/CSWI1.Pos.Oper").await.unwrap();
        assert_eq!(oper.len(), 7);
        assert!(oper.iter().all(|e| e.fc.is_none()));

        let model = ied.read_value("LD0/CSWI1.Pos.ctlModel", Fc::Cf).await.unwrap();
        assert_eq!(model, MmsValue::Integer(4));
    }

    #[tokio::test]
    async fn test_bare_scalar_oper_write_rejected() {
        let ied = SimulatedIed::new("IED1").with_control_point("LD0", "CSWI1", "Pos", ControlModel::DirectNormal);
        let err = ied
            .write_value("LD0/CSWI1.Pos.Oper", Fc::Co, MmsValue::Boolean(true))
            .await
            .unwrap_err();
        assert_eq!(err.code, IedErrorCode::TypeInconsistent);
    }

    #[tokio::test]
    async fn test_not_connected_after_disconnect() {
        let ied = SimulatedIed::new("IED1").with_attribute("LD0", "LLN0", "Mod", "stVal", Fc::St, MmsValue::Integer(1));
        ied.disconnect_now();
        let err = ied.logical_devices().await.unwrap_err();
        assert_eq!(err.code, IedErrorCode::NotConnected);
        ied.connect().await.unwrap();
        assert_eq!(ied.logical_devices().await.unwrap(), vec!["LD0".to_string()]);
    }
}
