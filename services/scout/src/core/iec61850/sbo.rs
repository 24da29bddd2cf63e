//! Select-before-operate control engine
//!
//! ```text
//! IDLE ──(SBO model)──> SELECTING ──ok──> SELECTED ──operate──> OPERATING ──ok──> COMPLETE
//!   │                      │                 │  └──cancel──> CANCELLED    │
//!   └──(direct model)──────┼─────────────────┼──────────────> OPERATING   └─err─> FAILED
//!                          └─err──> FAILED   └─window lapses─> IDLE
//! ```
//!
//! Each object reference owns one context entry behind an async mutex that is
//! held for the whole select, wait, operate sequence, so two commands against
//! the same object never interleave. Every state change is also published to
//! a lock-free snapshot map so status queries never wait on a running
//! sequence. The cache is connection-scoped: call
//! [`ControlEngine::invalidate`] on connect and disconnect.
//!
//! Two transmission paths exist. The primary path instantiates the stack's
//! control object client. When instantiation fails (distinct from a refused
//! action) the engine writes the full control structure straight to
//! `.SBOw`/`.SBO`/`.Oper` instead. Nothing is retried automatically.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::client::{ControlObjectClient, ControlParameters, Fc, IedError, MmsClient, MmsValue};
use super::control::{
    CommandOptions, ControlContext, ControlModel, ControlPath, ControlState, Originator,
    SboCapabilities,
};
use crate::error::ControlError;

/// Engine timing and identity settings
#[derive(Debug, Clone)]
pub struct ControlSettings {
    /// Bound applied to every network call
    pub call_timeout: Duration,
    /// Default wait between SELECT and OPERATE
    pub select_operate_delay: Duration,
    /// How long a selection is considered live locally
    pub select_window: Duration,
    pub originator: Originator,
    pub interlock_check: bool,
    pub synchro_check: bool,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_millis(5000),
            select_operate_delay: Duration::from_millis(100),
            select_window: Duration::from_millis(30_000),
            originator: Originator::default(),
            interlock_check: false,
            synchro_check: false,
        }
    }
}

/// Result of a successful control action
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandOutcome {
    pub object_reference: String,
    pub model: ControlModel,
    pub path: ControlPath,
    /// Control number carried by the operate
    pub ctl_num: u8,
    /// Whether a SELECT preceded the operate
    pub selected: bool,
}

#[derive(Default)]
struct ContextEntry {
    context: Option<ControlContext>,
    client: Option<Box<dyn ControlObjectClient>>,
    primary_unavailable: bool,
}

/// Control state machine for one connected device
pub struct ControlEngine {
    device: String,
    client: Arc<dyn MmsClient>,
    settings: ControlSettings,
    contexts: DashMap<String, Arc<Mutex<ContextEntry>>>,
    /// Last published context per object, readable while a sequence holds the entry lock
    observed: DashMap<String, ControlContext>,
}

impl std::fmt::Debug for ControlEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlEngine")
            .field("device", &self.device)
            .field("contexts", &self.contexts.len())
            .finish()
    }
}

impl ControlEngine {
    pub fn new(device: impl Into<String>, client: Arc<dyn MmsClient>, settings: ControlSettings) -> Self {
        Self {
            device: device.into(),
            client,
            settings,
            contexts: DashMap::new(),
            observed: DashMap::new(),
        }
    }

    pub fn settings(&self) -> &ControlSettings {
        &self.settings
    }

    /// Drop every cached context (connection torn down or re-established)
    pub fn invalidate(&self) {
        let count = self.contexts.len();
        self.contexts.clear();
        self.observed.clear();
        if count > 0 {
            debug!(device = %self.device, count, "Control contexts invalidated");
        }
    }

    fn publish(&self, ctx: &ControlContext) {
        self.observed
            .insert(ctx.object_reference.clone(), ctx.clone());
    }

    fn entry(&self, object_ref: &str) -> Arc<Mutex<ContextEntry>> {
        self.contexts
            .entry(object_ref.to_string())
            .or_default()
            .clone()
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, IedError>
    where
        F: Future<Output = Result<T, IedError>>,
    {
        match tokio::time::timeout(self.settings.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(IedError::timeout(format!(
                "no response within {} ms",
                self.settings.call_timeout.as_millis()
            ))),
        }
    }

    // ========================================================================
    // Context initialization
    // ========================================================================

    /// Read the control model and detect select capability, once per connection
    pub async fn initialize(&self, object_ref: &str) -> Result<ControlContext, ControlError> {
        let entry = self.entry(object_ref);
        let mut guard = entry.lock().await;
        self.load_context(object_ref, &mut guard.context).await?;
        guard
            .context
            .clone()
            .ok_or_else(|| ControlError::InvalidReference(object_ref.to_string()))
    }

    /// Last published context, without touching the device or waiting on a
    /// sequence in progress
    pub fn context(&self, object_ref: &str) -> Option<ControlContext> {
        self.observed.get(object_ref).map(|c| c.value().clone())
    }

    /// Observed state for an object; a lapsed selection reads as idle
    pub fn state(&self, object_ref: &str) -> ControlState {
        self.context(object_ref)
            .map(|ctx| ctx.effective_state(self.settings.select_window))
            .unwrap_or(ControlState::Idle)
    }

    async fn load_context(
        &self,
        object_ref: &str,
        slot: &mut Option<ControlContext>,
    ) -> Result<(), ControlError> {
        if slot.is_some() {
            return Ok(());
        }

        let model_ref = format!("{object_ref}.ctlModel");
        let model = match self.bounded(self.client.read_value(&model_ref, Fc::Cf)).await {
            Ok(value) => match value.as_i64() {
                Some(raw) => ControlModel::from_value(raw),
                None => {
                    warn!(
                        device = %self.device,
                        object = %object_ref,
                        "ctlModel has unexpected type {:?}, treating as status-only",
                        value.mms_type()
                    );
                    ControlModel::StatusOnly
                },
            },
            Err(e) if e.code.is_connection_error() => {
                warn!(device = %self.device, object = %object_ref, error_code = e.code.code(), "ctlModel read failed: not connected");
                return Err(ControlError::NotConnected);
            },
            Err(e) => {
                warn!(
                    device = %self.device,
                    object = %object_ref,
                    error_code = e.code.code(),
                    "ctlModel read failed ({}), treating as status-only",
                    e
                );
                ControlModel::StatusOnly
            },
        };

        let mut ctx = ControlContext::new(object_ref, model);
        if model.is_sbo() {
            // Existence check only; SBO/SBOw are structures and cannot be read as scalars
            match self.bounded(self.client.data_directory(object_ref)).await {
                Ok(entries) => {
                    let has = |name: &str| entries.iter().any(|e| e.name == name);
                    ctx.apply_capabilities(SboCapabilities {
                        has_sbow: has("SBOw"),
                        has_sbo: has("SBO"),
                        has_oper: has("Oper"),
                    });
                },
                Err(e) => warn!(
                    device = %self.device,
                    object = %object_ref,
                    error_code = e.code.code(),
                    "Select capability check failed: {}",
                    e
                ),
            }
        }

        info!(
            device = %self.device,
            object = %object_ref,
            model = %model,
            sbo_ref = ctx.sbo_reference.as_deref().unwrap_or("-"),
            "Control context initialized"
        );
        self.publish(&ctx);
        *slot = Some(ctx);
        Ok(())
    }

    // ========================================================================
    // Public operations
    // ========================================================================

    /// Full command: SELECT, wait, OPERATE for SBO models; OPERATE alone otherwise
    pub async fn send_command(
        &self,
        object_ref: &str,
        value: &MmsValue,
        options: &CommandOptions,
    ) -> Result<CommandOutcome, ControlError> {
        let entry = self.entry(object_ref);
        let mut guard = entry.lock().await;
        let ContextEntry {
            context,
            client,
            primary_unavailable,
        } = &mut *guard;

        self.load_context(object_ref, context).await?;
        let Some(ctx) = context.as_mut() else {
            return Err(ControlError::InvalidReference(object_ref.to_string()));
        };

        if ctx.is_selected(self.settings.select_window) {
            return Err(ControlError::AlreadySelected);
        }
        if !ctx.model.is_controllable() && !options.force_direct && !options.force_sbo {
            ctx.state = ControlState::Failed;
            self.publish(ctx);
            return Err(ControlError::NotControllable);
        }

        let use_select = (ctx.model.is_sbo() && !options.force_direct) || options.force_sbo;
        let params = self.parameters(ctx, options);

        if use_select {
            self.do_select(ctx, client, primary_unavailable, value, &params)
                .await?;
            let delay = options
                .sbo_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(self.settings.select_operate_delay);
            tokio::time::sleep(delay).await;
        }

        let preferred = ctx.selected_path;
        self.do_operate(ctx, client, primary_unavailable, value, &params, preferred, use_select)
            .await
    }

    /// Explicit SELECT; the caller follows with [`Self::operate`] or [`Self::cancel`]
    pub async fn select(
        &self,
        object_ref: &str,
        value: &MmsValue,
        options: &CommandOptions,
    ) -> Result<ControlPath, ControlError> {
        let entry = self.entry(object_ref);
        let mut guard = entry.lock().await;
        let ContextEntry {
            context,
            client,
            primary_unavailable,
        } = &mut *guard;

        self.load_context(object_ref, context).await?;
        let Some(ctx) = context.as_mut() else {
            return Err(ControlError::InvalidReference(object_ref.to_string()));
        };

        if ctx.is_selected(self.settings.select_window) {
            return Err(ControlError::AlreadySelected);
        }
        if !ctx.model.is_sbo() && !options.force_sbo {
            return Err(if ctx.model.is_controllable() {
                ControlError::SelectNotApplicable(ctx.model)
            } else {
                ControlError::NotControllable
            });
        }

        let params = self.parameters(ctx, options);
        self.do_select(ctx, client, primary_unavailable, value, &params)
            .await
    }

    /// Explicit OPERATE; SBO models require a live selection
    ///
    /// Without one the call fails with `NotSelected` and nothing is sent.
    pub async fn operate(
        &self,
        object_ref: &str,
        value: &MmsValue,
        options: &CommandOptions,
    ) -> Result<CommandOutcome, ControlError> {
        let entry = self.entry(object_ref);
        let mut guard = entry.lock().await;
        let ContextEntry {
            context,
            client,
            primary_unavailable,
        } = &mut *guard;

        self.load_context(object_ref, context).await?;
        let Some(ctx) = context.as_mut() else {
            return Err(ControlError::InvalidReference(object_ref.to_string()));
        };

        if !ctx.model.is_controllable() && !options.force_direct && !options.force_sbo {
            return Err(ControlError::NotControllable);
        }

        let needs_select = (ctx.model.is_sbo() && !options.force_direct) || options.force_sbo;
        let selected = ctx.is_selected(self.settings.select_window);
        if needs_select && !selected {
            if ctx.state == ControlState::Selected {
                ctx.state = ControlState::Idle;
                ctx.clear_selection();
                self.publish(ctx);
            }
            warn!(
                device = %self.device,
                object = %object_ref,
                model = %ctx.model,
                "Operate refused locally: no live selection"
            );
            return Err(ControlError::NotSelected);
        }

        let params = self.parameters(ctx, options);
        let preferred = if selected { ctx.selected_path } else { None };
        self.do_operate(ctx, client, primary_unavailable, value, &params, preferred, selected)
            .await
    }

    /// Release an outstanding selection
    pub async fn cancel(&self, object_ref: &str) -> Result<(), ControlError> {
        let entry = self.entry(object_ref);
        let mut guard = entry.lock().await;
        let ContextEntry { context, client, .. } = &mut *guard;

        let Some(ctx) = context.as_mut() else {
            return Err(ControlError::NotSelected);
        };
        if !ctx.is_selected(self.settings.select_window) {
            return Err(ControlError::NotSelected);
        }

        let path = ctx.selected_path.unwrap_or(ControlPath::Fallback);
        let result = match (path, client.as_mut()) {
            (ControlPath::Primary, Some(control)) => self.bounded(control.cancel()).await,
            _ => {
                let params = self.parameters(ctx, &CommandOptions::default());
                let cancel_ref = format!("{object_ref}.Cancel");
                let payload = cancel_structure(&MmsValue::Boolean(false), &params);
                self.bounded(self.client.write_value(&cancel_ref, Fc::Co, payload))
                    .await
            },
        };

        match result {
            Ok(()) => {
                ctx.state = ControlState::Cancelled;
                ctx.clear_selection();
                self.publish(ctx);
                info!(device = %self.device, object = %object_ref, path = path.as_str(), "Selection cancelled");
                Ok(())
            },
            Err(e) => {
                warn!(
                    device = %self.device,
                    object = %object_ref,
                    path = path.as_str(),
                    error_code = e.code.code(),
                    "Cancel failed: {}",
                    e
                );
                Err(ControlError::from_cancel(&e))
            },
        }
    }

    // ========================================================================
    // Transmission
    // ========================================================================

    fn parameters(&self, ctx: &ControlContext, options: &CommandOptions) -> ControlParameters {
        ControlParameters {
            originator: options.originator(&self.settings.originator),
            ctl_num: ctx.ctl_num,
            test: false,
            interlock_check: self.settings.interlock_check,
            synchro_check: self.settings.synchro_check,
        }
    }

    /// Instantiate the control object client once; returns whether it is usable
    async fn ensure_client(
        &self,
        object_ref: &str,
        slot: &mut Option<Box<dyn ControlObjectClient>>,
        unavailable: &mut bool,
    ) -> Result<bool, ControlError> {
        if slot.is_some() {
            return Ok(true);
        }
        if *unavailable {
            return Ok(false);
        }

        match self.bounded(self.client.create_control_object(object_ref)).await {
            Ok(control) => {
                debug!(
                    device = %self.device,
                    object = %object_ref,
                    model = %control.control_model(),
                    "Control object client created"
                );
                *slot = Some(control);
                Ok(true)
            },
            Err(e) if e.code.is_connection_error() => Err(ControlError::NotConnected),
            Err(e) => {
                let unavailable_err = ControlError::ControlObjectUnavailable(e.to_string());
                warn!(
                    device = %self.device,
                    object = %object_ref,
                    path = "primary",
                    error_code = e.code.code(),
                    "{}; switching to fallback raw write",
                    unavailable_err
                );
                *unavailable = true;
                Ok(false)
            },
        }
    }

    async fn do_select(
        &self,
        ctx: &mut ControlContext,
        slot: &mut Option<Box<dyn ControlObjectClient>>,
        unavailable: &mut bool,
        value: &MmsValue,
        params: &ControlParameters,
    ) -> Result<ControlPath, ControlError> {
        let object_ref = ctx.object_reference.clone();
        ctx.state = ControlState::Selecting;
        self.publish(ctx);

        let primary = match self.ensure_client(&object_ref, slot, unavailable).await {
            Ok(usable) => usable,
            Err(e) => {
                ctx.state = ControlState::Failed;
                self.publish(ctx);
                return Err(e);
            },
        };

        let (path, result) = match (primary, slot.as_mut()) {
            (true, Some(control)) => {
                control.set_parameters(params);
                debug!(device = %self.device, object = %object_ref, path = "primary", ctl_num = params.ctl_num, "Sending SELECT");
                let result = if ctx.model.is_enhanced() {
                    self.bounded(control.select_with_value(value)).await
                } else {
                    self.bounded(control.select()).await
                };
                (ControlPath::Primary, result)
            },
            _ => {
                let target = ctx.sbo_reference.clone().unwrap_or_else(|| {
                    if ctx.model.is_enhanced() {
                        format!("{object_ref}.SBOw")
                    } else {
                        format!("{object_ref}.SBO")
                    }
                });
                debug!(device = %self.device, object = %object_ref, path = "fallback", target = %target, ctl_num = params.ctl_num, "Writing SELECT structure");
                let payload = control_structure(value, params);
                let result = self
                    .bounded(self.client.write_value(&target, Fc::Co, payload))
                    .await;
                (ControlPath::Fallback, result)
            },
        };

        match result {
            Ok(()) => {
                ctx.mark_selected(path);
                self.publish(ctx);
                info!(
                    device = %self.device,
                    object = %object_ref,
                    path = path.as_str(),
                    ctl_num = params.ctl_num,
                    "Select accepted"
                );
                Ok(path)
            },
            Err(e) => {
                ctx.state = ControlState::Failed;
                ctx.clear_selection();
                self.publish(ctx);
                let err = ControlError::from_select(&e);
                warn!(
                    device = %self.device,
                    object = %object_ref,
                    path = path.as_str(),
                    error_code = e.code.code(),
                    "Select failed: {}",
                    err
                );
                Err(err)
            },
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn do_operate(
        &self,
        ctx: &mut ControlContext,
        slot: &mut Option<Box<dyn ControlObjectClient>>,
        unavailable: &mut bool,
        value: &MmsValue,
        params: &ControlParameters,
        preferred: Option<ControlPath>,
        selected: bool,
    ) -> Result<CommandOutcome, ControlError> {
        let object_ref = ctx.object_reference.clone();
        ctx.state = ControlState::Operating;
        self.publish(ctx);

        let primary = if preferred == Some(ControlPath::Fallback) {
            false
        } else {
            match self.ensure_client(&object_ref, slot, unavailable).await {
                Ok(usable) => usable,
                Err(e) => {
                    ctx.state = ControlState::Failed;
                    ctx.clear_selection();
                    self.publish(ctx);
                    return Err(e);
                },
            }
        };

        let (path, result) = match (primary, slot.as_mut()) {
            (true, Some(control)) => {
                control.set_parameters(params);
                debug!(device = %self.device, object = %object_ref, path = "primary", ctl_num = params.ctl_num, "Sending OPERATE");
                (ControlPath::Primary, self.bounded(control.operate(value)).await)
            },
            _ => {
                let target = format!("{object_ref}.Oper");
                debug!(device = %self.device, object = %object_ref, path = "fallback", target = %target, ctl_num = params.ctl_num, "Writing OPERATE structure");
                let payload = control_structure(value, params);
                let result = self
                    .bounded(self.client.write_value(&target, Fc::Co, payload))
                    .await;
                (ControlPath::Fallback, result)
            },
        };

        ctx.clear_selection();
        match result {
            Ok(()) => {
                let used = params.ctl_num;
                ctx.advance_ctl_num();
                ctx.state = ControlState::Complete;
                self.publish(ctx);
                info!(
                    device = %self.device,
                    object = %object_ref,
                    path = path.as_str(),
                    ctl_num = used,
                    "Operate accepted"
                );
                Ok(CommandOutcome {
                    object_reference: object_ref,
                    model: ctx.model,
                    path,
                    ctl_num: used,
                    selected,
                })
            },
            Err(e) => {
                ctx.state = ControlState::Failed;
                self.publish(ctx);
                let err = ControlError::from_operate(&e);
                warn!(
                    device = %self.device,
                    object = %object_ref,
                    path = path.as_str(),
                    error_code = e.code.code(),
                    "Operate failed: {}",
                    err
                );
                Err(err)
            },
        }
    }
}

// ============================================================================
// Raw control structures
// ============================================================================

/// 2-bit `Check` string: synchro-check first, then interlock-check
pub fn check_bits(interlock_check: bool, synchro_check: bool) -> MmsValue {
    MmsValue::BitString {
        bits: (u32::from(synchro_check) << 1) | u32::from(interlock_check),
        size: 2,
    }
}

fn origin_structure(originator: &Originator) -> MmsValue {
    MmsValue::Structure(vec![
        MmsValue::Integer(originator.category.value()),
        MmsValue::VisibleString(originator.identity.clone()),
    ])
}

/// Seven-element Oper/SBOw structure:
/// ctlVal, operTm, origin, ctlNum, T, Test, Check
pub fn control_structure(value: &MmsValue, params: &ControlParameters) -> MmsValue {
    MmsValue::Structure(vec![
        value.clone(),
        MmsValue::UtcTime(DateTime::<Utc>::default()),
        origin_structure(&params.originator),
        MmsValue::Unsigned(u64::from(params.ctl_num)),
        MmsValue::UtcTime(Utc::now()),
        MmsValue::Boolean(params.test),
        check_bits(params.interlock_check, params.synchro_check),
    ])
}

/// Cancel structure: ctlVal, operTm, origin, ctlNum, T, Test
pub fn cancel_structure(value: &MmsValue, params: &ControlParameters) -> MmsValue {
    MmsValue::Structure(vec![
        value.clone(),
        MmsValue::UtcTime(DateTime::<Utc>::default()),
        origin_structure(&params.originator),
        MmsValue::Unsigned(u64::from(params.ctl_num)),
        MmsValue::UtcTime(Utc::now()),
        MmsValue::Boolean(params.test),
    ])
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::core::iec61850::client::IedErrorCode;
    use crate::core::iec61850::control::OrCat;
    use crate::core::iec61850::simulator::{Packet, SimulatedIed};

    const POS: &str = "LD0/CSWI1.Pos";

    fn engine_for(model: ControlModel) -> (SimulatedIed, ControlEngine) {
        let ied = SimulatedIed::new("TestIED").with_control_point("LD0", "CSWI1", "Pos", model);
        let engine = ControlEngine::new("TestIED", Arc::new(ied.clone()), ControlSettings::default());
        (ied, engine)
    }

    fn params() -> ControlParameters {
        ControlParameters {
            originator: Originator {
                category: OrCat::StationControl,
                identity: "ops".into(),
            },
            ctl_num: 7,
            test: false,
            interlock_check: true,
            synchro_check: false,
        }
    }

    #[test]
    fn test_control_structure_has_seven_elements() {
        let payload = control_structure(&MmsValue::Boolean(true), &params());
        let MmsValue::Structure(items) = &payload else {
            panic!("expected structure");
        };
        assert_eq!(items.len(), 7);
        assert_eq!(items[0], MmsValue::Boolean(true));
        assert_eq!(
            items[2],
            MmsValue::Structure(vec![
                MmsValue::Integer(2),
                MmsValue::VisibleString("ops".into())
            ])
        );
        assert_eq!(items[3], MmsValue::Unsigned(7));
        assert_eq!(items[5], MmsValue::Boolean(false));
        assert_eq!(items[6], MmsValue::BitString { bits: 1, size: 2 });
    }

    #[test]
    fn test_cancel_structure_has_six_elements() {
        let payload = cancel_structure(&MmsValue::Boolean(false), &params());
        assert!(matches!(payload, MmsValue::Structure(ref v) if v.len() == 6));
    }

    #[test]
    fn test_check_bits() {
        assert_eq!(check_bits(false, false), MmsValue::BitString { bits: 0, size: 2 });
        assert_eq!(check_bits(true, true), MmsValue::BitString { bits: 3, size: 2 });
        assert_eq!(check_bits(false, true), MmsValue::BitString { bits: 2, size: 2 });
    }

    #[tokio::test]
    async fn test_sbo_normal_command_selects_then_operates() {
        let (ied, engine) = engine_for(ControlModel::SboNormal);
        let outcome = engine
            .send_command(POS, &MmsValue::Boolean(true), &CommandOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.path, ControlPath::Primary);
        assert_eq!(outcome.ctl_num, 0);
        assert!(outcome.selected);

        let packets = ied.control_packets();
        assert_eq!(packets.len(), 2);
        assert!(matches!(&packets[0], Packet::Select { ctl_num: 0, with_value: false, .. }));
        assert!(matches!(&packets[1], Packet::Operate { ctl_num: 0, value: MmsValue::Boolean(true), .. }));
        assert_eq!(engine.context(POS).unwrap().ctl_num, 1);
        assert_eq!(engine.state(POS), ControlState::Complete);
        assert_eq!(ied.value("LD0/CSWI1.Pos.stVal"), Some(MmsValue::Integer(2)));
    }

    #[tokio::test]
    async fn test_direct_model_sends_operate_only() {
        let (ied, engine) = engine_for(ControlModel::DirectNormal);
        let outcome = engine
            .send_command(POS, &MmsValue::Boolean(false), &CommandOptions::default())
            .await
            .unwrap();
        assert!(!outcome.selected);
        let packets = ied.control_packets();
        assert_eq!(packets.len(), 1);
        assert!(packets[0].is_operate());
    }

    #[tokio::test]
    async fn test_fallback_path_when_control_object_unavailable() {
        let (ied, engine) = engine_for(ControlModel::SboEnhanced);
        ied.set_control_object_unavailable(true);
        let outcome = engine
            .send_command(POS, &MmsValue::Boolean(true), &CommandOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.path, ControlPath::Fallback);
        let packets = ied.control_packets();
        assert!(matches!(&packets[0], Packet::Select { path: ControlPath::Fallback, .. }));
        assert!(matches!(&packets[1], Packet::Operate { path: ControlPath::Fallback, .. }));

        // Instantiation is not retried within the connection
        ied.clear_packets();
        engine
            .send_command(POS, &MmsValue::Boolean(false), &CommandOptions::default())
            .await
            .unwrap();
        assert!(!ied
            .packets()
            .iter()
            .any(|p| matches!(p, Packet::CreateControlObject { .. })));
    }

    #[tokio::test]
    async fn test_operate_without_select_is_refused_locally() {
        let (ied, engine) = engine_for(ControlModel::SboNormal);
        let err = engine
            .operate(POS, &MmsValue::Boolean(true), &CommandOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, ControlError::NotSelected);
        assert!(ied.control_packets().is_empty());
    }

    #[tokio::test]
    async fn test_select_rejection_stops_sequence() {
        let (ied, engine) = engine_for(ControlModel::SboNormal);
        ied.reject_select(Some(IedErrorCode::AccessDenied));
        let err = engine
            .send_command(POS, &MmsValue::Boolean(true), &CommandOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, ControlError::SelectRejected(IedErrorCode::AccessDenied));
        assert!(!ied.control_packets().iter().any(Packet::is_operate));
        assert_eq!(engine.state(POS), ControlState::Failed);
    }

    #[tokio::test]
    async fn test_lapsed_selection_reads_idle() {
        let ied = SimulatedIed::new("TestIED").with_control_point("LD0", "CSWI1", "Pos", ControlModel::SboNormal);
        let settings = ControlSettings {
            select_window: Duration::from_millis(30),
            ..Default::default()
        };
        let engine = ControlEngine::new("TestIED", Arc::new(ied.clone()), settings);
        engine
            .select(POS, &MmsValue::Boolean(true), &CommandOptions::default())
            .await
            .unwrap();
        assert_eq!(engine.state(POS), ControlState::Selected);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(engine.state(POS), ControlState::Idle);
        let err = engine
            .operate(POS, &MmsValue::Boolean(true), &CommandOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, ControlError::NotSelected);
    }

    #[tokio::test]
    async fn test_cancel_releases_selection() {
        let (ied, engine) = engine_for(ControlModel::SboNormal);
        engine
            .select(POS, &MmsValue::Boolean(true), &CommandOptions::default())
            .await
            .unwrap();
        engine.cancel(POS).await.unwrap();
        assert_eq!(engine.state(POS), ControlState::Cancelled);
        assert!(!ied.is_selected(POS));
        assert_eq!(engine.cancel(POS).await.unwrap_err(), ControlError::NotSelected);
    }

    #[tokio::test]
    async fn test_status_only_not_controllable() {
        let (ied, engine) = engine_for(ControlModel::StatusOnly);
        let err = engine
            .send_command(POS, &MmsValue::Boolean(true), &CommandOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, ControlError::NotControllable);
        assert!(ied.control_packets().is_empty());
    }

    #[tokio::test]
    async fn test_unresponsive_device_times_out() {
        let ied = SimulatedIed::new("TestIED").with_control_point("LD0", "CSWI1", "Pos", ControlModel::DirectNormal);
        let settings = ControlSettings {
            call_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let engine = ControlEngine::new("TestIED", Arc::new(ied.clone()), settings);
        engine.initialize(POS).await.unwrap();
        ied.set_unresponsive(true);
        let err = engine
            .send_command(POS, &MmsValue::Boolean(true), &CommandOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, ControlError::Timeout);
    }

    #[tokio::test]
    async fn test_invalidate_drops_contexts() {
        let (_ied, engine) = engine_for(ControlModel::SboEnhanced);
        let ctx = engine.initialize(POS).await.unwrap();
        assert_eq!(ctx.sbo_reference.as_deref(), Some("LD0/CSWI1.Pos.SBOw"));
        engine.invalidate();
        assert!(engine.context(POS).is_none());
    }

    #[tokio::test]
    async fn test_same_object_commands_do_not_interleave() {
        let (ied, engine) = engine_for(ControlModel::SboNormal);
        let options = CommandOptions::default();
        let (first, second) = tokio::join!(
            engine.send_command(POS, &MmsValue::Boolean(true), &options),
            engine.send_command(POS, &MmsValue::Boolean(false), &options),
        );
        first.unwrap();
        second.unwrap();

        let sequence: Vec<(&str, u8)> = ied
            .control_packets()
            .iter()
            .map(|p| match p {
                Packet::Select { ctl_num, .. } => ("select", *ctl_num),
                Packet::Operate { ctl_num, .. } => ("operate", *ctl_num),
                other => panic!("unexpected packet {other:?}"),
            })
            .collect();
        assert_eq!(
            sequence,
            vec![("select", 0), ("operate", 0), ("select", 1), ("operate", 1)]
        );
    }

    #[tokio::test]
    async fn test_different_objects_proceed_concurrently() {
        let ied = SimulatedIed::new("TestIED")
            .with_control_point("LD0", "CSWI1", "Pos", ControlModel::SboNormal)
            .with_control_point("LD0", "CSWI2", "Pos", ControlModel::SboNormal);
        let engine = ControlEngine::new("TestIED", Arc::new(ied.clone()), ControlSettings::default());
        let options = CommandOptions {
            sbo_timeout_ms: Some(200),
            ..Default::default()
        };
        let (first, second) = tokio::join!(
            engine.send_command(POS, &MmsValue::Boolean(true), &options),
            engine.send_command("LD0/CSWI2.Pos", &MmsValue::Boolean(true), &options),
        );
        first.unwrap();
        second.unwrap();

        // Both selections are outstanding before either operate is sent
        let packets = ied.control_packets();
        assert_eq!(packets.len(), 4);
        assert!(packets[..2].iter().all(Packet::is_select));
        assert!(packets[2..].iter().all(Packet::is_operate));
    }

    #[tokio::test]
    async fn test_state_readable_during_sequence() {
        let (_ied, engine) = engine_for(ControlModel::SboNormal);
        let engine = Arc::new(engine);
        let options = CommandOptions {
            sbo_timeout_ms: Some(300),
            ..Default::default()
        };

        let running = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine
                    .send_command(POS, &MmsValue::Boolean(true), &options)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(engine.state(POS), ControlState::Selected);
        assert!(!running.is_finished());

        running.await.unwrap().unwrap();
        assert_eq!(engine.state(POS), ControlState::Complete);
    }
}
