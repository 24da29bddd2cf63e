//! Control model, originator and per-object control context

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{Result, ScoutSrvError};

// ============================================================================
// Control model
// ============================================================================

/// `ctlModel` enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlModel {
    StatusOnly,
    DirectNormal,
    SboNormal,
    DirectEnhanced,
    SboEnhanced,
}

impl ControlModel {
    /// Classify a raw `ctlModel` value; anything unknown is status-only
    pub fn from_value(value: i64) -> Self {
        match value {
            1 => Self::DirectNormal,
            2 => Self::SboNormal,
            3 => Self::DirectEnhanced,
            4 => Self::SboEnhanced,
            _ => Self::StatusOnly,
        }
    }

    pub fn value(self) -> i64 {
        match self {
            Self::StatusOnly => 0,
            Self::DirectNormal => 1,
            Self::SboNormal => 2,
            Self::DirectEnhanced => 3,
            Self::SboEnhanced => 4,
        }
    }

    pub fn is_sbo(self) -> bool {
        matches!(self, Self::SboNormal | Self::SboEnhanced)
    }

    pub fn is_direct(self) -> bool {
        matches!(self, Self::DirectNormal | Self::DirectEnhanced)
    }

    pub fn is_enhanced(self) -> bool {
        matches!(self, Self::DirectEnhanced | Self::SboEnhanced)
    }

    pub fn is_controllable(self) -> bool {
        self != Self::StatusOnly
    }
}

impl fmt::Display for ControlModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::StatusOnly => "STATUS_ONLY",
            Self::DirectNormal => "DIRECT_NORMAL",
            Self::SboNormal => "SBO_NORMAL",
            Self::DirectEnhanced => "DIRECT_ENHANCED",
            Self::SboEnhanced => "SBO_ENHANCED",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Originator
// ============================================================================

/// Originator category (`orCat`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OrCat {
    NotSupported,
    BayControl,
    StationControl,
    #[default]
    RemoteControl,
    AutomaticBay,
    AutomaticStation,
    AutomaticRemote,
    Maintenance,
    Process,
}

impl OrCat {
    const ALL: [OrCat; 9] = [
        OrCat::NotSupported,
        OrCat::BayControl,
        OrCat::StationControl,
        OrCat::RemoteControl,
        OrCat::AutomaticBay,
        OrCat::AutomaticStation,
        OrCat::AutomaticRemote,
        OrCat::Maintenance,
        OrCat::Process,
    ];

    pub fn value(self) -> i64 {
        Self::ALL.iter().position(|c| *c == self).unwrap_or(0) as i64
    }

    pub fn from_value(value: i64) -> Option<Self> {
        usize::try_from(value)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
    }

    /// Accepts `remote-control`, `REMOTE_CONTROL`, `remote_control` or `3`
    pub fn parse(s: &str) -> Option<Self> {
        if let Ok(n) = s.trim().parse::<i64>() {
            return Self::from_value(n);
        }
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == normalized)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrCat::NotSupported => "not-supported",
            OrCat::BayControl => "bay-control",
            OrCat::StationControl => "station-control",
            OrCat::RemoteControl => "remote-control",
            OrCat::AutomaticBay => "automatic-bay",
            OrCat::AutomaticStation => "automatic-station",
            OrCat::AutomaticRemote => "automatic-remote",
            OrCat::Maintenance => "maintenance",
            OrCat::Process => "process",
        }
    }
}

impl fmt::Display for OrCat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who issued a control action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Originator {
    pub category: OrCat,
    pub identity: String,
}

impl Default for Originator {
    fn default() -> Self {
        Self {
            category: OrCat::RemoteControl,
            identity: "SCADA".to_string(),
        }
    }
}

// ============================================================================
// Command options
// ============================================================================

/// Per-command options, parsed from a key/value map
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOptions {
    /// Delay between SELECT and OPERATE
    pub sbo_timeout_ms: Option<u64>,
    pub originator_id: Option<String>,
    pub originator_category: Option<OrCat>,
    /// Skip SELECT even when the model requires it
    pub force_direct: bool,
    /// Issue SELECT even when the model does not require it
    pub force_sbo: bool,
}

impl CommandOptions {
    /// Parse from a JSON value; `null` means defaults
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(Self::default()),
            Value::Object(map) => Self::from_map(map),
            other => Err(ScoutSrvError::validation(format!(
                "command options must be an object, got {other}"
            ))),
        }
    }

    /// Parse the recognized keys; unknown keys are logged and ignored
    pub fn from_map(map: &serde_json::Map<String, Value>) -> Result<Self> {
        let mut options = Self::default();
        for (key, value) in map {
            match key.as_str() {
                "sbo_timeout_ms" => {
                    options.sbo_timeout_ms = Some(value.as_u64().ok_or_else(|| {
                        ScoutSrvError::validation("sbo_timeout_ms must be a non-negative integer")
                    })?);
                },
                "originator_id" => {
                    options.originator_id = Some(
                        value
                            .as_str()
                            .ok_or_else(|| {
                                ScoutSrvError::validation("originator_id must be a string")
                            })?
                            .to_string(),
                    );
                },
                "originator_category" => {
                    let parsed = match value {
                        Value::String(s) => OrCat::parse(s),
                        Value::Number(n) => n.as_i64().and_then(OrCat::from_value),
                        _ => None,
                    };
                    options.originator_category = Some(parsed.ok_or_else(|| {
                        ScoutSrvError::validation(format!("unknown originator_category {value}"))
                    })?);
                },
                "force_direct" => options.force_direct = parse_flag(key, value)?,
                "force_sbo" => options.force_sbo = parse_flag(key, value)?,
                other => warn!("Ignoring unknown command option '{}'", other),
            }
        }
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if self.force_direct && self.force_sbo {
            return Err(ScoutSrvError::validation(
                "force_direct and force_sbo are mutually exclusive",
            ));
        }
        Ok(())
    }

    /// Originator with defaults filled in
    pub fn originator(&self, default: &Originator) -> Originator {
        Originator {
            category: self.originator_category.unwrap_or(default.category),
            identity: self
                .originator_id
                .clone()
                .unwrap_or_else(|| default.identity.clone()),
        }
    }
}

fn parse_flag(key: &str, value: &Value) -> Result<bool> {
    value
        .as_bool()
        .ok_or_else(|| ScoutSrvError::validation(format!("{key} must be a boolean")))
}

// ============================================================================
// Control context
// ============================================================================

/// State of the select-before-operate sequence for one object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlState {
    Idle,
    Selecting,
    Selected,
    Operating,
    Complete,
    Failed,
    Cancelled,
}

/// Which select attributes the data object exposes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SboCapabilities {
    pub has_sbo: bool,
    pub has_sbow: bool,
    pub has_oper: bool,
}

/// Which control mechanism carried an action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlPath {
    /// High-level control object client
    Primary,
    /// Raw structured write to `.SBOw`/`.SBO`/`.Oper`
    Fallback,
}

impl ControlPath {
    pub fn as_str(self) -> &'static str {
        match self {
            ControlPath::Primary => "primary",
            ControlPath::Fallback => "fallback",
        }
    }
}

impl fmt::Display for ControlPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cached control metadata for one object reference, scoped to a connection
#[derive(Debug, Clone, Serialize)]
pub struct ControlContext {
    pub object_reference: String,
    pub model: ControlModel,
    /// Attribute used for select (`LD/LN.DO.SBOw` or `.SBO`)
    pub sbo_reference: Option<String>,
    pub capabilities: SboCapabilities,
    /// Next control number to send
    pub ctl_num: u8,
    #[serde(skip)]
    pub last_select: Option<Instant>,
    pub state: ControlState,
    /// Path used by the outstanding selection
    pub selected_path: Option<ControlPath>,
}

impl ControlContext {
    pub fn new(object_reference: impl Into<String>, model: ControlModel) -> Self {
        Self {
            object_reference: object_reference.into(),
            model,
            sbo_reference: None,
            capabilities: SboCapabilities::default(),
            ctl_num: 0,
            last_select: None,
            state: ControlState::Idle,
            selected_path: None,
        }
    }

    /// Record which select attributes exist and pick the select target
    pub fn apply_capabilities(&mut self, capabilities: SboCapabilities) {
        self.capabilities = capabilities;
        self.sbo_reference = if capabilities.has_sbow {
            Some(format!("{}.SBOw", self.object_reference))
        } else if capabilities.has_sbo {
            Some(format!("{}.SBO", self.object_reference))
        } else {
            None
        };
    }

    /// Whether a selection is live within `window`
    pub fn is_selected(&self, window: Duration) -> bool {
        self.state == ControlState::Selected
            && self
                .last_select
                .is_some_and(|at| at.elapsed() <= window)
    }

    /// Observed state, with a lapsed selection reported as idle
    pub fn effective_state(&self, window: Duration) -> ControlState {
        if self.state == ControlState::Selected && !self.is_selected(window) {
            ControlState::Idle
        } else {
            self.state
        }
    }

    pub fn mark_selected(&mut self, path: ControlPath) {
        self.state = ControlState::Selected;
        self.last_select = Some(Instant::now());
        self.selected_path = Some(path);
    }

    pub fn clear_selection(&mut self) {
        self.last_select = None;
        self.selected_path = None;
    }

    /// Advance the control number after a successful operate (mod 256)
    pub fn advance_ctl_num(&mut self) {
        self.ctl_num = self.ctl_num.wrapping_add(1);
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_control_model_classification() {
        assert_eq!(ControlModel::from_value(2), ControlModel::SboNormal);
        assert_eq!(ControlModel::from_value(9), ControlModel::StatusOnly);
        assert!(ControlModel::SboEnhanced.is_sbo());
        assert!(ControlModel::SboEnhanced.is_enhanced());
        assert!(ControlModel::DirectNormal.is_direct());
        assert!(!ControlModel::StatusOnly.is_controllable());
        assert_eq!(ControlModel::DirectEnhanced.value(), 3);
    }

    #[test]
    fn test_orcat_parse() {
        assert_eq!(OrCat::parse("remote-control"), Some(OrCat::RemoteControl));
        assert_eq!(OrCat::parse("STATION_CONTROL"), Some(OrCat::StationControl));
        assert_eq!(OrCat::parse("8"), Some(OrCat::Process));
        assert_eq!(OrCat::parse("9"), None);
        assert_eq!(OrCat::Maintenance.value(), 7);
        assert_eq!(OrCat::default(), OrCat::RemoteControl);
    }

    #[test]
    fn test_command_options_defaults() {
        let options = CommandOptions::from_value(&json!({})).unwrap();
        assert_eq!(options, CommandOptions::default());
        let origin = options.originator(&Originator::default());
        assert_eq!(origin.identity, "SCADA");
        assert_eq!(origin.category, OrCat::RemoteControl);
    }

    #[test]
    fn test_command_options_parse() {
        let options = CommandOptions::from_value(&json!({
            "sbo_timeout_ms": 250,
            "originator_id": "ops-1",
            "originator_category": "station-control",
            "force_direct": true,
            "unknown_key": 1
        }))
        .unwrap();
        assert_eq!(options.sbo_timeout_ms, Some(250));
        assert_eq!(options.originator_id.as_deref(), Some("ops-1"));
        assert_eq!(options.originator_category, Some(OrCat::StationControl));
        assert!(options.force_direct);
    }

    #[test]
    fn test_command_options_conflict_rejected() {
        let err = CommandOptions::from_value(&json!({"force_direct": true, "force_sbo": true}));
        assert!(err.is_err());
        assert!(CommandOptions::from_value(&json!({"force_sbo": "yes"})).is_err());
        assert!(CommandOptions::from_value(&json!([1, 2])).is_err());
    }

    #[test]
    fn test_selection_window() {
        let mut ctx = ControlContext::new("LD0/CSWI1.Pos", ControlModel::SboNormal);
        assert_eq!(ctx.effective_state(Duration::from_secs(1)), ControlState::Idle);
        ctx.mark_selected(ControlPath::Primary);
        assert!(ctx.is_selected(Duration::from_secs(30)));
        ctx.last_select = Some(Instant::now() - Duration::from_secs(5));
        assert_eq!(ctx.effective_state(Duration::from_secs(1)), ControlState::Idle);
    }

    #[test]
    fn test_ctl_num_wraps() {
        let mut ctx = ControlContext::new("LD0/CSWI1.Pos", ControlModel::DirectNormal);
        ctx.ctl_num = 255;
        ctx.advance_ctl_num();
        assert_eq!(ctx.ctl_num, 0);
    }

    #[test]
    fn test_capabilities_pick_sbow_first() {
        let mut ctx = ControlContext::new("LD0/CSWI1.Pos", ControlModel::SboEnhanced);
        ctx.apply_capabilities(SboCapabilities {
            has_sbo: true,
            has_sbow: true,
            has_oper: true,
        });
        assert_eq!(ctx.sbo_reference.as_deref(), Some("LD0/CSWI1.Pos.SBOw"));
        ctx.apply_capabilities(SboCapabilities {
            has_sbo: true,
            ..Default::default()
        });
        assert_eq!(ctx.sbo_reference.as_deref(), Some("LD0/CSWI1.Pos.SBO"));
    }
}
