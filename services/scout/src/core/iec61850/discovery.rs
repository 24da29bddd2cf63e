//! Data model discovery
//!
//! Walks LD → LN → DO → DA and builds a signal tree. Each nesting level is
//! fault-isolated: a failing branch is logged, recorded in the report and
//! skipped, and the walk continues with its siblings.

use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::client::{Fc, IedError, MmsClient, MmsType};
use super::reference::{data_object_ref, logical_node_ref};
use crate::core::model::node::{Node, NodeKind};
use crate::core::model::signal::{Signal, SignalKind, SignalType};

#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub call_timeout: Duration,
    /// Structured attributes nested deeper than this become structured leaves
    pub max_attribute_depth: usize,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_millis(5000),
            max_attribute_depth: 8,
        }
    }
}

/// Level at which a branch was abandoned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchLevel {
    /// The logical-device listing itself failed
    Root,
    LogicalDevice,
    LogicalNode,
    DataObject,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedBranch {
    pub level: BranchLevel,
    /// Reference of the abandoned branch
    pub name: String,
    pub reason: String,
}

/// Discovery result; partial discovery is data, not an error
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryReport {
    pub root: Node,
    pub skipped: Vec<SkippedBranch>,
}

impl DiscoveryReport {
    pub fn is_partial(&self) -> bool {
        !self.skipped.is_empty()
    }

    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }

    pub fn signal_count(&self) -> usize {
        self.root.signal_count()
    }
}

/// One discovery pass against a connected client
pub struct DiscoveryEngine<'a> {
    device: &'a str,
    client: &'a dyn MmsClient,
    settings: DiscoverySettings,
}

impl<'a> DiscoveryEngine<'a> {
    pub fn new(device: &'a str, client: &'a dyn MmsClient, settings: DiscoverySettings) -> Self {
        Self {
            device,
            client,
            settings,
        }
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, IedError>
    where
        F: Future<Output = Result<T, IedError>>,
    {
        tokio::time::timeout(self.settings.call_timeout, fut)
            .await
            .unwrap_or_else(|_| {
                Err(IedError::timeout(format!(
                    "no response within {} ms",
                    self.settings.call_timeout.as_millis()
                )))
            })
    }

    /// Walk the device; never fails, degrades to a partial tree
    pub async fn discover(&self) -> DiscoveryReport {
        let mut root = Node::new(self.device, NodeKind::Device);
        let mut skipped = Vec::new();

        let logical_devices = match self.bounded(self.client.logical_devices()).await {
            Ok(lds) => lds,
            Err(e) => {
                warn!(
                    device = %self.device,
                    branch = "<root>",
                    error_code = e.code.code(),
                    "Logical device listing failed: {}",
                    e
                );
                skipped.push(SkippedBranch {
                    level: BranchLevel::Root,
                    name: self.device.to_string(),
                    reason: e.to_string(),
                });
                return DiscoveryReport { root, skipped };
            },
        };

        for ld in logical_devices {
            match self.discover_logical_device(&ld, &mut skipped).await {
                Ok(node) => root.push_node(node),
                Err(e) => {
                    warn!(
                        device = %self.device,
                        branch = %ld,
                        error_code = e.code.code(),
                        "Logical device skipped: {}",
                        e
                    );
                    skipped.push(SkippedBranch {
                        level: BranchLevel::LogicalDevice,
                        name: ld,
                        reason: e.to_string(),
                    });
                },
            }
        }

        info!(
            device = %self.device,
            signals = root.signal_count(),
            skipped = skipped.len(),
            "Discovery complete"
        );
        DiscoveryReport { root, skipped }
    }

    async fn discover_logical_device(
        &self,
        ld: &str,
        skipped: &mut Vec<SkippedBranch>,
    ) -> Result<Node, IedError> {
        let logical_nodes = self.bounded(self.client.logical_nodes(ld)).await?;
        let mut ld_node = Node::new(ld, NodeKind::LogicalDevice);

        for ln in logical_nodes {
            let ln_ref = logical_node_ref(ld, &ln);
            match self.discover_logical_node(&ln_ref, skipped).await {
                Ok(node) => ld_node.push_node(node),
                Err(e) => {
                    warn!(
                        device = %self.device,
                        branch = %ln_ref,
                        error_code = e.code.code(),
                        "Logical node skipped: {}",
                        e
                    );
                    skipped.push(SkippedBranch {
                        level: BranchLevel::LogicalNode,
                        name: ln_ref,
                        reason: e.to_string(),
                    });
                },
            }
        }

        Ok(ld_node)
    }

    async fn discover_logical_node(
        &self,
        ln_ref: &str,
        skipped: &mut Vec<SkippedBranch>,
    ) -> Result<Node, IedError> {
        let data_objects = self.bounded(self.client.data_objects(ln_ref)).await?;
        let ln_name = ln_ref.rsplit('/').next().unwrap_or(ln_ref);
        let mut ln_node = Node::new(ln_name, NodeKind::LogicalNode);

        for data_object in data_objects {
            let do_ref = data_object_ref(ln_ref, &data_object);
            let mut leaves = Vec::new();
            match self
                .browse_attributes(&do_ref, String::new(), None, 0, &mut leaves)
                .await
            {
                Ok(()) => {
                    let do_name = do_ref.rsplit('.').next().unwrap_or(&do_ref);
                    let mut do_node = Node::new(do_name, NodeKind::DataObject);
                    for leaf in leaves {
                        do_node.push_signal(leaf);
                    }
                    ln_node.push_node(do_node);
                },
                Err(e) => {
                    warn!(
                        device = %self.device,
                        branch = %do_ref,
                        error_code = e.code.code(),
                        "Data object skipped: {}",
                        e
                    );
                    skipped.push(SkippedBranch {
                        level: BranchLevel::DataObject,
                        name: do_ref,
                        reason: e.to_string(),
                    });
                },
            }
        }

        Ok(ln_node)
    }

    /// Recursively list attributes under `reference`, appending leaves to `out`
    fn browse_attributes<'b>(
        &'b self,
        reference: &'b str,
        path: String,
        inherited_fc: Option<Fc>,
        depth: usize,
        out: &'b mut Vec<Signal>,
    ) -> BoxFuture<'b, Result<(), IedError>> {
        async move {
            let target = if path.is_empty() {
                reference.to_string()
            } else {
                format!("{reference}.{path}")
            };
            let entries = self.bounded(self.client.data_directory(&target)).await?;

            for entry in entries {
                let fc = entry.fc.or(inherited_fc);
                let child_path = if path.is_empty() {
                    entry.name.clone()
                } else {
                    format!("{path}.{}", entry.name)
                };

                if entry.mms_type == MmsType::Structure && depth + 1 < self.settings.max_attribute_depth {
                    self.browse_attributes(reference, child_path, fc, depth + 1, out)
                        .await?;
                    continue;
                }

                let address = format!("{reference}.{child_path}");
                debug!(device = %self.device, address = %address, "Discovered attribute");
                out.push(Signal::new(
                    address,
                    child_path,
                    SignalKind::from_mms_type(entry.mms_type),
                    SignalType::Iec61850 {
                        mms_type: entry.mms_type,
                        fc: fc.unwrap_or(Fc::St),
                    },
                ));
            }
            Ok(())
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::iec61850::client::MmsValue;
    use crate::core::iec61850::simulator::SimulatedIed;
    use crate::core::model::signal::Quality;

    fn sample_ied() -> SimulatedIed {
        SimulatedIed::new("IED1")
            .with_attribute("LD0", "LLN0", "Mod", "stVal", Fc::St, MmsValue::Integer(1))
            .with_measurement("LD0", "MMXU1", "TotW", 1.5)
    }

    #[tokio::test]
    async fn test_builds_addresses_and_kinds() {
        let ied = sample_ied();
        let report = DiscoveryEngine::new("IED1", &ied, DiscoverySettings::default())
            .discover()
            .await;
        assert!(!report.is_partial());
        let stval = report.root.find_signal("LD0/LLN0.Mod.stVal");
        assert!(stval.is_some_and(|s| s.kind == SignalKind::Analog && s.quality == Quality::NotConnected));
        let mag = report.root.find_signal("LD0/MMXU1.TotW.mag.f");
        assert_eq!(mag.and_then(|s| s.fc()), Some(Fc::Mx));
        assert_eq!(mag.map(|s| s.name.as_str()), Some("mag.f"));
    }

    #[tokio::test]
    async fn test_failing_logical_node_is_isolated() {
        let ied = SimulatedIed::new("IED1")
            .with_attribute("LD1", "LLN0", "Mod", "stVal", Fc::St, MmsValue::Integer(1))
            .with_attribute("LD2", "LLN0", "Mod", "stVal", Fc::St, MmsValue::Integer(1))
            .with_attribute("LD2", "GGIO1", "Ind1", "stVal", Fc::St, MmsValue::Boolean(false))
            .with_attribute("LD3", "LLN0", "Mod", "stVal", Fc::St, MmsValue::Integer(1));
        ied.fail_data_object_listing("LD2/GGIO1");

        let report = DiscoveryEngine::new("IED1", &ied, DiscoverySettings::default())
            .discover()
            .await;
        assert_eq!(report.skipped_count(), 1);
        assert_eq!(report.skipped[0].level, BranchLevel::LogicalNode);
        assert_eq!(report.skipped[0].name, "LD2/GGIO1");
        assert!(report.root.find_signal("LD1/LLN0.Mod.stVal").is_some());
        assert!(report.root.find_signal("LD2/LLN0.Mod.stVal").is_some());
        assert!(report.root.find_signal("LD3/LLN0.Mod.stVal").is_some());
    }

    #[tokio::test]
    async fn test_unresponsive_device_times_out() {
        let ied = sample_ied();
        ied.set_unresponsive(true);
        let settings = DiscoverySettings {
            call_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let report = DiscoveryEngine::new("IED1", &ied, settings).discover().await;
        assert_eq!(report.skipped_count(), 1);
        assert!(report.skipped[0].reason.contains("Timeout"));
    }

    #[tokio::test]
    async fn test_depth_limit_yields_structured_leaf() {
        let ied = sample_ied();
        let settings = DiscoverySettings {
            max_attribute_depth: 1,
            ..Default::default()
        };
        let report = DiscoveryEngine::new("IED1", &ied, settings).discover().await;
        let mag = report.root.find_signal("LD0/MMXU1.TotW.mag");
        assert_eq!(mag.map(|s| s.kind), Some(SignalKind::Structured));
    }

    #[tokio::test]
    async fn test_root_listing_failure_is_one_skip() {
        let ied = sample_ied();
        ied.disconnect_now();
        let report = DiscoveryEngine::new("IED1", &ied, DiscoverySettings::default())
            .discover()
            .await;
        assert_eq!(report.skipped_count(), 1);
        assert_eq!(report.skipped[0].level, BranchLevel::Root);
        assert_eq!(report.signal_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicated_ld_prefix_collapsed() {
        let ied = sample_ied().with_prefixed_logical_nodes(true);
        let report = DiscoveryEngine::new("IED1", &ied, DiscoverySettings::default())
            .discover()
            .await;
        assert!(report.root.find_signal("LD0/LLN0.Mod.stVal").is_some());
        assert!(report
            .root
            .signals()
            .iter()
            .all(|s| !s.address.starts_with("LD0/LD0/")));
    }
}
