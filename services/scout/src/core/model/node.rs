//! Signal tree
//!
//! Device → Logical Device → Logical Node → Data Object → Signal. Trees are
//! built whole by a discovery pass and replaced whole; nothing patches them
//! in place.

use serde::Serialize;

use super::signal::Signal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Device,
    LogicalDevice,
    LogicalNode,
    DataObject,
    /// Grouping node for flat protocols (Modbus function code tables)
    Group,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum NodeChild {
    Node(Node),
    Signal(Signal),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
    pub children: Vec<NodeChild>,
}

impl Node {
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            children: Vec::new(),
        }
    }

    pub fn push_node(&mut self, node: Node) {
        self.children.push(NodeChild::Node(node));
    }

    pub fn push_signal(&mut self, signal: Signal) {
        self.children.push(NodeChild::Signal(signal));
    }

    pub fn child_nodes(&self) -> impl Iterator<Item = &Node> {
        self.children.iter().filter_map(|c| match c {
            NodeChild::Node(n) => Some(n),
            NodeChild::Signal(_) => None,
        })
    }

    pub fn child(&self, name: &str) -> Option<&Node> {
        self.child_nodes().find(|n| n.name == name)
    }

    /// All signal leaves, depth-first in tree order
    pub fn signals(&self) -> Vec<&Signal> {
        let mut out = Vec::new();
        self.collect_signals(&mut out);
        out
    }

    fn collect_signals<'a>(&'a self, out: &mut Vec<&'a Signal>) {
        for child in &self.children {
            match child {
                NodeChild::Node(n) => n.collect_signals(out),
                NodeChild::Signal(s) => out.push(s),
            }
        }
    }

    pub fn signal_count(&self) -> usize {
        self.children
            .iter()
            .map(|c| match c {
                NodeChild::Node(n) => n.signal_count(),
                NodeChild::Signal(_) => 1,
            })
            .sum()
    }

    pub fn find_signal(&self, address: &str) -> Option<&Signal> {
        for child in &self.children {
            match child {
                NodeChild::Signal(s) if s.address == address => return Some(s),
                NodeChild::Node(n) => {
                    if let Some(s) = n.find_signal(address) {
                        return Some(s);
                    }
                },
                NodeChild::Signal(_) => {},
            }
        }
        None
    }

    pub fn find_signal_mut(&mut self, address: &str) -> Option<&mut Signal> {
        for child in &mut self.children {
            match child {
                NodeChild::Signal(s) if s.address == address => return Some(s),
                NodeChild::Node(n) => {
                    if let Some(s) = n.find_signal_mut(address) {
                        return Some(s);
                    }
                },
                NodeChild::Signal(_) => {},
            }
        }
        None
    }

    /// Whether any signal lives at or below `reference`
    /// (`LD0/CSWI1.Pos` matches `LD0/CSWI1.Pos.stVal`)
    pub fn contains_reference(&self, reference: &str) -> bool {
        let prefix = format!("{reference}.");
        self.signals()
            .iter()
            .any(|s| s.address == reference || s.address.starts_with(&prefix))
    }
}
