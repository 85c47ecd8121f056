//! # Cluster Topology and Endpoint Resolution
//!
//! Maps a logical node name to the concrete address (and optional interface /
//! NUMA binding) the benchmark tool should bind to or connect to.
//!
//! Resolution is pure: it consults a static [`ClusterTopology`] and never
//! touches the network. Three addressing modes are supported:
//!
//! - **Management**: the node's management address, or its name when none is
//!   configured (scheduler host names are always routable on the management net)
//! - **Fabric**: the high-speed interconnect address, either configured
//!   explicitly or derived from the node name plus a cluster-wide suffix
//!   (e.g. `node001` + `-ib` → `node001-ib`)
//! - **Lane(i)**: the i-th per-NIC sub-interface on multi-NIC nodes
//!
//! The topology can be loaded from a JSON document:
//!
//! ```json
//! {
//!   "fabric_suffix": "-ib",
//!   "nodes": {
//!     "node001": {
//!       "fabric_address": "10.10.0.1",
//!       "locality": { "numa_domain": 0, "interface": "ib0" },
//!       "lanes": [
//!         { "address": "10.20.0.1", "interface": "ib0", "numa_domain": 0 },
//!         { "address": "10.21.0.1", "interface": "ib1", "numa_domain": 1 }
//!       ]
//!     }
//!   }
//! }
//! ```

use crate::error::{OrchestratorError, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Which network a benchmark endpoint should use.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressingMode {
    Management,
    Fabric,
    Lane(u8),
}

impl std::fmt::Display for AddressingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressingMode::Management => write!(f, "management"),
            AddressingMode::Fabric => write!(f, "fabric"),
            AddressingMode::Lane(i) => write!(f, "lane {}", i),
        }
    }
}

/// Addressing mode as selected on the command line; lanes carry their index
/// in a separate flag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum AddressingKind {
    #[clap(name = "management")]
    Management,
    #[clap(name = "fabric")]
    Fabric,
    #[clap(name = "lane")]
    Lane,
}

impl AddressingKind {
    pub fn with_lane(self, lane: u8) -> AddressingMode {
        match self {
            AddressingKind::Management => AddressingMode::Management,
            AddressingKind::Fabric => AddressingMode::Fabric,
            AddressingKind::Lane => AddressingMode::Lane(lane),
        }
    }
}

/// Locality metadata for a node or a lane.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locality {
    #[serde(default)]
    pub numa_domain: Option<u32>,
    #[serde(default)]
    pub interface: Option<String>,
}

/// One per-NIC sub-interface of a multi-NIC node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneBinding {
    pub address: String,
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default)]
    pub numa_domain: Option<u32>,
}

/// A cluster node as known to the orchestrator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    #[serde(default)]
    pub management_address: Option<String>,
    #[serde(default)]
    pub fabric_address: Option<String>,
    #[serde(default)]
    pub locality: Locality,
    #[serde(default)]
    pub lanes: Vec<LaneBinding>,
}

impl Node {
    /// A node known only by its name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            management_address: None,
            fabric_address: None,
            locality: Locality::default(),
            lanes: Vec::new(),
        }
    }
}

/// Concrete benchmark endpoint produced by resolution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub node: String,
    pub address: String,
    pub interface: Option<String>,
    pub numa_domain: Option<u32>,
}

/// Per-node entry of the topology document; the node name is the map key.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct NodeEntry {
    #[serde(default)]
    management_address: Option<String>,
    #[serde(default)]
    fabric_address: Option<String>,
    #[serde(default)]
    locality: Locality,
    #[serde(default)]
    lanes: Vec<LaneBinding>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct TopologyDocument {
    #[serde(default)]
    fabric_suffix: Option<String>,
    #[serde(default)]
    nodes: BTreeMap<String, NodeEntry>,
}

/// Static description of the cluster network.
#[derive(Clone, Debug, Default)]
pub struct ClusterTopology {
    fabric_suffix: Option<String>,
    nodes: BTreeMap<String, Node>,
}

impl ClusterTopology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fabric_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.fabric_suffix = Some(suffix.into());
        self
    }

    pub fn insert(&mut self, node: Node) {
        self.nodes.insert(node.name.clone(), node);
    }

    /// Parse a topology from its JSON representation.
    pub fn from_json(json: &str) -> Result<Self> {
        let doc: TopologyDocument = serde_json::from_str(json)
            .map_err(|e| OrchestratorError::Configuration(format!("invalid topology: {}", e)))?;
        let nodes = doc
            .nodes
            .into_iter()
            .map(|(name, entry)| {
                let node = Node {
                    name: name.clone(),
                    management_address: entry.management_address,
                    fabric_address: entry.fabric_address,
                    locality: entry.locality,
                    lanes: entry.lanes,
                };
                (name, node)
            })
            .collect();
        Ok(Self {
            fabric_suffix: doc.fabric_suffix,
            nodes,
        })
    }

    /// Load a topology document from disk.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            OrchestratorError::Configuration(format!(
                "cannot read topology file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json(&json).map_err(|e| match e {
            OrchestratorError::Configuration(reason) => {
                OrchestratorError::Configuration(format!("{} ({})", reason, path.display()))
            }
            other => other,
        })
    }

    /// Full node description, falling back to a bare named node.
    pub fn node(&self, name: &str) -> Node {
        self.nodes
            .get(name)
            .cloned()
            .unwrap_or_else(|| Node::named(name))
    }

    pub fn fabric_suffix(&self) -> Option<&str> {
        self.fabric_suffix.as_deref()
    }
}

/// Resolves nodes to benchmark endpoints.
pub trait EndpointResolver: Send + Sync {
    fn resolve(&self, node: &Node, mode: AddressingMode) -> Result<Endpoint>;
}

/// Resolver backed by a static [`ClusterTopology`].
#[derive(Clone, Debug, Default)]
pub struct StaticResolver {
    topology: ClusterTopology,
}

impl StaticResolver {
    pub fn new(topology: ClusterTopology) -> Self {
        Self { topology }
    }
}

impl EndpointResolver for StaticResolver {
    fn resolve(&self, node: &Node, mode: AddressingMode) -> Result<Endpoint> {
        // Information carried on the node wins over the topology entry.
        let known = self.topology.node(&node.name);
        let locality = if node.locality != Locality::default() {
            node.locality.clone()
        } else {
            known.locality.clone()
        };

        let resolution_error = |reason: &str| OrchestratorError::Resolution {
            node: node.name.clone(),
            mode,
            reason: reason.to_string(),
        };

        match mode {
            AddressingMode::Management => {
                let address = node
                    .management_address
                    .clone()
                    .or(known.management_address)
                    .unwrap_or_else(|| node.name.clone());
                Ok(Endpoint {
                    node: node.name.clone(),
                    address,
                    interface: None,
                    numa_domain: locality.numa_domain,
                })
            }
            AddressingMode::Fabric => {
                let address = node
                    .fabric_address
                    .clone()
                    .or(known.fabric_address)
                    .or_else(|| {
                        self.topology
                            .fabric_suffix()
                            .map(|suffix| format!("{}{}", node.name, suffix))
                    })
                    .ok_or_else(|| {
                        resolution_error("no fabric address configured and no fabric suffix")
                    })?;
                Ok(Endpoint {
                    node: node.name.clone(),
                    address,
                    interface: locality.interface,
                    numa_domain: locality.numa_domain,
                })
            }
            AddressingMode::Lane(index) => {
                let lanes = if node.lanes.is_empty() {
                    &known.lanes
                } else {
                    &node.lanes
                };
                let lane = lanes.get(index as usize).ok_or_else(|| {
                    resolution_error(&format!("node has {} lane(s) configured", lanes.len()))
                })?;
                Ok(Endpoint {
                    node: node.name.clone(),
                    address: lane.address.clone(),
                    interface: lane.interface.clone(),
                    numa_domain: lane.numa_domain.or(locality.numa_domain),
                })
            }
        }
    }
}
