//! TopologyGraph: the declarative network description.
//!
//! The on-disk form is a JSON node-link document. Every node and edge object
//! is checked against a closed attribute schema, so a misspelled attribute is
//! a `SchemaError` instead of a silently ignored key.
//!
//! ```text
//! {"nodes": [{"id": 0, "version": "27.0", "ln": "lnd"}, ...],
//!  "edges": [{"source": 0, "target": 1},
//!            {"source": 0, "target": 1,
//!             "channel": {"block": 300, "index": 1, "capacity": 100000}}]}
//! ```
//!
//! Validation produces two edge partitions: P2P edges (no payload) feed
//! `init_peers`, channel edges feed the channel open scheduler.

use crate::domain::tank::{DEFAULT_VERSION, SUPPORTED_VERSIONS};
use crate::error::{GraphError, GraphResult};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;

/// Outbound connection ceiling of the node software for manual peers
pub const MAX_MANUAL_OUTBOUND: usize = 8;

// =============================================================================
// DOCUMENT SCHEMA
// =============================================================================

/// A node identifier as written in the document: a number or a numeric string
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeKey {
    Index(u64),
    Name(String),
}

impl NodeKey {
    fn to_index(&self) -> GraphResult<usize> {
        match self {
            NodeKey::Index(i) => usize::try_from(*i)
                .map_err(|_| GraphError::Topology(format!("node index {i} is out of range"))),
            NodeKey::Name(s) => s.trim().parse::<usize>().map_err(|_| {
                GraphError::Topology(format!("node id {s:?} is not an integer index"))
            }),
        }
    }
}

impl From<usize> for NodeKey {
    fn from(i: usize) -> Self {
        NodeKey::Index(i as u64)
    }
}

/// Whole topology document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GraphDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multigraph: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph: Option<GraphAttributes>,
    pub nodes: Vec<NodeDocument>,
    #[serde(default, alias = "links")]
    pub edges: Vec<EdgeDocument>,
    /// Auxiliary services deployed next to the tanks
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<String>,
}

/// Graph-level attributes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GraphAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<String>,
}

/// One node object
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeDocument {
    pub id: NodeKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Comma separated bitcoin.conf options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitcoin_config: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tc_netem: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_args: Option<String>,
    #[serde(default)]
    pub exporter: bool,
    #[serde(default)]
    pub collect_logs: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ln: Option<LnImpl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ln_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ln_cb_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ln_config: Option<String>,
}

impl NodeDocument {
    pub fn new(index: usize) -> Self {
        Self {
            id: NodeKey::from(index),
            version: None,
            image: None,
            bitcoin_config: None,
            tc_netem: None,
            build_args: None,
            exporter: false,
            collect_logs: false,
            ln: None,
            ln_image: None,
            ln_cb_image: None,
            ln_config: None,
        }
    }
}

/// One edge object
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EdgeDocument {
    pub source: NodeKey,
    pub target: NodeKey,
    /// Multigraph edge key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<ChannelDocument>,
}

/// Lightning channel payload of an edge
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelDocument {
    /// Block height the funding transaction must confirm in
    pub block: u64,
    /// Position of the funding transaction inside that block, from 1
    pub index: u32,
    /// Channel capacity in satoshis
    pub capacity: u64,
    #[serde(default)]
    pub push_amt: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_policy: Option<ChannelPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_policy: Option<ChannelPolicy>,
}

/// Per-direction routing policy. Unset fields are left to the implementation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_fee_msat: Option<u64>,
    /// Proportional fee in millionths
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee_rate_ppm: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cltv_expiry_delta: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_htlc_msat: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_htlc_msat: Option<u64>,
}

/// Lightning implementation variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LnImpl {
    Lnd,
    Cln,
}

impl fmt::Display for LnImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LnImpl::Lnd => f.write_str("lnd"),
            LnImpl::Cln => f.write_str("cln"),
        }
    }
}

impl FromStr for LnImpl {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lnd" => Ok(LnImpl::Lnd),
            "cln" => Ok(LnImpl::Cln),
            other => Err(format!("unknown lightning implementation: {other}")),
        }
    }
}

// =============================================================================
// VALIDATED MODEL
// =============================================================================

/// Deterministic channel position: (target block height, index within block)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId {
    pub block: u64,
    pub index: u32,
}

impl ChannelId {
    /// Short channel id in `BxTxO` form for the given funding output
    pub fn short_channel_id(&self, output: u32) -> String {
        format!("{}x{}x{}", self.block, self.index, output)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.block, self.index)
    }
}

/// Lightning node declared on a graph node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LnSpec {
    pub implementation: LnImpl,
    pub image: Option<String>,
    /// Image of the circuit breaker sidecar (LND only)
    pub cb_image: Option<String>,
    /// Extra command line options appended to the base configuration
    pub config: Option<String>,
}

/// A validated graph node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    pub index: usize,
    pub version: Option<String>,
    pub image: Option<String>,
    pub bitcoin_config: Option<String>,
    pub tc_netem: Option<String>,
    pub build_args: Option<String>,
    pub exporter: bool,
    pub collect_logs: bool,
    pub ln: Option<LnSpec>,
}

/// Plain P2P edge: `source` dials `target`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct P2pEdge {
    pub source: usize,
    pub target: usize,
}

/// Lightning channel edge: `source` opens a channel to `target`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEdge {
    pub source: usize,
    pub target: usize,
    pub id: ChannelId,
    pub capacity_sat: u64,
    pub push_amt_sat: u64,
    pub source_policy: Option<ChannelPolicy>,
    pub target_policy: Option<ChannelPolicy>,
}

/// Parsed and validated topology
#[derive(Debug, Clone)]
pub struct TopologyGraph {
    nodes: Vec<NodeSpec>,
    p2p_edges: Vec<P2pEdge>,
    channel_edges: Vec<ChannelEdge>,
    services: Vec<String>,
    document: GraphDocument,
}

impl TopologyGraph {
    /// Parse and validate a topology document.
    pub fn parse(source: &[u8]) -> GraphResult<Self> {
        let value: serde_json::Value =
            serde_json::from_slice(source).map_err(|e| GraphError::Parse(e.to_string()))?;
        let document: GraphDocument =
            serde_json::from_value(value).map_err(|e| GraphError::Schema(e.to_string()))?;
        Self::from_document(document)
    }

    /// Validate an in-memory document.
    pub fn from_document(document: GraphDocument) -> GraphResult<Self> {
        let mut nodes = Vec::with_capacity(document.nodes.len());
        for node in &document.nodes {
            nodes.push(node_spec(node)?);
        }
        check_contiguous(&nodes)?;
        nodes.sort_by_key(|n| n.index);

        let count = nodes.len();
        let mut p2p_edges = Vec::new();
        let mut channel_edges = Vec::new();
        for edge in &document.edges {
            let source = endpoint(&edge.source, count)?;
            let target = endpoint(&edge.target, count)?;
            if source == target {
                return Err(GraphError::Topology(format!(
                    "edge {source}->{target} is a self-loop"
                )));
            }
            match &edge.channel {
                None => p2p_edges.push(P2pEdge { source, target }),
                Some(channel) => {
                    for end in [source, target] {
                        if nodes[end].ln.is_none() {
                            return Err(GraphError::Topology(format!(
                                "channel edge {source}->{target} needs a lightning node on tank {end}"
                            )));
                        }
                    }
                    if channel.capacity == 0 || channel.push_amt >= channel.capacity {
                        return Err(GraphError::Topology(format!(
                            "channel {source}->{target}: push amount {} must be below capacity {}",
                            channel.push_amt, channel.capacity
                        )));
                    }
                    channel_edges.push(ChannelEdge {
                        source,
                        target,
                        id: ChannelId {
                            block: channel.block,
                            index: channel.index,
                        },
                        capacity_sat: channel.capacity,
                        push_amt_sat: channel.push_amt,
                        source_policy: channel.source_policy,
                        target_policy: channel.target_policy,
                    });
                }
            }
        }
        check_channel_indices(&channel_edges)?;

        let mut services = document.services.clone();
        if let Some(attrs) = &document.graph {
            services.extend(attrs.services.iter().cloned());
        }

        Ok(Self {
            nodes,
            p2p_edges,
            channel_edges,
            services,
            document,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[NodeSpec] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> Option<&NodeSpec> {
        self.nodes.get(index)
    }

    pub fn p2p_edges(&self) -> &[P2pEdge] {
        &self.p2p_edges
    }

    pub fn channel_edges(&self) -> &[ChannelEdge] {
        &self.channel_edges
    }

    pub fn services(&self) -> &[String] {
        &self.services
    }

    pub fn document(&self) -> &GraphDocument {
        &self.document
    }

    /// Nodes `index` must dial: targets of its outgoing P2P edges, deduplicated.
    pub fn init_peers(&self, index: usize) -> Vec<usize> {
        let mut seen = HashSet::new();
        self.p2p_edges
            .iter()
            .filter(|e| e.source == index)
            .map(|e| e.target)
            .filter(|t| seen.insert(*t))
            .collect()
    }

    pub fn to_json(&self) -> GraphResult<Vec<u8>> {
        serde_json::to_vec_pretty(&self.document).map_err(|e| GraphError::Parse(e.to_string()))
    }
}

fn node_spec(node: &NodeDocument) -> GraphResult<NodeSpec> {
    let index = node.id.to_index()?;
    let ln = match node.ln {
        Some(implementation) => Some(LnSpec {
            implementation,
            image: node.ln_image.clone(),
            cb_image: node.ln_cb_image.clone(),
            config: node.ln_config.clone(),
        }),
        None => {
            if node.ln_image.is_some() || node.ln_cb_image.is_some() || node.ln_config.is_some() {
                return Err(GraphError::Schema(format!(
                    "node {index} sets lightning attributes without `ln`"
                )));
            }
            None
        }
    };
    Ok(NodeSpec {
        index,
        version: node.version.clone(),
        image: node.image.clone(),
        bitcoin_config: node.bitcoin_config.clone(),
        tc_netem: node.tc_netem.clone(),
        build_args: node.build_args.clone(),
        exporter: node.exporter,
        collect_logs: node.collect_logs,
        ln,
    })
}

fn check_contiguous(nodes: &[NodeSpec]) -> GraphResult<()> {
    let ids: BTreeSet<usize> = nodes.iter().map(|n| n.index).collect();
    let contiguous = ids.len() == nodes.len() && ids.iter().copied().eq(0..nodes.len());
    if contiguous {
        Ok(())
    } else {
        let mut found: Vec<usize> = nodes.iter().map(|n| n.index).collect();
        found.sort_unstable();
        Err(GraphError::Topology(format!(
            "node indices must be exactly 0..{}, found {:?}",
            nodes.len(),
            found
        )))
    }
}

fn endpoint(key: &NodeKey, count: usize) -> GraphResult<usize> {
    let index = key.to_index()?;
    if index >= count {
        return Err(GraphError::Topology(format!(
            "edge references unknown node {index}"
        )));
    }
    Ok(index)
}

fn check_channel_indices(channels: &[ChannelEdge]) -> GraphResult<()> {
    let mut by_block: BTreeMap<u64, Vec<u32>> = BTreeMap::new();
    for channel in channels {
        by_block
            .entry(channel.id.block)
            .or_default()
            .push(channel.id.index);
    }
    for (block, mut indices) in by_block {
        indices.sort_unstable();
        for (expected, found) in (1u32..).zip(indices.iter().copied()) {
            if expected != found {
                return Err(GraphError::Topology(format!(
                    "channel indices in block {block} must be consecutive from 1, found {indices:?}"
                )));
            }
        }
    }
    Ok(())
}

// =============================================================================
// GENERATION
// =============================================================================

/// Options for [`create_cycle_graph`]
#[derive(Debug, Clone)]
pub struct CycleGraphOptions {
    pub nodes: usize,
    pub version: String,
    pub bitcoin_config: Option<String>,
    /// Draw each node's version from the supported set
    pub random_version: bool,
}

impl Default for CycleGraphOptions {
    fn default() -> Self {
        Self {
            nodes: 12,
            version: DEFAULT_VERSION.to_string(),
            bitcoin_config: None,
            random_version: false,
        }
    }
}

/// Build a ring where every node also dials a few random extra peers,
/// keeping each node at or below the manual outbound ceiling.
pub fn create_cycle_graph<R: Rng>(rng: &mut R, options: &CycleGraphOptions) -> GraphDocument {
    let n = options.nodes;
    let nodes = (0..n)
        .map(|i| {
            let mut node = NodeDocument::new(i);
            node.version = Some(if options.random_version {
                SUPPORTED_VERSIONS
                    .choose(rng)
                    .copied()
                    .unwrap_or(DEFAULT_VERSION)
                    .to_string()
            } else {
                options.version.clone()
            });
            node.bitcoin_config = options.bitcoin_config.clone();
            node
        })
        .collect();

    let mut edges = Vec::new();
    if n > 1 {
        for i in 0..n {
            let ring_target = (i + 1) % n;
            let mut targets = vec![ring_target];
            let mut candidates: Vec<usize> = (0..n).filter(|&t| t != i && t != ring_target).collect();
            candidates.shuffle(rng);
            let extra = rng.gen_range(0..=candidates.len().min(MAX_MANUAL_OUTBOUND - 1));
            targets.extend(candidates.into_iter().take(extra));
            for target in targets {
                edges.push(EdgeDocument {
                    source: NodeKey::from(i),
                    target: NodeKey::from(target),
                    key: None,
                    channel: None,
                });
            }
        }
    }

    GraphDocument {
        directed: Some(true),
        multigraph: Some(false),
        graph: None,
        nodes,
        edges,
        services: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn ring_json() -> &'static str {
        r#"{"nodes": [{"id": 0}, {"id": 1}, {"id": 2}],
            "edges": [{"source": 0, "target": 1},
                      {"source": 1, "target": 2},
                      {"source": 2, "target": 0}]}"#
    }

    #[test]
    fn test_parse_ring_partitions_edges() {
        let graph = TopologyGraph::parse(ring_json().as_bytes()).unwrap();
        assert_eq!(graph.len(), 3);
        assert_eq!(graph.p2p_edges().len(), 3);
        assert!(graph.channel_edges().is_empty());
        for i in 0..3 {
            assert_eq!(graph.init_peers(i), vec![(i + 1) % 3]);
        }
    }

    #[test]
    fn test_gap_in_indices_is_topology_error() {
        let json = r#"{"nodes": [{"id": 0}, {"id": 2}, {"id": 3}], "edges": []}"#;
        let err = TopologyGraph::parse(json.as_bytes()).unwrap_err();
        assert!(matches!(err, GraphError::Topology(_)), "{err}");
    }

    #[test]
    fn test_duplicate_indices_rejected() {
        let json = r#"{"nodes": [{"id": 0}, {"id": 0}], "edges": []}"#;
        assert!(matches!(
            TopologyGraph::parse(json.as_bytes()),
            Err(GraphError::Topology(_))
        ));
    }

    #[test]
    fn test_string_ids_and_any_order_accepted() {
        let json = r#"{"nodes": [{"id": "1"}, {"id": "0"}], "links": [{"source": "0", "target": "1"}]}"#;
        let graph = TopologyGraph::parse(json.as_bytes()).unwrap();
        assert_eq!(graph.node(0).unwrap().index, 0);
        assert_eq!(graph.init_peers(0), vec![1]);
    }

    #[test]
    fn test_unknown_node_attribute_is_schema_error() {
        let json = r#"{"nodes": [{"id": 0, "verison": "27.0"}], "edges": []}"#;
        let err = TopologyGraph::parse(json.as_bytes()).unwrap_err();
        assert!(matches!(err, GraphError::Schema(_)), "{err}");
    }

    #[test]
    fn test_wrong_attribute_type_is_schema_error() {
        let json = r#"{"nodes": [{"id": 0, "exporter": "yes"}], "edges": []}"#;
        assert!(matches!(
            TopologyGraph::parse(json.as_bytes()),
            Err(GraphError::Schema(_))
        ));
    }

    #[test]
    fn test_malformed_json_is_parse_error() {
        assert!(matches!(
            TopologyGraph::parse(b"{nodes: ["),
            Err(GraphError::Parse(_))
        ));
    }

    #[test]
    fn test_edge_to_unknown_node_rejected() {
        let json = r#"{"nodes": [{"id": 0}], "edges": [{"source": 0, "target": 5}]}"#;
        assert!(matches!(
            TopologyGraph::parse(json.as_bytes()),
            Err(GraphError::Topology(_))
        ));
    }

    fn ln_json(channels: &str) -> String {
        format!(
            r#"{{"nodes": [{{"id": 0, "ln": "lnd"}}, {{"id": 1, "ln": "cln"}}, {{"id": 2, "ln": "lnd"}}],
                "edges": [{channels}]}}"#
        )
    }

    #[test]
    fn test_channel_edges_are_not_init_peers() {
        let json = ln_json(
            r#"{"source": 0, "target": 1, "channel": {"block": 300, "index": 1, "capacity": 100000,
                 "source_policy": {"base_fee_msat": 2, "fee_rate_ppm": 10}}},
               {"source": 1, "target": 2}"#,
        );
        let graph = TopologyGraph::parse(json.as_bytes()).unwrap();
        assert!(graph.init_peers(0).is_empty());
        assert_eq!(graph.init_peers(1), vec![2]);
        let channel = &graph.channel_edges()[0];
        assert_eq!(channel.id, ChannelId { block: 300, index: 1 });
        assert_eq!(channel.source_policy.unwrap().base_fee_msat, Some(2));
        assert_eq!(channel.id.short_channel_id(0), "300x1x0");
    }

    #[test]
    fn test_channel_indices_must_be_consecutive() {
        let json = ln_json(
            r#"{"source": 0, "target": 1, "channel": {"block": 300, "index": 1, "capacity": 100000}},
               {"source": 1, "target": 2, "channel": {"block": 300, "index": 3, "capacity": 100000}}"#,
        );
        assert!(matches!(
            TopologyGraph::parse(json.as_bytes()),
            Err(GraphError::Topology(_))
        ));
    }

    #[test]
    fn test_duplicate_channel_index_rejected() {
        let json = ln_json(
            r#"{"source": 0, "target": 1, "channel": {"block": 300, "index": 1, "capacity": 100000}},
               {"source": 1, "target": 2, "channel": {"block": 300, "index": 1, "capacity": 100000}}"#,
        );
        assert!(TopologyGraph::parse(json.as_bytes()).is_err());
    }

    #[test]
    fn test_channel_needs_lightning_endpoints() {
        let json = r#"{"nodes": [{"id": 0, "ln": "lnd"}, {"id": 1}],
            "edges": [{"source": 0, "target": 1, "channel": {"block": 300, "index": 1, "capacity": 10}}]}"#;
        assert!(matches!(
            TopologyGraph::parse(json.as_bytes()),
            Err(GraphError::Topology(_))
        ));
    }

    #[test]
    fn test_cycle_graph_is_valid_and_bounded() {
        let mut rng = StdRng::seed_from_u64(7);
        let options = CycleGraphOptions {
            nodes: 15,
            random_version: true,
            ..Default::default()
        };
        let doc = create_cycle_graph(&mut rng, &options);
        let graph = TopologyGraph::from_document(doc).unwrap();
        assert_eq!(graph.len(), 15);
        for i in 0..15 {
            let peers = graph.init_peers(i);
            assert!(peers.contains(&((i + 1) % 15)));
            assert!(peers.len() <= MAX_MANUAL_OUTBOUND);
            assert!(!peers.contains(&i));
        }
        for node in graph.nodes() {
            let version = node.version.as_deref().unwrap();
            assert!(SUPPORTED_VERSIONS.contains(&version));
        }
    }
}
