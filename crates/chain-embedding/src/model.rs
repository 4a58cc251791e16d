//! Substrate and request graph model
//!
//! Both graphs are petgraph digraphs with string ids mapped to stable
//! indices. Indices are never invalidated since nodes and edges are only
//! ever added.

use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{EmbedError, Result};

/// Index of a substrate node.
pub type HostIx = NodeIndex;
/// Index of a substrate link.
pub type LinkIx = EdgeIndex;
/// Index of a request node (VNF or SAP).
pub type ReqIx = NodeIndex;
/// Index of a request SG-hop.
pub type HopIx = EdgeIndex;

// ═══════════════════════════════════════════════════════════════════════════
// Resources
// ═══════════════════════════════════════════════════════════════════════════

/// Resource vector used for capacities, availability and VNF demands
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Resources {
    pub cpu: f64,
    pub mem: f64,
    pub storage: f64,
    /// Switching capacity, consumed once per flow traversing the node
    pub bandwidth: f64,
}

impl Resources {
    pub fn new(cpu: f64, mem: f64, storage: f64, bandwidth: f64) -> Self {
        Self {
            cpu,
            mem,
            storage,
            bandwidth,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(f64::INFINITY, f64::INFINITY, f64::INFINITY, f64::INFINITY)
    }

    pub fn bandwidth_only(bandwidth: f64) -> Self {
        Self::new(0.0, 0.0, 0.0, bandwidth)
    }

    /// Non-negative and not NaN; infinity is allowed
    pub fn is_valid(&self) -> bool {
        [self.cpu, self.mem, self.storage, self.bandwidth]
            .iter()
            .all(|v| !v.is_nan() && *v >= 0.0)
    }
}

/// Routing weight derived from available bandwidth.
pub(crate) fn weight_of(available_bandwidth: f64) -> f64 {
    if available_bandwidth <= 0.0 {
        f64::INFINITY
    } else {
        1.0 / available_bandwidth
    }
}

fn check_delay(what: &str, id: &str, delay: f64) -> Result<()> {
    if delay.is_finite() && delay >= 0.0 {
        Ok(())
    } else {
        Err(EmbedError::bad_input(
            format!("finite non-negative delay on {} {}", what, id),
            delay.to_string(),
        ))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Substrate
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Infra,
    Sap,
}

/// Substrate node: a host (INFRA) or a service access point
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubstrateNode {
    pub id: String,
    /// SAP binding name; equals `id` for infra nodes
    pub name: String,
    pub kind: NodeKind,
    pub capacity: Resources,
    pub available: Resources,
    /// Forwarding delay for traffic transiting this node
    pub delay: f64,
    /// Functional types this node can host; empty means any
    pub supported: Vec<String>,
    pub weight: f64,
}

impl SubstrateNode {
    pub fn infra(id: impl Into<String>, capacity: Resources, delay: f64) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind: NodeKind::Infra,
            capacity,
            available: capacity,
            delay,
            supported: Vec::new(),
            weight: weight_of(capacity.bandwidth),
        }
    }

    pub fn sap(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: NodeKind::Sap,
            capacity: Resources::unlimited(),
            available: Resources::unlimited(),
            delay: 0.0,
            supported: Vec::new(),
            weight: 0.0,
        }
    }

    pub fn with_supported<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.supported = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_sap(&self) -> bool {
        self.kind == NodeKind::Sap
    }

    pub fn supports(&self, functional_type: &str) -> bool {
        self.supported.is_empty() || self.supported.iter().any(|t| t == functional_type)
    }

    /// Delay added when traffic crosses this node; SAPs are endpoints only.
    pub fn transit_delay(&self) -> f64 {
        if self.is_sap() {
            0.0
        } else {
            self.delay
        }
    }

    pub(crate) fn refresh_weight(&mut self) {
        self.weight = if self.is_sap() {
            0.0
        } else {
            weight_of(self.available.bandwidth)
        };
    }
}

/// Directed substrate link
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubstrateLink {
    pub id: String,
    pub bandwidth: f64,
    pub available_bandwidth: f64,
    pub delay: f64,
    pub weight: f64,
}

impl SubstrateLink {
    pub fn new(id: impl Into<String>, bandwidth: f64, delay: f64) -> Self {
        Self {
            id: id.into(),
            bandwidth,
            available_bandwidth: bandwidth,
            delay,
            weight: weight_of(bandwidth),
        }
    }

    pub(crate) fn refresh_weight(&mut self) {
        self.weight = weight_of(self.available_bandwidth);
    }
}

/// Resource-annotated substrate multigraph
#[derive(Debug, Clone, Default)]
pub struct SubstrateGraph {
    graph: DiGraph<SubstrateNode, SubstrateLink>,
    node_index: HashMap<String, HostIx>,
    link_index: HashMap<String, LinkIx>,
}

impl SubstrateGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: SubstrateNode) -> Result<HostIx> {
        if self.node_index.contains_key(&node.id) {
            return Err(EmbedError::bad_input(
                "unique substrate node id",
                node.id.clone(),
            ));
        }
        check_delay("node", &node.id, node.delay)?;
        if !node.capacity.is_valid() || !node.available.is_valid() {
            return Err(EmbedError::bad_input(
                format!("non-negative resources on node {}", node.id),
                format!("{:?}", node.capacity),
            ));
        }
        let id = node.id.clone();
        let idx = self.graph.add_node(node);
        self.node_index.insert(id, idx);
        Ok(idx)
    }

    pub fn add_link(&mut self, from: &str, to: &str, link: SubstrateLink) -> Result<LinkIx> {
        let from_idx = self
            .index_of(from)
            .ok_or_else(|| EmbedError::bad_input("known link source", from))?;
        let to_idx = self
            .index_of(to)
            .ok_or_else(|| EmbedError::bad_input("known link target", to))?;
        if self.link_index.contains_key(&link.id) {
            return Err(EmbedError::bad_input("unique link id", link.id.clone()));
        }
        check_delay("link", &link.id, link.delay)?;
        if link.bandwidth.is_nan() || link.bandwidth < 0.0 {
            return Err(EmbedError::bad_input(
                format!("non-negative bandwidth on link {}", link.id),
                link.bandwidth.to_string(),
            ));
        }
        let id = link.id.clone();
        let idx = self.graph.add_edge(from_idx, to_idx, link);
        self.link_index.insert(id, idx);
        Ok(idx)
    }

    /// Adds `link` and its reverse twin `<id>-back`.
    pub fn add_bidirectional_link(
        &mut self,
        a: &str,
        b: &str,
        link: SubstrateLink,
    ) -> Result<(LinkIx, LinkIx)> {
        let mut back = link.clone();
        back.id = format!("{}-back", link.id);
        let forward = self.add_link(a, b, link)?;
        let backward = self.add_link(b, a, back)?;
        Ok((forward, backward))
    }

    pub fn index_of(&self, id: &str) -> Option<HostIx> {
        self.node_index.get(id).copied()
    }

    pub fn link_index_of(&self, id: &str) -> Option<LinkIx> {
        self.link_index.get(id).copied()
    }

    pub fn node(&self, idx: HostIx) -> &SubstrateNode {
        &self.graph[idx]
    }

    pub(crate) fn node_mut(&mut self, idx: HostIx) -> &mut SubstrateNode {
        &mut self.graph[idx]
    }

    pub fn link(&self, idx: LinkIx) -> &SubstrateLink {
        &self.graph[idx]
    }

    pub(crate) fn link_mut(&mut self, idx: LinkIx) -> &mut SubstrateLink {
        &mut self.graph[idx]
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn link_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn node_indices(&self) -> impl Iterator<Item = HostIx> + '_ {
        self.graph.node_indices()
    }

    pub fn link_indices(&self) -> impl Iterator<Item = LinkIx> + '_ {
        self.graph.edge_indices()
    }

    /// Endpoints of every link as `(link, source, target)`.
    pub fn links(&self) -> impl Iterator<Item = (LinkIx, HostIx, HostIx)> + '_ {
        self.graph
            .edge_references()
            .map(|e| (e.id(), e.source(), e.target()))
    }

    pub fn find_sap(&self, name: &str) -> Option<HostIx> {
        self.graph
            .node_indices()
            .find(|&i| self.graph[i].is_sap() && self.graph[i].name == name)
    }

    /// Out-neighbours in the order their first link was inserted, each with
    /// its parallel links in insertion order.
    pub fn neighbors_in_order(&self, v: HostIx) -> Vec<(HostIx, Vec<LinkIx>)> {
        let mut edges: Vec<(LinkIx, HostIx)> = self
            .graph
            .edges_directed(v, Direction::Outgoing)
            .map(|e| (e.id(), e.target()))
            .collect();
        edges.sort_by_key(|(id, _)| id.index());

        let mut grouped: Vec<(HostIx, Vec<LinkIx>)> = Vec::new();
        for (link, target) in edges {
            match grouped.iter_mut().find(|(n, _)| *n == target) {
                Some((_, links)) => links.push(link),
                None => grouped.push((target, vec![link])),
            }
        }
        grouped
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Request
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RequestNodeKind {
    Sap {
        name: String,
    },
    Vnf {
        functional_type: String,
        demand: Resources,
        /// Substrate node ids this VNF may be placed on; empty means any
        placement: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestNode {
    pub id: String,
    pub kind: RequestNodeKind,
}

impl RequestNode {
    pub fn sap(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: RequestNodeKind::Sap { name: name.into() },
        }
    }

    pub fn vnf(id: impl Into<String>, functional_type: impl Into<String>, demand: Resources) -> Self {
        Self {
            id: id.into(),
            kind: RequestNodeKind::Vnf {
                functional_type: functional_type.into(),
                demand,
                placement: Vec::new(),
            },
        }
    }

    pub fn with_placement<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let RequestNodeKind::Vnf { placement, .. } = &mut self.kind {
            *placement = hosts.into_iter().map(Into::into).collect();
        }
        self
    }

    pub fn is_sap(&self) -> bool {
        matches!(self.kind, RequestNodeKind::Sap { .. })
    }

    pub fn sap_name(&self) -> Option<&str> {
        match &self.kind {
            RequestNodeKind::Sap { name } => Some(name),
            RequestNodeKind::Vnf { .. } => None,
        }
    }

    pub fn demand(&self) -> Option<&Resources> {
        match &self.kind {
            RequestNodeKind::Vnf { demand, .. } => Some(demand),
            RequestNodeKind::Sap { .. } => None,
        }
    }

    pub fn functional_type(&self) -> Option<&str> {
        match &self.kind {
            RequestNodeKind::Vnf {
                functional_type, ..
            } => Some(functional_type),
            RequestNodeKind::Sap { .. } => None,
        }
    }

    pub fn placement(&self) -> &[String] {
        match &self.kind {
            RequestNodeKind::Vnf { placement, .. } => placement,
            RequestNodeKind::Sap { .. } => &[],
        }
    }
}

/// Directed service-graph hop between two request nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SgHop {
    pub id: String,
    pub bandwidth: f64,
    /// Per-hop latency ceiling
    pub delay: Option<f64>,
}

impl SgHop {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            bandwidth: 0.0,
            delay: None,
        }
    }

    pub fn with_bandwidth(mut self, bandwidth: f64) -> Self {
        self.bandwidth = bandwidth;
        self
    }

    pub fn with_delay(mut self, delay: f64) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// User-declared end-to-end requirement over a path of the request graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chain {
    pub id: u32,
    /// Request node ids, first to last
    pub nodes: Vec<String>,
    /// SG-hop ids, one per consecutive node pair
    pub hops: Vec<String>,
    /// Latency budget
    pub delay: f64,
    #[serde(default)]
    pub bandwidth: f64,
}

impl Chain {
    pub fn new<N, H>(id: u32, nodes: N, hops: H, delay: f64) -> Self
    where
        N: IntoIterator,
        N::Item: Into<String>,
        H: IntoIterator,
        H::Item: Into<String>,
    {
        Self {
            id,
            nodes: nodes.into_iter().map(Into::into).collect(),
            hops: hops.into_iter().map(Into::into).collect(),
            delay,
            bandwidth: 0.0,
        }
    }

    pub fn with_bandwidth(mut self, bandwidth: f64) -> Self {
        self.bandwidth = bandwidth;
        self
    }
}

/// Chain resolved against the request graph.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainPath {
    pub id: u32,
    pub nodes: Vec<ReqIx>,
    pub hops: Vec<HopIx>,
    pub delay: f64,
    pub bandwidth: f64,
}

impl ChainPath {
    pub fn begin(&self) -> ReqIx {
        self.nodes[0]
    }

    pub fn end(&self) -> ReqIx {
        self.nodes[self.nodes.len() - 1]
    }
}

/// Service request: VNFs, SAPs, SG-hops and the chains over them
#[derive(Debug, Clone, Default)]
pub struct RequestGraph {
    graph: DiGraph<RequestNode, SgHop>,
    node_index: HashMap<String, ReqIx>,
    hop_index: HashMap<String, HopIx>,
    chains: Vec<ChainPath>,
}

impl RequestGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: RequestNode) -> Result<ReqIx> {
        if self.node_index.contains_key(&node.id) {
            return Err(EmbedError::bad_input("unique request node id", node.id.clone()));
        }
        if let Some(demand) = node.demand() {
            if !demand.is_valid() {
                return Err(EmbedError::bad_input(
                    format!("non-negative demand on VNF {}", node.id),
                    format!("{:?}", demand),
                ));
            }
        }
        let id = node.id.clone();
        let idx = self.graph.add_node(node);
        self.node_index.insert(id, idx);
        Ok(idx)
    }

    pub fn add_hop(&mut self, from: &str, to: &str, hop: SgHop) -> Result<HopIx> {
        let from_idx = self
            .index_of(from)
            .ok_or_else(|| EmbedError::bad_input("known SG-hop source", from))?;
        let to_idx = self
            .index_of(to)
            .ok_or_else(|| EmbedError::bad_input("known SG-hop target", to))?;
        if self.hop_index.contains_key(&hop.id) {
            return Err(EmbedError::bad_input("unique SG-hop id", hop.id.clone()));
        }
        if hop.bandwidth.is_nan() || hop.bandwidth < 0.0 {
            return Err(EmbedError::bad_input(
                format!("non-negative bandwidth on SG-hop {}", hop.id),
                hop.bandwidth.to_string(),
            ));
        }
        if let Some(delay) = hop.delay {
            check_delay("SG-hop", &hop.id, delay)?;
        }
        let id = hop.id.clone();
        let idx = self.graph.add_edge(from_idx, to_idx, hop);
        self.hop_index.insert(id, idx);
        Ok(idx)
    }

    pub fn add_chain(&mut self, chain: Chain) -> Result<()> {
        if self.chains.iter().any(|c| c.id == chain.id) {
            return Err(EmbedError::bad_input("unique chain id", chain.id.to_string()));
        }
        if chain.hops.is_empty() || chain.nodes.len() != chain.hops.len() + 1 {
            return Err(EmbedError::bad_input(
                format!("chain {} with one more node than hops", chain.id),
                format!("{} nodes, {} hops", chain.nodes.len(), chain.hops.len()),
            ));
        }
        check_delay("chain", &chain.id.to_string(), chain.delay)?;
        if chain.bandwidth.is_nan() || chain.bandwidth < 0.0 {
            return Err(EmbedError::bad_input(
                format!("non-negative bandwidth on chain {}", chain.id),
                chain.bandwidth.to_string(),
            ));
        }

        let nodes = chain
            .nodes
            .iter()
            .map(|id| {
                self.index_of(id)
                    .ok_or_else(|| EmbedError::bad_input("known chain node", id.as_str()))
            })
            .collect::<Result<Vec<_>>>()?;
        let hops = chain
            .hops
            .iter()
            .map(|id| {
                self.hop_index_of(id)
                    .ok_or_else(|| EmbedError::bad_input("known chain SG-hop", id.as_str()))
            })
            .collect::<Result<Vec<_>>>()?;

        for (i, &hop) in hops.iter().enumerate() {
            if self.hop_endpoints(hop) != (nodes[i], nodes[i + 1]) {
                return Err(EmbedError::bad_input(
                    format!(
                        "SG-hop {} connecting {} and {}",
                        chain.hops[i],
                        chain.nodes[i],
                        chain.nodes[i + 1]
                    ),
                    format!("chain {}", chain.id),
                ));
            }
        }

        self.chains.push(ChainPath {
            id: chain.id,
            nodes,
            hops,
            delay: chain.delay,
            bandwidth: chain.bandwidth,
        });
        Ok(())
    }

    pub fn index_of(&self, id: &str) -> Option<ReqIx> {
        self.node_index.get(id).copied()
    }

    pub fn hop_index_of(&self, id: &str) -> Option<HopIx> {
        self.hop_index.get(id).copied()
    }

    pub fn node(&self, idx: ReqIx) -> &RequestNode {
        &self.graph[idx]
    }

    pub fn hop(&self, idx: HopIx) -> &SgHop {
        &self.graph[idx]
    }

    pub(crate) fn hop_mut(&mut self, idx: HopIx) -> &mut SgHop {
        &mut self.graph[idx]
    }

    pub fn hop_endpoints(&self, idx: HopIx) -> (ReqIx, ReqIx) {
        let e = &self.graph.raw_edges()[idx.index()];
        (e.source(), e.target())
    }

    pub fn node_indices(&self) -> impl Iterator<Item = ReqIx> + '_ {
        self.graph.node_indices()
    }

    pub fn hop_indices(&self) -> impl Iterator<Item = HopIx> + '_ {
        self.graph.edge_indices()
    }

    /// SG-hops from `a` to `b`, in insertion order.
    pub fn hops_between(&self, a: ReqIx, b: ReqIx) -> Vec<HopIx> {
        let mut hops: Vec<HopIx> = self.graph.edges_connecting(a, b).map(|e| e.id()).collect();
        hops.sort_by_key(|h| h.index());
        hops
    }

    pub fn chains(&self) -> &[ChainPath] {
        &self.chains
    }

    pub fn chain(&self, id: u32) -> Option<&ChainPath> {
        self.chains.iter().find(|c| c.id == id)
    }

    pub fn max_chain_id(&self) -> Option<u32> {
        self.chains.iter().map(|c| c.id).max()
    }

    /// Chain starts and ends on a SAP.
    pub fn is_end_to_end(&self, chain: &ChainPath) -> bool {
        self.node(chain.begin()).is_sap() && self.node(chain.end()).is_sap()
    }
}
