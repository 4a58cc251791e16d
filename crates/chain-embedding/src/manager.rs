//! Chain/subchain budget tracker
//!
//! Holds the live mapping state: VNF/SAP to host bindings, SG-hop to
//! substrate path bindings, and an undirected bipartite graph linking every
//! user chain (carrying its remaining latency budget) to the driver-made
//! subchains that consume it.

use petgraph::graph::{NodeIndex, UnGraph};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, error, info};

use crate::latency::LatencyOracle;
use crate::model::{HopIx, HostIx, LinkIx, ReqIx, RequestGraph, SubstrateGraph};
use crate::{EmbedError, Result};

/// An SG-hop addressed by its endpoints and id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HopTriple {
    pub from: ReqIx,
    pub to: ReqIx,
    pub hop: HopIx,
}

/// Substrate path an SG-hop is routed over.
#[derive(Debug, Clone, PartialEq)]
pub struct PathMapping {
    pub nodes: Vec<HostIx>,
    pub links: Vec<LinkIx>,
    pub latency: f64,
}

#[derive(Debug, Clone)]
pub enum ChainVertex {
    Chain {
        id: u32,
        avail_latency: f64,
    },
    Subchain {
        id: u32,
        hops: Vec<HopTriple>,
        last_used_host: Option<HostIx>,
    },
}

/// Chain budgets and subchain positions, comparable across time.
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetSnapshot {
    pub avail_latency: BTreeMap<u32, f64>,
    pub last_used_host: BTreeMap<u32, Option<HostIx>>,
}

#[derive(Debug, Clone)]
struct LatencyCommit {
    subchain: u32,
    used: f64,
    previous_budgets: Vec<(NodeIndex, f64)>,
    previous_host: Option<HostIx>,
}

#[derive(Debug, Clone)]
pub struct MappingManager {
    vnf_mapping: Vec<(ReqIx, HostIx)>,
    sap_count: usize,
    link_mapping: BTreeMap<HopIx, PathMapping>,
    chain_subchain: UnGraph<ChainVertex, ()>,
    vertex_index: HashMap<u32, NodeIndex>,
    max_input_chain_id: u32,
    hops: Vec<HopTriple>,
    hop_ceilings: HashMap<HopIx, f64>,
    latency: LatencyOracle,
    journal: Vec<LatencyCommit>,
}

impl MappingManager {
    /// Registers every user chain and binds every request SAP by name.
    pub fn new(
        substrate: &SubstrateGraph,
        request: &RequestGraph,
        latency: LatencyOracle,
    ) -> Result<Self> {
        let mut manager = Self {
            vnf_mapping: Vec::new(),
            sap_count: 0,
            link_mapping: BTreeMap::new(),
            chain_subchain: UnGraph::default(),
            vertex_index: HashMap::new(),
            max_input_chain_id: 0,
            hops: Vec::new(),
            hop_ceilings: HashMap::new(),
            latency,
            journal: Vec::new(),
        };

        for chain in request.chains() {
            let v = manager.chain_subchain.add_node(ChainVertex::Chain {
                id: chain.id,
                avail_latency: chain.delay,
            });
            manager.vertex_index.insert(chain.id, v);
        }
        manager.set_max_input_chain_id(request.max_chain_id().unwrap_or(0));

        for hop in request.hop_indices() {
            let (from, to) = request.hop_endpoints(hop);
            manager.hops.push(HopTriple { from, to, hop });
            if let Some(ceiling) = request.hop(hop).delay {
                manager.hop_ceilings.insert(hop, ceiling);
            }
        }

        for r in request.node_indices() {
            if let Some(name) = request.node(r).sap_name() {
                manager.bind_sap(substrate, r, name)?;
            }
        }
        info!(
            "Mapping manager ready: {} chains, {} SAPs bound",
            manager.vertex_index.len(),
            manager.sap_count
        );
        Ok(manager)
    }

    pub fn set_max_input_chain_id(&mut self, id: u32) {
        self.max_input_chain_id = id;
    }

    pub fn max_input_chain_id(&self) -> u32 {
        self.max_input_chain_id
    }

    pub fn latency(&self) -> &LatencyOracle {
        &self.latency
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Node bindings
    // ═══════════════════════════════════════════════════════════════════════

    /// SAP bindings are fixed for the whole search.
    pub fn bind_sap(&mut self, substrate: &SubstrateGraph, sap: ReqIx, name: &str) -> Result<HostIx> {
        if self.host_of(sap).is_some() {
            return Err(EmbedError::internal(format!(
                "SAP {} is already bound",
                name
            )));
        }
        let host = substrate.find_sap(name).ok_or_else(|| {
            error!("No SAP named {} in the substrate", name);
            EmbedError::mapping_failed(format!(
                "No SAP found in network with name: {}",
                name
            ))
        })?;
        self.vnf_mapping.insert(self.sap_count, (sap, host));
        self.sap_count += 1;
        Ok(host)
    }

    pub fn host_of(&self, node: ReqIx) -> Option<HostIx> {
        self.vnf_mapping
            .iter()
            .find(|(r, _)| *r == node)
            .map(|(_, h)| *h)
    }

    pub fn record_vnf(&mut self, vnf: ReqIx, host: HostIx) -> Result<()> {
        if self.host_of(vnf).is_some() {
            return Err(EmbedError::internal(format!(
                "VNF {:?} mapped twice",
                vnf
            )));
        }
        self.vnf_mapping.push((vnf, host));
        Ok(())
    }

    pub fn forget_vnf(&mut self, vnf: ReqIx, host: HostIx) -> Result<()> {
        let pos = self.vnf_mapping[self.sap_count..]
            .iter()
            .position(|&entry| entry == (vnf, host))
            .ok_or_else(|| {
                EmbedError::internal(format!("VNF {:?} is not mapped to {:?}", vnf, host))
            })?;
        self.vnf_mapping.remove(self.sap_count + pos);
        Ok(())
    }

    /// SAP bindings first, then VNFs in commit order.
    pub fn vnf_mapping(&self) -> &[(ReqIx, HostIx)] {
        &self.vnf_mapping
    }

    pub fn mapped_vnf_count(&self) -> usize {
        self.vnf_mapping.len() - self.sap_count
    }

    pub fn map_hop(&mut self, hop: HopIx, path: PathMapping) -> Result<()> {
        if self.link_mapping.contains_key(&hop) {
            return Err(EmbedError::internal(format!("SG-hop {:?} mapped twice", hop)));
        }
        self.link_mapping.insert(hop, path);
        Ok(())
    }

    pub fn unmap_hop(&mut self, hop: HopIx) -> Result<PathMapping> {
        self.link_mapping
            .remove(&hop)
            .ok_or_else(|| EmbedError::internal(format!("SG-hop {:?} is not mapped", hop)))
    }

    pub fn link_mapping(&self) -> &BTreeMap<HopIx, PathMapping> {
        &self.link_mapping
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Chain / subchain budgets
    // ═══════════════════════════════════════════════════════════════════════

    pub fn register_subchain(
        &mut self,
        subchain_id: u32,
        parents: &[u32],
        path: &[ReqIx],
        hops: &[HopIx],
    ) -> Result<()> {
        if subchain_id <= self.max_input_chain_id || self.vertex_index.contains_key(&subchain_id) {
            return Err(EmbedError::internal(format!(
                "Subchain id {} collides with an existing chain",
                subchain_id
            )));
        }
        if hops.is_empty() || path.len() != hops.len() + 1 {
            return Err(EmbedError::internal(format!(
                "Subchain {} has {} nodes for {} hops",
                subchain_id,
                path.len(),
                hops.len()
            )));
        }
        let mut parent_vertices = Vec::with_capacity(parents.len());
        for &cid in parents {
            match self.vertex_index.get(&cid) {
                Some(&v) if cid <= self.max_input_chain_id => parent_vertices.push(v),
                _ => {
                    return Err(EmbedError::internal(format!(
                        "Subchain {} depends on unknown user chain {}",
                        subchain_id, cid
                    )))
                }
            }
        }

        let triples = hops
            .iter()
            .zip(path.windows(2))
            .map(|(&hop, pair)| HopTriple {
                from: pair[0],
                to: pair[1],
                hop,
            })
            .collect();
        let v = self.chain_subchain.add_node(ChainVertex::Subchain {
            id: subchain_id,
            hops: triples,
            last_used_host: self.host_of(path[0]),
        });
        self.vertex_index.insert(subchain_id, v);
        for p in parent_vertices {
            self.chain_subchain.update_edge(v, p, ());
        }
        debug!("Subchain {} registered under chains {:?}", subchain_id, parents);
        Ok(())
    }

    fn subchain_vertex(&self, subchain_id: u32) -> Result<NodeIndex> {
        match self.vertex_index.get(&subchain_id) {
            Some(&v) if subchain_id > self.max_input_chain_id => Ok(v),
            _ => Err(EmbedError::internal(format!(
                "Unknown subchain {}",
                subchain_id
            ))),
        }
    }

    fn chain_budgets(&self, subchain: NodeIndex) -> Result<Vec<(NodeIndex, f64)>> {
        self.chain_subchain
            .neighbors(subchain)
            .map(|v| match self.chain_subchain[v] {
                ChainVertex::Chain { id, avail_latency } if id <= self.max_input_chain_id => {
                    Ok((v, avail_latency))
                }
                _ => Err(EmbedError::internal(
                    "Subchain is connected to something other than a user chain",
                )),
            })
            .collect()
    }

    pub fn parent_chains(&self, subchain_id: u32) -> Result<Vec<u32>> {
        let v = self.subchain_vertex(subchain_id)?;
        let mut ids: Vec<u32> = self
            .chain_subchain
            .neighbors(v)
            .filter_map(|p| match self.chain_subchain[p] {
                ChainVertex::Chain { id, .. } => Some(id),
                ChainVertex::Subchain { .. } => None,
            })
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    pub fn chain_avail_latency(&self, chain_id: u32) -> Option<f64> {
        let v = self.vertex_index.get(&chain_id)?;
        match self.chain_subchain[*v] {
            ChainVertex::Chain { avail_latency, .. } => Some(avail_latency),
            ChainVertex::Subchain { .. } => None,
        }
    }

    pub fn last_used_host(&self, subchain_id: u32) -> Result<Option<HostIx>> {
        let v = self.subchain_vertex(subchain_id)?;
        match &self.chain_subchain[v] {
            ChainVertex::Subchain { last_used_host, .. } => Ok(*last_used_host),
            ChainVertex::Chain { .. } => Err(EmbedError::internal("Expected a subchain vertex")),
        }
    }

    pub fn budget_snapshot(&self) -> BudgetSnapshot {
        let mut snapshot = BudgetSnapshot {
            avail_latency: BTreeMap::new(),
            last_used_host: BTreeMap::new(),
        };
        for v in self.chain_subchain.node_indices() {
            match &self.chain_subchain[v] {
                ChainVertex::Chain { id, avail_latency } => {
                    snapshot.avail_latency.insert(*id, *avail_latency);
                }
                ChainVertex::Subchain {
                    id, last_used_host, ..
                } => {
                    snapshot.last_used_host.insert(*id, *last_used_host);
                }
            }
        }
        snapshot
    }

    /// Latency still allowed on a subchain: the minimum remaining budget of
    /// its parent chains, capped by the hop's own ceiling when given.
    pub fn remaining_latency(&self, subchain_id: u32, hop: Option<HopTriple>) -> Result<f64> {
        let v = self.subchain_vertex(subchain_id)?;
        let mut allowed = match hop {
            Some(triple) => {
                if !self.hops.contains(&triple) {
                    return Err(EmbedError::internal(format!(
                        "{:?} is not an SG-hop of the request",
                        triple
                    )));
                }
                self.hop_ceilings
                    .get(&triple.hop)
                    .copied()
                    .unwrap_or(f64::MAX)
            }
            None => f64::MAX,
        };
        for (_, budget) in self.chain_budgets(v)? {
            allowed = allowed.min(budget);
        }
        Ok(allowed)
    }

    /// Spend `used` latency on every parent chain of the subchain.
    pub fn commit_latency(&mut self, subchain_id: u32, used: f64, new_host: HostIx) -> Result<()> {
        if !used.is_finite() || used < 0.0 {
            return Err(EmbedError::internal(format!(
                "Invalid latency consumption {}",
                used
            )));
        }
        let v = self.subchain_vertex(subchain_id)?;
        let budgets = self.chain_budgets(v)?;
        if let Some((_, budget)) = budgets.iter().find(|(_, b)| b - used < 0.0) {
            return Err(EmbedError::internal(format!(
                "Latency budget would drop below zero: {} - {}",
                budget, used
            )));
        }

        let previous_host = match &mut self.chain_subchain[v] {
            ChainVertex::Subchain { last_used_host, .. } => last_used_host.replace(new_host),
            ChainVertex::Chain { .. } => None,
        };
        for &(p, budget) in &budgets {
            if let ChainVertex::Chain { avail_latency, .. } = &mut self.chain_subchain[p] {
                *avail_latency = budget - used;
            }
        }
        self.journal.push(LatencyCommit {
            subchain: subchain_id,
            used,
            previous_budgets: budgets,
            previous_host,
        });
        Ok(())
    }

    /// Undo the most recent `commit_latency`.
    pub fn release_latency(&mut self, subchain_id: u32, used: f64) -> Result<()> {
        let commit = match self.journal.last() {
            Some(c) if c.subchain == subchain_id && c.used == used => c.clone(),
            Some(c) => {
                return Err(EmbedError::internal(format!(
                    "Latency release out of order: expected {} on subchain {}, got {} on {}",
                    c.used, c.subchain, used, subchain_id
                )))
            }
            None => return Err(EmbedError::internal("Latency release without a commit")),
        };
        self.journal.pop();

        let v = self.subchain_vertex(subchain_id)?;
        if let ChainVertex::Subchain { last_used_host, .. } = &mut self.chain_subchain[v] {
            *last_used_host = commit.previous_host;
        }
        for (p, budget) in commit.previous_budgets {
            if let ChainVertex::Chain { avail_latency, .. } = &mut self.chain_subchain[p] {
                *avail_latency = budget;
            }
        }
        Ok(())
    }

    /// Whether `n1` and `n2` lie close enough for every SG-hop from `vnf1` to
    /// `vnf2`, judged against the strictest remaining budget among them.
    pub fn node_distance_feasible(
        &self,
        vnf1: ReqIx,
        vnf2: ReqIx,
        n1: HostIx,
        n2: HostIx,
    ) -> Result<bool> {
        let mut strictest = f64::MAX;
        for triple in self.hops.iter().filter(|t| t.from == vnf1 && t.to == vnf2) {
            for v in self.chain_subchain.node_indices() {
                if let ChainVertex::Subchain { id, hops, .. } = &self.chain_subchain[v] {
                    if hops.contains(triple) {
                        strictest = strictest.min(self.remaining_latency(*id, Some(*triple))?);
                    }
                }
            }
        }
        Ok(self.latency.distance(n1, n2) <= strictest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Chain, RequestNode, Resources, SgHop, SubstrateLink, SubstrateNode};

    fn create_fixture() -> (SubstrateGraph, RequestGraph) {
        let mut g = SubstrateGraph::new();
        g.add_node(SubstrateNode::sap("A", "sap1")).unwrap();
        g.add_node(SubstrateNode::infra("B", Resources::new(4.0, 8.0, 16.0, 1000.0), 2.0))
            .unwrap();
        g.add_node(SubstrateNode::sap("C", "sap2")).unwrap();
        g.add_bidirectional_link("A", "B", SubstrateLink::new("l1", 100.0, 1.0))
            .unwrap();
        g.add_bidirectional_link("B", "C", SubstrateLink::new("l2", 100.0, 1.0))
            .unwrap();

        let mut r = RequestGraph::new();
        r.add_node(RequestNode::sap("s1", "sap1")).unwrap();
        r.add_node(RequestNode::vnf("v1", "fw", Resources::new(1.0, 1.0, 1.0, 0.0)))
            .unwrap();
        r.add_node(RequestNode::sap("s2", "sap2")).unwrap();
        r.add_hop("s1", "v1", SgHop::new("h1").with_delay(2.5)).unwrap();
        r.add_hop("v1", "s2", SgHop::new("h2")).unwrap();
        r.add_chain(Chain::new(1, ["s1", "v1", "s2"], ["h1", "h2"], 5.0))
            .unwrap();
        r.add_chain(Chain::new(2, ["s1", "v1", "s2"], ["h1", "h2"], 7.0))
            .unwrap();
        (g, r)
    }

    fn create_manager() -> (SubstrateGraph, RequestGraph, MappingManager) {
        let (g, r) = create_fixture();
        let oracle = LatencyOracle::all_pairs(&g).unwrap();
        let m = MappingManager::new(&g, &r, oracle).unwrap();
        (g, r, m)
    }

    fn path_of(r: &RequestGraph) -> (Vec<ReqIx>, Vec<HopIx>) {
        let chain = r.chain(1).unwrap();
        (chain.nodes.clone(), chain.hops.clone())
    }

    #[test]
    fn test_saps_bound_by_name() {
        let (g, r, m) = create_manager();
        assert_eq!(m.host_of(r.index_of("s1").unwrap()), g.index_of("A"));
        assert_eq!(m.host_of(r.index_of("s2").unwrap()), g.index_of("C"));
        assert_eq!(m.mapped_vnf_count(), 0);
        assert_eq!(m.max_input_chain_id(), 2);
    }

    #[test]
    fn test_missing_sap_is_fatal() {
        let (g, mut r) = create_fixture();
        r.add_node(RequestNode::sap("s3", "nowhere")).unwrap();
        let oracle = LatencyOracle::all_pairs(&g).unwrap();
        let err = MappingManager::new(&g, &r, oracle).unwrap_err();
        assert!(err.is_mapping_failure());
        assert!(!err.backtrack_possible());
    }

    #[test]
    fn test_subchain_registration_checks_ids() {
        let (_, r, mut m) = create_manager();
        let (path, hops) = path_of(&r);
        assert!(m.register_subchain(2, &[1], &path, &hops).is_err());
        assert!(m.register_subchain(3, &[9], &path, &hops).is_err());
        assert!(m.register_subchain(3, &[1], &path[..2], &hops).is_err());
        m.register_subchain(3, &[1, 2], &path, &hops).unwrap();
        assert_eq!(m.parent_chains(3).unwrap(), vec![1, 2]);
        assert_eq!(m.last_used_host(3).unwrap(), m.host_of(path[0]));
    }

    #[test]
    fn test_commit_spends_all_parent_budgets() {
        let (g, r, mut m) = create_manager();
        let (path, hops) = path_of(&r);
        m.register_subchain(3, &[1, 2], &path, &hops).unwrap();

        let b = g.index_of("B").unwrap();
        let before = m.budget_snapshot();
        m.commit_latency(3, 4.0, b).unwrap();
        assert_ne!(m.budget_snapshot(), before);
        assert_eq!(m.chain_avail_latency(1), Some(1.0));
        assert_eq!(m.chain_avail_latency(2), Some(3.0));
        assert_eq!(m.remaining_latency(3, None).unwrap(), 1.0);
        assert_eq!(m.last_used_host(3).unwrap(), Some(b));

        let err = m.commit_latency(3, 1.5, b).unwrap_err();
        assert!(matches!(err, EmbedError::InternalAlgorithm(_)));

        m.release_latency(3, 4.0).unwrap();
        assert_eq!(m.budget_snapshot(), before);
        assert_eq!(m.chain_avail_latency(1), Some(5.0));
        assert_eq!(m.chain_avail_latency(2), Some(7.0));
        assert_eq!(m.last_used_host(3).unwrap(), g.index_of("A"));
    }

    #[test]
    fn test_hop_ceiling_caps_remaining_latency() {
        let (_, r, mut m) = create_manager();
        let (path, hops) = path_of(&r);
        m.register_subchain(3, &[1, 2], &path, &hops).unwrap();
        let h1 = HopTriple {
            from: path[0],
            to: path[1],
            hop: hops[0],
        };
        let h2 = HopTriple {
            from: path[1],
            to: path[2],
            hop: hops[1],
        };
        assert_eq!(m.remaining_latency(3, Some(h1)).unwrap(), 2.5);
        assert_eq!(m.remaining_latency(3, Some(h2)).unwrap(), 5.0);

        let bogus = HopTriple {
            from: path[1],
            to: path[0],
            hop: hops[0],
        };
        assert!(m.remaining_latency(3, Some(bogus)).is_err());
        assert!(m.remaining_latency(1, None).is_err());
    }

    #[test]
    fn test_node_distance_against_strictest_hop() {
        let (g, r, mut m) = create_manager();
        let (path, hops) = path_of(&r);
        m.register_subchain(3, &[1, 2], &path, &hops).unwrap();
        let (a, b, c) = (
            g.index_of("A").unwrap(),
            g.index_of("B").unwrap(),
            g.index_of("C").unwrap(),
        );
        assert!(m.node_distance_feasible(path[0], path[1], a, b).unwrap());
        // A to C is 4 but the hop ceiling is 2.5
        assert!(!m.node_distance_feasible(path[0], path[1], a, c).unwrap());
    }

    #[test]
    fn test_vnf_and_hop_bindings() {
        let (g, r, mut m) = create_manager();
        let v1 = r.index_of("v1").unwrap();
        let b = g.index_of("B").unwrap();
        m.record_vnf(v1, b).unwrap();
        assert!(m.record_vnf(v1, b).is_err());
        assert_eq!(m.mapped_vnf_count(), 1);

        let h1 = r.hop_index_of("h1").unwrap();
        let path = PathMapping {
            nodes: vec![g.index_of("A").unwrap(), b],
            links: vec![g.link_index_of("l1").unwrap()],
            latency: 3.0,
        };
        m.map_hop(h1, path.clone()).unwrap();
        assert_eq!(m.unmap_hop(h1).unwrap(), path);
        assert!(m.unmap_hop(h1).is_err());

        m.forget_vnf(v1, b).unwrap();
        assert!(m.forget_vnf(v1, b).is_err());
        let s1 = r.index_of("s1").unwrap();
        assert!(m.forget_vnf(s1, g.index_of("A").unwrap()).is_err());
    }
}
