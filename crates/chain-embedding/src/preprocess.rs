//! Request preprocessing
//!
//! Cuts the user chains into disjoint subchains the search walks one by
//! one, and derives where each VNF may be placed:
//! 1. chain bandwidths are added onto their SG-hops
//! 2. every SAP-to-SAP chain gets the substrate nodes that fit inside its
//!    latency budget
//! 3. SG-hops are coloured by the set of chains containing them
//! 4. chains, strictest budget first, are split at colour changes and at
//!    VNFs an earlier subchain already reaches

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use tracing::{debug, info};

use crate::latency::LatencyOracle;
use crate::manager::MappingManager;
use crate::model::{ChainPath, HopIx, HostIx, ReqIx, RequestGraph, SubstrateGraph};
use crate::{EmbedError, Result};

/// A driver-made piece of one or more user chains.
#[derive(Debug, Clone, PartialEq)]
pub struct Subchain {
    pub id: u32,
    /// User chains whose budgets this subchain spends
    pub parents: Vec<u32>,
    pub path: Vec<ReqIx>,
    pub hops: Vec<HopIx>,
    /// Substrate nodes the subchain may route through
    pub subgraph: HashSet<HostIx>,
}

#[derive(Debug, Clone)]
pub struct Preprocessed {
    pub subchains: Vec<Subchain>,
    /// Allowed hosts per VNF
    pub placement: HashMap<ReqIx, HashSet<HostIx>>,
}

/// Substrate nodes usable by a SAP-to-SAP chain: those connected to the
/// begin SAP through nodes that could lie on a route within the budget.
pub fn find_subgraph_for_chain(
    substrate: &SubstrateGraph,
    oracle: &LatencyOracle,
    begin: HostIx,
    end: HostIx,
    budget: f64,
) -> Option<HashSet<HostIx>> {
    if oracle.distance(begin, end) > budget {
        return None;
    }
    let within = |n: HostIx| {
        n == begin
            || n == end
            || oracle.distance(begin, n) + oracle.transit_delay(n) + oracle.distance(n, end) <= budget
    };

    let mut visited: HashSet<HostIx> = HashSet::from([begin]);
    let mut pending = VecDeque::from([begin]);
    while let Some(current) = pending.pop_front() {
        // SAPs terminate routes
        if current != begin && substrate.node(current).is_sap() {
            continue;
        }
        for (n, _) in substrate.neighbors_in_order(current) {
            if !visited.contains(&n) && within(n) {
                visited.insert(n);
                pending.push_back(n);
            }
        }
    }
    visited.contains(&end).then_some(visited)
}

/// Chain ids per SG-hop.
fn colour_hops(request: &RequestGraph) -> HashMap<HopIx, BTreeSet<u32>> {
    let mut colours: HashMap<HopIx, BTreeSet<u32>> = HashMap::new();
    for chain in request.chains() {
        for &hop in &chain.hops {
            colours.entry(hop).or_default().insert(chain.id);
        }
    }
    colours
}

fn intersect_subgraphs<'a, I>(ids: I, subgraphs: &HashMap<u32, HashSet<HostIx>>) -> Option<HashSet<HostIx>>
where
    I: IntoIterator<Item = &'a u32>,
{
    let mut result: Option<HashSet<HostIx>> = None;
    for id in ids {
        if let Some(sg) = subgraphs.get(id) {
            result = Some(match result {
                None => sg.clone(),
                Some(acc) => acc.intersection(sg).copied().collect(),
            });
        }
    }
    result
}

pub fn divide_into_subchains(
    substrate: &SubstrateGraph,
    request: &mut RequestGraph,
    manager: &mut MappingManager,
) -> Result<Preprocessed> {
    if request.chains().is_empty() {
        return Err(EmbedError::bad_input("at least one chain", "none"));
    }

    let chains: Vec<ChainPath> = request.chains().to_vec();
    for chain in &chains {
        for &hop in &chain.hops {
            request.hop_mut(hop).bandwidth += chain.bandwidth;
        }
    }

    // ── latency-bounded subgraphs of SAP-to-SAP chains ──────────────────────
    let mut subgraphs: HashMap<u32, HashSet<HostIx>> = HashMap::new();
    for chain in chains.iter().filter(|c| request.is_end_to_end(c)) {
        let (begin, end) = match (manager.host_of(chain.begin()), manager.host_of(chain.end())) {
            (Some(b), Some(e)) => (b, e),
            _ => return Err(EmbedError::internal("SAP of a chain is not bound")),
        };
        let subgraph = find_subgraph_for_chain(substrate, manager.latency(), begin, end, chain.delay)
            .ok_or_else(|| {
                EmbedError::mapping_failed(format!(
                    "Chain {} end is further than its latency requirement {}",
                    chain.id, chain.delay
                ))
            })?;
        debug!("Chain {} may use {} substrate nodes", chain.id, subgraph.len());
        subgraphs.insert(chain.id, subgraph);
    }
    if subgraphs.is_empty() {
        return Err(EmbedError::bad_input(
            "at least one SAP-to-SAP chain",
            format!("{} chains between VNFs", chains.len()),
        ));
    }

    // ── colouring ───────────────────────────────────────────────────────────
    let colours = colour_hops(request);
    for hop in request.hop_indices() {
        let covered = colours
            .get(&hop)
            .map_or(false, |c| c.iter().any(|id| subgraphs.contains_key(id)));
        if !covered {
            return Err(EmbedError::bad_input(
                "every SG-hop in some SAP-to-SAP chain",
                request.hop(hop).id.clone(),
            ));
        }
    }

    // ── placement criteria ──────────────────────────────────────────────────
    let mut placement: HashMap<ReqIx, HashSet<HostIx>> = HashMap::new();
    for vnf in request.node_indices().filter(|&r| !request.node(r).is_sap()) {
        let node_colour: BTreeSet<u32> = colours
            .iter()
            .filter(|(hop, _)| {
                let (a, b) = request.hop_endpoints(**hop);
                a == vnf || b == vnf
            })
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect();
        let mut allowed = intersect_subgraphs(&node_colour, &subgraphs).ok_or_else(|| {
            EmbedError::bad_input("VNF on some SAP-to-SAP chain", request.node(vnf).id.clone())
        })?;

        let given = request.node(vnf).placement();
        if !given.is_empty() {
            let mut hosts = HashSet::new();
            for id in given {
                let host = substrate
                    .index_of(id)
                    .ok_or_else(|| EmbedError::bad_input("known placement host", id.clone()))?;
                hosts.insert(host);
            }
            allowed.retain(|h| hosts.contains(h));
        }
        if allowed.is_empty() {
            return Err(EmbedError::mapping_failed(format!(
                "Given and internal placement criteria of VNF {} have no intersection",
                request.node(vnf).id
            )));
        }
        placement.insert(vnf, allowed);
    }

    // ── division ────────────────────────────────────────────────────────────
    // SAP-to-SAP chains first; the others are fully covered by them
    let mut order: Vec<&ChainPath> = chains.iter().collect();
    order.sort_by(|a, b| {
        subgraphs
            .contains_key(&b.id)
            .cmp(&subgraphs.contains_key(&a.id))
            .then(a.delay.total_cmp(&b.delay))
    });

    let mut reached: HashSet<ReqIx> = request
        .node_indices()
        .filter(|&r| request.node(r).is_sap())
        .collect();
    let mut covered: HashSet<HopIx> = HashSet::new();
    let mut subchains: Vec<Subchain> = Vec::new();
    let mut next_id = manager.max_input_chain_id() + 1;

    for chain in order {
        let mut i = 0;
        while i < chain.hops.len() {
            if covered.contains(&chain.hops[i]) {
                i += 1;
                continue;
            }
            if !reached.contains(&chain.nodes[i]) {
                return Err(EmbedError::internal(format!(
                    "Subchain of chain {} would start at an unreached node",
                    chain.id
                )));
            }
            let colour = &colours[&chain.hops[i]];
            let mut path = vec![chain.nodes[i]];
            let mut hops = Vec::new();
            let mut j = i;
            while j < chain.hops.len()
                && !covered.contains(&chain.hops[j])
                && &colours[&chain.hops[j]] == colour
            {
                hops.push(chain.hops[j]);
                covered.insert(chain.hops[j]);
                let node = chain.nodes[j + 1];
                path.push(node);
                j += 1;
                if !reached.insert(node) {
                    break;
                }
            }

            let parents: Vec<u32> = colour.iter().copied().collect();
            let subgraph = intersect_subgraphs(colour.iter(), &subgraphs).unwrap_or_default();
            manager.register_subchain(next_id, &parents, &path, &hops)?;
            subchains.push(Subchain {
                id: next_id,
                parents,
                path,
                hops,
                subgraph,
            });
            next_id += 1;
            i = j;
        }
    }

    info!(
        "Request divided into {} subchains over {} chains",
        subchains.len(),
        chains.len()
    );
    Ok(Preprocessed {
        subchains,
        placement,
    })
}
