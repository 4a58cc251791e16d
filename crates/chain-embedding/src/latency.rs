//! Latency oracle and weight-based routing
//!
//! Two shortest-path services over the substrate:
//! - all-pairs end-to-end latency (link delays plus forwarding delay of
//!   every non-SAP intermediate), computed once before search
//! - single-source Dijkstra on routing weights with parallel-link
//!   selection, recomputed from the live ledger state

use petgraph::graph::NodeIndex;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use tracing::debug;

use crate::model::{HostIx, LinkIx, SubstrateGraph};
use crate::{EmbedError, Result};

// ═══════════════════════════════════════════════════════════════════════════
// All-pairs latency
// ═══════════════════════════════════════════════════════════════════════════

/// Read-only all-pairs latency table; `f64::INFINITY` when unreachable.
#[derive(Debug, Clone)]
pub struct LatencyOracle {
    dist: Vec<Vec<f64>>,
    transit: Vec<f64>,
}

impl LatencyOracle {
    /// Floyd-Warshall where a node may only relay if it is not a SAP, and
    /// relaying adds its forwarding delay.
    pub fn all_pairs(substrate: &SubstrateGraph) -> Result<Self> {
        let n = substrate.node_count();
        let mut transit = vec![0.0; n];
        for v in substrate.node_indices() {
            let node = substrate.node(v);
            if !node.delay.is_finite() || node.delay < 0.0 {
                return Err(EmbedError::bad_input(
                    format!("forwarding delay on node {}", node.id),
                    node.delay.to_string(),
                ));
            }
            transit[v.index()] = node.transit_delay();
        }

        let mut dist = vec![vec![f64::INFINITY; n]; n];
        for (i, row) in dist.iter_mut().enumerate() {
            row[i] = 0.0;
        }
        for (l, u, v) in substrate.links() {
            let delay = substrate.link(l).delay;
            if !delay.is_finite() || delay < 0.0 {
                return Err(EmbedError::bad_input(
                    format!("delay on link {}", substrate.link(l).id),
                    delay.to_string(),
                ));
            }
            let (u, v) = (u.index(), v.index());
            if u != v && delay < dist[u][v] {
                dist[u][v] = delay;
            }
        }

        for w in substrate.node_indices() {
            if substrate.node(w).is_sap() {
                continue;
            }
            let w = w.index();
            for u in 0..n {
                let via = dist[u][w] + transit[w];
                if via == f64::INFINITY {
                    continue;
                }
                for v in 0..n {
                    let candidate = via + dist[w][v];
                    if candidate < dist[u][v] {
                        dist[u][v] = candidate;
                    }
                }
            }
        }

        debug!("Latency oracle computed for {} nodes", n);
        Ok(Self { dist, transit })
    }

    pub fn distance(&self, u: HostIx, v: HostIx) -> f64 {
        self.dist[u.index()][v.index()]
    }

    pub fn transit_delay(&self, w: HostIx) -> f64 {
        self.transit[w.index()]
    }

    pub fn node_count(&self) -> usize {
        self.transit.len()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Single-source weighted routing
// ═══════════════════════════════════════════════════════════════════════════

/// Fringe entry; discovery sequence breaks distance ties.
#[derive(Debug, Clone, Copy)]
struct FringeEntry {
    dist: f64,
    seq: u64,
    node: NodeIndex,
}

impl PartialEq for FringeEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FringeEntry {}

impl PartialOrd for FringeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FringeEntry {
    // reversed: BinaryHeap pops the smallest (dist, seq)
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .dist
            .total_cmp(&self.dist)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Single-source shortest paths with the selected link of every step.
#[derive(Debug, Clone, Default)]
pub struct ShortestPaths {
    pub distances: HashMap<HostIx, f64>,
    pub paths: HashMap<HostIx, Vec<HostIx>>,
    pub links: HashMap<HostIx, Vec<LinkIx>>,
    /// Finalized nodes in the order they were settled
    pub order: Vec<HostIx>,
}

impl ShortestPaths {
    pub fn path_to(&self, n: HostIx) -> Option<(&[HostIx], &[LinkIx])> {
        match (self.paths.get(&n), self.links.get(&n)) {
            (Some(p), Some(l)) if self.distances.contains_key(&n) => Some((p.as_slice(), l.as_slice())),
            _ => None,
        }
    }
}

/// Dijkstra from `source` where stepping to `w` costs the cheapest parallel
/// link plus `w`'s node weight; the source's own weight seeds the distance.
/// `allowed` restricts the nodes that may be entered. Stops at `target` if
/// given and skips nodes farther than `cutoff`. A SAP other than the source
/// is reachable but never relays.
pub fn shortest_paths_by_weight(
    substrate: &SubstrateGraph,
    allowed: Option<&HashSet<HostIx>>,
    source: HostIx,
    target: Option<HostIx>,
    cutoff: Option<f64>,
) -> Result<ShortestPaths> {
    let mut result = ShortestPaths::default();
    let source_weight = substrate.node(source).weight;

    if target == Some(source) {
        result.distances.insert(source, source_weight);
        result.paths.insert(source, vec![source]);
        result.links.insert(source, Vec::new());
        result.order.push(source);
        return Ok(result);
    }

    let mut seen: HashMap<HostIx, f64> = HashMap::new();
    let mut fringe = BinaryHeap::new();
    let mut seq: u64 = 0;

    seen.insert(source, source_weight);
    result.paths.insert(source, vec![source]);
    result.links.insert(source, Vec::new());
    fringe.push(FringeEntry {
        dist: source_weight,
        seq,
        node: source,
    });

    while let Some(FringeEntry { dist: d, node: v, .. }) = fringe.pop() {
        if result.distances.contains_key(&v) {
            continue;
        }
        result.distances.insert(v, d);
        result.order.push(v);
        if Some(v) == target {
            break;
        }
        // SAPs end routes; only the source may forward
        if v != source && substrate.node(v).is_sap() {
            continue;
        }

        for (w, parallel) in substrate.neighbors_in_order(v) {
            if allowed.map_or(false, |a| !a.contains(&w)) {
                continue;
            }
            // first minimum wins among parallel links
            let mut best: Option<(LinkIx, f64)> = None;
            for link in parallel {
                let weight = substrate.link(link).weight;
                if best.map_or(true, |(_, b)| weight < b) {
                    best = Some((link, weight));
                }
            }
            let Some((link, link_weight)) = best else {
                continue;
            };

            let vw_dist = d + substrate.node(w).weight + link_weight;
            if cutoff.map_or(false, |c| vw_dist > c) {
                continue;
            }
            if let Some(&settled) = result.distances.get(&w) {
                if vw_dist < settled {
                    return Err(EmbedError::internal(
                        "Contradictory paths found: negative weights?",
                    ));
                }
            } else if seen.get(&w).map_or(true, |&s| vw_dist < s) {
                seen.insert(w, vw_dist);
                seq += 1;
                fringe.push(FringeEntry {
                    dist: vw_dist,
                    seq,
                    node: w,
                });
                let mut path = result.paths[&v].clone();
                path.push(w);
                let mut links = result.links[&v].clone();
                links.push(link);
                result.paths.insert(w, path);
                result.links.insert(w, links);
            }
        }
    }

    // drop tentative entries that were never settled
    let settled = &result.distances;
    result.paths.retain(|n, _| settled.contains_key(n));
    result.links.retain(|n, _| settled.contains_key(n));
    Ok(result)
}
