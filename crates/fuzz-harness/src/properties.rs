//! Invariants checked against generated inputs
//!
//! Each check returns `Err` with a readable message instead of panicking so
//! the same function serves `proptest!` blocks and the standalone runner.

use chain_embedding::latency::LatencyOracle;
use chain_embedding::ledger::{Allocation, Element, LedgerSnapshot, ResourceLedger};
use chain_embedding::model::Resources;
use chain_embedding::{CoreAlgorithm, EmbedError, MappingResult};
use std::collections::HashMap;

use crate::generators::{EmbeddingCase, LedgerCase, LedgerOp, SubstrateSpec};
use crate::runner::CaseOutcome;

const EPS: f64 = 1e-6;

fn close(a: f64, b: f64) -> bool {
    a == b || (a - b).abs() <= EPS
}

// ============================================================================
// Ledger
// ============================================================================

/// Every restore undoes exactly one subtraction, in reverse order, and only
/// the most recent one may be restored.
pub fn check_ledger_lifo(case: &LedgerCase) -> Result<(), String> {
    let substrate = case.substrate.build().map_err(|e| e.to_string())?;
    let mut ledger = ResourceLedger::new(substrate);
    let elements: Vec<Element> = ledger
        .substrate()
        .node_indices()
        .map(Element::Node)
        .chain(ledger.substrate().link_indices().map(Element::Link))
        .collect();
    let initial = ledger.snapshot();
    let mut taken: Vec<(Element, Resources, u32, LedgerSnapshot)> = Vec::new();

    for op in &case.ops {
        match op {
            LedgerOp::Take {
                element,
                demand,
                multiplicity,
            } => {
                let element = elements[element.index(elements.len())];
                let before = ledger.snapshot();
                match ledger.subtract(element, demand, *multiplicity) {
                    Allocation::Granted(_) => {
                        check_non_negative(&ledger.snapshot())?;
                        taken.push((element, *demand, *multiplicity, before));
                    }
                    Allocation::Infeasible => {
                        if ledger.snapshot() != before {
                            return Err(format!("refused subtraction on {:?} changed the ledger", element));
                        }
                    }
                }
            }
            LedgerOp::Give => give_back(&mut ledger, &mut taken)?,
        }
    }
    while !taken.is_empty() {
        give_back(&mut ledger, &mut taken)?;
    }

    if ledger.snapshot() != initial || ledger.depth() != 0 {
        return Err("ledger not back to its initial state".to_string());
    }
    Ok(())
}

fn give_back(
    ledger: &mut ResourceLedger,
    taken: &mut Vec<(Element, Resources, u32, LedgerSnapshot)>,
) -> Result<(), String> {
    let Some((element, demand, multiplicity, before)) = taken.pop() else {
        return Ok(());
    };

    if let Some(&(bottom, bottom_demand, bottom_mult, _)) = taken.first() {
        if !same_entry((bottom, bottom_demand, bottom_mult), (element, demand, multiplicity)) {
            let snapshot = ledger.snapshot();
            if ledger.restore(bottom, &bottom_demand, bottom_mult).is_ok() {
                return Err(format!("out of order restore on {:?} was accepted", bottom));
            }
            if ledger.snapshot() != snapshot {
                return Err("rejected restore changed the ledger".to_string());
            }
        }
    }

    ledger
        .restore(element, &demand, multiplicity)
        .map_err(|e| e.to_string())?;
    if ledger.snapshot() != before {
        return Err(format!("restore on {:?} is not exact", element));
    }
    Ok(())
}

/// Links only carry bandwidth, so only that part of a demand tells two
/// link subtractions apart.
fn same_entry(a: (Element, Resources, u32), b: (Element, Resources, u32)) -> bool {
    match a.0 {
        Element::Node(_) => a == b,
        Element::Link(_) => a.0 == b.0 && a.1.bandwidth == b.1.bandwidth && a.2 == b.2,
    }
}

fn check_non_negative(snapshot: &LedgerSnapshot) -> Result<(), String> {
    let nodes_ok = snapshot.nodes.iter().all(|r| r.is_valid());
    let links_ok = snapshot.links.iter().all(|&b| b >= 0.0);
    if nodes_ok && links_ok {
        Ok(())
    } else {
        Err("granted subtraction drove availability negative".to_string())
    }
}

// ============================================================================
// Latency
// ============================================================================

/// Relaying through any non-SAP node never beats the oracle distance, and
/// distances are symmetric over bidirectional links.
pub fn check_latency_triangle(spec: &SubstrateSpec) -> Result<(), String> {
    let g = spec.build().map_err(|e| e.to_string())?;
    let oracle = LatencyOracle::all_pairs(&g).map_err(|e| e.to_string())?;
    let nodes: Vec<_> = g.node_indices().collect();

    for &u in &nodes {
        if oracle.distance(u, u) != 0.0 {
            return Err(format!("distance of {} to itself is not zero", g.node(u).id));
        }
        for &v in &nodes {
            let d = oracle.distance(u, v);
            if !close(d, oracle.distance(v, u)) {
                return Err(format!("asymmetric distance {} <-> {}", g.node(u).id, g.node(v).id));
            }
            for &w in nodes.iter().filter(|&&w| !g.node(w).is_sap()) {
                let relayed = oracle.distance(u, w) + oracle.transit_delay(w) + oracle.distance(w, v);
                if d > relayed + EPS {
                    return Err(format!(
                        "d({}, {}) = {} exceeds {} through {}",
                        g.node(u).id,
                        g.node(v).id,
                        d,
                        relayed,
                        g.node(w).id
                    ));
                }
            }
        }
    }
    Ok(())
}

// ============================================================================
// Search
// ============================================================================

/// Outcome of running the search on a generated case
pub enum SearchOutcome {
    Mapped(Box<CoreAlgorithm>, MappingResult),
    Failed,
}

impl SearchOutcome {
    /// What the runner records for a case that held
    pub fn case_outcome(&self) -> CaseOutcome {
        match self {
            SearchOutcome::Mapped(_, result) => mapped(result),
            SearchOutcome::Failed => CaseOutcome::Unmappable,
        }
    }
}

fn mapped(result: &MappingResult) -> CaseOutcome {
    CaseOutcome::Mapped {
        backtracks: result.backtracks,
        min_remaining_latency: result
            .chain_latency
            .iter()
            .map(|c| c.remaining)
            .fold(f64::INFINITY, f64::min),
    }
}

/// Build the engine for a case; `None` when preprocessing already proves
/// the request unmappable.
fn prepare(case: &EmbeddingCase) -> Result<Option<CoreAlgorithm>, String> {
    let substrate = case.substrate.build().map_err(|e| e.to_string())?;
    let request = case.request.build().map_err(|e| e.to_string())?;
    match CoreAlgorithm::new(substrate, request, case.config()) {
        Ok(algorithm) => Ok(Some(algorithm)),
        Err(e) if e.is_mapping_failure() => Ok(None),
        Err(e) => Err(format!("preprocessing: {}", e)),
    }
}

/// Run the search; anything but success or a terminal mapping failure is a
/// broken invariant.
fn search(algorithm: &mut CoreAlgorithm) -> Result<Option<MappingResult>, String> {
    match algorithm.run() {
        Ok(result) => Ok(Some(result)),
        Err(EmbedError::Mapping {
            backtrack_possible: false,
            ..
        }) => Ok(None),
        Err(e) => Err(format!("search: {}", e)),
    }
}

pub fn run_search(case: &EmbeddingCase) -> Result<SearchOutcome, String> {
    let Some(mut algorithm) = prepare(case)? else {
        return Ok(SearchOutcome::Failed);
    };
    Ok(match search(&mut algorithm)? {
        Some(result) => SearchOutcome::Mapped(Box::new(algorithm), result),
        None => SearchOutcome::Failed,
    })
}

/// The search terminates with a well-formed mapping: every VNF on an infra
/// node, every path joined by the links it lists, and every chain's budget
/// spent exactly by its SG-hops without going negative.
pub fn check_bounded_search(case: &EmbeddingCase) -> Result<CaseOutcome, String> {
    let outcome = run_search(case)?;
    let SearchOutcome::Mapped(_, result) = &outcome else {
        return Ok(CaseOutcome::Unmappable);
    };
    let g = case.substrate.build().map_err(|e| e.to_string())?;

    for placement in &result.vnf_mapping {
        let host = g
            .index_of(&placement.host)
            .ok_or_else(|| format!("unknown host {}", placement.host))?;
        let is_sap = placement.vnf == "s1" || placement.vnf == "s2";
        if !is_sap && g.node(host).is_sap() {
            return Err(format!("{} placed on SAP {}", placement.vnf, placement.host));
        }
    }

    let endpoints: HashMap<&str, (&str, &str)> = g
        .links()
        .map(|(l, a, b)| {
            (
                g.link(l).id.as_str(),
                (g.node(a).id.as_str(), g.node(b).id.as_str()),
            )
        })
        .collect();
    for hop in &result.link_mapping {
        if hop.path.len() != hop.links.len() + 1 {
            return Err(format!("SG-hop {} has {} nodes for {} links", hop.hop, hop.path.len(), hop.links.len()));
        }
        if hop.path.first().map(String::as_str) != result.host_of(&hop.from)
            || hop.path.last().map(String::as_str) != result.host_of(&hop.to)
        {
            return Err(format!("SG-hop {} does not join its endpoints", hop.hop));
        }
        for (k, link) in hop.links.iter().enumerate() {
            if endpoints.get(link.as_str()) != Some(&(hop.path[k].as_str(), hop.path[k + 1].as_str())) {
                return Err(format!("SG-hop {} uses {} out of place", hop.hop, link));
            }
        }
    }

    for (chain, hops) in case.request.chain_hops() {
        let mut used = 0.0;
        for id in &hops {
            used += result
                .hop(id)
                .ok_or_else(|| format!("SG-hop {} not mapped", id))?
                .latency;
        }
        let budget = if chain == 1 {
            case.request.delay
        } else {
            case.request.branch.as_ref().map_or(0.0, |b| b.delay)
        };
        let remaining = result
            .remaining_latency(chain)
            .ok_or_else(|| format!("chain {} missing from result", chain))?;
        if remaining < -EPS {
            return Err(format!("chain {} overspent: {} left", chain, remaining));
        }
        if !close(budget - remaining, used) {
            return Err(format!(
                "chain {} spent {} but its hops add up to {}",
                chain,
                budget - remaining,
                used
            ));
        }
    }
    Ok(outcome.case_outcome())
}

/// After a successful search the ledger holds exactly the VNF demands and
/// the per-crossing hop bandwidth of the final mapping.
pub fn check_resource_conservation(case: &EmbeddingCase) -> Result<CaseOutcome, String> {
    let outcome = run_search(case)?;
    let SearchOutcome::Mapped(algorithm, _) = &outcome else {
        return Ok(CaseOutcome::Unmappable);
    };
    let ledger = algorithm.ledger();
    let g = ledger.substrate();
    let request = algorithm.request();
    let manager = algorithm.manager();

    let mut node_use: HashMap<_, Resources> = HashMap::new();
    let mut link_use: HashMap<_, f64> = HashMap::new();
    for &(vnf, host) in manager.vnf_mapping() {
        if let Some(demand) = request.node(vnf).demand() {
            let used = node_use.entry(host).or_default();
            used.cpu += demand.cpu;
            used.mem += demand.mem;
            used.storage += demand.storage;
            used.bandwidth += demand.bandwidth;
        }
    }
    for (&hop, mapped) in manager.link_mapping() {
        let bandwidth = request.hop(hop).bandwidth;
        for &n in mapped.nodes.iter().filter(|&&n| !g.node(n).is_sap()) {
            node_use.entry(n).or_default().bandwidth += bandwidth;
        }
        for &l in &mapped.links {
            *link_use.entry(l).or_default() += bandwidth;
        }
    }

    for n in g.node_indices().filter(|&n| !g.node(n).is_sap()) {
        let node = g.node(n);
        let used = node_use.get(&n).copied().unwrap_or_default();
        let (cap, avail) = (node.capacity, node.available);
        if !close(cap.cpu - avail.cpu, used.cpu)
            || !close(cap.mem - avail.mem, used.mem)
            || !close(cap.storage - avail.storage, used.storage)
            || !close(cap.bandwidth - avail.bandwidth, used.bandwidth)
        {
            return Err(format!(
                "node {} holds {:?} but the mapping uses {:?}",
                node.id,
                Resources::new(
                    cap.cpu - avail.cpu,
                    cap.mem - avail.mem,
                    cap.storage - avail.storage,
                    cap.bandwidth - avail.bandwidth
                ),
                used
            ));
        }
    }
    for l in g.link_indices() {
        let link = g.link(l);
        let used = link_use.get(&l).copied().unwrap_or(0.0);
        if !close(link.bandwidth - link.available_bandwidth, used) {
            return Err(format!(
                "link {} holds {} but the mapping uses {}",
                link.id,
                link.bandwidth - link.available_bandwidth,
                used
            ));
        }
    }
    Ok(outcome.case_outcome())
}

/// Undoing every committed unit, newest first, returns the ledger, each
/// chain's budget and each subchain's last host to their values before
/// the search, whether or not the search succeeded.
pub fn check_undo_restores_start(case: &EmbeddingCase) -> Result<CaseOutcome, String> {
    let Some(mut algorithm) = prepare(case)? else {
        return Ok(CaseOutcome::Unmappable);
    };
    let ledger = algorithm.ledger().snapshot();
    let budgets = algorithm.manager().budget_snapshot();
    let bindings = algorithm.manager().vnf_mapping().to_vec();

    let outcome = search(&mut algorithm)?.map_or(CaseOutcome::Unmappable, |result| mapped(&result));
    let committed = algorithm.engine().mapped_units().len();
    let mut undone = 0;
    while algorithm.rollback().map_err(|e| format!("rollback: {}", e))? {
        undone += 1;
    }

    if undone != committed {
        return Err(format!("{} units committed but {} undone", committed, undone));
    }
    if algorithm.ledger().snapshot() != ledger || algorithm.ledger().depth() != 0 {
        return Err(format!("ledger not restored after undoing {} units", undone));
    }
    let restored = algorithm.manager().budget_snapshot();
    if restored != budgets {
        return Err(format!("budgets {:?} not restored to {:?}", restored, budgets));
    }
    let manager = algorithm.manager();
    if manager.vnf_mapping() != bindings.as_slice() || !manager.link_mapping().is_empty() {
        return Err(format!(
            "{} VNFs and {} SG-hops still mapped",
            manager.mapped_vnf_count(),
            manager.link_mapping().len()
        ));
    }
    Ok(outcome)
}
