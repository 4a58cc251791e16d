//! Search driver
//!
//! Walks the subchains hop by hop. An unplaced VNF at the head of a hop is
//! placed greedily on the best ranked host, remembering the runners-up for
//! backtracking; a hop between placed endpoints is routed on the cheapest
//! weighted path. When a step gets stuck the engine hands back the next
//! alternative together with the units to undo.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::backtrack::{BacktrackEngine, BacktrackRecord, LinkMappingRecord, MappedUnit, Step};
use crate::config::MappingConfig;
use crate::latency::{shortest_paths_by_weight, LatencyOracle};
use crate::ledger::{Element, ResourceLedger};
use crate::manager::{HopTriple, MappingManager, PathMapping};
use crate::model::{HostIx, LinkIx, ReqIx, RequestGraph, Resources, SubstrateGraph};
use crate::preprocess::divide_into_subchains;
use crate::{EmbedError, Result};

// ═══════════════════════════════════════════════════════════════════════════
// Objective
// ═══════════════════════════════════════════════════════════════════════════

/// Preference of a node resource utilisation in [0, 1]; idle is free.
pub fn pref_node_resource(x: f64) -> f64 {
    if x < 0.2 {
        0.0
    } else {
        1.25 * x - 0.25
    }
}

/// Preference of a bandwidth utilisation in [0, 1].
pub fn pref_bandwidth(x: f64) -> f64 {
    if x < 0.2 {
        0.0
    } else {
        -1.5625 * (x - 1.0).powi(2) + 1.0
    }
}

fn utilisation(capacity: f64, remaining: f64) -> f64 {
    if !capacity.is_finite() || capacity <= 0.0 {
        0.0
    } else {
        ((capacity - remaining) / capacity).clamp(0.0, 1.0)
    }
}

/// Latency of routing over `path`: link delays plus the forwarding delay of
/// every non-SAP node after the first. A single-node path crosses its node
/// once.
pub fn path_latency(substrate: &SubstrateGraph, path: &[HostIx], links: &[LinkIx]) -> f64 {
    if let [only] = path {
        return substrate.node(*only).transit_delay();
    }
    let link_delay: f64 = links.iter().map(|&l| substrate.link(l).delay).sum();
    let node_delay: f64 = path
        .iter()
        .skip(1)
        .map(|&n| substrate.node(n).transit_delay())
        .sum();
    link_delay + node_delay
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Committed,
    Stuck(String),
}

// ═══════════════════════════════════════════════════════════════════════════
// Result
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VnfPlacement {
    pub vnf: String,
    pub host: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HopPlacement {
    pub hop: String,
    pub from: String,
    pub to: String,
    pub path: Vec<String>,
    pub links: Vec<String>,
    pub latency: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainLatency {
    pub chain: u32,
    pub budget: f64,
    pub remaining: f64,
}

/// Successful embedding of a request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingResult {
    /// SAP bindings first, then VNFs in placement order
    pub vnf_mapping: Vec<VnfPlacement>,
    pub link_mapping: Vec<HopPlacement>,
    pub chain_latency: Vec<ChainLatency>,
    pub peak_vnf_cnt: usize,
    pub peak_sc_cnt: usize,
    pub backtracks: usize,
    pub computed_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl MappingResult {
    pub fn host_of(&self, vnf: &str) -> Option<&str> {
        self.vnf_mapping
            .iter()
            .find(|p| p.vnf == vnf)
            .map(|p| p.host.as_str())
    }

    pub fn hop(&self, hop: &str) -> Option<&HopPlacement> {
        self.link_mapping.iter().find(|h| h.hop == hop)
    }

    pub fn remaining_latency(&self, chain: u32) -> Option<f64> {
        self.chain_latency
            .iter()
            .find(|c| c.chain == chain)
            .map(|c| c.remaining)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Driver
// ═══════════════════════════════════════════════════════════════════════════

pub struct CoreAlgorithm {
    config: MappingConfig,
    request: RequestGraph,
    ledger: ResourceLedger,
    manager: MappingManager,
    engine: BacktrackEngine,
    placement: HashMap<ReqIx, HashSet<HostIx>>,
    peak_vnf_cnt: usize,
    backtracks: usize,
}

/// Embed `request` onto `substrate` in one call.
pub fn map_request(
    substrate: SubstrateGraph,
    request: RequestGraph,
    config: MappingConfig,
) -> Result<MappingResult> {
    CoreAlgorithm::new(substrate, request, config)?.run()
}

impl CoreAlgorithm {
    pub fn new(substrate: SubstrateGraph, mut request: RequestGraph, config: MappingConfig) -> Result<Self> {
        config.validate()?;
        info!(
            "Preprocessing {} chains over {} substrate nodes",
            request.chains().len(),
            substrate.node_count()
        );
        let oracle = LatencyOracle::all_pairs(&substrate)?;
        let mut manager = MappingManager::new(&substrate, &request, oracle)?;
        let pre = divide_into_subchains(&substrate, &mut request, &mut manager)?;
        let engine = BacktrackEngine::new(pre.subchains, config.branching_factor, config.bt_limit)?;

        Ok(Self {
            config,
            request,
            ledger: ResourceLedger::new(substrate),
            manager,
            engine,
            placement: pre.placement,
            peak_vnf_cnt: 0,
            backtracks: 0,
        })
    }

    /// The request as preprocessed, with chain bandwidth folded into hops
    pub fn request(&self) -> &RequestGraph {
        &self.request
    }

    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    pub fn manager(&self) -> &MappingManager {
        &self.manager
    }

    pub fn engine(&self) -> &BacktrackEngine {
        &self.engine
    }

    pub fn run(&mut self) -> Result<MappingResult> {
        let started = Instant::now();
        while let Some(step) = self.engine.advance() {
            if let Err(e) = self.map_step(step) {
                warn!("Mapping aborted: {}", e);
                return Err(e);
            }
        }
        let result = self.result(started);
        info!(
            "Mapped {} VNFs and {} SG-hops with {} backtracks in {} ms",
            self.manager.mapped_vnf_count(),
            result.link_mapping.len(),
            self.backtracks,
            result.elapsed_ms
        );
        Ok(result)
    }

    fn map_step(&mut self, mut step: Step) -> Result<()> {
        let mut pending: Option<BacktrackRecord> = None;
        loop {
            let outcome = match pending.take() {
                Some(record) => self.take_greedy_step(step.level, record)?,
                None if self.needs_placement(step.next) => self.map_one_vnf(step)?,
                None => self.map_one_hop(step)?,
            };
            let reason = match outcome {
                StepOutcome::Committed => return Ok(()),
                StepOutcome::Stuck(reason) => reason,
            };

            debug!("Stuck on subchain level {}: {}", step.level, reason);
            let alternative = self
                .engine
                .next_alternative()
                .map_err(|e| self.with_peak_vnf_cnt(e))?;
            self.backtracks += 1;
            for unit in alternative.rolled_back {
                self.undo(unit)?;
            }
            step = Step {
                level: alternative.level,
                current: alternative.record.prev_vnf,
                next: alternative.record.vnf,
                hop: alternative.record.hop,
            };
            pending = Some(alternative.record);
        }
    }

    fn with_peak_vnf_cnt(&self, err: EmbedError) -> EmbedError {
        match err {
            EmbedError::Mapping {
                message,
                backtrack_possible,
                peak_sc_cnt,
                ..
            } => EmbedError::Mapping {
                message,
                backtrack_possible,
                peak_vnf_cnt: Some(self.peak_vnf_cnt),
                peak_sc_cnt,
            },
            other => other,
        }
    }

    fn needs_placement(&self, node: ReqIx) -> bool {
        !self.request.node(node).is_sap() && self.manager.host_of(node).is_none()
    }

    fn host_of(&self, node: ReqIx) -> Result<HostIx> {
        self.manager.host_of(node).ok_or_else(|| {
            EmbedError::internal(format!(
                "{} should already be placed",
                self.request.node(node).id
            ))
        })
    }

    fn vnf_demand(&self, vnf: ReqIx) -> Resources {
        self.request.node(vnf).demand().copied().unwrap_or_default()
    }

    fn map_one_vnf(&mut self, step: Step) -> Result<StepOutcome> {
        let sub = self.engine.subchain(step.level);
        let sub_id = sub.id;
        let start = self.host_of(step.current)?;
        let paths = shortest_paths_by_weight(self.ledger.substrate(), Some(&sub.subgraph), start, None, None)?;

        let vnf = self.request.node(step.next);
        let demand = self.vnf_demand(step.next);
        let functional_type = vnf.functional_type().unwrap_or_default();
        let bandwidth = self.request.hop(step.hop).bandwidth;
        let allowed = self.placement.get(&step.next);
        let triple = HopTriple {
            from: step.current,
            to: step.next,
            hop: step.hop,
        };

        let mut candidates = Vec::new();
        for &host in &paths.order {
            let node = self.ledger.substrate().node(host);
            if node.is_sap()
                || !node.supports(functional_type)
                || !allowed.map_or(true, |a| a.contains(&host))
            {
                continue;
            }
            let Some((path, links)) = paths.path_to(host) else {
                continue;
            };
            if let Some((latency, objective)) =
                self.evaluate(sub_id, triple, host, &demand, path, links, bandwidth)?
            {
                debug!("{} on {}: objective {:.4}", vnf.id, node.id, objective);
                candidates.push(BacktrackRecord {
                    prev_vnf: step.current,
                    vnf: step.next,
                    hop: step.hop,
                    previous_host: start,
                    target: host,
                    path: path.to_vec(),
                    path_links: links.to_vec(),
                    bandwidth,
                    latency,
                    objective,
                });
            }
        }

        // worst first; among equal objectives the earlier discovered wins
        let mut ranked: Vec<(usize, BacktrackRecord)> = candidates.into_iter().enumerate().collect();
        ranked.sort_by(|(ia, a), (ib, b)| b.objective.total_cmp(&a.objective).then(ib.cmp(ia)));
        let mut ranked: Vec<BacktrackRecord> = ranked.into_iter().map(|(_, r)| r).collect();
        let Some(best) = ranked.pop() else {
            return Ok(StepOutcome::Stuck(format!(
                "no feasible host for {}",
                self.request.node(step.next).id
            )));
        };
        self.engine.push_candidates(sub_id, ranked)?;
        self.take_greedy_step(step.level, best)
    }

    /// Latency and objective of a feasible candidate, `None` otherwise.
    #[allow(clippy::too_many_arguments)]
    fn evaluate(
        &self,
        sub_id: u32,
        triple: HopTriple,
        host: HostIx,
        demand: &Resources,
        path: &[HostIx],
        links: &[LinkIx],
        bandwidth: f64,
    ) -> Result<Option<(f64, f64)>> {
        if !self.ledger.fits_placement(host, demand, path, links, bandwidth) {
            return Ok(None);
        }
        let latency = path_latency(self.ledger.substrate(), path, links);
        let allowed = self.manager.remaining_latency(sub_id, Some(triple))?;
        if allowed <= 0.0 || latency > allowed {
            return Ok(None);
        }
        if !self
            .manager
            .node_distance_feasible(triple.from, triple.to, path[0], host)?
        {
            return Ok(None);
        }
        if !self.chain_ends_reachable(sub_id, triple.to, host, latency)? {
            return Ok(None);
        }
        let objective = self.objective(host, demand, path, links, bandwidth, latency, allowed);
        Ok(Some((latency, objective)))
    }

    /// From `host`, the next already placed node of every parent chain must
    /// stay reachable within what that chain has left.
    fn chain_ends_reachable(&self, sub_id: u32, vnf: ReqIx, host: HostIx, latency: f64) -> Result<bool> {
        for cid in self.manager.parent_chains(sub_id)? {
            let (Some(chain), Some(avail)) = (self.request.chain(cid), self.manager.chain_avail_latency(cid))
            else {
                continue;
            };
            let Some(pos) = chain.nodes.iter().position(|&n| n == vnf) else {
                continue;
            };
            let next_placed = chain.nodes[pos + 1..]
                .iter()
                .find_map(|&n| self.manager.host_of(n));
            if let Some(target) = next_placed {
                if latency + self.manager.latency().distance(host, target) > avail {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    fn objective(
        &self,
        host: HostIx,
        demand: &Resources,
        path: &[HostIx],
        links: &[LinkIx],
        bandwidth: f64,
        latency: f64,
        allowed: f64,
    ) -> f64 {
        let g = self.ledger.substrate();
        let node = g.node(host);
        let p = &self.config.resource_priorities;
        let res = p.cpu * pref_node_resource(utilisation(node.capacity.cpu, node.available.cpu - demand.cpu))
            + p.mem * pref_node_resource(utilisation(node.capacity.mem, node.available.mem - demand.mem))
            + p.storage
                * pref_node_resource(utilisation(node.capacity.storage, node.available.storage - demand.storage));
        let max_res = p.sum() * pref_node_resource(1.0);
        let scaled_res = if max_res > 0.0 { 10.0 * res / max_res } else { 0.0 };

        let mut utils: Vec<f64> = links
            .iter()
            .map(|&l| {
                let link = g.link(l);
                utilisation(link.bandwidth, link.available_bandwidth - bandwidth)
            })
            .collect();
        for &n in path {
            let on_path = g.node(n);
            if on_path.is_sap() {
                continue;
            }
            let internal = if n == host { demand.bandwidth } else { 0.0 };
            utils.push(utilisation(
                on_path.capacity.bandwidth,
                on_path.available.bandwidth - internal - bandwidth,
            ));
        }
        let avg = if utils.is_empty() {
            0.0
        } else {
            utils.iter().sum::<f64>() / utils.len() as f64
        };
        let scaled_bw = 10.0 * pref_bandwidth(avg);

        let scaled_lat = if allowed > 0.0 && allowed < f64::MAX {
            10.0 * latency / allowed
        } else {
            0.0
        };

        self.config.res_factor * scaled_res
            + self.config.bw_factor * scaled_bw
            + self.config.lat_factor * scaled_lat
    }

    /// Commit a candidate placement. Candidates are evaluated against the
    /// exact ledger state they are committed on, so a refusal here means the
    /// bookkeeping is broken.
    fn take_greedy_step(&mut self, level: usize, record: BacktrackRecord) -> Result<StepOutcome> {
        let sub_id = self.engine.subchain(level).id;
        let demand = self.vnf_demand(record.vnf);
        let host = Element::Node(record.target);

        if !self.ledger.subtract(host, &demand, 1).is_granted() {
            return Err(EmbedError::internal(format!(
                "Ledger refused a pre-checked placement on {}",
                self.ledger.substrate().node(record.target).id
            )));
        }
        if !self
            .ledger
            .reserve_path(&record.path, &record.path_links, record.bandwidth)
            .is_granted()
        {
            self.ledger.restore(host, &demand, 1)?;
            return Err(EmbedError::internal("Ledger refused a pre-checked path"));
        }
        self.manager.record_vnf(record.vnf, record.target)?;
        self.manager.map_hop(
            record.hop,
            PathMapping {
                nodes: record.path.clone(),
                links: record.path_links.clone(),
                latency: record.latency,
            },
        )?;
        self.manager.commit_latency(sub_id, record.latency, record.target)?;
        debug!(
            "Placed {} on {} (latency {}, objective {:.4})",
            self.request.node(record.vnf).id,
            self.ledger.substrate().node(record.target).id,
            record.latency,
            record.objective
        );
        let arrival = record.arrival();
        self.engine.commit(Some(record), arrival)?;
        self.peak_vnf_cnt = self.peak_vnf_cnt.max(self.manager.mapped_vnf_count());
        Ok(StepOutcome::Committed)
    }

    fn map_one_hop(&mut self, step: Step) -> Result<StepOutcome> {
        let sub = self.engine.subchain(step.level);
        let sub_id = sub.id;
        let n1 = self.host_of(step.current)?;
        let n2 = self.host_of(step.next)?;
        let paths = shortest_paths_by_weight(self.ledger.substrate(), Some(&sub.subgraph), n1, Some(n2), None)?;
        let Some((path, links)) = paths.path_to(n2) else {
            return Ok(StepOutcome::Stuck(format!(
                "no path for SG-hop {}",
                self.request.hop(step.hop).id
            )));
        };
        let (path, links) = (path.to_vec(), links.to_vec());

        let latency = path_latency(self.ledger.substrate(), &path, &links);
        let triple = HopTriple {
            from: step.current,
            to: step.next,
            hop: step.hop,
        };
        let allowed = self.manager.remaining_latency(sub_id, Some(triple))?;
        if latency > allowed {
            return Ok(StepOutcome::Stuck(format!(
                "SG-hop {} needs latency {} but {} is left",
                self.request.hop(step.hop).id,
                latency,
                allowed
            )));
        }
        let bandwidth = self.request.hop(step.hop).bandwidth;
        if !self.ledger.reserve_path(&path, &links, bandwidth).is_granted() {
            return Ok(StepOutcome::Stuck(format!(
                "not enough bandwidth for SG-hop {}",
                self.request.hop(step.hop).id
            )));
        }

        self.manager.map_hop(
            step.hop,
            PathMapping {
                nodes: path.clone(),
                links: links.clone(),
                latency,
            },
        )?;
        self.manager.commit_latency(sub_id, latency, n2)?;
        debug!("Routed SG-hop {} over {} links", self.request.hop(step.hop).id, links.len());
        self.engine.commit(
            None,
            LinkMappingRecord {
                from: step.current,
                to: step.next,
                hop: step.hop,
                path,
                path_links: links,
                bandwidth,
                latency,
            },
        )?;
        Ok(StepOutcome::Committed)
    }

    /// Undo the newest committed unit. `Ok(false)` once nothing is left.
    pub fn rollback(&mut self) -> Result<bool> {
        if self.engine.mapped_units().is_empty() {
            return Ok(false);
        }
        let unit = self.engine.rollback()?;
        self.undo(unit)?;
        Ok(true)
    }

    /// Exact inverse of the commits recorded in `unit`, newest first.
    fn undo(&mut self, unit: MappedUnit) -> Result<()> {
        let sub_id = self.engine.subchain(unit.level).id;
        for link in unit.links_newest_first() {
            self.manager.release_latency(sub_id, link.latency)?;
            self.manager.unmap_hop(link.hop)?;
            self.ledger
                .release_path(&link.path, &link.path_links, link.bandwidth)?;
        }
        if let Some(record) = unit.record {
            debug!(
                "Undoing {} on {}",
                self.request.node(record.vnf).id,
                self.ledger.substrate().node(record.target).id
            );
            self.manager.forget_vnf(record.vnf, record.target)?;
            let demand = self.vnf_demand(record.vnf);
            self.ledger.restore(Element::Node(record.target), &demand, 1)?;
        }
        Ok(())
    }

    fn result(&self, started: Instant) -> MappingResult {
        let g = self.ledger.substrate();
        let r = &self.request;
        let vnf_mapping = self
            .manager
            .vnf_mapping()
            .iter()
            .map(|&(vnf, host)| VnfPlacement {
                vnf: r.node(vnf).id.clone(),
                host: g.node(host).id.clone(),
            })
            .collect();
        let link_mapping = self
            .manager
            .link_mapping()
            .iter()
            .map(|(&hop, mapped)| {
                let (from, to) = r.hop_endpoints(hop);
                HopPlacement {
                    hop: r.hop(hop).id.clone(),
                    from: r.node(from).id.clone(),
                    to: r.node(to).id.clone(),
                    path: mapped.nodes.iter().map(|&n| g.node(n).id.clone()).collect(),
                    links: mapped.links.iter().map(|&l| g.link(l).id.clone()).collect(),
                    latency: mapped.latency,
                }
            })
            .collect();
        let chain_latency = r
            .chains()
            .iter()
            .map(|c| ChainLatency {
                chain: c.id,
                budget: c.delay,
                remaining: self.manager.chain_avail_latency(c.id).unwrap_or(c.delay),
            })
            .collect();

        MappingResult {
            vnf_mapping,
            link_mapping,
            chain_latency,
            peak_vnf_cnt: self.peak_vnf_cnt,
            peak_sc_cnt: self.engine.state().peak_sc_cnt,
            backtracks: self.backtracks,
            computed_at: Utc::now(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }
}
