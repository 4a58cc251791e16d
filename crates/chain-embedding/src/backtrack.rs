//! Bounded backtracking engine
//!
//! Two stacks drive the search:
//! - a ring buffer of candidate levels, at most `bt_limit` deep, each
//!   holding at most `branching_factor` untried placements; overflow
//!   evicts the oldest entry
//! - an unbounded LIFO of committed mapping units, popped to undo work
//!
//! The position of the search (subchain level, index within the subchain)
//! is an explicit [`EngineState`] value whose transitions are pure.

use std::num::NonZeroUsize;
use tracing::debug;

use crate::model::{HopIx, HostIx, LinkIx, ReqIx};
use crate::preprocess::Subchain;
use crate::{EmbedError, Result};

// ═══════════════════════════════════════════════════════════════════════════
// Bounded stack
// ═══════════════════════════════════════════════════════════════════════════

/// Fixed-capacity LIFO ring buffer; pushing onto a full stack evicts the
/// bottom element.
#[derive(Debug, Clone)]
pub struct BoundedStack<T> {
    slots: Vec<Option<T>>,
    head: usize,
    len: usize,
}

impl<T> BoundedStack<T> {
    pub fn new(capacity: NonZeroUsize) -> Self {
        let mut slots = Vec::with_capacity(capacity.get());
        slots.resize_with(capacity.get(), || None);
        Self {
            slots,
            head: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn slot(&self, offset: usize) -> usize {
        (self.head + offset) % self.slots.len()
    }

    /// Returns the evicted bottom element, if the stack was full.
    pub fn push(&mut self, item: T) -> Option<T> {
        if self.len == self.capacity() {
            let evicted = self.slots[self.head].replace(item);
            self.head = self.slot(1);
            evicted
        } else {
            let idx = self.slot(self.len);
            self.slots[idx] = Some(item);
            self.len += 1;
            None
        }
    }

    pub fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let idx = self.slot(self.len - 1);
        self.len -= 1;
        self.slots[idx].take()
    }

    pub fn peek(&self) -> Option<&T> {
        if self.len == 0 {
            return None;
        }
        self.slots[self.slot(self.len - 1)].as_ref()
    }

    pub fn peek_mut(&mut self) -> Option<&mut T> {
        if self.len == 0 {
            return None;
        }
        let idx = self.slot(self.len - 1);
        self.slots[idx].as_mut()
    }

    /// Bottom to top.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        (0..self.len).filter_map(move |i| self.slots[self.slot(i)].as_ref())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Records
// ═══════════════════════════════════════════════════════════════════════════

/// A candidate placement of `vnf`, reached from `prev_vnf` over `hop`.
#[derive(Debug, Clone, PartialEq)]
pub struct BacktrackRecord {
    pub prev_vnf: ReqIx,
    pub vnf: ReqIx,
    pub hop: HopIx,
    /// Host of `prev_vnf` when the candidate was generated
    pub previous_host: HostIx,
    pub target: HostIx,
    pub path: Vec<HostIx>,
    pub path_links: Vec<LinkIx>,
    pub bandwidth: f64,
    pub latency: f64,
    pub objective: f64,
}

impl BacktrackRecord {
    /// The SG-hop this placement arrives over, as committed alongside it.
    pub fn arrival(&self) -> LinkMappingRecord {
        LinkMappingRecord {
            from: self.prev_vnf,
            to: self.vnf,
            hop: self.hop,
            path: self.path.clone(),
            path_links: self.path_links.clone(),
            bandwidth: self.bandwidth,
            latency: self.latency,
        }
    }
}

/// A routed SG-hop: the arrival hop of a placed VNF, or a hop between two
/// already placed endpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkMappingRecord {
    pub from: ReqIx,
    pub to: ReqIx,
    pub hop: HopIx,
    pub path: Vec<HostIx>,
    pub path_links: Vec<LinkIx>,
    pub bandwidth: f64,
    pub latency: f64,
}

/// One entry of the undo stack. Undo order is `onward`, `link`, then the
/// VNF of `record`.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedUnit {
    pub level: usize,
    /// VNF placed in this step, if any
    pub record: Option<BacktrackRecord>,
    pub link: LinkMappingRecord,
    /// Hop routed out of the placed VNF, folded into the same unit
    pub onward: Option<LinkMappingRecord>,
}

impl MappedUnit {
    /// Links of the unit, newest first.
    pub fn links_newest_first(&self) -> impl Iterator<Item = &LinkMappingRecord> + '_ {
        self.onward.iter().chain(std::iter::once(&self.link))
    }
}

/// Untried candidates generated at one subchain level.
#[derive(Debug, Clone)]
pub struct CandidateLevel {
    pub level: usize,
    pub candidates: BoundedStack<BacktrackRecord>,
}

/// Next SG-hop to process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub level: usize,
    pub current: ReqIx,
    pub next: ReqIx,
    pub hop: HopIx,
}

/// Outcome of [`BacktrackEngine::next_alternative`]: the candidate to try
/// and the units that were popped to make room for it, most recent first.
#[derive(Debug, Clone)]
pub struct Alternative {
    pub level: usize,
    pub record: BacktrackRecord,
    pub rolled_back: Vec<MappedUnit>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Engine state
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineState {
    pub level: usize,
    /// Index of the last processed node within the current subchain path
    pub index: usize,
    /// Deepest number of subchain levels entered so far
    pub peak_sc_cnt: usize,
}

impl EngineState {
    pub fn is_ready_for_next_subchain(&self, subchains: &[Subchain]) -> bool {
        subchains
            .get(self.level)
            .map_or(true, |sc| self.index + 1 >= sc.path.len())
    }

    /// State after moving one SG-hop forward, with the hop to process.
    /// `None` once every subchain is done.
    pub fn advanced(self, subchains: &[Subchain]) -> Option<(EngineState, Step)> {
        let mut next = self;
        if next.is_ready_for_next_subchain(subchains) {
            next.level += 1;
            next.index = 0;
        }
        let sc = subchains.get(next.level)?;
        next.index += 1;
        next.peak_sc_cnt = next.peak_sc_cnt.max(next.level + 1);
        let step = Step {
            level: next.level,
            current: sc.path[next.index - 1],
            next: sc.path[next.index],
            hop: sc.hops[next.index - 1],
        };
        Some((next, step))
    }

    /// State after backtracking to `level`, positioned on `index`.
    pub fn stepped_back(self, level: usize, index: usize) -> Result<EngineState> {
        if level > self.level {
            return Err(EmbedError::internal(format!(
                "Backtracking cannot move forward from level {} to {}",
                self.level, level
            )));
        }
        Ok(EngineState {
            level,
            index,
            peak_sc_cnt: self.peak_sc_cnt,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct BacktrackEngine {
    subchains: Vec<Subchain>,
    branching_factor: NonZeroUsize,
    levels: BoundedStack<CandidateLevel>,
    mapped: Vec<MappedUnit>,
    state: EngineState,
}

impl BacktrackEngine {
    pub fn new(subchains: Vec<Subchain>, branching_factor: usize, bt_limit: usize) -> Result<Self> {
        let branching_factor = NonZeroUsize::new(branching_factor).ok_or_else(|| {
            EmbedError::bad_input("branching factor >= 1", branching_factor.to_string())
        })?;
        let bt_limit = NonZeroUsize::new(bt_limit)
            .ok_or_else(|| EmbedError::bad_input("backtrack limit >= 1", bt_limit.to_string()))?;
        Ok(Self {
            subchains,
            branching_factor,
            levels: BoundedStack::new(bt_limit),
            mapped: Vec::new(),
            state: EngineState::default(),
        })
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn subchains(&self) -> &[Subchain] {
        &self.subchains
    }

    pub fn subchain(&self, level: usize) -> &Subchain {
        &self.subchains[level]
    }

    pub fn candidate_levels(&self) -> &BoundedStack<CandidateLevel> {
        &self.levels
    }

    pub fn mapped_units(&self) -> &[MappedUnit] {
        &self.mapped
    }

    /// Next SG-hop: continues the current subchain, or enters the next
    /// subchain once the current one is complete.
    pub fn advance(&mut self) -> Option<Step> {
        let (state, step) = self.state.advanced(&self.subchains)?;
        self.state = state;
        Some(step)
    }

    /// Remember the untried candidates of the current level.
    pub fn push_candidates(&mut self, subchain_id: u32, candidates: Vec<BacktrackRecord>) -> Result<()> {
        let current = self.subchains.get(self.state.level).map(|sc| sc.id);
        if current != Some(subchain_id) {
            return Err(EmbedError::internal(format!(
                "Candidates for subchain {} pushed while on {:?}",
                subchain_id, current
            )));
        }
        let mut stack = BoundedStack::new(self.branching_factor);
        for record in candidates {
            stack.push(record);
        }
        debug!(
            "Level {} remembers {} alternatives",
            self.state.level,
            stack.len()
        );
        if let Some(dropped) = self.levels.push(CandidateLevel {
            level: self.state.level,
            candidates: stack,
        }) {
            debug!("Backtrack limit reached, forgetting level {}", dropped.level);
        }
        Ok(())
    }

    /// Record a committed step. `link` is the hop the step routed; with a
    /// `record` it must be that VNF's arrival hop. A link-only step is folded
    /// into the top unit of the same level when that unit placed a VNF and
    /// has no onward link yet.
    pub fn commit(&mut self, record: Option<BacktrackRecord>, link: LinkMappingRecord) -> Result<()> {
        let level = self.state.level;
        match record {
            Some(record) => {
                if link.to != record.vnf || link.hop != record.hop {
                    return Err(EmbedError::internal(format!(
                        "Link {:?} committed with a placement arriving over {:?}",
                        link.hop, record.hop
                    )));
                }
                self.mapped.push(MappedUnit {
                    level,
                    record: Some(record),
                    link,
                    onward: None,
                });
            }
            None => match self.mapped.last_mut() {
                Some(top) if top.level == level && top.record.is_some() && top.onward.is_none() => {
                    top.onward = Some(link)
                }
                _ => self.mapped.push(MappedUnit {
                    level,
                    record: None,
                    link,
                    onward: None,
                }),
            },
        }
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<MappedUnit> {
        self.mapped
            .pop()
            .ok_or_else(|| EmbedError::internal("Nothing left to roll back"))
    }

    /// Pop the best untried candidate and every committed unit that must be
    /// undone before it can be applied. Empty levels are discarded; running
    /// out of levels is a terminal mapping failure.
    pub fn next_alternative(&mut self) -> Result<Alternative> {
        let (level, record) = loop {
            let Some(top) = self.levels.peek_mut() else {
                return Err(EmbedError::Mapping {
                    message: "Backtrack possibilities exhausted".to_string(),
                    backtrack_possible: false,
                    peak_vnf_cnt: None,
                    peak_sc_cnt: Some(self.state.peak_sc_cnt),
                });
            };
            let level = top.level;
            match top.candidates.pop() {
                None => {
                    let _ = self.levels.pop();
                }
                Some(_) if level > self.state.level => {
                    return Err(EmbedError::internal(format!(
                        "Candidate level {} is ahead of current level {}",
                        level, self.state.level
                    )));
                }
                Some(record) => break (level, record),
            }
        };

        let mut rolled_back = Vec::new();
        let mut previous_level = self.state.level;
        loop {
            let unit = self.rollback()?;
            if unit.level > previous_level || previous_level - unit.level > 1 || unit.level < level {
                return Err(EmbedError::internal(format!(
                    "Undo stack level {} inconsistent with {} while returning to {}",
                    unit.level, previous_level, level
                )));
            }
            previous_level = unit.level;
            let replaced = unit
                .record
                .as_ref()
                .map_or(false, |r| r.vnf == record.vnf && r.hop == record.hop);
            rolled_back.push(unit);
            if replaced {
                break;
            }
        }

        let sc = &self.subchains[level];
        let index = (1..sc.path.len())
            .find(|&i| sc.path[i] == record.vnf && sc.hops[i - 1] == record.hop)
            .ok_or_else(|| {
                EmbedError::internal(format!("Candidate VNF not on subchain {}", sc.id))
            })?;
        self.state = self.state.stepped_back(level, index)?;
        debug!(
            "Backtracked to level {} index {}, {} units undone",
            level,
            index,
            rolled_back.len()
        );
        Ok(Alternative {
            level,
            record,
            rolled_back,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use petgraph::graph::{EdgeIndex, NodeIndex};
    use std::collections::HashSet;

    fn nz(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    fn subchain(id: u32, nodes: &[usize], hops: &[usize]) -> Subchain {
        Subchain {
            id,
            parents: vec![1],
            path: nodes.iter().map(|&n| NodeIndex::new(n)).collect(),
            hops: hops.iter().map(|&h| EdgeIndex::new(h)).collect(),
            subgraph: HashSet::new(),
        }
    }

    fn record(prev: usize, vnf: usize, hop: usize, target: usize) -> BacktrackRecord {
        BacktrackRecord {
            prev_vnf: NodeIndex::new(prev),
            vnf: NodeIndex::new(vnf),
            hop: EdgeIndex::new(hop),
            previous_host: NodeIndex::new(0),
            target: NodeIndex::new(target),
            path: vec![NodeIndex::new(0), NodeIndex::new(target)],
            path_links: vec![EdgeIndex::new(0)],
            bandwidth: 1.0,
            latency: 1.0,
            objective: 0.0,
        }
    }

    fn link(from: usize, to: usize, hop: usize) -> LinkMappingRecord {
        LinkMappingRecord {
            from: NodeIndex::new(from),
            to: NodeIndex::new(to),
            hop: EdgeIndex::new(hop),
            path: vec![NodeIndex::new(1)],
            path_links: Vec::new(),
            bandwidth: 1.0,
            latency: 0.0,
        }
    }

    #[test]
    fn test_bounded_stack_evicts_bottom() {
        let mut stack = BoundedStack::new(nz(3));
        assert_eq!(stack.push(1), None);
        assert_eq!(stack.push(2), None);
        assert_eq!(stack.push(3), None);
        assert_eq!(stack.push(4), Some(1));
        assert_eq!(stack.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(stack.peek(), Some(&4));
        assert_eq!(stack.pop(), Some(4));
        assert_eq!(stack.push(5), None);
        assert_eq!(stack.push(6), Some(2));
        assert_eq!(stack.pop(), Some(6));
        assert_eq!(stack.pop(), Some(5));
        assert_eq!(stack.pop(), Some(3));
        assert_eq!(stack.pop(), None);
        assert!(stack.is_empty());
    }

    #[test]
    fn test_rejects_zero_parameters() {
        assert!(matches!(
            BacktrackEngine::new(Vec::new(), 0, 6),
            Err(EmbedError::BadInput { .. })
        ));
        assert!(matches!(
            BacktrackEngine::new(Vec::new(), 3, 0),
            Err(EmbedError::BadInput { .. })
        ));
    }

    #[test]
    fn test_advance_walks_subchains_in_order() {
        let subchains = vec![subchain(3, &[0, 1, 2], &[0, 1]), subchain(4, &[1, 3], &[2])];
        let mut engine = BacktrackEngine::new(subchains, 3, 6).unwrap();

        let steps: Vec<Step> = std::iter::from_fn(|| engine.advance()).collect();
        let hops: Vec<(usize, usize)> = steps.iter().map(|s| (s.level, s.hop.index())).collect();
        assert_eq!(hops, vec![(0, 0), (0, 1), (1, 2)]);
        assert_eq!(steps[2].current, NodeIndex::new(1));
        assert_eq!(engine.state().peak_sc_cnt, 2);
    }

    #[test]
    fn test_state_transitions_are_pure() {
        let subchains = vec![subchain(3, &[0, 1, 2], &[0, 1])];
        let start = EngineState {
            level: 0,
            index: 1,
            peak_sc_cnt: 1,
        };
        let (next, step) = start.advanced(&subchains).unwrap();
        assert_eq!(next.index, 2);
        assert_eq!(step.hop, EdgeIndex::new(1));
        assert!(next.advanced(&subchains).is_none());
        assert!(next.stepped_back(1, 1).is_err());
        assert_eq!(next.stepped_back(0, 1).unwrap(), start);
    }

    #[test]
    fn test_push_candidates_checks_level() {
        let mut engine = BacktrackEngine::new(vec![subchain(3, &[0, 1, 2], &[0, 1])], 2, 6).unwrap();
        engine.advance();
        assert!(engine.push_candidates(4, Vec::new()).is_err());
        engine
            .push_candidates(3, vec![record(0, 1, 0, 5), record(0, 1, 0, 6), record(0, 1, 0, 7)])
            .unwrap();
        let top = engine.candidate_levels().peek().unwrap();
        assert_eq!(top.candidates.len(), 2);
        assert_eq!(top.candidates.peek().unwrap().target, NodeIndex::new(7));
    }

    fn place(engine: &mut BacktrackEngine, record: BacktrackRecord) {
        let arrival = record.arrival();
        engine.commit(Some(record), arrival).unwrap();
    }

    #[test]
    fn test_link_commit_merges_into_open_unit() {
        let mut engine = BacktrackEngine::new(vec![subchain(3, &[0, 1, 2], &[0, 1])], 3, 6).unwrap();
        engine.advance();
        place(&mut engine, record(0, 1, 0, 5));
        engine.advance();
        engine.commit(None, link(1, 2, 1)).unwrap();
        assert_eq!(engine.mapped_units().len(), 1);
        let unit = &engine.mapped_units()[0];
        assert_eq!(unit.link.hop, EdgeIndex::new(0));
        assert_eq!(unit.onward, Some(link(1, 2, 1)));
        let hops: Vec<usize> = unit.links_newest_first().map(|l| l.hop.index()).collect();
        assert_eq!(hops, vec![1, 0]);

        engine.commit(None, link(1, 2, 1)).unwrap();
        assert_eq!(engine.mapped_units().len(), 2);
        assert!(engine.mapped_units()[1].record.is_none());
    }

    #[test]
    fn test_commit_requires_matching_arrival_hop() {
        let mut engine = BacktrackEngine::new(vec![subchain(3, &[0, 1, 2], &[0, 1])], 3, 6).unwrap();
        engine.advance();
        let err = engine.commit(Some(record(0, 1, 0, 5)), link(1, 2, 1)).unwrap_err();
        assert!(matches!(err, EmbedError::InternalAlgorithm(_)));
        assert!(engine.mapped_units().is_empty());
    }

    #[test]
    fn test_next_alternative_undoes_down_to_replaced_vnf() {
        let subchains = vec![subchain(3, &[0, 1, 2, 4], &[0, 1, 2])];
        let mut engine = BacktrackEngine::new(subchains, 3, 6).unwrap();

        engine.advance();
        engine.push_candidates(3, vec![record(0, 1, 0, 6)]).unwrap();
        place(&mut engine, record(0, 1, 0, 5));
        engine.advance();
        engine.push_candidates(3, Vec::new()).unwrap();
        place(&mut engine, record(1, 2, 1, 5));
        engine.advance();

        let alt = engine.next_alternative().unwrap();
        assert_eq!(alt.level, 0);
        assert_eq!(alt.record.target, NodeIndex::new(6));
        assert_eq!(alt.rolled_back.len(), 2);
        assert_eq!(alt.rolled_back[0].record.as_ref().unwrap().vnf, NodeIndex::new(2));
        assert_eq!(engine.state().index, 1);
        assert!(engine.mapped_units().is_empty());

        let (_, step) = engine.state().advanced(engine.subchains()).unwrap();
        assert_eq!(step.hop, EdgeIndex::new(1));
    }

    #[test]
    fn test_exhaustion_is_terminal() {
        let mut engine = BacktrackEngine::new(vec![subchain(3, &[0, 1, 2], &[0, 1])], 3, 6).unwrap();
        engine.advance();
        engine.push_candidates(3, Vec::new()).unwrap();
        match engine.next_alternative() {
            Err(EmbedError::Mapping {
                backtrack_possible,
                peak_sc_cnt,
                ..
            }) => {
                assert!(!backtrack_possible);
                assert_eq!(peak_sc_cnt, Some(1));
            }
            other => panic!("expected mapping failure, got {:?}", other),
        }
    }

    #[test]
    fn test_bt_limit_forgets_oldest_level() {
        let subchains = vec![subchain(3, &[0, 1, 2, 4], &[0, 1, 2])];
        let mut engine = BacktrackEngine::new(subchains, 3, 1).unwrap();
        engine.advance();
        engine.push_candidates(3, vec![record(0, 1, 0, 6)]).unwrap();
        place(&mut engine, record(0, 1, 0, 5));
        engine.advance();
        engine.push_candidates(3, Vec::new()).unwrap();
        assert_eq!(engine.candidate_levels().len(), 1);
        assert!(engine.next_alternative().unwrap_err().is_mapping_failure());
    }
}
