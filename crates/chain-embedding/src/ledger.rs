//! Resource ledger
//!
//! Owns the substrate graph and is the only writer of available resources.
//! Every granted subtraction is journaled; `restore` must undo them in
//! exact reverse order and writes back the journaled value, so a
//! subtract/restore sequence returns the ledger to its prior state bit for
//! bit. Routing weights are refreshed on every change.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::{HostIx, LinkIx, Resources, SubstrateGraph};
use crate::{EmbedError, Result};

/// Outcome of a capacity check; infeasibility is a value, not an error.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Allocation<T> {
    Granted(T),
    Infeasible,
}

impl<T> Allocation<T> {
    pub fn is_granted(&self) -> bool {
        matches!(self, Allocation::Granted(_))
    }

    pub fn granted(self) -> Option<T> {
        match self {
            Allocation::Granted(v) => Some(v),
            Allocation::Infeasible => None,
        }
    }
}

/// A node or a link of the substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Element {
    Node(HostIx),
    Link(LinkIx),
}

#[derive(Debug, Clone, Copy)]
struct JournalEntry {
    element: Element,
    demand: Resources,
    multiplicity: u32,
    previous: Resources,
}

/// Available resources of every element, comparable across time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub nodes: Vec<Resources>,
    pub links: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct ResourceLedger {
    substrate: SubstrateGraph,
    journal: Vec<JournalEntry>,
}

/// Subtract `demand` from `available`; bandwidth counts `multiplicity` times.
/// Delay is not a resource and never consumed.
pub fn subtract(available: &Resources, demand: &Resources, multiplicity: u32) -> Allocation<Resources> {
    let bandwidth = demand.bandwidth * f64::from(multiplicity);
    if available.cpu < demand.cpu
        || available.mem < demand.mem
        || available.storage < demand.storage
        || available.bandwidth < bandwidth
    {
        return Allocation::Infeasible;
    }
    Allocation::Granted(Resources {
        cpu: available.cpu - demand.cpu,
        mem: available.mem - demand.mem,
        storage: available.storage - demand.storage,
        bandwidth: available.bandwidth - bandwidth,
    })
}

impl ResourceLedger {
    pub fn new(mut substrate: SubstrateGraph) -> Self {
        let nodes: Vec<HostIx> = substrate.node_indices().collect();
        for n in nodes {
            substrate.node_mut(n).refresh_weight();
        }
        let links: Vec<LinkIx> = substrate.link_indices().collect();
        for l in links {
            substrate.link_mut(l).refresh_weight();
        }
        Self {
            substrate,
            journal: Vec::new(),
        }
    }

    pub fn substrate(&self) -> &SubstrateGraph {
        &self.substrate
    }

    pub fn into_substrate(self) -> SubstrateGraph {
        self.substrate
    }

    /// Number of granted subtractions not yet restored.
    pub fn depth(&self) -> usize {
        self.journal.len()
    }

    pub fn available(&self, element: Element) -> Resources {
        match element {
            Element::Node(n) => self.substrate.node(n).available,
            Element::Link(l) => {
                Resources::bandwidth_only(self.substrate.link(l).available_bandwidth)
            }
        }
    }

    fn write(&mut self, element: Element, value: Resources) {
        match element {
            Element::Node(n) => {
                let node = self.substrate.node_mut(n);
                node.available = value;
                node.refresh_weight();
            }
            Element::Link(l) => {
                let link = self.substrate.link_mut(l);
                link.available_bandwidth = value.bandwidth;
                link.refresh_weight();
            }
        }
    }

    /// Links only carry bandwidth; other demand components are ignored there.
    fn effective_demand(element: Element, demand: &Resources) -> Resources {
        match element {
            Element::Node(_) => *demand,
            Element::Link(_) => Resources::bandwidth_only(demand.bandwidth),
        }
    }

    pub fn fits(&self, element: Element, demand: &Resources, multiplicity: u32) -> bool {
        let demand = Self::effective_demand(element, demand);
        subtract(&self.available(element), &demand, multiplicity).is_granted()
    }

    pub fn subtract(
        &mut self,
        element: Element,
        demand: &Resources,
        multiplicity: u32,
    ) -> Allocation<Resources> {
        let demand = Self::effective_demand(element, demand);
        let previous = self.available(element);
        match subtract(&previous, &demand, multiplicity) {
            Allocation::Granted(updated) => {
                self.write(element, updated);
                self.journal.push(JournalEntry {
                    element,
                    demand,
                    multiplicity,
                    previous,
                });
                Allocation::Granted(updated)
            }
            Allocation::Infeasible => Allocation::Infeasible,
        }
    }

    /// Exact inverse of the most recent granted `subtract`.
    pub fn restore(
        &mut self,
        element: Element,
        demand: &Resources,
        multiplicity: u32,
    ) -> Result<Resources> {
        let demand = Self::effective_demand(element, demand);
        let entry = self
            .journal
            .last()
            .copied()
            .ok_or_else(|| EmbedError::internal("Restore without a matching subtraction"))?;
        if entry.element != element || entry.demand != demand || entry.multiplicity != multiplicity {
            return Err(EmbedError::internal(format!(
                "Restore out of order: expected {:?} x{} on {:?}, got {:?} x{} on {:?}",
                entry.demand, entry.multiplicity, entry.element, demand, multiplicity, element
            )));
        }
        self.journal.pop();

        let capacity = match element {
            Element::Node(n) => self.substrate.node(n).capacity,
            Element::Link(l) => Resources::bandwidth_only(self.substrate.link(l).bandwidth),
        };
        let p = entry.previous;
        if p.cpu > capacity.cpu
            || p.mem > capacity.mem
            || p.storage > capacity.storage
            || p.bandwidth > capacity.bandwidth
        {
            return Err(EmbedError::internal(format!(
                "Restored resources of {:?} exceed capacity",
                element
            )));
        }
        self.write(element, p);
        Ok(p)
    }

    /// Elements a path reservation touches, with how often each is crossed.
    /// SAPs carry no bandwidth budget.
    fn path_elements(&self, path: &[HostIx], links: &[LinkIx]) -> Vec<(Element, u32)> {
        let mut elements: Vec<(Element, u32)> = Vec::new();
        let touched = path
            .iter()
            .filter(|&&n| !self.substrate.node(n).is_sap())
            .map(|&n| Element::Node(n))
            .chain(links.iter().map(|&l| Element::Link(l)));
        for element in touched {
            match elements.iter_mut().find(|(e, _)| *e == element) {
                Some((_, count)) => *count += 1,
                None => elements.push((element, 1)),
            }
        }
        elements
    }

    /// Would placing `demand` on `host` and then routing `bandwidth` along
    /// the path both succeed? Mirrors the arithmetic of the real commit.
    pub fn fits_placement(
        &self,
        host: HostIx,
        demand: &Resources,
        path: &[HostIx],
        links: &[LinkIx],
        bandwidth: f64,
    ) -> bool {
        let after_vnf = match subtract(&self.available(Element::Node(host)), demand, 1) {
            Allocation::Granted(r) => r,
            Allocation::Infeasible => return false,
        };
        let unit = Resources::bandwidth_only(bandwidth);
        self.path_elements(path, links)
            .into_iter()
            .all(|(element, count)| {
                let available = if element == Element::Node(host) {
                    after_vnf
                } else {
                    self.available(element)
                };
                subtract(&available, &unit, count).is_granted()
            })
    }

    /// Reserve `bandwidth` on every link and non-SAP node of a path.
    /// All-or-nothing.
    pub fn reserve_path(
        &mut self,
        path: &[HostIx],
        links: &[LinkIx],
        bandwidth: f64,
    ) -> Allocation<()> {
        let unit = Resources::bandwidth_only(bandwidth);
        let elements = self.path_elements(path, links);
        if !elements
            .iter()
            .all(|&(element, count)| self.fits(element, &unit, count))
        {
            debug!("Path reservation of {} rejected", bandwidth);
            return Allocation::Infeasible;
        }
        for (element, count) in elements {
            // checked above
            let _ = self.subtract(element, &unit, count);
        }
        Allocation::Granted(())
    }

    pub fn release_path(&mut self, path: &[HostIx], links: &[LinkIx], bandwidth: f64) -> Result<()> {
        let unit = Resources::bandwidth_only(bandwidth);
        for (element, count) in self.path_elements(path, links).into_iter().rev() {
            self.restore(element, &unit, count)?;
        }
        Ok(())
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            nodes: self
                .substrate
                .node_indices()
                .map(|n| self.substrate.node(n).available)
                .collect(),
            links: self
                .substrate
                .link_indices()
                .map(|l| self.substrate.link(l).available_bandwidth)
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SubstrateLink, SubstrateNode};

    fn create_ledger() -> ResourceLedger {
        let mut g = SubstrateGraph::new();
        g.add_node(SubstrateNode::sap("A", "sap1")).unwrap();
        g.add_node(SubstrateNode::infra("B", Resources::new(4.0, 8.0, 16.0, 300.0), 2.0))
            .unwrap();
        g.add_node(SubstrateNode::sap("C", "sap2")).unwrap();
        g.add_bidirectional_link("A", "B", SubstrateLink::new("l1", 100.0, 1.0))
            .unwrap();
        g.add_bidirectional_link("B", "C", SubstrateLink::new("l2", 100.0, 1.0))
            .unwrap();
        ResourceLedger::new(g)
    }

    #[test]
    fn test_subtract_multiplies_bandwidth() {
        let available = Resources::new(4.0, 8.0, 16.0, 100.0);
        let demand = Resources::new(1.0, 1.0, 1.0, 30.0);
        assert_eq!(
            subtract(&available, &demand, 3),
            Allocation::Granted(Resources::new(3.0, 7.0, 15.0, 10.0))
        );
        assert_eq!(subtract(&available, &demand, 4), Allocation::Infeasible);
    }

    #[test]
    fn test_infeasible_leaves_state_untouched() {
        let mut ledger = create_ledger();
        let b = Element::Node(ledger.substrate().index_of("B").unwrap());
        let before = ledger.snapshot();
        let result = ledger.subtract(b, &Resources::new(5.0, 0.0, 0.0, 0.0), 1);
        assert_eq!(result, Allocation::Infeasible);
        assert_eq!(ledger.snapshot(), before);
        assert_eq!(ledger.depth(), 0);
    }

    #[test]
    fn test_restore_is_exact_and_ordered() {
        let mut ledger = create_ledger();
        let b = Element::Node(ledger.substrate().index_of("B").unwrap());
        let l1 = Element::Link(ledger.substrate().link_index_of("l1").unwrap());
        let before = ledger.snapshot();

        let d1 = Resources::new(0.1, 0.2, 0.3, 0.7);
        let d2 = Resources::bandwidth_only(33.3);
        assert!(ledger.subtract(b, &d1, 1).is_granted());
        assert!(ledger.subtract(l1, &d2, 2).is_granted());

        let err = ledger.restore(b, &d1, 1).unwrap_err();
        assert!(matches!(err, EmbedError::InternalAlgorithm(_)));

        ledger.restore(l1, &d2, 2).unwrap();
        ledger.restore(b, &d1, 1).unwrap();
        assert_eq!(ledger.snapshot(), before);
        assert!(ledger.restore(b, &d1, 1).is_err());
    }

    #[test]
    fn test_path_reservation_skips_saps() {
        let mut ledger = create_ledger();
        let g = ledger.substrate();
        let (a, b, c) = (
            g.index_of("A").unwrap(),
            g.index_of("B").unwrap(),
            g.index_of("C").unwrap(),
        );
        let (l1, l2) = (g.link_index_of("l1").unwrap(), g.link_index_of("l2").unwrap());

        assert!(ledger.reserve_path(&[a, b, c], &[l1, l2], 50.0).is_granted());
        assert_eq!(ledger.available(Element::Node(b)).bandwidth, 250.0);
        assert_eq!(ledger.available(Element::Link(l1)).bandwidth, 50.0);
        assert_eq!(ledger.substrate().link(l2).weight, 1.0 / 50.0);
        assert_eq!(ledger.depth(), 3);

        assert_eq!(ledger.reserve_path(&[a, b, c], &[l1, l2], 60.0), Allocation::Infeasible);
        assert_eq!(ledger.depth(), 3);

        ledger.release_path(&[a, b, c], &[l1, l2], 50.0).unwrap();
        assert_eq!(ledger.available(Element::Link(l1)).bandwidth, 100.0);
        assert_eq!(ledger.depth(), 0);
    }

    #[test]
    fn test_fits_placement_combines_vnf_and_path() {
        let ledger = create_ledger();
        let g = ledger.substrate();
        let (a, b) = (g.index_of("A").unwrap(), g.index_of("B").unwrap());
        let l1 = g.link_index_of("l1").unwrap();

        let demand = Resources::new(1.0, 1.0, 1.0, 250.0);
        assert!(ledger.fits_placement(b, &demand, &[a, b], &[l1], 50.0));
        assert!(!ledger.fits_placement(b, &demand, &[a, b], &[l1], 60.0));
        assert!(!ledger.fits_placement(b, &demand, &[a, b], &[l1], 150.0));
    }
}
