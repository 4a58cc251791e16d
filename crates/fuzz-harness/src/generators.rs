//! Generators for substrates, requests and ledger operation sequences
//!
//! Every quantity is drawn as a small integer and widened to f64 so that
//! resource arithmetic stays exact and failures replay bit for bit.

use chain_embedding::model::{
    Chain, RequestGraph, RequestNode, Resources, SgHop, SubstrateGraph, SubstrateLink, SubstrateNode,
};
use chain_embedding::MappingConfig;
use proptest::prelude::*;
use proptest::sample::Index;
use serde_json::{json, Value};

fn resources_json(r: &Resources) -> Value {
    json!({ "cpu": r.cpu, "mem": r.mem, "storage": r.storage, "bandwidth": r.bandwidth })
}

// ============================================================================
// Substrate
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct InfraSpec {
    pub capacity: Resources,
    pub delay: f64,
}

/// Bidirectional link between two infra nodes, by position
#[derive(Debug, Clone, PartialEq)]
pub struct LinkSpec {
    pub from: usize,
    pub to: usize,
    pub bandwidth: f64,
    pub delay: f64,
}

/// SAP attachment to an infra node, by position
#[derive(Debug, Clone, PartialEq)]
pub struct SapLink {
    pub at: usize,
    pub bandwidth: f64,
    pub delay: f64,
}

/// Connected substrate: infra nodes on a random spanning tree plus extra
/// links, with two SAPs (`sap1`, `sap2`) hanging off infra nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct SubstrateSpec {
    pub infra: Vec<InfraSpec>,
    pub links: Vec<LinkSpec>,
    pub sap_links: [SapLink; 2],
}

impl SubstrateSpec {
    pub fn infra_id(i: usize) -> String {
        format!("n{}", i)
    }

    pub fn build(&self) -> chain_embedding::Result<SubstrateGraph> {
        let mut g = SubstrateGraph::new();
        for (i, node) in self.infra.iter().enumerate() {
            g.add_node(SubstrateNode::infra(Self::infra_id(i), node.capacity, node.delay))?;
        }
        for (k, link) in self.links.iter().enumerate() {
            g.add_bidirectional_link(
                &Self::infra_id(link.from),
                &Self::infra_id(link.to),
                SubstrateLink::new(format!("l{}", k), link.bandwidth, link.delay),
            )?;
        }
        for (k, link) in self.sap_links.iter().enumerate() {
            let sap = format!("S{}", k + 1);
            g.add_node(SubstrateNode::sap(sap.clone(), format!("sap{}", k + 1)))?;
            g.add_bidirectional_link(
                &sap,
                &Self::infra_id(link.at),
                SubstrateLink::new(format!("sl{}", k + 1), link.bandwidth, link.delay),
            )?;
        }
        Ok(g)
    }

    /// The `substrate` section of a scenario file, in [`SubstrateSpec::build`] order
    pub fn to_scenario_json(&self) -> Value {
        let mut nodes: Vec<Value> = self
            .infra
            .iter()
            .enumerate()
            .map(|(i, node)| {
                json!({
                    "id": Self::infra_id(i),
                    "type": "INFRA",
                    "delay": node.delay,
                    "resources": resources_json(&node.capacity),
                })
            })
            .collect();
        let mut links: Vec<Value> = self
            .links
            .iter()
            .enumerate()
            .map(|(k, link)| {
                json!({
                    "id": format!("l{}", k),
                    "src": Self::infra_id(link.from),
                    "dst": Self::infra_id(link.to),
                    "bandwidth": link.bandwidth,
                    "delay": link.delay,
                    "bidirectional": true,
                })
            })
            .collect();
        for (k, link) in self.sap_links.iter().enumerate() {
            let sap = format!("S{}", k + 1);
            nodes.push(json!({ "id": sap, "type": "SAP", "name": format!("sap{}", k + 1) }));
            links.push(json!({
                "id": format!("sl{}", k + 1),
                "src": sap,
                "dst": Self::infra_id(link.at),
                "bandwidth": link.bandwidth,
                "delay": link.delay,
                "bidirectional": true,
            }));
        }
        json!({ "nodes": nodes, "links": links })
    }
}

/// Infra node capacities and forwarding delay
pub fn infra_spec() -> impl Strategy<Value = InfraSpec> {
    (1u32..=8, 1u32..=16, 1u32..=16, 50u32..=400, 0u32..=3).prop_map(
        |(cpu, mem, storage, bandwidth, delay)| InfraSpec {
            capacity: Resources::new(cpu as f64, mem as f64, storage as f64, bandwidth as f64),
            delay: delay as f64,
        },
    )
}

/// Link bandwidth and delay
pub fn link_props() -> impl Strategy<Value = (f64, f64)> {
    (10u32..=200, 1u32..=5).prop_map(|(bandwidth, delay)| (bandwidth as f64, delay as f64))
}

pub fn substrate_spec() -> impl Strategy<Value = SubstrateSpec> {
    (2usize..=6)
        .prop_flat_map(|n| {
            (
                prop::collection::vec(infra_spec(), n),
                prop::collection::vec((any::<Index>(), link_props()), n - 1),
                prop::collection::vec((any::<Index>(), any::<Index>(), link_props()), 0..=n),
                (any::<Index>(), link_props(), any::<Index>(), link_props()),
            )
        })
        .prop_map(|(infra, tree, extra, (a, a_props, b, b_props))| {
            let n = infra.len();
            let mut links = Vec::new();
            for (i, (parent, (bandwidth, delay))) in tree.into_iter().enumerate() {
                links.push(LinkSpec {
                    from: parent.index(i + 1),
                    to: i + 1,
                    bandwidth,
                    delay,
                });
            }
            for (from, to, (bandwidth, delay)) in extra {
                let (from, to) = (from.index(n), to.index(n));
                if from != to {
                    links.push(LinkSpec {
                        from,
                        to,
                        bandwidth,
                        delay,
                    });
                }
            }
            let sap_link = |at: Index, (bandwidth, delay): (f64, f64)| SapLink {
                at: at.index(n),
                bandwidth,
                delay,
            };
            SubstrateSpec {
                infra,
                links,
                sap_links: [sap_link(a, a_props), sap_link(b, b_props)],
            }
        })
}

// ============================================================================
// Request
// ============================================================================

/// Second chain leaving the first after VNF `after` through its own VNF
#[derive(Debug, Clone, PartialEq)]
pub struct BranchSpec {
    pub after: usize,
    pub vnf: Resources,
    pub delay: f64,
    pub bandwidth: f64,
}

/// `sap1 -> v1 -> ... -> vk -> sap2`, optionally with a branch to `sap2`
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSpec {
    pub vnfs: Vec<Resources>,
    pub delay: f64,
    pub bandwidth: f64,
    pub branch: Option<BranchSpec>,
}

impl RequestSpec {
    pub fn vnf_id(i: usize) -> String {
        format!("v{}", i + 1)
    }

    /// Chain id with its SG-hop ids, in chain order
    pub fn chain_hops(&self) -> Vec<(u32, Vec<String>)> {
        let k = self.vnfs.len();
        let mut chains = vec![(1, (1..=k + 1).map(|i| format!("h{}", i)).collect())];
        if let Some(branch) = &self.branch {
            let mut hops: Vec<String> = (1..=branch.after + 1).map(|i| format!("h{}", i)).collect();
            hops.push("b1".to_string());
            hops.push("b2".to_string());
            chains.push((2, hops));
        }
        chains
    }

    pub fn build(&self) -> chain_embedding::Result<RequestGraph> {
        let mut r = RequestGraph::new();
        r.add_node(RequestNode::sap("s1", "sap1"))?;
        r.add_node(RequestNode::sap("s2", "sap2"))?;
        for (i, demand) in self.vnfs.iter().enumerate() {
            r.add_node(RequestNode::vnf(Self::vnf_id(i), "generic", *demand))?;
        }

        let mut nodes = vec!["s1".to_string()];
        nodes.extend((0..self.vnfs.len()).map(Self::vnf_id));
        nodes.push("s2".to_string());
        let mut hops = Vec::new();
        for (i, pair) in nodes.windows(2).enumerate() {
            let id = format!("h{}", i + 1);
            r.add_hop(&pair[0], &pair[1], SgHop::new(id.clone()))?;
            hops.push(id);
        }
        r.add_chain(Chain::new(1, nodes.clone(), hops.clone(), self.delay).with_bandwidth(self.bandwidth))?;

        if let Some(branch) = &self.branch {
            let fork = Self::vnf_id(branch.after);
            r.add_node(RequestNode::vnf("w", "generic", branch.vnf))?;
            r.add_hop(&fork, "w", SgHop::new("b1"))?;
            r.add_hop("w", "s2", SgHop::new("b2"))?;
            let mut branch_nodes: Vec<String> = nodes[..branch.after + 2].to_vec();
            branch_nodes.push("w".to_string());
            branch_nodes.push("s2".to_string());
            let mut branch_hops: Vec<String> = hops[..branch.after + 1].to_vec();
            branch_hops.push("b1".to_string());
            branch_hops.push("b2".to_string());
            r.add_chain(Chain::new(2, branch_nodes, branch_hops, branch.delay).with_bandwidth(branch.bandwidth))?;
        }
        Ok(r)
    }

    /// The `request` section of a scenario file, in [`RequestSpec::build`] order
    pub fn to_scenario_json(&self) -> Value {
        let vnf = |id: String, demand: &Resources| {
            json!({ "id": id, "type": "VNF", "functional_type": "generic", "demand": resources_json(demand) })
        };
        let hop = |id: &str, src: &str, dst: &str| json!({ "id": id, "src": src, "dst": dst });

        let mut nodes = vec![
            json!({ "id": "s1", "type": "SAP", "name": "sap1" }),
            json!({ "id": "s2", "type": "SAP", "name": "sap2" }),
        ];
        nodes.extend(self.vnfs.iter().enumerate().map(|(i, d)| vnf(Self::vnf_id(i), d)));

        let mut path = vec!["s1".to_string()];
        path.extend((0..self.vnfs.len()).map(Self::vnf_id));
        path.push("s2".to_string());
        let mut hops: Vec<Value> = path
            .windows(2)
            .enumerate()
            .map(|(i, pair)| hop(&format!("h{}", i + 1), &pair[0], &pair[1]))
            .collect();
        let chain_hops = self.chain_hops();
        let mut chains = vec![json!({
            "id": 1,
            "nodes": path,
            "hops": chain_hops[0].1,
            "delay": self.delay,
            "bandwidth": self.bandwidth,
        })];

        if let Some(branch) = &self.branch {
            nodes.push(vnf("w".to_string(), &branch.vnf));
            let fork = Self::vnf_id(branch.after);
            hops.push(hop("b1", &fork, "w"));
            hops.push(hop("b2", "w", "s2"));
            let mut branch_nodes = path[..branch.after + 2].to_vec();
            branch_nodes.push("w".to_string());
            branch_nodes.push("s2".to_string());
            chains.push(json!({
                "id": 2,
                "nodes": branch_nodes,
                "hops": chain_hops[1].1,
                "delay": branch.delay,
                "bandwidth": branch.bandwidth,
            }));
        }
        json!({ "nodes": nodes, "hops": hops, "chains": chains })
    }
}

/// VNF demand, switching bandwidth included
pub fn vnf_demand() -> impl Strategy<Value = Resources> {
    (0u32..=3, 0u32..=4, 0u32..=4, 0u32..=5).prop_map(|(cpu, mem, storage, bandwidth)| {
        Resources::new(cpu as f64, mem as f64, storage as f64, bandwidth as f64)
    })
}

pub fn request_spec() -> impl Strategy<Value = RequestSpec> {
    (1usize..=4)
        .prop_flat_map(|k| {
            (
                prop::collection::vec(vnf_demand(), k),
                5u32..=60,
                0u32..=60,
                prop::option::of((any::<Index>(), vnf_demand(), 5u32..=60, 0u32..=60)),
            )
        })
        .prop_map(|(vnfs, delay, bandwidth, branch)| {
            let k = vnfs.len();
            RequestSpec {
                vnfs,
                delay: delay as f64,
                bandwidth: bandwidth as f64,
                branch: branch.map(|(after, vnf, delay, bandwidth)| BranchSpec {
                    after: after.index(k),
                    vnf,
                    delay: delay as f64,
                    bandwidth: bandwidth as f64,
                }),
            }
        })
}

// ============================================================================
// Composite
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingCase {
    pub substrate: SubstrateSpec,
    pub request: RequestSpec,
    pub bt_limit: usize,
    pub branching_factor: usize,
}

impl EmbeddingCase {
    pub fn config(&self) -> MappingConfig {
        MappingConfig::new()
            .bt_limit(self.bt_limit)
            .branching_factor(self.branching_factor)
    }

    /// The whole case as a file `embed-chains --scenario` accepts
    pub fn to_scenario_json(&self) -> Value {
        json!({
            "substrate": self.substrate.to_scenario_json(),
            "request": self.request.to_scenario_json(),
            "config": { "bt_limit": self.bt_limit, "branching_factor": self.branching_factor },
        })
    }
}

pub fn embedding_case() -> impl Strategy<Value = EmbeddingCase> {
    (substrate_spec(), request_spec(), 1usize..=4, 1usize..=3).prop_map(
        |(substrate, request, bt_limit, branching_factor)| EmbeddingCase {
            substrate,
            request,
            bt_limit,
            branching_factor,
        },
    )
}

#[derive(Debug, Clone)]
pub enum LedgerOp {
    /// Subtract from the element picked by `element` among nodes then links
    Take {
        element: Index,
        demand: Resources,
        multiplicity: u32,
    },
    /// Restore the most recent granted subtraction
    Give,
}

#[derive(Debug, Clone)]
pub struct LedgerCase {
    pub substrate: SubstrateSpec,
    pub ops: Vec<LedgerOp>,
}

pub fn ledger_op() -> impl Strategy<Value = LedgerOp> {
    prop_oneof![
        3 => (any::<Index>(), vnf_demand(), 1u32..=3).prop_map(|(element, demand, multiplicity)| {
            LedgerOp::Take {
                element,
                demand,
                multiplicity,
            }
        }),
        1 => Just(LedgerOp::Give),
    ]
}

pub fn ledger_case() -> impl Strategy<Value = LedgerCase> {
    (substrate_spec(), prop::collection::vec(ledger_op(), 0..40))
        .prop_map(|(substrate, ops)| LedgerCase { substrate, ops })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chain_embedding::scenario::parse_scenario;

    proptest! {
        #[test]
        fn test_substrate_spec_builds(spec in substrate_spec()) {
            let g = spec.build().unwrap();
            prop_assert_eq!(g.node_count(), spec.infra.len() + 2);
            prop_assert_eq!(g.link_count(), 2 * (spec.links.len() + 2));
        }

        #[test]
        fn test_request_spec_builds(spec in request_spec()) {
            let r = spec.build().unwrap();
            prop_assert_eq!(r.chains().len(), spec.chain_hops().len());
            for (chain, hops) in spec.chain_hops() {
                prop_assert_eq!(r.chain(chain).unwrap().hops.len(), hops.len());
            }
        }

        #[test]
        fn test_scenario_export_loads_as_built(case in embedding_case()) {
            let text = case.to_scenario_json().to_string();
            let loaded = parse_scenario(&text).unwrap();
            let substrate = case.substrate.build().unwrap();
            let request = case.request.build().unwrap();

            let ids = |g: &SubstrateGraph| g.node_indices().map(|v| g.node(v).id.clone()).collect::<Vec<_>>();
            let link_ids = |g: &SubstrateGraph| g.link_indices().map(|l| g.link(l).id.clone()).collect::<Vec<_>>();
            prop_assert_eq!(ids(&loaded.substrate), ids(&substrate));
            prop_assert_eq!(link_ids(&loaded.substrate), link_ids(&substrate));
            prop_assert_eq!(loaded.request.chains().len(), request.chains().len());
            for (chain, hops) in case.request.chain_hops() {
                prop_assert_eq!(loaded.request.chain(chain).unwrap().hops.len(), hops.len());
                prop_assert_eq!(loaded.request.chain(chain).unwrap().delay, request.chain(chain).unwrap().delay);
            }
            prop_assert_eq!(loaded.config, Some(case.config()));
        }

        #[test]
        fn test_demands_are_integral(demand in vnf_demand()) {
            prop_assert_eq!(demand.cpu.fract(), 0.0);
            prop_assert!(demand.is_valid());
        }
    }
}
