//! End-to-end embedding scenarios

use chain_embedding::latency::LatencyOracle;
use chain_embedding::ledger::Element;
use chain_embedding::manager::{HopTriple, MappingManager};
use chain_embedding::preprocess::{divide_into_subchains, Subchain};
use chain_embedding::scenario::load_scenario;
use chain_embedding::search::CoreAlgorithm;
use chain_embedding::{
    map_request, Chain, EmbedError, MappingConfig, RequestGraph, RequestNode, Resources, SgHop,
    SubstrateGraph, SubstrateLink, SubstrateNode,
};
use std::path::PathBuf;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../data")
        .join(name)
}

fn small_vnf(id: &str) -> RequestNode {
    RequestNode::vnf(id, "fw", Resources::new(1.0, 1.0, 1.0, 0.0))
}

/// A(sap1) - B - C(sap2), plus D(sap3) hanging off B
fn create_line_substrate() -> SubstrateGraph {
    let mut g = SubstrateGraph::new();
    g.add_node(SubstrateNode::sap("A", "sap1")).unwrap();
    g.add_node(SubstrateNode::infra("B", Resources::new(4.0, 8.0, 16.0, 1000.0), 2.0))
        .unwrap();
    g.add_node(SubstrateNode::sap("C", "sap2")).unwrap();
    g.add_node(SubstrateNode::sap("D", "sap3")).unwrap();
    g.add_bidirectional_link("A", "B", SubstrateLink::new("l1", 100.0, 1.0))
        .unwrap();
    g.add_bidirectional_link("B", "C", SubstrateLink::new("l2", 100.0, 1.0))
        .unwrap();
    g.add_bidirectional_link("B", "D", SubstrateLink::new("l3", 100.0, 1.0))
        .unwrap();
    g
}

fn create_single_chain(delay: f64, bandwidth: f64) -> RequestGraph {
    let mut r = RequestGraph::new();
    r.add_node(RequestNode::sap("s1", "sap1")).unwrap();
    r.add_node(small_vnf("v1")).unwrap();
    r.add_node(RequestNode::sap("s2", "sap2")).unwrap();
    r.add_hop("s1", "v1", SgHop::new("h1")).unwrap();
    r.add_hop("v1", "s2", SgHop::new("h2")).unwrap();
    r.add_chain(Chain::new(1, ["s1", "v1", "s2"], ["h1", "h2"], delay).with_bandwidth(bandwidth))
        .unwrap();
    r
}

/// s1 -> v1 -> s2 and s1 -> v1 -> s3, sharing the first hop.
fn create_shared_vnf_request(delay1: f64, delay2: f64) -> RequestGraph {
    let mut r = RequestGraph::new();
    r.add_node(RequestNode::sap("s1", "sap1")).unwrap();
    r.add_node(small_vnf("v1")).unwrap();
    r.add_node(RequestNode::sap("s2", "sap2")).unwrap();
    r.add_node(RequestNode::sap("s3", "sap3")).unwrap();
    r.add_hop("s1", "v1", SgHop::new("h1")).unwrap();
    r.add_hop("v1", "s2", SgHop::new("h2")).unwrap();
    r.add_hop("v1", "s3", SgHop::new("h3")).unwrap();
    r.add_chain(Chain::new(1, ["s1", "v1", "s2"], ["h1", "h2"], delay1).with_bandwidth(5.0))
        .unwrap();
    r.add_chain(Chain::new(2, ["s1", "v1", "s3"], ["h1", "h3"], delay2).with_bandwidth(5.0))
        .unwrap();
    r
}

/// A(sap1) - B - C(sap2) where B - C is thin, plus a wide detour
/// B - S(sap3) - C through another SAP.
fn create_sap_detour() -> SubstrateGraph {
    let mut g = SubstrateGraph::new();
    g.add_node(SubstrateNode::sap("A", "sap1")).unwrap();
    g.add_node(SubstrateNode::infra("B", Resources::new(4.0, 8.0, 16.0, 1000.0), 2.0))
        .unwrap();
    g.add_node(SubstrateNode::sap("C", "sap2")).unwrap();
    g.add_node(SubstrateNode::sap("S", "sap3")).unwrap();
    g.add_bidirectional_link("A", "B", SubstrateLink::new("l1", 100.0, 1.0))
        .unwrap();
    g.add_bidirectional_link("B", "C", SubstrateLink::new("l2", 11.0, 1.0))
        .unwrap();
    g.add_bidirectional_link("B", "S", SubstrateLink::new("l3", 1000.0, 1.0))
        .unwrap();
    g.add_bidirectional_link("S", "C", SubstrateLink::new("l4", 1000.0, 1.0))
        .unwrap();
    g
}

/// Directed diamond: A -> {B1, B2} -> C. B1 is nearly full, B2 is roomy
/// but its way out to C is thin.
fn create_diamond() -> SubstrateGraph {
    let mut g = SubstrateGraph::new();
    g.add_node(SubstrateNode::sap("A", "sap1")).unwrap();
    g.add_node(SubstrateNode::infra("B1", Resources::new(1.25, 100.0, 100.0, 1000.0), 1.0))
        .unwrap();
    g.add_node(SubstrateNode::infra("B2", Resources::new(100.0, 100.0, 100.0, 1000.0), 1.0))
        .unwrap();
    g.add_node(SubstrateNode::sap("C", "sap2")).unwrap();
    g.add_link("A", "B1", SubstrateLink::new("a1", 100.0, 1.0)).unwrap();
    g.add_link("A", "B2", SubstrateLink::new("a2", 100.0, 1.0)).unwrap();
    g.add_link("B1", "C", SubstrateLink::new("c1", 100.0, 1.0)).unwrap();
    g.add_link("B2", "C", SubstrateLink::new("c2", 10.0, 1.0)).unwrap();
    g
}

#[test]
fn test_line_fixture_maps_through_b() {
    let scenario = load_scenario(fixture("line_chain.json")).unwrap();
    let config = scenario.config.clone().unwrap_or_default();
    let result = map_request(scenario.substrate, scenario.request, config).unwrap();

    assert_eq!(result.host_of("s1"), Some("A"));
    assert_eq!(result.host_of("fw1"), Some("B"));
    assert_eq!(result.host_of("s2"), Some("C"));
    assert_eq!(result.hop("h1").unwrap().latency, 3.0);
    assert_eq!(result.hop("h2").unwrap().latency, 1.0);
    assert_eq!(result.remaining_latency(1), Some(6.0));
    assert_eq!(result.backtracks, 0);
}

#[test]
fn test_budget_below_path_latency_fails() {
    let err = map_request(create_line_substrate(), create_single_chain(3.0, 10.0), MappingConfig::default())
        .unwrap_err();
    assert!(err.is_mapping_failure());
    assert!(!err.backtrack_possible());
}

#[test]
fn test_bandwidth_above_link_capacity_fails() {
    let err = map_request(create_line_substrate(), create_single_chain(10.0, 150.0), MappingConfig::default())
        .unwrap_err();
    match err {
        EmbedError::Mapping {
            backtrack_possible,
            peak_vnf_cnt,
            ..
        } => {
            assert!(!backtrack_possible);
            assert_eq!(peak_vnf_cnt, Some(0));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_missing_sap_is_terminal() {
    let mut r = create_single_chain(10.0, 10.0);
    r.add_node(RequestNode::sap("s9", "nowhere")).unwrap();
    let err = map_request(create_line_substrate(), r, MappingConfig::default()).unwrap_err();
    assert!(err.is_mapping_failure());
    assert!(!err.backtrack_possible());
}

#[test]
fn test_hop_ceiling_rejects_slow_host() {
    let mut r = RequestGraph::new();
    r.add_node(RequestNode::sap("s1", "sap1")).unwrap();
    r.add_node(small_vnf("v1")).unwrap();
    r.add_node(RequestNode::sap("s2", "sap2")).unwrap();
    r.add_hop("s1", "v1", SgHop::new("h1").with_delay(2.0)).unwrap();
    r.add_hop("v1", "s2", SgHop::new("h2")).unwrap();
    r.add_chain(Chain::new(1, ["s1", "v1", "s2"], ["h1", "h2"], 10.0))
        .unwrap();
    let err = map_request(create_line_substrate(), r, MappingConfig::default()).unwrap_err();
    assert!(err.is_mapping_failure());
}

#[test]
fn test_shared_vnf_spends_both_budgets() {
    let r = create_shared_vnf_request(10.0, 8.0);
    let result = map_request(create_line_substrate(), r, MappingConfig::default()).unwrap();
    assert_eq!(result.host_of("v1"), Some("B"));
    assert_eq!(result.link_mapping.len(), 3);
    assert_eq!(result.remaining_latency(1), Some(6.0));
    assert_eq!(result.remaining_latency(2), Some(4.0));
}

#[test]
fn test_subchains_meeting_at_shared_vnf_keep_own_budgets() {
    let g = create_line_substrate();
    let mut r = create_shared_vnf_request(5.0, 7.0);
    let oracle = LatencyOracle::all_pairs(&g).unwrap();
    let mut m = MappingManager::new(&g, &r, oracle).unwrap();
    let pre = divide_into_subchains(&g, &mut r, &mut m).unwrap();
    let v1 = r.index_of("v1").unwrap();

    // one subchain into v1 under both chains, one out of v1 per chain
    assert_eq!(pre.subchains.len(), 3);
    let (shared, to_s2, to_s3) = (&pre.subchains[0], &pre.subchains[1], &pre.subchains[2]);
    assert_eq!(shared.parents, vec![1, 2]);
    assert_eq!(to_s2.parents, vec![1]);
    assert_eq!(to_s3.parents, vec![2]);
    assert_eq!(to_s2.path[0], v1);
    assert_eq!(to_s3.path[0], v1);

    let first_hop = |sc: &Subchain| HopTriple {
        from: sc.path[0],
        to: sc.path[1],
        hop: sc.hops[0],
    };
    let (b, c, d) = (
        g.index_of("B").unwrap(),
        g.index_of("C").unwrap(),
        g.index_of("D").unwrap(),
    );

    m.commit_latency(shared.id, 4.0, b).unwrap();
    assert_eq!(m.chain_avail_latency(1), Some(1.0));
    assert_eq!(m.chain_avail_latency(2), Some(3.0));
    assert_eq!(m.remaining_latency(shared.id, Some(first_hop(shared))).unwrap(), 1.0);
    assert_eq!(m.remaining_latency(to_s2.id, Some(first_hop(to_s2))).unwrap(), 1.0);
    assert_eq!(m.remaining_latency(to_s3.id, Some(first_hop(to_s3))).unwrap(), 3.0);

    // each branch out of v1 spends its own chain only
    m.commit_latency(to_s3.id, 1.0, d).unwrap();
    assert_eq!(m.chain_avail_latency(1), Some(1.0));
    assert_eq!(m.chain_avail_latency(2), Some(2.0));
    let err = m.commit_latency(to_s2.id, 1.5, c).unwrap_err();
    assert!(matches!(err, EmbedError::InternalAlgorithm(_)));
    assert_eq!(m.last_used_host(to_s2.id).unwrap(), None);
    assert_eq!(m.last_used_host(to_s3.id).unwrap(), Some(d));
}

#[test]
fn test_shared_vnf_search_leaves_tighter_budgets() {
    let r = create_shared_vnf_request(5.0, 7.0);
    let result = map_request(create_line_substrate(), r, MappingConfig::default()).unwrap();
    assert_eq!(result.host_of("v1"), Some("B"));
    // 3 into B, then 1 out to each SAP
    assert_eq!(result.remaining_latency(1), Some(1.0));
    assert_eq!(result.remaining_latency(2), Some(3.0));
}

#[test]
fn test_hops_never_transit_a_sap() {
    let result = map_request(create_sap_detour(), create_single_chain(10.0, 10.0), MappingConfig::default())
        .unwrap();
    assert_eq!(result.host_of("v1"), Some("B"));

    let h2 = result.hop("h2").unwrap();
    assert_eq!(h2.path, vec!["B", "C"]);
    assert_eq!(h2.links, vec!["l2"]);
    assert_eq!(h2.latency, 1.0);
    for hop in &result.link_mapping {
        if let [_, inner @ .., _] = hop.path.as_slice() {
            assert!(
                inner.iter().all(|n| !["A", "C", "S"].contains(&n.as_str())),
                "{} relays through a SAP: {:?}",
                hop.hop,
                hop.path
            );
        }
    }
}

/// Undo every committed unit and check the ledger and budgets are back to
/// where they were before the search.
fn assert_rollback_restores_start(substrate: SubstrateGraph, request: RequestGraph) {
    let mut algorithm = CoreAlgorithm::new(substrate, request, MappingConfig::default()).unwrap();
    let ledger_before = algorithm.ledger().snapshot();
    let budgets_before = algorithm.manager().budget_snapshot();
    let bindings_before = algorithm.manager().vnf_mapping().to_vec();

    algorithm.run().unwrap();
    let committed = algorithm.engine().mapped_units().len();
    assert!(committed > 0);
    assert_ne!(algorithm.ledger().snapshot(), ledger_before);
    assert_ne!(algorithm.manager().budget_snapshot(), budgets_before);

    let mut rolled_back = 0;
    while algorithm.rollback().unwrap() {
        rolled_back += 1;
    }
    assert_eq!(rolled_back, committed);
    assert_eq!(algorithm.ledger().snapshot(), ledger_before);
    assert_eq!(algorithm.ledger().depth(), 0);
    assert_eq!(algorithm.manager().budget_snapshot(), budgets_before);
    assert_eq!(algorithm.manager().vnf_mapping(), bindings_before.as_slice());
    assert!(algorithm.manager().link_mapping().is_empty());
}

#[test]
fn test_rollback_restores_ledger_and_budgets() {
    assert_rollback_restores_start(create_line_substrate(), create_shared_vnf_request(10.0, 8.0));
}

#[test]
fn test_rollback_after_backtracking_restores_start() {
    assert_rollback_restores_start(create_diamond(), create_single_chain(10.0, 50.0));
}

#[test]
fn test_backtracks_off_host_with_thin_uplink() {
    let config = MappingConfig::default().branching_factor(1).bt_limit(1);
    let result = map_request(create_diamond(), create_single_chain(10.0, 50.0), config).unwrap();

    assert_eq!(result.host_of("v1"), Some("B1"));
    assert_eq!(result.hop("h2").unwrap().path, vec!["B1", "C"]);
    assert_eq!(result.backtracks, 1);
    assert_eq!(result.remaining_latency(1), Some(7.0));
}

#[test]
fn test_backtracking_restores_ledger_exactly() {
    let mut algorithm =
        CoreAlgorithm::new(create_diamond(), create_single_chain(10.0, 50.0), MappingConfig::default())
            .unwrap();
    let result = algorithm.run().unwrap();
    assert_eq!(result.backtracks, 1);

    let ledger = algorithm.ledger();
    let g = ledger.substrate();
    let node = |id: &str| ledger.available(Element::Node(g.index_of(id).unwrap()));
    let link = |id: &str| ledger.available(Element::Link(g.link_index_of(id).unwrap())).bandwidth;

    // the abandoned branch left nothing behind
    assert_eq!(node("B2"), Resources::new(100.0, 100.0, 100.0, 1000.0));
    assert_eq!(link("a2"), 100.0);
    assert_eq!(link("c2"), 10.0);

    assert_eq!(node("B1"), Resources::new(0.25, 99.0, 99.0, 900.0));
    assert_eq!(link("a1"), 50.0);
    assert_eq!(link("c1"), 50.0);
    // VNF, in-path and out-path reservations
    assert_eq!(ledger.depth(), 5);
}

#[test]
fn test_placement_restriction_blocks_backtrack() {
    let mut r = RequestGraph::new();
    r.add_node(RequestNode::sap("s1", "sap1")).unwrap();
    r.add_node(small_vnf("v1").with_placement(["B2"])).unwrap();
    r.add_node(RequestNode::sap("s2", "sap2")).unwrap();
    r.add_hop("s1", "v1", SgHop::new("h1")).unwrap();
    r.add_hop("v1", "s2", SgHop::new("h2")).unwrap();
    r.add_chain(Chain::new(1, ["s1", "v1", "s2"], ["h1", "h2"], 10.0).with_bandwidth(50.0))
        .unwrap();

    let err = map_request(create_diamond(), r, MappingConfig::default()).unwrap_err();
    match err {
        EmbedError::Mapping {
            backtrack_possible,
            peak_vnf_cnt,
            peak_sc_cnt,
            ..
        } => {
            assert!(!backtrack_possible);
            assert_eq!(peak_vnf_cnt, Some(1));
            assert_eq!(peak_sc_cnt, Some(1));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_result_serializes() {
    let result = map_request(create_line_substrate(), create_single_chain(10.0, 10.0), MappingConfig::default())
        .unwrap();
    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["vnf_mapping"].as_array().unwrap().len(), 3);
    assert_eq!(json["chain_latency"][0]["remaining"], 6.0);
    assert!(json["computed_at"].is_string());
}
