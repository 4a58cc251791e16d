//! Scenario loading from JSON files
//!
//! A scenario bundles a substrate, a request and optionally a mapping
//! config. Every field is read as optional and checked here so that a
//! missing field surfaces as `BadInput` naming the offending entry.

use crate::config::MappingConfig;
use crate::model::{
    Chain, RequestGraph, RequestNode, Resources, SgHop, SubstrateGraph, SubstrateLink, SubstrateNode,
};
use crate::{EmbedError, Result};
use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::info;

/// Parsed scenario ready for [`crate::map_request`]
#[derive(Debug, Clone)]
pub struct Scenario {
    pub substrate: SubstrateGraph,
    pub request: RequestGraph,
    pub config: Option<MappingConfig>,
}

#[derive(Debug, Deserialize)]
struct RawScenario {
    substrate: Option<RawSubstrate>,
    request: Option<RawRequest>,
    config: Option<MappingConfig>,
}

#[derive(Debug, Deserialize)]
struct RawSubstrate {
    nodes: Option<Vec<RawSubstrateNode>>,
    links: Option<Vec<RawLink>>,
}

#[derive(Debug, Deserialize)]
struct RawResources {
    cpu: Option<f64>,
    mem: Option<f64>,
    storage: Option<f64>,
    bandwidth: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawSubstrateNode {
    id: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    name: Option<String>,
    resources: Option<RawResources>,
    delay: Option<f64>,
    supported: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct RawLink {
    id: Option<String>,
    src: Option<String>,
    dst: Option<String>,
    bandwidth: Option<f64>,
    delay: Option<f64>,
    bidirectional: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawRequest {
    nodes: Option<Vec<RawRequestNode>>,
    hops: Option<Vec<RawHop>>,
    chains: Option<Vec<RawChain>>,
}

#[derive(Debug, Deserialize)]
struct RawRequestNode {
    id: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    name: Option<String>,
    functional_type: Option<String>,
    demand: Option<RawResources>,
    placement: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct RawHop {
    id: Option<String>,
    src: Option<String>,
    dst: Option<String>,
    bandwidth: Option<f64>,
    delay: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawChain {
    id: Option<u32>,
    nodes: Option<Vec<String>>,
    hops: Option<Vec<String>>,
    delay: Option<f64>,
    bandwidth: Option<f64>,
}

fn require<T>(value: Option<T>, what: impl Into<String>) -> Result<T> {
    value.ok_or_else(|| EmbedError::bad_input(what, "nothing"))
}

impl RawResources {
    fn into_resources(self, owner: &str) -> Result<Resources> {
        Ok(Resources::new(
            require(self.cpu, format!("cpu of {}", owner))?,
            require(self.mem, format!("mem of {}", owner))?,
            require(self.storage, format!("storage of {}", owner))?,
            require(self.bandwidth, format!("bandwidth of {}", owner))?,
        ))
    }
}

fn build_substrate(raw: RawSubstrate) -> Result<SubstrateGraph> {
    let mut g = SubstrateGraph::new();

    for (i, node) in require(raw.nodes, "substrate.nodes")?.into_iter().enumerate() {
        let id = require(node.id, format!("id of substrate node #{}", i))?;
        let kind = require(node.kind, format!("type of substrate node {}", id))?;
        let built = match kind.to_ascii_uppercase().as_str() {
            "SAP" => {
                let name = node.name.unwrap_or_else(|| id.clone());
                SubstrateNode::sap(id, name)
            }
            "INFRA" => {
                let capacity = require(node.resources, format!("resources of {}", id))?.into_resources(&id)?;
                let delay = require(node.delay, format!("delay of {}", id))?;
                SubstrateNode::infra(id, capacity, delay).with_supported(node.supported.unwrap_or_default())
            }
            other => return Err(EmbedError::bad_input("node type SAP or INFRA", other)),
        };
        g.add_node(built)?;
    }

    for (i, link) in raw.links.unwrap_or_default().into_iter().enumerate() {
        let id = require(link.id, format!("id of substrate link #{}", i))?;
        let src = require(link.src, format!("src of {}", id))?;
        let dst = require(link.dst, format!("dst of {}", id))?;
        let bandwidth = require(link.bandwidth, format!("bandwidth of {}", id))?;
        let delay = require(link.delay, format!("delay of {}", id))?;
        let edge = SubstrateLink::new(id, bandwidth, delay);
        if link.bidirectional.unwrap_or(false) {
            g.add_bidirectional_link(&src, &dst, edge)?;
        } else {
            g.add_link(&src, &dst, edge)?;
        }
    }
    Ok(g)
}

fn build_request(raw: RawRequest) -> Result<RequestGraph> {
    let mut r = RequestGraph::new();

    for (i, node) in require(raw.nodes, "request.nodes")?.into_iter().enumerate() {
        let id = require(node.id, format!("id of request node #{}", i))?;
        let kind = require(node.kind, format!("type of request node {}", id))?;
        let built = match kind.to_ascii_uppercase().as_str() {
            "SAP" => {
                let name = require(node.name, format!("name of SAP {}", id))?;
                RequestNode::sap(id, name)
            }
            "VNF" => {
                let functional_type = require(node.functional_type, format!("functional_type of {}", id))?;
                let demand = require(node.demand, format!("demand of {}", id))?.into_resources(&id)?;
                RequestNode::vnf(id, functional_type, demand).with_placement(node.placement.unwrap_or_default())
            }
            other => return Err(EmbedError::bad_input("node type SAP or VNF", other)),
        };
        r.add_node(built)?;
    }

    for (i, hop) in require(raw.hops, "request.hops")?.into_iter().enumerate() {
        let id = require(hop.id, format!("id of SG-hop #{}", i))?;
        let src = require(hop.src, format!("src of {}", id))?;
        let dst = require(hop.dst, format!("dst of {}", id))?;
        let mut built = SgHop::new(id).with_bandwidth(hop.bandwidth.unwrap_or(0.0));
        if let Some(delay) = hop.delay {
            built = built.with_delay(delay);
        }
        r.add_hop(&src, &dst, built)?;
    }

    for (i, chain) in require(raw.chains, "request.chains")?.into_iter().enumerate() {
        let id = require(chain.id, format!("id of chain #{}", i))?;
        let nodes = require(chain.nodes, format!("nodes of chain {}", id))?;
        let hops = require(chain.hops, format!("hops of chain {}", id))?;
        let delay = require(chain.delay, format!("delay of chain {}", id))?;
        r.add_chain(Chain::new(id, nodes, hops, delay).with_bandwidth(chain.bandwidth.unwrap_or(0.0)))?;
    }
    Ok(r)
}

/// Parse a scenario from a JSON string
pub fn parse_scenario(json: &str) -> Result<Scenario> {
    let raw: RawScenario = serde_json::from_str(json)?;
    into_scenario(raw)
}

/// Load a scenario from a JSON file
pub fn load_scenario(path: impl AsRef<Path>) -> Result<Scenario> {
    let path = path.as_ref();
    info!("Loading scenario from {:?}", path);

    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let raw: RawScenario = serde_json::from_reader(reader)?;
    let scenario = into_scenario(raw)?;

    info!(
        "Loaded {} substrate nodes, {} links, {} request nodes, {} chains",
        scenario.substrate.node_count(),
        scenario.substrate.link_count(),
        scenario.request.node_indices().count(),
        scenario.request.chains().len()
    );
    Ok(scenario)
}

fn into_scenario(raw: RawScenario) -> Result<Scenario> {
    let substrate = build_substrate(require(raw.substrate, "substrate")?)?;
    let request = build_request(require(raw.request, "request")?)?;
    if let Some(config) = &raw.config {
        config.validate()?;
    }
    Ok(Scenario {
        substrate,
        request,
        config: raw.config,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const LINE: &str = r#"{
        "substrate": {
            "nodes": [
                {"id": "A", "type": "SAP", "name": "sap1"},
                {"id": "B", "type": "INFRA", "delay": 2,
                 "resources": {"cpu": 4, "mem": 8, "storage": 16, "bandwidth": 1000}},
                {"id": "C", "type": "SAP", "name": "sap2"}
            ],
            "links": [
                {"id": "l1", "src": "A", "dst": "B", "bandwidth": 100, "delay": 1, "bidirectional": true},
                {"id": "l2", "src": "B", "dst": "C", "bandwidth": 100, "delay": 1, "bidirectional": true}
            ]
        },
        "request": {
            "nodes": [
                {"id": "s1", "type": "SAP", "name": "sap1"},
                {"id": "v1", "type": "VNF", "functional_type": "fw",
                 "demand": {"cpu": 1, "mem": 1, "storage": 1, "bandwidth": 0}},
                {"id": "s2", "type": "SAP", "name": "sap2"}
            ],
            "hops": [
                {"id": "h1", "src": "s1", "dst": "v1"},
                {"id": "h2", "src": "v1", "dst": "s2"}
            ],
            "chains": [
                {"id": 1, "nodes": ["s1", "v1", "s2"], "hops": ["h1", "h2"], "delay": 10, "bandwidth": 10}
            ]
        }
    }"#;

    #[test]
    fn test_parse_line_scenario() {
        let scenario = parse_scenario(LINE).unwrap();
        assert_eq!(scenario.substrate.node_count(), 3);
        assert_eq!(scenario.substrate.link_count(), 4);
        assert_eq!(scenario.request.chains().len(), 1);
        assert!(scenario.config.is_none());
    }

    #[test]
    fn test_missing_field_is_bad_input() {
        let json = LINE.replace(r#""delay": 2,"#, "");
        let err = parse_scenario(&json).unwrap_err();
        assert!(matches!(err, EmbedError::BadInput { ref expected, .. } if expected == "delay of B"));
    }

    #[test]
    fn test_unknown_node_type() {
        let json = LINE.replace(r#""type": "INFRA""#, r#""type": "ROUTER""#);
        assert!(matches!(parse_scenario(&json), Err(EmbedError::BadInput { .. })));
    }

    #[test]
    fn test_load_with_config() {
        let json = LINE.trim_end().trim_end_matches('}').to_string() + r#", "config": {"bt_limit": 2}}"#;
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", json).unwrap();
        let scenario = load_scenario(file.path()).unwrap();
        assert_eq!(scenario.config.unwrap().bt_limit, 2);
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(parse_scenario("{"), Err(EmbedError::Json(_))));
    }
}
