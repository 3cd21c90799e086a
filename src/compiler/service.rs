//! Network-facing Service generator

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use super::NodeIdentity;
use crate::crd::ManagedNodeSpec;

/// Port name for CometBFT RPC
pub const RPC_PORT_NAME: &str = "rpc";
/// Port name for peer-to-peer gossip
pub const P2P_PORT_NAME: &str = "p2p";
/// Port name for the REST API
pub const API_PORT_NAME: &str = "api";
/// Port name for Prometheus metrics
pub const METRICS_PORT_NAME: &str = "metrics";

/// Prometheus scrape hint annotations
pub const SCRAPE_ANNOTATION: &str = "prometheus.io/scrape";
/// Prometheus port hint annotation
pub const SCRAPE_PORT_ANNOTATION: &str = "prometheus.io/port";
/// Prometheus path hint annotation
pub const SCRAPE_PATH_ANNOTATION: &str = "prometheus.io/path";

/// The four named ports, in a fixed order
pub fn named_ports(spec: &ManagedNodeSpec) -> [(&'static str, u16); 4] {
    [
        (RPC_PORT_NAME, spec.networking.rpc.port),
        (P2P_PORT_NAME, spec.networking.p2p.port),
        (API_PORT_NAME, spec.networking.api.port),
        (METRICS_PORT_NAME, spec.monitoring.metrics_endpoint.port),
    ]
}

/// Scrape hints shared by the Service and the pod template
pub fn scrape_annotations(spec: &ManagedNodeSpec) -> BTreeMap<String, String> {
    let metrics = &spec.monitoring.metrics_endpoint;
    BTreeMap::from([
        (
            SCRAPE_ANNOTATION.to_string(),
            spec.monitoring.enabled.to_string(),
        ),
        (SCRAPE_PORT_ANNOTATION.to_string(), metrics.port.to_string()),
        (SCRAPE_PATH_ANNOTATION.to_string(), metrics.path.clone()),
    ])
}

/// Generate the node's Service
pub fn generate(spec: &ManagedNodeSpec, identity: &NodeIdentity) -> Service {
    let ports = named_ports(spec)
        .into_iter()
        .map(|(name, port)| ServicePort {
            name: Some(name.to_string()),
            port: i32::from(port),
            target_port: Some(IntOrString::Int(i32::from(port))),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        })
        .collect();

    let mut metadata = identity.object_meta(&identity.names.service);
    metadata.annotations = Some(scrape_annotations(spec));

    Service {
        metadata,
        spec: Some(ServiceSpec {
            selector: Some(identity.selector_labels()),
            ports: Some(ports),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::test_fixtures::node;
    use crate::crd::NodeKind;

    fn service_for(spec_edit: impl FnOnce(&mut ManagedNodeSpec)) -> Service {
        let mut n = node("node-a", NodeKind::Observer);
        spec_edit(&mut n.spec);
        generate(&n.spec, &NodeIdentity::of(&n).unwrap())
    }

    #[test]
    fn exposes_exactly_four_named_ports() {
        let svc = service_for(|_| {});
        let ports = svc.spec.unwrap().ports.unwrap();
        let pairs: Vec<_> = ports
            .iter()
            .map(|p| (p.name.clone().unwrap(), p.port))
            .collect();
        assert_eq!(
            pairs,
            [
                ("rpc".to_string(), 26657),
                ("p2p".to_string(), 26656),
                ("api".to_string(), 1317),
                ("metrics".to_string(), 26660),
            ]
        );
    }

    #[test]
    fn ports_track_spec() {
        let svc = service_for(|s| s.monitoring.metrics_endpoint.port = 9100);
        let ports = svc.spec.unwrap().ports.unwrap();
        let metrics = ports.iter().find(|p| p.name.as_deref() == Some("metrics")).unwrap();
        assert_eq!(metrics.port, 9100);
        assert_eq!(metrics.target_port, Some(IntOrString::Int(9100)));
    }

    #[test]
    fn scrape_annotations_follow_monitoring() {
        let svc = service_for(|s| {
            s.monitoring.enabled = false;
            s.monitoring.metrics_endpoint.path = "/prom".to_string();
        });
        let annotations = svc.metadata.annotations.unwrap();
        assert_eq!(annotations[SCRAPE_ANNOTATION], "false");
        assert_eq!(annotations[SCRAPE_PATH_ANNOTATION], "/prom");
        assert_eq!(annotations[SCRAPE_PORT_ANNOTATION], "26660");
    }

    #[test]
    fn selects_the_node_pod() {
        let svc = service_for(|_| {});
        assert_eq!(svc.metadata.name.as_deref(), Some("node-a-service"));
        let selector = svc.spec.unwrap().selector.unwrap();
        assert_eq!(selector.get("app").map(String::as_str), Some("node-a"));
    }
}
