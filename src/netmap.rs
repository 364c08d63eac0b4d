//! Network-map model and the overlay engine contract.

use std::net::{IpAddr, SocketAddr};

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// The self-node portion of a network map: the addresses assigned to this
/// node and the routes it has offered to carry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelfNode {
    /// Mesh addresses assigned directly to this node (host prefixes).
    #[serde(default)]
    pub addresses: Vec<IpNet>,
    /// Everything this node may receive traffic for: its own addresses plus
    /// any advertised subnet routes.
    #[serde(default)]
    pub allowed_ips: Vec<IpNet>,
}

/// A network map as delivered by the control plane.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkMap {
    pub self_node: Option<SelfNode>,
}

/// Callback invoked whenever the network map changes.
pub type NetmapCallback = Box<dyn Fn(&NetworkMap) + Send + Sync>;

/// The overlay data-plane engine: the source of network-map updates and the
/// registry that lets other subsystems recover the original mesh peer behind
/// a locally bound proxy socket.
pub trait MeshEngine: Send + Sync {
    fn add_network_map_callback(&self, cb: NetmapCallback);

    /// Record that traffic from `backend_local` is proxied on behalf of
    /// `peer` for the duration of a flow.
    fn register_ip_port_identity(&self, backend_local: SocketAddr, peer: IpAddr);

    fn unregister_ip_port_identity(&self, backend_local: SocketAddr);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_map_round_trips_through_json() {
        let nm: NetworkMap = serde_json::from_str(
            r#"{"self_node":{"addresses":["100.64.0.2/32"],
                "allowed_ips":["100.64.0.2/32","10.0.0.0/24"]}}"#,
        )
        .unwrap();
        let node = nm.self_node.as_ref().unwrap();
        assert_eq!(node.addresses, vec!["100.64.0.2/32".parse::<IpNet>().unwrap()]);
        assert_eq!(node.allowed_ips[1], "10.0.0.0/24".parse::<IpNet>().unwrap());

        let out = serde_json::to_string(&nm).unwrap();
        assert!(out.contains("100.64.0.2/32"));
    }

    #[test]
    fn missing_fields_default_to_empty() {
        let nm: NetworkMap = serde_json::from_str("{}").unwrap();
        assert!(nm.self_node.is_none());

        let node: SelfNode = serde_json::from_str("{}").unwrap();
        assert!(node.addresses.is_empty());
        assert!(node.allowed_ips.is_empty());
    }
}
