use getset::Getters;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Deserializer, Serialize};
use typed_builder::TypedBuilder;

use crate::netops::{HardwareAddr, Neighbor, Route};

use super::TunnelType;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The pod network descriptor the worker derives from a pod namespace and the pod VM replays.
///
/// The JSON form is shared by both sides, so field names are fixed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
#[serde(rename_all = "kebab-case")]
pub struct NetworkConfig {
    /// The IPv4 prefix of the pod interface.
    #[serde(rename = "podip")]
    pub(crate) pod_ip: Ipv4Network,

    /// The MAC of the pod's primary interface.
    #[builder(default)]
    #[serde(default)]
    pub(crate) pod_hw_addr: HardwareAddr,

    /// The name of the pod's primary interface.
    #[builder(setter(into))]
    #[serde(rename = "interface")]
    pub(crate) interface_name: String,

    /// The IPv4 prefix of the worker interface that carries the tunnel.
    pub(crate) worker_node_ip: Ipv4Network,

    /// The tunnel driver.
    #[builder(default)]
    #[serde(default)]
    pub(crate) tunnel_type: TunnelType,

    /// The pod routes, replayed on the pod VM.
    #[builder(default)]
    #[serde(default, deserialize_with = "null_as_empty")]
    pub(crate) routes: Vec<Route>,

    /// The permanent neighbors of the pod interface.
    #[builder(default)]
    #[serde(default, deserialize_with = "null_as_empty")]
    pub(crate) neighbors: Vec<Neighbor>,

    /// The MTU of the pod interface.
    #[builder(default)]
    #[serde(default)]
    pub(crate) mtu: u32,

    /// The per-process pod index.
    #[builder(default)]
    #[serde(default)]
    pub(crate) index: u32,

    /// The VXLAN UDP port.
    #[builder(default)]
    #[serde(default, skip_serializing_if = "is_zero_u16")]
    pub(crate) vxlan_port: u16,

    /// The VXLAN network identifier.
    #[builder(default)]
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub(crate) vxlan_id: u32,

    /// Whether the tunnel uses a secondary interface on both ends.
    #[builder(default)]
    #[serde(default)]
    pub(crate) dedicated: bool,

    /// Whether the pod VM gives the pod external connectivity through its own secondary interface.
    #[builder(default)]
    #[serde(default, rename = "external-net-via-pod-vm")]
    pub(crate) external_net_via_pod_vm: bool,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn is_zero_u16(value: &u16) -> bool {
    *value == 0
}

fn is_zero_u32(value: &u32) -> bool {
    *value == 0
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::netops::RouteProtocol;

    use super::*;

    fn sample() -> anyhow::Result<NetworkConfig> {
        Ok(NetworkConfig::builder()
            .pod_ip("172.16.0.2/24".parse()?)
            .pod_hw_addr("0e:8f:62:f3:81:ad".parse()?)
            .interface_name("eth0")
            .worker_node_ip("10.224.0.4/16".parse()?)
            .routes(vec![
                Route::builder()
                    .gw("172.16.0.1".parse()?)
                    .dev("eth0")
                    .protocol(RouteProtocol::Static)
                    .build(),
                Route::builder()
                    .dst("172.16.0.0/24".parse()?)
                    .dev("eth0")
                    .protocol(RouteProtocol::Kernel)
                    .build(),
            ])
            .mtu(1500)
            .index(1)
            .vxlan_port(8472)
            .vxlan_id(555001)
            .build())
    }

    #[test]
    fn test_network_config_json_keys() -> anyhow::Result<()> {
        let json = serde_json::to_value(sample()?)?;
        let object = json.as_object().unwrap();

        for key in [
            "podip",
            "pod-hw-addr",
            "interface",
            "worker-node-ip",
            "tunnel-type",
            "routes",
            "neighbors",
            "mtu",
            "index",
            "vxlan-port",
            "vxlan-id",
            "dedicated",
            "external-net-via-pod-vm",
        ] {
            assert!(object.contains_key(key), "missing key {key}");
        }

        assert_eq!(json["podip"], "172.16.0.2/24");
        assert_eq!(json["worker-node-ip"], "10.224.0.4/16");
        assert_eq!(json["tunnel-type"], "vxlan");
        assert_eq!(json["vxlan-id"], 555001);
        assert_eq!(json["routes"][0]["dst"], "0.0.0.0/0");
        Ok(())
    }

    #[test]
    fn test_network_config_omits_zero_vxlan_fields() -> anyhow::Result<()> {
        let mut config = sample()?;
        config.vxlan_port = 0;
        config.vxlan_id = 0;
        config.tunnel_type = TunnelType::Routing;

        let json = serde_json::to_value(&config)?;
        assert!(json.get("vxlan-port").is_none());
        assert!(json.get("vxlan-id").is_none());
        Ok(())
    }

    #[test]
    fn test_network_config_survives_the_trip_to_the_pod_vm() -> anyhow::Result<()> {
        let config = sample()?;
        let text = serde_json::to_string(&config)?;
        let parsed: NetworkConfig = serde_json::from_str(&text)?;
        assert_eq!(parsed, config);
        assert_eq!(serde_json::to_string(&parsed)?, text);
        Ok(())
    }

    #[test]
    fn test_network_config_accepts_null_lists() -> anyhow::Result<()> {
        let parsed: NetworkConfig = serde_json::from_str(
            r#"{
                "podip": "172.16.0.2/24",
                "interface": "eth0",
                "worker-node-ip": "10.224.0.4/16",
                "tunnel-type": "vxlan",
                "routes": null,
                "neighbors": null,
                "mtu": 1450,
                "index": 0,
                "dedicated": false,
                "external-net-via-pod-vm": false
            }"#,
        )?;
        assert!(parsed.get_routes().is_empty());
        assert!(parsed.get_neighbors().is_empty());
        assert_eq!(*parsed.get_vxlan_id(), 0);
        Ok(())
    }
}
