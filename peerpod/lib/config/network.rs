use getset::{Getters, Setters};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::tunneler::TunnelType;

use super::{
    DEFAULT_LOCAL_TABLE_PRIORITY, DEFAULT_POD_TABLE_PRIORITY, DEFAULT_SOURCE_RULE_PRIORITY,
    DEFAULT_TABLE_ID_MAX, DEFAULT_TABLE_ID_MIN, DEFAULT_VXLAN_MIN_ID, DEFAULT_VXLAN_PORT,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Worker-side settings of the pod network tunnel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder, Getters, Setters)]
#[getset(get = "pub with_prefix", set = "pub")]
#[serde(rename_all = "kebab-case", default)]
pub struct WorkerNetworkConfig {
    /// The transport used between the worker and the pod VM.
    #[builder(default)]
    pub(super) tunnel_type: TunnelType,

    /// The host interface that carries the tunnel. Empty means the primary interface.
    #[builder(default, setter(strip_option, into))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(super) host_interface: Option<String>,

    /// The UDP port of VXLAN tunnels.
    #[builder(default = DEFAULT_VXLAN_PORT)]
    pub(super) vxlan_port: u16,

    /// The VXLAN id handed to the first pod.
    #[builder(default = DEFAULT_VXLAN_MIN_ID)]
    pub(super) vxlan_min_id: u32,

    /// Whether the pod VM provides external connectivity through a secondary interface.
    #[builder(default)]
    pub(super) external_network_via_podvm: bool,

    /// Extra subnets routed through the pod interface's gateway.
    #[builder(default)]
    pub(super) pod_subnet_cidrs: Vec<String>,

    /// The policy-routing priorities used by the routing tunnel.
    #[builder(default)]
    pub(super) routing_priorities: RoutingPriorities,
}

/// The routing-policy database priorities and table ids the tunnels use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
#[serde(rename_all = "kebab-case", default)]
pub struct RoutingPriorities {
    /// The priority the local table rule is moved to.
    #[builder(default = DEFAULT_LOCAL_TABLE_PRIORITY)]
    pub(super) local_table_priority: u32,

    /// The priority of the per-pod source rule.
    #[builder(default = DEFAULT_SOURCE_RULE_PRIORITY)]
    pub(super) source_rule_priority: u32,

    /// The priority of the pod-VM pod table rule.
    #[builder(default = DEFAULT_POD_TABLE_PRIORITY)]
    pub(super) pod_table_priority: u32,

    /// The lowest table id the routing tunnel allocates.
    #[builder(default = DEFAULT_TABLE_ID_MIN)]
    pub(super) table_id_min: u32,

    /// The highest table id the routing tunnel allocates.
    #[builder(default = DEFAULT_TABLE_ID_MAX)]
    pub(super) table_id_max: u32,
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for WorkerNetworkConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for RoutingPriorities {
    fn default() -> Self {
        Self::builder().build()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_network_config_defaults() {
        let config = WorkerNetworkConfig::default();
        assert_eq!(config.get_tunnel_type(), &TunnelType::Vxlan);
        assert_eq!(*config.get_vxlan_port(), 4789);
        assert_eq!(*config.get_vxlan_min_id(), 555000);
        assert!(config.get_host_interface().is_none());
        assert_eq!(*config.get_routing_priorities().get_source_rule_priority(), 505);
        assert_eq!(*config.get_routing_priorities().get_local_table_priority(), 32765);
    }

    #[test]
    fn test_worker_network_config_from_toml() -> anyhow::Result<()> {
        let config: WorkerNetworkConfig = toml::from_str(
            r#"
            tunnel-type = "routing"
            host-interface = "ens1"
            vxlan-port = 8472

            [routing-priorities]
            source-rule-priority = 600
            "#,
        )?;

        assert_eq!(config.get_tunnel_type(), &TunnelType::Routing);
        assert_eq!(config.get_host_interface().as_deref(), Some("ens1"));
        assert_eq!(*config.get_vxlan_port(), 8472);
        assert_eq!(*config.get_vxlan_min_id(), 555000);
        assert_eq!(*config.get_routing_priorities().get_source_rule_priority(), 600);
        assert_eq!(*config.get_routing_priorities().get_table_id_min(), 50000);
        Ok(())
    }
}
