use std::net::Ipv4Addr;

use getset::Getters;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A pod VM as reported by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct Instance {
    /// The provider's identifier of the VM.
    #[builder(setter(into))]
    id: String,

    /// The VM name.
    #[builder(setter(into))]
    name: String,

    /// The VM addresses. The first one is the tunnel endpoint unless the pod network is dedicated.
    #[builder(default)]
    ips: Vec<Ipv4Addr>,
}

/// The resources requested for a pod VM. Zero values mean unconstrained.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "kebab-case", default)]
pub struct InstanceTypeSpec {
    /// An explicit instance type, taking precedence over the resource values.
    #[builder(default, setter(into))]
    pub instance_type: String,

    /// The number of virtual CPUs.
    #[builder(default)]
    pub vcpus: i64,

    /// The memory in MiB.
    #[builder(default)]
    pub memory: i64,

    /// The CPU architecture.
    #[builder(default, setter(into))]
    pub arch: String,

    /// The number of GPUs.
    #[builder(default)]
    pub gpus: i64,

    /// The VM image.
    #[builder(default, setter(into))]
    pub image: String,

    /// Whether the VM needs a second network interface.
    #[builder(default)]
    pub multi_nic: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Instance {
    /// The address the worker tunnels to.
    pub fn primary_ip(&self) -> Option<Ipv4Addr> {
        self.ips.first().copied()
    }
}
