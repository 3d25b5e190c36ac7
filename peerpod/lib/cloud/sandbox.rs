use std::{path::PathBuf, sync::Arc};

use getset::Getters;

use crate::{provider::InstanceTypeSpec, proxy::AgentProxy, tunneler::NetworkConfig};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The lifecycle state of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    /// Registered by `CreateVM`; no pod VM yet.
    Created,

    /// The pod VM exists and its agent proxy serves.
    Started,

    /// `StopVM` is releasing the sandbox's resources.
    Stopping,
}

/// A pod hosted in a remote pod VM.
#[derive(Debug, Getters)]
#[getset(get = "pub with_prefix")]
pub struct Sandbox {
    /// The sandbox id assigned by the container runtime.
    id: String,

    /// The pod's name.
    pod_name: String,

    /// The pod's namespace.
    pod_namespace: String,

    /// The pod's network namespace on the worker.
    net_ns_path: PathBuf,

    /// The resources requested for the pod VM.
    spec: InstanceTypeSpec,

    /// The pod network as inspected at creation.
    network: NetworkConfig,

    /// The rendered cloud-config handed to the provider.
    user_data: String,

    /// The sandbox's agent proxy.
    proxy: Arc<AgentProxy>,

    /// The provider's id of the pod VM. Empty until started.
    instance_id: String,

    /// The pod VM's name.
    instance_name: String,

    /// Whether installing the worker end of the tunnel was attempted.
    network_setup: bool,

    /// The lifecycle state.
    state: SandboxState,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Sandbox {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        id: String,
        pod_name: String,
        pod_namespace: String,
        net_ns_path: PathBuf,
        spec: InstanceTypeSpec,
        network: NetworkConfig,
        user_data: String,
        proxy: Arc<AgentProxy>,
        instance_name: String,
    ) -> Self {
        Self {
            id,
            pod_name,
            pod_namespace,
            net_ns_path,
            spec,
            network,
            user_data,
            proxy,
            instance_id: String::new(),
            instance_name,
            network_setup: false,
            state: SandboxState::Created,
        }
    }

    /// Whether the sandbox belongs to the pod `namespace/name`.
    pub fn is_pod(&self, namespace: &str, name: &str) -> bool {
        self.pod_namespace == namespace && self.pod_name == name
    }

    pub(super) fn set_instance(&mut self, id: impl Into<String>, name: impl Into<String>) {
        self.instance_id = id.into();
        self.instance_name = name.into();
    }

    pub(super) fn set_network_setup(&mut self) {
        self.network_setup = true;
    }

    pub(super) fn set_state(&mut self, state: SandboxState) {
        self.state = state;
    }
}
