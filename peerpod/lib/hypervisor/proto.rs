use std::collections::HashMap;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The ttrpc service name of the hypervisor surface.
pub const HYPERVISOR_SERVICE: &str = "hypervisor.Hypervisor";

/// The ttrpc service name of the pod VM info surface.
pub const POD_VM_INFO_SERVICE: &str = "podvminfo.PodVMInfo";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Asks for the service version.
#[derive(Clone, PartialEq, prost::Message)]
pub struct VersionRequest {
    /// The caller's version.
    #[prost(string, tag = "1")]
    pub version: String,
}

/// The service version.
#[derive(Clone, PartialEq, prost::Message)]
pub struct VersionResponse {
    /// The service version.
    #[prost(string, tag = "1")]
    pub version: String,
}

/// Registers a sandbox.
#[derive(Clone, PartialEq, prost::Message)]
pub struct CreateVmRequest {
    /// The sandbox id.
    #[prost(string, tag = "1")]
    pub id: String,

    /// The sandbox annotations.
    #[prost(map = "string, string", tag = "2")]
    pub annotations: HashMap<String, String>,

    /// The pod's network namespace.
    #[prost(string, tag = "3")]
    pub network_namespace_path: String,
}

/// Where the agent of a registered sandbox is served.
#[derive(Clone, PartialEq, prost::Message)]
pub struct CreateVmResponse {
    /// The unix socket of the sandbox's agent proxy.
    #[prost(string, tag = "1")]
    pub agent_socket_path: String,
}

/// Starts the pod VM of a sandbox.
#[derive(Clone, PartialEq, prost::Message)]
pub struct StartVmRequest {
    /// The sandbox id.
    #[prost(string, tag = "1")]
    pub id: String,
}

/// Stops the pod VM of a sandbox.
#[derive(Clone, PartialEq, prost::Message)]
pub struct StopVmRequest {
    /// The sandbox id.
    #[prost(string, tag = "1")]
    pub id: String,
}

/// Asks for the pod VM hosting a pod.
#[derive(Clone, PartialEq, prost::Message)]
pub struct GetInfoRequest {
    /// The pod's name.
    #[prost(string, tag = "1")]
    pub pod_name: String,

    /// The pod's namespace.
    #[prost(string, tag = "2")]
    pub pod_namespace: String,

    /// Whether to wait for the pod VM to be started.
    #[prost(bool, tag = "3")]
    pub wait: bool,
}

/// The pod VM hosting a pod.
#[derive(Clone, PartialEq, prost::Message)]
pub struct GetInfoResponse {
    /// The provider's id of the pod VM.
    #[prost(string, tag = "1")]
    pub vm_id: String,
}
