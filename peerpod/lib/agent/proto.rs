//! Partial views of agent protocol messages.
//!
//! Only the fields the proxies read are declared; decoding skips the rest. Views are never
//! re-encoded for forwarding, see [`super::wire`].

use std::collections::HashMap;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A view of `CreateContainerRequest`.
#[derive(Clone, PartialEq, prost::Message)]
pub struct CreateContainerRequest {
    /// The container id.
    #[prost(string, tag = "1")]
    pub container_id: String,

    /// The storages mounted for the container.
    #[prost(message, repeated, tag = "5")]
    pub storages: Vec<Storage>,

    /// The OCI runtime spec.
    #[prost(message, optional, tag = "6")]
    pub oci: Option<OciSpec>,
}

/// A view of the OCI runtime spec.
#[derive(Clone, PartialEq, prost::Message)]
pub struct OciSpec {
    /// The container mounts.
    #[prost(message, repeated, tag = "5")]
    pub mounts: Vec<Mount>,

    /// The container annotations.
    #[prost(map = "string, string", tag = "7")]
    pub annotations: HashMap<String, String>,

    /// The Linux-specific section.
    #[prost(message, optional, tag = "8")]
    pub linux: Option<Linux>,
}

/// A view of an OCI mount.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Mount {
    /// The mount point inside the container.
    #[prost(string, tag = "1")]
    pub destination: String,

    /// The mount source.
    #[prost(string, tag = "2")]
    pub source: String,

    /// The mount type.
    #[prost(string, tag = "3")]
    pub r#type: String,
}

/// A view of the Linux section of the OCI spec.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Linux {
    /// The namespaces the container joins or creates.
    #[prost(message, repeated, tag = "6")]
    pub namespaces: Vec<LinuxNamespace>,
}

/// A Linux namespace of the OCI spec.
#[derive(Clone, PartialEq, prost::Message)]
pub struct LinuxNamespace {
    /// The namespace type, e.g. `network`.
    #[prost(string, tag = "1")]
    pub r#type: String,

    /// The path of an existing namespace to join.
    #[prost(string, tag = "2")]
    pub path: String,
}

/// A view of an agent storage.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Storage {
    /// The storage driver.
    #[prost(string, tag = "1")]
    pub driver: String,

    /// The storage source.
    #[prost(string, tag = "3")]
    pub source: String,

    /// The filesystem type.
    #[prost(string, tag = "4")]
    pub fstype: String,

    /// Where the storage is mounted in the guest.
    #[prost(string, tag = "6")]
    pub mount_point: String,
}

/// A view of `CreateSandboxRequest`.
#[derive(Clone, PartialEq, prost::Message)]
pub struct CreateSandboxRequest {
    /// The sandbox hostname.
    #[prost(string, tag = "1")]
    pub hostname: String,

    /// The DNS entries for the guest's resolver config.
    #[prost(string, repeated, tag = "2")]
    pub dns: Vec<String>,

    /// The storages mounted for the sandbox.
    #[prost(message, repeated, tag = "3")]
    pub storages: Vec<Storage>,

    /// The sandbox id.
    #[prost(string, tag = "5")]
    pub sandbox_id: String,
}

/// A request that names a container, e.g. `StartContainerRequest`.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ContainerRequest {
    /// The container id.
    #[prost(string, tag = "1")]
    pub container_id: String,
}

/// `SetPolicyRequest`.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SetPolicyRequest {
    /// The policy document.
    #[prost(string, tag = "1")]
    pub policy: String,
}

/// `PullImageRequest`.
#[derive(Clone, PartialEq, prost::Message)]
pub struct PullImageRequest {
    /// The image reference.
    #[prost(string, tag = "1")]
    pub image: String,

    /// The container the image is pulled for.
    #[prost(string, tag = "2")]
    pub container_id: String,
}

/// `PullImageResponse`.
#[derive(Clone, PartialEq, prost::Message)]
pub struct PullImageResponse {
    /// The resolved image reference.
    #[prost(string, tag = "1")]
    pub image_ref: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl CreateContainerRequest {
    /// The container mounts, empty when the request carries no OCI spec.
    pub fn mounts(&self) -> &[Mount] {
        self.oci.as_ref().map_or(&[], |oci| oci.mounts.as_slice())
    }

    /// The value of an OCI annotation.
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.oci
            .as_ref()
            .and_then(|oci| oci.annotations.get(key))
            .map(String::as_str)
    }
}
