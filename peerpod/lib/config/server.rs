use std::{path::PathBuf, time::Duration};

use getset::{Getters, Setters};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use typed_builder::TypedBuilder;

use crate::{provider::PoolConfig, tls::TlsConfig, PeerpodResult};

use super::{
    WorkerNetworkConfig, DEFAULT_DIRECT_VOLUMES_DIR, DEFAULT_FORWARDER_PORT, DEFAULT_PAUSE_IMAGE,
    DEFAULT_PEER_PODS_LIMIT_PER_NODE, DEFAULT_PODS_DIR, DEFAULT_PROXY_TIMEOUT,
    DEFAULT_SOCKET_PATH,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The configuration of the worker-side adaptor daemon.
///
/// Values can be loaded from a TOML file with [`ServerConfig::load`]; every field has a default so a
/// partial file is enough.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder, Getters, Setters)]
#[getset(get = "pub with_prefix", set = "pub")]
#[serde(rename_all = "kebab-case", default)]
pub struct ServerConfig {
    /// The unix socket the hypervisor service listens on.
    #[builder(default = DEFAULT_SOCKET_PATH.clone(), setter(into))]
    pub(super) socket_path: PathBuf,

    /// The directory holding one sub-directory per sandbox.
    #[builder(default = DEFAULT_PODS_DIR.clone(), setter(into))]
    pub(super) pods_dir: PathBuf,

    /// The image pulled for sandbox containers.
    #[builder(default = DEFAULT_PAUSE_IMAGE.to_string(), setter(into))]
    pub(super) pause_image: String,

    /// The TCP port the pod-VM forwarder listens on.
    #[builder(default = DEFAULT_FORWARDER_PORT)]
    pub(super) forwarder_port: u16,

    /// TLS settings for the connection to the pod VM. `None` disables TLS.
    #[builder(default, setter(strip_option))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(super) tls_config: Option<TlsConfig>,

    /// How long the agent proxy keeps dialing the pod VM.
    #[builder(default = DEFAULT_PROXY_TIMEOUT)]
    #[serde(
        serialize_with = "serialize_duration_secs",
        deserialize_with = "deserialize_duration_secs"
    )]
    pub(super) proxy_timeout: Duration,

    /// The maximum number of live sandboxes. Zero means unlimited.
    #[builder(default = DEFAULT_PEER_PODS_LIMIT_PER_NODE)]
    pub(super) peer_pods_limit_per_node: usize,

    /// Whether the provider configuration is verified at startup.
    #[builder(default)]
    pub(super) enable_cloud_config_verify: bool,

    /// Whether the pod VM gets a scratch disk.
    #[builder(default)]
    pub(super) enable_scratch_space: bool,

    /// Whether the scratch disk is encrypted. Implies `enable_scratch_space`.
    #[builder(default)]
    pub(super) enable_scratch_encryption: bool,

    /// The base64 initdata document used when a pod does not carry its own.
    #[builder(default, setter(strip_option, into))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(super) initdata: Option<String>,

    /// The attestation key broker parameters, formatted as `<kbc>::<url>`.
    #[builder(default, setter(strip_option, into))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(super) aa_kbc_params: Option<String>,

    /// A registry auth file shipped to the pod VM.
    #[builder(default, setter(strip_option, into))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(super) auth_json_path: Option<PathBuf>,

    /// The directory the kubelet uses for direct-assigned CSI volumes.
    #[builder(default = DEFAULT_DIRECT_VOLUMES_DIR.clone(), setter(into))]
    pub(super) direct_volumes_dir: PathBuf,

    /// Whether images are pulled through the agent before containers are created.
    #[builder(default)]
    pub(super) pull_image_before_create: bool,

    /// The provider name looked up in the provider registry.
    #[builder(default = "pool".to_string(), setter(into))]
    pub(super) provider: String,

    /// The settings of the `pool` provider.
    #[builder(default)]
    pub(super) pool: PoolConfig,

    /// The worker-side tunnel settings.
    #[builder(default)]
    pub(super) network: WorkerNetworkConfig,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ServerConfig {
    /// Loads a configuration from a TOML file.
    pub async fn load(path: impl Into<PathBuf>) -> PeerpodResult<Self> {
        let content = tokio::fs::read_to_string(path.into()).await?;
        Ok(toml::from_str(&content)?)
    }

    /// Whether the pod VM gets a scratch disk, taking encryption into account.
    pub fn scratch_disk_enabled(&self) -> bool {
        self.enable_scratch_space || self.enable_scratch_encryption
    }

    /// Returns a mutable reference to the TLS settings.
    pub fn tls_config_mut(&mut self) -> Option<&mut TlsConfig> {
        self.tls_config.as_mut()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn serialize_duration_secs<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_secs())
}

fn deserialize_duration_secs<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Duration::from_secs(u64::deserialize(deserializer)?))
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for ServerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::io::Write;

    use crate::tunneler::TunnelType;

    use super::*;

    #[test]
    fn test_server_config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.get_socket_path(), &PathBuf::from("/run/peerpod/hypervisor.sock"));
        assert_eq!(config.get_pods_dir(), &PathBuf::from("/run/peerpod/pods"));
        assert_eq!(*config.get_forwarder_port(), 15150);
        assert_eq!(*config.get_proxy_timeout(), Duration::from_secs(300));
        assert_eq!(*config.get_peer_pods_limit_per_node(), 10);
        assert!(config.get_tls_config().is_none());
        assert!(!config.scratch_disk_enabled());
    }

    #[test]
    fn test_server_config_scratch_encryption_implies_disk() {
        let config = ServerConfig::builder().enable_scratch_encryption(true).build();
        assert!(config.scratch_disk_enabled());
    }

    #[tokio::test]
    async fn test_server_config_load_partial_toml() -> anyhow::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(
            file,
            r#"
            pods-dir = "/tmp/pods"
            proxy-timeout = 30
            peer-pods-limit-per-node = 0

            [network]
            tunnel-type = "routing"
            "#
        )?;

        let config = ServerConfig::load(file.path()).await?;
        assert_eq!(config.get_pods_dir(), &PathBuf::from("/tmp/pods"));
        assert_eq!(*config.get_proxy_timeout(), Duration::from_secs(30));
        assert_eq!(*config.get_peer_pods_limit_per_node(), 0);
        assert_eq!(config.get_network().get_tunnel_type(), &TunnelType::Routing);
        assert_eq!(config.get_pause_image(), DEFAULT_PAUSE_IMAGE);
        Ok(())
    }
}
