use std::{path::PathBuf, time::Duration};

use clap::Parser;

use crate::{
    cli::styles, config::ServerConfig, tls::TlsConfig, tunneler::TunnelType, PeerpodResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// `peerpod-adaptor` runs pod sandboxes of this node on remote cloud VMs
#[derive(Debug, Default, Parser)]
#[command(name = "peerpod-adaptor", author, about, version, styles=styles::styles())]
pub struct AdaptorArgs {
    /// A TOML configuration file. Flags override its values
    #[arg(short, long, env = "PEERPOD_CONFIG", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Unix domain socket of the remote hypervisor service
    #[arg(long, env = "PEERPOD_SOCKET", value_name = "PATH")]
    pub socket: Option<PathBuf>,

    /// Base directory of the sandbox directories
    #[arg(long, env = "PEERPOD_PODS_DIR", value_name = "PATH")]
    pub pods_dir: Option<PathBuf>,

    /// Image pulled for sandbox containers
    #[arg(long, env = "PAUSE_IMAGE")]
    pub pause_image: Option<String>,

    /// Port of the agent protocol forwarder in the pod VMs
    #[arg(long, env = "FORWARDER_PORT")]
    pub forwarder_port: Option<u16>,

    /// Seconds the agent proxy keeps dialing a pod VM
    #[arg(long, env = "PROXY_TIMEOUT", value_name = "SECONDS")]
    pub proxy_timeout: Option<u64>,

    /// Maximum number of sandboxes on this node, 0 for no limit
    #[arg(long = "peerpods-limit-per-node", env = "PEERPODS_LIMIT_PER_NODE")]
    pub peer_pods_limit_per_node: Option<usize>,

    /// Name of the cloud provider
    #[arg(long, env = "CLOUD_PROVIDER")]
    pub provider: Option<String>,

    /// Pre-provisioned VMs of the pool provider, as addresses or `first-last` ranges
    #[arg(long, env = "POOL_IPS", value_delimiter = ',')]
    pub pool_ips: Vec<String>,

    /// Directory through which pool VMs receive their user data
    #[arg(long, env = "POOL_USER_DATA_DIR", value_name = "PATH")]
    pub pool_user_data_dir: Option<PathBuf>,

    /// Tunnel between the worker and the pod VMs
    #[arg(long, env = "TUNNEL_TYPE")]
    pub tunnel_type: Option<TunnelType>,

    /// Host interface carrying the tunnel traffic
    #[arg(long, env = "HOST_INTERFACE")]
    pub host_interface: Option<String>,

    /// VXLAN UDP port
    #[arg(long, env = "VXLAN_PORT")]
    pub vxlan_port: Option<u16>,

    /// Lowest VXLAN id handed to a pod
    #[arg(long, env = "VXLAN_MIN_ID")]
    pub vxlan_min_id: Option<u32>,

    /// Route external traffic of the pods through a secondary pod VM interface
    #[arg(long = "ext-network-via-podvm", env = "EXT_NETWORK_VIA_PODVM")]
    pub external_network_via_podvm: bool,

    /// Comma separated CIDRs of local pod subnets
    #[arg(long, env = "POD_SUBNET_CIDRS", value_delimiter = ',')]
    pub pod_subnet_cidrs: Vec<String>,

    /// CA certificate file of the pod VM connections
    #[arg(long = "ca-cert-file", env = "CACERT_FILE", value_name = "PATH")]
    pub ca_cert_file: Option<PathBuf>,

    /// Client certificate file of the pod VM connections
    #[arg(long, env = "CERT_FILE", value_name = "PATH")]
    pub cert_file: Option<PathBuf>,

    /// Client key file of the pod VM connections
    #[arg(long = "cert-key", env = "CERT_KEY", value_name = "PATH")]
    pub cert_key: Option<PathBuf>,

    /// Skip verification of pod VM certificates. Testing only
    #[arg(long, env = "TLS_SKIP_VERIFY")]
    pub tls_skip_verify: bool,

    /// Connect to pod VMs without TLS. Testing only
    #[arg(long, env = "DISABLE_TLS")]
    pub disable_tls: bool,

    /// Default initdata of pods that do not carry their own
    #[arg(long, env = "INITDATA")]
    pub initdata: Option<String>,

    /// Attestation key broker parameters, as `<kbc>::<url>`
    #[arg(long, env = "AA_KBC_PARAMS")]
    pub aa_kbc_params: Option<String>,

    /// Registry auth file shipped to the pod VMs
    #[arg(long, env = "AUTH_JSON_PATH", value_name = "PATH")]
    pub auth_json_path: Option<PathBuf>,

    /// Directory of direct-assigned CSI volumes
    #[arg(long, env = "DIRECT_VOLUMES_DIR", value_name = "PATH")]
    pub direct_volumes_dir: Option<PathBuf>,

    /// Verify the provider configuration at startup
    #[arg(long = "cloud-config-verify", env = "CLOUD_CONFIG_VERIFY")]
    pub enable_cloud_config_verify: bool,

    /// Give pod VMs a scratch disk
    #[arg(long = "enable-scratch-disk", env = "ENABLE_SCRATCH_DISK")]
    pub enable_scratch_space: bool,

    /// Encrypt the scratch disk of pod VMs
    #[arg(long, env = "ENABLE_SCRATCH_ENCRYPTION")]
    pub enable_scratch_encryption: bool,

    /// Pull container images through the agent before creating containers
    #[arg(long, env = "PULL_IMAGE_BEFORE_CREATE")]
    pub pull_image_before_create: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl AdaptorArgs {
    /// Builds the adaptor configuration: the `--config` file or the defaults, overridden by every
    /// flag given.
    pub async fn server_config(&self) -> PeerpodResult<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path).await?,
            None => ServerConfig::default(),
        };
        self.apply(&mut config);
        Ok(config)
    }

    /// Overrides `config` with the flags given.
    pub fn apply(&self, config: &mut ServerConfig) {
        if let Some(socket) = &self.socket {
            config.set_socket_path(socket.clone());
        }
        if let Some(pods_dir) = &self.pods_dir {
            config.set_pods_dir(pods_dir.clone());
        }
        if let Some(image) = &self.pause_image {
            config.set_pause_image(image.clone());
        }
        if let Some(port) = self.forwarder_port {
            config.set_forwarder_port(port);
        }
        if let Some(secs) = self.proxy_timeout {
            config.set_proxy_timeout(Duration::from_secs(secs));
        }
        if let Some(limit) = self.peer_pods_limit_per_node {
            config.set_peer_pods_limit_per_node(limit);
        }
        if let Some(provider) = &self.provider {
            config.set_provider(provider.clone());
        }
        if let Some(initdata) = &self.initdata {
            config.set_initdata(Some(initdata.clone()));
        }
        if let Some(params) = &self.aa_kbc_params {
            config.set_aa_kbc_params(Some(params.clone()));
        }
        if let Some(path) = &self.auth_json_path {
            config.set_auth_json_path(Some(path.clone()));
        }
        if let Some(dir) = &self.direct_volumes_dir {
            config.set_direct_volumes_dir(dir.clone());
        }
        if self.enable_cloud_config_verify {
            config.set_enable_cloud_config_verify(true);
        }
        if self.enable_scratch_space {
            config.set_enable_scratch_space(true);
        }
        if self.enable_scratch_encryption {
            config.set_enable_scratch_encryption(true);
        }
        if self.pull_image_before_create {
            config.set_pull_image_before_create(true);
        }

        let mut pool = config.get_pool().clone();
        if !self.pool_ips.is_empty() {
            pool.set_vm_pool_ips(self.pool_ips.clone());
        }
        if let Some(dir) = &self.pool_user_data_dir {
            pool.set_user_data_dir(Some(dir.clone()));
        }
        config.set_pool(pool);

        let mut network = config.get_network().clone();
        if let Some(tunnel_type) = self.tunnel_type {
            network.set_tunnel_type(tunnel_type);
        }
        if let Some(interface) = &self.host_interface {
            network.set_host_interface(Some(interface.clone()));
        }
        if let Some(port) = self.vxlan_port {
            network.set_vxlan_port(port);
        }
        if let Some(id) = self.vxlan_min_id {
            network.set_vxlan_min_id(id);
        }
        if self.external_network_via_podvm {
            network.set_external_network_via_podvm(true);
        }
        if !self.pod_subnet_cidrs.is_empty() {
            network.set_pod_subnet_cidrs(self.pod_subnet_cidrs.clone());
        }
        config.set_network(network);

        if self.disable_tls {
            config.set_tls_config(None);
            return;
        }

        let mut tls = config.get_tls_config().clone().unwrap_or_default();
        if let Some(path) = &self.ca_cert_file {
            tls.ca_file = Some(path.clone());
        }
        if let Some(path) = &self.cert_file {
            tls.cert_file = Some(path.clone());
        }
        if let Some(path) = &self.cert_key {
            tls.key_file = Some(path.clone());
        }
        if self.tls_skip_verify {
            tls.skip_verify = true;
        }
        config.set_tls_config(Some(tls));
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
