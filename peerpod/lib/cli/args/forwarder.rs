use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;

use crate::{
    cli::styles,
    config::{
        DEFAULT_AGENT_SOCKET_PATH, DEFAULT_FORWARDER_PORT, DEFAULT_PODVM_CONFIG_PATH,
        DEFAULT_PODVM_NAMESPACE_PATH,
    },
    tls::TlsConfig,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// `podvm-forwarder` relays the agent protocol from the worker node to the agent of this pod VM
#[derive(Debug, Parser)]
#[command(name = "podvm-forwarder", author, about, version, styles=styles::styles())]
pub struct ForwarderArgs {
    /// The daemon configuration written by the worker node
    #[arg(short, long, env = "PODVM_CONFIG", value_name = "PATH", default_value_os_t = DEFAULT_PODVM_CONFIG_PATH.clone())]
    pub config: PathBuf,

    /// Listen address
    #[arg(long, env = "PODVM_LISTEN", default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_FORWARDER_PORT)))]
    pub listen: SocketAddr,

    /// Socket of the agent
    #[arg(long, env = "KATA_AGENT_SOCKET", value_name = "PATH", default_value_os_t = DEFAULT_AGENT_SOCKET_PATH.clone())]
    pub kata_agent_socket: PathBuf,

    /// Network namespace the containers of the pod run in
    #[arg(long, env = "KATA_AGENT_NAMESPACE", value_name = "PATH", default_value_os_t = DEFAULT_PODVM_NAMESPACE_PATH.clone())]
    pub kata_agent_namespace: PathBuf,

    /// Interface carrying the tunnel traffic. Defaults to the primary interface
    #[arg(long, env = "HOST_INTERFACE")]
    pub host_interface: Option<String>,

    /// CA certificate file the worker's client certificate is verified with
    #[arg(long = "ca-cert-file", env = "CACERT_FILE", value_name = "PATH")]
    pub ca_cert_file: Option<PathBuf>,

    /// Server certificate file
    #[arg(long, env = "CERT_FILE", value_name = "PATH")]
    pub cert_file: Option<PathBuf>,

    /// Server key file
    #[arg(long = "cert-key", env = "CERT_KEY", value_name = "PATH")]
    pub cert_key: Option<PathBuf>,

    /// Serve plain TCP. Testing only
    #[arg(long, env = "DISABLE_TLS")]
    pub disable_tls: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ForwarderArgs {
    /// The TLS settings of the listener, or `None` when TLS is disabled.
    ///
    /// Material not given here is completed from the daemon configuration.
    pub fn tls_config(&self) -> Option<TlsConfig> {
        if self.disable_tls {
            return None;
        }
        Some(TlsConfig {
            ca_file: self.ca_cert_file.clone(),
            cert_file: self.cert_file.clone(),
            key_file: self.cert_key.clone(),
            ..Default::default()
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
