use std::{path::PathBuf, sync::Arc, time::Duration};

use tracing::info;

use crate::{
    config::ServerConfig,
    tls::{new_client_certificate, CaService, TlsConfig},
    PeerpodResult,
};

use super::AgentProxy;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The name of the authority issuing pod VM server certificates.
pub const CA_SERVICE_NAME: &str = "agent-protocol-forwarder";

/// The name of the worker's client certificate.
pub const CLIENT_CERTIFICATE_NAME: &str = "cloud-api-adaptor";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Creates the [`AgentProxy`] of each sandbox with the worker-wide proxy settings.
///
/// When TLS is enabled without an operator supplied CA, the factory owns a [`CaService`] that
/// issues every pod VM a server certificate, and a generated client certificate the pod VMs are
/// told to require.
#[derive(Debug, Clone)]
pub struct ProxyFactory {
    pub(super) tls: Option<TlsConfig>,
    pub(super) ca_service: Option<Arc<CaService>>,
    pub(super) pause_image: String,
    pub(super) direct_volumes_dir: PathBuf,
    pub(super) pull_image_before_create: bool,
    pub(super) proxy_timeout: Duration,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ProxyFactory {
    /// Creates a factory from the adaptor configuration, bootstrapping the TLS material it lacks.
    pub fn new(config: &ServerConfig) -> PeerpodResult<Self> {
        let mut tls = config.get_tls_config().clone();
        let mut ca_service = None;

        if let Some(tls) = tls.as_mut().filter(|tls| !tls.has_ca()) {
            info!("no CA configured for pod VM connections, creating one");
            let service = CaService::new(CA_SERVICE_NAME)?;
            tls.ca_data = Some(service.root_certificate());

            if !tls.has_cert_auth() {
                info!("no client certificate configured, generating one");
                let client = new_client_certificate(CLIENT_CERTIFICATE_NAME)?;
                tls.cert_data = Some(client.cert_pem);
                tls.key_data = Some(client.key_pem);
            }

            ca_service = Some(Arc::new(service));
        }

        Ok(Self {
            tls,
            ca_service,
            pause_image: config.get_pause_image().clone(),
            direct_volumes_dir: config.get_direct_volumes_dir().clone(),
            pull_image_before_create: *config.get_pull_image_before_create(),
            proxy_timeout: *config.get_proxy_timeout(),
        })
    }

    /// Creates the proxy of one sandbox. `server_name` is the pod VM's instance name.
    pub fn create(&self, server_name: impl Into<String>, socket_path: impl Into<PathBuf>) -> AgentProxy {
        AgentProxy::new(self.clone(), server_name.into(), socket_path.into())
    }

    /// The authority issuing pod VM server certificates, if the factory owns one.
    pub fn ca_service(&self) -> Option<&CaService> {
        self.ca_service.as_deref()
    }

    /// The client certificate chain the pod VMs must require, when they learn it from their
    /// user data.
    ///
    /// An operator supplied CA file means the pod VMs are provisioned out of band.
    pub fn client_ca(&self) -> Option<String> {
        let tls = self.tls.as_ref()?;
        if tls.ca_file.is_some() {
            return None;
        }
        tls.cert_data.clone()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
