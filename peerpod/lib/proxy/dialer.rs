use std::{net::SocketAddr, time::Duration};

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{info, warn};

use crate::{
    agent::{AgentStream, Dialer},
    tls::TlsConfig,
    utils::{self, retry_until, ExponentialBackoff},
    PeerpodError, PeerpodResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The server name expected in pod VM certificates that were not issued by the adaptor's CA.
pub const PODVM_SERVER_NAME: &str = "podvm-server";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Dials the forwarder of a pod VM over TCP, optionally wrapped in TLS, retrying until the
/// connection succeeds or the proxy timeout has passed.
pub struct PodVmDialer {
    address: SocketAddr,
    tls: Option<(TlsConnector, ServerName<'static>)>,
    timeout: Duration,
    backoff: ExponentialBackoff,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl PodVmDialer {
    /// Creates a plain TCP dialer.
    pub fn new(address: SocketAddr, timeout: Duration) -> Self {
        Self {
            address,
            tls: None,
            timeout,
            backoff: utils::default_policy(),
        }
    }

    /// Wraps connections in TLS, verifying the pod VM certificate against `server_name`.
    pub async fn with_tls(mut self, config: &TlsConfig, server_name: &str) -> PeerpodResult<Self> {
        let client_config = config.client_config().await?;
        let server_name = ServerName::try_from(server_name.to_string()).map_err(|e| {
            PeerpodError::InvalidInput(format!("invalid server name {server_name}: {e}"))
        })?;
        self.tls = Some((TlsConnector::from(client_config), server_name));
        Ok(self)
    }

    /// Overrides the delays between dial attempts.
    pub fn with_backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    async fn dial_once(&self) -> PeerpodResult<Box<dyn AgentStream>> {
        let tcp = TcpStream::connect(self.address)
            .await
            .inspect_err(|e| warn!(address = %self.address, error = %e, "retrying failed agent proxy connection"))?;
        tcp.set_nodelay(true)?;

        match &self.tls {
            Some((connector, server_name)) => {
                let tls = connector.connect(server_name.clone(), tcp).await?;
                Ok(Box::new(tls))
            }
            None => Ok(Box::new(tcp)),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl Dialer for PodVmDialer {
    async fn dial(&self) -> PeerpodResult<Box<dyn AgentStream>> {
        info!(address = %self.address, "establishing agent proxy connection");
        let stream = retry_until(
            "agent proxy connection",
            self.timeout,
            self.backoff.clone(),
            move || self.dial_once(),
        )
        .await?;
        info!(address = %self.address, "established agent proxy connection");
        Ok(stream)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
