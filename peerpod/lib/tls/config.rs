use std::{path::PathBuf, sync::Arc};

use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{ring, CryptoProvider},
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
    server::WebPkiClientVerifier,
    DigitallySignedStruct, RootCertStore, SignatureScheme,
};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{PeerpodError, PeerpodResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// TLS settings for the connection between the worker and the pod VM.
///
/// PEM data given inline supersedes the corresponding file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "kebab-case", default)]
pub struct TlsConfig {
    /// The PEM file of the trusted root certificates of the peer.
    #[builder(default, setter(strip_option, into))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<PathBuf>,

    /// The PEM file of the own certificate chain.
    #[builder(default, setter(strip_option, into))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_file: Option<PathBuf>,

    /// The PEM file of the own private key.
    #[builder(default, setter(strip_option, into))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,

    /// Accept any peer certificate. For testing only.
    #[builder(default)]
    pub skip_verify: bool,

    /// The PEM data of the trusted root certificates of the peer.
    #[builder(default, setter(strip_option, into))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_data: Option<String>,

    /// The PEM data of the own certificate chain.
    #[builder(default, setter(strip_option, into))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_data: Option<String>,

    /// The PEM data of the own private key.
    #[builder(default, setter(strip_option, into))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_data: Option<String>,
}

/// Accepts every server certificate.
#[derive(Debug)]
struct SkipServerVerification {
    provider: Arc<CryptoProvider>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl TlsConfig {
    /// Whether trusted roots are configured.
    pub fn has_ca(&self) -> bool {
        is_set(&self.ca_data) || self.ca_file.is_some()
    }

    /// Whether an own certificate and key are configured.
    pub fn has_cert_auth(&self) -> bool {
        (is_set(&self.cert_data) || self.cert_file.is_some())
            && (is_set(&self.key_data) || self.key_file.is_some())
    }

    /// The trusted roots as PEM, if any.
    pub async fn ca_pem(&self) -> PeerpodResult<Option<String>> {
        data_or_file(&self.ca_data, &self.ca_file).await
    }

    /// The own certificate chain as PEM, if any.
    pub async fn cert_pem(&self) -> PeerpodResult<Option<String>> {
        data_or_file(&self.cert_data, &self.cert_file).await
    }

    /// Builds the client side configuration used to dial the pod VM.
    ///
    /// The server is verified against the configured roots unless `skip_verify` is set; the own
    /// certificate, when configured, is presented for mutual authentication.
    pub async fn client_config(&self) -> PeerpodResult<Arc<rustls::ClientConfig>> {
        if self.has_ca() && self.skip_verify {
            return Err(PeerpodError::InvalidInput(
                "specifying root certificates together with skip-verify is not allowed".into(),
            ));
        }

        let provider = crypto_provider();
        let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?;

        let builder = if self.skip_verify {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(SkipServerVerification { provider }))
        } else {
            let pem = self.ca_pem().await?.ok_or_else(|| {
                PeerpodError::InvalidInput("no root certificates to verify the pod VM with".into())
            })?;
            builder.with_root_certificates(root_store(&pem)?)
        };

        let config = match self.identity().await? {
            Some((chain, key)) => builder.with_client_auth_cert(chain, key)?,
            None => builder.with_no_client_auth(),
        };

        Ok(Arc::new(config))
    }

    /// Builds the server side configuration of the pod VM listener.
    ///
    /// Client certificates are required and verified when roots are configured.
    pub async fn server_config(&self) -> PeerpodResult<Arc<rustls::ServerConfig>> {
        let (chain, key) = self.identity().await?.ok_or_else(|| {
            PeerpodError::InvalidInput("a server certificate and key are required".into())
        })?;

        let provider = crypto_provider();
        let builder = rustls::ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?;

        let builder = match self.ca_pem().await? {
            Some(pem) => {
                let verifier =
                    WebPkiClientVerifier::builder_with_provider(Arc::new(root_store(&pem)?), provider)
                        .build()
                        .map_err(|e| {
                            PeerpodError::InvalidInput(format!("invalid client roots: {e}"))
                        })?;
                builder.with_client_cert_verifier(verifier)
            }
            None => builder.with_no_client_auth(),
        };

        Ok(Arc::new(builder.with_single_cert(chain, key)?))
    }

    async fn identity(
        &self,
    ) -> PeerpodResult<Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>> {
        if !self.has_cert_auth() {
            return Ok(None);
        }

        let cert_pem = data_or_file(&self.cert_data, &self.cert_file)
            .await?
            .unwrap_or_default();
        let key_pem = data_or_file(&self.key_data, &self.key_file)
            .await?
            .unwrap_or_default();

        Ok(Some((certificates(&cert_pem)?, private_key(&key_pem)?)))
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// The crypto provider of every TLS configuration built here.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

/// Parses every certificate of a PEM document.
pub fn certificates(pem: &str) -> PeerpodResult<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut pem.as_bytes()).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(PeerpodError::InvalidInput(
            "no certificate found in PEM data".into(),
        ));
    }
    Ok(certs)
}

/// Parses the first private key of a PEM document.
pub fn private_key(pem: &str) -> PeerpodResult<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut pem.as_bytes())?
        .ok_or_else(|| PeerpodError::InvalidInput("no private key found in PEM data".into()))
}

fn root_store(pem: &str) -> PeerpodResult<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in certificates(pem)? {
        roots.add(cert)?;
    }
    Ok(roots)
}

fn is_set(data: &Option<String>) -> bool {
    data.as_deref().is_some_and(|d| !d.is_empty())
}

async fn data_or_file(data: &Option<String>, file: &Option<PathBuf>) -> PeerpodResult<Option<String>> {
    if let Some(data) = data.as_ref().filter(|d| !d.is_empty()) {
        return Ok(Some(data.clone()));
    }
    match file {
        Some(path) => Ok(Some(tokio::fs::read_to_string(path).await?)),
        None => Ok(None),
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
