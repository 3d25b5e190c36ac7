use chrono::{Datelike, Days, Utc};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};

use crate::PeerpodResult;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How long issued certificates stay valid.
pub const CERTIFICATE_VALIDITY_DAYS: u64 = 2 * 365;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A certificate authority that issues the pod VMs' server certificates.
///
/// The authority lives in memory only; its root is handed to the proxies as the pod VMs' trust
/// root and every pod VM receives a certificate issued for its instance name.
pub struct CaService {
    cert: Certificate,
    key: KeyPair,
}

/// A PEM encoded certificate chain and its private key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertifiedKey {
    /// The certificate chain, leaf first.
    pub cert_pem: String,

    /// The private key of the leaf.
    pub key_pem: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl CaService {
    /// Creates an authority with a fresh self-signed root named `name`.
    pub fn new(name: &str) -> PeerpodResult<Self> {
        let key = KeyPair::generate()?;
        let cert = ca_params(name)?.self_signed(&key)?;
        Ok(Self { cert, key })
    }

    /// The root certificate as PEM.
    pub fn root_certificate(&self) -> String {
        self.cert.pem()
    }

    /// Issues a server certificate for `server_name`.
    pub fn issue(&self, server_name: &str) -> PeerpodResult<CertifiedKey> {
        let key = KeyPair::generate()?;
        let mut params = CertificateParams::new(vec![server_name.to_string()])?;
        params.distinguished_name = common_name(server_name);
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        set_validity(&mut params);

        let cert = params.signed_by(&key, &self.cert, &self.key)?;
        Ok(CertifiedKey {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates a client identity named `name`.
///
/// The chain holds the client certificate followed by a private authority that signed it, so the
/// whole chain can serve as the pod VM's client trust root.
pub fn new_client_certificate(name: &str) -> PeerpodResult<CertifiedKey> {
    let ca_key = KeyPair::generate()?;
    let ca_cert = ca_params(&format!("{name} client CA"))?.self_signed(&ca_key)?;

    let key = KeyPair::generate()?;
    let mut params = CertificateParams::new(Vec::<String>::new())?;
    params.distinguished_name = common_name(name);
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
    set_validity(&mut params);
    let cert = params.signed_by(&key, &ca_cert, &ca_key)?;

    Ok(CertifiedKey {
        cert_pem: format!("{}{}", cert.pem(), ca_cert.pem()),
        key_pem: key.serialize_pem(),
    })
}

fn ca_params(name: &str) -> PeerpodResult<CertificateParams> {
    let mut params = CertificateParams::new(Vec::<String>::new())?;
    params.distinguished_name = common_name(name);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    set_validity(&mut params);
    Ok(params)
}

fn common_name(name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, name);
    dn
}

fn set_validity(params: &mut CertificateParams) {
    let today = Utc::now().date_naive();
    let start = today - Days::new(1);
    let end = today + Days::new(CERTIFICATE_VALIDITY_DAYS);
    params.not_before = rcgen::date_time_ymd(start.year(), start.month() as u8, start.day() as u8);
    params.not_after = rcgen::date_time_ymd(end.year(), end.month() as u8, end.day() as u8);
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl std::fmt::Debug for CaService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaService").finish_non_exhaustive()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use rustls::pki_types::ServerName;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
    };
    use tokio_rustls::{TlsAcceptor, TlsConnector};

    use crate::tls::{certificates, TlsConfig};

    use super::*;

    struct Peers {
        client: TlsConfig,
        server: TlsConfig,
    }

    fn peers(server_name: &str) -> anyhow::Result<Peers> {
        let ca = CaService::new("agent-protocol-forwarder")?;
        let client_identity = new_client_certificate("cloud-api-adaptor")?;
        let server_identity = ca.issue(server_name)?;

        let client = TlsConfig::builder()
            .ca_data(ca.root_certificate())
            .cert_data(client_identity.cert_pem.clone())
            .key_data(client_identity.key_pem)
            .build();
        let server = TlsConfig::builder()
            .ca_data(client_identity.cert_pem)
            .cert_data(server_identity.cert_pem)
            .key_data(server_identity.key_pem)
            .build();
        Ok(Peers { client, server })
    }

    async fn handshake(
        client: &TlsConfig,
        server: &TlsConfig,
        server_name: &str,
    ) -> anyhow::Result<(anyhow::Result<()>, anyhow::Result<()>)> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let acceptor = TlsAcceptor::from(server.server_config().await?);
        let server_task = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await?;
            let mut tls = acceptor.accept(tcp).await?;
            let mut buf = [0u8; 4];
            tls.read_exact(&mut buf).await?;
            tls.write_all(&buf).await?;
            tls.flush().await?;
            anyhow::Ok(())
        });

        let connector = TlsConnector::from(client.client_config().await?);
        let name = ServerName::try_from(server_name.to_string())?;
        let client_result = async {
            let tcp = TcpStream::connect(addr).await?;
            let mut tls = connector.connect(name, tcp).await?;
            tls.write_all(b"ping").await?;
            tls.flush().await?;
            let mut buf = [0u8; 4];
            tls.read_exact(&mut buf).await?;
            anyhow::ensure!(&buf == b"ping", "unexpected echo");
            anyhow::Ok(())
        }
        .await;

        let server_result = server_task.await?;
        Ok((client_result, server_result))
    }

    #[test]
    fn test_ca_service_issues_parseable_certificates() -> anyhow::Result<()> {
        let ca = CaService::new("agent-protocol-forwarder")?;
        assert!(ca.root_certificate().starts_with("-----BEGIN CERTIFICATE-----"));

        let issued = ca.issue("podvm-nginx-1a2b3c4d")?;
        assert_eq!(certificates(&issued.cert_pem)?.len(), 1);
        assert!(issued.key_pem.contains("PRIVATE KEY"));

        let client = new_client_certificate("cloud-api-adaptor")?;
        assert_eq!(certificates(&client.cert_pem)?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_mutual_tls_handshake() -> anyhow::Result<()> {
        let peers = peers("podvm-nginx-1a2b3c4d")?;
        let (client, server) =
            handshake(&peers.client, &peers.server, "podvm-nginx-1a2b3c4d").await?;
        client?;
        server?;
        Ok(())
    }

    #[tokio::test]
    async fn test_handshake_rejects_wrong_server_name() -> anyhow::Result<()> {
        let peers = peers("podvm-nginx-1a2b3c4d")?;
        let (client, _) = handshake(&peers.client, &peers.server, "podvm-other-00000000").await?;
        assert!(client.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_handshake_requires_client_certificate() -> anyhow::Result<()> {
        let peers = peers("podvm-nginx-1a2b3c4d")?;
        let anonymous = TlsConfig {
            cert_data: None,
            key_data: None,
            ..peers.client.clone()
        };
        let (_, server) = handshake(&anonymous, &peers.server, "podvm-nginx-1a2b3c4d").await?;
        assert!(server.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_skip_verify_accepts_unknown_server() -> anyhow::Result<()> {
        let peers = peers("podvm-nginx-1a2b3c4d")?;
        let server = TlsConfig {
            ca_data: None,
            ..peers.server
        };
        let client = TlsConfig::builder().skip_verify(true).build();
        let (client, server) = handshake(&client, &server, "anything").await?;
        client?;
        server?;
        Ok(())
    }
}
