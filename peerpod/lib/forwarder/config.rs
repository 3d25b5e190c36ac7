use std::path::Path;

use getset::Getters;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{tls::TlsConfig, tunneler::NetworkConfig, PeerpodResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The per-sandbox settings the worker hands to the pod VM forwarder.
///
/// The worker writes it as `daemon.json` into the sandbox directory and into the pod VM's user
/// data; the forwarder reads it at boot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
#[serde(rename_all = "kebab-case")]
pub struct DaemonConfig {
    /// The pod network to rebuild in the pod VM.
    #[builder(default, setter(strip_option))]
    pod_network: Option<NetworkConfig>,

    /// The pod's Kubernetes namespace.
    #[builder(setter(into))]
    pod_namespace: String,

    /// The pod's name.
    #[builder(setter(into))]
    pod_name: String,

    /// The PEM key of the forwarder's server certificate.
    #[builder(default, setter(into))]
    #[serde(default, skip_serializing_if = "String::is_empty")]
    tls_server_key: String,

    /// The PEM server certificate of the forwarder.
    #[builder(default, setter(into))]
    #[serde(default, skip_serializing_if = "String::is_empty")]
    tls_server_cert: String,

    /// The PEM certificates the forwarder requires from the worker.
    #[builder(default, setter(into))]
    #[serde(default, skip_serializing_if = "String::is_empty")]
    tls_client_ca: String,

    /// Whether the pod VM sets up a scratch disk.
    #[builder(default)]
    #[serde(default)]
    enable_scratch_disk: bool,

    /// Whether the scratch disk is encrypted.
    #[builder(default)]
    #[serde(default)]
    enable_scratch_encryption: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DaemonConfig {
    /// Reads a config from a JSON file.
    pub async fn load(path: impl AsRef<Path>) -> PeerpodResult<Self> {
        let content = tokio::fs::read(path.as_ref()).await?;
        Ok(serde_json::from_slice(&content)?)
    }

    /// Serializes the config the way it is written to disk.
    pub fn to_json(&self) -> PeerpodResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Completes the forwarder's TLS settings with the material the worker issued.
    ///
    /// Material configured on the pod VM itself takes precedence.
    pub fn apply_tls(&self, tls: &mut TlsConfig) {
        if !tls.has_cert_auth() {
            tls.cert_data = Some(self.tls_server_cert.clone());
            tls.key_data = Some(self.tls_server_key.clone());
        }
        if !tls.has_ca() {
            tls.ca_data = Some(self.tls_client_ca.clone());
        }
    }

    /// Whether the worker issued TLS material for the forwarder.
    pub fn has_tls(&self) -> bool {
        !self.tls_server_cert.is_empty() && !self.tls_server_key.is_empty()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daemon_config_json_keys() -> anyhow::Result<()> {
        let config = DaemonConfig::builder()
            .pod_namespace("default")
            .pod_name("nginx")
            .tls_server_cert("CERT")
            .tls_server_key("KEY")
            .enable_scratch_disk(true)
            .build();

        let json = serde_json::to_value(&config)?;
        assert_eq!(json["pod-namespace"], "default");
        assert_eq!(json["pod-name"], "nginx");
        assert_eq!(json["tls-server-cert"], "CERT");
        assert_eq!(json["tls-server-key"], "KEY");
        assert!(json.get("tls-client-ca").is_none());
        assert_eq!(json["enable-scratch-disk"], true);
        assert_eq!(json["pod-network"], serde_json::Value::Null);

        let parsed: DaemonConfig = serde_json::from_str(&config.to_json()?)?;
        assert_eq!(parsed, config);
        Ok(())
    }

    #[tokio::test]
    async fn test_daemon_config_load_minimal() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("daemon.json");
        tokio::fs::write(&path, r#"{"pod-namespace": "ns", "pod-name": "pod"}"#).await?;

        let config = DaemonConfig::load(&path).await?;
        assert_eq!(config.get_pod_name(), "pod");
        assert!(config.get_pod_network().is_none());
        assert!(!config.has_tls());
        Ok(())
    }

    #[test]
    fn test_apply_tls_prefers_local_material() {
        let config = DaemonConfig::builder()
            .pod_namespace("ns")
            .pod_name("pod")
            .tls_server_cert("CERT")
            .tls_server_key("KEY")
            .tls_client_ca("CA")
            .build();

        let mut issued = TlsConfig::default();
        config.apply_tls(&mut issued);
        assert_eq!(issued.cert_data.as_deref(), Some("CERT"));
        assert_eq!(issued.key_data.as_deref(), Some("KEY"));
        assert_eq!(issued.ca_data.as_deref(), Some("CA"));

        let mut local = TlsConfig::builder()
            .cert_file("/etc/forwarder/cert.pem")
            .key_file("/etc/forwarder/key.pem")
            .ca_file("/etc/forwarder/ca.pem")
            .build();
        config.apply_tls(&mut local);
        assert!(local.cert_data.is_none());
        assert!(local.ca_data.is_none());
    }
}
