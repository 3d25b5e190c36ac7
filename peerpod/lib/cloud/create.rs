use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio::fs;
use tracing::{debug, info, warn, Instrument};

use crate::{
    config::DEFAULT_PODVM_CONFIG_PATH,
    forwarder::DaemonConfig,
    proxy::AgentProxy,
    tunneler::NetworkConfig,
    utils::{agent_socket_path, daemon_config_path, sandbox_dir},
    PeerpodError, PeerpodResult,
};

use super::{
    aa_config, agent_config, annotations, cdh_config, initdata, CloudConfig, CloudService,
    Sandbox, AA_CONFIG_PATH, AGENT_CONFIG_PATH, AUTH_FILE_LIMIT, AUTH_FILE_PATH, CDH_CONFIG_PATH,
    INITDATA_PATH, INSTANCE_NAME_MAX,
};

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl CloudService {
    /// Registers a sandbox and returns the agent socket the container runtime connects to.
    ///
    /// Nothing is provisioned yet: the pod network is inspected, the pod VM's user data is
    /// rendered and the agent proxy is prepared. A failure leaves no sandbox behind.
    pub async fn create_vm(
        &self,
        sandbox_id: &str,
        annotations: &HashMap<String, String>,
        net_ns_path: &Path,
    ) -> PeerpodResult<PathBuf> {
        async {
            if sandbox_id.is_empty() {
                return Err(PeerpodError::InvalidInput("empty sandbox id".into()));
            }
            let pod_name = annotations::pod_name(annotations).ok_or_else(|| {
                PeerpodError::InvalidInput(format!(
                    "pod name {} is missing in annotations",
                    annotations::SANDBOX_NAME
                ))
            })?;
            let pod_namespace = annotations::pod_namespace(annotations).ok_or_else(|| {
                PeerpodError::InvalidInput(format!(
                    "namespace name {} is missing in annotations",
                    annotations::SANDBOX_NAMESPACE
                ))
            })?;

            self.check_admission(sandbox_id).await?;

            let network = self.network.inspect(net_ns_path).await.inspect_err(|e| {
                warn!(netns = %net_ns_path.display(), error = %e, "failed to inspect pod network")
            })?;

            let mut spec = annotations::instance_type_spec(annotations);
            spec.multi_nic = *network.get_external_net_via_pod_vm();

            let instance_name =
                annotations::instance_name(&pod_name, sandbox_id, INSTANCE_NAME_MAX);

            let pods_dir = self.config.get_pods_dir();
            let pod_dir = sandbox_dir(pods_dir, sandbox_id);
            fs::DirBuilder::new()
                .recursive(true)
                .mode(0o777)
                .create(&pod_dir)
                .await?;

            let socket_path = agent_socket_path(pods_dir, sandbox_id);
            let proxy = Arc::new(self.proxy_factory.create(&instance_name, &socket_path));

            let daemon_config =
                self.daemon_config(&proxy, network.clone(), &pod_namespace, &pod_name)?;
            let daemon_json = daemon_config.to_json()?;
            let daemon_json_path = daemon_config_path(pods_dir, sandbox_id);
            fs::write(&daemon_json_path, &daemon_json).await?;
            debug!(path = %daemon_json_path.display(), "stored daemon config");

            let user_data = self.user_data(daemon_json, annotations).await?.render()?;

            let sandbox = Sandbox::new(
                sandbox_id.to_string(),
                pod_name.clone(),
                pod_namespace.clone(),
                net_ns_path.to_path_buf(),
                spec,
                network,
                user_data,
                proxy,
                instance_name,
            );
            self.insert_sandbox(sandbox).await?;

            info!(
                pod = %pod_name,
                namespace = %pod_namespace,
                netns = %net_ns_path.display(),
                "created sandbox"
            );
            Ok(socket_path)
        }
        .instrument(tracing::info_span!(parent: &self.span, "create_vm", sandbox_id))
        .await
    }

    /// Rejects a sandbox id already in use and sandboxes beyond the per-node limit.
    async fn check_admission(&self, sandbox_id: &str) -> PeerpodResult<()> {
        let sandboxes = self.sandboxes.lock().await;
        admit(&sandboxes, sandbox_id, *self.config.get_peer_pods_limit_per_node())
    }

    async fn insert_sandbox(&self, sandbox: Sandbox) -> PeerpodResult<()> {
        let mut sandboxes = self.sandboxes.lock().await;
        admit(
            &sandboxes,
            sandbox.get_id(),
            *self.config.get_peer_pods_limit_per_node(),
        )?;
        sandboxes.insert(sandbox.get_id().clone(), sandbox);
        Ok(())
    }

    fn daemon_config(
        &self,
        proxy: &AgentProxy,
        network: NetworkConfig,
        pod_namespace: &str,
        pod_name: &str,
    ) -> PeerpodResult<DaemonConfig> {
        let (server_cert, server_key) = match proxy.ca_service() {
            Some(ca) => {
                let issued = ca.issue(proxy.server_name())?;
                (issued.cert_pem, issued.key_pem)
            }
            None => Default::default(),
        };

        if *self.config.get_enable_scratch_encryption() {
            info!("scratch encryption is enabled, enabling the scratch disk as well");
        }

        Ok(DaemonConfig::builder()
            .pod_network(network)
            .pod_namespace(pod_namespace)
            .pod_name(pod_name)
            .tls_server_cert(server_cert)
            .tls_server_key(server_key)
            .tls_client_ca(proxy.client_ca().unwrap_or_default())
            .enable_scratch_disk(self.config.scratch_disk_enabled())
            .enable_scratch_encryption(*self.config.get_enable_scratch_encryption())
            .build())
    }

    /// Assembles the files the pod VM receives at first boot.
    async fn user_data(
        &self,
        daemon_json: String,
        annotations: &HashMap<String, String>,
    ) -> PeerpodResult<CloudConfig> {
        let mut cloud_config = CloudConfig::default();
        cloud_config.add_file(DEFAULT_PODVM_CONFIG_PATH.display().to_string(), daemon_json);

        let auth_json = match self.config.get_auth_json_path() {
            Some(path) => read_auth_file(path).await,
            None => None,
        };
        cloud_config.add_file(
            AGENT_CONFIG_PATH,
            agent_config(auth_json.is_some().then_some(AUTH_FILE_PATH))?,
        );
        if let Some(auth_json) = auth_json {
            cloud_config.add_file(AUTH_FILE_PATH, auth_json);
        }

        if let Some(params) = self.config.get_aa_kbc_params() {
            cloud_config
                .add_file(AA_CONFIG_PATH, aa_config(params)?)
                .add_file(CDH_CONFIG_PATH, cdh_config(params)?);
        }

        let encoded = match annotations::initdata(annotations) {
            Some(document) => Some(initdata::encode(document)?),
            None => self.config.get_initdata().clone(),
        };
        if let Some(encoded) = encoded {
            let parsed = initdata::parse(&encoded)
                .map_err(|e| PeerpodError::InvalidInput(format!("invalid initdata: {e}")))?;
            debug!(digest = %parsed.digest, algorithm = %parsed.body.algorithm, "shipping initdata");
            cloud_config.add_file(INITDATA_PATH, encoded);
        }

        Ok(cloud_config)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn admit<V>(
    sandboxes: &BTreeMap<String, V>,
    sandbox_id: &str,
    limit: usize,
) -> PeerpodResult<()> {
    if sandboxes.contains_key(sandbox_id) {
        return Err(PeerpodError::AlreadyExists(format!(
            "sandbox {sandbox_id} already exists"
        )));
    }
    if limit > 0 && sandboxes.len() >= limit {
        return Err(PeerpodError::Unavailable(format!(
            "the limit of {limit} peer pods per node is reached"
        )));
    }
    Ok(())
}

/// Reads the registry auth file. Unreadable or oversized files are skipped, matching how a
/// missing pull secret does not fail a pod.
async fn read_auth_file(path: &Path) -> Option<String> {
    match fs::read_to_string(path).await {
        Ok(content) if content.len() > AUTH_FILE_LIMIT => {
            warn!(
                path = %path.display(),
                size = content.len(),
                "registry auth file is too large to be included in the cloud-config"
            );
            None
        }
        Ok(content) => Some(content),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read registry auth file");
            None
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::{os::unix::fs::PermissionsExt, sync::Arc, time::Duration};

    use crate::{
        cloud::{
            testing::{pod_annotations, FakeNetwork, FakeProvider},
            CloudService, INITDATA,
        },
        config::ServerConfig,
        tls::TlsConfig,
        ErrorKind,
    };

    use super::*;

    const INITDATA_DOCUMENT: &str = "algorithm = \"sha256\"\nversion = \"0.1.0\"\n";

    fn service_with(config: ServerConfig) -> anyhow::Result<CloudService> {
        Ok(CloudService::new(
            Arc::new(FakeProvider::default()),
            Arc::new(FakeNetwork::default()),
            config,
        )?)
    }

    #[tokio::test]
    async fn test_create_vm_validates_input() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let service = service_with(
            ServerConfig::builder()
                .pods_dir(dir.path())
                .peer_pods_limit_per_node(2)
                .build(),
        )?;
        let netns = Path::new("/run/netns/cni-1");

        let empty_id = service.create_vm("", &pod_annotations("nginx"), netns).await;
        assert_eq!(empty_id.err().map(|e| e.kind()), Some(ErrorKind::InvalidInput));

        let mut no_namespace = pod_annotations("nginx");
        no_namespace.remove(annotations::SANDBOX_NAMESPACE);
        let missing = service.create_vm("sandbox-1", &no_namespace, netns).await;
        assert_eq!(missing.err().map(|e| e.kind()), Some(ErrorKind::InvalidInput));
        assert_eq!(service.sandbox_count().await, 0);

        service.create_vm("sandbox-1", &pod_annotations("nginx"), netns).await?;
        let duplicate = service.create_vm("sandbox-1", &pod_annotations("nginx"), netns).await;
        assert_eq!(duplicate.err().map(|e| e.kind()), Some(ErrorKind::AlreadyExists));

        service.create_vm("sandbox-2", &pod_annotations("redis"), netns).await?;
        let over_limit = service.create_vm("sandbox-3", &pod_annotations("etcd"), netns).await;
        assert_eq!(over_limit.err().map(|e| e.kind()), Some(ErrorKind::Unavailable));
        assert_eq!(service.sandbox_count().await, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_create_vm_renders_user_data() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let auth_path = dir.path().join("auth.json");
        tokio::fs::write(&auth_path, r#"{"auths":{}}"#).await?;

        let service = service_with(
            ServerConfig::builder()
                .pods_dir(dir.path().join("pods"))
                .aa_kbc_params("cc_kbc::http://kbs:8080")
                .auth_json_path(&auth_path)
                .enable_scratch_encryption(true)
                .build(),
        )?;

        let mut annotations = pod_annotations("nginx");
        annotations.insert(INITDATA.into(), INITDATA_DOCUMENT.into());
        service
            .create_vm("sandbox-1", &annotations, Path::new("/run/netns/cni-1"))
            .await?;

        let pod_dir = dir.path().join("pods").join("sandbox-1");
        assert_eq!(std::fs::metadata(&pod_dir)?.permissions().mode() & 0o700, 0o700);

        let daemon = DaemonConfig::load(pod_dir.join("daemon.json")).await?;
        assert_eq!(daemon.get_pod_name(), "nginx");
        assert_eq!(daemon.get_pod_namespace(), "default");
        assert!(daemon.get_pod_network().is_some());
        assert!(*daemon.get_enable_scratch_disk());
        assert!(*daemon.get_enable_scratch_encryption());
        assert!(!daemon.has_tls());

        let sandboxes = service.sandboxes.lock().await;
        let sandbox = sandboxes
            .get("sandbox-1")
            .ok_or_else(|| anyhow::anyhow!("sandbox missing"))?;
        assert_eq!(sandbox.get_instance_name(), "podvm-nginx-sandbox-");
        assert!(sandbox.get_instance_id().is_empty());

        let user_data = CloudConfig::parse(sandbox.get_user_data())?;
        let shipped_daemon: DaemonConfig = serde_json::from_str(
            user_data
                .file("/run/peerpod/daemon.json")
                .ok_or_else(|| anyhow::anyhow!("daemon.json missing"))?,
        )?;
        assert_eq!(shipped_daemon, daemon);
        assert!(user_data
            .file(AGENT_CONFIG_PATH)
            .is_some_and(|agent| agent.contains("file:///run/peerpod/auth.json")));
        assert_eq!(user_data.file(AUTH_FILE_PATH), Some(r#"{"auths":{}}"#));
        assert!(user_data.file(AA_CONFIG_PATH).is_some());
        assert!(user_data.file(CDH_CONFIG_PATH).is_some());

        let shipped_initdata = user_data
            .file(INITDATA_PATH)
            .ok_or_else(|| anyhow::anyhow!("initdata missing"))?;
        assert_eq!(initdata::decode(shipped_initdata)?, INITDATA_DOCUMENT.as_bytes());
        Ok(())
    }

    #[tokio::test]
    async fn test_create_vm_global_initdata_and_tls() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let global = initdata::encode(INITDATA_DOCUMENT)?;
        let service = service_with(
            ServerConfig::builder()
                .pods_dir(dir.path())
                .initdata(global.clone())
                .tls_config(TlsConfig::default())
                .proxy_timeout(Duration::from_secs(1))
                .build(),
        )?;
        service
            .create_vm("sandbox-1", &pod_annotations("nginx"), Path::new("/run/netns/cni-1"))
            .await?;

        let sandboxes = service.sandboxes.lock().await;
        let sandbox = sandboxes
            .get("sandbox-1")
            .ok_or_else(|| anyhow::anyhow!("sandbox missing"))?;
        let user_data = CloudConfig::parse(sandbox.get_user_data())?;
        assert_eq!(user_data.file(INITDATA_PATH), Some(global.as_str()));
        assert!(user_data.file(AUTH_FILE_PATH).is_none());
        assert!(user_data.file(AA_CONFIG_PATH).is_none());

        let daemon = DaemonConfig::load(dir.path().join("sandbox-1").join("daemon.json")).await?;
        assert!(daemon.has_tls());
        assert!(!daemon.get_tls_client_ca().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_create_vm_rejects_invalid_initdata() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let service = service_with(
            ServerConfig::builder()
                .pods_dir(dir.path())
                .initdata("bm90IGd6aXA=")
                .build(),
        )?;
        let result = service
            .create_vm("sandbox-1", &pod_annotations("nginx"), Path::new("/run/netns/cni-1"))
            .await;
        assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::InvalidInput));
        assert_eq!(service.sandbox_count().await, 0);
        Ok(())
    }
}
