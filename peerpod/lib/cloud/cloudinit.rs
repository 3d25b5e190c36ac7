use serde::{Deserialize, Serialize};

use crate::{PeerpodError, PeerpodResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The header every cloud-config document starts with.
pub const CLOUD_CONFIG_HEADER: &str = "#cloud-config";

/// The largest registry auth file shipped in user data.
pub const AUTH_FILE_LIMIT: usize = 12288;

/// Where the pod VM finds the agent configuration.
pub const AGENT_CONFIG_PATH: &str = "/run/peerpod/agent-config.toml";

/// Where the pod VM finds the registry auth file.
pub const AUTH_FILE_PATH: &str = "/run/peerpod/auth.json";

/// Where the pod VM finds the attestation agent configuration.
pub const AA_CONFIG_PATH: &str = "/run/peerpod/aa.toml";

/// Where the pod VM finds the confidential data hub configuration.
pub const CDH_CONFIG_PATH: &str = "/run/peerpod/cdh.toml";

/// Where the pod VM finds its initdata.
pub const INITDATA_PATH: &str = "/run/peerpod/initdata";

/// The address the in-VM agent serves on.
pub const AGENT_SERVER_ADDR: &str = "unix:///run/kata-containers/agent.sock";

/// The socket of the confidential data hub.
pub const CDH_SOCKET: &str = "unix:///run/confidential-containers/cdh.sock";

/// Guest components are started by the pod VM image, not by the agent.
const GUEST_COMPONENTS_PROCS: &str = "none";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A cloud-config user data document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudConfig {
    /// The files cloud-init writes at first boot.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub write_files: Vec<WriteFile>,
}

/// A file written by cloud-init.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteFile {
    /// The absolute path of the file.
    pub path: String,

    /// The file content.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,

    /// The `user:group` owning the file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,

    /// The octal file mode, e.g. `0600`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<String>,
}

#[derive(Serialize)]
struct AgentConfig<'a> {
    server_addr: &'a str,
    guest_components_procs: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_registry_auth: Option<String>,
}

#[derive(Serialize)]
struct AaConfig<'a> {
    token_configs: AaTokenConfigs<'a>,
}

#[derive(Serialize)]
struct AaTokenConfigs<'a> {
    coco_as: AaEndpoint<'a>,
    kbs: AaEndpoint<'a>,
}

#[derive(Serialize)]
struct AaEndpoint<'a> {
    url: &'a str,
}

#[derive(Serialize)]
struct CdhConfig<'a> {
    socket: &'a str,
    kbc: CdhKbc<'a>,
    credentials: Vec<CdhCredential>,
}

#[derive(Serialize)]
struct CdhKbc<'a> {
    name: &'a str,
    url: &'a str,
}

#[derive(Serialize)]
struct CdhCredential {}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl CloudConfig {
    /// Adds a file.
    pub fn add_file(&mut self, path: impl Into<String>, content: impl Into<String>) -> &mut Self {
        self.write_files.push(WriteFile {
            path: path.into(),
            content: content.into(),
            ..Default::default()
        });
        self
    }

    /// The content of the file at `path`, if the document writes one.
    pub fn file(&self, path: &str) -> Option<&str> {
        self.write_files
            .iter()
            .find(|file| file.path == path)
            .map(|file| file.content.as_str())
    }

    /// Renders the document as cloud-init user data.
    pub fn render(&self) -> PeerpodResult<String> {
        let body = serde_yaml::to_string(self)
            .map_err(|e| PeerpodError::Internal(format!("rendering cloud-config: {e}")))?;
        Ok(format!("{CLOUD_CONFIG_HEADER}\n{body}"))
    }

    /// Parses rendered user data.
    pub fn parse(user_data: &str) -> PeerpodResult<Self> {
        let body = user_data
            .strip_prefix(CLOUD_CONFIG_HEADER)
            .ok_or_else(|| PeerpodError::InvalidInput("user data is not a cloud-config".into()))?;
        serde_yaml::from_str(body)
            .map_err(|e| PeerpodError::InvalidInput(format!("parsing cloud-config: {e}")))
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// The in-VM agent configuration. `auth_file` points the agent at registry credentials.
pub fn agent_config(auth_file: Option<&str>) -> PeerpodResult<String> {
    Ok(toml::to_string(&AgentConfig {
        server_addr: AGENT_SERVER_ADDR,
        guest_components_procs: GUEST_COMPONENTS_PROCS,
        image_registry_auth: auth_file.map(|path| format!("file://{path}")),
    })?)
}

/// The attestation agent configuration for `<kbc>::<url>` broker parameters.
///
/// The attestation service and the key broker are assumed to share the URL.
pub fn aa_config(aa_kbc_params: &str) -> PeerpodResult<String> {
    let (_, url) = split_kbc_params(aa_kbc_params)?;
    Ok(toml::to_string(&AaConfig {
        token_configs: AaTokenConfigs {
            coco_as: AaEndpoint { url },
            kbs: AaEndpoint { url },
        },
    })?)
}

/// The confidential data hub configuration for `<kbc>::<url>` broker parameters.
pub fn cdh_config(aa_kbc_params: &str) -> PeerpodResult<String> {
    let (name, url) = split_kbc_params(aa_kbc_params)?;
    Ok(toml::to_string(&CdhConfig {
        socket: CDH_SOCKET,
        kbc: CdhKbc { name, url },
        credentials: Vec::new(),
    })?)
}

fn split_kbc_params(aa_kbc_params: &str) -> PeerpodResult<(&str, &str)> {
    aa_kbc_params.split_once("::").ok_or_else(|| {
        PeerpodError::InvalidInput(format!("invalid aa-kbc-params: {aa_kbc_params}"))
    })
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cloud_config_render_and_parse() -> anyhow::Result<()> {
        let mut config = CloudConfig::default();
        config
            .add_file("/run/peerpod/daemon.json", "{\n  \"pod-name\": \"nginx\"\n}\n")
            .add_file(INITDATA_PATH, "H4sIAAAAAAAA");

        let user_data = config.render()?;
        assert!(user_data.starts_with("#cloud-config\n"));
        assert!(user_data.contains("write_files:"));
        assert!(user_data.contains("path: /run/peerpod/daemon.json"));

        let parsed = CloudConfig::parse(&user_data)?;
        assert_eq!(parsed, config);
        assert_eq!(parsed.file(INITDATA_PATH), Some("H4sIAAAAAAAA"));
        assert!(CloudConfig::parse("write_files: []").is_err());
        Ok(())
    }

    #[test]
    fn test_agent_config() -> anyhow::Result<()> {
        let plain: toml::Table = toml::from_str(&agent_config(None)?)?;
        assert_eq!(plain["server_addr"].as_str(), Some(AGENT_SERVER_ADDR));
        assert_eq!(plain["guest_components_procs"].as_str(), Some("none"));
        assert!(plain.get("image_registry_auth").is_none());

        let with_auth: toml::Table = toml::from_str(&agent_config(Some(AUTH_FILE_PATH))?)?;
        assert_eq!(
            with_auth["image_registry_auth"].as_str(),
            Some("file:///run/peerpod/auth.json")
        );
        Ok(())
    }

    #[test]
    fn test_attestation_configs() -> anyhow::Result<()> {
        let aa: toml::Table = toml::from_str(&aa_config("cc_kbc::http://kbs:8080")?)?;
        assert_eq!(aa["token_configs"]["kbs"]["url"].as_str(), Some("http://kbs:8080"));
        assert_eq!(aa["token_configs"]["coco_as"]["url"].as_str(), Some("http://kbs:8080"));

        let cdh: toml::Table = toml::from_str(&cdh_config("cc_kbc::http://kbs:8080")?)?;
        assert_eq!(cdh["socket"].as_str(), Some(CDH_SOCKET));
        assert_eq!(cdh["kbc"]["name"].as_str(), Some("cc_kbc"));
        assert_eq!(cdh["kbc"]["url"].as_str(), Some("http://kbs:8080"));

        assert!(aa_config("http://kbs:8080").is_err());
        assert!(cdh_config("").is_err());
        Ok(())
    }
}
