use std::path::{Path, PathBuf};

use crate::config::{AGENT_SOCKET_NAME, DAEMON_CONFIG_NAME};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// The directory holding a sandbox's files.
pub fn sandbox_dir(pods_dir: &Path, sandbox_id: &str) -> PathBuf {
    pods_dir.join(sandbox_id)
}

/// The agent socket the container runtime connects to for a sandbox.
pub fn agent_socket_path(pods_dir: &Path, sandbox_id: &str) -> PathBuf {
    sandbox_dir(pods_dir, sandbox_id).join(AGENT_SOCKET_NAME)
}

/// The debugging copy of a sandbox's daemon config.
pub fn daemon_config_path(pods_dir: &Path, sandbox_id: &str) -> PathBuf {
    sandbox_dir(pods_dir, sandbox_id).join(DAEMON_CONFIG_NAME)
}
