use std::{fs, path::PathBuf};

use tracing::debug;

use crate::PeerpodResult;

use super::Namespace;

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Namespace {
    /// Writes a kernel parameter inside this namespace, for example `net/ipv4/ip_forward`.
    pub async fn sysctl_set(&self, key: &str, value: &str) -> PeerpodResult<()> {
        let path = sysctl_path(key);
        let value = value.to_string();
        let written = value.clone();

        self.run_blocking(move || {
            fs::write(&path, written)?;
            Ok(())
        })
        .await?;

        debug!(key, value, ns = %self.path().display(), "set sysctl");
        Ok(())
    }

    /// Reads a kernel parameter inside this namespace.
    pub async fn sysctl_get(&self, key: &str) -> PeerpodResult<String> {
        let path = sysctl_path(key);
        self.run_blocking(move || Ok(fs::read_to_string(&path)?.trim().to_string()))
            .await
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn sysctl_path(key: &str) -> PathBuf {
    let key = key.trim_start_matches('/');
    if key.contains('/') {
        PathBuf::from("/proc/sys").join(key)
    } else {
        PathBuf::from("/proc/sys").join(key.replace('.', "/"))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
