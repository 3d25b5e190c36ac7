use std::{
    collections::BTreeMap,
    net::Ipv4Addr,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use getset::{Getters, Setters};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::{fs, sync::Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use typed_builder::TypedBuilder;

use crate::{
    provider::{Instance, InstanceTypeSpec, Provider},
    PeerpodError, PeerpodResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The registry name of the pool provider.
pub const POOL_PROVIDER_NAME: &str = "pool";

/// The default cap on how many addresses a single range expands to.
pub const DEFAULT_MAX_RANGE_IPS: usize = 100;

/// The file a pool VM reads its cloud-config from.
const USER_DATA_FILE: &str = "user-data";

/// The file whose presence asks a pool VM to reboot into a clean state.
const REBOOT_FILE: &str = "reboot";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Settings of the [`PoolProvider`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder, Getters, Setters)]
#[getset(get = "pub with_prefix", set = "pub")]
#[serde(rename_all = "kebab-case", default)]
pub struct PoolConfig {
    /// The pre-provisioned VMs, as single addresses or `first-last` ranges.
    #[builder(default)]
    vm_pool_ips: Vec<String>,

    /// The maximum number of addresses one range expands to.
    #[builder(default = DEFAULT_MAX_RANGE_IPS)]
    max_range_ips: usize,

    /// The directory holding one `<ip>/` sub-directory per VM through which user data reaches it.
    #[builder(default, setter(strip_option, into))]
    #[serde(skip_serializing_if = "Option::is_none")]
    user_data_dir: Option<PathBuf>,

    /// Where the allocation state is persisted so it survives adaptor restarts.
    #[builder(default, setter(strip_option, into))]
    #[serde(skip_serializing_if = "Option::is_none")]
    state_path: Option<PathBuf>,
}

/// A provider handing out VMs from a fixed pool of pre-provisioned machines.
///
/// Deleting an instance returns the VM to the pool after asking it to reboot.
#[derive(Debug)]
pub struct PoolProvider {
    config: PoolConfig,
    pool: Vec<Ipv4Addr>,
    state: Mutex<PoolState>,
}

/// The allocation state of the pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PoolState {
    allocated_ips: BTreeMap<String, Allocation>,
    available_ips: Vec<Ipv4Addr>,
    version: u64,
}

/// One allocated VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Allocation {
    allocation_id: String,
    ip: Ipv4Addr,
    pod_name: String,
    allocated_at: DateTime<Utc>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl PoolProvider {
    /// Creates a pool provider, recovering persisted allocations when a state file exists.
    pub async fn new(config: PoolConfig) -> PeerpodResult<Self> {
        let pool = parse_pool_ips(&config.vm_pool_ips, config.max_range_ips)?;
        if pool.is_empty() {
            return Err(PeerpodError::InvalidInput("the VM pool is empty".into()));
        }

        let persisted = match &config.state_path {
            Some(path) if path.exists() => {
                let content = fs::read_to_string(path).await?;
                Some(serde_json::from_str::<PoolState>(&content)?)
            }
            _ => None,
        };

        let state = recover_state(&pool, persisted);
        info!(
            total = pool.len(),
            available = state.available_ips.len(),
            in_use = state.allocated_ips.len(),
            "initialized VM pool"
        );

        Ok(Self {
            config,
            pool,
            state: Mutex::new(state),
        })
    }

    /// Returns the number of VMs in total, available and in use.
    pub async fn status(&self) -> (usize, usize, usize) {
        let state = self.state.lock().await;
        (
            self.pool.len(),
            state.available_ips.len(),
            state.allocated_ips.len(),
        )
    }

    async fn allocate(&self, allocation_id: &str, pod_name: &str) -> PeerpodResult<Ipv4Addr> {
        let mut state = self.state.lock().await;
        if let Some(allocation) = state.allocated_ips.get(allocation_id) {
            debug!(ip = %allocation.ip, allocation_id, "VM already allocated");
            return Ok(allocation.ip);
        }

        if state.available_ips.is_empty() {
            return Err(PeerpodError::Unavailable(
                "no VM available in the pool".into(),
            ));
        }

        let index = select_index(state.available_ips.len(), allocation_id);
        let ip = state.available_ips.remove(index);
        state.allocated_ips.insert(
            allocation_id.to_string(),
            Allocation {
                allocation_id: allocation_id.to_string(),
                ip,
                pod_name: pod_name.to_string(),
                allocated_at: Utc::now(),
            },
        );
        state.version += 1;
        self.persist(&state).await?;

        info!(%ip, allocation_id, "allocated VM from the pool");
        Ok(ip)
    }

    async fn deallocate(&self, ip: Ipv4Addr) -> PeerpodResult<()> {
        let mut state = self.state.lock().await;
        let Some(allocation_id) = state
            .allocated_ips
            .values()
            .find(|allocation| allocation.ip == ip)
            .map(|allocation| allocation.allocation_id.clone())
        else {
            info!(%ip, "VM is not allocated, nothing to return to the pool");
            return Ok(());
        };

        state.allocated_ips.remove(&allocation_id);
        state.available_ips.push(ip);
        state.version += 1;
        self.persist(&state).await?;

        info!(%ip, allocation_id, "returned VM to the pool");
        Ok(())
    }

    async fn persist(&self, state: &PoolState) -> PeerpodResult<()> {
        let Some(path) = &self.config.state_path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(state)?).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn send_file(&self, ip: Ipv4Addr, name: &str, content: &[u8]) -> PeerpodResult<()> {
        let Some(dir) = &self.config.user_data_dir else {
            return Err(PeerpodError::InvalidInput(
                "no user data directory is configured for the VM pool".into(),
            ));
        };

        let vm_dir = vm_dir(dir, ip);
        fs::create_dir_all(&vm_dir).await?;
        fs::write(vm_dir.join(name), content).await?;
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Expands pool entries into unique addresses, keeping their first-seen order.
///
/// Entries may themselves be comma-separated. A `first-last` range expands to at most
/// `max_range_ips` addresses.
pub fn parse_pool_ips(entries: &[String], max_range_ips: usize) -> PeerpodResult<Vec<Ipv4Addr>> {
    let mut ips = Vec::new();
    for entry in entries.iter().flat_map(|e| e.split(',')) {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }

        match entry.split_once('-') {
            Some((first, last)) => {
                let first: Ipv4Addr = first.trim().parse()?;
                let last: Ipv4Addr = last.trim().parse()?;
                if first >= last {
                    return Err(PeerpodError::InvalidInput(format!(
                        "invalid IP range {entry}: the first address must be lower than the last"
                    )));
                }

                let size = u64::from(u32::from(last) - u32::from(first)) + 1;
                if size > max_range_ips as u64 {
                    warn!(range = entry, max_range_ips, "IP range too large, truncating");
                }
                ips.extend(
                    (u32::from(first)..=u32::from(last))
                        .take(max_range_ips)
                        .map(Ipv4Addr::from),
                );
            }
            None => ips.push(entry.parse()?),
        }
    }

    let mut seen = std::collections::HashSet::new();
    ips.retain(|ip| seen.insert(*ip));
    Ok(ips)
}

/// Spreads allocations over the available VMs by hashing the allocation id.
fn select_index(available: usize, allocation_id: &str) -> usize {
    if available <= 1 {
        return 0;
    }
    let hash = Sha256::digest(allocation_id.as_bytes());
    let seed = u32::from_be_bytes([hash[0], hash[1], hash[2], hash[3]]);
    seed as usize % available
}

/// Merges persisted allocations with the configured pool; allocations of VMs no longer in the
/// pool are dropped.
fn recover_state(pool: &[Ipv4Addr], persisted: Option<PoolState>) -> PoolState {
    let mut state = persisted.unwrap_or_default();
    state.allocated_ips.retain(|_, allocation| {
        let known = pool.contains(&allocation.ip);
        if !known {
            warn!(ip = %allocation.ip, "dropping allocation of a VM outside the pool");
        }
        known
    });
    state.available_ips = pool
        .iter()
        .copied()
        .filter(|ip| !state.allocated_ips.values().any(|a| a.ip == *ip))
        .collect();
    state
}

fn vm_dir(dir: &Path, ip: Ipv4Addr) -> PathBuf {
    dir.join(ip.to_string())
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for PoolConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[async_trait]
impl Provider for PoolProvider {
    async fn create_instance(
        &self,
        _ctx: &CancellationToken,
        pod_name: &str,
        sandbox_id: &str,
        user_data: &str,
        _spec: &InstanceTypeSpec,
    ) -> PeerpodResult<Instance> {
        let allocation_id = format!("{pod_name}-{sandbox_id}");
        let ip = self.allocate(&allocation_id, pod_name).await?;

        if let Err(e) = self.send_file(ip, USER_DATA_FILE, user_data.as_bytes()).await {
            if let Err(rollback) = self.deallocate(ip).await {
                warn!(%ip, error = %rollback, "failed to roll back VM allocation");
            }
            return Err(PeerpodError::Unavailable(format!(
                "failed to send user data to VM {ip}: {e}"
            )));
        }

        Ok(Instance::builder()
            .id(ip.to_string())
            .name(format!("pool-{ip}"))
            .ips(vec![ip])
            .build())
    }

    async fn delete_instance(
        &self,
        _ctx: &CancellationToken,
        instance_id: &str,
    ) -> PeerpodResult<()> {
        if instance_id.is_empty() {
            return Ok(());
        }

        let ip: Ipv4Addr = instance_id.parse().map_err(|_| {
            PeerpodError::InvalidInput(format!("invalid pool instance id {instance_id}"))
        })?;

        if let Err(e) = self.send_file(ip, REBOOT_FILE, b"reboot").await {
            warn!(%ip, error = %e, "failed to ask VM to reboot");
        }

        self.deallocate(ip).await
    }

    async fn teardown(&self) -> PeerpodResult<()> {
        let (total, available, in_use) = self.status().await;
        info!(total, available, in_use, "VM pool torn down");
        Ok(())
    }

    async fn config_verifier(&self) -> PeerpodResult<()> {
        if self.config.user_data_dir.is_none() {
            return Err(PeerpodError::InvalidInput(
                "user-data-dir is required by the pool provider".into(),
            ));
        }
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
