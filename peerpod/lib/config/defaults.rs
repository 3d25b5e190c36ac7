use std::{path::PathBuf, sync::LazyLock, time::Duration};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The default path of the hypervisor socket the container runtime connects to.
pub static DEFAULT_SOCKET_PATH: LazyLock<PathBuf> =
    LazyLock::new(|| PathBuf::from("/run/peerpod/hypervisor.sock"));

/// The default directory under which per-sandbox directories are created.
pub static DEFAULT_PODS_DIR: LazyLock<PathBuf> =
    LazyLock::new(|| PathBuf::from("/run/peerpod/pods"));

/// The default directory the kubelet uses for direct-assigned volumes.
pub static DEFAULT_DIRECT_VOLUMES_DIR: LazyLock<PathBuf> =
    LazyLock::new(|| PathBuf::from("/run/kata-containers/shared/direct-volumes"));

/// The default pause image used for sandbox containers.
pub const DEFAULT_PAUSE_IMAGE: &str = "registry.k8s.io/pause:3.7";

/// The TCP port the pod-VM forwarder listens on.
pub const DEFAULT_FORWARDER_PORT: u16 = 15150;

/// The default cap on how long the agent proxy keeps dialing the pod VM.
pub const DEFAULT_PROXY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// The default number of peer pods allowed per worker node.
pub const DEFAULT_PEER_PODS_LIMIT_PER_NODE: usize = 10;

/// The name of the agent socket inside a sandbox directory.
pub const AGENT_SOCKET_NAME: &str = "agent.ttrpc";

/// The name of the daemon config inside a sandbox directory.
pub const DAEMON_CONFIG_NAME: &str = "daemon.json";

/// The default tunnel type.
pub const DEFAULT_TUNNEL_TYPE: &str = "vxlan";

/// The default UDP port of VXLAN tunnels.
pub const DEFAULT_VXLAN_PORT: u16 = 4789;

/// The default first VXLAN network identifier handed out to pods.
pub const DEFAULT_VXLAN_MIN_ID: u32 = 555000;

/// The routing rule priority of the local table after it is moved out of the way.
pub const DEFAULT_LOCAL_TABLE_PRIORITY: u32 = 32765;

/// The routing rule priority of the per-pod source rule.
pub const DEFAULT_SOURCE_RULE_PRIORITY: u32 = 505;

/// The routing rule priority of the pod-VM pod table.
pub const DEFAULT_POD_TABLE_PRIORITY: u32 = 0;

/// The lowest routing table id the routing tunnel allocates.
pub const DEFAULT_TABLE_ID_MIN: u32 = 50000;

/// The highest routing table id the routing tunnel allocates.
pub const DEFAULT_TABLE_ID_MAX: u32 = 59999;

/// The path of the in-VM agent socket.
pub static DEFAULT_AGENT_SOCKET_PATH: LazyLock<PathBuf> =
    LazyLock::new(|| PathBuf::from("/run/kata-containers/agent.sock"));

/// The path of the pod network namespace inside the pod VM.
pub static DEFAULT_PODVM_NAMESPACE_PATH: LazyLock<PathBuf> =
    LazyLock::new(|| PathBuf::from("/run/netns/podns"));

/// The path at which the pod VM finds its daemon config.
pub static DEFAULT_PODVM_CONFIG_PATH: LazyLock<PathBuf> =
    LazyLock::new(|| PathBuf::from("/run/peerpod/daemon.json"));

/// The ceiling on how long the pod VM waits for a volume to get mounted.
pub const VOLUME_MOUNT_WAIT_TIMEOUT: Duration = Duration::from_secs(3 * 60);

/// The interval between volume mount checks.
pub const VOLUME_MOUNT_WAIT_INTERVAL: Duration = Duration::from_secs(5);

/// How long the pod VM waits for its primary interface to appear.
pub const PRIMARY_INTERFACE_WAIT_TIMEOUT: Duration = Duration::from_secs(3 * 60);

/// The interval between primary interface checks.
pub const PRIMARY_INTERFACE_WAIT_INTERVAL: Duration = Duration::from_secs(1);

/// How long the pod-VM interceptor keeps dialing the local agent socket.
pub const AGENT_DIAL_TIMEOUT: Duration = Duration::from_secs(150);
