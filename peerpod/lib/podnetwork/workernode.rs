use std::{
    net::Ipv4Addr,
    path::Path,
    sync::{Mutex, OnceLock},
};

use ipnetwork::Ipv4Network;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::{
    config::WorkerNetworkConfig,
    netops::{Namespace, NeighborState, Route, RouteFilter},
    tunneler::{NetworkConfig, TunnelType},
    PeerpodError, PeerpodResult,
};

use super::{find_primary_interface, pod_ip};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A process-wide counter handing out pod indices.
///
/// Indices are never reused while the process lives; they restart from zero after a restart.
#[derive(Debug, Default)]
pub struct PodIndex {
    next: Mutex<u32>,
}

/// The worker half of pod networking: inspects a pod namespace and connects it to its pod VM.
#[derive(Debug, Clone)]
pub struct WorkerNode {
    config: WorkerNetworkConfig,
    span: Span,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl PodIndex {
    /// The counter shared by every worker node of the process.
    pub fn global() -> &'static PodIndex {
        static GLOBAL: OnceLock<PodIndex> = OnceLock::new();
        GLOBAL.get_or_init(PodIndex::default)
    }

    /// Returns the current index and advances the counter.
    pub fn next(&self) -> u32 {
        let mut next = self.next.lock().unwrap_or_else(|e| e.into_inner());
        let index = *next;
        *next += 1;
        index
    }
}

impl WorkerNode {
    /// Creates a worker node for the given network settings.
    pub fn new(config: WorkerNetworkConfig) -> Self {
        let span = info_span!("podnetwork", tunnel = %config.get_tunnel_type());
        Self { config, span }
    }

    /// The network settings of this worker.
    pub fn config(&self) -> &WorkerNetworkConfig {
        &self.config
    }

    /// Describes the pod network found in the namespace at `ns_path` without changing anything.
    pub async fn inspect(&self, ns_path: &Path) -> PeerpodResult<NetworkConfig> {
        self.inspect_with_index(ns_path, PodIndex::global().next())
            .instrument(self.span.clone())
            .await
    }

    async fn inspect_with_index(&self, ns_path: &Path, index: u32) -> PeerpodResult<NetworkConfig> {
        let host_ns = Namespace::open_current().await?;
        let host_primary = find_primary_interface(&host_ns).await?;

        let (host_interface, dedicated) = match self.config.get_host_interface() {
            Some(name) if !name.is_empty() => (name.clone(), *name != host_primary.name),
            _ => (host_primary.name.clone(), false),
        };

        let host_addrs = host_ns.link_find(&host_interface).await?.get_addr().await?;
        let worker_node_ip = *host_addrs.first().ok_or_else(|| {
            PeerpodError::NotFound(format!("no IPv4 address assigned on {host_interface}"))
        })?;
        if host_addrs.len() > 1 {
            warn!(interface = %host_interface, addrs = ?host_addrs, "more than one IP address assigned, using the first");
        }

        let pod_ns = Namespace::open(ns_path).await?;
        let routes = pod_ns.route_list(&RouteFilter::default()).await?;
        let pod_primary = find_primary_interface(&pod_ns).await?;

        debug!(ns = %ns_path.display(), "routes in pod namespace");
        for route in &routes {
            debug!(dst = %route.get_dst(), gw = ?route.get_gw(), dev = %route.get_dev());
        }

        let pod_link = pod_ns.link_find(&pod_primary.name).await?;
        let pod_ip = pod_ip(&pod_link).await?;
        let neighbors = pod_ns
            .neighbor_list(Some(&pod_primary.name), Some(NeighborState::Permanent))
            .await?;

        let mut routes = routes;
        routes.extend(subnet_routes(
            self.config.get_pod_subnet_cidrs(),
            pod_primary.gateway,
            &pod_primary.name,
        ));

        let mut config = NetworkConfig::builder()
            .pod_ip(pod_ip)
            .pod_hw_addr(pod_link.get_hw_addr().clone())
            .interface_name(pod_primary.name.clone())
            .worker_node_ip(worker_node_ip)
            .tunnel_type(*self.config.get_tunnel_type())
            .routes(routes)
            .neighbors(neighbors)
            .mtu(*pod_link.get_mtu())
            .index(index)
            .dedicated(dedicated)
            .external_net_via_pod_vm(*self.config.get_external_network_via_podvm())
            .build();
        self.configure(&mut config);

        info!(
            pod_ip = %config.pod_ip,
            interface = %config.interface_name,
            worker_node_ip = %config.worker_node_ip,
            index,
            "inspected pod network"
        );
        Ok(config)
    }

    /// Fills in the tunnel-specific parts of an inspected config.
    fn configure(&self, config: &mut NetworkConfig) {
        if config.tunnel_type == TunnelType::Vxlan {
            config.vxlan_port = *self.config.get_vxlan_port();
            config.vxlan_id = self.config.get_vxlan_min_id() + config.index;
        }
    }

    /// Installs the worker end of the tunnel for one pod.
    pub async fn setup(
        &self,
        ns_path: &Path,
        pod_node_ips: &[Ipv4Addr],
        config: &NetworkConfig,
    ) -> PeerpodResult<()> {
        config
            .tunnel_type
            .worker_setup(
                ns_path,
                pod_node_ips,
                config,
                self.config.get_routing_priorities(),
            )
            .instrument(self.span.clone())
            .await
            .inspect_err(|e| error!(tunnel = %config.tunnel_type, error = %e, "failed to set up tunnel"))
    }

    /// Removes the worker end of the tunnel. Parts that were never created are skipped.
    pub async fn teardown(&self, ns_path: &Path, config: &NetworkConfig) -> PeerpodResult<()> {
        async {
            let host_interface = match self.config.get_host_interface() {
                Some(name) if !name.is_empty() => name.clone(),
                _ => {
                    let host_ns = Namespace::open_current().await?;
                    find_primary_interface(&host_ns).await?.name
                }
            };

            config
                .tunnel_type
                .worker_teardown(
                    ns_path,
                    &host_interface,
                    config,
                    self.config.get_routing_priorities(),
                )
                .await
        }
        .instrument(self.span.clone())
        .await
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Routes for extra pod subnets through the pod gateway. Unparsable CIDRs are skipped.
fn subnet_routes(cidrs: &[String], gateway: Option<Ipv4Addr>, dev: &str) -> Vec<Route> {
    cidrs
        .iter()
        .filter_map(|cidr| match cidr.parse::<Ipv4Network>() {
            Ok(dst) => {
                let mut route = Route::builder().dst(dst).dev(dev).build();
                route.gw = gateway;
                Some(route)
            }
            Err(e) => {
                warn!(%cidr, error = %e, "skipping unparsable pod subnet");
                None
            }
        })
        .collect()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
