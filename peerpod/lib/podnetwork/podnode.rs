use std::path::{Path, PathBuf};

use ipnetwork::Ipv4Network;
use tracing::{debug, info, info_span, Instrument, Span};

use crate::{
    config::RoutingPriorities,
    netops::{Namespace, Route},
    tunneler::NetworkConfig,
    PeerpodError, PeerpodResult,
};

use super::{detect_ip, detect_primary_interface, find_primary_interface, setup_external_network};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The pod VM half of pod networking: rebuilds the pod network inside the VM's pod namespace.
#[derive(Debug, Clone)]
pub struct PodNode {
    ns_path: PathBuf,
    host_interface: Option<String>,
    config: NetworkConfig,
    priorities: RoutingPriorities,
    span: Span,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl PodNode {
    /// Creates a pod node for the namespace at `ns_path`.
    ///
    /// `host_interface` names the VM interface facing the worker; `None` means the primary one.
    pub fn new(
        ns_path: impl Into<PathBuf>,
        host_interface: Option<String>,
        config: NetworkConfig,
    ) -> Self {
        let span = info_span!("podnetwork", tunnel = %config.get_tunnel_type());
        Self {
            ns_path: ns_path.into(),
            host_interface: host_interface.filter(|name| !name.is_empty()),
            config,
            priorities: RoutingPriorities::default(),
            span,
        }
    }

    /// The namespace path the pod network is built in.
    pub fn ns_path(&self) -> &Path {
        &self.ns_path
    }

    /// Builds the tunnel end, replays routes and neighbors, and optionally hands a secondary
    /// interface to the pod.
    pub async fn setup(&self) -> PeerpodResult<()> {
        self.setup_inner().instrument(self.span.clone()).await
    }

    async fn setup_inner(&self) -> PeerpodResult<()> {
        let config = &self.config;
        let host_ns = Namespace::open_current().await?;

        let host_primary = detect_primary_interface(&host_ns).await?;
        let mut pod_node_ips = vec![detect_ip(&host_ns, &host_primary.name).await?];

        let host_interface = self
            .host_interface
            .clone()
            .unwrap_or_else(|| host_primary.name.clone());

        if config.dedicated {
            if host_interface == host_primary.name {
                return Err(PeerpodError::InvalidInput(format!(
                    "{host_interface} is not a dedicated interface"
                )));
            }
            pod_node_ips.push(detect_ip(&host_ns, &host_interface).await?);
        }

        let pod_ns = Namespace::open(&self.ns_path).await?;

        config
            .tunnel_type
            .podvm_setup(&self.ns_path, &pod_node_ips, config, &self.priorities)
            .await?;

        if config.pod_ip.prefix() != 32 {
            // The kernel derives a subnet route from the pod address. Some CNI plugins install
            // routes that conflict with it, so it is removed here and restored from the replayed
            // routes when the CNI had it.
            let subnet = Ipv4Network::new(config.pod_ip.network(), config.pod_ip.prefix())?;
            let route = Route::builder()
                .dst(subnet)
                .dev(config.interface_name.clone())
                .build();
            match pod_ns.route_del(&route).await {
                Err(e) if e.is_not_found() => debug!(%subnet, "no subnet route to remove"),
                result => {
                    result?;
                    info!(%subnet, dev = %config.interface_name, "removed subnet route");
                }
            }
        }

        for route in ordered_routes(&config.routes) {
            match pod_ns.route_add(route).await {
                Err(e) if e.is_already_exists() => debug!(dst = %route.dst, "route already present"),
                result => result?,
            }
        }

        for neighbor in &config.neighbors {
            match pod_ns.neighbor_add(neighbor).await {
                Err(e) if e.is_already_exists() => debug!(ip = %neighbor.get_ip(), "neighbor already present"),
                result => result?,
            }
        }

        if config.external_net_via_pod_vm {
            setup_external_network(&host_ns, &host_primary.name, &pod_ns).await?;
        }

        info!(ns = %self.ns_path.display(), pod_ip = %config.pod_ip, "pod network is set up");
        Ok(())
    }

    /// Removes the tunnel end.
    pub async fn teardown(&self) -> PeerpodResult<()> {
        async {
            let host_interface = match &self.host_interface {
                Some(name) => name.clone(),
                None => {
                    let host_ns = Namespace::open_current().await?;
                    find_primary_interface(&host_ns).await?.name
                }
            };

            self.config
                .tunnel_type
                .podvm_teardown(&self.ns_path, &host_interface, &self.config)
                .await
        }
        .instrument(self.span.clone())
        .await
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Orders routes so that gateway-less routes come first.
///
/// A route through a gateway fails while the gateway is unreachable, and some CNI plugins make the
/// gateway reachable only through a device route.
pub fn ordered_routes(routes: &[Route]) -> Vec<&Route> {
    let (direct, via_gateway): (Vec<&Route>, Vec<&Route>) =
        routes.iter().partition(|route| route.gw.is_none());
    direct.into_iter().chain(via_gateway).collect()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
