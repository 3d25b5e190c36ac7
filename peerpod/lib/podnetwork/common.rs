use std::{net::Ipv4Addr, time::Duration};

use ipnetwork::Ipv4Network;
use tracing::{debug, info, warn};

use crate::{
    config::{PRIMARY_INTERFACE_WAIT_INTERVAL, PRIMARY_INTERFACE_WAIT_TIMEOUT},
    netops::{Link, Namespace, Route, RouteFilter},
    PeerpodError, PeerpodResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Interface name prefixes that never qualify as a secondary interface.
const FILTERED_INTERFACE_PREFIXES: &[&str] = &[
    "veth", "lo", "docker", "podman", "br-", "cni", "tunl", "tun", "tap",
];

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The interface that serves the preferred default route of a namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryInterface {
    /// The interface name.
    pub name: String,

    /// The gateway of its default route.
    pub gateway: Option<Ipv4Addr>,
}

/// A host interface that can be handed to a pod for external connectivity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct SecondaryInterface {
    pub(super) name: String,
    pub(super) addr: Ipv4Network,
    pub(super) route: Route,
}

/// What the secondary interface search knows about one candidate link.
#[derive(Debug, Clone)]
pub(super) struct InterfaceDetails {
    pub(super) name: String,
    pub(super) addr: Option<Ipv4Network>,
    pub(super) default_route: Option<Route>,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Splits an interface name into its textual prefix and numeric suffix, `ens10` into `("ens", 10)`.
///
/// Names without a parsable suffix sort last.
pub fn split_interface_name(name: &str) -> (&str, u64) {
    match name.find(|c: char| c.is_ascii_digit()) {
        Some(index) => (
            &name[..index],
            name[index..].parse().unwrap_or(u64::MAX),
        ),
        None => (name, u64::MAX),
    }
}

/// Chooses the primary interface among default routes.
///
/// The lowest metric wins. Among routes sharing that metric, an interface replaces the current pick
/// only when it has the same textual prefix and a smaller numeric suffix, so `ens1` beats `ens10`.
pub fn select_primary_interface(routes: &[Route]) -> Option<PrimaryInterface> {
    let best_metric = routes
        .iter()
        .filter(|route| route.is_default() && !route.get_dev().is_empty())
        .map(|route| *route.get_priority())
        .min()?;

    let mut primary: Option<(&Route, &str, u64)> = None;
    for route in routes
        .iter()
        .filter(|route| route.is_default() && !route.get_dev().is_empty())
        .filter(|route| *route.get_priority() == best_metric)
    {
        let (prefix, number) = split_interface_name(route.get_dev());
        match primary {
            None => primary = Some((route, prefix, number)),
            Some((_, current_prefix, current_number))
                if prefix == current_prefix && number < current_number =>
            {
                primary = Some((route, prefix, number))
            }
            _ => {}
        }
    }

    primary.map(|(route, _, _)| PrimaryInterface {
        name: route.get_dev().clone(),
        gateway: *route.get_gw(),
    })
}

/// Identifies the primary interface of a namespace from its main-table default routes.
pub async fn find_primary_interface(ns: &Namespace) -> PeerpodResult<PrimaryInterface> {
    let routes = default_routes(ns).await?;
    let primary = select_primary_interface(&routes).ok_or_else(|| {
        PeerpodError::NotFound(format!(
            "failed to identify the primary interface in {}",
            ns.path().display()
        ))
    })?;

    info!(interface = %primary.name, gateway = ?primary.gateway, ns = %ns.path().display(), "found primary interface");
    Ok(primary)
}

/// Waits until the namespace has a primary interface.
pub async fn detect_primary_interface(ns: &Namespace) -> PeerpodResult<PrimaryInterface> {
    let result = tokio::time::timeout(PRIMARY_INTERFACE_WAIT_TIMEOUT, async {
        let mut ticker = tokio::time::interval(PRIMARY_INTERFACE_WAIT_INTERVAL);
        loop {
            ticker.tick().await;
            match find_primary_interface(ns).await {
                Ok(primary) => return primary,
                Err(e) => warn!(error = %e, "failed to identify the primary interface, retrying"),
            }
        }
    })
    .await;

    result.map_err(|_| {
        PeerpodError::DeadlineExceeded(format!(
            "no primary interface appeared in {} within {:?}",
            ns.path().display(),
            PRIMARY_INTERFACE_WAIT_TIMEOUT
        ))
    })
}

/// Waits until `interface` has exactly one IPv4 address and returns it.
///
/// A secondary interface may get its address from DHCP several seconds after the primary one.
pub async fn detect_ip(ns: &Namespace, interface: &str) -> PeerpodResult<Ipv4Addr> {
    wait_for_ip(ns, interface, PRIMARY_INTERFACE_WAIT_TIMEOUT, PRIMARY_INTERFACE_WAIT_INTERVAL).await
}

async fn wait_for_ip(
    ns: &Namespace,
    interface: &str,
    timeout: Duration,
    interval: Duration,
) -> PeerpodResult<Ipv4Addr> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let link = ns.link_find(interface).await?;
        let addrs = link.get_addr().await?;
        match addrs.as_slice() {
            [addr] => return Ok(addr.ip()),
            [] => {}
            _ => {
                return Err(PeerpodError::InvalidInput(format!(
                    "more than one IP address assigned on {interface} in {}",
                    ns.path().display()
                )))
            }
        }

        if tokio::time::Instant::now() + interval > deadline {
            return Err(PeerpodError::DeadlineExceeded(format!(
                "no IP address assigned to {interface} in {}",
                ns.path().display()
            )));
        }
        tokio::time::sleep(interval).await;
    }
}

/// The single IPv4 prefix of a pod interface.
pub async fn pod_ip(link: &Link) -> PeerpodResult<Ipv4Network> {
    match link.get_addr().await?.as_slice() {
        [addr] => Ok(*addr),
        [] => Err(PeerpodError::NotFound(format!(
            "no IPv4 address found on {}",
            link.get_name()
        ))),
        _ => Err(PeerpodError::InvalidInput(format!(
            "more than one IPv4 address found on {}",
            link.get_name()
        ))),
    }
}

/// Whether an interface name is virtual plumbing rather than a NIC.
pub fn is_interface_filtered_out(name: &str) -> bool {
    FILTERED_INTERFACE_PREFIXES
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

/// Picks the interface a pod can use for external traffic.
///
/// The first non-primary candidate with an IPv4 address and its own default route wins. A
/// candidate without a default route still qualifies when it sits in the primary interface's
/// subnet, in which case it inherits the primary default route's gateway.
pub(super) fn select_secondary_interface(
    primary: &InterfaceDetails,
    candidates: &[InterfaceDetails],
) -> PeerpodResult<SecondaryInterface> {
    let primary_route = primary.default_route.as_ref().ok_or_else(|| {
        PeerpodError::NotFound(format!(
            "primary interface {} has no default route",
            primary.name
        ))
    })?;

    for candidate in candidates {
        if candidate.name == primary.name || is_interface_filtered_out(&candidate.name) {
            continue;
        }

        let Some(addr) = candidate.addr else {
            debug!(interface = %candidate.name, "skipping interface without an IPv4 address");
            continue;
        };

        if let Some(route) = &candidate.default_route {
            return Ok(SecondaryInterface {
                name: candidate.name.clone(),
                addr,
                route: route.clone(),
            });
        }

        let same_subnet = primary
            .addr
            .is_some_and(|primary_addr| primary_addr.network() == addr.network()
                && primary_addr.prefix() == addr.prefix());
        if same_subnet {
            let mut route = Route::builder().dev(candidate.name.clone()).build();
            route.dst = primary_route.dst;
            route.gw = primary_route.gw;
            return Ok(SecondaryInterface {
                name: candidate.name.clone(),
                addr,
                route,
            });
        }
    }

    Err(PeerpodError::NotFound(
        "no valid secondary interface found".into(),
    ))
}

/// Moves a secondary host interface into the pod namespace with its address and default route.
pub(super) async fn setup_external_network(
    host_ns: &Namespace,
    host_primary_interface: &str,
    pod_ns: &Namespace,
) -> PeerpodResult<()> {
    let routes = default_routes(host_ns).await?;
    let mut details = Vec::new();
    for link in host_ns.link_list().await? {
        details.push(interface_details(&link, &routes).await?);
    }

    let primary = details
        .iter()
        .find(|d| d.name == host_primary_interface)
        .cloned()
        .ok_or_else(|| {
            PeerpodError::NotFound(format!("primary interface {host_primary_interface} not found"))
        })?;

    let secondary = select_secondary_interface(&primary, &details)?;
    info!(
        interface = %secondary.name,
        addr = %secondary.addr,
        gateway = ?secondary.route.gw,
        "moving secondary interface into the pod namespace"
    );

    let link = host_ns
        .link_find(&secondary.name)
        .await?
        .set_namespace(pod_ns)
        .await?;
    link.add_addr(secondary.addr).await?;
    link.set_up().await?;

    for route in default_routes(pod_ns).await? {
        pod_ns.route_del(&route).await?;
    }

    pod_ns.route_add(&secondary.route).await
}

async fn interface_details(link: &Link, default_routes: &[Route]) -> PeerpodResult<InterfaceDetails> {
    let addr = link.get_addr().await?.into_iter().next();
    let default_route = default_routes
        .iter()
        .find(|route| route.get_dev() == link.get_name())
        .cloned();

    Ok(InterfaceDetails {
        name: link.get_name().clone(),
        addr,
        default_route,
    })
}

async fn default_routes(ns: &Namespace) -> PeerpodResult<Vec<Route>> {
    let filter = RouteFilter::builder()
        .dst(Ipv4Network::new(Ipv4Addr::UNSPECIFIED, 0)?)
        .build();
    ns.route_list(&filter).await
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
