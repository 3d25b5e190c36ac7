//! The routing tunnel.
//!
//! Instead of encapsulating, the worker routes pod traffic to the pod VM's secondary address
//! through two VRFs: `ppvrf1` owns the host interface that faces the pod VMs and `ppvrf2` owns one
//! veth per pod, whose peer sits next to the pod interface in the pod namespace. A source rule per
//! pod steers replies from the pod VM back into that veth. Both ends need a dedicated interface.

use std::{net::Ipv4Addr, path::Path, time::Duration};

use ipnetwork::Ipv4Network;
use tracing::{debug, info};

use crate::{
    config::RoutingPriorities,
    netops::{Iptables, Link, LinkKind, Namespace, Route, Rule, RuleFilter, RT_TABLE_LOCAL},
    PeerpodError, PeerpodResult,
};

use super::NetworkConfig;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const VRF1_NAME: &str = "ppvrf1";

const VRF2_NAME: &str = "ppvrf2";

const VRF1_TABLE_ID: u32 = 49001;

const VRF2_TABLE_ID: u32 = 49002;

const VETH_PREFIX: &str = "ppveth";

const SECOND_POD_INTERFACE: &str = "eth1";

const PODVM_HOST_VETH: &str = "veth0";

const PODVM_POD_TABLE_ID: u32 = 45001;

const PODVM_SOURCE_TABLE_ID: u32 = 45002;

const LOCAL_TABLE_ORIGINAL_PRIORITY: u32 = 0;

const CHAIN_NAME: &str = "PEERPOD";

const RULE_COMMENT: &str = "peerpod";

// The first route into a freshly created VRF is rejected as unreachable for a short while.
const VRF_SETTLE_DELAY: Duration = Duration::from_secs(1);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

#[derive(Debug)]
struct IptablesRule {
    table: &'static str,
    chain: &'static str,
    spec: Vec<String>,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

pub(super) async fn worker_setup(
    ns_path: &Path,
    pod_node_ips: &[Ipv4Addr],
    config: &NetworkConfig,
    priorities: &RoutingPriorities,
) -> PeerpodResult<()> {
    let pod_node_ip = dedicated_address(pod_node_ips, config.dedicated)?;
    let pod_ip = mask32(config.pod_ip.ip())?;

    let host_ns = Namespace::open_current().await?;
    let pod_ns = Namespace::open(ns_path).await?;

    let mut host_link = host_ns
        .link_find_by_addr(config.worker_node_ip.ip())
        .await?;

    info!("ensuring routing tables and vrf devices on the host");
    move_local_table(&host_ns, priorities).await?;

    let vrf1 = ensure_vrf(&host_ns, VRF1_NAME, VRF1_TABLE_ID).await?;
    host_link.set_master(&vrf1).await?;
    let vrf2 = ensure_vrf(&host_ns, VRF2_NAME, VRF2_TABLE_ID).await?;

    let mut veth = create_veth_with_prefix(&host_ns, &pod_ns, SECOND_POD_INTERFACE).await?;
    pod_ns.link_find(SECOND_POD_INTERFACE).await?.set_up().await?;
    info!(
        host = %veth.get_name(),
        pod = SECOND_POD_INTERFACE,
        ns = %ns_path.display(),
        "created veth pair between host and pod namespace"
    );

    let pod_interface = &config.interface_name;
    info!(%pod_interface, "adding tc redirects between {pod_interface} and {SECOND_POD_INTERFACE}");
    pod_ns.redirect_add(pod_interface, SECOND_POD_INTERFACE).await?;
    pod_ns.redirect_add(SECOND_POD_INTERFACE, pod_interface).await?;

    veth.set_master(&vrf2).await?;
    let hw_addr = pod_ns.link_find(pod_interface).await?.get_hw_addr().clone();
    veth.set_hardware_addr(&hw_addr).await?;
    veth.set_up().await?;

    tokio::time::sleep(VRF_SETTLE_DELAY).await;

    info!(%pod_ip, %pod_node_ip, "routing pod traffic to the pod VM");
    host_ns
        .route_add(
            &Route::builder()
                .dst(pod_ip)
                .gw(pod_node_ip)
                .dev(host_link.get_name().clone())
                .table(VRF2_TABLE_ID)
                .build(),
        )
        .await?;

    // Proxy ARP only answers on an interface with an address, so the pod IP is added to the veth
    // and the local route the kernel derives from it is removed again.
    veth.add_addr(pod_ip).await?;
    host_ns
        .route_del(
            &Route::builder()
                .dst(pod_ip)
                .dev(veth.get_name().clone())
                .table(VRF2_TABLE_ID)
                .build(),
        )
        .await?;

    let gateway = default_gateway(config)?;
    let mut table_id = *priorities.get_table_id_min();
    loop {
        table_id = available_table_id(&host_ns, priorities, table_id).await?;
        let route = Route::builder()
            .gw(gateway)
            .dev(veth.get_name().clone())
            .table(table_id)
            .onlink(true)
            .build();
        match host_ns.route_add(&route).await {
            Ok(()) => break,
            Err(e) if e.is_already_exists() => table_id += 1,
            Err(e) => return Err(e),
        }
    }

    info!(%pod_ip, table_id, "routing traffic from the pod VM back to the pod namespace");
    host_ns
        .rule_add(
            &Rule::builder()
                .src(pod_ip)
                .iif(VRF1_NAME)
                .priority(*priorities.get_source_rule_priority())
                .table(table_id)
                .build(),
        )
        .await?;

    let veth_name = veth.get_name();
    for (key, value) in [
        ("net/ipv4/ip_forward".to_string(), "1"),
        (format!("net/ipv4/conf/{veth_name}/accept_local"), "1"),
        (format!("net/ipv4/conf/{veth_name}/proxy_arp"), "1"),
        (format!("net/ipv4/neigh/{veth_name}/proxy_delay"), "0"),
    ] {
        host_ns.sysctl_set(&key, value).await?;
    }

    let rules = iptables_rules(host_link.get_name());
    host_ns
        .run_blocking(move || {
            let _guard = Iptables::lock();
            for rule in rules {
                let ipt = Iptables::new(rule.table);
                if !ipt.chain_exists(rule.chain)? {
                    ipt.new_chain(rule.chain)?;
                }
                ipt.append_unique(rule.chain, &rule.spec)?;
            }
            Ok(())
        })
        .await
}

pub(super) async fn worker_teardown(
    ns_path: &Path,
    host_interface: &str,
    config: &NetworkConfig,
    priorities: &RoutingPriorities,
) -> PeerpodResult<()> {
    let pod_ip = mask32(config.pod_ip.ip())?;
    let host_ns = Namespace::open_current().await?;

    info!(%pod_ip, "deleting routing entries of the pod");
    let route = Route::builder()
        .dst(pod_ip)
        .dev(host_interface)
        .table(VRF2_TABLE_ID)
        .build();
    match host_ns.route_del(&route).await {
        Err(e) if e.is_not_found() => debug!(%pod_ip, "pod VM route already gone"),
        result => result?,
    }

    let filter = RuleFilter::builder()
        .src(pod_ip)
        .iif(VRF1_NAME)
        .priority(*priorities.get_source_rule_priority())
        .build();
    match host_ns.rule_del(&filter).await {
        Err(e) if e.is_not_found() => debug!(%pod_ip, "source rule already gone"),
        result => {
            result?;
        }
    }

    let pod_ns = match Namespace::open(ns_path).await {
        Ok(pod_ns) => pod_ns,
        Err(e) if e.is_not_found() => {
            debug!(ns = %ns_path.display(), "pod namespace already gone");
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    for interface in [config.interface_name.as_str(), SECOND_POD_INTERFACE] {
        match pod_ns.redirect_del(interface).await {
            Err(e) if e.is_not_found() => debug!(%interface, "no tc redirect to delete"),
            result => result?,
        }
    }

    match pod_ns.link_find(SECOND_POD_INTERFACE).await {
        Ok(link) => link.delete().await,
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

pub(super) async fn podvm_setup(
    ns_path: &Path,
    pod_node_ips: &[Ipv4Addr],
    config: &NetworkConfig,
    priorities: &RoutingPriorities,
) -> PeerpodResult<()> {
    let pod_node_ip = dedicated_address(pod_node_ips, config.dedicated)?;
    if config.interface_name.is_empty() {
        return Err(PeerpodError::InvalidInput(
            "interface name is not specified".into(),
        ));
    }

    let pod_veth_name = config.interface_name.as_str();
    let pod_ip = mask32(config.pod_ip.ip())?;

    let host_ns = Namespace::open_current().await?;
    let pod_ns = Namespace::open(ns_path).await?;
    let host_link = host_ns.link_find_by_addr(pod_node_ip).await?;

    move_local_table(&host_ns, priorities).await?;

    let host_veth = host_ns
        .link_add(
            PODVM_HOST_VETH,
            LinkKind::Veth {
                peer: pod_veth_name.to_string(),
                peer_ns: Some(pod_ns.clone()),
            },
        )
        .await?;

    let mut pod_veth = pod_ns.link_find(pod_veth_name).await?;
    pod_veth.set_mtu(config.mtu).await?;
    pod_veth.add_addr(config.pod_ip).await?;
    pod_veth.set_up().await?;
    host_veth.set_up().await?;

    for route in &config.routes {
        let mut route = route.clone();
        route.dev = pod_veth_name.to_string();
        match pod_ns.route_add(&route).await {
            Err(e) if e.is_already_exists() => debug!(dst = %route.dst, "pod route already present"),
            result => result?,
        }
    }

    let gateway = default_gateway(config)?;
    host_veth.add_addr(mask32(gateway)?).await?;

    host_ns
        .route_add(
            &Route::builder()
                .dst(pod_ip)
                .dev(PODVM_HOST_VETH)
                .table(PODVM_POD_TABLE_ID)
                .build(),
        )
        .await?;
    host_ns
        .route_add(
            &Route::builder()
                .gw(config.worker_node_ip.ip())
                .dev(host_link.get_name().clone())
                .table(PODVM_SOURCE_TABLE_ID)
                .build(),
        )
        .await?;

    add_rule_if_missing(
        &host_ns,
        Rule::builder()
            .priority(*priorities.get_pod_table_priority())
            .table(PODVM_POD_TABLE_ID)
            .build(),
    )
    .await?;
    add_rule_if_missing(
        &host_ns,
        Rule::builder()
            .src(pod_ip)
            .iif(PODVM_HOST_VETH)
            .priority(*priorities.get_source_rule_priority())
            .table(PODVM_SOURCE_TABLE_ID)
            .build(),
    )
    .await?;

    for (key, value) in [
        ("net/ipv4/ip_forward".to_string(), "1"),
        (format!("net/ipv4/conf/{PODVM_HOST_VETH}/proxy_arp"), "1"),
        (format!("net/ipv4/neigh/{PODVM_HOST_VETH}/proxy_delay"), "0"),
    ] {
        host_ns.sysctl_set(&key, value).await?;
    }

    Ok(())
}

/// The pod VM is discarded with its pod, so there is nothing to undo.
pub(super) async fn podvm_teardown(
    ns_path: &Path,
    host_interface: &str,
    _config: &NetworkConfig,
) -> PeerpodResult<()> {
    debug!(ns = %ns_path.display(), %host_interface, "nothing to tear down on the pod VM");
    Ok(())
}

fn dedicated_address(pod_node_ips: &[Ipv4Addr], dedicated: bool) -> PeerpodResult<Ipv4Addr> {
    if !dedicated {
        return Err(PeerpodError::InvalidInput(
            "the routing tunnel does not support a shared subnet".into(),
        ));
    }

    match pod_node_ips {
        [_, second] => Ok(*second),
        _ => Err(PeerpodError::InvalidInput(
            "secondary pod node IP is not available".into(),
        )),
    }
}

fn mask32(ip: Ipv4Addr) -> PeerpodResult<Ipv4Network> {
    Ok(Ipv4Network::new(ip, 32)?)
}

fn default_gateway(config: &NetworkConfig) -> PeerpodResult<Ipv4Addr> {
    config
        .routes
        .iter()
        .filter(|route| route.is_default())
        .find_map(|route| route.gw)
        .ok_or_else(|| {
            PeerpodError::InvalidInput("no default route gateway is specified".into())
        })
}

/// Returns the first table id at or above `start` that no source rule on `ppvrf1` uses.
async fn available_table_id(
    ns: &Namespace,
    priorities: &RoutingPriorities,
    start: u32,
) -> PeerpodResult<u32> {
    let used: Vec<u32> = ns
        .rule_list(
            &RuleFilter::builder()
                .iif(VRF1_NAME)
                .priority(*priorities.get_source_rule_priority())
                .build(),
        )
        .await?
        .iter()
        .map(|rule| *rule.get_table())
        .collect();

    first_free_table_id(&used, start, *priorities.get_table_id_max())
}

fn first_free_table_id(used: &[u32], start: u32, max: u32) -> PeerpodResult<u32> {
    (start..=max)
        .find(|id| !used.contains(id))
        .ok_or_else(|| PeerpodError::Unavailable("no routing table id is available".into()))
}

/// Moves the local table lookup behind the VRF rules so that VRF traffic is not claimed locally.
async fn move_local_table(ns: &Namespace, priorities: &RoutingPriorities) -> PeerpodResult<()> {
    add_rule_if_missing(
        ns,
        Rule::builder()
            .priority(*priorities.get_local_table_priority())
            .table(RT_TABLE_LOCAL)
            .build(),
    )
    .await?;

    let original = RuleFilter::builder()
        .priority(LOCAL_TABLE_ORIGINAL_PRIORITY)
        .table(RT_TABLE_LOCAL)
        .build();
    match ns.rule_del(&original).await {
        Err(e) if !e.is_not_found() => Err(e),
        _ => Ok(()),
    }
}

async fn add_rule_if_missing(ns: &Namespace, rule: Rule) -> PeerpodResult<()> {
    match ns.rule_add(&rule).await {
        Err(e) if !e.is_already_exists() => Err(e),
        _ => Ok(()),
    }
}

async fn ensure_vrf(ns: &Namespace, name: &str, table: u32) -> PeerpodResult<Link> {
    let vrf = match ns.link_add(name, LinkKind::Vrf { table }).await {
        Err(e) if e.is_already_exists() => ns.link_find(name).await?,
        result => result?,
    };
    vrf.set_up().await?;
    Ok(vrf)
}

async fn create_veth_with_prefix(
    host_ns: &Namespace,
    pod_ns: &Namespace,
    peer: &str,
) -> PeerpodResult<Link> {
    let existing: Vec<String> = host_ns
        .link_list()
        .await?
        .into_iter()
        .map(|link| link.get_name().clone())
        .collect();

    for index in 1.. {
        let name = format!("{VETH_PREFIX}{index}");
        if existing.contains(&name) {
            continue;
        }

        let kind = LinkKind::Veth {
            peer: peer.to_string(),
            peer_ns: Some(pod_ns.clone()),
        };
        match host_ns.link_add(&name, kind).await {
            Err(e) if e.is_already_exists() => debug!(%name, "veth name taken, trying the next one"),
            result => return result,
        }
    }

    Err(PeerpodError::Unavailable("no veth name is available".into()))
}

fn iptables_rules(host_interface: &str) -> Vec<IptablesRule> {
    let accept = |interface: &str, target: &str| -> Vec<String> {
        ["-i", interface, "-m", "comment", "--comment", RULE_COMMENT, "-j", target]
            .iter()
            .map(|s| s.to_string())
            .collect()
    };

    let mut rules = Vec::new();
    for (table, base, target) in [("raw", "PREROUTING", "NOTRACK"), ("filter", "FORWARD", "ACCEPT")] {
        for interface in [VRF1_NAME, VRF2_NAME, host_interface] {
            rules.push(IptablesRule {
                table,
                chain: CHAIN_NAME,
                spec: accept(interface, target),
            });
        }
        rules.push(IptablesRule {
            table,
            chain: base,
            spec: vec!["-j".to_string(), CHAIN_NAME.to_string()],
        });
    }

    rules
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::netops::RouteProtocol;

    use super::*;

    #[test]
    fn test_dedicated_address() -> anyhow::Result<()> {
        let a: Ipv4Addr = "192.168.10.5".parse()?;
        let b: Ipv4Addr = "192.168.20.5".parse()?;

        assert_eq!(dedicated_address(&[a, b], true)?, b);
        assert!(dedicated_address(&[a, b], false).is_err());
        assert!(dedicated_address(&[a], true).is_err());
        assert!(dedicated_address(&[a, b, a], true).is_err());
        Ok(())
    }

    #[test]
    fn test_first_free_table_id() -> anyhow::Result<()> {
        assert_eq!(first_free_table_id(&[], 50000, 59999)?, 50000);
        assert_eq!(first_free_table_id(&[50000, 50001, 50003], 50000, 59999)?, 50002);
        assert_eq!(first_free_table_id(&[50000], 50001, 59999)?, 50001);
        assert!(first_free_table_id(&[50000, 50001], 50000, 50001).is_err());
        Ok(())
    }

    #[test]
    fn test_default_gateway() -> anyhow::Result<()> {
        let config = NetworkConfig::builder()
            .pod_ip("172.16.0.2/24".parse()?)
            .interface_name("eth0")
            .worker_node_ip("10.224.0.4/16".parse()?)
            .routes(vec![
                Route::builder()
                    .dst("172.16.0.0/24".parse()?)
                    .dev("eth0")
                    .protocol(RouteProtocol::Kernel)
                    .build(),
                Route::builder().gw("172.16.0.1".parse()?).dev("eth0").build(),
            ])
            .build();
        assert_eq!(default_gateway(&config)?, "172.16.0.1".parse::<Ipv4Addr>()?);

        let mut no_default = config.clone();
        no_default.routes.truncate(1);
        assert!(default_gateway(&no_default).is_err());
        Ok(())
    }

    #[test]
    fn test_iptables_rules() {
        let rules = iptables_rules("ens4");
        assert_eq!(rules.len(), 8);

        let raw: Vec<&IptablesRule> = rules.iter().filter(|r| r.table == "raw").collect();
        assert_eq!(raw.len(), 4);
        assert_eq!(
            raw[2].spec.join(" "),
            "-i ens4 -m comment --comment peerpod -j NOTRACK"
        );
        assert_eq!(raw[3].chain, "PREROUTING");
        assert_eq!(raw[3].spec, vec!["-j", "PEERPOD"]);

        let filter: Vec<&IptablesRule> = rules.iter().filter(|r| r.table == "filter").collect();
        assert_eq!(filter[0].spec.join(" "), "-i ppvrf1 -m comment --comment peerpod -j ACCEPT");
        assert_eq!(filter[3].chain, "FORWARD");
    }
}
